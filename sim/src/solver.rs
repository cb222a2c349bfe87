use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use rsparse::{data::Trpl, lusol};
use serde::{Deserialize, Serialize};

use crate::error::SolveError;
use crate::netlist::Netlist;
use crate::nets::NetId;
use crate::stamp::{stamp, MnaSystem};
use crate::ComponentId;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinearSolver {
    /// LU with partial pivoting on a dense matrix.
    #[default]
    DenseLu,
    /// Sparse LU, for large harnesses.
    SparseLu,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Cap on compile/solve/evaluate rounds per settle.
    pub max_settle_iterations: usize,
    /// Closed contact or intact fuse.
    pub closed_ohms: f64,
    /// Open contact or blown fuse.
    pub open_ohms: f64,
    pub gmin: f64,
    pub linear_solver: LinearSolver,
    /// Pivot tolerance for the sparse solver.
    pub sparse_tolerance: f64,
    /// How far past its range an analog sensor may read, as a fraction.
    pub sensor_margin: f64,
    /// Controller output stage resistance.
    pub output_ohms: f64,
    /// Controller input sense resistance.
    pub sense_ohms: f64,
    /// Controller input pull-up/pull-down resistance.
    pub pull_ohms: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            max_settle_iterations: 20,
            closed_ohms: 1e-3,
            open_ohms: 1e9,
            gmin: 1e-12,
            linear_solver: LinearSolver::default(),
            sparse_tolerance: 1e-6,
            sensor_margin: 0.02,
            output_ohms: 0.1,
            sense_ohms: 1e6,
            pull_ohms: 1e4,
        }
    }
}

/// Solved net voltages. Nets no primitive touches are absent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Solution {
    pub voltages: BTreeMap<NetId, f64>,
    /// Current each component's sources deliver out of `pos`.
    pub source_currents: BTreeMap<ComponentId, f64>,
}

impl Solution {
    pub fn voltage(&self, net: NetId) -> Option<f64> {
        self.voltages.get(&net).copied()
    }
}

pub fn solve(netlist: &Netlist, cfg: &SimConfig) -> Result<Solution, SolveError> {
    let stamped = stamp(netlist, cfg);

    let x = match cfg.linear_solver {
        LinearSolver::DenseLu => solve_dense(&stamped.system)?,
        LinearSolver::SparseLu => solve_sparse(&stamped.system, cfg.sparse_tolerance)?,
    };
    if x.iter().any(|v| !v.is_finite()) {
        return Err(SolveError::Singular);
    }

    let mut solution = Solution::default();
    for &net in &stamped.ground {
        solution.voltages.insert(net, 0.0);
    }
    for (&net, &row) in &stamped.nodes {
        solution.voltages.insert(net, x[row]);
    }
    let base = stamped.system.num_nodes();
    for (k, owner) in stamped.sources.iter().enumerate() {
        // MNA branch current flows pos -> neg inside the source.
        *solution.source_currents.entry(owner.clone()).or_default() -= x[base + k];
    }

    Ok(solution)
}

fn solve_dense(system: &MnaSystem) -> Result<Vec<f64>, SolveError> {
    let n = system.size();
    if n == 0 {
        return Ok(Vec::new());
    }
    let mut a = DMatrix::<f64>::zeros(n, n);
    for (r, c, v) in system.entries() {
        a[(r, c)] += v;
    }
    let b = DVector::from_column_slice(system.rhs());
    let x = a.lu().solve(&b).ok_or(SolveError::Singular)?;
    Ok(x.iter().copied().collect())
}

fn solve_sparse(system: &MnaSystem, tolerance: f64) -> Result<Vec<f64>, SolveError> {
    if system.size() == 0 {
        return Ok(Vec::new());
    }
    let mut matrix = Trpl::new();
    for (r, c, v) in system.entries() {
        matrix.append(r, c, v);
    }
    let matrix = matrix.to_sprs();

    let mut x = system.rhs().to_vec();
    lusol(&matrix, &mut x, -1, tolerance).map_err(|e| SolveError::Sparse(e.to_string()))?;
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlist::Primitive;

    fn divider() -> Netlist {
        // 12 V across 3 Ω + 1 Ω.
        let id = ComponentId::new("x");
        let mut netlist = Netlist::new(3);
        netlist.push(&id, Primitive::GroundTie { net: NetId(0) });
        netlist.push(
            &id,
            Primitive::VoltageSource {
                pos: NetId(1),
                neg: NetId(0),
                volts: 12.0,
            },
        );
        netlist.push(
            &id,
            Primitive::Resistor {
                a: NetId(1),
                b: NetId(2),
                ohms: 3.0,
            },
        );
        netlist.push(
            &id,
            Primitive::Resistor {
                a: NetId(2),
                b: NetId(0),
                ohms: 1.0,
            },
        );
        netlist
    }

    #[test]
    fn dense_divider() {
        let soln = solve(&divider(), &SimConfig::default()).unwrap();
        assert_eq!(soln.voltage(NetId(0)), Some(0.0));
        assert!((soln.voltage(NetId(1)).unwrap() - 12.0).abs() < 1e-9);
        assert!((soln.voltage(NetId(2)).unwrap() - 3.0).abs() < 1e-9);
        assert!((soln.source_currents[&ComponentId::new("x")] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn sparse_matches_dense() {
        let cfg = SimConfig {
            linear_solver: LinearSolver::SparseLu,
            ..SimConfig::default()
        };
        let soln = solve(&divider(), &cfg).unwrap();
        assert!((soln.voltage(NetId(2)).unwrap() - 3.0).abs() < 1e-6);
    }

    #[test]
    fn parallel_sources_are_singular() {
        let id = ComponentId::new("x");
        let mut netlist = Netlist::new(2);
        netlist.push(&id, Primitive::GroundTie { net: NetId(0) });
        for volts in [12.0, 12.0] {
            netlist.push(
                &id,
                Primitive::VoltageSource {
                    pos: NetId(1),
                    neg: NetId(0),
                    volts,
                },
            );
        }
        assert_eq!(
            solve(&netlist, &SimConfig::default()),
            Err(SolveError::Singular)
        );
    }

    #[test]
    fn empty_netlist_solves_to_nothing() {
        let soln = solve(&Netlist::new(0), &SimConfig::default()).unwrap();
        assert!(soln.voltages.is_empty());
    }
}
