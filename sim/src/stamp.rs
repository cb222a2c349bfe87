//! Modified nodal analysis: turns a netlist into `A x = b`.
//!
//! Unknowns are one voltage per solved non-ground net followed by one
//! branch current per voltage source. Entries are accumulated by position
//! so the same system can feed either linear solver.

use std::collections::{BTreeMap, BTreeSet};

use crate::netlist::{Netlist, Primitive};
use crate::nets::NetId;
use crate::solver::SimConfig;
use crate::ComponentId;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MnaSystem {
    entries: BTreeMap<(usize, usize), f64>,
    rhs: Vec<f64>,
    num_nodes: usize,
    num_vsources: usize,
}

impl MnaSystem {
    pub fn new(num_nodes: usize, num_vsources: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            rhs: vec![0.0; num_nodes + num_vsources],
            num_nodes,
            num_vsources,
        }
    }

    pub fn size(&self) -> usize {
        self.num_nodes + self.num_vsources
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    fn add(&mut self, row: usize, col: usize, value: f64) {
        *self.entries.entry((row, col)).or_default() += value;
    }

    /// `None` is ground.
    pub fn stamp_conductance(&mut self, node_i: Option<usize>, node_j: Option<usize>, g: f64) {
        if let Some(i) = node_i {
            self.add(i, i, g);
        }
        if let Some(j) = node_j {
            self.add(j, j, g);
        }
        if let (Some(i), Some(j)) = (node_i, node_j) {
            self.add(i, j, -g);
            self.add(j, i, -g);
        }
    }

    pub fn stamp_voltage_source(
        &mut self,
        node_pos: Option<usize>,
        node_neg: Option<usize>,
        vsource_idx: usize,
        volts: f64,
    ) {
        let row = self.num_nodes + vsource_idx;
        if let Some(i) = node_pos {
            self.add(i, row, 1.0);
            self.add(row, i, 1.0);
        }
        if let Some(j) = node_neg {
            self.add(j, row, -1.0);
            self.add(row, j, -1.0);
        }
        self.rhs[row] = volts;
    }

    /// Tiny conductance to ground on every node diagonal.
    pub fn stamp_gmin(&mut self, gmin: f64) {
        for i in 0..self.num_nodes {
            self.add(i, i, gmin);
        }
    }

    /// Non-zero pattern, row-major, then explicit zeros for any empty
    /// branch diagonal so the sparse form keeps full dimension.
    pub fn entries(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        let padding: Vec<(usize, usize, f64)> = (self.num_nodes..self.size())
            .filter(|&i| !self.entries.contains_key(&(i, i)))
            .map(|i| (i, i, 0.0))
            .collect();
        self.entries
            .iter()
            .map(|(&(r, c), &v)| (r, c, v))
            .chain(padding)
    }

    pub fn rhs(&self) -> &[f64] {
        &self.rhs
    }
}

/// A stamped netlist plus the maps needed to read the answer back.
#[derive(Clone, Debug)]
pub struct Stamped {
    pub system: MnaSystem,
    /// Matrix row of every solved non-ground net.
    pub nodes: BTreeMap<NetId, usize>,
    pub ground: BTreeSet<NetId>,
    /// Owner of each voltage source, by branch index.
    pub sources: Vec<ComponentId>,
}

pub fn stamp(netlist: &Netlist, config: &SimConfig) -> Stamped {
    let ground = netlist.ground_nets();
    let nodes: BTreeMap<NetId, usize> = netlist
        .touched_nets()
        .into_iter()
        .filter(|net| !ground.contains(net))
        .enumerate()
        .map(|(row, net)| (net, row))
        .collect();
    let row = |net: NetId| nodes.get(&net).copied();
    // Both ends on one net, or both grounded: nothing to solve for.
    let shorted = |a: NetId, b: NetId| a == b || (row(a).is_none() && row(b).is_none());

    let mut sources = Vec::new();
    for (owner, primitive) in netlist.primitives() {
        if let Primitive::VoltageSource { pos, neg, .. } = *primitive {
            if shorted(pos, neg) {
                log::debug!("{owner}: shorted source skipped");
            } else {
                sources.push(owner.clone());
            }
        }
    }

    let mut system = MnaSystem::new(nodes.len(), sources.len());
    let mut k = 0;
    for (_, primitive) in netlist.primitives() {
        match *primitive {
            Primitive::Resistor { a, b, ohms } => {
                if shorted(a, b) || ohms.is_nan() || ohms <= 0.0 {
                    continue;
                }
                system.stamp_conductance(row(a), row(b), 1.0 / ohms);
            }
            Primitive::VoltageSource { pos, neg, volts } => {
                if shorted(pos, neg) {
                    continue;
                }
                system.stamp_voltage_source(row(pos), row(neg), k, volts);
                k += 1;
            }
            Primitive::GroundTie { .. } => {}
        }
    }
    system.stamp_gmin(config.gmin);

    Stamped {
        system,
        nodes,
        ground,
        sources,
    }
}
