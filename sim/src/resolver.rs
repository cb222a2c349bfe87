//! State resolver: repeats compile, solve and evaluate until no switching
//! or protective device changes state.

use crate::device::Probe;
use crate::netlist::Netlist;
use crate::nets::NetMap;
use crate::output::EventLog;
use crate::solver::{solve, SimConfig, Solution};
use crate::Component;

/// Outcome of one settle.
#[derive(Clone, Debug, Default)]
pub struct Settled {
    /// Netlist of the final snapshot.
    pub netlist: Netlist,
    /// Voltages of the final snapshot. Empty when the solver failed.
    pub solution: Solution,
    pub iterations: usize,
    pub converged: bool,
    pub solver_failed: bool,
}

/// Runs up to `max_settle_iterations` rounds over `components`, mutating
/// their states in place. Time does not advance here.
pub fn settle(
    components: &mut [Component],
    nets: &NetMap,
    config: &SimConfig,
    log: &mut EventLog,
) -> Settled {
    let mut settled = Settled::default();

    while settled.iterations < config.max_settle_iterations.max(1) {
        settled.iterations += 1;
        let netlist = Netlist::compile(components, nets, config);
        let solution = match solve(&netlist, config) {
            Ok(solution) => solution,
            Err(e) => {
                log.error(None, format!("no voltages: {e}"));
                settled.netlist = netlist;
                settled.solution = Solution::default();
                settled.solver_failed = true;
                return settled;
            }
        };

        let mut changed = Vec::new();
        for component in components.iter_mut() {
            let probe = Probe::new(&component.id, nets, &solution, config);
            if component.kind.device_mut().settle(&probe) {
                changed.push(component.id.clone());
            }
        }

        settled.netlist = netlist;
        settled.solution = solution;

        if changed.is_empty() {
            settled.converged = true;
            break;
        }
        log::debug!(
            "settle round {}: {} changed ({})",
            settled.iterations,
            changed.len(),
            changed
                .iter()
                .map(|id| id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    if !settled.converged {
        log.warn(
            None,
            format!(
                "did not settle after {} rounds; keeping last snapshot",
                settled.iterations
            ),
        );
    }
    settled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Battery, Ground, Lamp, Protection, Relay, Resistor};
    use crate::{Circuit, Kind};

    fn run(circuit: &mut Circuit) -> (Settled, EventLog) {
        let mut log = EventLog::new();
        let nets = NetMap::build(&circuit.components, &circuit.wires, &mut log);
        let settled = settle(&mut circuit.components, &nets, &SimConfig::default(), &mut log);
        (settled, log)
    }

    fn fused_load(load: Kind) -> Circuit {
        let mut circuit = Circuit::default();
        circuit.components.push(Component::new("bat", Battery::new(12.0, 0.0)));
        circuit.components.push(Component::new("fuse", Protection::fuse(15.0)));
        circuit.components.push(Component::new("load", load));
        circuit.components.push(Component::new("gnd", Ground::default()));
        circuit.connect(("bat", "pos"), ("fuse", "a"));
        circuit.connect(("fuse", "b"), ("load", "a"));
        circuit.connect(("load", "b"), ("gnd", "gnd"));
        circuit.connect(("bat", "neg"), ("gnd", "gnd"));
        circuit
    }

    fn tripped(circuit: &Circuit) -> bool {
        match &circuit.components[1].kind {
            Kind::Protection(p) => p.state.tripped,
            _ => unreachable!(),
        }
    }

    #[test]
    fn lamp_load_leaves_fuse_intact() {
        let mut circuit = fused_load(Lamp::new(24.0).into());
        let (settled, _) = run(&mut circuit);
        assert!(settled.converged);
        assert_eq!(settled.iterations, 1);
        assert!(!tripped(&circuit));
    }

    #[test]
    fn dead_short_blows_fuse_in_one_round() {
        let mut circuit = fused_load(Resistor::new(0.1).into());
        let (settled, _) = run(&mut circuit);
        assert!(tripped(&circuit));
        assert!(settled.converged);
        assert_eq!(settled.iterations, 2);
    }

    #[test]
    fn relay_pulls_in_and_closes_load() {
        let mut circuit = Circuit::default();
        circuit.components.push(Component::new("bat", Battery::new(12.0, 0.0)));
        circuit
            .components
            .push(Component::new("k1", Relay::new(80.0, 8.0, 4.0)));
        circuit.components.push(Component::new("lamp", Lamp::new(24.0)));
        circuit.components.push(Component::new("gnd", Ground::default()));
        circuit.connect(("bat", "neg"), ("gnd", "gnd"));
        circuit.connect(("bat", "pos"), ("k1", "coil_pos"));
        circuit.connect(("k1", "coil_neg"), ("gnd", "gnd"));
        circuit.connect(("bat", "pos"), ("k1", "com"));
        circuit.connect(("k1", "no"), ("lamp", "a"));
        circuit.connect(("lamp", "b"), ("gnd", "gnd"));

        let (settled, _) = run(&mut circuit);
        assert!(settled.converged);
        let Kind::Relay(relay) = &circuit.components[1].kind else {
            unreachable!()
        };
        assert!(relay.state.energized);
    }

    #[test]
    fn singular_system_reports_no_voltages() {
        let mut circuit = Circuit::default();
        circuit.components.push(Component::new("b1", Battery::new(12.0, 0.0)));
        circuit.components.push(Component::new("b2", Battery::new(9.0, 0.0)));
        circuit.components.push(Component::new("gnd", Ground::default()));
        circuit.connect(("b1", "pos"), ("b2", "pos"));
        circuit.connect(("b1", "neg"), ("gnd", "gnd"));
        circuit.connect(("b2", "neg"), ("gnd", "gnd"));

        let (settled, log) = run(&mut circuit);
        assert!(settled.solver_failed);
        assert!(settled.solution.voltages.is_empty());
        assert_eq!(log.events().len(), 1);
    }
}
