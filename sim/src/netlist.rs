//! Netlist compiler: component states to linear primitives.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::device::CompileContext;
use crate::nets::{NetId, NetMap};
use crate::solver::SimConfig;
use crate::{Component, ComponentId};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Primitive {
    Resistor { a: NetId, b: NetId, ohms: f64 },
    VoltageSource { pos: NetId, neg: NetId, volts: f64 },
    GroundTie { net: NetId },
}

/// Primitives for one snapshot, each tagged with the component that
/// emitted it. Nets past the builder's count are internal to a component.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Netlist {
    primitives: Vec<(ComponentId, Primitive)>,
    net_count: usize,
}

impl Netlist {
    pub fn new(net_count: usize) -> Self {
        Self {
            primitives: Vec::new(),
            net_count,
        }
    }

    pub fn compile(components: &[Component], nets: &NetMap, config: &SimConfig) -> Self {
        let mut netlist = Self::new(nets.net_count());
        for component in components {
            let mut ctx = CompileContext::new(&component.id, nets, config, &mut netlist);
            component.kind.device().compile(&mut ctx);
        }
        netlist
    }

    pub fn push(&mut self, owner: &ComponentId, primitive: Primitive) {
        self.primitives.push((owner.clone(), primitive));
    }

    pub fn internal_net(&mut self) -> NetId {
        let net = NetId(self.net_count);
        self.net_count += 1;
        net
    }

    pub fn net_count(&self) -> usize {
        self.net_count
    }

    pub fn primitives(&self) -> impl Iterator<Item = (&ComponentId, &Primitive)> {
        self.primitives.iter().map(|(owner, p)| (owner, p))
    }

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    pub fn ground_nets(&self) -> BTreeSet<NetId> {
        self.primitives
            .iter()
            .filter_map(|(_, p)| match p {
                Primitive::GroundTie { net } => Some(*net),
                _ => None,
            })
            .collect()
    }

    /// Nets at least one primitive touches. Only these get a voltage.
    pub fn touched_nets(&self) -> BTreeSet<NetId> {
        let mut touched = BTreeSet::new();
        for (_, primitive) in &self.primitives {
            match *primitive {
                Primitive::Resistor { a, b, .. } => {
                    touched.insert(a);
                    touched.insert(b);
                }
                Primitive::VoltageSource { pos, neg, .. } => {
                    touched.insert(pos);
                    touched.insert(neg);
                }
                Primitive::GroundTie { net } => {
                    touched.insert(net);
                }
            }
        }
        touched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Battery, Ground, Switch};
    use crate::output::EventLog;
    use crate::Circuit;

    fn compile(circuit: &Circuit) -> Netlist {
        let mut log = EventLog::new();
        let nets = NetMap::build(&circuit.components, &circuit.wires, &mut log);
        Netlist::compile(&circuit.components, &nets, &SimConfig::default())
    }

    #[test]
    fn battery_with_internal_resistance_gets_private_node() {
        let mut circuit = Circuit::default();
        circuit.components.push(Component::new("bat", Battery::new(12.0, 0.05)));
        let netlist = compile(&circuit);
        assert_eq!(netlist.net_count(), 3);
        assert_eq!(netlist.len(), 2);
        let ideal = {
            let mut circuit = Circuit::default();
            circuit.components.push(Component::new("bat", Battery::new(12.0, 0.0)));
            compile(&circuit)
        };
        assert_eq!(ideal.net_count(), 2);
        assert_eq!(ideal.len(), 1);
    }

    #[test]
    fn switch_compiles_to_contact_resistance() {
        let config = SimConfig::default();
        let mut circuit = Circuit::default();
        circuit.components.push(Component::new("sw", Switch::new(false)));
        let open = compile(&circuit);
        let ohms = |netlist: &Netlist| match netlist.primitives().next() {
            Some((_, Primitive::Resistor { ohms, .. })) => *ohms,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(ohms(&open), config.open_ohms);

        circuit.components[0] = Component::new("sw", Switch::new(true));
        assert_eq!(ohms(&compile(&circuit)), config.closed_ohms);
    }

    #[test]
    fn ground_ties_are_collected() {
        let mut circuit = Circuit::default();
        circuit.components.push(Component::new("g1", Ground::default()));
        circuit.components.push(Component::new("g2", Ground::default()));
        let netlist = compile(&circuit);
        assert_eq!(netlist.ground_nets().len(), 2);
        assert_eq!(netlist.touched_nets().len(), 2);
    }
}
