//! Net builder: groups terminals into electrically identical nets.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::device::LabelDirection;
use crate::output::EventLog;
use crate::{Component, ComponentId, Kind, TerminalRef, Wire};

/// Dense net index. Stable for identical input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetId(pub usize);

impl std::fmt::Display for NetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Disjoint sets with path halving.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            // Keep the lower index as root so ids follow first-seen order.
            let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[child] = root;
        }
    }
}

/// Terminal to net assignment for one circuit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetMap {
    nets: BTreeMap<ComponentId, BTreeMap<String, NetId>>,
    net_count: usize,
}

impl NetMap {
    pub fn build(components: &[Component], wires: &[Wire], log: &mut EventLog) -> Self {
        let mut index: BTreeMap<TerminalRef, usize> = BTreeMap::new();
        let mut seen = BTreeSet::new();
        for component in components {
            if !seen.insert(&component.id) {
                log.warn(Some(&component.id), "duplicate component id ignored");
                continue;
            }
            for terminal in component.terminals() {
                index.insert(
                    TerminalRef {
                        component: component.id.clone(),
                        terminal,
                    },
                    0,
                );
            }
        }
        for (i, slot) in index.values_mut().enumerate() {
            *slot = i;
        }

        let mut sets = UnionFind::new(index.len());

        for wire in wires {
            match (index.get(&wire.a), index.get(&wire.b)) {
                (Some(&a), Some(&b)) => sets.union(a, b),
                (a, _) => {
                    let missing = if a.is_none() { &wire.a } else { &wire.b };
                    log.warn(
                        None,
                        format!(
                            "wire {} to {} ignored: unknown terminal {missing}",
                            wire.a, wire.b
                        ),
                    );
                }
            }
        }

        merge_labels(components, &index, &mut sets, log);
        merge_harnesses(components, &index, &mut sets);
        merge_splices(components, &index, &mut sets);

        let mut dense: BTreeMap<usize, NetId> = BTreeMap::new();
        let mut order = Vec::with_capacity(index.len());
        for (terminal, &i) in &index {
            let root = sets.find(i);
            let next = NetId(dense.len());
            let net = *dense.entry(root).or_insert(next);
            order.push((terminal, net));
        }

        let mut nets: BTreeMap<ComponentId, BTreeMap<String, NetId>> = BTreeMap::new();
        for (terminal, net) in order {
            nets.entry(terminal.component.clone())
                .or_default()
                .insert(terminal.terminal.clone(), net);
        }

        log::debug!("{} terminals in {} nets", index.len(), dense.len());

        Self {
            nets,
            net_count: dense.len(),
        }
    }

    pub fn net(&self, component: &ComponentId, terminal: &str) -> Option<NetId> {
        self.nets.get(component)?.get(terminal).copied()
    }

    pub fn net_of(&self, terminal: &TerminalRef) -> Option<NetId> {
        self.net(&terminal.component, &terminal.terminal)
    }

    pub fn net_count(&self) -> usize {
        self.net_count
    }

    pub fn same_net(&self, a: &TerminalRef, b: &TerminalRef) -> bool {
        match (self.net_of(a), self.net_of(b)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    pub fn terminal_nets(&self) -> BTreeMap<TerminalRef, NetId> {
        self.nets
            .iter()
            .flat_map(|(component, terminals)| {
                terminals.iter().map(move |(terminal, &net)| {
                    (
                        TerminalRef {
                            component: component.clone(),
                            terminal: terminal.clone(),
                        },
                        net,
                    )
                })
            })
            .collect()
    }
}

fn terminal_index(
    index: &BTreeMap<TerminalRef, usize>,
    id: &ComponentId,
    terminal: String,
) -> Option<usize> {
    index
        .get(&TerminalRef {
            component: id.clone(),
            terminal,
        })
        .copied()
}

/// Outgoing and bidirectional labels join first, then incoming labels
/// attach to them. The result is one net per label name.
fn merge_labels(
    components: &[Component],
    index: &BTreeMap<TerminalRef, usize>,
    sets: &mut UnionFind,
    log: &mut EventLog,
) {
    let mut drivers: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    let mut listeners: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for component in components {
        let Kind::NetLabel(label) = &component.kind else {
            continue;
        };
        let Some(i) = terminal_index(index, &component.id, "net".to_string()) else {
            continue;
        };
        let name = label.params.label.as_str();
        match label.params.direction {
            LabelDirection::In => listeners.entry(name).or_default().push(i),
            LabelDirection::Out | LabelDirection::Both => drivers.entry(name).or_default().push(i),
        }
    }

    for members in drivers.values() {
        for pair in members.windows(2) {
            sets.union(pair[0], pair[1]);
        }
    }
    for (name, members) in &listeners {
        let anchor = match drivers.get(name).and_then(|d| d.first()) {
            Some(&anchor) => anchor,
            None => {
                log.info(None, format!("label {name} has no outgoing side"));
                members[0]
            }
        };
        for &i in members {
            sets.union(anchor, i);
        }
    }
}

/// Pin `i` of every entry joins pin `i` of every exit with the same
/// harness name, up to the smaller pin count of the pair.
fn merge_harnesses(
    components: &[Component],
    index: &BTreeMap<TerminalRef, usize>,
    sets: &mut UnionFind,
) {
    let mut entries: BTreeMap<&str, Vec<(&ComponentId, usize)>> = BTreeMap::new();
    let mut exits: BTreeMap<&str, Vec<(&ComponentId, usize)>> = BTreeMap::new();
    for component in components {
        match &component.kind {
            Kind::HarnessEntry(h) => entries
                .entry(h.params.harness.as_str())
                .or_default()
                .push((&component.id, h.params.pins)),
            Kind::HarnessExit(h) => exits
                .entry(h.params.harness.as_str())
                .or_default()
                .push((&component.id, h.params.pins)),
            _ => {}
        }
    }

    for (harness, entry_side) in &entries {
        let Some(exit_side) = exits.get(harness) else {
            continue;
        };
        for &(entry, entry_pins) in entry_side {
            for &(exit, exit_pins) in exit_side {
                for pin in 0..entry_pins.min(exit_pins) {
                    let a = terminal_index(index, entry, format!("pin{pin}"));
                    let b = terminal_index(index, exit, format!("pin{pin}"));
                    if let (Some(a), Some(b)) = (a, b) {
                        sets.union(a, b);
                    }
                }
            }
        }
    }
}

fn merge_splices(
    components: &[Component],
    index: &BTreeMap<TerminalRef, usize>,
    sets: &mut UnionFind,
) {
    for component in components {
        let Kind::Splice(splice) = &component.kind else {
            continue;
        };
        let pins: Vec<usize> = (0..splice.params.pins)
            .filter_map(|pin| terminal_index(index, &component.id, format!("pin{pin}")))
            .collect();
        for pair in pins.windows(2) {
            sets.union(pair[0], pair[1]);
        }
    }
}
