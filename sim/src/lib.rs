//! DC steady-state core of a vehicle wiring simulator.
//!
//! A [`Circuit`] is a bag of [`Component`]s plus the [`Wire`]s joining their
//! terminals. One call to [`engine::Simulator::tick`] turns it into nets,
//! compiles primitives, solves the nodal system, settles the switching and
//! protective devices, runs the controller rules and schedules the buses.
//! Everything the host needs comes back in a single [`output::TickOutput`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub mod bus;
pub mod device;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod logic;
pub mod netlist;
pub mod nets;
pub mod output;
pub mod resolver;
pub mod solver;
pub mod stamp;

pub use device::{DeviceState, Kind};
pub use engine::Simulator;
pub use output::{LogEvent, LogLevel, StatePatch, TickOutput, VoltageBand, WireDisplay};
pub use solver::{LinearSolver, SimConfig};

/// Stable, host-assigned identifier of a component.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(pub String);

impl ComponentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ComponentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One named terminal of one component.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TerminalRef {
    pub component: ComponentId,
    pub terminal: String,
}

impl TerminalRef {
    pub fn new(component: impl Into<String>, terminal: impl Into<String>) -> Self {
        Self {
            component: ComponentId(component.into()),
            terminal: terminal.into(),
        }
    }
}

impl std::fmt::Display for TerminalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.component, self.terminal)
    }
}

/// A wire between two terminals. Label and colour are display metadata only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Wire {
    pub a: TerminalRef,
    pub b: TerminalRef,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

impl Wire {
    pub fn new(a: TerminalRef, b: TerminalRef) -> Self {
        Self {
            a,
            b,
            label: None,
            color: None,
        }
    }
}

/// Represents a single circuit element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub id: ComponentId,
    pub kind: Kind,
}

impl Component {
    pub fn new(id: impl Into<String>, kind: impl Into<Kind>) -> Self {
        Self {
            id: ComponentId(id.into()),
            kind: kind.into(),
        }
    }

    /// Terminal names this component exposes, in declaration order.
    pub fn terminals(&self) -> Vec<String> {
        self.kind.device().terminals()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Circuit {
    pub components: Vec<Component>,
    pub wires: Vec<Wire>,
}

impl Circuit {
    pub fn component(&self, id: &ComponentId) -> Option<&Component> {
        self.components.iter().find(|c| &c.id == id)
    }

    pub fn component_mut(&mut self, id: &ComponentId) -> Option<&mut Component> {
        self.components.iter_mut().find(|c| &c.id == id)
    }

    /// Convenience for building circuits in code.
    pub fn connect(&mut self, a: (&str, &str), b: (&str, &str)) {
        self.wires.push(Wire::new(
            TerminalRef::new(a.0, a.1),
            TerminalRef::new(b.0, b.1),
        ));
    }

    pub fn has_ground(&self) -> bool {
        self.components
            .iter()
            .any(|c| matches!(c.kind, Kind::Ground(_)))
    }

    /// Terminals where more than one wire lands (drawn as splice dots).
    pub fn junctions(&self) -> Vec<TerminalRef> {
        let mut junctions = HashMap::<&TerminalRef, u32>::new();
        for wire in &self.wires {
            for end in [&wire.a, &wire.b] {
                *junctions.entry(end).or_default() += 1;
            }
        }
        let mut shared: Vec<TerminalRef> = junctions
            .into_iter()
            .filter_map(|(end, count)| (count > 1).then(|| end.clone()))
            .collect();
        shared.sort();
        shared
    }

    /// Upgrades every controller's rule documents to the current schema.
    /// Returns how many documents changed.
    pub fn upgrade_rules(&mut self) -> usize {
        let mut upgraded = 0;
        for component in &mut self.components {
            if let Kind::Controller(ctrl) = &mut component.kind {
                for doc in &mut ctrl.params.rules {
                    match logic::migrate::upgrade(doc) {
                        Ok(true) => upgraded += 1,
                        Ok(false) => {}
                        Err(e) => log::warn!("{}: rule left as-is: {e}", component.id),
                    }
                }
            }
        }
        upgraded
    }

    /// Writes state patches from a tick back into the component set.
    pub fn apply_patches(&mut self, patches: &[StatePatch]) {
        for patch in patches {
            match self.component_mut(&patch.id) {
                Some(component) => component.kind.apply_state(&patch.state),
                None => log::debug!("patch for unknown component {}", patch.id),
            }
        }
    }
}
