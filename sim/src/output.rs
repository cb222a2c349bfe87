//! Everything a tick hands back to the host.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::bus::{BusId, Frame};
use crate::device::DeviceState;
use crate::nets::NetId;
use crate::{ComponentId, TerminalRef};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: LogLevel,
    #[serde(default)]
    pub component: Option<ComponentId>,
    pub message: String,
}

impl std::fmt::Display for LogEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let level = match self.level {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        match &self.component {
            Some(id) => write!(f, "[{level}] {id}: {}", self.message),
            None => write!(f, "[{level}] {}", self.message),
        }
    }
}

/// Ordered event collector for one tick. Every event also goes to the
/// `log` facade.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<LogEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, level: LogLevel, component: Option<&ComponentId>, message: String) {
        match (level, component) {
            (LogLevel::Info, Some(id)) => log::info!("{id}: {message}"),
            (LogLevel::Info, None) => log::info!("{message}"),
            (LogLevel::Warn, Some(id)) => log::warn!("{id}: {message}"),
            (LogLevel::Warn, None) => log::warn!("{message}"),
            (LogLevel::Error, Some(id)) => log::error!("{id}: {message}"),
            (LogLevel::Error, None) => log::error!("{message}"),
        }
        self.events.push(LogEvent {
            level,
            component: component.cloned(),
            message,
        });
    }

    pub fn info(&mut self, component: Option<&ComponentId>, message: impl Into<String>) {
        self.push(LogLevel::Info, component, message.into());
    }

    pub fn warn(&mut self, component: Option<&ComponentId>, message: impl Into<String>) {
        self.push(LogLevel::Warn, component, message.into());
    }

    pub fn error(&mut self, component: Option<&ComponentId>, message: impl Into<String>) {
        self.push(LogLevel::Error, component, message.into());
    }

    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<LogEvent> {
        self.events
    }
}

/// New state for one component. Only states that changed are reported.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    pub id: ComponentId,
    pub state: DeviceState,
}

/// Coarse voltage class used to colour wires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoltageBand {
    Ground,
    Floating,
    Signal,
    Switched,
    Supply,
}

/// A wire counts as live from this voltage up.
pub const LIVE_VOLTS: f64 = 0.5;

impl VoltageBand {
    pub fn classify(volts: f64) -> Self {
        let v = volts.abs();
        if v < 1e-6 {
            VoltageBand::Ground
        } else if v < LIVE_VOLTS {
            VoltageBand::Floating
        } else if v <= 5.0 {
            VoltageBand::Signal
        } else if v <= 11.0 {
            VoltageBand::Switched
        } else {
            VoltageBand::Supply
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireDisplay {
    pub voltage: f64,
    pub live: bool,
    pub band: VoltageBand,
}

impl WireDisplay {
    pub fn new(voltage: f64) -> Self {
        Self {
            voltage,
            live: voltage.abs() >= LIVE_VOLTS,
            band: VoltageBand::classify(voltage),
        }
    }
}

/// Result batch of one tick.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TickOutput {
    pub patches: Vec<StatePatch>,
    /// One entry per wire, same order as `Circuit::wires`.
    pub wires: Vec<WireDisplay>,
    pub events: Vec<LogEvent>,
    pub net_voltages: BTreeMap<NetId, f64>,
    pub terminal_nets: BTreeMap<TerminalRef, NetId>,
    /// Frames delivered this tick, per bus.
    pub bus_traffic: BTreeMap<BusId, Vec<Frame>>,
    pub iterations: usize,
    pub converged: bool,
    pub solver_failed: bool,
}

impl TickOutput {
    pub fn warnings(&self) -> impl Iterator<Item = &LogEvent> {
        self.events.iter().filter(|e| e.level >= LogLevel::Warn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_follow_thresholds() {
        assert_eq!(VoltageBand::classify(0.0), VoltageBand::Ground);
        assert_eq!(VoltageBand::classify(0.2), VoltageBand::Floating);
        assert_eq!(VoltageBand::classify(3.3), VoltageBand::Signal);
        assert_eq!(VoltageBand::classify(9.0), VoltageBand::Switched);
        assert_eq!(VoltageBand::classify(12.6), VoltageBand::Supply);
        assert_eq!(VoltageBand::classify(-12.6), VoltageBand::Supply);
    }

    #[test]
    fn live_at_half_a_volt() {
        assert!(!WireDisplay::new(0.49).live);
        assert!(WireDisplay::new(0.5).live);
    }

    #[test]
    fn event_log_keeps_order() {
        let mut log = EventLog::new();
        let id = ComponentId::new("f1");
        log.info(None, "first");
        log.warn(Some(&id), "second");
        let events = log.into_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "first");
        assert_eq!(events[1].level, LogLevel::Warn);
        assert_eq!(events[1].to_string(), "[warn] f1: second");
    }
}
