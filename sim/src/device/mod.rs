//! Component kinds.
//!
//! Every kind is a struct carrying its typed `params` (never touched by the
//! simulator) and, where it has any, its mutable `state`. Kinds share one
//! interface, [`Device`], used by the net builder (terminal names), the
//! netlist compiler (primitive emission) and the state resolver (state
//! transitions).

use serde::{Deserialize, Serialize};

use crate::netlist::{Netlist, Primitive};
use crate::nets::{NetId, NetMap};
use crate::solver::{SimConfig, Solution};
use crate::ComponentId;

mod controller;
mod passive;
mod sources;
mod switching;
mod wiring;

pub use controller::{
    Controller, ControllerParams, ControllerState, Drive, DriveMode, FaultMonitor, InputPin,
    OutputPin, Pull, Rail,
};
pub use passive::{
    BusTermination, BusTerminationParams, Capacitor, CapacitorParams, Diode, DiodeState, Gauge,
    GaugeParams, GaugeState, Ground, Inductor, InductorParams, Lamp, LampParams, LampState,
    Resistor, ResistorParams,
};
pub use sources::{AnalogSensor, Battery, BatteryParams, SensorParams, SensorState};
pub use switching::{
    LatchingRelay, LatchingRelayParams, LatchingRelayState, MultiSwitch, MultiSwitchParams,
    MultiSwitchState, Protection, ProtectionKind, ProtectionParams, ProtectionState, Relay,
    RelayParams, RelayState, Switch, SwitchState, WiperMotor, WiperParams, WiperState,
};
pub use wiring::{
    HarnessEntry, HarnessExit, HarnessParams, LabelDirection, NetLabel, NetLabelParams, Splice,
    SpliceParams,
};

/// Shared behaviour of every component kind.
pub trait Device {
    /// Terminal names in declaration order.
    fn terminals(&self) -> Vec<String>;

    /// Emits this component's primitives for its current state.
    fn compile(&self, ctx: &mut CompileContext<'_>);

    /// Evaluates one settle round against the latest solution.
    /// Returns `true` when the state changed.
    fn settle(&mut self, _probe: &Probe<'_>) -> bool {
        false
    }

    /// Runs once per tick on the settled snapshot. Display states and
    /// anything that advances with time live here, never in `settle`.
    fn observe(&mut self, _probe: &Probe<'_>) {}

    fn state(&self) -> Option<DeviceState> {
        None
    }

    fn apply_state(&mut self, _state: &DeviceState) {}
}

macro_rules! kinds {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        /// Closed set of component kinds.
        #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
        pub enum Kind {
            $($variant($ty),)*
        }

        impl Kind {
            pub fn device(&self) -> &dyn Device {
                match self {
                    $(Kind::$variant(d) => d,)*
                }
            }

            pub fn device_mut(&mut self) -> &mut dyn Device {
                match self {
                    $(Kind::$variant(d) => d,)*
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(Kind::$variant(_) => stringify!($variant),)*
                }
            }
        }

        $(
            impl From<$ty> for Kind {
                fn from(device: $ty) -> Self {
                    Kind::$variant(device)
                }
            }
        )*
    };
}

kinds! {
    Ground(Ground),
    Battery(Battery),
    Resistor(Resistor),
    Lamp(Lamp),
    Switch(Switch),
    MultiSwitch(MultiSwitch),
    Relay(Relay),
    LatchingRelay(LatchingRelay),
    Protection(Protection),
    Diode(Diode),
    Capacitor(Capacitor),
    Inductor(Inductor),
    AnalogSensor(AnalogSensor),
    Gauge(Gauge),
    WiperMotor(WiperMotor),
    Controller(Controller),
    BusTermination(BusTermination),
    NetLabel(NetLabel),
    HarnessEntry(HarnessEntry),
    HarnessExit(HarnessExit),
    Splice(Splice),
}

impl Kind {
    pub fn apply_state(&mut self, state: &DeviceState) {
        self.device_mut().apply_state(state);
    }
}

/// Mutable state of a stateful kind, as reported in state patches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DeviceState {
    Lamp(LampState),
    Switch(SwitchState),
    MultiSwitch(MultiSwitchState),
    Relay(RelayState),
    LatchingRelay(LatchingRelayState),
    Protection(ProtectionState),
    Diode(DiodeState),
    AnalogSensor(SensorState),
    Gauge(GaugeState),
    WiperMotor(WiperState),
    Controller(ControllerState),
}

/// Names `prefix0..prefixN`.
pub(crate) fn numbered(prefix: &str, count: usize) -> impl Iterator<Item = String> + '_ {
    (0..count).map(move |i| format!("{prefix}{i}"))
}

/// Gives a device access to its own nets while it emits primitives.
pub struct CompileContext<'a> {
    id: &'a ComponentId,
    nets: &'a NetMap,
    config: &'a SimConfig,
    netlist: &'a mut Netlist,
}

impl<'a> CompileContext<'a> {
    pub fn new(
        id: &'a ComponentId,
        nets: &'a NetMap,
        config: &'a SimConfig,
        netlist: &'a mut Netlist,
    ) -> Self {
        Self {
            id,
            nets,
            config,
            netlist,
        }
    }

    pub fn config(&self) -> &SimConfig {
        self.config
    }

    /// Net of one of this component's terminals.
    pub fn node(&mut self, terminal: &str) -> NetId {
        match self.nets.net(self.id, terminal) {
            Some(net) => net,
            // Undeclared terminal: give it a private floating net.
            None => self.netlist.internal_net(),
        }
    }

    /// A fresh net private to this component.
    pub fn internal_node(&mut self) -> NetId {
        self.netlist.internal_net()
    }

    pub fn resistor(&mut self, a: NetId, b: NetId, ohms: f64) {
        self.netlist.push(self.id, Primitive::Resistor { a, b, ohms });
    }

    /// Contact: `closed_ohms` when closed, `open_ohms` otherwise.
    pub fn contact(&mut self, a: NetId, b: NetId, closed: bool) {
        let ohms = if closed {
            self.config.closed_ohms
        } else {
            self.config.open_ohms
        };
        self.resistor(a, b, ohms);
    }

    pub fn source(&mut self, pos: NetId, neg: NetId, volts: f64) {
        self.netlist
            .push(self.id, Primitive::VoltageSource { pos, neg, volts });
    }

    pub fn ground(&mut self, net: NetId) {
        self.netlist.push(self.id, Primitive::GroundTie { net });
    }
}

/// Read access to the solved voltages around one component.
pub struct Probe<'a> {
    id: &'a ComponentId,
    nets: &'a NetMap,
    solution: &'a Solution,
    config: &'a SimConfig,
}

impl<'a> Probe<'a> {
    pub fn new(
        id: &'a ComponentId,
        nets: &'a NetMap,
        solution: &'a Solution,
        config: &'a SimConfig,
    ) -> Self {
        Self {
            id,
            nets,
            solution,
            config,
        }
    }

    pub fn config(&self) -> &SimConfig {
        self.config
    }

    /// Voltage of a terminal, `None` when its net was not solved.
    pub fn voltage(&self, terminal: &str) -> Option<f64> {
        let net = self.nets.net(self.id, terminal)?;
        self.solution.voltage(net)
    }

    /// `V(pos) - V(neg)`, only when both sides were solved.
    pub fn across(&self, pos: &str, neg: &str) -> Option<f64> {
        Some(self.voltage(pos)? - self.voltage(neg)?)
    }

    /// `V(pos) - V(neg)` with unsolved nets read as 0 V.
    pub fn across_or_zero(&self, pos: &str, neg: &str) -> f64 {
        self.voltage(pos).unwrap_or(0.0) - self.voltage(neg).unwrap_or(0.0)
    }
}
