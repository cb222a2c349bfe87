//! The programmable controller (ECU): electrical pin model only. Its rule
//! program runs in [`crate::logic`] and its memory lives in the simulator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{CompileContext, Device, DeviceState, Probe};
use crate::bus::BusId;
use crate::logic::rules::Condition;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pull {
    #[default]
    None,
    Up,
    Down,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPin {
    pub name: String,
    #[serde(default)]
    pub pull: Pull,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveMode {
    /// Sources current from the supply; cannot sink.
    #[default]
    HighSide,
    /// Sinks current to ground; cannot source.
    LowSide,
    /// Both directions, pulled to ground when undriven.
    PushPull,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPin {
    pub name: String,
    #[serde(default)]
    pub mode: DriveMode,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rail {
    #[default]
    Supply,
    Ground,
}

/// What an output pin is doing this tick.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Drive {
    Rail(Rail),
    /// Analog level in volts against the controller ground.
    Analog(f64),
}

/// Raw fault condition debounced by the diagnostics engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FaultMonitor {
    pub id: String,
    /// 24-bit trouble code reported over the bus.
    pub dtc: u32,
    pub condition: Condition,
    #[serde(default = "FaultMonitor::default_debounce")]
    pub debounce: u32,
    #[serde(default)]
    pub latch: bool,
}

impl FaultMonitor {
    fn default_debounce() -> u32 {
        3
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControllerParams {
    #[serde(default)]
    pub inputs: Vec<InputPin>,
    #[serde(default)]
    pub outputs: Vec<OutputPin>,
    /// Rule documents, upgraded in place by [`crate::Circuit::upgrade_rules`].
    #[serde(default)]
    pub rules: Vec<serde_json::Value>,
    #[serde(default)]
    pub faults: Vec<FaultMonitor>,
    #[serde(default)]
    pub bus: Option<BusId>,
    #[serde(default)]
    pub source_address: Option<u8>,
    /// Identifier this controller answers diagnostic requests on.
    #[serde(default)]
    pub diag_request_id: Option<u32>,
    #[serde(default = "ControllerParams::default_min_supply")]
    pub min_supply_volts: f64,
    #[serde(default = "ControllerParams::default_analog_max")]
    pub analog_max_volts: f64,
}

impl ControllerParams {
    fn default_min_supply() -> f64 {
        6.0
    }

    fn default_analog_max() -> f64 {
        5.0
    }
}

impl Default for ControllerParams {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            rules: Vec::new(),
            faults: Vec::new(),
            bus: None,
            source_address: None,
            diag_request_id: None,
            min_supply_volts: Self::default_min_supply(),
            analog_max_volts: Self::default_analog_max(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub powered: bool,
    /// Active drives by output pin name. Absent pins are undriven.
    #[serde(default)]
    pub drives: BTreeMap<String, Drive>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Controller {
    pub params: ControllerParams,
    #[serde(default)]
    pub state: ControllerState,
}

impl Controller {
    pub fn supply_volts(&self, probe: &Probe<'_>) -> f64 {
        probe.across_or_zero("vbat", "gnd")
    }

    /// Pin voltages against the controller ground, inputs and outputs
    /// alike, plus `vbat`.
    pub fn sample(&self, probe: &Probe<'_>) -> BTreeMap<String, f64> {
        let mut samples = BTreeMap::new();
        samples.insert("vbat".to_string(), self.supply_volts(probe));
        let pins = self
            .params
            .inputs
            .iter()
            .map(|p| &p.name)
            .chain(self.params.outputs.iter().map(|p| &p.name));
        for name in pins {
            samples.insert(name.clone(), probe.across_or_zero(name, "gnd"));
        }
        samples
    }

    fn compile_output(&self, ctx: &mut CompileContext<'_>, pin: &OutputPin) {
        let node = ctx.node(&pin.name);
        let (vbat, gnd) = (ctx.node("vbat"), ctx.node("gnd"));
        let ohms = ctx.config().output_ohms;
        let drive = self
            .state
            .powered
            .then(|| self.state.drives.get(&pin.name).copied())
            .flatten();

        match (drive, pin.mode) {
            (Some(Drive::Rail(Rail::Supply)), DriveMode::HighSide | DriveMode::PushPull) => {
                ctx.resistor(node, vbat, ohms)
            }
            (Some(Drive::Rail(Rail::Ground)), DriveMode::LowSide | DriveMode::PushPull) => {
                ctx.resistor(node, gnd, ohms)
            }
            (Some(Drive::Analog(volts)), _) => {
                let level = if volts.is_finite() {
                    volts.clamp(0.0, self.params.analog_max_volts.max(0.0))
                } else {
                    0.0
                };
                let dac = ctx.internal_node();
                ctx.source(dac, gnd, level);
                ctx.resistor(dac, node, ohms);
            }
            (None, DriveMode::PushPull) => ctx.resistor(node, gnd, ohms),
            // Undriven, or asked for a rail the stage cannot reach.
            _ => ctx.contact(node, gnd, false),
        }
    }
}

impl Device for Controller {
    fn terminals(&self) -> Vec<String> {
        let mut terminals = vec!["vbat".to_string(), "gnd".to_string()];
        terminals.extend(self.params.inputs.iter().map(|p| p.name.clone()));
        terminals.extend(self.params.outputs.iter().map(|p| p.name.clone()));
        terminals.extend(["can_h".to_string(), "can_l".to_string()]);
        terminals
    }

    fn compile(&self, ctx: &mut CompileContext<'_>) {
        let (vbat, gnd) = (ctx.node("vbat"), ctx.node("gnd"));
        let sense = ctx.config().sense_ohms;
        let pull = ctx.config().pull_ohms;

        // Supply sense keeps vbat in the solved set.
        ctx.resistor(vbat, gnd, sense);

        for input in &self.params.inputs {
            let node = ctx.node(&input.name);
            ctx.resistor(node, gnd, sense);
            match input.pull {
                Pull::None => {}
                Pull::Up => ctx.resistor(node, vbat, pull),
                Pull::Down => ctx.resistor(node, gnd, pull),
            }
        }

        for output in &self.params.outputs {
            self.compile_output(ctx, output);
        }
    }

    fn state(&self) -> Option<DeviceState> {
        Some(DeviceState::Controller(self.state.clone()))
    }

    fn apply_state(&mut self, state: &DeviceState) {
        if let DeviceState::Controller(s) = state {
            self.state = s.clone();
        }
    }
}
