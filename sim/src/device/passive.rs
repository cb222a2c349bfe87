use serde::{Deserialize, Serialize};

use super::{CompileContext, Device, DeviceState, Probe};

fn pair(a: &str, b: &str) -> Vec<String> {
    vec![a.to_string(), b.to_string()]
}

/// Chassis ground. Every net touching one is held at 0 V.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ground {
    #[serde(default)]
    pub label: Option<String>,
}

impl Device for Ground {
    fn terminals(&self) -> Vec<String> {
        vec!["gnd".to_string()]
    }

    fn compile(&self, ctx: &mut CompileContext<'_>) {
        let net = ctx.node("gnd");
        ctx.ground(net);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResistorParams {
    pub ohms: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resistor {
    pub params: ResistorParams,
}

impl Resistor {
    pub fn new(ohms: f64) -> Self {
        Self {
            params: ResistorParams { ohms },
        }
    }
}

impl Device for Resistor {
    fn terminals(&self) -> Vec<String> {
        pair("a", "b")
    }

    fn compile(&self, ctx: &mut CompileContext<'_>) {
        let (a, b) = (ctx.node("a"), ctx.node("b"));
        ctx.resistor(a, b, self.params.ohms);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LampParams {
    /// Hot filament resistance.
    pub ohms: f64,
    #[serde(default = "LampParams::default_rated_volts")]
    pub rated_volts: f64,
}

impl LampParams {
    fn default_rated_volts() -> f64 {
        12.0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LampState {
    pub lit: bool,
    /// Relative power, 0..=1, rounded to three decimals.
    pub brightness: f64,
}

/// Lights once the drop reaches this share of the rated voltage.
const LAMP_ON_FRACTION: f64 = 0.5;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Lamp {
    pub params: LampParams,
    #[serde(default)]
    pub state: LampState,
}

impl Lamp {
    pub fn new(ohms: f64) -> Self {
        Self {
            params: LampParams {
                ohms,
                rated_volts: LampParams::default_rated_volts(),
            },
            state: LampState::default(),
        }
    }
}

impl Device for Lamp {
    fn terminals(&self) -> Vec<String> {
        pair("a", "b")
    }

    fn compile(&self, ctx: &mut CompileContext<'_>) {
        let (a, b) = (ctx.node("a"), ctx.node("b"));
        ctx.resistor(a, b, self.params.ohms);
    }

    fn observe(&mut self, probe: &Probe<'_>) {
        let drop = probe.across_or_zero("a", "b").abs();
        let rated = self.params.rated_volts.max(f64::EPSILON);
        let ratio = (drop / rated).min(1.0);
        self.state.lit = ratio >= LAMP_ON_FRACTION;
        self.state.brightness = ((ratio * ratio) * 1000.0).round() / 1000.0;
    }

    fn state(&self) -> Option<DeviceState> {
        Some(DeviceState::Lamp(self.state))
    }

    fn apply_state(&mut self, state: &DeviceState) {
        if let DeviceState::Lamp(s) = state {
            self.state = *s;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapacitorParams {
    pub farads: f64,
}

/// Open circuit at DC.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Capacitor {
    pub params: CapacitorParams,
}

impl Device for Capacitor {
    fn terminals(&self) -> Vec<String> {
        pair("a", "b")
    }

    fn compile(&self, ctx: &mut CompileContext<'_>) {
        let (a, b) = (ctx.node("a"), ctx.node("b"));
        ctx.contact(a, b, false);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct InductorParams {
    pub henries: f64,
    /// Winding resistance; a plain short when absent.
    #[serde(default)]
    pub dc_ohms: Option<f64>,
}

/// Its winding resistance at DC.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Inductor {
    pub params: InductorParams,
}

impl Device for Inductor {
    fn terminals(&self) -> Vec<String> {
        pair("a", "b")
    }

    fn compile(&self, ctx: &mut CompileContext<'_>) {
        let (a, b) = (ctx.node("a"), ctx.node("b"));
        match self.params.dc_ohms {
            Some(ohms) if ohms > 0.0 => ctx.resistor(a, b, ohms),
            _ => ctx.contact(a, b, true),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DiodeState {
    pub conducting: bool,
}

/// Ideal diode: a closed contact when forward biased, open otherwise.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Diode {
    #[serde(default)]
    pub state: DiodeState,
}

impl Device for Diode {
    fn terminals(&self) -> Vec<String> {
        pair("anode", "cathode")
    }

    fn compile(&self, ctx: &mut CompileContext<'_>) {
        let (a, k) = (ctx.node("anode"), ctx.node("cathode"));
        ctx.contact(a, k, self.state.conducting);
    }

    fn settle(&mut self, probe: &Probe<'_>) -> bool {
        let Some(bias) = probe.across("anode", "cathode") else {
            return false;
        };
        // Exactly zero keeps the current state.
        let conducting = if bias > 0.0 {
            true
        } else if bias < 0.0 {
            false
        } else {
            self.state.conducting
        };
        let changed = conducting != self.state.conducting;
        self.state.conducting = conducting;
        changed
    }

    fn state(&self) -> Option<DeviceState> {
        Some(DeviceState::Diode(self.state))
    }

    fn apply_state(&mut self, state: &DeviceState) {
        if let DeviceState::Diode(s) = state {
            self.state = *s;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GaugeParams {
    pub ohms: f64,
    /// Voltage at which the needle reaches full scale.
    pub full_scale_volts: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GaugeState {
    /// Needle position, 0..=1, rounded to three decimals.
    pub reading: f64,
}

/// Moving-coil gauge between a signal wire and ground.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gauge {
    pub params: GaugeParams,
    #[serde(default)]
    pub state: GaugeState,
}

impl Device for Gauge {
    fn terminals(&self) -> Vec<String> {
        pair("sig", "gnd")
    }

    fn compile(&self, ctx: &mut CompileContext<'_>) {
        let (s, g) = (ctx.node("sig"), ctx.node("gnd"));
        ctx.resistor(s, g, self.params.ohms);
    }

    fn observe(&mut self, probe: &Probe<'_>) {
        let full = self.params.full_scale_volts.abs().max(f64::EPSILON);
        let reading = (probe.across_or_zero("sig", "gnd") / full).clamp(0.0, 1.0);
        self.state.reading = (reading * 1000.0).round() / 1000.0;
    }

    fn state(&self) -> Option<DeviceState> {
        Some(DeviceState::Gauge(self.state))
    }

    fn apply_state(&mut self, state: &DeviceState) {
        if let DeviceState::Gauge(s) = state {
            self.state = *s;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusTerminationParams {
    #[serde(default = "BusTerminationParams::default_ohms")]
    pub ohms: f64,
}

impl BusTerminationParams {
    fn default_ohms() -> f64 {
        120.0
    }
}

impl Default for BusTerminationParams {
    fn default() -> Self {
        Self {
            ohms: Self::default_ohms(),
        }
    }
}

/// Termination resistor across the bus pair.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BusTermination {
    #[serde(default)]
    pub params: BusTerminationParams,
}

impl Device for BusTermination {
    fn terminals(&self) -> Vec<String> {
        pair("can_h", "can_l")
    }

    fn compile(&self, ctx: &mut CompileContext<'_>) {
        let (h, l) = (ctx.node("can_h"), ctx.node("can_l"));
        ctx.resistor(h, l, self.params.ohms);
    }
}
