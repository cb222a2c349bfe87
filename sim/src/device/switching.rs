//! Contacts, relays, protection devices and the wiper park switch.

use serde::{Deserialize, Serialize};

use super::{numbered, CompileContext, Device, DeviceState, Probe};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchState {
    pub closed: bool,
}

/// Single-pole single-throw switch operated by the host.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Switch {
    #[serde(default)]
    pub state: SwitchState,
}

impl Switch {
    pub fn new(closed: bool) -> Self {
        Self {
            state: SwitchState { closed },
        }
    }
}

impl Device for Switch {
    fn terminals(&self) -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    fn compile(&self, ctx: &mut CompileContext<'_>) {
        let (a, b) = (ctx.node("a"), ctx.node("b"));
        ctx.contact(a, b, self.state.closed);
    }

    fn state(&self) -> Option<DeviceState> {
        Some(DeviceState::Switch(self.state))
    }

    fn apply_state(&mut self, state: &DeviceState) {
        if let DeviceState::Switch(s) = state {
            self.state = *s;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSwitchParams {
    pub positions: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSwitchState {
    pub position: usize,
}

/// Rotary / multi-throw switch: `com` to exactly one of `p0..pN`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultiSwitch {
    pub params: MultiSwitchParams,
    #[serde(default)]
    pub state: MultiSwitchState,
}

impl Device for MultiSwitch {
    fn terminals(&self) -> Vec<String> {
        std::iter::once("com".to_string())
            .chain(numbered("p", self.params.positions))
            .collect()
    }

    fn compile(&self, ctx: &mut CompileContext<'_>) {
        let com = ctx.node("com");
        for (index, name) in numbered("p", self.params.positions).enumerate() {
            let throw = ctx.node(&name);
            ctx.contact(com, throw, index == self.state.position);
        }
    }

    fn state(&self) -> Option<DeviceState> {
        Some(DeviceState::MultiSwitch(self.state))
    }

    fn apply_state(&mut self, state: &DeviceState) {
        if let DeviceState::MultiSwitch(s) = state {
            self.state = *s;
        }
    }
}

const RELAY_TERMINALS: [&str; 5] = ["coil_pos", "coil_neg", "com", "no", "nc"];

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelayParams {
    pub coil_ohms: f64,
    pub pull_in_volts: f64,
    pub release_volts: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayState {
    pub energized: bool,
}

/// Changeover relay with pull-in / release hysteresis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relay {
    pub params: RelayParams,
    #[serde(default)]
    pub state: RelayState,
}

impl Relay {
    pub fn new(coil_ohms: f64, pull_in_volts: f64, release_volts: f64) -> Self {
        Self {
            params: RelayParams {
                coil_ohms,
                pull_in_volts,
                release_volts,
            },
            state: RelayState::default(),
        }
    }

    /// Next energized state for a coil voltage. Pulls in at `>= pull_in`,
    /// drops only when strictly below `release`.
    pub fn next_energized(&self, coil_volts: f64) -> bool {
        let v = coil_volts.abs();
        if self.state.energized {
            v >= self.params.release_volts
        } else {
            v >= self.params.pull_in_volts
        }
    }
}

impl Device for Relay {
    fn terminals(&self) -> Vec<String> {
        RELAY_TERMINALS.iter().map(|t| t.to_string()).collect()
    }

    fn compile(&self, ctx: &mut CompileContext<'_>) {
        let (cp, cn) = (ctx.node("coil_pos"), ctx.node("coil_neg"));
        ctx.resistor(cp, cn, self.params.coil_ohms);

        let (com, no, nc) = (ctx.node("com"), ctx.node("no"), ctx.node("nc"));
        ctx.contact(com, no, self.state.energized);
        ctx.contact(com, nc, !self.state.energized);
    }

    fn settle(&mut self, probe: &Probe<'_>) -> bool {
        let energized = self.next_energized(probe.across_or_zero("coil_pos", "coil_neg"));
        let changed = energized != self.state.energized;
        self.state.energized = energized;
        changed
    }

    fn state(&self) -> Option<DeviceState> {
        Some(DeviceState::Relay(self.state))
    }

    fn apply_state(&mut self, state: &DeviceState) {
        if let DeviceState::Relay(s) = state {
            self.state = *s;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatchingRelayParams {
    pub coil_ohms: f64,
    /// Operate voltage of either coil.
    pub threshold_volts: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatchingRelayState {
    pub set: bool,
}

/// Dual-coil bistable relay. Reset wins when both coils are driven.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatchingRelay {
    pub params: LatchingRelayParams,
    #[serde(default)]
    pub state: LatchingRelayState,
}

impl Device for LatchingRelay {
    fn terminals(&self) -> Vec<String> {
        ["set_pos", "set_neg", "reset_pos", "reset_neg", "com", "no", "nc"]
            .iter()
            .map(|t| t.to_string())
            .collect()
    }

    fn compile(&self, ctx: &mut CompileContext<'_>) {
        let (sp, sn) = (ctx.node("set_pos"), ctx.node("set_neg"));
        ctx.resistor(sp, sn, self.params.coil_ohms);
        let (rp, rn) = (ctx.node("reset_pos"), ctx.node("reset_neg"));
        ctx.resistor(rp, rn, self.params.coil_ohms);

        let (com, no, nc) = (ctx.node("com"), ctx.node("no"), ctx.node("nc"));
        ctx.contact(com, no, self.state.set);
        ctx.contact(com, nc, !self.state.set);
    }

    fn settle(&mut self, probe: &Probe<'_>) -> bool {
        let threshold = self.params.threshold_volts;
        let set = probe.across_or_zero("set_pos", "set_neg").abs() >= threshold;
        let reset = probe.across_or_zero("reset_pos", "reset_neg").abs() >= threshold;
        let next = if reset {
            false
        } else if set {
            true
        } else {
            self.state.set
        };
        let changed = next != self.state.set;
        self.state.set = next;
        changed
    }

    fn state(&self) -> Option<DeviceState> {
        Some(DeviceState::LatchingRelay(self.state))
    }

    fn apply_state(&mut self, state: &DeviceState) {
        if let DeviceState::LatchingRelay(s) = state {
            self.state = *s;
        }
    }
}

/// What the part is called on the drawing. All kinds trip the same way
/// and stay tripped until the host patches `tripped` back to `false`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionKind {
    #[default]
    Fuse,
    Breaker,
    FusibleLink,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtectionParams {
    #[serde(default)]
    pub kind: ProtectionKind,
    pub trip_amps: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionState {
    pub tripped: bool,
}

/// Fuse, breaker or fusible link. Trips instantly above `trip_amps`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Protection {
    pub params: ProtectionParams,
    #[serde(default)]
    pub state: ProtectionState,
}

impl Protection {
    pub fn fuse(trip_amps: f64) -> Self {
        Self {
            params: ProtectionParams {
                kind: ProtectionKind::Fuse,
                trip_amps,
            },
            state: ProtectionState::default(),
        }
    }
}

impl Device for Protection {
    fn terminals(&self) -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    fn compile(&self, ctx: &mut CompileContext<'_>) {
        let (a, b) = (ctx.node("a"), ctx.node("b"));
        ctx.contact(a, b, !self.state.tripped);
    }

    fn settle(&mut self, probe: &Probe<'_>) -> bool {
        if self.state.tripped {
            return false;
        }
        // Never trip on missing data.
        let Some(drop) = probe.across("a", "b") else {
            return false;
        };
        let amps = drop.abs() / probe.config().closed_ohms;
        if amps > self.params.trip_amps {
            self.state.tripped = true;
            return true;
        }
        false
    }

    fn state(&self) -> Option<DeviceState> {
        Some(DeviceState::Protection(self.state))
    }

    fn apply_state(&mut self, state: &DeviceState) {
        if let DeviceState::Protection(s) = state {
            self.state = *s;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WiperParams {
    pub ohms: f64,
    /// Position counter steps per sweep.
    pub steps_per_cycle: u32,
    /// Steps at the start of the cycle counted as parked.
    #[serde(default = "WiperParams::default_park_steps")]
    pub park_steps: u32,
    /// Motor drop needed to advance one step per tick.
    #[serde(default = "WiperParams::default_run_volts")]
    pub run_volts: f64,
}

impl WiperParams {
    fn default_park_steps() -> u32 {
        1
    }

    fn default_run_volts() -> f64 {
        6.0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiperState {
    pub position: u32,
    /// Park contact `park_com`–`park_out`, closed while the arm is away
    /// from its rest position.
    pub park_closed: bool,
}

/// Wiper motor with its cam-operated park switch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WiperMotor {
    pub params: WiperParams,
    #[serde(default)]
    pub state: WiperState,
}

impl WiperMotor {
    pub fn parked(&self) -> bool {
        let cycle = self.params.steps_per_cycle.max(1);
        self.state.position % cycle < self.params.park_steps
    }
}

impl Device for WiperMotor {
    fn terminals(&self) -> Vec<String> {
        ["pos", "neg", "park_com", "park_out"]
            .iter()
            .map(|t| t.to_string())
            .collect()
    }

    fn compile(&self, ctx: &mut CompileContext<'_>) {
        let (pos, neg) = (ctx.node("pos"), ctx.node("neg"));
        ctx.resistor(pos, neg, self.params.ohms);
        let (com, out) = (ctx.node("park_com"), ctx.node("park_out"));
        ctx.contact(com, out, self.state.park_closed);
    }

    fn settle(&mut self, _probe: &Probe<'_>) -> bool {
        let closed = !self.parked();
        let changed = closed != self.state.park_closed;
        self.state.park_closed = closed;
        changed
    }

    fn observe(&mut self, probe: &Probe<'_>) {
        if probe.across_or_zero("pos", "neg").abs() >= self.params.run_volts {
            let cycle = self.params.steps_per_cycle.max(1);
            self.state.position = (self.state.position + 1) % cycle;
        }
    }

    fn state(&self) -> Option<DeviceState> {
        Some(DeviceState::WiperMotor(self.state))
    }

    fn apply_state(&mut self, state: &DeviceState) {
        if let DeviceState::WiperMotor(s) = state {
            self.state = *s;
        }
    }
}
