use serde::{Deserialize, Serialize};

use super::{CompileContext, Device, DeviceState};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatteryParams {
    pub volts: f64,
    #[serde(default)]
    pub internal_ohms: f64,
}

/// Ideal source behind its internal resistance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    pub params: BatteryParams,
}

impl Battery {
    pub fn new(volts: f64, internal_ohms: f64) -> Self {
        Self {
            params: BatteryParams {
                volts,
                internal_ohms,
            },
        }
    }
}

impl Device for Battery {
    fn terminals(&self) -> Vec<String> {
        vec!["pos".to_string(), "neg".to_string()]
    }

    fn compile(&self, ctx: &mut CompileContext<'_>) {
        let (pos, neg) = (ctx.node("pos"), ctx.node("neg"));
        if self.params.internal_ohms > 0.0 {
            let cell = ctx.internal_node();
            ctx.source(cell, neg, self.params.volts);
            ctx.resistor(cell, pos, self.params.internal_ohms);
        } else {
            ctx.source(pos, neg, self.params.volts);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorParams {
    /// Physical value producing `v_min`.
    pub min: f64,
    /// Physical value producing `v_max`.
    pub max: f64,
    #[serde(default)]
    pub v_min: f64,
    #[serde(default = "SensorParams::default_v_max")]
    pub v_max: f64,
}

impl SensorParams {
    fn default_v_max() -> f64 {
        5.0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorState {
    /// Current physical reading, set by the host.
    pub value: f64,
}

/// Ratiometric sensor output referenced to its own ground pin.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalogSensor {
    pub params: SensorParams,
    #[serde(default)]
    pub state: SensorState,
}

impl AnalogSensor {
    /// Output voltage for the current reading. The normalised position is
    /// clamped to `[-margin, 1 + margin]`.
    pub fn output_volts(&self, margin: f64) -> f64 {
        let SensorParams {
            min,
            max,
            v_min,
            v_max,
        } = self.params;
        let span = max - min;
        let t = if span.abs() < f64::EPSILON || !self.state.value.is_finite() {
            0.0
        } else {
            (self.state.value - min) / span
        };
        let t = t.clamp(-margin, 1.0 + margin);
        v_min + t * (v_max - v_min)
    }
}

impl Device for AnalogSensor {
    fn terminals(&self) -> Vec<String> {
        vec!["sig".to_string(), "gnd".to_string()]
    }

    fn compile(&self, ctx: &mut CompileContext<'_>) {
        let volts = self.output_volts(ctx.config().sensor_margin);
        let (sig, gnd) = (ctx.node("sig"), ctx.node("gnd"));
        ctx.source(sig, gnd, volts);
    }

    fn state(&self) -> Option<DeviceState> {
        Some(DeviceState::AnalogSensor(self.state))
    }

    fn apply_state(&mut self, state: &DeviceState) {
        if let DeviceState::AnalogSensor(s) = state {
            self.state = *s;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coolant(value: f64) -> AnalogSensor {
        AnalogSensor {
            params: SensorParams {
                min: -40.0,
                max: 140.0,
                v_min: 0.5,
                v_max: 4.5,
            },
            state: SensorState { value },
        }
    }

    #[test]
    fn sensor_interpolates_linearly() {
        assert!((coolant(-40.0).output_volts(0.02) - 0.5).abs() < 1e-12);
        assert!((coolant(140.0).output_volts(0.02) - 4.5).abs() < 1e-12);
        assert!((coolant(50.0).output_volts(0.02) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn sensor_clamps_with_margin() {
        // 2% of a 4 V span is 0.08 V beyond either end.
        assert!((coolant(1000.0).output_volts(0.02) - 4.58).abs() < 1e-9);
        assert!((coolant(-1000.0).output_volts(0.02) - 0.42).abs() < 1e-9);
    }

    #[test]
    fn degenerate_range_reads_low_end() {
        let mut s = coolant(10.0);
        s.params.max = s.params.min;
        assert_eq!(s.output_volts(0.02), 0.5);
    }
}
