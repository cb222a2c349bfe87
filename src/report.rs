//! Plain-text rendering of tick outputs.

use std::fmt;

use wirecut_sim::bus::Frame;
use wirecut_sim::{Circuit, DeviceState, TickOutput};

use crate::to_metric_prefix;

fn state_summary(state: &DeviceState) -> String {
    match state {
        DeviceState::Lamp(s) if s.lit => format!("lit ({:.0}%)", s.brightness * 100.0),
        DeviceState::Lamp(_) => "dark".to_string(),
        DeviceState::Switch(s) => if s.closed { "closed" } else { "open" }.to_string(),
        DeviceState::MultiSwitch(s) => format!("position {}", s.position),
        DeviceState::Relay(s) => if s.energized { "energized" } else { "released" }.to_string(),
        DeviceState::LatchingRelay(s) => if s.set { "set" } else { "reset" }.to_string(),
        DeviceState::Protection(s) => if s.tripped { "TRIPPED" } else { "intact" }.to_string(),
        DeviceState::Diode(s) => if s.conducting { "conducting" } else { "blocking" }.to_string(),
        DeviceState::AnalogSensor(s) => format!("reading {}", s.value),
        DeviceState::Gauge(s) => format!("needle {:.0}%", s.reading * 100.0),
        DeviceState::WiperMotor(s) => format!(
            "step {}{}",
            s.position,
            if s.park_closed { " (parked)" } else { "" }
        ),
        DeviceState::Controller(s) if !s.powered => "unpowered".to_string(),
        DeviceState::Controller(s) => {
            let drives: Vec<String> = s
                .drives
                .iter()
                .map(|(pin, drive)| format!("{pin}={drive:?}"))
                .collect();
            format!("powered [{}]", drives.join(", "))
        }
    }
}

pub fn frame_summary(frame: &Frame) -> String {
    let bytes: Vec<String> = frame.payload().iter().map(|b| format!("{b:02X}")).collect();
    let width = if frame.extended { 8 } else { 3 };
    format!("{:0width$X} [{}]", frame.id, bytes.join(" "))
}

/// One block of text per tick. `verbose` adds splice points and every
/// wire and net voltage.
pub struct TickReport<'a> {
    pub out: &'a TickOutput,
    pub circuit: &'a Circuit,
    pub now_ms: u64,
    pub verbose: bool,
}

impl fmt::Display for TickReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let TickReport {
            out,
            circuit,
            now_ms,
            verbose,
        } = *self;
        let status = if out.solver_failed {
            "SOLVER FAILED"
        } else if out.converged {
            "converged"
        } else {
            "NOT CONVERGED"
        };
        writeln!(f, "t={now_ms} ms: {status} after {} round(s)", out.iterations)?;

        for patch in &out.patches {
            let kind = circuit
                .component(&patch.id)
                .map_or("?", |c| c.kind.name());
            writeln!(f, "  {} ({kind}): {}", patch.id, state_summary(&patch.state))?;
        }
        for (bus, frames) in &out.bus_traffic {
            for frame in frames {
                writeln!(f, "  bus {bus}: {}", frame_summary(frame))?;
            }
        }
        for event in &out.events {
            writeln!(f, "  {event}")?;
        }

        if verbose {
            for junction in circuit.junctions() {
                writeln!(f, "  splice at {junction}")?;
            }
            for (wire, display) in circuit.wires.iter().zip(&out.wires) {
                let label = wire.label.as_deref().unwrap_or("");
                writeln!(
                    f,
                    "  wire {} - {} {label}: {} {:?}",
                    wire.a,
                    wire.b,
                    to_metric_prefix(display.voltage, 'V'),
                    display.band,
                )?;
            }
            for (net, volts) in &out.net_voltages {
                writeln!(f, "  {net}: {}", to_metric_prefix(*volts, 'V'))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wirecut_sim::device::{Battery, Ground, Lamp};
    use wirecut_sim::{Component, Simulator};

    #[test]
    fn frames_print_as_hex() {
        let frame = Frame::new(0x7E8, false, &[0x03, 0x59, 0x02, 0xFF]);
        assert_eq!(frame_summary(&frame), "7E8 [03 59 02 FF]");
        let frame = Frame::new(0x18FE_F117, true, &[1]);
        assert_eq!(frame_summary(&frame), "18FEF117 [01]");
    }

    #[test]
    fn report_lists_patches_and_wires() {
        let mut circuit = Circuit::default();
        circuit.components.push(Component::new("bat", Battery::new(12.0, 0.0)));
        circuit.components.push(Component::new("lamp", Lamp::new(24.0)));
        circuit.components.push(Component::new("gnd", Ground::default()));
        circuit.connect(("bat", "pos"), ("lamp", "a"));
        circuit.connect(("lamp", "b"), ("gnd", "gnd"));
        circuit.connect(("bat", "neg"), ("gnd", "gnd"));

        let out = Simulator::default().tick(&circuit, 0);
        let text = TickReport {
            out: &out,
            circuit: &circuit,
            now_ms: 0,
            verbose: true,
        }
        .to_string();
        assert!(text.starts_with("t=0 ms: converged after 1 round(s)"));
        assert!(text.contains("  lamp (Lamp): lit (100%)"));
        assert!(text.contains("  splice at gnd.gnd\n"));
        assert!(text.contains("wire bat.pos - lamp.a : 12.000 V Supply"));
    }
}
