use std::fs::File;
use std::path::Path;

use ron::ser::PrettyConfig;
use serde::{Deserialize, Serialize};
use wirecut_sim::bus::{BusId, Frame};
use wirecut_sim::{Circuit, SimConfig, Simulator, TickOutput};

use crate::error::{FrameArgError, LoadError};

/// What a `.ckt` file holds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CircuitFile {
    pub circuit: Circuit,
    #[serde(default)]
    pub cfg: SimConfig,
    #[serde(default = "CircuitFile::default_tick_ms")]
    pub tick_ms: u64,
}

impl CircuitFile {
    fn default_tick_ms() -> u64 {
        100
    }
}

impl Default for CircuitFile {
    fn default() -> Self {
        Self {
            circuit: Circuit::default(),
            cfg: SimConfig::default(),
            tick_ms: Self::default_tick_ms(),
        }
    }
}

/// Loads a circuit file and brings its rule documents up to date.
pub fn read_file(path: &Path) -> Result<CircuitFile, LoadError> {
    let file = File::open(path)?;
    let mut data: CircuitFile = ron::de::from_reader(file)?;
    let upgraded = data.circuit.upgrade_rules();
    if upgraded > 0 {
        log::info!("{}: upgraded {upgraded} rule(s)", path.display());
    }
    Ok(data)
}

pub fn write_file(data: &CircuitFile, path: &Path) -> Result<(), LoadError> {
    let file = File::create(path)?;
    ron::ser::to_writer_pretty(file, data, PrettyConfig::default())?;
    Ok(())
}

/// Parses `BUS:ID:DATA`, e.g. `body:7e0:03190208`. The identifier is hex
/// and counts as extended above the standard range.
pub fn parse_frame_arg(arg: &str) -> Result<(BusId, Frame), FrameArgError> {
    let mut parts = arg.splitn(3, ':');
    let (Some(bus), Some(id), Some(data)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(FrameArgError::Shape(arg.to_string()));
    };
    if bus.is_empty() {
        return Err(FrameArgError::Shape(arg.to_string()));
    }
    let id = u32::from_str_radix(id.trim_start_matches("0x"), 16)
        .map_err(|_| FrameArgError::Id(id.to_string()))?;
    if !data.is_ascii() || data.len() % 2 != 0 || data.len() > 16 {
        return Err(FrameArgError::Data(data.to_string()));
    }
    let payload = (0..data.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&data[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| FrameArgError::Data(data.to_string()))?;
    let extended = id > wirecut_sim::bus::MAX_STANDARD_ID;
    Ok((BusId::new(bus), Frame::new(id, extended, &payload)))
}

/// Steps one circuit file through time. Component states carry over from
/// tick to tick through the patches; a tick whose solve failed is
/// discarded.
pub struct Session {
    file: CircuitFile,
    sim: Simulator,
    now_ms: u64,
}

impl Session {
    pub fn new(file: CircuitFile) -> Self {
        let sim = Simulator::new(file.cfg);
        Self {
            file,
            sim,
            now_ms: 0,
        }
    }

    pub fn circuit(&self) -> &Circuit {
        &self.file.circuit
    }

    pub fn circuit_mut(&mut self) -> &mut Circuit {
        &mut self.file.circuit
    }

    pub fn simulator(&self) -> &Simulator {
        &self.sim
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn set_tick_ms(&mut self, tick_ms: u64) {
        self.file.tick_ms = tick_ms;
    }

    pub fn inject_frame(&mut self, bus: BusId, frame: Frame) {
        self.sim.inject_frame(bus, frame);
    }

    pub fn step(&mut self) -> TickOutput {
        let out = self.sim.tick(&self.file.circuit, self.now_ms);
        if out.solver_failed {
            log::warn!("tick at {} ms discarded", self.now_ms);
        } else {
            self.file.circuit.apply_patches(&out.patches);
        }
        self.now_ms += self.file.tick_ms;
        out
    }

    /// Forgets controller memory, fault records and bus queues and
    /// restarts the clock. Component states are kept.
    pub fn reset(&mut self) {
        self.sim.reset();
        self.now_ms = 0;
    }

    pub fn into_file(self) -> CircuitFile {
        self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wirecut_sim::device::{Battery, Ground, Lamp, Protection, Resistor};
    use wirecut_sim::{Component, ComponentId, Kind};

    fn fused(load: impl Into<Kind>) -> CircuitFile {
        let mut circuit = Circuit::default();
        circuit.components.push(Component::new("bat", Battery::new(12.0, 0.0)));
        circuit.components.push(Component::new("fuse", Protection::fuse(15.0)));
        circuit.components.push(Component::new("load", load));
        circuit.components.push(Component::new("gnd", Ground::default()));
        circuit.connect(("bat", "pos"), ("fuse", "a"));
        circuit.connect(("fuse", "b"), ("load", "a"));
        circuit.connect(("load", "b"), ("gnd", "gnd"));
        circuit.connect(("bat", "neg"), ("gnd", "gnd"));
        CircuitFile {
            circuit,
            ..Default::default()
        }
    }

    fn tripped(session: &Session) -> bool {
        match &session.circuit().component(&ComponentId::new("fuse")).unwrap().kind {
            Kind::Protection(p) => p.state.tripped,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn step_carries_state_and_advances_clock() {
        let mut session = Session::new(fused(Resistor::new(0.1)));
        let out = session.step();
        assert!(!out.patches.is_empty());
        assert!(tripped(&session));
        assert_eq!(session.now_ms(), 100);

        let out = session.step();
        assert!(out.patches.is_empty());
        assert_eq!(session.now_ms(), 200);
    }

    #[test]
    fn file_round_trips_through_ron() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fused.ckt");
        let mut data = fused(Lamp::new(24.0));
        data.tick_ms = 20;
        write_file(&data, &path).unwrap();
        assert_eq!(read_file(&path).unwrap(), data);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_file(&dir.path().join("nope.ckt")).unwrap_err();
        assert!(matches!(err, LoadError::Io(_)));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ckt");
        std::fs::write(&path, "(circuit: 5)").unwrap();
        assert!(matches!(read_file(&path), Err(LoadError::Ron(_))));
    }

    #[test]
    fn demo_circuit_parses() {
        let data: CircuitFile = ron::from_str(include_str!("../demos/headlamp.ckt")).unwrap();
        assert!(data.circuit.has_ground());
        let mut session = Session::new(data);
        let out = session.step();
        assert!(out.converged);
        assert!(!out.solver_failed);
    }

    #[test]
    fn frame_arguments() {
        let (bus, frame) = parse_frame_arg("body:7e0:03190208").unwrap();
        assert_eq!(bus, BusId::new("body"));
        assert_eq!(frame.id, 0x7E0);
        assert!(!frame.extended);
        assert_eq!(frame.payload(), &[0x03, 0x19, 0x02, 0x08]);

        let (_, frame) = parse_frame_arg("pt:0x18fef100:").unwrap();
        assert!(frame.extended);
        assert!(frame.payload().is_empty());

        assert!(matches!(parse_frame_arg("body:7e0"), Err(FrameArgError::Shape(_))));
        assert!(matches!(parse_frame_arg("body:zz:00"), Err(FrameArgError::Id(_))));
        assert!(matches!(parse_frame_arg("body:7e0:123"), Err(FrameArgError::Data(_))));
    }
}
