//! One simulator instance and its tick.

use std::collections::{BTreeMap, BTreeSet};

use crate::bus::{handle_diagnostic_request, Bus, BusId, Frame, QueuedFrame};
use crate::device::{Controller, ControllerState, DeviceState, Drive, Probe};
use crate::diagnostics::Diagnostics;
use crate::logic::rules::Env;
use crate::logic::{self, LogicMemory};
use crate::nets::NetMap;
use crate::output::{EventLog, StatePatch, TickOutput, WireDisplay};
use crate::resolver::{settle, Settled};
use crate::solver::SimConfig;
use crate::{Circuit, Component, ComponentId, Kind};

/// What a controller keeps between ticks.
#[derive(Clone, Debug, Default)]
struct ControllerRuntime {
    memory: LogicMemory,
    diagnostics: Diagnostics,
}

/// Owns everything that persists across ticks: controller memory, fault
/// records and bus queues, all keyed by stable ids. Independent instances
/// share nothing.
#[derive(Clone, Debug, Default)]
pub struct Simulator {
    config: SimConfig,
    controllers: BTreeMap<ComponentId, ControllerRuntime>,
    buses: BTreeMap<BusId, Bus>,
    /// Frames delivered last tick, read by controllers this tick.
    inbound: BTreeMap<BusId, Vec<Frame>>,
}

impl Simulator {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: SimConfig) {
        self.config = config;
    }

    /// Forgets all controller memory, fault records and queued frames.
    pub fn reset(&mut self) {
        self.controllers.clear();
        self.buses.clear();
        self.inbound.clear();
    }

    /// Queues a frame from outside the circuit, e.g. a diagnostic tester.
    pub fn inject_frame(&mut self, bus: BusId, frame: Frame) {
        self.buses
            .entry(bus)
            .or_default()
            .enqueue(QueuedFrame::new(frame));
    }

    pub fn diagnostics(&self, controller: &ComponentId) -> Option<&Diagnostics> {
        self.controllers.get(controller).map(|r| &r.diagnostics)
    }

    pub fn memory(&self, controller: &ComponentId) -> Option<&LogicMemory> {
        self.controllers.get(controller).map(|r| &r.memory)
    }

    pub fn bus(&self, bus: &BusId) -> Option<&Bus> {
        self.buses.get(bus)
    }

    /// Runs one tick at `now_ms` over a fresh copy of `circuit`.
    ///
    /// When the solver fails the output carries `solver_failed` and no
    /// patches; the host keeps its previous snapshot.
    pub fn tick(&mut self, circuit: &Circuit, now_ms: u64) -> TickOutput {
        let mut log = EventLog::new();
        let mut components = circuit.components.clone();
        let mut seen = BTreeSet::new();
        components.retain(|c| {
            let first = seen.insert(c.id.clone());
            if !first {
                log.warn(Some(&c.id), "duplicate component id ignored");
            }
            first
        });
        let before: Vec<Option<DeviceState>> =
            components.iter().map(|c| c.kind.device().state()).collect();

        let nets = NetMap::build(&components, &circuit.wires, &mut log);
        let mut out = TickOutput {
            terminal_nets: nets.terminal_nets(),
            wires: vec![WireDisplay::new(0.0); circuit.wires.len()],
            ..Default::default()
        };

        if !circuit.has_ground() {
            log.warn(None, "circuit has no ground; nothing solved");
            out.events = log.into_events();
            return out;
        }

        let mut settled = settle(&mut components, &nets, &self.config, &mut log);
        let mut iterations = settled.iterations;
        if settled.solver_failed {
            return failed(out, iterations, log);
        }

        // Restored if the second settle fails, so a failed tick changes
        // nothing.
        let checkpoint = (self.controllers.clone(), self.buses.clone());
        self.prune_controllers(&components);
        if self.run_controllers(&mut components, &nets, &settled, now_ms, &mut log) {
            settled = settle(&mut components, &nets, &self.config, &mut log);
            iterations += settled.iterations;
            if settled.solver_failed {
                (self.controllers, self.buses) = checkpoint;
                return failed(out, iterations, log);
            }
        }
        self.inbound.clear();

        for component in components.iter_mut() {
            let probe = Probe::new(&component.id, &nets, &settled.solution, &self.config);
            component.kind.device_mut().observe(&probe);
        }

        out.bus_traffic = self.schedule_buses(&components, now_ms, &mut log);

        out.patches = components
            .iter()
            .zip(before)
            .filter_map(|(component, before)| {
                let after = component.kind.device().state()?;
                (Some(&after) != before.as_ref()).then(|| StatePatch {
                    id: component.id.clone(),
                    state: after,
                })
            })
            .collect();
        out.wires = circuit
            .wires
            .iter()
            .map(|wire| {
                let volts = nets
                    .net_of(&wire.a)
                    .and_then(|net| settled.solution.voltage(net))
                    .unwrap_or(0.0);
                WireDisplay::new(volts)
            })
            .collect();
        out.net_voltages = settled.solution.voltages;
        out.iterations = iterations;
        out.converged = settled.converged;
        out.events = log.into_events();

        log::debug!(
            "tick {now_ms}: {} rounds, {} patches",
            out.iterations,
            out.patches.len()
        );
        out
    }

    fn prune_controllers(&mut self, components: &[Component]) {
        let live: BTreeSet<&ComponentId> = components
            .iter()
            .filter(|c| matches!(c.kind, Kind::Controller(_)))
            .map(|c| &c.id)
            .collect();
        self.controllers.retain(|id, _| live.contains(id));
    }

    /// Samples every controller, runs its rules and fault monitors and
    /// hands its messages to its bus. Returns whether any output drive
    /// changed.
    fn run_controllers(
        &mut self,
        components: &mut [Component],
        nets: &NetMap,
        settled: &Settled,
        now: u64,
        log: &mut EventLog,
    ) -> bool {
        let mut changed = false;

        for component in components.iter_mut() {
            let Kind::Controller(ctrl) = &mut component.kind else {
                continue;
            };
            let id = &component.id;
            let probe = Probe::new(id, nets, &settled.solution, &self.config);
            let samples = ctrl.sample(&probe);
            let supply = ctrl.supply_volts(&probe);
            let powered = supply >= ctrl.params.min_supply_volts;
            let runtime = self.controllers.entry(id.clone()).or_default();

            if powered != ctrl.state.powered {
                if powered {
                    log.info(Some(id), format!("powered up at {supply:.2} V"));
                } else {
                    log.warn(Some(id), format!("supply {supply:.2} V below minimum; outputs released"));
                }
            }

            let mut drives = BTreeMap::new();
            if powered {
                let (rules, errors) = logic::compile_rules(&ctrl.params.rules);
                for e in errors {
                    log.warn(Some(id), format!("rule skipped: {e}"));
                }
                let frames = ctrl
                    .params
                    .bus
                    .as_ref()
                    .and_then(|bus| self.inbound.get(bus))
                    .map_or(&[][..], Vec::as_slice);
                let output = logic::run(
                    &samples,
                    &rules,
                    now,
                    frames,
                    ctrl.params.source_address,
                    &mut runtime.memory,
                );

                let env = Env {
                    samples: &samples,
                    variables: &runtime.memory.variables,
                };
                for monitor in &ctrl.params.faults {
                    let raw = monitor.condition.holds(&env);
                    runtime.diagnostics.update(monitor, raw, now);
                }

                match &ctrl.params.bus {
                    Some(bus) => {
                        let bus = self.buses.entry(bus.clone()).or_default();
                        for transmit in output.messages {
                            bus.submit(transmit);
                        }
                    }
                    None if !output.messages.is_empty() => {
                        log.warn(Some(id), "transmit rule on a controller with no bus");
                    }
                    None => {}
                }

                drives = checked_drives(ctrl, output.drives, id, log);
            }

            let next = ControllerState { powered, drives };
            if next != ctrl.state {
                changed |= next.drives != ctrl.state.drives;
                ctrl.state = next;
            }
        }
        changed
    }

    /// Arbitrates every bus once, answers diagnostic requests and returns
    /// what each bus delivered.
    fn schedule_buses(
        &mut self,
        components: &[Component],
        now: u64,
        log: &mut EventLog,
    ) -> BTreeMap<BusId, Vec<Frame>> {
        let responders: Vec<(&ComponentId, &BusId, u32, Option<u8>)> = components
            .iter()
            .filter_map(|c| match &c.kind {
                Kind::Controller(ctrl) if ctrl.state.powered => {
                    let bus = ctrl.params.bus.as_ref()?;
                    let request = ctrl.params.diag_request_id?;
                    Some((&c.id, bus, request, ctrl.params.source_address))
                }
                _ => None,
            })
            .collect();

        let mut traffic = BTreeMap::new();
        for (bus_id, bus) in self.buses.iter_mut() {
            let Some(frame) = bus.tick(now) else {
                continue;
            };
            for &(id, _, _, source) in responders
                .iter()
                .filter(|(_, b, request, _)| *b == bus_id && *request == frame.id)
            {
                let Some(runtime) = self.controllers.get_mut(id) else {
                    continue;
                };
                if let Some(response) =
                    handle_diagnostic_request(&frame, &mut runtime.diagnostics, source, now)
                {
                    log.info(Some(id), format!("diagnostic response on {:#x}", response.id));
                    bus.enqueue(QueuedFrame::new(response));
                }
            }
            self.inbound
                .entry(bus_id.clone())
                .or_default()
                .push(frame.clone());
            traffic.insert(bus_id.clone(), vec![frame]);
        }
        traffic
    }
}

fn failed(mut out: TickOutput, iterations: usize, log: EventLog) -> TickOutput {
    out.iterations = iterations;
    out.solver_failed = true;
    out.events = log.into_events();
    out
}

/// Keeps drives on declared output pins only.
fn checked_drives(
    ctrl: &Controller,
    drives: BTreeMap<String, Drive>,
    id: &ComponentId,
    log: &mut EventLog,
) -> BTreeMap<String, Drive> {
    drives
        .into_iter()
        .filter(|(pin, _)| {
            let declared = ctrl.params.outputs.iter().any(|o| &o.name == pin);
            if !declared {
                log.warn(Some(id), format!("rule drives unknown output {pin}"));
            }
            declared
        })
        .collect()
}
