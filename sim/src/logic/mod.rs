//! Controller logic runtime.
//!
//! [`run`] is a function of its inputs plus one controller's
//! [`LogicMemory`]: same samples, rules, time, frames and memory give the
//! same drives and messages. Rules run in declaration order, so a
//! variable stored by one rule is visible to every later rule in the
//! same run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::{default_priority, Frame, QueuedFrame, Transmit, MAX_STANDARD_ID};
use crate::device::{Drive, Rail};
use crate::error::RuleError;

pub mod migrate;
pub mod rules;

use rules::{
    CanRxConfig, CanTxConfig, CompareConfig, Env, LatchConfig, MathConfig, Rule, RuleBody,
    RxField, TimerConfig, TimerMode,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerState {
    /// When the trigger last rose (delay-on) or fell (delay-off).
    pub since: Option<u64>,
    pub asserted: bool,
}

/// Everything a controller remembers between runs.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LogicMemory {
    pub timers: BTreeMap<String, TimerState>,
    pub latches: BTreeMap<String, bool>,
    pub variables: BTreeMap<String, f64>,
    /// Newest frame seen per `(id, source)`.
    pub frames: BTreeMap<(u32, Option<u8>), Frame>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogicOutput {
    pub drives: BTreeMap<String, Drive>,
    pub messages: Vec<Transmit>,
}

/// Parses rule documents, upgrading stale ones on a copy first. Broken
/// rules come back as errors next to the good ones.
pub fn compile_rules(docs: &[Value]) -> (Vec<Rule>, Vec<RuleError>) {
    let mut rules = Vec::with_capacity(docs.len());
    let mut errors = Vec::new();
    for doc in docs {
        let parsed = if migrate::schema_of(doc) < migrate::RULE_SCHEMA_VERSION {
            let mut upgraded = doc.clone();
            match migrate::upgrade(&mut upgraded) {
                Ok(_) => Rule::from_doc(&upgraded),
                Err(e) => {
                    log::debug!("rule migration failed: {e}");
                    Rule::from_doc(doc)
                }
            }
        } else {
            Rule::from_doc(doc)
        };
        match parsed {
            Ok(rule) => rules.push(rule),
            Err(e) => errors.push(e),
        }
    }
    (rules, errors)
}

/// One logic pass for one controller.
pub fn run(
    samples: &BTreeMap<String, f64>,
    rules: &[Rule],
    now: u64,
    inbound: &[Frame],
    source_address: Option<u8>,
    memory: &mut LogicMemory,
) -> LogicOutput {
    for frame in inbound {
        memory.frames.insert(frame.mailbox(), frame.clone());
    }

    let mut out = LogicOutput::default();
    for rule in rules.iter().filter(|r| r.enabled) {
        match &rule.body {
            RuleBody::Compare(cfg) => compare(cfg, samples, memory, &mut out),
            RuleBody::Timer(cfg) => timer(&rule.id, cfg, samples, now, memory, &mut out),
            RuleBody::Latch(cfg) => latch(&rule.id, cfg, samples, memory, &mut out),
            RuleBody::Math(cfg) => math(cfg, samples, memory, &mut out),
            RuleBody::CanTx(cfg) => can_tx(cfg, samples, now, source_address, memory, &mut out),
            RuleBody::CanRx(cfg) => can_rx(cfg, now, memory, &mut out),
        }
    }
    out
}

fn env<'a>(samples: &'a BTreeMap<String, f64>, memory: &'a LogicMemory) -> Env<'a> {
    Env {
        samples,
        variables: &memory.variables,
    }
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// Drives `output` to `rail` when `on`; otherwise leaves it alone.
fn emit(out: &mut LogicOutput, output: Option<&String>, rail: Rail, on: bool) {
    if let (Some(pin), true) = (output, on) {
        out.drives.insert(pin.clone(), Drive::Rail(rail));
    }
}

fn store(memory: &mut LogicMemory, name: Option<&String>, value: f64) {
    if let Some(name) = name {
        memory.variables.insert(name.clone(), value);
    }
}

fn compare(
    cfg: &CompareConfig,
    samples: &BTreeMap<String, f64>,
    memory: &mut LogicMemory,
    out: &mut LogicOutput,
) {
    let result = {
        let env = env(samples, memory);
        cfg.op.eval(cfg.left.resolve(&env), cfg.right.resolve(&env))
            && cfg.all.iter().all(|c| c.holds(&env))
    };
    emit(out, cfg.output.as_ref(), cfg.rail, result);
    store(memory, cfg.store.as_ref(), flag(result));
}

fn timer(
    id: &str,
    cfg: &TimerConfig,
    samples: &BTreeMap<String, f64>,
    now: u64,
    memory: &mut LogicMemory,
    out: &mut LogicOutput,
) {
    let triggered = cfg.trigger.fires(&env(samples, memory));
    let state = memory.timers.entry(id.to_string()).or_default();

    match cfg.mode {
        TimerMode::DelayOn => {
            if triggered {
                let since = *state.since.get_or_insert(now);
                state.asserted = now.saturating_sub(since) >= cfg.duration_ms;
            } else {
                *state = TimerState::default();
            }
        }
        TimerMode::DelayOff => {
            if triggered {
                *state = TimerState {
                    since: None,
                    asserted: true,
                };
            } else if state.asserted {
                let since = *state.since.get_or_insert(now);
                if now.saturating_sub(since) >= cfg.duration_ms {
                    *state = TimerState::default();
                }
            }
        }
    }

    let asserted = state.asserted;
    emit(out, cfg.output.as_ref(), cfg.rail, asserted);
    store(memory, cfg.store.as_ref(), flag(asserted));
}

fn latch(
    id: &str,
    cfg: &LatchConfig,
    samples: &BTreeMap<String, f64>,
    memory: &mut LogicMemory,
    out: &mut LogicOutput,
) {
    let (set, reset) = {
        let env = env(samples, memory);
        (
            cfg.set.resolve(&env) >= cfg.set_threshold,
            cfg.reset.resolve(&env) >= cfg.reset_threshold,
        )
    };
    let held = memory.latches.get(id).copied().unwrap_or(false);
    // Reset wins.
    let next = !reset && (set || held);
    memory.latches.insert(id.to_string(), next);

    emit(out, cfg.output.as_ref(), cfg.rail, next);
    store(memory, cfg.store.as_ref(), flag(next));
}

fn math(
    cfg: &MathConfig,
    samples: &BTreeMap<String, f64>,
    memory: &mut LogicMemory,
    out: &mut LogicOutput,
) {
    let mut value = cfg.map.apply(cfg.input.resolve(&env(samples, memory)));
    // Unresolved input: nothing to write. Checked before clamping, which
    // would turn NaN into a bound.
    if !value.is_finite() {
        return;
    }
    if let Some(min) = cfg.min {
        value = value.max(min);
    }
    if let Some(max) = cfg.max {
        value = value.min(max);
    }
    if let Some(pin) = &cfg.output {
        out.drives.insert(pin.clone(), Drive::Analog(value));
    }
    store(memory, cfg.store.as_ref(), value);
}

fn to_byte(value: f64) -> u8 {
    if value.is_finite() {
        value.round().clamp(0.0, 255.0) as u8
    } else {
        0
    }
}

fn can_tx(
    cfg: &CanTxConfig,
    samples: &BTreeMap<String, f64>,
    now: u64,
    source_address: Option<u8>,
    memory: &LogicMemory,
    out: &mut LogicOutput,
) {
    let env = env(samples, memory);
    let extended = cfg.extended || cfg.id > MAX_STANDARD_ID;
    let fires = cfg.trigger.fires(&env);

    if !fires {
        if cfg.period_ms.is_some() {
            out.messages.push(Transmit::StopPeriodic {
                id: cfg.id,
                source: source_address,
            });
        }
        return;
    }

    let mut data = [0u8; 8];
    let mut highest = 0usize;
    for (&index, &byte) in &cfg.bytes {
        if let Some(slot) = data.get_mut(usize::from(index)) {
            *slot = byte;
            highest = highest.max(usize::from(index) + 1);
        }
    }
    for field in &cfg.fields {
        let value = field.source.resolve(&env) * field.scale + field.offset;
        if let Some(slot) = data.get_mut(usize::from(field.index)) {
            *slot = to_byte(value);
            highest = highest.max(usize::from(field.index) + 1);
        }
    }
    let length = cfg.length.map_or(highest, usize::from).min(8);

    let mut frame = Frame::new(cfg.id, extended, &data[..length]);
    frame.timestamp = now;
    frame.source_address = source_address;
    frame.signals = cfg
        .signals
        .iter()
        .map(|(label, operand)| (label.clone(), operand.resolve(&env)))
        .filter(|(_, v)| v.is_finite())
        .collect();

    let priority = match cfg.priority {
        Some(p) => p & 0x7,
        None => default_priority(frame.id, extended),
    };
    let message = QueuedFrame { priority, frame };
    out.messages.push(match cfg.period_ms {
        Some(interval_ms) => Transmit::Periodic {
            message,
            interval_ms,
        },
        None => Transmit::Once(message),
    });
}

fn newest<'a>(memory: &'a LogicMemory, id: u32, source: Option<u8>) -> Option<&'a Frame> {
    memory
        .frames
        .values()
        .filter(|f| f.id == id && (source.is_none() || f.source_address == source))
        .max_by_key(|f| f.timestamp)
}

fn can_rx(cfg: &CanRxConfig, now: u64, memory: &mut LogicMemory, out: &mut LogicOutput) {
    let fresh = newest(memory, cfg.id, cfg.source)
        .filter(|f| f.timestamp <= now && now - f.timestamp <= cfg.timeout_ms)
        .cloned();

    match fresh {
        Some(frame) => {
            emit(out, cfg.output.as_ref(), cfg.rail, true);
            for (var, field) in &cfg.map {
                let value = match field {
                    RxField::Label(label) => frame.signals.get(label).copied(),
                    RxField::Byte {
                        byte,
                        scale,
                        offset,
                    } => frame
                        .payload()
                        .get(usize::from(*byte))
                        .map(|&b| f64::from(b) * scale + offset),
                };
                memory
                    .variables
                    .insert(var.clone(), value.unwrap_or(f64::NAN));
            }
        }
        None => {
            for var in cfg.map.keys() {
                memory.variables.insert(var.clone(), 0.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules(docs: Value) -> Vec<Rule> {
        let docs: Vec<Value> = serde_json::from_value(docs).unwrap();
        let (rules, errors) = compile_rules(&docs);
        assert!(errors.is_empty(), "{errors:?}");
        rules
    }

    fn samples(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|&(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn compare_drives_and_stores() {
        let rules = rules(json!([{
            "id": "r", "type": "COMPARE", "schema": 2,
            "config": {"left": "ign", "op": ">", "right": 6.0, "output": "lamp", "store": "on"}
        }]));
        let mut mem = LogicMemory::default();
        let out = run(&samples(&[("ign", 12.0)]), &rules, 0, &[], None, &mut mem);
        assert_eq!(out.drives.get("lamp"), Some(&Drive::Rail(Rail::Supply)));
        assert_eq!(mem.variables["on"], 1.0);

        let out = run(&samples(&[("ign", 0.0)]), &rules, 100, &[], None, &mut mem);
        assert!(out.drives.is_empty());
        assert_eq!(mem.variables["on"], 0.0);
    }

    #[test]
    fn missing_pin_never_fires() {
        let rules = rules(json!([{
            "id": "r", "type": "COMPARE", "schema": 2,
            "config": {"left": {"pin": "nope"}, "op": "!=", "right": 1.0, "output": "x"}
        }]));
        let out = run(&BTreeMap::new(), &rules, 0, &[], None, &mut LogicMemory::default());
        assert!(out.drives.is_empty());
    }

    #[test]
    fn delay_on_waits_for_duration() {
        let rules = rules(json!([{
            "id": "t", "type": "TIMER", "schema": 2,
            "config": {"trigger": {"mode": "active", "source": "sw"}, "duration_ms": 300, "output": "out"}
        }]));
        let mut mem = LogicMemory::default();
        let on = samples(&[("sw", 12.0)]);
        let fired: Vec<bool> = (0..5)
            .map(|i| !run(&on, &rules, i * 100, &[], None, &mut mem).drives.is_empty())
            .collect();
        assert_eq!(fired, vec![false, false, false, true, true]);
        assert!(run(&samples(&[("sw", 0.0)]), &rules, 500, &[], None, &mut mem)
            .drives
            .is_empty());
    }

    #[test]
    fn delay_off_holds_after_trigger_drops() {
        let rules = rules(json!([{
            "id": "t", "type": "TIMER", "schema": 2,
            "config": {"trigger": {"mode": "active", "source": "sw"}, "mode": "delay_off",
                       "duration_ms": 200, "output": "out"}
        }]));
        let mut mem = LogicMemory::default();
        let on = samples(&[("sw", 12.0)]);
        let off = samples(&[("sw", 0.0)]);
        assert!(run(&off, &rules, 0, &[], None, &mut mem).drives.is_empty());
        assert!(!run(&on, &rules, 100, &[], None, &mut mem).drives.is_empty());
        assert!(!run(&off, &rules, 200, &[], None, &mut mem).drives.is_empty());
        assert!(!run(&off, &rules, 300, &[], None, &mut mem).drives.is_empty());
        assert!(run(&off, &rules, 400, &[], None, &mut mem).drives.is_empty());
    }

    #[test]
    fn latch_reset_wins() {
        let rules = rules(json!([{
            "id": "l", "type": "LATCH", "schema": 2,
            "config": {"set": "s", "reset": "r", "output": "out"}
        }]));
        let mut mem = LogicMemory::default();
        let mut step = |s: f64, r: f64| {
            !run(&samples(&[("s", s), ("r", r)]), &rules, 0, &[], None, &mut mem)
                .drives
                .is_empty()
        };
        assert!(step(1.0, 0.0));
        assert!(step(0.0, 0.0));
        assert!(!step(1.0, 1.0));
        assert!(!step(0.0, 0.0));
    }

    #[test]
    fn math_clamps_and_drives_analog() {
        let rules = rules(json!([{
            "id": "m", "type": "MATH", "schema": 2,
            "config": {"input": "temp", "map": {"kind": "linear", "gain": 0.05}, "max": 5.0,
                       "output": "gauge", "store": "scaled"}
        }]));
        let mut mem = LogicMemory::default();
        let out = run(&samples(&[("temp", 200.0)]), &rules, 0, &[], None, &mut mem);
        assert_eq!(out.drives.get("gauge"), Some(&Drive::Analog(5.0)));
        assert_eq!(mem.variables["scaled"], 5.0);
    }

    #[test]
    fn tx_then_rx_round_trip_through_memory() {
        let tx = rules(json!([{
            "id": "tx", "type": "CAN_TX", "schema": 2,
            "config": {"id": 0x100, "bytes": {"0": 0xAA},
                       "fields": [{"index": 1, "source": "speed", "scale": 0.5}],
                       "signals": {"speed": "speed"}}
        }]));
        let mut tx_mem = LogicMemory::default();
        let out = run(&samples(&[("speed", 100.0)]), &tx, 50, &[], Some(0x21), &mut tx_mem);
        let Transmit::Once(message) = &out.messages[0] else {
            panic!("expected one-shot frame")
        };
        assert_eq!(message.frame.payload(), &[0xAA, 50]);
        assert_eq!(message.frame.source_address, Some(0x21));

        let rx = rules(json!([{
            "id": "rx", "type": "CAN_RX", "schema": 2,
            "config": {"id": 0x100, "timeout_ms": 500, "output": "warn",
                       "map": {"v": "speed", "raw": {"byte": 1}}}
        }]));
        let mut mem = LogicMemory::default();
        let out = run(&BTreeMap::new(), &rx, 100, &[message.frame.clone()], None, &mut mem);
        assert!(out.drives.contains_key("warn"));
        assert_eq!(mem.variables["v"], 100.0);
        assert_eq!(mem.variables["raw"], 50.0);

        let out = run(&BTreeMap::new(), &rx, 1000, &[], None, &mut mem);
        assert!(out.drives.is_empty());
        assert_eq!(mem.variables["v"], 0.0);
    }

    #[test]
    fn periodic_tx_stops_when_trigger_drops() {
        let tx = rules(json!([{
            "id": "hb", "type": "CAN_TX", "schema": 2,
            "config": {"id": 0x18FF_0021u32, "period_ms": 100,
                       "trigger": {"mode": "active", "source": "ign"}}
        }]));
        let mut mem = LogicMemory::default();
        let out = run(&samples(&[("ign", 12.0)]), &tx, 0, &[], None, &mut mem);
        assert!(matches!(
            &out.messages[0],
            Transmit::Periodic { message, interval_ms: 100 } if message.frame.extended
        ));
        let out = run(&samples(&[("ign", 0.0)]), &tx, 100, &[], None, &mut mem);
        assert!(matches!(out.messages[0], Transmit::StopPeriodic { id: 0x18FF_0021, .. }));
    }

    #[test]
    fn legacy_documents_are_upgraded_before_parsing() {
        let docs = vec![
            json!({"id": "a", "input": "ign", "operator": ">", "threshold": 6.0, "output": "x"}),
            json!({"id": "b", "type": "BOGUS"}),
        ];
        let (rules, errors) = compile_rules(&docs);
        assert_eq!(rules.len(), 1);
        assert_eq!(errors.len(), 1);
    }
}
