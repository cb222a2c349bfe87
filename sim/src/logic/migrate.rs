//! Rule document schema upgrades.
//!
//! Documents carry a `schema` number; a missing one means version 0. Each
//! step moves a document from version `n` to `n + 1` and the chain runs
//! until [`RULE_SCHEMA_VERSION`]. A document already at the current
//! version is left untouched, so upgrading twice is a no-op.

use serde_json::{json, Map, Value};

use super::rules::RULE_TYPES;
use crate::error::MigrationError;

pub const RULE_SCHEMA_VERSION: u64 = 2;

/// Keys that stay at the top level of a rule document.
const ENVELOPE: [&str; 5] = ["id", "type", "schema", "enabled", "config"];

type Step = fn(&mut Map<String, Value>);

/// Step `i` upgrades version `i` to `i + 1`.
const STEPS: [Step; RULE_SCHEMA_VERSION as usize] = [lift_envelope, rename_legacy_fields];

pub fn schema_of(doc: &Value) -> u64 {
    doc.get("schema").and_then(Value::as_u64).unwrap_or(0)
}

/// Upgrades `doc` in place. Returns whether anything changed.
pub fn upgrade(doc: &mut Value) -> Result<bool, MigrationError> {
    let found = schema_of(doc);
    if found > RULE_SCHEMA_VERSION {
        return Err(MigrationError::FromTheFuture {
            found,
            supported: RULE_SCHEMA_VERSION,
        });
    }
    let Value::Object(map) = doc else {
        return Err(MigrationError::NotAnObject);
    };
    if found == RULE_SCHEMA_VERSION {
        return Ok(false);
    }

    for step in &STEPS[found as usize..] {
        step(map);
    }
    map.insert("schema".to_string(), json!(RULE_SCHEMA_VERSION));
    Ok(true)
}

/// v0 -> v1: flat legacy fields move under `config`, and a missing
/// `type` is inferred from the config's keys.
fn lift_envelope(doc: &mut Map<String, Value>) {
    let keys: Vec<String> = doc
        .keys()
        .filter(|k| !ENVELOPE.contains(&k.as_str()))
        .cloned()
        .collect();
    let loose: Vec<(String, Value)> = keys
        .into_iter()
        .filter_map(|k| doc.remove(&k).map(|v| (k, v)))
        .collect();
    if !loose.is_empty() {
        let config = doc
            .entry("config")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(config) = config {
            for (key, value) in loose {
                config.entry(key).or_insert(value);
            }
        }
    }

    match doc
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_ascii_uppercase)
    {
        Some(kind) if RULE_TYPES.contains(&kind.as_str()) => {
            doc.insert("type".to_string(), json!(kind));
        }
        Some(_) => {}
        None => {
            if let Some(kind) = doc.get("config").and_then(infer_type) {
                doc.insert("type".to_string(), json!(kind));
            }
        }
    }
}

fn infer_type(config: &Value) -> Option<&'static str> {
    let has = |key: &str| config.get(key).is_some();
    if has("set") && has("reset") {
        Some("LATCH")
    } else if has("duration_ms") || has("delay") {
        Some("TIMER")
    } else if has("bytes") || has("signals") || has("fields") || has("period_ms") {
        Some("CAN_TX")
    } else if has("timeout_ms") || (has("id") && has("map")) {
        Some("CAN_RX")
    } else if has("input") && !has("operator") && (has("map") || has("gain") || has("offset")) {
        Some("MATH")
    } else if has("left") || has("operator") || has("threshold") {
        Some("COMPARE")
    } else {
        None
    }
}

/// v1 -> v2: legacy COMPARE `input`/`operator`/`threshold` become
/// `left`/`op`/`right`; legacy TIMER `delay` becomes `duration_ms` and a
/// bare `input` becomes an `active` trigger; flat MATH `gain`/`offset`
/// become a linear map.
fn rename_legacy_fields(doc: &mut Map<String, Value>) {
    let kind = doc
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let Some(Value::Object(config)) = doc.get_mut("config") else {
        return;
    };

    match kind.as_str() {
        "COMPARE" => {
            rename(config, "input", "left");
            rename(config, "operator", "op");
            rename(config, "threshold", "right");
        }
        "TIMER" => {
            rename(config, "delay", "duration_ms");
            if !config.contains_key("trigger") {
                if let Some(source) = config.remove("input") {
                    let mut trigger = json!({"mode": "active", "source": source});
                    if let Some(threshold) = config.remove("threshold") {
                        trigger["threshold"] = threshold;
                    }
                    config.insert("trigger".to_string(), trigger);
                }
            }
        }
        "MATH" => {
            let flat = config.contains_key("gain") || config.contains_key("offset");
            if flat && !config.contains_key("map") {
                let gain = config.remove("gain").unwrap_or(json!(1.0));
                let offset = config.remove("offset").unwrap_or(json!(0.0));
                config.insert(
                    "map".to_string(),
                    json!({"kind": "linear", "gain": gain, "offset": offset}),
                );
            }
        }
        _ => {}
    }
}

fn rename(config: &mut Map<String, Value>, from: &str, to: &str) {
    if config.contains_key(to) {
        return;
    }
    if let Some(value) = config.remove(from) {
        config.insert(to.to_string(), value);
    }
}
