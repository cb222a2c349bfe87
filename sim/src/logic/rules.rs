//! Typed controller rules, parsed from their JSON documents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::Rail;
use crate::error::RuleError;

/// Tolerance for `==` and `!=`.
pub const EQ_EPSILON: f64 = 1e-9;

/// Where a rule reads a number from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Literal(f64),
    Pin { pin: String },
    Var { var: String },
    /// Bare name: a pin if one is sampled under it, else a variable.
    Name(String),
}

/// Values visible to a rule while it runs.
pub struct Env<'a> {
    pub samples: &'a BTreeMap<String, f64>,
    pub variables: &'a BTreeMap<String, f64>,
}

impl Operand {
    /// Unresolved names read as NaN.
    pub fn resolve(&self, env: &Env<'_>) -> f64 {
        let found = match self {
            Operand::Literal(v) => Some(*v),
            Operand::Pin { pin } => env.samples.get(pin).copied(),
            Operand::Var { var } => env.variables.get(var).copied(),
            Operand::Name(name) => env
                .samples
                .get(name)
                .or_else(|| env.variables.get(name))
                .copied(),
        };
        found.unwrap_or(f64::NAN)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = ">=", alias = "gte", alias = "ge")]
    Gte,
    #[serde(rename = "<=", alias = "lte", alias = "le")]
    Lte,
    #[serde(rename = "==", alias = "eq", alias = "=")]
    Eq,
    #[serde(rename = "!=", alias = "ne", alias = "<>")]
    Ne,
}

impl CmpOp {
    /// Any NaN side makes the comparison false, `!=` included.
    pub fn eval(self, left: f64, right: f64) -> bool {
        if left.is_nan() || right.is_nan() {
            return false;
        }
        match self {
            CmpOp::Gt => left > right,
            CmpOp::Lt => left < right,
            CmpOp::Gte => left >= right,
            CmpOp::Lte => left <= right,
            CmpOp::Eq => (left - right).abs() <= EQ_EPSILON,
            CmpOp::Ne => (left - right).abs() > EQ_EPSILON,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub left: Operand,
    pub op: CmpOp,
    pub right: Operand,
}

impl Condition {
    pub fn holds(&self, env: &Env<'_>) -> bool {
        self.op.eval(self.left.resolve(env), self.right.resolve(env))
    }
}

fn default_active_threshold() -> f64 {
    2.5
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    Always,
    /// Source above a threshold, like a logic-level pin.
    Active {
        source: Operand,
        #[serde(default = "default_active_threshold")]
        threshold: f64,
    },
    Compare(Condition),
}

impl Trigger {
    pub fn fires(&self, env: &Env<'_>) -> bool {
        match self {
            Trigger::Always => true,
            Trigger::Active { source, threshold } => source.resolve(env) > *threshold,
            Trigger::Compare(condition) => condition.holds(env),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompareConfig {
    pub left: Operand,
    pub op: CmpOp,
    pub right: Operand,
    /// Extra conditions AND-ed with the main one.
    #[serde(default)]
    pub all: Vec<Condition>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub rail: Rail,
    #[serde(default)]
    pub store: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerMode {
    #[default]
    DelayOn,
    DelayOff,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerConfig {
    pub trigger: Trigger,
    #[serde(default)]
    pub mode: TimerMode,
    pub duration_ms: u64,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub rail: Rail,
    #[serde(default)]
    pub store: Option<String>,
}

fn default_latch_threshold() -> f64 {
    0.5
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatchConfig {
    pub set: Operand,
    #[serde(default = "default_latch_threshold")]
    pub set_threshold: f64,
    pub reset: Operand,
    #[serde(default = "default_latch_threshold")]
    pub reset_threshold: f64,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub rail: Rail,
    #[serde(default)]
    pub store: Option<String>,
}

fn one() -> f64 {
    1.0
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MathMap {
    Linear {
        #[serde(default = "one")]
        gain: f64,
        #[serde(default)]
        offset: f64,
    },
    /// Maps `[in_min, in_max]` onto `[out_min, out_max]`.
    Range {
        in_min: f64,
        in_max: f64,
        out_min: f64,
        out_max: f64,
    },
}

impl Default for MathMap {
    fn default() -> Self {
        MathMap::Linear {
            gain: 1.0,
            offset: 0.0,
        }
    }
}

impl MathMap {
    pub fn apply(&self, value: f64) -> f64 {
        match *self {
            MathMap::Linear { gain, offset } => value * gain + offset,
            MathMap::Range {
                in_min,
                in_max,
                out_min,
                out_max,
            } => {
                let span = in_max - in_min;
                if span.abs() < f64::EPSILON {
                    out_min
                } else {
                    out_min + (value - in_min) / span * (out_max - out_min)
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MathConfig {
    pub input: Operand,
    #[serde(default)]
    pub map: MathMap,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Output pin driven to the result as an analog level.
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub store: Option<String>,
}

/// One payload byte filled from an operand: `round(v * scale + offset)`,
/// saturated to `0..=255`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ByteField {
    pub index: u8,
    pub source: Operand,
    #[serde(default = "one")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanTxConfig {
    pub id: u32,
    #[serde(default)]
    pub extended: bool,
    /// Arbitration priority; derived from the identifier when absent.
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub trigger: Trigger,
    /// Fixed bytes by index.
    #[serde(default)]
    pub bytes: BTreeMap<u8, u8>,
    #[serde(default)]
    pub fields: Vec<ByteField>,
    /// Symbolic values readable by CAN_RX label mappings.
    #[serde(default)]
    pub signals: BTreeMap<String, Operand>,
    /// Payload length; defaults to one past the highest byte written.
    #[serde(default)]
    pub length: Option<u8>,
    /// Registers a periodic message instead of a one-shot frame.
    #[serde(default)]
    pub period_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RxField {
    /// A signal label carried by the frame.
    Label(String),
    /// A payload byte, `data[byte] * scale + offset`.
    Byte {
        byte: u8,
        #[serde(default = "one")]
        scale: f64,
        #[serde(default)]
        offset: f64,
    },
}

fn default_timeout_ms() -> u64 {
    1000
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanRxConfig {
    pub id: u32,
    /// Only frames from this source address.
    #[serde(default)]
    pub source: Option<u8>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub rail: Rail,
    /// Variable name to extracted field.
    #[serde(default)]
    pub map: BTreeMap<String, RxField>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RuleBody {
    Compare(CompareConfig),
    Timer(TimerConfig),
    Latch(LatchConfig),
    Math(MathConfig),
    CanTx(CanTxConfig),
    CanRx(CanRxConfig),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Rule {
    pub id: String,
    pub enabled: bool,
    pub body: RuleBody,
}

pub const RULE_TYPES: [&str; 6] = ["COMPARE", "TIMER", "LATCH", "MATH", "CAN_TX", "CAN_RX"];

fn config<T: serde::de::DeserializeOwned>(id: &str, config: Value) -> Result<T, RuleError> {
    serde_json::from_value(config).map_err(|source| RuleError::InvalidConfig {
        id: id.to_string(),
        source,
    })
}

impl Rule {
    /// Parses one rule document of the current schema.
    pub fn from_doc(doc: &Value) -> Result<Self, RuleError> {
        let id = match doc.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(RuleError::MissingId),
        };
        let kind = doc
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| RuleError::MissingType(id.clone()))?
            .to_ascii_uppercase();
        let enabled = doc.get("enabled").and_then(Value::as_bool).unwrap_or(true);
        let raw = doc
            .get("config")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));

        let body = match kind.as_str() {
            "COMPARE" => RuleBody::Compare(config(&id, raw)?),
            "TIMER" => RuleBody::Timer(config(&id, raw)?),
            "LATCH" => RuleBody::Latch(config(&id, raw)?),
            "MATH" => RuleBody::Math(config(&id, raw)?),
            "CAN_TX" => RuleBody::CanTx(config(&id, raw)?),
            "CAN_RX" => RuleBody::CanRx(config(&id, raw)?),
            _ => return Err(RuleError::UnknownType { id, kind }),
        };
        Ok(Rule { id, enabled, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env<'a>(
        samples: &'a BTreeMap<String, f64>,
        variables: &'a BTreeMap<String, f64>,
    ) -> Env<'a> {
        Env { samples, variables }
    }

    #[test]
    fn operand_shapes_parse() {
        let ops: Vec<Operand> =
            serde_json::from_value(json!([1.5, {"pin": "ign"}, {"var": "x"}, "ign"])).unwrap();
        assert_eq!(ops[0], Operand::Literal(1.5));
        assert_eq!(ops[1], Operand::Pin { pin: "ign".into() });
        assert_eq!(ops[2], Operand::Var { var: "x".into() });
        assert_eq!(ops[3], Operand::Name("ign".into()));
    }

    #[test]
    fn bare_names_prefer_pins() {
        let samples = BTreeMap::from([("x".to_string(), 1.0)]);
        let vars = BTreeMap::from([("x".to_string(), 2.0), ("y".to_string(), 3.0)]);
        let env = env(&samples, &vars);
        assert_eq!(Operand::Name("x".into()).resolve(&env), 1.0);
        assert_eq!(Operand::Name("y".into()).resolve(&env), 3.0);
        assert!(Operand::Name("z".into()).resolve(&env).is_nan());
    }

    #[test]
    fn nan_never_compares_true() {
        for op in [CmpOp::Gt, CmpOp::Lt, CmpOp::Gte, CmpOp::Lte, CmpOp::Eq, CmpOp::Ne] {
            assert!(!op.eval(f64::NAN, 1.0));
            assert!(!op.eval(1.0, f64::NAN));
        }
        assert!(CmpOp::Eq.eval(0.1 + 0.2, 0.3));
        assert!(!CmpOp::Ne.eval(0.1 + 0.2, 0.3));
    }

    #[test]
    fn operator_aliases() {
        let ops: Vec<CmpOp> = serde_json::from_value(json!([">=", "gte", "<>", "="])).unwrap();
        assert_eq!(ops, vec![CmpOp::Gte, CmpOp::Gte, CmpOp::Ne, CmpOp::Eq]);
    }

    #[test]
    fn parses_compare_rule() {
        let rule = Rule::from_doc(&json!({
            "id": "r1",
            "type": "COMPARE",
            "config": {"left": {"pin": "ign"}, "op": ">", "right": 6.0, "output": "lamp"}
        }))
        .unwrap();
        assert!(rule.enabled);
        let RuleBody::Compare(cfg) = rule.body else {
            panic!("wrong body")
        };
        assert_eq!(cfg.output.as_deref(), Some("lamp"));
        assert_eq!(cfg.rail, Rail::Supply);
    }

    #[test]
    fn rejects_malformed_rules() {
        assert!(matches!(
            Rule::from_doc(&json!({"type": "COMPARE"})),
            Err(RuleError::MissingId)
        ));
        assert!(matches!(
            Rule::from_doc(&json!({"id": "a", "config": {}})),
            Err(RuleError::MissingType(_))
        ));
        assert!(matches!(
            Rule::from_doc(&json!({"id": "a", "type": "PID"})),
            Err(RuleError::UnknownType { .. })
        ));
        assert!(matches!(
            Rule::from_doc(&json!({"id": "a", "type": "TIMER", "config": {"trigger": {"mode": "always"}}})),
            Err(RuleError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn range_map_rescales() {
        let map = MathMap::Range {
            in_min: 0.5,
            in_max: 4.5,
            out_min: -40.0,
            out_max: 140.0,
        };
        assert!((map.apply(2.5) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn trigger_modes() {
        let samples = BTreeMap::from([("sw".to_string(), 12.0)]);
        let vars = BTreeMap::new();
        let env = env(&samples, &vars);
        let t: Trigger = serde_json::from_value(json!({"mode": "active", "source": "sw"})).unwrap();
        assert!(t.fires(&env));
        let t: Trigger = serde_json::from_value(
            json!({"mode": "compare", "left": "sw", "op": "<", "right": 5.0}),
        )
        .unwrap();
        assert!(!t.fires(&env));
        assert!(Trigger::default().fires(&env));
    }
}
