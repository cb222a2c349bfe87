//! Wiring aids. They emit no primitives; the net builder merges their
//! terminals by name.

use serde::{Deserialize, Serialize};

use super::{numbered, CompileContext, Device};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelDirection {
    In,
    Out,
    #[default]
    Both,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetLabelParams {
    pub label: String,
    #[serde(default)]
    pub direction: LabelDirection,
}

/// Off-sheet connector: every label with the same name is one net.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetLabel {
    pub params: NetLabelParams,
}

impl NetLabel {
    pub fn new(label: impl Into<String>, direction: LabelDirection) -> Self {
        Self {
            params: NetLabelParams {
                label: label.into(),
                direction,
            },
        }
    }
}

impl Device for NetLabel {
    fn terminals(&self) -> Vec<String> {
        vec!["net".to_string()]
    }

    fn compile(&self, _ctx: &mut CompileContext<'_>) {}
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessParams {
    /// Harness name shared by the matching entry and exit.
    pub harness: String,
    pub pins: usize,
}

/// Where a harness leaves one sheet. Pin `i` joins pin `i` of every exit
/// with the same harness name, up to the smaller pin count.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessEntry {
    pub params: HarnessParams,
}

/// Counterpart of [`HarnessEntry`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessExit {
    pub params: HarnessParams,
}

impl HarnessEntry {
    pub fn new(harness: impl Into<String>, pins: usize) -> Self {
        Self {
            params: HarnessParams {
                harness: harness.into(),
                pins,
            },
        }
    }
}

impl HarnessExit {
    pub fn new(harness: impl Into<String>, pins: usize) -> Self {
        Self {
            params: HarnessParams {
                harness: harness.into(),
                pins,
            },
        }
    }
}

impl Device for HarnessEntry {
    fn terminals(&self) -> Vec<String> {
        numbered("pin", self.params.pins).collect()
    }

    fn compile(&self, _ctx: &mut CompileContext<'_>) {}
}

impl Device for HarnessExit {
    fn terminals(&self) -> Vec<String> {
        numbered("pin", self.params.pins).collect()
    }

    fn compile(&self, _ctx: &mut CompileContext<'_>) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpliceParams {
    pub pins: usize,
}

/// Crimped splice: all pins are one net.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Splice {
    pub params: SpliceParams,
}

impl Device for Splice {
    fn terminals(&self) -> Vec<String> {
        numbered("pin", self.params.pins).collect()
    }

    fn compile(&self, _ctx: &mut CompileContext<'_>) {}
}
