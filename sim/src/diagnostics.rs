//! Fault debouncing and trouble-code bookkeeping for one controller.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::device::FaultMonitor;

/// Status bits of a [`FaultRecord`].
pub const TEST_FAILED: u8 = 0x01;
pub const PENDING: u8 = 0x04;
pub const CONFIRMED: u8 = 0x08;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultState {
    #[default]
    None,
    /// Counting consecutive ticks towards `Active` (`asserting`) or back
    /// towards `None`.
    Debouncing { asserting: bool, count: u32 },
    Active,
    /// Held until cleared.
    Latched,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    /// 24-bit trouble code.
    pub code: u32,
    pub status: u8,
    /// Last time the fault became active.
    pub timestamp: u64,
    /// How many times the fault became active.
    pub count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    states: BTreeMap<String, FaultState>,
    records: BTreeMap<u32, FaultRecord>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, fault: &str) -> FaultState {
        self.states.get(fault).copied().unwrap_or_default()
    }

    pub fn records(&self) -> impl Iterator<Item = &FaultRecord> {
        self.records.values()
    }

    pub fn record(&self, code: u32) -> Option<&FaultRecord> {
        self.records.get(&code)
    }

    /// Latest record with any status bit in `mask`.
    pub fn most_recent(&self, mask: u8) -> Option<&FaultRecord> {
        self.records
            .values()
            .filter(|r| r.status & mask != 0)
            .max_by_key(|r| (r.timestamp, r.code))
    }

    /// Feeds one raw sample of a monitored condition.
    pub fn update(&mut self, monitor: &FaultMonitor, raw: bool, now: u64) -> FaultState {
        let threshold = monitor.debounce.max(1);
        let current = self.state(&monitor.id);

        let next = match (current, raw) {
            (FaultState::None, false) => FaultState::None,
            (FaultState::None, true) => self.count_up(monitor, true, 1, threshold, now),
            (FaultState::Debouncing { asserting: true, count }, true) => {
                self.count_up(monitor, true, count + 1, threshold, now)
            }
            // Assertion did not persist.
            (FaultState::Debouncing { asserting: true, .. }, false) => FaultState::None,
            (FaultState::Active, true) => FaultState::Active,
            (FaultState::Active, false) => self.count_up(monitor, false, 1, threshold, now),
            (FaultState::Debouncing { asserting: false, count }, false) => {
                self.count_up(monitor, false, count + 1, threshold, now)
            }
            // Came back before healing.
            (FaultState::Debouncing { asserting: false, .. }, true) => FaultState::Active,
            (FaultState::Latched, _) => FaultState::Latched,
        };

        if next != current {
            log::debug!("fault {}: {current:?} -> {next:?}", monitor.id);
        }
        if next == FaultState::None {
            self.states.remove(&monitor.id);
        } else {
            self.states.insert(monitor.id.clone(), next);
        }
        next
    }

    fn count_up(
        &mut self,
        monitor: &FaultMonitor,
        asserting: bool,
        count: u32,
        threshold: u32,
        now: u64,
    ) -> FaultState {
        if count < threshold {
            if asserting {
                if let Some(record) = self.records.get_mut(&monitor.dtc) {
                    record.status |= PENDING;
                }
            }
            return FaultState::Debouncing { asserting, count };
        }
        if asserting {
            self.activate(monitor.dtc, now);
            FaultState::Active
        } else if monitor.latch {
            FaultState::Latched
        } else {
            if let Some(record) = self.records.get_mut(&monitor.dtc) {
                record.status &= !TEST_FAILED;
            }
            FaultState::None
        }
    }

    fn activate(&mut self, code: u32, now: u64) {
        let record = self.records.entry(code).or_insert(FaultRecord {
            code,
            status: 0,
            timestamp: now,
            count: 0,
        });
        record.count += 1;
        record.timestamp = now;
        record.status = (record.status | TEST_FAILED | CONFIRMED) & !PENDING;
    }

    /// Drops every record and releases active and latched faults.
    pub fn clear(&mut self) {
        self.records.clear();
        self.states
            .retain(|_, s| !matches!(s, FaultState::Active | FaultState::Latched));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::rules::{CmpOp, Condition, Operand};

    fn monitor(debounce: u32, latch: bool) -> FaultMonitor {
        FaultMonitor {
            id: "open_load".into(),
            dtc: 0x9A_01_13,
            condition: Condition {
                left: Operand::Name("lamp".into()),
                op: CmpOp::Lt,
                right: Operand::Literal(1.0),
            },
            debounce,
            latch,
        }
    }

    #[test]
    fn debounces_up_and_down() {
        let m = monitor(3, false);
        let mut diag = Diagnostics::new();
        assert_eq!(
            diag.update(&m, true, 0),
            FaultState::Debouncing {
                asserting: true,
                count: 1
            }
        );
        diag.update(&m, true, 100);
        assert!(diag.record(m.dtc).is_none());
        assert_eq!(diag.update(&m, true, 200), FaultState::Active);

        let record = *diag.record(m.dtc).unwrap();
        assert_eq!(record.count, 1);
        assert_eq!(record.timestamp, 200);
        assert_eq!(record.status, TEST_FAILED | CONFIRMED);

        diag.update(&m, false, 300);
        diag.update(&m, false, 400);
        assert_eq!(diag.update(&m, false, 500), FaultState::None);
        let record = diag.record(m.dtc).unwrap();
        assert_eq!(record.status, CONFIRMED);
    }

    #[test]
    fn glitch_shorter_than_debounce_is_ignored() {
        let m = monitor(3, false);
        let mut diag = Diagnostics::new();
        diag.update(&m, true, 0);
        diag.update(&m, true, 100);
        assert_eq!(diag.update(&m, false, 200), FaultState::None);
        assert_eq!(diag.records().count(), 0);
    }

    #[test]
    fn reactivation_increments_count() {
        let m = monitor(1, false);
        let mut diag = Diagnostics::new();
        diag.update(&m, true, 0);
        diag.update(&m, false, 100);
        diag.update(&m, true, 200);
        let record = diag.record(m.dtc).unwrap();
        assert_eq!(record.count, 2);
        assert_eq!(record.timestamp, 200);
    }

    #[test]
    fn latched_fault_needs_clear() {
        let m = monitor(1, true);
        let mut diag = Diagnostics::new();
        diag.update(&m, true, 0);
        assert_eq!(diag.update(&m, false, 100), FaultState::Latched);
        assert_eq!(diag.update(&m, false, 200), FaultState::Latched);

        diag.clear();
        assert_eq!(diag.state(&m.id), FaultState::None);
        assert!(diag.most_recent(0xFF).is_none());
    }
}
