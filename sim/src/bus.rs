//! In-vehicle bus: frames, per-bus arbitration and the diagnostic service
//! handler.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::diagnostics::Diagnostics;

/// Read trouble codes by status mask.
pub const SERVICE_READ_DTC: u8 = 0x19;
/// Clear all trouble codes.
pub const SERVICE_CLEAR_DTC: u8 = 0x14;
/// Positive responses echo the service id plus this.
pub const POSITIVE_RESPONSE: u8 = 0x40;
/// Responses go out on the request identifier plus this.
pub const RESPONSE_ID_OFFSET: u32 = 8;
const REPORT_BY_STATUS_MASK: u8 = 0x02;

pub const MAX_STANDARD_ID: u32 = 0x7FF;
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusId(pub String);

impl BusId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for BusId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds a 29-bit identifier from priority (0-7), an 18-bit parameter
/// group number and an 8-bit source address.
pub fn extended_id(priority: u8, pgn: u32, source: u8) -> u32 {
    (u32::from(priority & 0x7) << 26) | ((pgn & 0x3_FFFF) << 8) | u32::from(source)
}

/// The three most significant identifier bits.
pub fn default_priority(id: u32, extended: bool) -> u8 {
    let shift = if extended { 26 } else { 8 };
    ((id >> shift) & 0x7) as u8
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: u32,
    #[serde(default)]
    pub extended: bool,
    pub length: u8,
    pub data: [u8; 8],
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub source_address: Option<u8>,
    /// Symbolic values alongside the payload.
    #[serde(default)]
    pub signals: BTreeMap<String, f64>,
}

impl Frame {
    /// Payload past eight bytes is dropped.
    pub fn new(id: u32, extended: bool, payload: &[u8]) -> Self {
        let mut data = [0; 8];
        let length = payload.len().min(8);
        data[..length].copy_from_slice(&payload[..length]);
        Self {
            id: id & if extended { MAX_EXTENDED_ID } else { MAX_STANDARD_ID },
            extended,
            length: length as u8,
            data,
            timestamp: 0,
            source_address: None,
            signals: BTreeMap::new(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..usize::from(self.length.min(8))]
    }

    pub fn mailbox(&self) -> (u32, Option<u8>) {
        (self.id, self.source_address)
    }
}

/// A frame waiting for the bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedFrame {
    pub priority: u8,
    pub frame: Frame,
}

impl QueuedFrame {
    pub fn new(frame: Frame) -> Self {
        Self {
            priority: default_priority(frame.id, frame.extended),
            frame,
        }
    }
}

/// What a controller asks the bus to do.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Transmit {
    Once(QueuedFrame),
    /// Registers or replaces a periodic message.
    Periodic {
        message: QueuedFrame,
        interval_ms: u64,
    },
    StopPeriodic {
        id: u32,
        source: Option<u8>,
    },
}

#[derive(Clone, Debug, PartialEq)]
struct Periodic {
    message: QueuedFrame,
    interval_ms: u64,
    last_sent: Option<u64>,
}

/// One bus: an outbound queue with one slot per `(id, source)` plus the
/// periodic schedule.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bus {
    queue: Vec<QueuedFrame>,
    periodic: BTreeMap<(u32, Option<u8>), Periodic>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the payload of a frame already queued for the same
    /// `(id, source)`.
    pub fn enqueue(&mut self, message: QueuedFrame) {
        let key = message.frame.mailbox();
        match self.queue.iter_mut().find(|q| q.frame.mailbox() == key) {
            Some(slot) => *slot = message,
            None => self.queue.push(message),
        }
    }

    pub fn submit(&mut self, transmit: Transmit) {
        match transmit {
            Transmit::Once(message) => self.enqueue(message),
            Transmit::Periodic {
                message,
                interval_ms,
            } => {
                let key = message.frame.mailbox();
                let last_sent = self.periodic.get(&key).and_then(|p| p.last_sent);
                self.periodic.insert(
                    key,
                    Periodic {
                        message,
                        interval_ms,
                        last_sent,
                    },
                );
            }
            Transmit::StopPeriodic { id, source } => {
                self.periodic.remove(&(id, source));
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn periodic_count(&self) -> usize {
        self.periodic.len()
    }

    /// Queues due periodic messages, then delivers the arbitration winner
    /// among ready frames: lowest `(priority, id)`. Losers stay queued.
    pub fn tick(&mut self, now: u64) -> Option<Frame> {
        let mut due = Vec::new();
        for periodic in self.periodic.values_mut() {
            let elapsed = periodic
                .last_sent
                .map_or(true, |last| now.saturating_sub(last) >= periodic.interval_ms);
            if elapsed {
                periodic.last_sent = Some(now);
                let mut message = periodic.message.clone();
                message.frame.timestamp = now;
                due.push(message);
            }
        }
        for message in due {
            self.enqueue(message);
        }

        let winner = self
            .queue
            .iter()
            .enumerate()
            .filter(|(_, q)| q.frame.timestamp <= now)
            .min_by_key(|(_, q)| (q.priority, q.frame.id, q.frame.source_address))
            .map(|(i, _)| i)?;
        let mut frame = self.queue.remove(winner).frame;
        frame.timestamp = now;
        Some(frame)
    }
}

/// Answers a single-frame diagnostic request, or returns `None` for
/// services this handler does not know.
pub fn handle_diagnostic_request(
    request: &Frame,
    diagnostics: &mut Diagnostics,
    source_address: Option<u8>,
    now: u64,
) -> Option<Frame> {
    let payload = request.payload();
    let service = *payload.get(1)?;
    let response_id = request.id.saturating_add(RESPONSE_ID_OFFSET);
    if response_id > MAX_EXTENDED_ID {
        log::warn!("no response identifier above {:#x}", request.id);
        return None;
    }
    // Past the 11-bit range the response moves to a 29-bit identifier.
    let extended = request.extended || response_id > MAX_STANDARD_ID;
    let body: Vec<u8> = match service {
        SERVICE_READ_DTC => {
            let mask = payload.get(3).copied().unwrap_or(0xFF);
            match diagnostics.most_recent(mask) {
                Some(record) => {
                    let [_, hi, mid, lo] = record.code.to_be_bytes();
                    vec![
                        0x07,
                        SERVICE_READ_DTC + POSITIVE_RESPONSE,
                        REPORT_BY_STATUS_MASK,
                        mask,
                        hi,
                        mid,
                        lo,
                        record.status,
                    ]
                }
                None => vec![
                    0x03,
                    SERVICE_READ_DTC + POSITIVE_RESPONSE,
                    REPORT_BY_STATUS_MASK,
                    mask,
                ],
            }
        }
        SERVICE_CLEAR_DTC => {
            diagnostics.clear();
            vec![0x01, SERVICE_CLEAR_DTC + POSITIVE_RESPONSE]
        }
        other => {
            log::debug!("diagnostic service {other:#04x} ignored");
            return None;
        }
    };

    let mut response = Frame::new(response_id, extended, &body);
    response.timestamp = now;
    response.source_address = source_address;
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::FaultMonitor;
    use crate::diagnostics::{CONFIRMED, TEST_FAILED};
    use crate::logic::rules::{CmpOp, Condition, Operand};

    fn frame(id: u32, byte: u8) -> QueuedFrame {
        QueuedFrame::new(Frame::new(id, false, &[byte]))
    }

    #[test]
    fn extended_id_packs_fields() {
        let id = extended_id(3, 0xFEF1, 0x17);
        assert_eq!(id, 0x0CFE_F117);
        assert_eq!(default_priority(id, true), 3);
        assert_eq!(default_priority(0x123, false), 1);
    }

    #[test]
    fn lowest_priority_then_id_wins() {
        let mut bus = Bus::new();
        bus.enqueue(frame(0x300, 1));
        bus.enqueue(frame(0x120, 2));
        bus.enqueue(frame(0x100, 3));
        assert_eq!(bus.tick(0).map(|f| f.id), Some(0x100));
        assert_eq!(bus.tick(1).map(|f| f.id), Some(0x120));
        assert_eq!(bus.tick(2).map(|f| f.id), Some(0x300));
        assert_eq!(bus.tick(3), None);
    }

    #[test]
    fn mailbox_replaces_queued_payload() {
        let mut bus = Bus::new();
        bus.enqueue(frame(0x100, 1));
        bus.enqueue(frame(0x100, 2));
        assert_eq!(bus.pending(), 1);
        assert_eq!(bus.tick(0).unwrap().payload(), &[2]);
    }

    #[test]
    fn future_frames_wait() {
        let mut bus = Bus::new();
        let mut later = frame(0x010, 0);
        later.frame.timestamp = 500;
        bus.enqueue(later);
        bus.enqueue(frame(0x700, 0));
        assert_eq!(bus.tick(100).map(|f| f.id), Some(0x700));
        assert_eq!(bus.tick(200), None);
        assert_eq!(bus.tick(500).map(|f| f.id), Some(0x010));
    }

    #[test]
    fn periodic_messages_follow_interval() {
        let mut bus = Bus::new();
        bus.submit(Transmit::Periodic {
            message: frame(0x200, 7),
            interval_ms: 250,
        });
        let sent: Vec<u64> = (0..10)
            .map(|t| t * 100)
            .filter(|&now| bus.tick(now).is_some())
            .collect();
        assert_eq!(sent, vec![0, 300, 600, 900]);

        bus.submit(Transmit::StopPeriodic {
            id: 0x200,
            source: None,
        });
        assert_eq!(bus.periodic_count(), 0);
    }

    fn faulted() -> Diagnostics {
        let mut diag = Diagnostics::new();
        let monitor = FaultMonitor {
            id: "short".into(),
            dtc: 0x12_34_56,
            condition: Condition {
                left: Operand::Literal(1.0),
                op: CmpOp::Eq,
                right: Operand::Literal(1.0),
            },
            debounce: 1,
            latch: false,
        };
        diag.update(&monitor, true, 10);
        diag
    }

    #[test]
    fn read_dtc_reports_latest_record() {
        let mut diag = faulted();
        let request = Frame::new(0x7E0, false, &[0x03, 0x19, 0x02, 0xFF]);
        let response = handle_diagnostic_request(&request, &mut diag, Some(0x10), 20).unwrap();
        assert_eq!(response.id, 0x7E8);
        assert_eq!(
            response.payload(),
            &[0x07, 0x59, 0x02, 0xFF, 0x12, 0x34, 0x56, TEST_FAILED | CONFIRMED]
        );
    }

    #[test]
    fn read_dtc_with_no_records() {
        let mut diag = Diagnostics::new();
        let request = Frame::new(0x7E0, false, &[0x03, 0x19, 0x02, 0xFF]);
        let response = handle_diagnostic_request(&request, &mut diag, None, 0).unwrap();
        assert_eq!(response.payload(), &[0x03, 0x59, 0x02, 0xFF]);
    }

    #[test]
    fn clear_dtc_empties_records() {
        let mut diag = faulted();
        let request = Frame::new(0x7E0, false, &[0x01, 0x14]);
        let response = handle_diagnostic_request(&request, &mut diag, None, 0).unwrap();
        assert_eq!(response.payload(), &[0x01, 0x54]);
        assert_eq!(diag.records().count(), 0);
    }

    #[test]
    fn response_past_standard_range_goes_extended() {
        let mut diag = Diagnostics::new();
        let request = Frame::new(0x7FC, false, &[0x03, 0x19, 0x02, 0xFF]);
        let response = handle_diagnostic_request(&request, &mut diag, None, 0).unwrap();
        assert_eq!(response.id, 0x804);
        assert!(response.extended);

        let mut diag = faulted();
        let request = Frame::new(MAX_EXTENDED_ID - 2, true, &[0x01, 0x14]);
        assert!(handle_diagnostic_request(&request, &mut diag, None, 0).is_none());
        assert_eq!(diag.records().count(), 1);
    }

    #[test]
    fn unknown_service_is_ignored() {
        let mut diag = Diagnostics::new();
        let request = Frame::new(0x7E0, false, &[0x02, 0x10, 0x03]);
        assert!(handle_diagnostic_request(&request, &mut diag, None, 0).is_none());
    }
}
