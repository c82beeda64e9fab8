//! Notification ledger: one record per (event id, edge), in emission order.
//!
//! A record is `Pending` until its frame has been written to a live session.
//! After a reconnect only pending records are replayed, and a transition
//! seen twice is recorded once, so the NVR is never notified twice.
//!
//! When the backlog overflows, an unsent open is dropped together with its
//! close, and a close arriving later for that event is refused. The NVR
//! never sees a stop without its start.

use chrono::{DateTime, Utc};
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use camproxy_api::protocol::{self, EventClock, functions};

use crate::events::{Edge, EventKind, Stamp, Transition};

/// Records kept once sent, for duplicate detection.
const RETAIN_SENT: usize = 256;
/// Hard cap on records, pending included.
const CAPACITY: usize = 1024;

pub type RecordKey = (u64, Edge);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Pending,
    Sent,
}

#[derive(Debug, Clone)]
pub struct NotificationRecord {
    pub event_id: u64,
    pub edge: Edge,
    pub function_name: &'static str,
    pub payload: Value,
    pub sent_at: Option<DateTime<Utc>>,
    pub ack: AckStatus,
}

#[derive(Debug, Default)]
pub struct NotificationLedger {
    records: IndexMap<RecordKey, NotificationRecord>,
    /// Events whose open was dropped unsent.
    dropped: IndexSet<u64>,
}

impl NotificationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transition. Returns `false` if it was already recorded, or
    /// if it closes an event whose open was dropped.
    pub fn record(&mut self, transition: &Transition) -> bool {
        let key = (transition.event.id, transition.edge);
        if self.records.contains_key(&key) {
            return false;
        }
        if self.dropped.contains(&transition.event.id) {
            debug!(event_id = key.0, edge = %key.1, "event was dropped unsent, ignoring");
            return false;
        }
        let (function_name, payload) = notification_for(transition);
        self.records.insert(
            key,
            NotificationRecord {
                event_id: transition.event.id,
                edge: transition.edge,
                function_name,
                payload,
                sent_at: None,
                ack: AckStatus::Pending,
            },
        );
        self.prune();
        true
    }

    /// Pending frames in emission order.
    pub fn pending(&self) -> Vec<(RecordKey, &'static str, Value)> {
        self.records
            .iter()
            .filter(|(_, r)| r.ack == AckStatus::Pending)
            .map(|(key, r)| (*key, r.function_name, r.payload.clone()))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.ack == AckStatus::Pending)
            .count()
    }

    pub fn mark_sent(&mut self, key: RecordKey, at: DateTime<Utc>) {
        if let Some(record) = self.records.get_mut(&key) {
            record.ack = AckStatus::Sent;
            record.sent_at = Some(at);
        }
        self.prune();
    }

    pub fn get(&self, key: RecordKey) -> Option<&NotificationRecord> {
        self.records.get(&key)
    }

    fn prune(&mut self) {
        let mut sent = self
            .records
            .values()
            .filter(|r| r.ack == AckStatus::Sent)
            .count();
        while sent > RETAIN_SENT {
            let Some(index) = self.records.values().position(|r| r.ack == AckStatus::Sent) else {
                break;
            };
            self.records.shift_remove_index(index);
            sent -= 1;
        }
        while self.records.len() > CAPACITY {
            let Some(((event_id, edge), record)) = self.records.shift_remove_index(0) else {
                break;
            };
            warn!(event_id, edge = %edge, "notification backlog full, dropping oldest");
            if edge == Edge::Opened && record.ack == AckStatus::Pending {
                self.records.shift_remove(&(event_id, Edge::Closed));
                self.dropped.insert(event_id);
                if self.dropped.len() > CAPACITY {
                    self.dropped.shift_remove_index(0);
                }
            }
        }
    }
}

/// NVR function name and payload for a transition.
pub fn notification_for(transition: &Transition) -> (&'static str, Value) {
    let event = &transition.event;
    let (edge, stamp) = match transition.edge {
        Edge::Opened => (protocol::Edge::Start, event.started_at),
        Edge::Closed => (
            protocol::Edge::Stop,
            event.ended_at.unwrap_or(event.started_at),
        ),
    };
    let clock = clock(stamp);
    match event.kind {
        EventKind::Motion => (
            functions::EVENT_ANALYTICS,
            protocol::motion_payload(event.id, edge, clock),
        ),
        EventKind::Person => (
            functions::EVENT_SMART_DETECT,
            protocol::smart_detect_payload(event.id, edge, "person", clock),
        ),
    }
}

fn clock(stamp: Stamp) -> EventClock {
    EventClock {
        monotonic_ms: u64::try_from(stamp.monotonic.as_millis()).unwrap_or(u64::MAX),
        wall_ms: stamp.wall.timestamp_millis(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::events::{EventSource, MotionEvent};

    fn stamp(secs: u64) -> Stamp {
        Stamp {
            monotonic: Duration::ZERO,
            wall: DateTime::<Utc>::UNIX_EPOCH,
        }
        .after(Duration::from_secs(secs))
    }

    fn transition(id: u64, kind: EventKind, edge: Edge) -> Transition {
        Transition {
            edge,
            event: MotionEvent {
                id,
                source: EventSource::Onvif,
                kind,
                started_at: stamp(10),
                ended_at: (edge == Edge::Closed).then(|| stamp(12)),
            },
            classification: None,
        }
    }

    #[test]
    fn motion_maps_to_analytics_start_stop() {
        let (function, payload) = notification_for(&transition(7, EventKind::Motion, Edge::Opened));
        assert_eq!(function, functions::EVENT_ANALYTICS);
        assert_eq!(payload["edgeType"], "start");
        assert_eq!(payload["eventId"], 7);
        assert_eq!(payload["clockMonotonic"], 10_000);
        assert_eq!(payload["clockWall"], 10_000);

        let (_, payload) = notification_for(&transition(7, EventKind::Motion, Edge::Closed));
        assert_eq!(payload["edgeType"], "stop");
        assert_eq!(payload["clockMonotonic"], 12_000);
    }

    #[test]
    fn person_maps_to_smart_detect_enter_leave() {
        let (function, payload) = notification_for(&transition(3, EventKind::Person, Edge::Opened));
        assert_eq!(function, functions::EVENT_SMART_DETECT);
        assert_eq!(payload["edgeType"], "enter");
        assert_eq!(payload["objectTypes"][0], "person");
    }

    #[test]
    fn duplicate_transition_is_recorded_once() {
        let mut ledger = NotificationLedger::new();
        let open = transition(1, EventKind::Motion, Edge::Opened);
        assert!(ledger.record(&open));
        assert!(!ledger.record(&open));
        assert_eq!(ledger.pending_count(), 1);
    }

    #[test]
    fn sent_records_are_not_replayed() {
        let mut ledger = NotificationLedger::new();
        ledger.record(&transition(1, EventKind::Motion, Edge::Opened));
        ledger.record(&transition(1, EventKind::Motion, Edge::Closed));
        ledger.record(&transition(2, EventKind::Person, Edge::Opened));

        let pending = ledger.pending();
        assert_eq!(
            pending.iter().map(|(key, _, _)| *key).collect::<Vec<_>>(),
            vec![(1, Edge::Opened), (1, Edge::Closed), (2, Edge::Opened)]
        );

        ledger.mark_sent((1, Edge::Opened), Utc::now());
        let pending = ledger.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].0, (1, Edge::Closed));
        assert_eq!(ledger.get((1, Edge::Opened)).unwrap().ack, AckStatus::Sent);

        // Replaying the same open after a reconnect is still a duplicate.
        assert!(!ledger.record(&transition(1, EventKind::Motion, Edge::Opened)));
    }

    #[test]
    fn sent_history_is_bounded() {
        let mut ledger = NotificationLedger::new();
        for id in 0..u64::try_from(RETAIN_SENT + 50).unwrap() {
            ledger.record(&transition(id, EventKind::Motion, Edge::Opened));
            ledger.mark_sent((id, Edge::Opened), Utc::now());
        }
        assert_eq!(ledger.records.len(), RETAIN_SENT);
        assert!(ledger.get((0, Edge::Opened)).is_none());
    }

    #[test]
    fn overflow_never_leaves_a_close_without_its_open() {
        let mut ledger = NotificationLedger::new();
        ledger.record(&transition(1, EventKind::Person, Edge::Opened));
        let pairs = u64::try_from(CAPACITY / 2).unwrap();
        for id in 100..100 + pairs {
            ledger.record(&transition(id, EventKind::Motion, Edge::Opened));
            ledger.record(&transition(id, EventKind::Motion, Edge::Closed));
        }
        assert!(ledger.get((1, Edge::Opened)).is_none());

        // The long-lived event ends while still offline.
        assert!(!ledger.record(&transition(1, EventKind::Person, Edge::Closed)));

        let pending = ledger.pending();
        assert!(pending.len() <= CAPACITY);
        let mut opened = std::collections::HashSet::new();
        for ((id, edge), _, _) in &pending {
            match edge {
                Edge::Opened => {
                    opened.insert(*id);
                }
                Edge::Closed => assert!(opened.contains(id), "close for {id} without open"),
            }
        }
    }

    #[test]
    fn overflow_drops_a_pending_pair_together() {
        let mut ledger = NotificationLedger::new();
        ledger.record(&transition(1, EventKind::Motion, Edge::Opened));
        ledger.record(&transition(1, EventKind::Motion, Edge::Closed));
        for id in 100..100 + u64::try_from(CAPACITY - 1).unwrap() {
            ledger.record(&transition(id, EventKind::Motion, Edge::Opened));
        }
        assert!(ledger.get((1, Edge::Opened)).is_none());
        assert!(ledger.get((1, Edge::Closed)).is_none());
        assert_eq!(ledger.pending_count(), CAPACITY - 1);
    }
}
