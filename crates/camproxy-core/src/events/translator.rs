//! Pure per-(source, kind) event state machine.
//!
//! `Idle -> Active` on a true signal, `Active -> Idle` on a false signal or
//! once the source has been silent for its timeout. Repeated true signals
//! only refresh `last_seen`. The translator owns no clock: callers pass the
//! current [`Stamp`] in, which keeps it deterministic under test.

use std::collections::BTreeMap;
use std::time::Duration;

use super::{Edge, EventKind, EventSource, MotionEvent, RawSignal, Stamp, Transition};

type Key = (EventSource, EventKind);

#[derive(Debug)]
struct OpenEvent {
    event: MotionEvent,
    last_seen: Stamp,
}

#[derive(Debug)]
pub struct Translator {
    inactivity_timeout: Duration,
    trigger_timeout: Duration,
    open: BTreeMap<Key, OpenEvent>,
    next_id: u64,
}

impl Translator {
    /// `inactivity_timeout` closes polled sources; `trigger_timeout` is the
    /// safety net for push sources that forget to send a stop.
    pub fn new(inactivity_timeout: Duration, trigger_timeout: Duration) -> Self {
        Self {
            inactivity_timeout,
            trigger_timeout,
            open: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn timeout_for(&self, source: EventSource) -> Duration {
        if source.is_polled() {
            self.inactivity_timeout
        } else {
            self.trigger_timeout
        }
    }

    fn deadline(&self, key: Key, open: &OpenEvent) -> Stamp {
        open.last_seen.after(self.timeout_for(key.0))
    }

    /// Feed one signal observed at `now`.
    pub fn apply(&mut self, signal: RawSignal, now: Stamp) -> Vec<Transition> {
        let key = (signal.source, signal.kind);
        let mut out = Vec::new();

        // A lapsed event whose timer has not fired yet closes at its deadline
        // before the new signal is considered.
        let lapsed = self
            .open
            .get(&key)
            .map(|open| self.deadline(key, open))
            .filter(|deadline| deadline.monotonic <= now.monotonic);
        if let Some(deadline) = lapsed {
            out.extend(self.close(key, deadline));
        }

        match (signal.active, self.open.get_mut(&key)) {
            (true, Some(open)) => open.last_seen = now,
            (true, None) => {
                let event = MotionEvent {
                    id: self.next_id,
                    source: signal.source,
                    kind: signal.kind,
                    started_at: now,
                    ended_at: None,
                };
                self.next_id += 1;
                self.open.insert(
                    key,
                    OpenEvent {
                        event: event.clone(),
                        last_seen: now,
                    },
                );
                out.push(Transition {
                    edge: Edge::Opened,
                    event,
                    classification: self.classification(),
                });
            }
            (false, Some(_)) => out.extend(self.close(key, now)),
            (false, None) => {}
        }
        out
    }

    /// Close every event whose timeout has passed by `now`, each at its own
    /// deadline, earliest first.
    pub fn expire(&mut self, now: Stamp) -> Vec<Transition> {
        let mut due: Vec<(Stamp, Key)> = self
            .open
            .iter()
            .map(|(key, open)| (self.deadline(*key, open), *key))
            .filter(|(deadline, _)| deadline.monotonic <= now.monotonic)
            .collect();
        due.sort();
        due.into_iter()
            .filter_map(|(deadline, key)| self.close(key, deadline))
            .collect()
    }

    /// Close everything, e.g. on shutdown.
    pub fn close_all(&mut self, now: Stamp) -> Vec<Transition> {
        let mut out = self.expire(now);
        let keys: Vec<Key> = self.open.keys().copied().collect();
        out.extend(keys.into_iter().filter_map(|key| self.close(key, now)));
        out
    }

    /// Monotonic offset of the earliest pending auto-close.
    pub fn next_deadline(&self) -> Option<Duration> {
        self.open
            .iter()
            .map(|(key, open)| self.deadline(*key, open).monotonic)
            .min()
    }

    /// Highest-priority kind with an open event, across all sources.
    pub fn classification(&self) -> Option<EventKind> {
        self.open.keys().map(|(_, kind)| *kind).max()
    }

    pub fn open_events(&self) -> impl Iterator<Item = &MotionEvent> {
        self.open.values().map(|open| &open.event)
    }

    fn close(&mut self, key: Key, at: Stamp) -> Option<Transition> {
        let OpenEvent { mut event, .. } = self.open.remove(&key)?;
        event.ended_at = Some(at.max(event.started_at));
        Some(Transition {
            edge: Edge::Closed,
            event,
            classification: self.classification(),
        })
    }
}
