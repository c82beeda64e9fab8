//! Event Translation Engine.
//!
//! Sources (ONVIF poller, HTTP trigger, MQTT when wired) push [`RawSignal`]s
//! into one channel. The [`EventEngine`] task stamps them, runs the
//! per-(source, kind) [`Translator`] and its auto-close timers, and emits an
//! ordered stream of [`Transition`]s to the protocol bridge.

pub mod onvif;
pub mod translator;
pub mod trigger;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use translator::Translator;

/// Where a signal came from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Onvif,
    Http,
    Mqtt,
}

impl EventSource {
    /// Polled sources repeat "true" while active; push sources signal edges.
    pub fn is_polled(self) -> bool {
        matches!(self, Self::Onvif)
    }
}

/// Detection class. Ordered by NVR-facing priority: `Person` outranks `Motion`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    #[default]
    Motion,
    Person,
}

/// Maps one ONVIF notification topic + data key to an event kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pub topic: String,
    pub key: String,
    pub kind: EventKind,
}

impl TopicFilter {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, kind: EventKind) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            kind,
        }
    }

    /// Topic equality ignoring the namespace prefix of the first segment,
    /// which cameras bind to arbitrary prefixes.
    pub fn matches_topic(&self, topic: &str) -> bool {
        strip_prefix(topic.trim()) == strip_prefix(&self.topic)
    }
}

fn strip_prefix(topic: &str) -> &str {
    match topic.split_once(':') {
        Some((prefix, rest)) if !prefix.contains('/') => rest,
        _ => topic,
    }
}

/// A source-level observation: "kind is (not) happening now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSignal {
    pub source: EventSource,
    pub kind: EventKind,
    pub active: bool,
}

impl RawSignal {
    pub fn new(source: EventSource, kind: EventKind, active: bool) -> Self {
        Self {
            source,
            kind,
            active,
        }
    }
}

/// A point in time on both clocks. Ordered by the monotonic component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stamp {
    /// Time since the engine started.
    pub monotonic: Duration,
    pub wall: DateTime<Utc>,
}

impl Stamp {
    /// The same instant shifted by `by` on both clocks.
    pub fn after(self, by: Duration) -> Self {
        let wall = chrono::Duration::from_std(by)
            .ok()
            .and_then(|d| self.wall.checked_add_signed(d))
            .unwrap_or(self.wall);
        Self {
            monotonic: self.monotonic + by,
            wall,
        }
    }
}

/// One detection, open while `ended_at` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionEvent {
    pub id: u64,
    pub source: EventSource,
    pub kind: EventKind,
    pub started_at: Stamp,
    pub ended_at: Option<Stamp>,
}

impl MotionEvent {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.ended_at
            .map(|end| end.monotonic.saturating_sub(self.started_at.monotonic))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Edge {
    Opened,
    Closed,
}

/// An open or close, plus the camera-wide classification right after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub edge: Edge,
    pub event: MotionEvent,
    /// Highest-priority kind still active, if any.
    pub classification: Option<EventKind>,
}

/// Maps tokio's monotonic clock onto wall time captured at construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: Utc::now(),
        }
    }

    pub fn now(&self) -> Stamp {
        self.at(self.origin.elapsed())
    }

    /// Stamp for a monotonic offset from the origin.
    pub fn at(&self, monotonic: Duration) -> Stamp {
        Stamp {
            monotonic: Duration::ZERO,
            wall: self.wall_origin,
        }
        .after(monotonic)
    }

    /// The tokio instant a monotonic offset corresponds to.
    pub fn instant_at(&self, monotonic: Duration) -> Instant {
        self.origin + monotonic
    }
}

/// Sender half handed to every signal source.
pub type SignalSender = mpsc::Sender<RawSignal>;

/// Channel capacity for raw signals.
const SIGNAL_CAPACITY: usize = 256;

pub fn signal_channel() -> (SignalSender, mpsc::Receiver<RawSignal>) {
    mpsc::channel(SIGNAL_CAPACITY)
}

/// The engine task.
pub struct EventEngine {
    translator: Translator,
    clock: MonotonicClock,
    signals: mpsc::Receiver<RawSignal>,
    transitions: mpsc::Sender<Transition>,
}

impl EventEngine {
    pub fn new(
        inactivity_timeout: Duration,
        trigger_timeout: Duration,
        signals: mpsc::Receiver<RawSignal>,
        transitions: mpsc::Sender<Transition>,
    ) -> Self {
        Self {
            translator: Translator::new(inactivity_timeout, trigger_timeout),
            clock: MonotonicClock::new(),
            signals,
            transitions,
        }
    }

    /// Run until cancelled or every signal sender is gone. Open events are
    /// closed on the way out so the bridge never sees a dangling start.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("event engine started");
        loop {
            let deadline = self
                .translator
                .next_deadline()
                .map(|mono| self.clock.instant_at(mono));
            let expiry = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = expiry => {
                    let now = self.clock.now();
                    for transition in self.translator.expire(now) {
                        if !self.forward(transition).await {
                            return;
                        }
                    }
                }
                signal = self.signals.recv() => {
                    let Some(signal) = signal else { break };
                    let now = self.clock.now();
                    debug!(source = %signal.source, kind = %signal.kind, active = signal.active, "raw signal");
                    for transition in self.translator.apply(signal, now) {
                        if !self.forward(transition).await {
                            return;
                        }
                    }
                }
            }
        }

        let now = self.clock.now();
        for transition in self.translator.close_all(now) {
            if !self.forward(transition).await {
                break;
            }
        }
        info!("event engine stopped");
    }

    async fn forward(&self, transition: Transition) -> bool {
        info!(
            event_id = transition.event.id,
            source = %transition.event.source,
            kind = %transition.event.kind,
            edge = %transition.edge,
            "motion event"
        );
        if self.transitions.send(transition).await.is_err() {
            warn!("bridge gone, dropping motion events");
            return false;
        }
        true
    }
}
