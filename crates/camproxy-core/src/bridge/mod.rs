// ── Protocol Bridge ──
//
// The single writer to the NVR. Owns the control-channel session, reconnects
// with backoff, answers NVR requests, advertises stream profiles and forwards
// motion transitions through the notification ledger. Every other component
// talks to it over channels.

pub mod ledger;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::{Value, json};
use strum::Display;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use camproxy_api::protocol::{
    self, ChannelAdvert, HelloParams, MessageFactory, NvrMessage, SnapshotRequest,
    StreamAssignment, functions,
};
use camproxy_api::websocket::{self, NvrEndpoint, NvrReader, NvrWriter};

use crate::config::AdapterConfig;
use crate::error::CoreError;
use crate::events::{EventKind, Transition};
use crate::model::{DesiredState, Health, RelayTarget};
use crate::snapshot::SnapshotResolver;
use crate::supervisor::{HealthUpdate, Supervisor};

pub use ledger::{AckStatus, NotificationLedger, NotificationRecord};

/// How long shutdown waits for the last motion closes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ── Observable state ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot of the adapter for `/health` and logs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdapterStatus {
    pub connection: ConnectionState,
    pub profiles: BTreeMap<String, Health>,
    pub classification: Option<EventKind>,
    pub pending_notifications: usize,
}

// ── Frame sink ───────────────────────────────────────────────────────

/// Outgoing half of a control session.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, message: &NvrMessage) -> Result<(), camproxy_api::Error>;
}

#[async_trait]
impl FrameSink for NvrWriter {
    async fn send_frame(&mut self, message: &NvrMessage) -> Result<(), camproxy_api::Error> {
        self.send(message).await
    }
}

// ── Requests ─────────────────────────────────────────────────────────

/// What an incoming frame asks of us.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ParamAgreement,
    TimeSync,
    VideoSettings(Vec<StreamAssignment>),
    Snapshot(Option<SnapshotRequest>),
    Reboot,
    Other,
}

impl Request {
    pub fn classify(message: &NvrMessage) -> Self {
        match message.function_name.as_str() {
            functions::PARAM_AGREEMENT => Self::ParamAgreement,
            functions::TIME_SYNC => Self::TimeSync,
            functions::CHANGE_VIDEO_SETTINGS => {
                Self::VideoSettings(protocol::parse_stream_assignments(&message.payload))
            }
            functions::GET_REQUEST => {
                Self::Snapshot(protocol::parse_snapshot_request(&message.payload))
            }
            functions::REBOOT => Self::Reboot,
            _ => Self::Other,
        }
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// Channels the bridge consumes and publishes on.
pub struct BridgeChannels {
    pub transitions: mpsc::Receiver<Transition>,
    pub health: mpsc::UnboundedReceiver<HealthUpdate>,
    pub status: watch::Sender<AdapterStatus>,
}

// ── Bridge ───────────────────────────────────────────────────────────

pub struct Bridge {
    config: Arc<AdapterConfig>,
    endpoint: NvrEndpoint,
    supervisor: Supervisor,
    snapshots: SnapshotResolver,
    http: reqwest::Client,
    transitions: mpsc::Receiver<Transition>,
    health: mpsc::UnboundedReceiver<HealthUpdate>,
    status: watch::Sender<AdapterStatus>,
    ledger: NotificationLedger,
    factory: MessageFactory,
    targets: BTreeMap<String, RelayTarget>,
    advertised: Option<BTreeMap<String, bool>>,
    started: Instant,
}

impl Bridge {
    pub fn new(
        config: Arc<AdapterConfig>,
        endpoint: NvrEndpoint,
        supervisor: Supervisor,
        snapshots: SnapshotResolver,
        http: reqwest::Client,
        channels: BridgeChannels,
    ) -> Self {
        let BridgeChannels {
            transitions,
            health,
            status,
        } = channels;
        status.send_modify(|s| s.profiles = supervisor.health_snapshot());
        Self {
            config,
            endpoint,
            supervisor,
            snapshots,
            http,
            transitions,
            health,
            status,
            ledger: NotificationLedger::new(),
            factory: MessageFactory::new(),
            targets: BTreeMap::new(),
            advertised: None,
            started: Instant::now(),
        }
    }

    /// Keep a session up until `cancel` fires:
    /// `Disconnected -> Connecting -> Connected -> Disconnected -> ...`.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut attempt = 0u32;

        loop {
            self.set_connection(ConnectionState::Connecting);
            info!(host = %self.endpoint.host, port = self.endpoint.port, "connecting to NVR");

            let connected = tokio::select! {
                () = cancel.cancelled() => break,
                connected = websocket::connect(&self.endpoint) => connected,
            };

            match connected {
                Ok((mut writer, mut reader)) => {
                    attempt = 0;
                    self.set_connection(ConnectionState::Connected);
                    info!("NVR session established");
                    let end = self.session(&mut writer, &mut reader, &cancel).await;
                    self.set_connection(ConnectionState::Disconnected);
                    match end {
                        SessionEnd::Shutdown => {
                            writer.close().await;
                            break;
                        }
                        SessionEnd::Lost(reason) => warn!(reason = %reason, "NVR session lost"),
                    }
                }
                Err(e) => {
                    self.set_connection(ConnectionState::Disconnected);
                    let err = CoreError::from(e);
                    warn!(error = %err, "NVR connection failed");
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = self.config.nvr.reconnect.delay(attempt);
            info!(attempt, delay_ms = delay.as_millis(), "reconnecting to NVR");
            if self.idle(delay, &cancel).await {
                break;
            }
        }

        self.set_connection(ConnectionState::Disconnected);
        info!("bridge stopped");
    }

    async fn session(
        &mut self,
        writer: &mut dyn FrameSink,
        reader: &mut NvrReader,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        if let Err(e) = self.greet(writer).await {
            return SessionEnd::Lost(e.to_string());
        }
        let mut uploads: JoinSet<Result<(), CoreError>> = JoinSet::new();

        loop {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.drain(writer).await;
                    return SessionEnd::Shutdown;
                }
                frame = reader.next_message() => match frame {
                    None => return SessionEnd::Lost("closed by NVR".into()),
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    Some(Ok(message)) => self.handle(message, writer, &mut uploads).await,
                },
                Some(transition) = self.transitions.recv() => {
                    self.note_transition(&transition);
                    self.flush(writer).await
                }
                Some(update) = self.health.recv() => {
                    self.note_health(&update);
                    self.advertise(writer, false).await
                }
                Some(done) = uploads.join_next() => {
                    match done {
                        Ok(Ok(())) => debug!("snapshot delivered"),
                        Ok(Err(e)) => warn!(error = %e, "snapshot request failed"),
                        Err(e) => warn!(error = %e, "snapshot task aborted"),
                    }
                    Ok(())
                }
            };
            if let Err(e) = outcome {
                return SessionEnd::Lost(e.to_string());
            }
        }
    }

    /// Hello, advertisement, then any notifications queued while offline.
    async fn greet(&mut self, writer: &mut dyn FrameSink) -> Result<(), camproxy_api::Error> {
        let hello = self.factory.notify(functions::HELLO, self.hello());
        writer.send_frame(&hello).await?;
        self.advertise(writer, true).await?;
        self.flush(writer).await
    }

    fn hello(&self) -> Value {
        let config = &self.config;
        let ip = config.device.ip.to_string();
        protocol::hello_payload(&HelloParams {
            adoption_code: self.endpoint.token.expose_secret(),
            connection_host: &config.nvr.host,
            connection_port: config.nvr.port,
            firmware_version: &config.nvr.firmware_version,
            ip: &ip,
            mac: config.device.mac.as_str(),
            model: &config.device.model,
            name: &config.device.name,
            uptime_secs: self.started.elapsed().as_secs(),
            smart_detect: config.camera.capability.onvif_events()
                || config.events.http_bind.is_some(),
        })
    }

    async fn handle(
        &mut self,
        message: NvrMessage,
        writer: &mut dyn FrameSink,
        uploads: &mut JoinSet<Result<(), CoreError>>,
    ) -> Result<(), camproxy_api::Error> {
        debug!(function = %message.function_name, id = message.message_id, "NVR request");
        let id = message.message_id;

        let reply = match Request::classify(&message) {
            Request::ParamAgreement => Some(self.factory.response(
                functions::PARAM_AGREEMENT,
                id,
                json!({ "authToken": self.endpoint.token.expose_secret(), "features": {} }),
            )),
            Request::TimeSync => {
                let uptime_ms =
                    u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
                Some(self.factory.response(
                    functions::TIME_SYNC,
                    id,
                    json!({ "t1": uptime_ms, "t2": uptime_ms }),
                ))
            }
            Request::VideoSettings(assignments) => {
                self.apply_assignments(assignments).await;
                Some(self.factory.response(
                    functions::CHANGE_VIDEO_SETTINGS,
                    id,
                    self.video_settings(),
                ))
            }
            Request::Snapshot(Some(request)) => {
                let resolver = self.snapshots.clone();
                let http = self.http.clone();
                uploads.spawn(async move {
                    let image = resolver.get_snapshot(None).await?;
                    camproxy_api::http::upload_snapshot(
                        &http,
                        &request.upload_uri,
                        image,
                        &request.form_fields,
                    )
                    .await?;
                    Ok(())
                });
                self.ack(&message)
            }
            Request::Reboot => {
                info!("NVR requested reboot, restarting relays");
                let supervisor = self.supervisor.clone();
                tokio::spawn(async move { supervisor.restart_all().await });
                self.ack(&message)
            }
            Request::Snapshot(None) | Request::Other => self.ack(&message),
        };

        if let Some(reply) = reply {
            writer.send_frame(&reply).await?;
        }
        Ok(())
    }

    /// Empty acknowledgement, only when the NVR asked for one.
    fn ack(&self, message: &NvrMessage) -> Option<NvrMessage> {
        message.response_expected.then(|| {
            self.factory
                .response(&message.function_name, message.message_id, json!({}))
        })
    }

    async fn apply_assignments(&mut self, assignments: Vec<StreamAssignment>) {
        for assignment in assignments {
            let Some(profile) = self
                .config
                .streams
                .iter()
                .find(|p| p.channel == assignment.channel)
            else {
                debug!(channel = %assignment.channel, "no profile for channel");
                continue;
            };
            let Some(destination) = assignment.destination else {
                info!(profile = %profile.id, "NVR disabled stream");
                self.targets.remove(&profile.id);
                if let Err(e) = self
                    .supervisor
                    .set_desired_state(&profile.id, DesiredState::Stopped)
                    .await
                {
                    warn!(profile = %profile.id, error = %e, "cannot stop relay");
                }
                continue;
            };
            let target = RelayTarget {
                destination,
                stream_name: assignment.stream_name.unwrap_or_else(|| profile.id.clone()),
            };
            info!(profile = %profile.id, destination = %target.destination, "NVR assigned stream");
            self.targets.insert(profile.id.clone(), target.clone());

            let applied = async {
                self.supervisor.set_target(&profile.id, target).await?;
                self.supervisor
                    .set_desired_state(&profile.id, DesiredState::Running)
                    .await
            };
            if let Err(e) = applied.await {
                warn!(profile = %profile.id, error = %e, "cannot apply stream assignment");
            }
        }
    }

    /// Whether each profile should be offered to the NVR.
    fn availability(&self) -> BTreeMap<String, bool> {
        self.config
            .streams
            .iter()
            .map(|p| {
                let usable = !matches!(
                    self.supervisor.current_health(&p.id),
                    Ok(Health::Failed { .. }) | Err(_)
                );
                (p.id.clone(), usable)
            })
            .collect()
    }

    fn video_settings(&self) -> Value {
        let availability = self.availability();
        let channels: Vec<ChannelAdvert<'_>> = self
            .config
            .streams
            .iter()
            .map(|p| {
                let target = self.targets.get(&p.id);
                ChannelAdvert {
                    channel: &p.channel,
                    enabled: availability.get(&p.id).copied().unwrap_or(false),
                    width: p.video.width,
                    height: p.video.height,
                    fps: p.video.fps,
                    bitrate: p.video.bitrate,
                    destination: target.map(|t| t.destination.as_str()),
                    stream_name: target.map(|t| t.stream_name.as_str()),
                }
            })
            .collect();
        protocol::video_settings_payload(&channels)
    }

    /// Advertise profiles when their availability changed (or always, when
    /// `force` is set).
    async fn advertise(
        &mut self,
        writer: &mut dyn FrameSink,
        force: bool,
    ) -> Result<(), camproxy_api::Error> {
        let availability = self.availability();
        if !force && self.advertised.as_ref() == Some(&availability) {
            return Ok(());
        }
        let message = self
            .factory
            .notify(functions::CHANGE_VIDEO_SETTINGS, self.video_settings());
        writer.send_frame(&message).await?;
        debug!(?availability, "stream profiles advertised");
        self.advertised = Some(availability);
        Ok(())
    }

    async fn flush(&mut self, writer: &mut dyn FrameSink) -> Result<(), camproxy_api::Error> {
        for (key, function_name, payload) in self.ledger.pending() {
            let message = self.factory.notify(function_name, payload);
            writer.send_frame(&message).await?;
            self.ledger.mark_sent(key, Utc::now());
        }
        let pending = self.ledger.pending_count();
        self.status.send_if_modified(|s| {
            let changed = s.pending_notifications != pending;
            s.pending_notifications = pending;
            changed
        });
        Ok(())
    }

    fn note_transition(&mut self, transition: &Transition) {
        if !self.ledger.record(transition) {
            debug!(event_id = transition.event.id, "duplicate transition ignored");
        }
        let classification = transition.classification;
        let pending = self.ledger.pending_count();
        self.status.send_modify(|s| {
            s.classification = classification;
            s.pending_notifications = pending;
        });
    }

    fn note_health(&self, update: &HealthUpdate) {
        self.status.send_modify(|s| {
            s.profiles.insert(update.profile.clone(), update.health.clone());
        });
    }

    fn set_connection(&self, state: ConnectionState) {
        self.status.send_if_modified(|s| {
            let changed = s.connection != state;
            s.connection = state;
            changed
        });
    }

    /// Wait out a reconnect delay while still consuming events and health,
    /// so sources never block on a disconnected NVR. Returns `true` when
    /// cancelled.
    async fn idle(&mut self, delay: Duration, cancel: &CancellationToken) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return true,
                () = &mut sleep => return false,
                Some(transition) = self.transitions.recv() => self.note_transition(&transition),
                Some(update) = self.health.recv() => self.note_health(&update),
            }
        }
    }

    /// Forward the closes the event engine emits while shutting down.
    async fn drain(&mut self, writer: &mut dyn FrameSink) {
        let deadline = tokio::time::sleep(DRAIN_TIMEOUT);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => break,
                transition = self.transitions.recv() => {
                    let Some(transition) = transition else { break };
                    self.note_transition(&transition);
                    if self.flush(writer).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use secrecy::SecretString;

    use super::*;
    use crate::events::{Edge, EventSource, MonotonicClock, MotionEvent};
    use crate::identity::IdentityManager;
    use crate::model::{StreamProfile, Transport, VideoFormat};
    use crate::supervisor::{ExitOutcome, LaunchSpec, RelayLauncher, RelayProcess};

    #[derive(Default)]
    struct RecordingSink {
        frames: Vec<NvrMessage>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_frame(&mut self, message: &NvrMessage) -> Result<(), camproxy_api::Error> {
            self.frames.push(message.clone());
            Ok(())
        }
    }

    struct IdleLauncher;
    struct IdleProcess;

    #[async_trait]
    impl RelayLauncher for IdleLauncher {
        async fn launch(&self, _spec: &LaunchSpec) -> Result<Box<dyn RelayProcess>, CoreError> {
            Ok(Box::new(IdleProcess))
        }
    }

    #[async_trait]
    impl RelayProcess for IdleProcess {
        fn id(&self) -> Option<u32> {
            None
        }
        async fn wait(&mut self) -> ExitOutcome {
            std::future::pending().await
        }
        async fn terminate(&mut self, _grace: Duration) -> ExitOutcome {
            ExitOutcome::Signaled(15)
        }
    }

    struct Harness {
        bridge: Bridge,
        transitions: mpsc::Sender<Transition>,
        status: watch::Receiver<AdapterStatus>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let material = IdentityManager::new(dir.path().join("client.pem"))
            .ensure_identity()
            .unwrap();

        let mut config = AdapterConfig::default();
        config.nvr.host = "192.168.1.1".into();
        config.streams = vec![StreamProfile {
            id: "main".into(),
            channel: "video1".into(),
            source: "rtsp://cam/stream1".into(),
            transport: Transport::Tcp,
            relay_args: Vec::new(),
            video: VideoFormat::for_channel("video1"),
        }];
        let config = Arc::new(config);

        let (supervisor, health) = Supervisor::new(
            config.relay.clone(),
            config.streams.clone(),
            Arc::new(IdleLauncher),
        );
        let (tx, transitions) = mpsc::channel(16);
        let (status_tx, status) = watch::channel(AdapterStatus::default());
        let endpoint = NvrEndpoint {
            host: config.nvr.host.clone(),
            port: config.nvr.port,
            token: SecretString::from("adopt-me"),
            mac: config.device.mac.as_str().to_owned(),
            tls: material.tls_config().unwrap(),
            connect_timeout: config.nvr.connect_timeout,
        };
        let http = reqwest::Client::new();
        let snapshots = SnapshotResolver::new(http.clone(), &config, None);
        let bridge = Bridge::new(
            config,
            endpoint,
            supervisor,
            snapshots,
            http,
            BridgeChannels {
                transitions,
                health,
                status: status_tx,
            },
        );
        Harness {
            bridge,
            transitions: tx,
            status,
            _dir: dir,
        }
    }

    fn request(function: &str, id: u64, payload: Value) -> NvrMessage {
        NvrMessage {
            from: protocol::NVR_TAG.into(),
            to: protocol::CLIENT_TAG.into(),
            function_name: function.into(),
            message_id: id,
            in_response_to: 0,
            response_expected: true,
            payload,
        }
    }

    fn motion(id: u64, edge: Edge) -> Transition {
        let clock = MonotonicClock::new();
        Transition {
            edge,
            event: MotionEvent {
                id,
                source: EventSource::Onvif,
                kind: EventKind::Motion,
                started_at: clock.at(Duration::from_secs(1)),
                ended_at: (edge == Edge::Closed).then(|| clock.at(Duration::from_secs(3))),
            },
            classification: (edge == Edge::Opened).then_some(EventKind::Motion),
        }
    }

    #[test]
    fn classifies_requests() {
        assert_eq!(
            Request::classify(&request(functions::TIME_SYNC, 1, json!({}))),
            Request::TimeSync
        );
        assert_eq!(
            Request::classify(&request(
                functions::GET_REQUEST,
                2,
                json!({ "what": "snapshot", "uri": "https://nvr/upload" })
            )),
            Request::Snapshot(Some(SnapshotRequest {
                upload_uri: "https://nvr/upload".into(),
                form_fields: Vec::new(),
            }))
        );
        assert_eq!(
            Request::classify(&request("ChangeIspSettings", 3, json!({}))),
            Request::Other
        );
    }

    #[tokio::test]
    async fn greeting_sends_hello_then_advertisement() {
        let mut h = harness();
        let mut sink = RecordingSink::default();
        h.bridge.greet(&mut sink).await.unwrap();

        assert_eq!(sink.frames[0].function_name, functions::HELLO);
        assert_eq!(sink.frames[0].payload["adoptionCode"], "adopt-me");
        assert_eq!(sink.frames[0].payload["mac"], "AABBCCDDEEFF");
        assert_eq!(sink.frames[1].function_name, functions::CHANGE_VIDEO_SETTINGS);
        assert_eq!(sink.frames[1].payload["video"]["video1"]["enabled"], true);
        assert_eq!(sink.frames.len(), 2);
    }

    #[tokio::test]
    async fn video_settings_assign_relay_target_and_reply() {
        let mut h = harness();
        let mut sink = RecordingSink::default();
        let mut uploads = JoinSet::new();
        let payload = json!({
            "video": {
                "video1": {
                    "avSerializer": {
                        "destinations": ["tcp://192.168.1.1:7550?retryInterval=1&connectTimeout=5"],
                        "parameters": { "streamName": "xyz789" }
                    }
                }
            }
        });

        h.bridge
            .handle(
                request(functions::CHANGE_VIDEO_SETTINGS, 11, payload),
                &mut sink,
                &mut uploads,
            )
            .await
            .unwrap();

        let reply = &sink.frames[0];
        assert_eq!(reply.in_response_to, 11);
        assert_eq!(
            reply.payload["video"]["video1"]["avSerializer"]["parameters"]["streamName"],
            "xyz789"
        );
        assert_eq!(
            h.bridge.targets.get("main").unwrap().destination,
            "192.168.1.1:7550"
        );
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            h.bridge.supervisor.current_health("main").unwrap(),
            Health::Starting | Health::Running
        ));
        h.bridge.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_channel_stops_its_relay() {
        let mut h = harness();
        let mut sink = RecordingSink::default();
        let mut uploads = JoinSet::new();
        let settings = |destination: &str| {
            json!({
                "video": {
                    "video1": {
                        "avSerializer": {
                            "destinations": [destination],
                            "parameters": { "streamName": "xyz789" }
                        }
                    }
                }
            })
        };

        let assign = settings("tcp://192.168.1.1:7550?retryInterval=1&connectTimeout=5");
        h.bridge
            .handle(
                request(functions::CHANGE_VIDEO_SETTINGS, 11, assign),
                &mut sink,
                &mut uploads,
            )
            .await
            .unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            h.bridge.supervisor.current_health("main").unwrap(),
            Health::Starting | Health::Running
        ));

        h.bridge
            .handle(
                request(functions::CHANGE_VIDEO_SETTINGS, 12, settings("file:///dev/null")),
                &mut sink,
                &mut uploads,
            )
            .await
            .unwrap();

        assert_eq!(
            h.bridge.supervisor.current_health("main").unwrap(),
            Health::Stopped
        );
        assert!(!h.bridge.targets.contains_key("main"));
        let reply = &sink.frames[1];
        assert_eq!(reply.in_response_to, 12);
        assert!(
            reply.payload["video"]["video1"]["avSerializer"]["destinations"]
                .as_array()
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn unknown_request_is_acknowledged_only_when_expected() {
        let mut h = harness();
        let mut sink = RecordingSink::default();
        let mut uploads = JoinSet::new();

        let mut quiet = request("ChangeOsdSettings", 5, json!({}));
        quiet.response_expected = false;
        h.bridge.handle(quiet, &mut sink, &mut uploads).await.unwrap();
        assert!(sink.frames.is_empty());

        h.bridge
            .handle(request("ChangeOsdSettings", 6, json!({})), &mut sink, &mut uploads)
            .await
            .unwrap();
        assert_eq!(sink.frames[0].in_response_to, 6);
        assert_eq!(sink.frames[0].function_name, "ChangeOsdSettings");
    }

    #[tokio::test]
    async fn offline_events_are_replayed_once_after_reconnect() {
        let mut h = harness();
        h.transitions.send(motion(1, Edge::Opened)).await.unwrap();
        h.transitions.send(motion(1, Edge::Closed)).await.unwrap();

        // Disconnected: events are queued, not lost.
        let cancel = CancellationToken::new();
        assert!(!h.bridge.idle(Duration::from_millis(50), &cancel).await);
        assert_eq!(h.status.borrow().pending_notifications, 2);

        let mut sink = RecordingSink::default();
        h.bridge.greet(&mut sink).await.unwrap();
        let events: Vec<_> = sink
            .frames
            .iter()
            .filter(|f| f.function_name == functions::EVENT_ANALYTICS)
            .map(|f| f.payload["edgeType"].clone())
            .collect();
        assert_eq!(events, vec![json!("start"), json!("stop")]);
        assert_eq!(h.status.borrow().pending_notifications, 0);

        // A second session, or a duplicate transition, sends nothing new.
        h.transitions.send(motion(1, Edge::Closed)).await.unwrap();
        assert!(!h.bridge.idle(Duration::from_millis(50), &cancel).await);
        let mut again = RecordingSink::default();
        h.bridge.greet(&mut again).await.unwrap();
        assert!(
            again
                .frames
                .iter()
                .all(|f| f.function_name != functions::EVENT_ANALYTICS)
        );
    }

    #[tokio::test]
    async fn advertisement_repeats_only_on_availability_change() {
        let mut h = harness();
        let mut sink = RecordingSink::default();
        h.bridge.advertise(&mut sink, true).await.unwrap();
        assert_eq!(sink.frames.len(), 1);

        // Same availability: nothing to say.
        h.bridge.advertise(&mut sink, false).await.unwrap();
        assert_eq!(sink.frames.len(), 1);

        h.bridge.note_health(&HealthUpdate {
            profile: "main".into(),
            health: Health::Running,
        });
        assert_eq!(h.status.borrow().profiles["main"], Health::Running);
    }
}
