//! NVR control-channel message model.
//!
//! Every frame on the camera websocket is a JSON envelope of the shape
//! `{ from, to, functionName, messageId, inResponseTo, responseExpected, payload }`.
//! This module owns the envelope, the function names the adapter speaks,
//! and the payload builders/parsers for the handful of messages whose
//! shape matters to the engine (hello, motion, smart detect, video settings).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use url::Url;

/// Sender tag on every frame the adapter emits.
pub const CLIENT_TAG: &str = "ubnt_avclient";
/// Recipient tag on every frame the adapter emits.
pub const NVR_TAG: &str = "UniFiVideo";
/// Protocol revision announced in the hello.
pub const PROTOCOL_VERSION: u32 = 67;

/// Function names used on the control channel.
pub mod functions {
    pub const HELLO: &str = "ubnt_avclient_hello";
    pub const PARAM_AGREEMENT: &str = "ubnt_avclient_paramAgreement";
    pub const TIME_SYNC: &str = "ubnt_avclient_timeSync";
    pub const CHANGE_VIDEO_SETTINGS: &str = "ChangeVideoSettings";
    pub const GET_REQUEST: &str = "GetRequest";
    pub const REBOOT: &str = "Reboot";
    pub const EVENT_ANALYTICS: &str = "EventAnalytics";
    pub const EVENT_SMART_DETECT: &str = "EventSmartDetect";
}

// ── Envelope ─────────────────────────────────────────────────────────

/// A single control-channel frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NvrMessage {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    pub function_name: String,
    #[serde(default)]
    pub message_id: u64,
    #[serde(default)]
    pub in_response_to: u64,
    #[serde(default)]
    pub response_expected: bool,
    #[serde(default)]
    pub payload: Value,
}

/// Allocates message ids and stamps outgoing envelopes.
#[derive(Debug, Default)]
pub struct MessageFactory {
    next_id: AtomicU64,
}

impl MessageFactory {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// An unsolicited frame from the adapter.
    pub fn notify(&self, function_name: &str, payload: Value) -> NvrMessage {
        self.response(function_name, 0, payload)
    }

    /// A reply to the NVR frame with id `in_response_to`.
    pub fn response(&self, function_name: &str, in_response_to: u64, payload: Value) -> NvrMessage {
        NvrMessage {
            from: CLIENT_TAG.into(),
            to: NVR_TAG.into(),
            function_name: function_name.into(),
            message_id: self.next_id(),
            in_response_to,
            response_expected: false,
            payload,
        }
    }
}

// ── Hello ────────────────────────────────────────────────────────────

/// Parameters announced in `ubnt_avclient_hello`.
#[derive(Debug, Clone)]
pub struct HelloParams<'a> {
    pub adoption_code: &'a str,
    pub connection_host: &'a str,
    pub connection_port: u16,
    pub firmware_version: &'a str,
    pub ip: &'a str,
    pub mac: &'a str,
    pub model: &'a str,
    pub name: &'a str,
    pub uptime_secs: u64,
    pub smart_detect: bool,
}

pub fn hello_payload(params: &HelloParams<'_>) -> Value {
    let smart_detect: Vec<&str> = if params.smart_detect {
        vec!["person"]
    } else {
        Vec::new()
    };

    json!({
        "adoptionCode": params.adoption_code,
        "connectionHost": params.connection_host,
        "connectionSecurePort": params.connection_port,
        "fwVersion": params.firmware_version,
        "hwrev": 19,
        "idleTime": 0,
        "ip": params.ip,
        "mac": params.mac,
        "model": params.model,
        "name": params.name,
        "protocolVersion": PROTOCOL_VERSION,
        "rebootTimeoutSec": 30,
        "semver": "v4.4.8",
        "totalLoad": 0.5,
        "upgradeTimeoutSec": 150,
        "uptime": params.uptime_secs,
        "features": {
            "mic": true,
            "aec": [],
            "videoMode": ["default"],
            "motionDetect": ["enhanced"],
            "smartDetect": smart_detect,
        },
    })
}

// ── Motion ───────────────────────────────────────────────────────────

/// Edge of a motion notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Start,
    Stop,
}

/// Clock readings attached to every motion notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventClock {
    pub monotonic_ms: u64,
    pub wall_ms: i64,
}

/// Payload for a plain motion edge (`EventAnalytics`).
pub fn motion_payload(event_id: u64, edge: Edge, clock: EventClock) -> Value {
    let edge_type = match edge {
        Edge::Start => "start",
        Edge::Stop => "stop",
    };

    json!({
        "clockBestMonotonic": 0,
        "clockBestWall": 0,
        "clockMonotonic": clock.monotonic_ms,
        "clockStream": clock.monotonic_ms,
        "clockStreamRate": 1000,
        "clockWall": clock.wall_ms,
        "edgeType": edge_type,
        "eventId": event_id,
        "eventType": "motion",
        "levels": { "0": 47 },
        "motionHeatmap": "",
        "motionSnapshot": "",
    })
}

/// Payload for a classified detection edge (`EventSmartDetect`).
pub fn smart_detect_payload(
    event_id: u64,
    edge: Edge,
    object_type: &str,
    clock: EventClock,
) -> Value {
    let edge_type = match edge {
        Edge::Start => "enter",
        Edge::Stop => "leave",
    };

    json!({
        "clockBestMonotonic": 0,
        "clockBestWall": 0,
        "clockMonotonic": clock.monotonic_ms,
        "clockStream": clock.monotonic_ms,
        "clockStreamRate": 1000,
        "clockWall": clock.wall_ms,
        "edgeType": edge_type,
        "eventId": event_id,
        "eventType": "motion",
        "levels": { "0": 48 },
        "objectTypes": [object_type],
        "zonesStatus": { "0": 48 },
        "smartDetectSnapshot": "",
    })
}

// ── Video settings ───────────────────────────────────────────────────

/// Where the NVR wants one video channel delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAssignment {
    /// Channel name, e.g. `video1`.
    pub channel: String,
    /// `host:port` of the NVR ingest listener, `None` when the NVR
    /// disabled the channel (e.g. `file:///dev/null`).
    pub destination: Option<String>,
    /// Stream name the relay must tag its output with.
    pub stream_name: Option<String>,
}

/// Extract per-channel delivery targets from a `ChangeVideoSettings` payload.
///
/// Channels without an `avSerializer.destinations` list are left untouched
/// and are not returned. A list with no `tcp://` entry disables the channel.
pub fn parse_stream_assignments(payload: &Value) -> Vec<StreamAssignment> {
    let Some(video) = payload.get("video").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut out: Vec<StreamAssignment> = video
        .iter()
        .filter_map(|(channel, settings)| {
            let serializer = settings.get("avSerializer")?;
            let destination = serializer
                .get("destinations")?
                .as_array()?
                .iter()
                .filter_map(Value::as_str)
                .find_map(tcp_destination);
            let stream_name = serializer
                .pointer("/parameters/streamName")
                .and_then(Value::as_str)
                .map(String::from);

            Some(StreamAssignment {
                channel: channel.clone(),
                destination,
                stream_name,
            })
        })
        .collect();

    out.sort_by(|a, b| a.channel.cmp(&b.channel));
    out
}

fn tcp_destination(raw: &str) -> Option<String> {
    let url = Url::parse(raw).ok()?;
    if url.scheme() != "tcp" {
        return None;
    }
    let host = url.host_str()?;
    let port = url.port()?;
    Some(format!("{host}:{port}"))
}

/// Advertised state of one channel in a video settings reply.
#[derive(Debug, Clone)]
pub struct ChannelAdvert<'a> {
    pub channel: &'a str,
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: u32,
    pub destination: Option<&'a str>,
    pub stream_name: Option<&'a str>,
}

/// Build the `video` settings payload advertising every channel.
pub fn video_settings_payload(channels: &[ChannelAdvert<'_>]) -> Value {
    let mut video = serde_json::Map::new();
    for ch in channels {
        let destinations: Vec<String> = ch
            .destination
            .map(|d| format!("tcp://{d}?retryInterval=1&connectTimeout=5"))
            .into_iter()
            .collect();

        video.insert(
            ch.channel.to_owned(),
            json!({
                "enabled": ch.enabled,
                "width": ch.width,
                "height": ch.height,
                "fps": ch.fps,
                "bitRate": ch.bitrate,
                "isCbr": false,
                "avSerializer": {
                    "type": "extendedFlv",
                    "destinations": destinations,
                    "parameters": { "streamName": ch.stream_name.unwrap_or_default() },
                },
            }),
        );
    }

    json!({ "video": Value::Object(video) })
}

// ── Snapshot request ─────────────────────────────────────────────────

/// A `GetRequest` asking for a snapshot upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub upload_uri: String,
    pub form_fields: Vec<(String, String)>,
}

/// Parse a `GetRequest` payload. Returns `None` for anything other than a
/// snapshot request with an upload URI.
pub fn parse_snapshot_request(payload: &Value) -> Option<SnapshotRequest> {
    if payload.get("what").and_then(Value::as_str) != Some("snapshot") {
        return None;
    }
    let upload_uri = payload.get("uri").and_then(Value::as_str)?.to_owned();
    let form_fields = payload
        .get("formFields")
        .and_then(Value::as_object)
        .map(|fields| {
            fields
                .iter()
                .map(|(k, v)| {
                    let value = v.as_str().map_or_else(|| v.to_string(), String::from);
                    (k.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default();

    Some(SnapshotRequest {
        upload_uri,
        form_fields,
    })
}
