// ── Runtime adapter configuration ──
//
// Immutable after startup. The binary (via camproxy-config) builds one
// `AdapterConfig` and hands it to the engine; nothing in core reads files or
// the environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::backoff::BackoffPolicy;
use crate::capability::{CameraCapability, Vendor};
use crate::events::{EventKind, TopicFilter};
use crate::model::{MacAddress, StreamProfile};

/// Firmware string announced to the NVR unless overridden.
pub const DEFAULT_FIRMWARE: &str = "UVC.S2L.v4.23.8.67.0eba6e3.200526.1046";

/// Complete adapter configuration.
#[derive(Debug, Clone, Default)]
pub struct AdapterConfig {
    pub nvr: NvrConfig,
    pub device: DeviceConfig,
    pub identity: IdentityConfig,
    pub camera: CameraConfig,
    pub streams: Vec<StreamProfile>,
    pub relay: RelayConfig,
    pub events: EventConfig,
    pub snapshot: SnapshotConfig,
}

/// The NVR we adopt into.
#[derive(Debug, Clone)]
pub struct NvrConfig {
    pub host: String,
    /// Control-channel port.
    pub port: u16,
    /// HTTPS port of the console, for token fetches.
    pub api_port: u16,
    pub token: Option<SecretString>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub firmware_version: String,
    /// Reconnect policy for the control channel.
    pub reconnect: BackoffPolicy,
    /// Bound on opening the control channel, handshakes included.
    pub connect_timeout: Duration,
}

impl Default for NvrConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: camproxy_api::websocket::DEFAULT_PORT,
            api_port: 443,
            token: None,
            username: None,
            password: None,
            firmware_version: DEFAULT_FIRMWARE.into(),
            reconnect: BackoffPolicy::default(),
            connect_timeout: camproxy_api::websocket::DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl NvrConfig {
    /// Console base URL for the token fetch.
    pub fn api_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!("https://{}:{}/", self.host, self.api_port))
    }
}

/// How the adapter presents itself to the NVR.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub mac: MacAddress,
    /// Address the NVR sees the camera at.
    pub ip: IpAddr,
    pub name: String,
    pub model: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mac: MacAddress::default(),
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            name: "camproxy".into(),
            model: "UVC G3".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Identity artifact (key + certificate PEM).
    pub path: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("client.pem"),
        }
    }
}

/// The physical camera.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub vendor: Vendor,
    pub host: String,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub onvif_port: u16,
    pub snapshot_url: Option<Url>,
    pub capability: CameraCapability,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            vendor: Vendor::Rtsp,
            host: String::new(),
            username: None,
            password: None,
            onvif_port: 80,
            snapshot_url: None,
            capability: CameraCapability::RtspOnly,
        }
    }
}

/// Relay process supervision.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub program: String,
    /// Argument template; see [`crate::supervisor::RelayCommand`].
    pub args: Vec<String>,
    /// Time between SIGTERM and SIGKILL on stop.
    pub grace_period: Duration,
    pub backoff: BackoffPolicy,
    /// Restarts tolerated within `restart_window` before giving up.
    pub max_restarts: u32,
    pub restart_window: Duration,
    /// Uptime after which a relay counts as healthy and its attempt counter resets.
    pub stable_after: Duration,
    /// Exit codes meaning "misconfigured, do not retry".
    pub fatal_exit_codes: Vec<i32>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            program: "ffmpeg".into(),
            args: crate::supervisor::RelayCommand::default_args(),
            grace_period: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            max_restarts: 10,
            restart_window: Duration::from_secs(300),
            stable_after: Duration::from_secs(10),
            fatal_exit_codes: Vec::new(),
        }
    }
}

/// Event sources and debounce windows.
#[derive(Debug, Clone)]
pub struct EventConfig {
    pub poll_interval: Duration,
    /// Auto-close window for polled sources.
    pub inactivity_timeout: Duration,
    /// Auto-close safety net for push sources.
    pub trigger_timeout: Duration,
    /// Long-poll timeout passed to `PullMessages`.
    pub pull_timeout: Duration,
    /// Pull-point lifetime requested/renewed.
    pub subscription_ttl: Duration,
    /// Consecutive pull failures before the subscription is recreated.
    pub resubscribe_after: u32,
    /// Delay between failed subscription attempts.
    pub resubscribe_backoff: BackoffPolicy,
    pub onvif_topics: Vec<TopicFilter>,
    /// HTTP trigger listener; `None` disables it.
    pub http_bind: Option<SocketAddr>,
    pub mqtt: Option<MqttConfig>,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            inactivity_timeout: Duration::from_secs(5),
            trigger_timeout: Duration::from_secs(120),
            pull_timeout: Duration::from_secs(1),
            subscription_ttl: Duration::from_secs(60),
            resubscribe_after: 3,
            resubscribe_backoff: BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(60)),
            onvif_topics: vec![
                TopicFilter::new(
                    "tns1:RuleEngine/CellMotionDetector/Motion",
                    "IsMotion",
                    EventKind::Motion,
                ),
                TopicFilter::new(
                    "tns1:RuleEngine/PeopleDetector/People",
                    "IsPeople",
                    EventKind::Person,
                ),
            ],
            http_bind: None,
            mqtt: None,
        }
    }
}

/// Reserved: accepted and logged, not consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
}

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Budget for each step of the fallback chain.
    pub step_timeout: Duration,
    /// Path of the generic HTTP snapshot endpoint on the camera.
    pub generic_path: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(3),
            generic_path: "/snapshot.jpg".into(),
        }
    }
}
