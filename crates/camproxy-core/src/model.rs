// Domain types shared by the adapter components.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

// ── MacAddress ──────────────────────────────────────────────────────

/// Device MAC address, normalized to uppercase bare hex (`AABBCCDDEEFF`),
/// which is the form the NVR expects in the `camera-mac` header and hello.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address '{0}': expected 12 hex digits")]
pub struct InvalidMac(String);

impl MacAddress {
    /// Parse any common format: colon-separated, dash-separated, dotted, or bare hex.
    pub fn new(raw: impl AsRef<str>) -> Result<Self, InvalidMac> {
        let raw = raw.as_ref();
        let hex: String = raw
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InvalidMac(raw.to_owned()));
        }
        Ok(Self(hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Colon-separated lowercase form, for display.
    pub fn colon_separated(&self) -> String {
        self.0
            .as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).to_lowercase())
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl Default for MacAddress {
    fn default() -> Self {
        Self("AABBCCDDEEFF".into())
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for MacAddress {
    type Err = InvalidMac;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for MacAddress {
    type Error = InvalidMac;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.0
    }
}

// ── Stream profiles ─────────────────────────────────────────────────

/// Transport used to pull the camera's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
    Http,
    Multicast,
}

/// Format the NVR is told a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: u32,
}

impl VideoFormat {
    /// Conventional format for the n-th NVR channel (`video1`, `video2`, ...).
    pub fn for_channel(channel: &str) -> Self {
        match channel {
            "video1" => Self {
                width: 1920,
                height: 1080,
                fps: 30,
                bitrate: 4_000_000,
            },
            "video2" => Self {
                width: 1280,
                height: 720,
                fps: 30,
                bitrate: 2_000_000,
            },
            _ => Self {
                width: 640,
                height: 360,
                fps: 15,
                bitrate: 500_000,
            },
        }
    }
}

/// One quality tier of the camera's video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamProfile {
    /// Profile id, e.g. `main` / `sub`.
    pub id: String,
    /// NVR channel this profile backs, e.g. `video1`.
    pub channel: String,
    /// Camera source URI; may embed credentials.
    pub source: String,
    pub transport: Transport,
    /// Extra relay arguments substituted for `{extra}`.
    pub relay_args: Vec<String>,
    pub video: VideoFormat,
}

impl StreamProfile {
    /// Source URI with any password masked, for logs.
    pub fn redacted_source(&self) -> String {
        match url::Url::parse(&self.source) {
            Ok(mut url) if url.password().is_some() => {
                let _ = url.set_password(Some("***"));
                url.to_string()
            }
            _ => self.source.clone(),
        }
    }
}

/// Where the NVR wants a profile delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    /// `host:port` of the NVR ingest listener.
    pub destination: String,
    pub stream_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DesiredState {
    Running,
    Stopped,
}

/// Observed health of one profile's relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Health {
    Starting,
    Running,
    Backoff {
        attempt: u32,
        next_retry_at: DateTime<Utc>,
    },
    Stopped,
    Failed {
        reason: String,
    },
}

impl Health {
    /// Whether the NVR should be told the profile is usable.
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Backoff { .. })
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
            Self::Backoff { attempt, .. } => write!(f, "backoff({attempt})"),
            Self::Stopped => f.write_str("stopped"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}
