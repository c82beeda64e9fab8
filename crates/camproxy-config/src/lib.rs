//! Configuration loading for camproxy.
//!
//! A TOML file plus `CAMPROXY_*` environment overrides, merged with figment
//! and translated once into the engine's immutable
//! [`camproxy_core::AdapterConfig`]. Vendor presets are applied here; the
//! engine never sees a vendor.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use camproxy_core::config::{
    CameraConfig, DeviceConfig, EventConfig, IdentityConfig, MqttConfig, NvrConfig, RelayConfig,
    SnapshotConfig,
};
use camproxy_core::events::TopicFilter;
use camproxy_core::model::VideoFormat;
use camproxy_core::{
    AdapterConfig, BackoffPolicy, CameraCapability, EventKind, MacAddress, StreamProfile,
    Transport, Vendor,
};

/// Environment prefix; nested keys are separated by `__`
/// (`CAMPROXY_NVR__HOST`).
pub const ENV_PREFIX: &str = "CAMPROXY_";
/// Trigger port used when a preset enables the HTTP trigger and none is set.
pub const DEFAULT_TRIGGER_PORT: u16 = 8080;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub nvr: NvrSection,
    pub device: DeviceSection,
    pub identity: IdentitySection,
    pub camera: CameraSection,
    pub streams: Vec<StreamSection>,
    pub relay: RelaySection,
    pub events: EventsSection,
    pub snapshot: SnapshotSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NvrSection {
    pub host: Option<String>,
    pub port: u16,
    pub api_port: u16,
    #[serde(skip_serializing)]
    pub token: Option<SecretString>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<SecretString>,
    pub firmware_version: Option<String>,
    #[serde(with = "duration_str")]
    pub reconnect_base: Duration,
    #[serde(with = "duration_str")]
    pub reconnect_cap: Duration,
    #[serde(with = "duration_str")]
    pub connect_timeout: Duration,
}

impl Default for NvrSection {
    fn default() -> Self {
        let nvr = NvrConfig::default();
        Self {
            host: None,
            port: nvr.port,
            api_port: nvr.api_port,
            token: None,
            username: None,
            password: None,
            firmware_version: None,
            reconnect_base: nvr.reconnect.base,
            reconnect_cap: nvr.reconnect.cap,
            connect_timeout: nvr.connect_timeout,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceSection {
    pub mac: Option<String>,
    pub ip: Option<IpAddr>,
    pub name: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IdentitySection {
    /// Defaults to `client.pem` in the platform data directory.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CameraSection {
    pub vendor: Vendor,
    pub host: Option<String>,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<SecretString>,
    pub onvif_port: Option<u16>,
    pub snapshot_url: Option<Url>,
    /// Overrides the preset's capability.
    pub capability: Option<CameraCapability>,
}

/// One `[[streams]]` entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamSection {
    pub id: String,
    /// NVR channel; defaults to `video<n>` by position.
    pub channel: Option<String>,
    pub source: String,
    #[serde(default)]
    pub transport: Transport,
    /// Replaces the default extra relay arguments.
    pub relay_args: Option<Vec<String>>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub bitrate: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelaySection {
    pub program: String,
    /// Argument template; see `RelayCommand` for placeholders.
    pub args: Option<Vec<String>>,
    #[serde(with = "duration_str")]
    pub grace_period: Duration,
    #[serde(with = "duration_str")]
    pub backoff_base: Duration,
    #[serde(with = "duration_str")]
    pub backoff_cap: Duration,
    pub max_restarts: u32,
    #[serde(with = "duration_str")]
    pub restart_window: Duration,
    #[serde(with = "duration_str")]
    pub stable_after: Duration,
    pub fatal_exit_codes: Vec<i32>,
}

impl Default for RelaySection {
    fn default() -> Self {
        let relay = RelayConfig::default();
        Self {
            program: relay.program,
            args: None,
            grace_period: relay.grace_period,
            backoff_base: relay.backoff.base,
            backoff_cap: relay.backoff.cap,
            max_restarts: relay.max_restarts,
            restart_window: relay.restart_window,
            stable_after: relay.stable_after,
            fatal_exit_codes: relay.fatal_exit_codes,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsSection {
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    #[serde(with = "duration_str")]
    pub inactivity_timeout: Duration,
    #[serde(with = "duration_str")]
    pub trigger_timeout: Duration,
    #[serde(with = "duration_str")]
    pub pull_timeout: Duration,
    #[serde(with = "duration_str")]
    pub subscription_ttl: Duration,
    pub resubscribe_after: u32,
    /// Cap on the delay between failed ONVIF subscription attempts. The
    /// first retry waits `poll_interval`.
    #[serde(with = "duration_str")]
    pub resubscribe_backoff_cap: Duration,
    /// `topic:Key` pairs, optionally suffixed `=person`.
    pub onvif_topics: Option<Vec<String>>,
    /// HTTP trigger port; `0` disables it even when a preset enables it.
    pub http_port: Option<u16>,
    pub http_address: IpAddr,
    pub mqtt: Option<MqttSection>,
}

impl Default for EventsSection {
    fn default() -> Self {
        let events = EventConfig::default();
        Self {
            poll_interval: events.poll_interval,
            inactivity_timeout: events.inactivity_timeout,
            trigger_timeout: events.trigger_timeout,
            pull_timeout: events.pull_timeout,
            subscription_ttl: events.subscription_ttl,
            resubscribe_after: events.resubscribe_after,
            resubscribe_backoff_cap: events.resubscribe_backoff.cap,
            onvif_topics: None,
            http_port: None,
            http_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            mqtt: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MqttSection {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub topic: String,
}

fn default_mqtt_port() -> u16 {
    1883
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SnapshotSection {
    #[serde(with = "duration_str")]
    pub step_timeout: Duration,
    pub generic_path: String,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        let snapshot = SnapshotConfig::default();
        Self {
            step_timeout: snapshot.step_timeout,
            generic_path: snapshot.generic_path,
        }
    }
}

/// Durations as humantime strings (`"5s"`, `"2m 30s"`), or bare seconds.
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => humantime::parse_duration(&text).map_err(de::Error::custom),
        }
    }
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "camproxy", "camproxy")
}

/// Default config file location via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || PathBuf::from("camproxy.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Default identity artifact location.
pub fn default_identity_path() -> PathBuf {
    project_dirs().map_or_else(
        || PathBuf::from("client.pem"),
        |dirs| dirs.data_dir().join("client.pem"),
    )
}

// ── Loading ─────────────────────────────────────────────────────────

/// Defaults, then the TOML file at `path`, then `CAMPROXY_*` env vars.
pub fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load the config from `path` (or the default location) plus environment.
/// A missing file is not an error.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    Ok(figment(&path).extract()?)
}

/// Render the effective configuration as TOML. Secrets are never written.
pub fn to_toml(config: &Config) -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(config)?)
}

// ── Translation ─────────────────────────────────────────────────────

impl Config {
    /// Apply the vendor preset, validate, and build the engine config.
    /// Explicit `[[streams]]` always win over preset streams.
    pub fn to_adapter_config(&self) -> Result<AdapterConfig, ConfigError> {
        let nvr = self.nvr_config()?;
        let device = self.device_config()?;
        let camera_host = self.camera.host.clone().unwrap_or_default();
        if self.camera.vendor != Vendor::Rtsp && camera_host.is_empty() {
            return Err(invalid(
                "camera.host",
                format!("required by the '{}' preset", self.camera.vendor),
            ));
        }

        let preset = self.camera.vendor.preset(
            &camera_host,
            self.camera.username.as_deref(),
            self.camera.password.as_ref(),
        );
        let streams = if self.streams.is_empty() {
            preset.streams
        } else {
            self.stream_profiles()?
        };
        if streams.is_empty() {
            return Err(invalid(
                "streams",
                "no stream profiles; add [[streams]] or choose a vendor preset",
            ));
        }

        let camera = CameraConfig {
            vendor: self.camera.vendor,
            host: camera_host,
            username: self.camera.username.clone(),
            password: self.camera.password.clone(),
            onvif_port: self.camera.onvif_port.unwrap_or(preset.onvif_port),
            snapshot_url: self.camera.snapshot_url.clone(),
            capability: self.camera.capability.unwrap_or(preset.capability),
        };

        Ok(AdapterConfig {
            nvr,
            device,
            identity: IdentityConfig {
                path: self
                    .identity
                    .path
                    .clone()
                    .unwrap_or_else(default_identity_path),
            },
            camera,
            streams,
            relay: self.relay_config()?,
            events: self.event_config(preset.http_trigger)?,
            snapshot: SnapshotConfig {
                step_timeout: self.snapshot.step_timeout,
                generic_path: self.snapshot.generic_path.clone(),
            },
        })
    }

    fn nvr_config(&self) -> Result<NvrConfig, ConfigError> {
        let host = self
            .nvr
            .host
            .clone()
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| invalid("nvr.host", "required"))?;
        let defaults = NvrConfig::default();
        Ok(NvrConfig {
            host,
            port: self.nvr.port,
            api_port: self.nvr.api_port,
            token: self.nvr.token.clone(),
            username: self.nvr.username.clone(),
            password: self.nvr.password.clone(),
            firmware_version: self
                .nvr
                .firmware_version
                .clone()
                .unwrap_or(defaults.firmware_version),
            reconnect: backoff("nvr", self.nvr.reconnect_base, self.nvr.reconnect_cap)?,
            connect_timeout: self.nvr.connect_timeout,
        })
    }

    fn device_config(&self) -> Result<DeviceConfig, ConfigError> {
        let defaults = DeviceConfig::default();
        let mac = match &self.device.mac {
            Some(raw) => MacAddress::new(raw).map_err(|e| invalid("device.mac", e.to_string()))?,
            None => defaults.mac,
        };
        Ok(DeviceConfig {
            mac,
            ip: self.device.ip.unwrap_or(defaults.ip),
            name: self.device.name.clone().unwrap_or(defaults.name),
            model: self.device.model.clone().unwrap_or(defaults.model),
        })
    }

    fn stream_profiles(&self) -> Result<Vec<StreamProfile>, ConfigError> {
        let mut ids = BTreeSet::new();
        let mut channels = BTreeSet::new();
        let mut profiles = Vec::with_capacity(self.streams.len());

        for (index, stream) in self.streams.iter().enumerate() {
            if stream.id.trim().is_empty() {
                return Err(invalid("streams.id", "must not be empty"));
            }
            if !ids.insert(stream.id.clone()) {
                return Err(invalid("streams.id", format!("duplicate id '{}'", stream.id)));
            }
            if stream.source.trim().is_empty() {
                return Err(invalid(
                    "streams.source",
                    format!("missing for '{}'", stream.id),
                ));
            }
            let channel = stream
                .channel
                .clone()
                .unwrap_or_else(|| format!("video{}", index + 1));
            if !channels.insert(channel.clone()) {
                return Err(invalid(
                    "streams.channel",
                    format!("'{channel}' used by more than one stream"),
                ));
            }

            let base = VideoFormat::for_channel(&channel);
            profiles.push(StreamProfile {
                id: stream.id.clone(),
                source: stream.source.clone(),
                transport: stream.transport,
                relay_args: stream
                    .relay_args
                    .clone()
                    .unwrap_or_else(camproxy_core::capability::default_relay_args),
                video: VideoFormat {
                    width: stream.width.unwrap_or(base.width),
                    height: stream.height.unwrap_or(base.height),
                    fps: stream.fps.unwrap_or(base.fps),
                    bitrate: stream.bitrate.unwrap_or(base.bitrate),
                },
                channel,
            });
        }
        Ok(profiles)
    }

    fn relay_config(&self) -> Result<RelayConfig, ConfigError> {
        let relay = &self.relay;
        if relay.program.trim().is_empty() {
            return Err(invalid("relay.program", "must not be empty"));
        }
        if relay.max_restarts == 0 {
            return Err(invalid("relay.max_restarts", "must be at least 1"));
        }
        Ok(RelayConfig {
            program: relay.program.clone(),
            args: relay
                .args
                .clone()
                .unwrap_or_else(camproxy_core::RelayCommand::default_args),
            grace_period: relay.grace_period,
            backoff: backoff("relay", relay.backoff_base, relay.backoff_cap)?,
            max_restarts: relay.max_restarts,
            restart_window: relay.restart_window,
            stable_after: relay.stable_after,
            fatal_exit_codes: relay.fatal_exit_codes.clone(),
        })
    }

    fn event_config(&self, preset_trigger: bool) -> Result<EventConfig, ConfigError> {
        let events = &self.events;
        let defaults = EventConfig::default();
        if events.poll_interval.is_zero() {
            return Err(invalid("events.poll_interval", "must be positive"));
        }
        if events.inactivity_timeout.is_zero() {
            return Err(invalid("events.inactivity_timeout", "must be positive"));
        }

        let onvif_topics = match &events.onvif_topics {
            Some(raw) => raw
                .iter()
                .map(|t| parse_topic(t))
                .collect::<Result<Vec<_>, _>>()?,
            None => defaults.onvif_topics,
        };
        let http_port = match events.http_port {
            Some(0) => None,
            Some(port) => Some(port),
            None => preset_trigger.then_some(DEFAULT_TRIGGER_PORT),
        };

        Ok(EventConfig {
            poll_interval: events.poll_interval,
            inactivity_timeout: events.inactivity_timeout,
            trigger_timeout: events.trigger_timeout,
            pull_timeout: events.pull_timeout,
            subscription_ttl: events.subscription_ttl,
            resubscribe_after: events.resubscribe_after,
            resubscribe_backoff: backoff(
                "events.resubscribe",
                events.poll_interval,
                events.resubscribe_backoff_cap,
            )?,
            onvif_topics,
            http_bind: http_port.map(|port| SocketAddr::new(events.http_address, port)),
            mqtt: events.mqtt.as_ref().map(|m| MqttConfig {
                host: m.host.clone(),
                port: m.port,
                topic: m.topic.clone(),
            }),
        })
    }
}

fn backoff(section: &str, base: Duration, cap: Duration) -> Result<BackoffPolicy, ConfigError> {
    if base.is_zero() || cap < base {
        return Err(invalid(
            &format!("{section}.backoff"),
            "base must be positive and not exceed the cap",
        ));
    }
    Ok(BackoffPolicy::new(base, cap))
}

/// Parse `tns1:RuleEngine/CellMotionDetector/Motion:IsMotion[=person]`.
pub fn parse_topic(raw: &str) -> Result<TopicFilter, ConfigError> {
    let (pair, kind) = match raw.split_once('=') {
        Some((pair, kind)) => {
            let kind: EventKind = kind
                .trim()
                .parse()
                .map_err(|_| invalid("events.onvif_topics", format!("unknown kind in '{raw}'")))?;
            (pair, kind)
        }
        None => (raw, EventKind::Motion),
    };
    match pair.rsplit_once(':') {
        Some((topic, key)) if !topic.is_empty() && !key.is_empty() && !key.contains('/') => {
            Ok(TopicFilter::new(topic.trim(), key.trim(), kind))
        }
        _ => Err(invalid(
            "events.onvif_topics",
            format!("expected 'topic:Key', got '{raw}'"),
        )),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use figment::Jail;
    use secrecy::ExposeSecret;

    use super::*;

    fn minimal() -> Config {
        let mut config = Config::default();
        config.nvr.host = Some("192.168.1.1".into());
        config.nvr.token = Some(SecretString::from("tok"));
        config
    }

    #[test]
    fn toml_and_env_are_merged() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "camproxy.toml",
                r#"
                [nvr]
                host = "192.168.1.1"
                token = "from-file"
                connect_timeout = "4s"

                [camera]
                vendor = "tapo"
                host = "10.0.0.7"
                username = "admin"
                password = "pw"

                [events]
                inactivity_timeout = "8s"
                poll_interval = 3
                resubscribe_backoff_cap = "30s"
                "#,
            )?;
            jail.set_env("CAMPROXY_NVR__TOKEN", "from-env");
            jail.set_env("CAMPROXY_RELAY__MAX_RESTARTS", "4");

            let config = load_config(Some(Path::new("camproxy.toml"))).unwrap();
            assert_eq!(config.nvr.token.as_ref().unwrap().expose_secret(), "from-env");
            assert_eq!(config.relay.max_restarts, 4);
            assert_eq!(config.events.inactivity_timeout, Duration::from_secs(8));
            assert_eq!(config.events.poll_interval, Duration::from_secs(3));

            let adapter = config.to_adapter_config().unwrap();
            assert_eq!(adapter.camera.capability, CameraCapability::RtspOnvifEvents);
            assert_eq!(adapter.camera.onvif_port, 2020);
            assert_eq!(adapter.nvr.connect_timeout, Duration::from_secs(4));
            assert_eq!(adapter.streams.len(), 2);
            assert_eq!(adapter.streams[0].source, "rtsp://admin:pw@10.0.0.7:554/stream1");
            assert_eq!(
                adapter.events.resubscribe_backoff,
                BackoffPolicy::new(Duration::from_secs(3), Duration::from_secs(30))
            );
            Ok(())
        });
    }

    #[test]
    fn missing_file_uses_defaults() {
        Jail::expect_with(|_| {
            let config = load_config(Some(Path::new("absent.toml"))).unwrap();
            assert_eq!(config.nvr.port, 7442);
            assert_eq!(config.nvr.connect_timeout, Duration::from_secs(10));
            assert_eq!(config.events.trigger_timeout, Duration::from_secs(120));
            assert!(config.to_adapter_config().is_err());
            Ok(())
        });
    }

    #[test]
    fn explicit_streams_win_over_preset() {
        let mut config = minimal();
        config.camera.vendor = Vendor::Yi;
        config.camera.host = Some("192.168.1.20".into());
        config.streams = vec![StreamSection {
            id: "hd".into(),
            channel: None,
            source: "rtsp://cam/hd".into(),
            transport: Transport::Udp,
            relay_args: None,
            width: Some(2560),
            height: None,
            fps: None,
            bitrate: None,
        }];

        let adapter = config.to_adapter_config().unwrap();
        assert_eq!(adapter.streams.len(), 1);
        assert_eq!(adapter.streams[0].channel, "video1");
        assert_eq!(adapter.streams[0].video.width, 2560);
        assert_eq!(adapter.streams[0].video.height, 1080);
        // The preset still picks capability and the trigger.
        assert_eq!(adapter.camera.capability, CameraCapability::RtspHttpSnapshot);
        assert_eq!(
            adapter.events.http_bind.unwrap().port(),
            DEFAULT_TRIGGER_PORT
        );
    }

    #[test]
    fn trigger_port_zero_disables_preset_trigger() {
        let mut config = minimal();
        config.camera.vendor = Vendor::Yi;
        config.camera.host = Some("192.168.1.20".into());
        config.events.http_port = Some(0);
        let adapter = config.to_adapter_config().unwrap();
        assert!(adapter.events.http_bind.is_none());
        assert_eq!(
            adapter.streams[0].source,
            "rtsp://127.0.0.1:8554/yi_192_168_1_20_sd"
        );
    }

    #[test]
    fn validation_errors_name_the_field() {
        let mut config = minimal();
        config.nvr.host = None;
        assert!(matches!(
            config.to_adapter_config(),
            Err(ConfigError::Validation { field, .. }) if field == "nvr.host"
        ));

        let mut config = minimal();
        config.device.mac = Some("not-a-mac".into());
        assert!(matches!(
            config.to_adapter_config(),
            Err(ConfigError::Validation { field, .. }) if field == "device.mac"
        ));

        let mut config = minimal();
        config.camera.vendor = Vendor::Tapo;
        assert!(matches!(
            config.to_adapter_config(),
            Err(ConfigError::Validation { field, .. }) if field == "camera.host"
        ));

        let mut config = minimal();
        config.relay.backoff_base = Duration::from_secs(90);
        config.camera.vendor = Vendor::Yi;
        config.camera.host = Some("10.0.0.2".into());
        assert!(matches!(
            config.to_adapter_config(),
            Err(ConfigError::Validation { field, .. }) if field == "relay.backoff"
        ));
    }

    #[test]
    fn duplicate_stream_ids_are_rejected() {
        let stream = StreamSection {
            id: "main".into(),
            channel: None,
            source: "rtsp://cam/1".into(),
            transport: Transport::Tcp,
            relay_args: None,
            width: None,
            height: None,
            fps: None,
            bitrate: None,
        };
        let mut config = minimal();
        config.streams = vec![stream.clone(), stream];
        let err = config.to_adapter_config().unwrap_err();
        assert!(err.to_string().contains("duplicate id 'main'"), "{err}");
    }

    #[test]
    fn rtsp_without_streams_is_rejected() {
        let err = minimal().to_adapter_config().unwrap_err();
        assert!(err.to_string().contains("no stream profiles"), "{err}");
    }

    #[test]
    fn topics_parse_with_optional_kind() {
        let motion = parse_topic("tns1:RuleEngine/CellMotionDetector/Motion:IsMotion").unwrap();
        assert_eq!(motion.topic, "tns1:RuleEngine/CellMotionDetector/Motion");
        assert_eq!(motion.key, "IsMotion");
        assert_eq!(motion.kind, EventKind::Motion);

        let person = parse_topic("tns1:RuleEngine/PeopleDetector/People:IsPeople=person").unwrap();
        assert_eq!(person.kind, EventKind::Person);

        assert!(parse_topic("NoKeyHere").is_err());
        assert!(parse_topic("tns1:Motion:IsMotion=dog").is_err());
    }

    #[test]
    fn rendered_toml_omits_secrets_and_reloads() {
        let mut config = minimal();
        config.camera.password = Some(SecretString::from("hunter2"));
        config.events.inactivity_timeout = Duration::from_secs(7);
        let text = to_toml(&config).unwrap();
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("tok"));
        assert!(text.contains("inactivity_timeout = \"7s\""), "{text}");

        Jail::expect_with(|jail| {
            jail.create_file("rendered.toml", &text)?;
            let reloaded = load_config(Some(Path::new("rendered.toml"))).unwrap();
            assert_eq!(reloaded.events.inactivity_timeout, Duration::from_secs(7));
            assert_eq!(reloaded.nvr.host.as_deref(), Some("192.168.1.1"));
            Ok(())
        });
    }

    #[test]
    fn mqtt_section_is_carried_through() {
        let mut config = minimal();
        config.camera.vendor = Vendor::Yi;
        config.camera.host = Some("10.0.0.2".into());
        config.events.mqtt = Some(MqttSection {
            host: "broker".into(),
            port: default_mqtt_port(),
            topic: "yi/motion".into(),
        });
        let adapter = config.to_adapter_config().unwrap();
        assert_eq!(adapter.events.mqtt.unwrap().port, 1883);
    }
}
