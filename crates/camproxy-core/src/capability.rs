// ── Camera capabilities and vendor presets ──
//
// A camera is described to the engine only by its `CameraCapability`. The
// vendor is consulted once, at configuration time, to fill in defaults
// (stream URIs, relay arguments, ONVIF port, capability); after that no code
// path branches on vendor.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use url::Url;

use crate::model::{StreamProfile, Transport, VideoFormat};

/// Camera vendor preset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    /// Any RTSP camera; streams must be configured explicitly.
    #[default]
    Rtsp,
    /// TP-Link Tapo: RTSP on 554, ONVIF events on 2020.
    Tapo,
    /// Yi cameras behind a local restreamer, with an HTTP motion trigger.
    Yi,
}

/// What a camera can do beyond serving RTSP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
#[serde(rename_all = "kebab-case")]
pub enum CameraCapability {
    RtspOnly,
    RtspOnvifEvents,
    RtspHttpSnapshot,
}

/// One step of the snapshot fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum SnapshotMethod {
    CustomUrl,
    Onvif,
    GenericHttp,
    /// One frame pulled from the profile's RTSP source by the relay program.
    RtspFrame,
}

impl CameraCapability {
    /// Whether motion/person events come from an ONVIF pull point.
    pub fn onvif_events(self) -> bool {
        matches!(self, Self::RtspOnvifEvents)
    }

    /// Snapshot methods to try, in priority order. The custom URL step is
    /// skipped at resolve time when no URL is configured, the frame grab
    /// when no stream profile exists.
    pub fn snapshot_methods(self) -> &'static [SnapshotMethod] {
        match self {
            Self::RtspOnly => &[SnapshotMethod::CustomUrl, SnapshotMethod::RtspFrame],
            Self::RtspOnvifEvents => &[
                SnapshotMethod::CustomUrl,
                SnapshotMethod::Onvif,
                SnapshotMethod::GenericHttp,
            ],
            Self::RtspHttpSnapshot => &[
                SnapshotMethod::CustomUrl,
                SnapshotMethod::GenericHttp,
                SnapshotMethod::RtspFrame,
            ],
        }
    }
}

/// Defaults a vendor contributes to the configuration.
#[derive(Debug, Clone)]
pub struct VendorPreset {
    pub capability: CameraCapability,
    pub onvif_port: u16,
    pub streams: Vec<StreamProfile>,
    /// Whether the HTTP trigger API is on by default.
    pub http_trigger: bool,
}

/// Relay arguments for a camera that already emits H.264: copy video,
/// re-encode audio to the AAC the NVR's FLV ingest expects.
pub fn default_relay_args() -> Vec<String> {
    to_args("-c:v copy -ar 32000 -ac 1 -codec:a aac -b:a 32k")
}

fn to_args(line: &str) -> Vec<String> {
    line.split_whitespace().map(String::from).collect()
}

impl Vendor {
    /// Preset for a camera reachable at `host`.
    pub fn preset(
        self,
        host: &str,
        username: Option<&str>,
        password: Option<&SecretString>,
    ) -> VendorPreset {
        match self {
            Self::Rtsp => VendorPreset {
                capability: CameraCapability::RtspOnly,
                onvif_port: 80,
                streams: Vec::new(),
                http_trigger: false,
            },
            Self::Tapo => {
                let tapo_stream = |id: &str, channel: &str, path: &str, tick_rate: &str| {
                    let mut relay_args = default_relay_args();
                    relay_args.push("-vbsf".into());
                    relay_args.push(format!("h264_metadata=tick_rate={tick_rate}"));
                    StreamProfile {
                        id: id.into(),
                        channel: channel.into(),
                        source: rtsp_url(host, 554, path, username, password),
                        transport: Transport::Tcp,
                        relay_args,
                        video: VideoFormat::for_channel(channel),
                    }
                };
                VendorPreset {
                    capability: CameraCapability::RtspOnvifEvents,
                    onvif_port: 2020,
                    streams: vec![
                        tapo_stream("main", "video1", "stream1", "30000/1001"),
                        tapo_stream("sub", "video2", "stream2", "15000/1001"),
                    ],
                    http_trigger: false,
                }
            }
            Self::Yi => {
                // The restreamer only exposes the SD feed; every channel uses it.
                let source = format!("rtsp://127.0.0.1:8554/yi_{}_sd", host.replace('.', "_"));
                let streams = [("main", "video1"), ("sub", "video2"), ("low", "video3")]
                    .into_iter()
                    .map(|(id, channel)| StreamProfile {
                        id: id.into(),
                        channel: channel.into(),
                        source: source.clone(),
                        transport: Transport::Tcp,
                        relay_args: default_relay_args(),
                        video: VideoFormat::for_channel(channel),
                    })
                    .collect();
                VendorPreset {
                    capability: CameraCapability::RtspHttpSnapshot,
                    onvif_port: 80,
                    streams,
                    http_trigger: true,
                }
            }
        }
    }
}

fn rtsp_url(
    host: &str,
    port: u16,
    path: &str,
    username: Option<&str>,
    password: Option<&SecretString>,
) -> String {
    let raw = format!("rtsp://{host}:{port}/{path}");
    let Ok(mut url) = Url::parse(&raw) else {
        return raw;
    };
    if let Some(user) = username {
        let _ = url.set_username(user);
        if let Some(pass) = password {
            let _ = url.set_password(Some(pass.expose_secret()));
        }
    }
    url.to_string()
}
