//! Snapshot Resolver.
//!
//! Tries each method the camera's capability allows, in priority order:
//! custom URL, ONVIF `GetSnapshotUri`, the camera's generic HTTP endpoint,
//! then a single frame grabbed from the RTSP source. Every step has its own
//! timeout and falls through on any failure. Stateless apart from clients,
//! so concurrent calls are fine.

use std::fmt::{self, Write as _};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use camproxy_api::http::{BasicAuth, fetch_image, redacted};
use camproxy_api::onvif::OnvifClient;
use tracing::{debug, warn};
use url::Url;

use crate::capability::SnapshotMethod;
use crate::config::AdapterConfig;
use crate::error::CoreError;
use crate::model::StreamProfile;
use crate::supervisor::{ExitOutcome, LaunchSpec, ProcessLauncher, RelayLauncher};

#[derive(Debug, Clone)]
pub struct SnapshotResolver {
    http: reqwest::Client,
    methods: Vec<SnapshotMethod>,
    custom_url: Option<Url>,
    onvif: Option<OnvifClient>,
    generic_url: Option<Url>,
    auth: Option<BasicAuth>,
    frame_grab: FrameGrab,
    step_timeout: Duration,
}

/// Runs the relay program once to write a single JPEG frame.
#[derive(Clone)]
struct FrameGrab {
    launcher: Arc<dyn RelayLauncher>,
    program: String,
    profiles: Vec<StreamProfile>,
}

impl fmt::Debug for FrameGrab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameGrab")
            .field("program", &self.program)
            .field("profiles", &self.profiles.len())
            .finish_non_exhaustive()
    }
}

impl SnapshotResolver {
    pub fn new(http: reqwest::Client, config: &AdapterConfig, onvif: Option<OnvifClient>) -> Self {
        let camera = &config.camera;
        let auth = camera
            .username
            .clone()
            .zip(camera.password.clone())
            .map(|(username, password)| BasicAuth { username, password });
        let generic_url = (!camera.host.is_empty())
            .then(|| {
                Url::parse(&format!(
                    "http://{}{}",
                    camera.host, config.snapshot.generic_path
                ))
                .ok()
            })
            .flatten();

        Self {
            http,
            methods: camera.capability.snapshot_methods().to_vec(),
            custom_url: camera.snapshot_url.clone(),
            onvif,
            generic_url,
            auth,
            frame_grab: FrameGrab {
                launcher: Arc::new(ProcessLauncher),
                program: config.relay.program.clone(),
                profiles: config.streams.clone(),
            },
            step_timeout: config.snapshot.step_timeout,
        }
    }

    /// Run frame grabs through `launcher` instead of spawning processes.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn RelayLauncher>) -> Self {
        self.frame_grab.launcher = launcher;
        self
    }

    /// Fetch a JPEG for `profile` (the ONVIF media profile is matched by
    /// token or name, falling back to the first one).
    pub async fn get_snapshot(&self, profile: Option<&str>) -> Result<Vec<u8>, CoreError> {
        let mut attempts = String::new();

        for method in &self.methods {
            let step = self.try_method(*method, profile);
            let failure = match tokio::time::timeout(self.step_timeout, step).await {
                Ok(Ok(Some(image))) => {
                    debug!(%method, bytes = image.len(), "snapshot resolved");
                    return Ok(image);
                }
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("timed out after {}ms", self.step_timeout.as_millis()),
            };
            debug!(%method, reason = %failure, "snapshot method failed");
            if !attempts.is_empty() {
                attempts.push_str("; ");
            }
            let _ = write!(attempts, "{method}: {failure}");
        }

        if attempts.is_empty() {
            attempts.push_str("no snapshot method configured");
        }
        warn!(attempts = %attempts, "snapshot unavailable");
        Err(CoreError::SnapshotUnavailable { attempts })
    }

    /// `Ok(None)` when the method has nothing to try for this camera.
    async fn try_method(
        &self,
        method: SnapshotMethod,
        profile: Option<&str>,
    ) -> Result<Option<Vec<u8>>, CoreError> {
        match method {
            SnapshotMethod::CustomUrl => match &self.custom_url {
                Some(url) => Ok(Some(self.fetch(url).await?)),
                None => Ok(None),
            },
            SnapshotMethod::Onvif => match &self.onvif {
                Some(client) => Ok(Some(self.via_onvif(client, profile).await?)),
                None => Ok(None),
            },
            SnapshotMethod::GenericHttp => match &self.generic_url {
                Some(url) => Ok(Some(self.fetch(url).await?)),
                None => Ok(None),
            },
            SnapshotMethod::RtspFrame => self.grab_frame(profile).await,
        }
    }

    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, camproxy_api::Error> {
        debug!(url = %redacted(url), "fetching snapshot");
        fetch_image(&self.http, url, self.auth.as_ref(), self.step_timeout).await
    }

    async fn via_onvif(
        &self,
        client: &OnvifClient,
        profile: Option<&str>,
    ) -> Result<Vec<u8>, camproxy_api::Error> {
        let capabilities = client.capabilities().await?;
        let media = capabilities
            .media
            .ok_or(camproxy_api::Error::MissingElement {
                element: "Media/XAddr",
            })?;
        let profiles = client.profiles(&media).await?;
        let chosen = profile
            .and_then(|wanted| {
                profiles.iter().find(|p| {
                    p.token.eq_ignore_ascii_case(wanted)
                        || p.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(wanted))
                })
            })
            .or_else(|| profiles.first())
            .ok_or(camproxy_api::Error::MissingElement { element: "Profiles" })?;
        let uri = client.snapshot_uri(&media, &chosen.token).await?;
        self.fetch(&uri).await
    }

    /// `None` when there is no stream to grab from. A process still running
    /// when the step times out is dropped, which kills it.
    async fn grab_frame(&self, profile: Option<&str>) -> Result<Option<Vec<u8>>, CoreError> {
        let grab = &self.frame_grab;
        let Some(stream) = profile
            .and_then(|wanted| {
                grab.profiles
                    .iter()
                    .find(|p| p.id == wanted || p.channel == wanted)
            })
            .or_else(|| grab.profiles.first())
        else {
            return Ok(None);
        };

        let output = tempfile::Builder::new()
            .prefix("camproxy-snapshot-")
            .suffix(".jpg")
            .tempfile()
            .map_err(|source| CoreError::Io {
                path: std::env::temp_dir(),
                source,
            })?
            .into_temp_path();
        let spec = LaunchSpec {
            profile: stream.id.clone(),
            program: grab.program.clone(),
            args: frame_grab_args(stream, &output),
        };
        debug!(profile = %stream.id, "grabbing snapshot frame");

        let mut process = grab.launcher.launch(&spec).await?;
        let outcome = process.wait().await;
        if outcome != ExitOutcome::Exited(0) {
            return Err(CoreError::RelayProcess {
                profile: stream.id.clone(),
                reason: format!("frame grab {outcome}"),
                transient: true,
            });
        }

        let image = tokio::fs::read(&output)
            .await
            .map_err(|source| CoreError::Io {
                path: output.to_path_buf(),
                source,
            })?;
        if image.is_empty() {
            return Err(CoreError::RelayProcess {
                profile: stream.id.clone(),
                reason: "frame grab wrote no image".into(),
                transient: true,
            });
        }
        Ok(Some(image))
    }
}

/// Pull one video frame from the profile's source into `output` as JPEG.
fn frame_grab_args(stream: &StreamProfile, output: &Path) -> Vec<String> {
    vec![
        "-nostdin".into(),
        "-loglevel".into(),
        "error".into(),
        "-y".into(),
        "-rtsp_transport".into(),
        stream.transport.to_string(),
        "-i".into(),
        stream.source.clone(),
        "-frames:v".into(),
        "1".into(),
        "-f".into(),
        "image2".into(),
        output.to_string_lossy().into_owned(),
    ]
}
