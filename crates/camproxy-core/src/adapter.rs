// ── Camera Adapter Engine ──
//
// Wires the components together: identity, relay supervisor, event sources,
// event engine, snapshot resolver and the protocol bridge. Owns the task
// tree and tears it down in order on shutdown.

use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use camproxy_api::onvif::OnvifClient;
use camproxy_api::transport::TransportConfig;
use camproxy_api::websocket::NvrEndpoint;

use crate::bridge::{AdapterStatus, Bridge, BridgeChannels};
use crate::config::AdapterConfig;
use crate::error::CoreError;
use crate::events::onvif::OnvifPoller;
use crate::events::{self, EventEngine, trigger};
use crate::identity::{DeviceIdentity, IdentityManager};
use crate::snapshot::SnapshotResolver;
use crate::supervisor::{ProcessLauncher, RelayLauncher, Supervisor};

/// Capacity of the engine → bridge transition queue.
const TRANSITION_CAPACITY: usize = 256;
/// How long background tasks get to finish after cancellation.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The whole adapter, ready to run.
pub struct Adapter {
    config: Arc<AdapterConfig>,
    launcher: Arc<dyn RelayLauncher>,
    status: watch::Sender<AdapterStatus>,
}

impl Adapter {
    pub fn new(config: AdapterConfig) -> Self {
        let (status, _) = watch::channel(AdapterStatus::default());
        Self {
            config: Arc::new(config),
            launcher: Arc::new(ProcessLauncher),
            status,
        }
    }

    /// Replace the relay launcher (tests, or a non-process relay).
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn RelayLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Observe adapter state while it runs.
    pub fn subscribe(&self) -> watch::Receiver<AdapterStatus> {
        self.status.subscribe()
    }

    /// Load or create the identity and resolve the adoption token.
    pub async fn prepare(&self) -> Result<DeviceIdentity, CoreError> {
        let manager = IdentityManager::new(&self.config.identity.path);
        let material = manager.ensure_identity()?;
        debug!(path = %manager.path().display(), "identity ready");

        let adoption_token = resolve_token(&self.config).await?;
        let device = &self.config.device;
        Ok(DeviceIdentity {
            material,
            adoption_token,
            mac: device.mac.clone(),
            model: device.model.clone(),
            name: device.name.clone(),
        })
    }

    /// Run until `cancel` fires. Errors only when startup fails.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), CoreError> {
        let config = Arc::clone(&self.config);
        let http = TransportConfig::default().build_client()?;

        let identity = self.prepare().await?;
        let endpoint = NvrEndpoint {
            host: config.nvr.host.clone(),
            port: config.nvr.port,
            token: identity.adoption_token.clone(),
            mac: identity.mac.as_str().to_owned(),
            tls: identity.material.tls_config()?,
            connect_timeout: config.nvr.connect_timeout,
        };
        info!(
            mac = %identity.mac,
            name = %identity.name,
            capability = ?config.camera.capability,
            profiles = config.streams.len(),
            "camera adapter starting"
        );

        let (supervisor, health) = Supervisor::new(
            config.relay.clone(),
            config.streams.clone(),
            Arc::clone(&self.launcher),
        );

        let children = cancel.child_token();
        let mut tasks = JoinSet::new();

        // Event sources feed the engine, the engine feeds the bridge.
        let (signals, signals_rx) = events::signal_channel();
        let (transitions_tx, transitions_rx) = mpsc::channel(TRANSITION_CAPACITY);
        let engine = EventEngine::new(
            config.events.inactivity_timeout,
            config.events.trigger_timeout,
            signals_rx,
            transitions_tx,
        );
        // The engine outlives its sources so their last closes reach the bridge.
        let engine_cancel = CancellationToken::new();
        tasks.spawn(engine.run(engine_cancel.clone()));

        let onvif = onvif_client(&config, &http)?;
        if config.camera.capability.onvif_events() {
            match &onvif {
                Some(client) => {
                    let poller = OnvifPoller::new(client.clone(), &config.events, signals.clone());
                    tasks.spawn(poller.run(children.clone()));
                }
                None => warn!("ONVIF events need camera credentials, poller disabled"),
            }
        }

        if let Some(addr) = config.events.http_bind {
            let listener = trigger::bind(addr).await?;
            let state = trigger::TriggerState::new(signals.clone(), self.status.subscribe());
            let cancel = children.clone();
            tasks.spawn(async move {
                if let Err(e) = trigger::serve(listener, state, cancel).await {
                    warn!(error = %e, "HTTP trigger stopped");
                }
            });
        }

        if let Some(mqtt) = &config.events.mqtt {
            info!(
                host = %mqtt.host,
                port = mqtt.port,
                topic = %mqtt.topic,
                "MQTT source configured but not consumed"
            );
        }
        drop(signals);

        let snapshots = SnapshotResolver::new(http.clone(), &config, onvif)
            .with_launcher(Arc::clone(&self.launcher));
        let bridge = Bridge::new(
            Arc::clone(&config),
            endpoint,
            supervisor.clone(),
            snapshots,
            http,
            BridgeChannels {
                transitions: transitions_rx,
                health,
                status: self.status.clone(),
            },
        );

        // Stop sources first, then give the engine a moment to emit closes
        // while the bridge drains them.
        let shutdown = {
            let cancel = cancel.clone();
            let children = children.clone();
            let engine_cancel = engine_cancel.clone();
            async move {
                cancel.cancelled().await;
                children.cancel();
                engine_cancel.cancel();
            }
        };
        tokio::join!(bridge.run(cancel.clone()), shutdown);

        info!("stopping relays");
        supervisor.shutdown().await;

        let drained = tokio::time::timeout(TEARDOWN_TIMEOUT, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "adapter task failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("background tasks did not stop in time, aborting");
            tasks.abort_all();
        }

        info!("camera adapter stopped");
        Ok(())
    }
}

/// Use the configured adoption token, or fetch one from the NVR.
pub async fn resolve_token(config: &AdapterConfig) -> Result<SecretString, CoreError> {
    let nvr = &config.nvr;
    if let Some(token) = &nvr.token {
        return Ok(token.clone());
    }
    let (Some(username), Some(password)) = (&nvr.username, &nvr.password) else {
        return Err(CoreError::Config {
            message: "no adoption token and no NVR credentials to fetch one".into(),
        });
    };
    let base = nvr.api_url().map_err(|e| CoreError::Config {
        message: format!("invalid NVR address {:?}: {e}", nvr.host),
    })?;
    info!(nvr = %base, "fetching adoption token");
    // Login state lives in the cookie jar.
    let http = TransportConfig {
        cookies: true,
        ..TransportConfig::default()
    }
    .build_client()?;
    Ok(camproxy_api::protect::fetch_adoption_token(&http, &base, username, password).await?)
}

/// ONVIF client for the camera, when it has credentials and needs ONVIF.
fn onvif_client(
    config: &AdapterConfig,
    http: &reqwest::Client,
) -> Result<Option<OnvifClient>, CoreError> {
    let camera = &config.camera;
    let wants_onvif = camera.capability.onvif_events()
        || camera
            .capability
            .snapshot_methods()
            .contains(&crate::capability::SnapshotMethod::Onvif);
    let (true, Some(username), Some(password)) =
        (wants_onvif, &camera.username, &camera.password)
    else {
        return Ok(None);
    };
    let url = OnvifClient::device_service_url(&camera.host, camera.onvif_port).map_err(|e| {
        CoreError::Config {
            message: format!("invalid camera host {:?}: {e}", camera.host),
        }
    })?;
    Ok(Some(OnvifClient::new(
        http.clone(),
        url,
        username.clone(),
        password.clone(),
    )))
}
