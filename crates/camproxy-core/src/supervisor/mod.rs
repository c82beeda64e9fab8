// ── Stream Relay Supervisor ──
//
// Keeps exactly one relay process alive per profile whose desired state is
// Running. Each live profile has one watcher task that spawns, observes and
// respawns its process; every transition of a profile (start, stop, target
// change) happens under that profile's mutex, so two watchers never coexist.

pub mod process;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::CoreError;
use crate::model::{DesiredState, Health, RelayTarget, StreamProfile};

pub use process::{ExitOutcome, LaunchSpec, ProcessLauncher, RelayLauncher, RelayProcess};

// ── RelayCommand ─────────────────────────────────────────────────────

/// Program and argument template for the relay.
///
/// Placeholders: `{source}`, `{transport}`, `{stream_name}`, `{destination}`,
/// `{profile}` are substituted inside any argument; an argument that is
/// exactly `{extra}` expands to the profile's extra arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl RelayCommand {
    /// Template that pulls RTSP and pushes FLV to the NVR's ingest port.
    pub fn default_args() -> Vec<String> {
        [
            "-nostdin",
            "-loglevel",
            "error",
            "-y",
            "-rtsp_transport",
            "{transport}",
            "-i",
            "{source}",
            "{extra}",
            "-metadata",
            "streamName={stream_name}",
            "-f",
            "flv",
            "tcp://{destination}",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }

    pub fn render(&self, profile: &StreamProfile, target: &RelayTarget) -> LaunchSpec {
        let transport = profile.transport.to_string();
        let substitute = |arg: &str| {
            arg.replace("{source}", &profile.source)
                .replace("{transport}", &transport)
                .replace("{stream_name}", &target.stream_name)
                .replace("{destination}", &target.destination)
                .replace("{profile}", &profile.id)
        };

        let args = self
            .args
            .iter()
            .flat_map(|arg| {
                if arg == "{extra}" {
                    profile.relay_args.clone()
                } else {
                    vec![substitute(arg)]
                }
            })
            .collect();

        LaunchSpec {
            profile: profile.id.clone(),
            program: self.program.clone(),
            args,
        }
    }
}

// ── Health reporting ─────────────────────────────────────────────────

/// A profile's health changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthUpdate {
    pub profile: String,
    pub health: Health,
}

#[derive(Clone)]
struct Reporter {
    profile: String,
    state: Arc<watch::Sender<Health>>,
    updates: mpsc::UnboundedSender<HealthUpdate>,
}

impl Reporter {
    fn set(&self, health: Health) {
        if *self.state.borrow() == health {
            return;
        }
        info!(profile = %self.profile, health = %health, "relay health");
        self.state.send_replace(health.clone());
        let _ = self.updates.send(HealthUpdate {
            profile: self.profile.clone(),
            health,
        });
    }
}

// ── Supervisor ───────────────────────────────────────────────────────

struct Watcher {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct Slot {
    profile: StreamProfile,
    target: Option<RelayTarget>,
    desired: DesiredState,
    watcher: Option<Watcher>,
}

/// Owns every relay process. Cheaply cloneable.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    config: RelayConfig,
    command: RelayCommand,
    launcher: Arc<dyn RelayLauncher>,
    slots: BTreeMap<String, Mutex<Slot>>,
    reporters: BTreeMap<String, Reporter>,
}

impl Supervisor {
    /// Build a supervisor for `profiles`. Health changes are pushed to the
    /// returned receiver, in order, per profile.
    pub fn new(
        config: RelayConfig,
        profiles: Vec<StreamProfile>,
        launcher: Arc<dyn RelayLauncher>,
    ) -> (Self, mpsc::UnboundedReceiver<HealthUpdate>) {
        let (updates, rx) = mpsc::unbounded_channel();
        let mut slots = BTreeMap::new();
        let mut reporters = BTreeMap::new();

        for profile in profiles {
            let (state, _) = watch::channel(Health::Stopped);
            reporters.insert(
                profile.id.clone(),
                Reporter {
                    profile: profile.id.clone(),
                    state: Arc::new(state),
                    updates: updates.clone(),
                },
            );
            slots.insert(
                profile.id.clone(),
                Mutex::new(Slot {
                    profile,
                    target: None,
                    desired: DesiredState::Stopped,
                    watcher: None,
                }),
            );
        }

        let command = RelayCommand::from_config(&config);
        let supervisor = Self {
            inner: Arc::new(SupervisorInner {
                config,
                command,
                launcher,
                slots,
                reporters,
            }),
        };
        (supervisor, rx)
    }

    pub fn profile_ids(&self) -> impl Iterator<Item = &str> {
        self.inner.slots.keys().map(String::as_str)
    }

    pub fn current_health(&self, profile: &str) -> Result<Health, CoreError> {
        self.reporter(profile).map(|r| r.state.borrow().clone())
    }

    /// Health of every profile, keyed by id.
    pub fn health_snapshot(&self) -> BTreeMap<String, Health> {
        self.inner
            .reporters
            .iter()
            .map(|(id, r)| (id.clone(), r.state.borrow().clone()))
            .collect()
    }

    /// Set where the NVR wants the profile delivered. A running relay is
    /// restarted when the target actually changes.
    pub async fn set_target(&self, profile: &str, target: RelayTarget) -> Result<(), CoreError> {
        let mut slot = self.slot(profile)?.lock().await;
        if slot.target.as_ref() == Some(&target) {
            return Ok(());
        }
        debug!(profile, destination = %target.destination, "relay target changed");
        slot.target = Some(target);
        if slot.desired == DesiredState::Running {
            self.stop_watcher(&mut slot).await;
            self.start_watcher(&mut slot)?;
        }
        Ok(())
    }

    /// Declare whether the profile should be streaming. Re-declaring
    /// `Running` after a `Failed` relay resets it and retries.
    pub async fn set_desired_state(
        &self,
        profile: &str,
        desired: DesiredState,
    ) -> Result<(), CoreError> {
        let mut slot = self.slot(profile)?.lock().await;
        slot.desired = desired;
        match desired {
            DesiredState::Running => {
                let alive = slot.watcher.as_ref().is_some_and(|w| !w.task.is_finished());
                if !alive {
                    slot.watcher = None;
                    self.start_watcher(&mut slot)?;
                }
            }
            DesiredState::Stopped => {
                self.stop_watcher(&mut slot).await;
                self.reporter(profile)?.set(Health::Stopped);
            }
        }
        Ok(())
    }

    /// Restart every relay that should be running.
    pub async fn restart_all(&self) {
        for (id, slot) in &self.inner.slots {
            let mut slot = slot.lock().await;
            if slot.desired != DesiredState::Running {
                continue;
            }
            info!(profile = %id, "restarting relay");
            self.stop_watcher(&mut slot).await;
            if let Err(e) = self.start_watcher(&mut slot) {
                warn!(profile = %id, error = %e, "relay restart failed");
            }
        }
    }

    /// Stop every relay, each with its own grace period.
    pub async fn shutdown(&self) {
        let stops = self.inner.slots.iter().map(|(id, slot)| async move {
            let mut slot = slot.lock().await;
            slot.desired = DesiredState::Stopped;
            self.stop_watcher(&mut slot).await;
            if let Some(reporter) = self.inner.reporters.get(id) {
                reporter.set(Health::Stopped);
            }
        });
        futures_util::future::join_all(stops).await;
        info!("all relays stopped");
    }

    fn slot(&self, profile: &str) -> Result<&Mutex<Slot>, CoreError> {
        self.inner
            .slots
            .get(profile)
            .ok_or_else(|| CoreError::UnknownProfile {
                profile: profile.to_owned(),
            })
    }

    fn reporter(&self, profile: &str) -> Result<&Reporter, CoreError> {
        self.inner
            .reporters
            .get(profile)
            .ok_or_else(|| CoreError::UnknownProfile {
                profile: profile.to_owned(),
            })
    }

    fn start_watcher(&self, slot: &mut Slot) -> Result<(), CoreError> {
        let Some(target) = slot.target.clone() else {
            debug!(profile = %slot.profile.id, "no relay target yet, waiting for the NVR");
            return Ok(());
        };
        let reporter = self.reporter(&slot.profile.id)?.clone();
        let spec = self.inner.command.render(&slot.profile, &target);
        let stop = CancellationToken::new();

        let task = tokio::spawn(watch_relay(
            Arc::clone(&self.inner.launcher),
            spec,
            WatchPolicy::from(&self.inner.config),
            reporter,
            stop.clone(),
        ));
        slot.watcher = Some(Watcher { stop, task });
        Ok(())
    }

    async fn stop_watcher(&self, slot: &mut Slot) {
        if let Some(watcher) = slot.watcher.take() {
            watcher.stop.cancel();
            if let Err(e) = watcher.task.await {
                error!(profile = %slot.profile.id, error = %e, "relay watcher panicked");
            }
        }
    }
}

// ── Watcher task ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct WatchPolicy {
    grace_period: Duration,
    backoff: crate::backoff::BackoffPolicy,
    max_restarts: u32,
    restart_window: Duration,
    stable_after: Duration,
    fatal_exit_codes: Vec<i32>,
}

impl From<&RelayConfig> for WatchPolicy {
    fn from(config: &RelayConfig) -> Self {
        Self {
            grace_period: config.grace_period,
            backoff: config.backoff,
            max_restarts: config.max_restarts,
            restart_window: config.restart_window,
            stable_after: config.stable_after,
            fatal_exit_codes: config.fatal_exit_codes.clone(),
        }
    }
}

enum Observed {
    Stop,
    Stable,
    Exited(ExitOutcome),
}

/// Spawn, observe and respawn one profile's relay until stopped or failed.
async fn watch_relay(
    launcher: Arc<dyn RelayLauncher>,
    spec: LaunchSpec,
    policy: WatchPolicy,
    reporter: Reporter,
    stop: CancellationToken,
) {
    let profile = spec.profile.clone();
    let mut attempt = 0u32;
    let mut restarts: VecDeque<Instant> = VecDeque::new();

    reporter.set(Health::Starting);

    loop {
        let mut process = match launcher.launch(&spec).await {
            Ok(process) => process,
            Err(e) => {
                error!(profile = %profile, error = %e, "relay cannot be started");
                reporter.set(Health::Failed {
                    reason: e.to_string(),
                });
                return;
            }
        };
        let started = Instant::now();
        let stable_at = started + policy.stable_after;
        let mut promoted = false;
        debug!(profile = %profile, pid = ?process.id(), attempt, "relay running");

        let outcome = loop {
            let observed = tokio::select! {
                biased;
                () = stop.cancelled() => Observed::Stop,
                outcome = process.wait() => Observed::Exited(outcome),
                () = tokio::time::sleep_until(stable_at), if !promoted => Observed::Stable,
            };
            match observed {
                Observed::Stop => {
                    let outcome = process.terminate(policy.grace_period).await;
                    debug!(profile = %profile, %outcome, "relay stopped");
                    return;
                }
                Observed::Stable => {
                    promoted = true;
                    attempt = 0;
                    reporter.set(Health::Running);
                }
                Observed::Exited(outcome) => break outcome,
            }
        };

        if let Some(code) = outcome.code().filter(|c| policy.fatal_exit_codes.contains(c)) {
            error!(profile = %profile, code, "relay exited with a fatal code, not restarting");
            reporter.set(Health::Failed {
                reason: format!("relay {outcome}"),
            });
            return;
        }

        let now = Instant::now();
        restarts.push_back(now);
        while restarts
            .front()
            .is_some_and(|t| now.duration_since(*t) > policy.restart_window)
        {
            restarts.pop_front();
        }
        if restarts.len() > usize::try_from(policy.max_restarts).unwrap_or(usize::MAX) {
            error!(
                profile = %profile,
                restarts = restarts.len(),
                window_secs = policy.restart_window.as_secs(),
                "relay crash loop, giving up"
            );
            reporter.set(Health::Failed {
                reason: format!(
                    "{} restarts within {}s, last {outcome}",
                    restarts.len(),
                    policy.restart_window.as_secs()
                ),
            });
            return;
        }

        attempt = attempt.saturating_add(1);
        let delay = policy.backoff.delay(attempt);
        warn!(
            profile = %profile,
            %outcome,
            attempt,
            delay_ms = delay.as_millis(),
            "relay exited, restarting"
        );
        let next_retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or_else(Utc::now);
        reporter.set(Health::Backoff {
            attempt,
            next_retry_at,
        });

        tokio::select! {
            () = stop.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}
