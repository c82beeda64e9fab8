// ── Relay process abstraction ──
//
// The supervisor only knows how to launch, wait on and terminate an opaque
// process. `ProcessLauncher` is the real implementation over
// `tokio::process`; tests substitute scripted fakes.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::CoreError;

/// Fully rendered invocation for one profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub profile: String,
    pub program: String,
    pub args: Vec<String>,
}

/// How a relay process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(i32),
    /// The exit status could not be collected.
    Lost(String),
}

impl ExitOutcome {
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signaled(signal);
            }
        }
        Self::Lost(status.to_string())
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit code {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
            Self::Lost(reason) => write!(f, "exit status lost: {reason}"),
        }
    }
}

/// Starts relay processes.
#[async_trait]
pub trait RelayLauncher: Send + Sync {
    /// Spawn the process. An error here is a configuration problem
    /// (missing binary, permissions) and is not retried.
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn RelayProcess>, CoreError>;
}

/// A live relay process.
#[async_trait]
pub trait RelayProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Resolve when the process exits. Must be cancel-safe.
    async fn wait(&mut self) -> ExitOutcome;

    /// Ask the process to stop, force-kill after `grace`.
    async fn terminate(&mut self, grace: Duration) -> ExitOutcome;
}

// ── tokio::process implementation ────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

#[async_trait]
impl RelayLauncher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn RelayProcess>, CoreError> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::RelayProcess {
                profile: spec.profile.clone(),
                reason: format!("cannot start {}: {e}", spec.program),
                transient: false,
            })?;

        if let Some(stderr) = child.stderr.take() {
            let profile = spec.profile.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(profile = %profile, "relay: {line}");
                }
            });
        }

        debug!(profile = %spec.profile, pid = ?child.id(), "relay spawned");
        Ok(Box::new(ChildRelay {
            profile: spec.profile.clone(),
            child,
        }))
    }
}

struct ChildRelay {
    profile: String,
    child: Child,
}

#[async_trait]
impl RelayProcess for ChildRelay {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> ExitOutcome {
        match self.child.wait().await {
            Ok(status) => status.into(),
            Err(e) => ExitOutcome::Lost(e.to_string()),
        }
    }

    async fn terminate(&mut self, grace: Duration) -> ExitOutcome {
        if let Some(pid) = self.child.id().and_then(|id| i32::try_from(id).ok()) {
            let pid = nix::unistd::Pid::from_raw(pid);
            if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                debug!(profile = %self.profile, error = %e, "SIGTERM failed");
            }
        }

        if let Ok(outcome) = tokio::time::timeout(grace, self.wait()).await {
            return outcome;
        }

        warn!(profile = %self.profile, grace_ms = grace.as_millis(), "relay ignored SIGTERM, killing");
        if let Err(e) = self.child.kill().await {
            return ExitOutcome::Lost(e.to_string());
        }
        self.wait().await
    }
}
