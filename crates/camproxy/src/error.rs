//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and stable exit codes.

use miette::Diagnostic;
use thiserror::Error;

use camproxy_config::ConfigError;
use camproxy_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const AUTH: i32 = 3;
    pub const CONFIG: i32 = 4;
    pub const CONNECTION: i32 = 7;
    pub const IDENTITY: i32 = 9;
    pub const RELAY: i32 = 10;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Configuration ────────────────────────────────────────────────
    #[error("Invalid configuration value for {field}: {reason}")]
    #[diagnostic(
        code(camproxy::invalid_config),
        help(
            "Set it in the config file, as CAMPROXY_<SECTION>__<KEY>, or with a flag.\n\
             Inspect the merged result with: camproxy config"
        )
    )]
    InvalidConfig { field: String, reason: String },

    #[error("Configuration could not be loaded")]
    #[diagnostic(code(camproxy::config_load), help("{detail}"))]
    ConfigLoad { detail: String },

    #[error("{message}")]
    #[diagnostic(
        code(camproxy::config),
        help(
            "Provide an adoption token (--token or [nvr].token), or NVR\n\
             credentials ([nvr].username / password) so one can be fetched."
        )
    )]
    Config { message: String },

    // ── Identity ─────────────────────────────────────────────────────
    #[error("Identity artifact {path} is corrupt: {reason}")]
    #[diagnostic(
        code(camproxy::identity_corrupt),
        help(
            "The adapter never overwrites an existing identity.\n\
             Restore the file from a backup, or delete it to generate a new one\n\
             (the NVR will then see a new camera that must be adopted again)."
        )
    )]
    IdentityCorrupt { path: String, reason: String },

    // ── Connectivity ─────────────────────────────────────────────────
    #[error("Could not connect to {target}")]
    #[diagnostic(
        code(camproxy::connection_failed),
        help("Check that the address is reachable from this host.\nReason: {reason}")
    )]
    ConnectionFailed { target: String, reason: String },

    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(camproxy::auth_failed),
        help("Verify the NVR username and password, or pass a token with --token.")
    )]
    AuthFailed { message: String },

    // ── Relay ────────────────────────────────────────────────────────
    #[error("Relay for profile '{profile}' cannot start: {reason}")]
    #[diagnostic(
        code(camproxy::relay),
        help("Check [relay].program is installed and on PATH.")
    )]
    Relay { profile: String, reason: String },

    // ── Everything else ──────────────────────────────────────────────
    #[error(transparent)]
    #[diagnostic(code(camproxy::core))]
    Core(CoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidConfig { .. } | Self::ConfigLoad { .. } | Self::Config { .. } => {
                exit_code::CONFIG
            }
            Self::IdentityCorrupt { .. } => exit_code::IDENTITY,
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::AuthFailed { .. } => exit_code::AUTH,
            Self::Relay { .. } => exit_code::RELAY,
            Self::Core(_) | Self::Io(_) => exit_code::GENERAL,
        }
    }
}

// ── Conversions ──────────────────────────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::InvalidConfig { field, reason },
            other => Self::ConfigLoad {
                detail: other.to_string(),
            },
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::IdentityCorrupt { path, reason } => Self::IdentityCorrupt {
                path: path.display().to_string(),
                reason,
            },
            CoreError::Connection { target, reason } => Self::ConnectionFailed { target, reason },
            CoreError::Authentication { message } => Self::AuthFailed { message },
            CoreError::RelayProcess {
                profile, reason, ..
            } => Self::Relay { profile, reason },
            CoreError::Config { message } => Self::Config { message },
            other => Self::Core(other),
        }
    }
}
