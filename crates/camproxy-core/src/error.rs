// ── Core error types ──
//
// Adapter-level failures. Wire-level detail from camproxy-api is folded into
// this taxonomy by the `From<camproxy_api::Error>` impl; components report
// contained failures as health/status changes and only bubble these up when
// the caller has to decide something.

use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Identity ─────────────────────────────────────────────────────
    /// A partial or unreadable identity artifact. Never repaired automatically.
    #[error("Identity artifact {} is corrupt: {reason}", path.display())]
    IdentityCorrupt { path: PathBuf, reason: String },

    // ── Connectivity ─────────────────────────────────────────────────
    /// Control channel or camera-facing network failure. Recoverable.
    #[error("Connection to {target} failed: {reason}")]
    Connection { target: String, reason: String },

    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Relay ────────────────────────────────────────────────────────
    #[error("Relay for profile '{profile}' failed: {reason}")]
    RelayProcess {
        profile: String,
        reason: String,
        transient: bool,
    },

    #[error("Unknown stream profile: {profile}")]
    UnknownProfile { profile: String },

    // ── Snapshots & events ───────────────────────────────────────────
    #[error("Snapshot unavailable: {attempts}")]
    SnapshotUnavailable { attempts: String },

    #[error("Event source {source_name} failed: {reason}")]
    EventSourceTimeout { source_name: String, reason: String },

    // ── Configuration / plumbing ─────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Adapter shut down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Connection { .. }
            | Self::SnapshotUnavailable { .. }
            | Self::EventSourceTimeout { .. } => true,
            Self::RelayProcess { transient, .. } => *transient,
            _ => false,
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<camproxy_api::Error> for CoreError {
    fn from(err: camproxy_api::Error) -> Self {
        use camproxy_api::Error as Api;

        if err.is_auth_failure() {
            return Self::Authentication {
                message: err.to_string(),
            };
        }

        match err {
            Api::Transport(ref e) => Self::Connection {
                target: e
                    .url()
                    .map_or_else(|| "<unknown>".into(), camproxy_api::http::redacted),
                reason: err.to_string(),
            },
            Api::Status { ref url, .. } => Self::Connection {
                target: url.clone(),
                reason: err.to_string(),
            },
            Api::Timeout { .. }
            | Api::Tls(_)
            | Api::WebSocketConnect(_)
            | Api::WebSocketClosed { .. } => Self::Connection {
                target: "NVR".into(),
                reason: err.to_string(),
            },
            Api::SoapFault { .. } | Api::MissingElement { .. } => Self::EventSourceTimeout {
                source_name: "onvif".into(),
                reason: err.to_string(),
            },
            Api::InvalidUrl(e) => Self::Config {
                message: format!("Invalid URL: {e}"),
            },
            Api::Deserialization { message, .. } => {
                Self::Internal(format!("Deserialization error: {message}"))
            }
            Api::Authentication { message } => Self::Authentication { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_auth_failures_map_to_authentication() {
        let err: CoreError = camproxy_api::Error::Status {
            status: 401,
            url: "https://nvr/api".into(),
        }
        .into();
        assert!(matches!(err, CoreError::Authentication { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn websocket_drops_are_recoverable_connection_errors() {
        let err: CoreError = camproxy_api::Error::WebSocketClosed {
            code: 1006,
            reason: "abnormal".into(),
        }
        .into();
        assert!(matches!(err, CoreError::Connection { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn fatal_relay_errors_are_not_recoverable() {
        let err = CoreError::RelayProcess {
            profile: "main".into(),
            reason: "binary missing".into(),
            transient: false,
        };
        assert!(!err.is_recoverable());
    }
}
