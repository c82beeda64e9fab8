use thiserror::Error;

/// Top-level error type for the `camproxy-api` crate.
///
/// Covers every wire-level failure mode: HTTP transport, TLS material,
/// the NVR websocket, ONVIF SOAP faults, and payload decoding.
/// `camproxy-core` maps these into its adapter-level taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// Login failed (wrong credentials, account locked, etc.)
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Request timed out.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Non-success HTTP status from a camera or NVR endpoint.
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    /// TLS handshake, certificate, or key material error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed by the peer.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    // ── ONVIF ───────────────────────────────────────────────────────
    /// SOAP fault returned by the camera.
    #[error("ONVIF fault: {reason}")]
    SoapFault { reason: String },

    /// A required element was missing from an ONVIF response.
    #[error("ONVIF response missing <{element}>")]
    MissingElement { element: &'static str },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } | Self::WebSocketConnect(_) | Self::WebSocketClosed { .. } => {
                true
            }
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` if the peer rejected our credentials.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::Authentication { .. } => true,
            Self::Status { status, .. } => *status == 401 || *status == 403,
            Self::SoapFault { reason } => reason.contains("NotAuthorized"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let err = Error::Status {
            status: 503,
            url: "http://cam/snap.jpg".into(),
        };
        assert!(err.is_transient());
        assert!(!err.is_auth_failure());
    }

    #[test]
    fn onvif_not_authorized_is_auth_failure() {
        let err = Error::SoapFault {
            reason: "ter:NotAuthorized".into(),
        };
        assert!(err.is_auth_failure());
        assert!(!err.is_transient());
    }
}
