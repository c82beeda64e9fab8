// camproxy-api: wire-level clients for the camera adapter
//
// NVR side: the mTLS control-channel websocket, its message model, the
// Protect adoption-token fetch, and snapshot uploads. Camera side: ONVIF
// (events and media) and plain HTTP snapshot fetches.

pub mod error;
pub mod http;
pub mod onvif;
pub mod protect;
pub mod protocol;
pub mod transport;
pub mod websocket;

pub use error::Error;
pub use transport::{TlsMode, TransportConfig};
