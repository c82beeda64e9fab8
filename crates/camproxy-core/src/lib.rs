// camproxy-core: the camera adapter engine between a physical camera and the
// NVR control channel.

pub mod adapter;
pub mod backoff;
pub mod bridge;
pub mod capability;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod model;
pub mod snapshot;
pub mod supervisor;

// ── Primary re-exports ──────────────────────────────────────────────
pub use adapter::{Adapter, resolve_token};
pub use backoff::BackoffPolicy;
pub use bridge::{AdapterStatus, Bridge, ConnectionState};
pub use capability::{CameraCapability, SnapshotMethod, Vendor};
pub use config::AdapterConfig;
pub use error::CoreError;
pub use events::{EventEngine, EventKind, EventSource, MotionEvent, RawSignal, Transition};
pub use identity::{DeviceIdentity, IdentityManager, IdentityMaterial};
pub use model::{DesiredState, Health, MacAddress, RelayTarget, StreamProfile, Transport};
pub use snapshot::SnapshotResolver;
pub use supervisor::{HealthUpdate, RelayCommand, Supervisor};
