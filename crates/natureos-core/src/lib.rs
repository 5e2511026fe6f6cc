// natureos-core: offline cache, command sync, and sensor subscriptions
// between natureos-api and applications.

pub mod backoff;
pub mod client;
pub mod config;
mod convert;
pub mod error;
pub mod model;
pub mod store;
pub mod stream;
pub mod sync;

// ── Primary re-exports ──────────────────────────────────────────────
pub use backoff::BackoffConfig;
pub use client::Client;
pub use config::{ClientConfig, DEFAULT_API_URL, StoreConfig, StreamConfig, SyncConfig, TlsVerification};
pub use error::CoreError;
pub use store::{AppendOutcome, EntityFilter, LocalStore, PutOutcome, Query};
pub use stream::{Subscription, SubscriptionEvent, SubscriptionManager};
pub use sync::{
    CommandEvent, CommandHandle, DeviceQuery, DrainReport, Freshness, ReadResult, SensorQuery,
    SyncEngine,
};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    // Entities
    Command, Device, Entity, SensorReading,
    // Identity and versioning
    EntityKey, EntityType, EntityVersion, SeriesKey, TenantId, Versioned,
    // Commands
    CommandFailure, CommandState, FailureCause, NewCommand,
    // Devices
    DeviceStatus, MYCOBRAIN_DEVICE_TYPE, MycoBrainRegistration, NewDevice,
    // Streams
    CloseReason, Cursor, SubscriptionId, SubscriptionInfo, SubscriptionState,
};

pub use natureos_api::{Connectivity, Transport, TransportError};
