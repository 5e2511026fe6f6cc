// ── Domain model ──
//
// Canonical types the store, sync engine, and subscriptions share.
// Wire shapes live in `natureos_api::models`; `crate::convert` maps them.

pub mod command;
pub mod device;
pub mod entity;
pub mod ids;
pub mod reading;
pub mod subscription;
pub mod version;

pub use command::{Command, CommandFailure, CommandState, FailureCause, NewCommand};
pub use device::{Device, DeviceStatus, MYCOBRAIN_DEVICE_TYPE, MycoBrainRegistration, NewDevice};
pub use entity::Entity;
pub use ids::{EntityKey, EntityType, SeriesKey, TenantId};
pub use reading::{Cursor, SensorReading};
pub use subscription::{CloseReason, SubscriptionId, SubscriptionInfo, SubscriptionState};
pub use version::{EntityVersion, Versioned};
