// ── Sensor stream subscriptions ──
//
// Each subscription is an independent task with its own cursor, backoff
// schedule, and bounded listener queue. Readings are written to the local
// store, then forwarded if they lie past the subscription's own cursor;
// that cursor makes delivery exactly-once across reconnects.

mod manager;
mod subscription;
mod worker;

pub use manager::SubscriptionManager;
pub use subscription::{Subscription, SubscriptionEvent};
