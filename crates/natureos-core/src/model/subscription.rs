// ── Subscription descriptors ──

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ids::TenantId;
use super::reading::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Per-subscription jitter seed so reconnects do not line up.
    pub(crate) fn seed(self) -> u64 {
        self.0.as_u64_pair().0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `connecting → live → (backoff → connecting)* → closed`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubscriptionState {
    Connecting,
    Live,
    Backoff,
    Closed,
}

/// Why a subscription reached `closed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    /// `close()` was called.
    Requested,
    /// The listener handle was dropped.
    ListenerDropped,
    /// The platform refused the stream (auth, unknown device).
    Fatal(String),
    /// Reconnect attempts ran out.
    RetriesExhausted,
    /// The owning client shut down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("closed by caller"),
            Self::ListenerDropped => f.write_str("listener dropped"),
            Self::Fatal(reason) => write!(f, "fatal stream error: {reason}"),
            Self::RetriesExhausted => f.write_str("reconnect attempts exhausted"),
            Self::Shutdown => f.write_str("client shut down"),
        }
    }
}

/// Point-in-time view of one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub tenant_id: TenantId,
    pub device_id: String,
    pub sensor_type: String,
    pub state: SubscriptionState,
    /// Last delivered position.
    pub cursor: Option<Cursor>,
    pub reconnects: u32,
    pub delivered: u64,
    pub close_reason: Option<CloseReason>,
}
