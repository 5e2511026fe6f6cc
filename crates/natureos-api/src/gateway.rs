//! The transport boundary the runtime depends on.
//!
//! [`Transport`] is the only thing `natureos-core` knows about the network:
//! request/response fetches, idempotent sends, and resumable sensor streams.
//! Every failure is reported as a [`TransportError`] whose `retryable` flag
//! is decided here, once, so that retry policy above this line never has to
//! inspect HTTP status codes or socket errors.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

use crate::models::ReadingRecord;

// ── Errors ───────────────────────────────────────────────────────────

/// Coarse failure classification reported alongside `retryable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Connect,
    RateLimited,
    Server,
    Unauthorized,
    NotFound,
    Rejected,
    Decode,
    Closed,
}

/// A failed call across the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    /// Whether repeating the call may succeed.
    pub retryable: bool,
    pub kind: FailureKind,
    pub message: String,
}

impl TransportError {
    pub fn retryable(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            kind,
            message: message.into(),
        }
    }

    pub fn fatal(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            kind,
            message: message.into(),
        }
    }

    /// A call that exceeded its deadline. Always retryable.
    pub fn timeout(after: Duration) -> Self {
        Self::retryable(
            FailureKind::Timeout,
            format!("no response within {}ms", after.as_millis()),
        )
    }

    /// True when the request may have reached the platform even though no
    /// response arrived (a send in this state must be treated as pending).
    pub fn is_ambiguous(&self) -> bool {
        matches!(self.kind, FailureKind::Timeout | FailureKind::Closed)
    }
}

// ── Call results ─────────────────────────────────────────────────────

/// Successful `fetch` payload with the platform-assigned resource version.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub payload: serde_json::Value,
    pub version: u64,
}

/// How far the platform got with a `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AckStatus {
    /// Receipt confirmed; execution still outstanding.
    Received,
    /// Receipt confirmed and the device reported completion.
    Completed,
    /// Received but refused by the platform or device.
    Rejected,
}

/// Successful `send` response.
#[derive(Debug, Clone, PartialEq)]
pub struct Ack {
    pub status: AckStatus,
    pub version: Option<u64>,
    pub payload: serde_json::Value,
}

impl Ack {
    pub fn received() -> Self {
        Self {
            status: AckStatus::Received,
            version: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn completed() -> Self {
        Self {
            status: AckStatus::Completed,
            ..Self::received()
        }
    }
}

// ── Streams ──────────────────────────────────────────────────────────

/// A position in a sensor stream: `(timestamp, sequence)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamPosition {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sequence: u64,
}

/// One item delivered by an open sensor stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A sensor reading, in stream order.
    Reading(ReadingRecord),
    /// The requested resume point is older than the platform retains.
    /// The stream continues from `earliest`.
    CursorExpired {
        requested: Option<StreamPosition>,
        earliest: Option<StreamPosition>,
    },
    /// Keep-alive with no payload.
    Heartbeat,
}

/// An open stream. `None` means a clean disconnect, `Some(Err(_))` a
/// disconnect with a reason; either way the stream is finished.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, TransportError>> + Send>>;

// ── Connectivity ─────────────────────────────────────────────────────

/// Latest known reachability of the platform, shared through a `watch`
/// channel so every consumer observes the same change notifications.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Record a reachability observation. Returns `true` if it changed.
    pub fn set(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(online, "connectivity changed");
        }
        changed
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

// ── Transport ────────────────────────────────────────────────────────

/// Authenticated access to the NatureOS platform.
///
/// Resource paths are relative (`"devices/esp32-001"`). Implementations
/// must treat `idempotency_key` as the platform's deduplication key:
/// delivering the same body twice under one key must be harmless.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(
        &self,
        path: &str,
        params: &[(&str, String)],
        tenant: &str,
    ) -> Result<Fetched, TransportError>;

    async fn send(
        &self,
        path: &str,
        body: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<Ack, TransportError>;

    async fn open_stream(
        &self,
        path: &str,
        from: Option<StreamPosition>,
    ) -> Result<EventStream, TransportError>;

    /// Connectivity change notifications.
    fn connectivity(&self) -> watch::Receiver<bool>;

    /// Cheap reachability check, used while offline to notice recovery.
    /// Implementations should update their connectivity signal.
    async fn probe(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
