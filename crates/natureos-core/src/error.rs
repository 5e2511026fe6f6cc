// ── Core error types ──
//
// Failures surfaced by the store, sync engine, and subscriptions.
// Transport failures arrive already classified; everything else here is
// structural and never retried.

use natureos_api::TransportError;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{CommandState, EntityVersion, SubscriptionId, TenantId};

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connectivity ─────────────────────────────────────────────────
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Platform unreachable and nothing cached for {what}")]
    Offline { what: String },

    // ── Structural ───────────────────────────────────────────────────
    #[error("Tenant scope violation: expected '{expected}', got '{found}'")]
    ScopeViolation { expected: TenantId, found: TenantId },

    #[error("Stale write to {key} rejected: stored {stored}, incoming {incoming}")]
    VersionConflict {
        key: String,
        stored: EntityVersion,
        incoming: EntityVersion,
    },

    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Entity not found: {entity_type} with id {identifier}")]
    NotFound {
        entity_type: String,
        identifier: String,
    },

    // ── Commands ─────────────────────────────────────────────────────
    #[error("Command {id} failed: {reason}")]
    CommandFailed { id: Uuid, reason: String },

    #[error("Command {existing} ({command_type}) is still in flight for device {device_id}")]
    CommandInFlight {
        device_id: String,
        command_type: String,
        existing: Uuid,
    },

    #[error("Command {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: CommandState,
        to: CommandState,
    },

    #[error("Rejected by platform: {message}")]
    Rejected { message: String },

    // ── Subscriptions ────────────────────────────────────────────────
    #[error("Subscription {id} is closed")]
    SubscriptionClosed { id: SubscriptionId },

    // ── Persistence ──────────────────────────────────────────────────
    #[error("Persistence error: {message}")]
    Persistence { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ── Lifecycle / internal ─────────────────────────────────────────
    #[error("Client is shutting down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether repeating the operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.retryable,
            Self::Offline { .. } => true,
            _ => false,
        }
    }

    pub(crate) fn persistence(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Persistence {
            message: format!("{context}: {err}"),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence {
            message: err.to_string(),
        }
    }
}

impl From<natureos_api::Error> for CoreError {
    fn from(err: natureos_api::Error) -> Self {
        Self::Transport(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use natureos_api::FailureKind;

    #[test]
    fn retryability_follows_transport_flag() {
        let transient = CoreError::from(TransportError::retryable(FailureKind::Server, "503"));
        let fatal = CoreError::from(TransportError::fatal(FailureKind::Unauthorized, "bad key"));

        assert!(transient.is_retryable());
        assert!(!fatal.is_retryable());
        assert!(CoreError::Offline { what: "device x".into() }.is_retryable());
        assert!(!CoreError::Validation { message: "x".into() }.is_retryable());
    }
}
