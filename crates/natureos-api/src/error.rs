use thiserror::Error;

use crate::gateway::{FailureKind, TransportError};

/// Top-level error type for the `natureos-api` crate.
///
/// Covers every failure mode of the HTTP and WebSocket surfaces.
/// The [`Transport`](crate::Transport) boundary folds these into a
/// [`TransportError`] carrying the `retryable` decision.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// API key missing, invalid, or not allowed for this tenant (401/403).
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
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// TLS handshake or certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Platform responses ──────────────────────────────────────────
    /// The requested resource does not exist.
    #[error("Resource not found: {path}")]
    NotFound { path: String },

    /// Rate limited by the platform.
    #[error("Rate limited -- retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Any other non-success HTTP status.
    #[error("NatureOS API error (HTTP {status}): {message}")]
    Http { status: u16, message: String },

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Http { status, .. } => *status == 408 || *status >= 500,
            Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::WebSocketConnect(_)
            | Self::WebSocketClosed { .. } => true,
            _ => false,
        }
    }

    /// Returns `true` if the failure means the platform is unreachable,
    /// as opposed to reachable but unhappy with the request.
    pub fn is_connectivity_loss(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. } | Self::WebSocketConnect(_) => true,
            _ => false,
        }
    }

    /// Coarse classification used by [`TransportError`].
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Authentication { .. } => FailureKind::Unauthorized,
            Self::Transport(e) if e.is_timeout() => FailureKind::Timeout,
            Self::Transport(e) if e.is_connect() => FailureKind::Connect,
            Self::Transport(e) if e.is_decode() => FailureKind::Decode,
            Self::Transport(_) | Self::Tls(_) | Self::WebSocketConnect(_) => FailureKind::Connect,
            Self::InvalidUrl(_) => FailureKind::Rejected,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::NotFound { .. } => FailureKind::NotFound,
            Self::RateLimited { .. } => FailureKind::RateLimited,
            Self::Http { status, .. } if *status >= 500 || *status == 408 => FailureKind::Server,
            Self::Http { .. } => FailureKind::Rejected,
            Self::WebSocketClosed { .. } => FailureKind::Closed,
            Self::Deserialization { .. } => FailureKind::Decode,
        }
    }
}

impl From<Error> for TransportError {
    fn from(err: Error) -> Self {
        Self {
            retryable: err.is_retryable(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}
