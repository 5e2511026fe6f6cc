// ── Runtime client configuration ──
//
// These types describe how the client talks to the platform and how
// aggressively it caches and retries. They never touch disk; the
// `natureos-config` crate builds a `ClientConfig` from profiles and env.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use crate::backoff::BackoffConfig;
use crate::model::TenantId;

/// Default platform endpoint for local development.
pub const DEFAULT_API_URL: &str = "http://localhost:8002";

/// TLS verification strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsVerification {
    /// System CA store (strict).
    #[default]
    SystemDefaults,
    /// Custom CA certificate file.
    CustomCa(PathBuf),
    /// Skip verification (self-signed development platforms).
    DangerAcceptInvalid,
}

/// Sync engine tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Deadline for every fetch and command delivery.
    pub request_timeout: Duration,
    /// Command delivery and uncached-read retry policy.
    pub retry: BackoffConfig,
    /// Background refresh period. Zero disables the periodic tick.
    pub refresh_interval: Duration,
    /// Staleness tolerated by reads that do not pass their own.
    pub max_staleness: Duration,
    /// How long terminal commands are kept before purge.
    pub command_retention: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            retry: BackoffConfig::default(),
            refresh_interval: Duration::from_secs(60),
            max_staleness: Duration::from_secs(60),
            command_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Stream subscription tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    pub reconnect: BackoffConfig,
    /// Bound on queued-but-undelivered events per subscription.
    pub listener_buffer: usize,
    /// Deadline for establishing a stream.
    pub open_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            reconnect: BackoffConfig::reconnect(),
            listener_buffer: 256,
            open_timeout: Duration::from_secs(30),
        }
    }
}

/// Local store tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Journal location; `None` keeps everything in memory.
    pub path: Option<PathBuf>,
    /// Command types that allow one in-flight command per device.
    pub exclusive_command_types: Vec<String>,
    /// Readings retained per `(device, sensor)` series before the oldest
    /// are evicted.
    pub max_readings_per_series: usize,
    /// Journal records appended before the store compacts itself. The
    /// effective threshold is the larger of this and twice the live
    /// record count at the previous compaction.
    pub compact_min_records: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            exclusive_command_types: Vec::new(),
            max_readings_per_series: 10_000,
            compact_min_records: 4096,
        }
    }
}

/// Everything needed to run a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Platform URL (e.g., `http://localhost:8002`).
    pub api_url: Url,
    pub api_key: Option<SecretString>,
    pub tenant: TenantId,
    pub tls: TlsVerification,
    pub sync: SyncConfig,
    pub stream: StreamConfig,
    pub store: StoreConfig,
}

impl ClientConfig {
    pub fn new(api_url: Url, tenant: TenantId) -> Self {
        Self {
            api_url,
            api_key: None,
            tenant,
            tls: TlsVerification::default(),
            sync: SyncConfig::default(),
            stream: StreamConfig::default(),
            store: StoreConfig::default(),
        }
    }

    pub fn with_api_key(mut self, key: SecretString) -> Self {
        self.api_key = Some(key);
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store.path = Some(path.into());
        self
    }
}
