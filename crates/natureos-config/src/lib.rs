//! Configuration for NatureOS clients.
//!
//! TOML profiles, environment overrides, API key resolution (env var,
//! then keyring, then plaintext), and translation to
//! `natureos_core::ClientConfig`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use natureos_core::{BackoffConfig, ClientConfig, DEFAULT_API_URL, TenantId, TlsVerification};

/// Variables honoured for the active profile, as the platform SDKs name them.
pub const ENV_API_URL: &str = "NATUREOS_API_URL";
pub const ENV_API_KEY: &str = "NATUREOS_API_KEY";
pub const ENV_TENANT_ID: &str = "NATUREOS_TENANT_ID";

const KEYRING_SERVICE: &str = "natureos";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("profile '{0}' is not defined")]
    UnknownProfile(String),

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Profile used when none is named.
    pub default_profile: Option<String>,

    #[serde(default)]
    pub defaults: Defaults,

    #[serde(default)]
    pub profiles: HashMap<String, Profile>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: Some("default".into()),
            defaults: Defaults::default(),
            profiles: HashMap::new(),
        }
    }
}

/// Values every profile inherits unless it overrides them.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Defaults {
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Delivery attempts per command before it fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Background refresh period in seconds; 0 disables it.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,

    /// Age in seconds after which a cached read is refetched.
    #[serde(default = "default_max_staleness")]
    pub max_staleness: u64,

    #[serde(default = "default_listener_buffer")]
    pub listener_buffer: usize,

    #[serde(default = "default_command_retention_days")]
    pub command_retention_days: u64,

    #[serde(default = "default_max_readings")]
    pub max_readings_per_series: usize,

    /// Keep the local store on disk under the platform data directory.
    #[serde(default = "default_true")]
    pub persist: bool,

    #[serde(default)]
    pub insecure: bool,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            max_retries: default_max_retries(),
            refresh_interval: default_refresh_interval(),
            max_staleness: default_max_staleness(),
            listener_buffer: default_listener_buffer(),
            command_retention_days: default_command_retention_days(),
            max_readings_per_series: default_max_readings(),
            persist: true,
            insecure: false,
        }
    }
}

fn default_timeout() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_refresh_interval() -> u64 {
    60
}
fn default_max_staleness() -> u64 {
    60
}
fn default_listener_buffer() -> usize {
    256
}
fn default_command_retention_days() -> u64 {
    7
}
fn default_max_readings() -> usize {
    10_000
}
fn default_true() -> bool {
    true
}

/// A named platform profile.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Profile {
    /// Platform base URL (e.g., "https://api.natureos.example").
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Tenant scope for every request and cached record.
    pub tenant_id: Option<String>,

    /// API key (plaintext; prefer keyring or env var).
    pub api_key: Option<String>,

    /// Environment variable holding the API key. Defaults to `NATUREOS_API_KEY`.
    pub api_key_env: Option<String>,

    /// Path to a custom CA certificate.
    pub ca_cert: Option<PathBuf>,

    pub insecure: Option<bool>,
    pub timeout: Option<u64>,
    pub max_retries: Option<u32>,

    /// Journal location. Defaults to `<data dir>/<profile>.jsonl` when
    /// `defaults.persist` is set.
    pub store_path: Option<PathBuf>,

    /// Command types limited to one in-flight command per device.
    #[serde(default)]
    pub exclusive_command_types: Vec<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            tenant_id: None,
            api_key: None,
            api_key_env: None,
            ca_cert: None,
            insecure: None,
            timeout: None,
            max_retries: None,
            store_path: None,
            exclusive_command_types: Vec::new(),
        }
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.into()
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "natureos", "natureos")
}

fn home_fallback(kind: &str) -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(kind);
    p.push("natureos");
    p
}

/// Config file path following platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || home_fallback(".config").join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Default journal path for a profile's local store.
pub fn default_store_path(profile_name: &str) -> PathBuf {
    let file = format!("{profile_name}.jsonl");
    project_dirs().map_or_else(
        || home_fallback(".local/share").join(&file),
        |dirs| dirs.data_dir().join(&file),
    )
}

// ── Loading & saving ────────────────────────────────────────────────

/// Load from the canonical config path plus environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Defaults, then the TOML file at `path` (if present), then
/// `NATUREOS_`-prefixed variables (`NATUREOS_DEFAULTS__TIMEOUT=10`).
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("NATUREOS_").split("__"))
        .extract()?;
    debug!(path = %path.display(), profiles = config.profiles.len(), "config loaded");
    Ok(config)
}

pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

pub fn save_config(cfg: &Config) -> Result<(), ConfigError> {
    save_config_to(cfg, &config_path())
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(cfg)?)?;
    Ok(())
}

// ── Profile selection ───────────────────────────────────────────────

impl Config {
    /// The profile named `name`, or the default one.
    ///
    /// An unconfigured default profile resolves to the built-in one
    /// (local platform, default tenant) so env vars alone are enough.
    pub fn profile(&self, name: Option<&str>) -> Result<(String, Profile), ConfigError> {
        let name = name
            .or(self.default_profile.as_deref())
            .unwrap_or("default")
            .to_owned();
        match self.profiles.get(&name) {
            Some(profile) => Ok((name, profile.clone())),
            None if name == "default" => Ok((name, Profile::default())),
            None => Err(ConfigError::UnknownProfile(name)),
        }
    }
}

// ── Credential resolution ───────────────────────────────────────────

/// API key from the first source that has one: the profile's env var
/// (`NATUREOS_API_KEY` unless overridden), the system keyring, then
/// plaintext in the profile. `None` means unauthenticated access.
pub fn resolve_api_key(profile: &Profile, profile_name: &str) -> Option<SecretString> {
    let env_name = profile.api_key_env.as_deref().unwrap_or(ENV_API_KEY);
    if let Ok(val) = std::env::var(env_name) {
        if !val.is_empty() {
            return Some(SecretString::from(val));
        }
    }

    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &keyring_user(profile_name)) {
        if let Ok(secret) = entry.get_password() {
            return Some(SecretString::from(secret));
        }
    }

    profile.api_key.clone().map(SecretString::from)
}

/// Store an API key in the system keyring for `profile_name`.
pub fn store_api_key(profile_name: &str, key: &str) -> Result<(), ConfigError> {
    keyring::Entry::new(KEYRING_SERVICE, &keyring_user(profile_name))?.set_password(key)?;
    Ok(())
}

fn keyring_user(profile_name: &str) -> String {
    format!("{profile_name}/api-key")
}

// ── ClientConfig translation ────────────────────────────────────────

/// Build a `ClientConfig` for `profile`, applying `NATUREOS_API_URL` and
/// `NATUREOS_TENANT_ID` on top of the file values.
pub fn profile_to_client_config(
    profile: &Profile,
    profile_name: &str,
    defaults: &Defaults,
) -> Result<ClientConfig, ConfigError> {
    let raw_url = std::env::var(ENV_API_URL).unwrap_or_else(|_| profile.api_url.clone());
    let api_url: url::Url = raw_url.parse().map_err(|_| ConfigError::Validation {
        field: "api_url".into(),
        reason: format!("invalid URL: {raw_url}"),
    })?;

    let tenant = match std::env::var(ENV_TENANT_ID).ok().or_else(|| profile.tenant_id.clone()) {
        Some(raw) => TenantId::new(raw).map_err(|e| ConfigError::Validation {
            field: "tenant_id".into(),
            reason: e.to_string(),
        })?,
        None => TenantId::default_tenant(),
    };

    let tls = if profile.insecure.unwrap_or(defaults.insecure) {
        TlsVerification::DangerAcceptInvalid
    } else if let Some(ref ca_path) = profile.ca_cert {
        TlsVerification::CustomCa(ca_path.clone())
    } else {
        TlsVerification::SystemDefaults
    };

    let timeout = Duration::from_secs(profile.timeout.unwrap_or(defaults.timeout));
    let max_retries = profile.max_retries.unwrap_or(defaults.max_retries);
    if max_retries == 0 {
        return Err(ConfigError::Validation {
            field: "max_retries".into(),
            reason: "must be at least 1".into(),
        });
    }

    let mut config = ClientConfig::new(api_url, tenant);
    config.api_key = resolve_api_key(profile, profile_name);
    config.tls = tls;

    config.sync.request_timeout = timeout;
    config.sync.retry = BackoffConfig {
        max_attempts: Some(max_retries),
        ..BackoffConfig::default()
    };
    config.sync.refresh_interval = Duration::from_secs(defaults.refresh_interval);
    config.sync.max_staleness = Duration::from_secs(defaults.max_staleness);
    config.sync.command_retention = Duration::from_secs(defaults.command_retention_days.saturating_mul(24 * 60 * 60));

    config.stream.listener_buffer = defaults.listener_buffer;
    config.stream.open_timeout = timeout;

    config.store.path = profile
        .store_path
        .clone()
        .or_else(|| defaults.persist.then(|| default_store_path(profile_name)));
    config.store.exclusive_command_types = profile.exclusive_command_types.clone();
    config.store.max_readings_per_series = defaults.max_readings_per_series;

    Ok(config)
}

/// Load the config file and build the `ClientConfig` for `profile`
/// (or the default profile).
pub fn client_config(profile: Option<&str>) -> Result<ClientConfig, ConfigError> {
    let config = load_config()?;
    let (name, selected) = config.profile(profile)?;
    profile_to_client_config(&selected, &name, &config.defaults)
}
