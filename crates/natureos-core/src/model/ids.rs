// ── Identity and scoping types ──
//
// Every cached record is addressed by a tenant plus a type-local id.
// Tenant scope is part of the key, never a filter applied after lookup.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ── TenantId ────────────────────────────────────────────────────────

/// Isolation boundary for all cached data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Tenant used when the platform is not multi-tenant.
    pub const DEFAULT: &'static str = "default";

    pub fn new(raw: impl Into<String>) -> Result<Self, CoreError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CoreError::Validation {
                message: "tenant id must not be empty".into(),
            });
        }
        if trimmed.len() == raw.len() {
            Ok(Self(raw))
        } else {
            Ok(Self(trimmed.to_owned()))
        }
    }

    pub fn default_tenant() -> Self {
        Self(Self::DEFAULT.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Fail with `ScopeViolation` unless `other` is this tenant.
    pub fn ensure_owns(&self, other: &TenantId) -> Result<(), CoreError> {
        if self == other {
            Ok(())
        } else {
            Err(CoreError::ScopeViolation {
                expected: self.clone(),
                found: other.clone(),
            })
        }
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ── EntityType ──────────────────────────────────────────────────────

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityType {
    Device,
    SensorReading,
    Command,
}

// ── Keys ────────────────────────────────────────────────────────────

/// Storage key for devices and commands: `(tenant, type, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub tenant_id: TenantId,
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityKey {
    pub fn new(tenant_id: TenantId, entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self {
            tenant_id,
            entity_type,
            entity_id: entity_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.entity_type, self.entity_id)
    }
}

/// One append-only reading history: `(tenant, device, sensor type)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub tenant_id: TenantId,
    pub device_id: String,
    pub sensor_type: String,
}

impl SeriesKey {
    pub fn new(
        tenant_id: TenantId,
        device_id: impl Into<String>,
        sensor_type: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id,
            device_id: device_id.into(),
            sensor_type: sensor_type.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.device_id, self.sensor_type)
    }
}
