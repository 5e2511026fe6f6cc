// ── Sensor readings and stream cursors ──

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{SeriesKey, TenantId};

/// Position within one reading series. Orders by timestamp, then sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cursor {
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

impl Cursor {
    pub fn new(timestamp: DateTime<Utc>, sequence: u64) -> Self {
        Self {
            timestamp,
            sequence,
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.timestamp.to_rfc3339(), self.sequence)
    }
}

/// One immutable sensor sample.
///
/// `(timestamp, sequence)` is the identity within a series; the platform
/// assigns `sequence` so redelivered samples carry the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub tenant_id: TenantId,
    pub device_id: String,
    pub sensor_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub sequence: u64,
    pub value: f64,
    pub unit: Option<String>,
}

impl SensorReading {
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.timestamp, self.sequence)
    }

    pub fn series(&self) -> SeriesKey {
        SeriesKey::new(self.tenant_id.clone(), &self.device_id, &self.sensor_type)
    }
}
