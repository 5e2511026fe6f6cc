// ── Sync engine ──
//
// The only component that talks to the transport for request/response
// work, and the only writer of command state. Reads go cache-first with a
// staleness bound; commands are persisted before the first network
// attempt and delivered with bounded, jittered backoff.

mod commands;
mod engine;

use chrono::{DateTime, Utc};

use crate::model::{DeviceStatus, SensorReading};

pub use commands::{CommandEvent, CommandHandle, DrainReport};
pub use engine::SyncEngine;

/// Where a read result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Freshness {
    /// Served from the local store within the staleness bound.
    Cached,
    /// Fetched from the platform by this call.
    Fetched,
    /// Older than requested; the platform could not be reached.
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult<T> {
    pub value: T,
    pub freshness: Freshness,
    /// When the underlying data was last confirmed by the platform.
    pub fetched_at: DateTime<Utc>,
}

impl<T> ReadResult<T> {
    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Stale
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ReadResult<U> {
        ReadResult {
            value: f(self.value),
            freshness: self.freshness,
            fetched_at: self.fetched_at,
        }
    }
}

/// Filters for [`SyncEngine::list_devices`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceQuery {
    pub device_type: Option<String>,
    pub status: Option<DeviceStatus>,
    pub limit: usize,
}

impl Default for DeviceQuery {
    fn default() -> Self {
        Self {
            device_type: None,
            status: None,
            limit: 100,
        }
    }
}

impl DeviceQuery {
    pub fn of_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = Some(device_type.into());
        self
    }

    pub fn with_status(mut self, status: DeviceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub(crate) fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("limit", self.limit.to_string())];
        if let Some(ref t) = self.device_type {
            params.push(("device_type", t.clone()));
        }
        if let Some(status) = self.status {
            params.push(("status", status.to_string()));
        }
        params
    }
}

/// Window and filters for [`SyncEngine::sensor_history`].
///
/// Without explicit bounds the window is the 24 hours before the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorQuery {
    pub device_id: String,
    pub sensor_type: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl SensorQuery {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            sensor_type: None,
            start: None,
            end: None,
            limit: 1000,
        }
    }

    pub fn sensor(mut self, sensor_type: impl Into<String>) -> Self {
        self.sensor_type = Some(sensor_type.into());
        self
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Resolved `(start, end)` relative to `now`.
    pub(crate) fn window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let end = self.end.unwrap_or(now);
        let start = self.start.unwrap_or(end - chrono::Duration::hours(24));
        (start, end)
    }

    pub(crate) fn params(&self, now: DateTime<Utc>) -> Vec<(&'static str, String)> {
        let (start, end) = self.window(now);
        let mut params = vec![
            ("start_time", start.to_rfc3339()),
            ("end_time", end.to_rfc3339()),
            ("limit", self.limit.to_string()),
        ];
        if let Some(ref s) = self.sensor_type {
            params.push(("sensor_type", s.clone()));
        }
        params
    }
}

/// Readings ordered the way the store orders them.
pub(crate) fn sort_readings(readings: &mut [SensorReading]) {
    readings.sort_by(|a, b| {
        a.cursor()
            .cmp(&b.cursor())
            .then_with(|| a.sensor_type.cmp(&b.sensor_type))
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn sensor_window_defaults_to_last_day() {
        let now = DateTime::from_timestamp(1_000_000, 0).unwrap();
        let (start, end) = SensorQuery::new("esp32-001").window(now);
        assert_eq!(end, now);
        assert_eq!(end - start, chrono::Duration::hours(24));

        let params = SensorQuery::new("esp32-001").sensor("humidity").params(now);
        assert!(params.contains(&("sensor_type", "humidity".to_string())));
        assert!(params.contains(&("limit", "1000".to_string())));
    }

    #[test]
    fn device_query_params() {
        let params = DeviceQuery::default()
            .of_type("mycobrain")
            .with_status(DeviceStatus::Online)
            .params();
        assert_eq!(
            params,
            vec![
                ("limit", "100".to_string()),
                ("device_type", "mycobrain".to_string()),
                ("status", "online".to_string()),
            ]
        );
    }
}
