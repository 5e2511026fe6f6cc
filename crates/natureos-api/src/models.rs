// Wire shapes for the NatureOS REST and stream payloads.
//
// Field names follow the platform's snake_case JSON. Everything the
// runtime does not model explicitly is kept in `metadata`/`parameters`
// maps so nothing the platform sends is silently dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `{ "items": [...] }` list envelope.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Items<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

/// A device as returned by `GET /devices` and `GET /devices/{id}`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceRecord {
    #[serde(alias = "device_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "type")]
    pub device_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub location: Option<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub version: Option<u64>,
}

/// Body of `POST /devices/register`.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterDeviceRequest {
    pub device_id: String,
    pub name: String,
    pub device_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Value>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

/// A single sensor sample, from `GET /devices/{id}/sensor-data` or a stream.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ReadingRecord {
    pub device_id: String,
    pub sensor_type: String,
    pub timestamp: DateTime<Utc>,
    /// Platform-assigned tie breaker for readings sharing a timestamp.
    #[serde(default)]
    pub sequence: u64,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

/// Body of `POST /devices/{id}/commands`.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRequest {
    pub command_id: String,
    pub command_type: String,
    pub parameters: Map<String, Value>,
}

/// Response of `GET /devices/{id}/commands/{command_id}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandStatusRecord {
    #[serde(default, alias = "id")]
    pub command_id: Option<String>,
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn device_record_accepts_original_field_names() {
        let record: DeviceRecord = serde_json::from_value(json!({
            "device_id": "esp32-001",
            "name": "Greenhouse node",
            "type": "mycobrain",
            "status": "online",
            "firmware": "1.4.2"
        }))
        .unwrap();

        assert_eq!(record.id, "esp32-001");
        assert_eq!(record.device_type.as_deref(), Some("mycobrain"));
        assert!(record.metadata.is_empty());
        assert!(record.version.is_none());
    }

    #[test]
    fn reading_sequence_defaults_to_zero() {
        let record: ReadingRecord = serde_json::from_value(json!({
            "device_id": "esp32-001",
            "sensor_type": "temperature",
            "timestamp": "2026-01-01T00:00:00Z",
            "value": 21.5,
            "unit": "C"
        }))
        .unwrap();

        assert_eq!(record.sequence, 0);
        assert_eq!(record.unit.as_deref(), Some("C"));
    }

    #[test]
    fn register_request_omits_empty_optionals() {
        let body = serde_json::to_value(RegisterDeviceRequest {
            device_id: "esp32-001".into(),
            name: "Node".into(),
            device_type: "sensor".into(),
            location: None,
            metadata: Map::new(),
        })
        .unwrap();

        assert_eq!(
            body,
            json!({ "device_id": "esp32-001", "name": "Node", "device_type": "sensor" })
        );
    }
}
