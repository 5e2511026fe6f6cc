// ── Device domain types ──

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::TenantId;

/// Reported device reachability.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum DeviceStatus {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl DeviceStatus {
    /// Lenient parse of the platform's status string.
    pub fn from_wire(raw: Option<&str>) -> Self {
        raw.and_then(|s| s.parse().ok()).unwrap_or_default()
    }
}

/// A registered device as cached by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub tenant_id: TenantId,
    pub name: String,
    pub device_type: String,
    pub status: DeviceStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub location: Option<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Device type string used for MycoBrain boards.
pub const MYCOBRAIN_DEVICE_TYPE: &str = "mycobrain";

/// Registration request for a new device.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDevice {
    pub device_id: String,
    pub name: String,
    pub device_type: String,
    pub location: Option<Value>,
    pub metadata: Map<String, Value>,
}

impl NewDevice {
    pub fn new(
        device_id: impl Into<String>,
        name: impl Into<String>,
        device_type: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            name: name.into(),
            device_type: device_type.into(),
            location: None,
            metadata: Map::new(),
        }
    }

    pub fn with_location(mut self, location: Value) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Registration details specific to MycoBrain boards.
#[derive(Debug, Clone, PartialEq)]
pub struct MycoBrainRegistration {
    pub device_id: String,
    pub serial_number: String,
    pub name: String,
    pub firmware_version: Option<String>,
    pub location: Option<Value>,
    pub metadata: Map<String, Value>,
}

impl MycoBrainRegistration {
    pub fn new(
        device_id: impl Into<String>,
        serial_number: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            serial_number: serial_number.into(),
            name: name.into(),
            firmware_version: None,
            location: None,
            metadata: Map::new(),
        }
    }

    pub fn with_firmware(mut self, version: impl Into<String>) -> Self {
        self.firmware_version = Some(version.into());
        self
    }

    pub fn with_location(mut self, location: Value) -> Self {
        self.location = Some(location);
        self
    }
}

impl From<MycoBrainRegistration> for NewDevice {
    fn from(reg: MycoBrainRegistration) -> Self {
        let mut metadata = reg.metadata;
        metadata.insert("serial_number".into(), Value::String(reg.serial_number));
        if let Some(firmware) = reg.firmware_version {
            metadata.insert("firmware_version".into(), Value::String(firmware));
        }
        Self {
            device_id: reg.device_id,
            name: reg.name,
            device_type: MYCOBRAIN_DEVICE_TYPE.into(),
            location: reg.location,
            metadata,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_parse_is_lenient() {
        assert_eq!(DeviceStatus::from_wire(Some("ONLINE")), DeviceStatus::Online);
        assert_eq!(DeviceStatus::from_wire(Some("rebooting")), DeviceStatus::Unknown);
        assert_eq!(DeviceStatus::from_wire(None), DeviceStatus::Unknown);
    }

    #[test]
    fn mycobrain_registration_fills_type_and_metadata() {
        let reg = MycoBrainRegistration::new("mb-7", "SN-0042", "Grow tent")
            .with_firmware("2.1.0")
            .with_location(json!({ "lat": 45.5, "lon": -122.6 }));

        let device = NewDevice::from(reg);

        assert_eq!(device.device_type, "mycobrain");
        assert_eq!(device.metadata["serial_number"], "SN-0042");
        assert_eq!(device.metadata["firmware_version"], "2.1.0");
        assert!(device.location.is_some());
    }
}
