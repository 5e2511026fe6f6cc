// ── Wire ↔ domain conversions ──
//
// The only place that knows both `natureos_api::models` and the domain
// model. Tenant ownership is checked here: a payload claiming another
// tenant is a scope violation, not data to cache.

use natureos_api::StreamPosition;
use natureos_api::models::{
    CommandRequest, CommandStatusRecord, DeviceRecord, ReadingRecord, RegisterDeviceRequest,
};
use serde_json::Value;

use crate::error::CoreError;
use crate::model::{Command, Cursor, Device, DeviceStatus, NewDevice, SensorReading, TenantId};

// ── Cursors ─────────────────────────────────────────────────────────

impl From<StreamPosition> for Cursor {
    fn from(p: StreamPosition) -> Self {
        Cursor::new(p.timestamp, p.sequence)
    }
}

impl From<Cursor> for StreamPosition {
    fn from(c: Cursor) -> Self {
        StreamPosition {
            timestamp: c.timestamp,
            sequence: c.sequence,
        }
    }
}

// ── Devices ─────────────────────────────────────────────────────────

pub(crate) fn device_from_record(record: DeviceRecord, tenant: &TenantId) -> Result<Device, CoreError> {
    if let Some(claimed) = record.tenant_id.as_deref().filter(|t| !t.is_empty()) {
        tenant.ensure_owns(&TenantId::new(claimed)?)?;
    }
    Ok(Device {
        name: record.name.unwrap_or_else(|| record.id.clone()),
        id: record.id,
        tenant_id: tenant.clone(),
        device_type: record.device_type.unwrap_or_default(),
        status: DeviceStatus::from_wire(record.status.as_deref()),
        last_seen: record.last_seen,
        location: record.location,
        metadata: record.metadata,
    })
}

pub(crate) fn device_from_payload(payload: Value, tenant: &TenantId) -> Result<Device, CoreError> {
    let record: DeviceRecord = serde_json::from_value(payload)?;
    device_from_record(record, tenant)
}

/// Device as we expect the platform to hold it right after registration.
pub(crate) fn device_from_registration(request: &NewDevice, tenant: &TenantId) -> Device {
    Device {
        id: request.device_id.clone(),
        tenant_id: tenant.clone(),
        name: request.name.clone(),
        device_type: request.device_type.clone(),
        status: DeviceStatus::Unknown,
        last_seen: None,
        location: request.location.clone(),
        metadata: request.metadata.clone(),
    }
}

pub(crate) fn register_request(request: &NewDevice) -> RegisterDeviceRequest {
    RegisterDeviceRequest {
        device_id: request.device_id.clone(),
        name: request.name.clone(),
        device_type: request.device_type.clone(),
        location: request.location.clone(),
        metadata: request.metadata.clone(),
    }
}

// ── Readings ────────────────────────────────────────────────────────

pub(crate) fn reading_from_record(record: ReadingRecord, tenant: &TenantId) -> SensorReading {
    SensorReading {
        tenant_id: tenant.clone(),
        device_id: record.device_id,
        sensor_type: record.sensor_type,
        timestamp: record.timestamp,
        sequence: record.sequence,
        value: record.value,
        unit: record.unit,
    }
}

// ── Commands ────────────────────────────────────────────────────────

pub(crate) fn command_request(command: &Command) -> CommandRequest {
    CommandRequest {
        command_id: command.id.to_string(),
        command_type: command.command_type.clone(),
        parameters: command.parameters.clone(),
    }
}

/// Platform-side outcome of a command that was already delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RemoteOutcome {
    Acknowledged,
    Failed(String),
    Outstanding,
}

pub(crate) fn remote_outcome(record: &CommandStatusRecord) -> RemoteOutcome {
    match record.status.to_ascii_lowercase().as_str() {
        "acknowledged" | "completed" | "executed" => RemoteOutcome::Acknowledged,
        "failed" | "rejected" => RemoteOutcome::Failed(
            record
                .error
                .clone()
                .unwrap_or_else(|| format!("platform reported {}", record.status)),
        ),
        _ => RemoteOutcome::Outstanding,
    }
}
