// ── Cacheable entities ──

use serde::{Deserialize, Serialize};

use super::command::Command;
use super::device::Device;
use super::ids::{EntityKey, EntityType, TenantId};

/// Anything held in the keyed entity table.
///
/// Sensor readings live in their own append-only series and are not
/// stored here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Entity {
    Device(Device),
    Command(Command),
}

impl Entity {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Device(_) => EntityType::Device,
            Self::Command(_) => EntityType::Command,
        }
    }

    pub fn entity_id(&self) -> String {
        match self {
            Self::Device(d) => d.id.clone(),
            Self::Command(c) => c.id.to_string(),
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        match self {
            Self::Device(d) => &d.tenant_id,
            Self::Command(c) => &c.tenant_id,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.tenant_id().clone(), self.entity_type(), self.entity_id())
    }

    pub fn as_device(&self) -> Option<&Device> {
        match self {
            Self::Device(d) => Some(d),
            Self::Command(_) => None,
        }
    }

    pub fn as_command(&self) -> Option<&Command> {
        match self {
            Self::Command(c) => Some(c),
            Self::Device(_) => None,
        }
    }
}

impl From<Device> for Entity {
    fn from(d: Device) -> Self {
        Self::Device(d)
    }
}

impl From<Command> for Entity {
    fn from(c: Command) -> Self {
        Self::Command(c)
    }
}
