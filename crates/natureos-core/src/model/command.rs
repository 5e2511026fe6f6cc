// ── Remote commands ──
//
// A command is created locally, persisted before any network attempt,
// and then walks a one-way state machine:
//
//   pending ──► sent ──► acknowledged
//      │          │
//      └──────────┴────► failed
//
// `acknowledged` and `failed` are terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::ids::TenantId;
use crate::error::CoreError;

// ── State machine ───────────────────────────────────────────────────

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CommandState {
    Pending,
    Sent,
    Acknowledged,
    Failed,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acknowledged | Self::Failed)
    }

    /// Whether `self -> next` is a forward edge of the state machine.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Sent | Self::Failed) | (Self::Sent, Self::Acknowledged | Self::Failed)
        )
    }
}

/// Why a command ended in `failed`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureCause {
    /// Every delivery attempt failed with a retryable error.
    Exhausted,
    /// The platform or device refused it, or a non-retryable error occurred.
    Rejected,
    /// Cancelled locally. The platform may still have executed it.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailure {
    pub cause: FailureCause,
    pub message: String,
}

// ── Command ─────────────────────────────────────────────────────────

/// A command addressed to one device, as tracked by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Client-generated; doubles as the platform idempotency key.
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub device_id: String,
    pub command_type: String,
    pub parameters: Map<String, Value>,
    pub state: CommandState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Delivery attempts made so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub failure: Option<CommandFailure>,
}

impl Command {
    pub fn new(tenant_id: TenantId, request: NewCommand) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            device_id: request.device_id,
            command_type: request.command_type,
            parameters: request.parameters,
            state: CommandState::Pending,
            created_at: now,
            updated_at: now,
            attempts: 0,
            last_error: None,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move forward to `next`, or fail with `InvalidTransition`.
    pub fn transition(&mut self, next: CommandState) -> Result<(), CoreError> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Transition to `failed`, recording why.
    pub fn fail(&mut self, cause: FailureCause, message: impl Into<String>) -> Result<(), CoreError> {
        self.transition(CommandState::Failed)?;
        self.failure = Some(CommandFailure {
            cause,
            message: message.into(),
        });
        Ok(())
    }

    pub(crate) fn record_attempt(&mut self, error: Option<String>) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_error = error;
        self.updated_at = Utc::now();
    }
}

/// Caller-supplied part of a command.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCommand {
    pub device_id: String,
    pub command_type: String,
    pub parameters: Map<String, Value>,
}

impl NewCommand {
    pub fn new(device_id: impl Into<String>, command_type: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            command_type: command_type.into(),
            parameters: Map::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), CoreError> {
        if self.device_id.trim().is_empty() {
            return Err(CoreError::Validation {
                message: "command device_id must not be empty".into(),
            });
        }
        if self.command_type.trim().is_empty() {
            return Err(CoreError::Validation {
                message: "command_type must not be empty".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn mosfet() -> Command {
        Command::new(
            TenantId::default_tenant(),
            NewCommand::new("esp32-001", "set_mosfet").param("channel", 1).param("state", "on"),
        )
    }

    #[test]
    fn forward_transitions_only() {
        use CommandState::{Acknowledged, Failed, Pending, Sent};

        let all = [Pending, Sent, Acknowledged, Failed];
        let allowed = [(Pending, Sent), (Pending, Failed), (Sent, Acknowledged), (Sent, Failed)];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_commands_refuse_further_changes() {
        let mut cmd = mosfet();
        cmd.transition(CommandState::Sent).unwrap();
        cmd.transition(CommandState::Acknowledged).unwrap();

        let err = cmd.fail(FailureCause::Cancelled, "too late").unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(cmd.state, CommandState::Acknowledged);
        assert!(cmd.failure.is_none());
    }

    #[test]
    fn pending_cannot_skip_to_acknowledged() {
        let mut cmd = mosfet();
        assert!(cmd.transition(CommandState::Acknowledged).is_err());
        assert_eq!(cmd.state, CommandState::Pending);
    }

    #[test]
    fn validate_rejects_blank_fields() {
        assert!(NewCommand::new("", "reboot").validate().is_err());
        assert!(NewCommand::new("esp32-001", " ").validate().is_err());
        assert!(NewCommand::new("esp32-001", "reboot").validate().is_ok());
    }
}
