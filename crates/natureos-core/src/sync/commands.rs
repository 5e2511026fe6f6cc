// ── Command delivery ──
//
// Every state change goes through `LocalStore::update_command`, so the
// store's forward-only check is the single arbiter when a delivery, a
// reconciliation poll, and a cancel race on the same command. The loser
// sees `InvalidTransition` and backs off quietly.

use dashmap::mapref::entry::Entry;
use natureos_api::AckStatus;
use natureos_api::models::CommandStatusRecord;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::engine::{SyncEngine, rejection_message};
use crate::convert::{RemoteOutcome, command_request, remote_outcome};
use crate::error::CoreError;
use crate::model::{Command, CommandState, FailureCause, NewCommand};

// ── Events & handles ─────────────────────────────────────────────────

/// Broadcast on every command state change.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandEvent {
    Sent(Command),
    Acknowledged(Command),
    /// Fired exactly once per failed command.
    Failed(Command),
}

impl CommandEvent {
    pub fn command(&self) -> &Command {
        match self {
            Self::Sent(c) | Self::Acknowledged(c) | Self::Failed(c) => c,
        }
    }

    fn for_state(command: Command) -> Option<Self> {
        match command.state {
            CommandState::Pending => None,
            CommandState::Sent => Some(Self::Sent(command)),
            CommandState::Acknowledged => Some(Self::Acknowledged(command)),
            CommandState::Failed => Some(Self::Failed(command)),
        }
    }
}

/// Tracks one submitted command to its terminal state.
#[derive(Debug)]
pub struct CommandHandle {
    id: Uuid,
    rx: watch::Receiver<Command>,
    cancel: CancellationToken,
}

impl CommandHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Latest known state of the command.
    pub fn current(&self) -> Command {
        self.rx.borrow().clone()
    }

    /// Resolve once the command is terminal.
    ///
    /// `Ok` when acknowledged, `CommandFailed` when failed, `Shutdown` if
    /// the client stops first (the command stays pending in the store and
    /// is retried on the next start).
    pub async fn wait(mut self) -> Result<Command, CoreError> {
        loop {
            if let Some(done) = terminal(&self.rx.borrow_and_update()) {
                return done;
            }
            tokio::select! {
                biased;
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return terminal(&self.rx.borrow()).unwrap_or(Err(CoreError::Shutdown));
                    }
                }
                () = self.cancel.cancelled() => return Err(CoreError::Shutdown),
            }
        }
    }
}

fn terminal(command: &Command) -> Option<Result<Command, CoreError>> {
    match command.state {
        CommandState::Acknowledged => Some(Ok(command.clone())),
        CommandState::Failed => Some(Err(CoreError::CommandFailed {
            id: command.id,
            reason: command.failure.as_ref().map_or_else(
                || "failed".to_owned(),
                |f| format!("{}: {}", f.cause, f.message),
            ),
        })),
        CommandState::Pending | CommandState::Sent => None,
    }
}

/// Summary of one [`SyncEngine::drain_pending`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
    /// Commands left pending because connectivity dropped mid-drain.
    pub deferred: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Receipt confirmed (`sent` or `acknowledged`).
    Delivered,
    Failed,
    /// Offline; left pending for the next reconnect.
    Deferred,
    /// Stopped by cancellation or shutdown.
    Cancelled,
    /// Not pending, or another task owns the delivery.
    Skipped,
}

impl SyncEngine {
    // ── Submission ───────────────────────────────────────────────────

    /// Persist `request` as a `pending` command, then deliver it in the
    /// background when online.
    ///
    /// The command is durable before any network attempt. If the client
    /// is offline it stays pending and is delivered on reconnect without
    /// being resubmitted.
    pub fn submit_command(&self, request: NewCommand) -> Result<CommandHandle, CoreError> {
        request.validate()?;
        let command = Command::new(self.inner.tenant.clone(), request);
        let stored = self.inner.store.enqueue_command(&self.inner.tenant, command)?;
        info!(
            command_id = %stored.id,
            device = %stored.device_id,
            command_type = %stored.command_type,
            "command queued"
        );

        let handle = self.track(&stored);
        if self.is_online() {
            self.spawn_delivery(stored.id);
        } else {
            debug!(command_id = %stored.id, "offline; command left pending");
        }
        Ok(handle)
    }

    /// Handle for a command already in the store (e.g. recovered after a
    /// restart).
    pub fn command_handle(&self, id: Uuid) -> Option<CommandHandle> {
        self.inner
            .store
            .command(&self.inner.tenant, id)
            .map(|c| self.track(&c))
    }

    pub fn command(&self, id: Uuid) -> Option<Command> {
        self.inner.store.command(&self.inner.tenant, id)
    }

    pub fn pending_commands(&self) -> Vec<Command> {
        self.inner.store.list_pending_commands(&self.inner.tenant)
    }

    /// Command state changes for every command of this tenant.
    pub fn subscribe_commands(&self) -> broadcast::Receiver<CommandEvent> {
        self.inner.events.subscribe()
    }

    /// Stop caring about a command locally.
    ///
    /// Any in-progress delivery is abandoned and the command fails with
    /// [`FailureCause::Cancelled`]. This is not a remote abort: a command
    /// the platform already received may still execute on the device.
    pub fn cancel_command(&self, id: Uuid) -> Result<Command, CoreError> {
        if let Some((_, token)) = self.inner.deliveries.remove(&id) {
            token.cancel();
        }
        let cancelled = self.advance(id, |c| {
            c.fail(
                FailureCause::Cancelled,
                "cancelled locally; the device may still execute it",
            )
        })?;
        info!(command_id = %id, "command cancelled");
        Ok(cancelled)
    }

    fn track(&self, command: &Command) -> CommandHandle {
        let rx = if command.is_terminal() {
            watch::channel(command.clone()).1
        } else {
            self.inner
                .watchers
                .entry(command.id)
                .or_insert_with(|| watch::channel(command.clone()).0)
                .subscribe()
        };
        CommandHandle {
            id: command.id,
            rx,
            cancel: self.inner.cancel.clone(),
        }
    }

    // ── State changes ────────────────────────────────────────────────

    /// Apply `change` through the store and publish the result.
    fn advance<F>(&self, id: Uuid, change: F) -> Result<Command, CoreError>
    where
        F: FnOnce(&mut Command) -> Result<(), CoreError>,
    {
        let mut before = None;
        let updated = self.inner.store.update_command(&self.inner.tenant, id, |c| {
            before = Some(c.state);
            change(c)
        })?;

        if let Some(tx) = self.inner.watchers.get(&id) {
            tx.send_replace(updated.clone());
        }
        if before != Some(updated.state) {
            let cancelled = updated
                .failure
                .as_ref()
                .is_some_and(|f| f.cause == FailureCause::Cancelled);
            match updated.state {
                CommandState::Failed if !cancelled => error!(
                    command_id = %id,
                    attempts = updated.attempts,
                    cause = ?updated.failure.as_ref().map(|f| f.cause),
                    "command failed"
                ),
                state => info!(command_id = %id, %state, "command state changed"),
            }
            if let Some(event) = CommandEvent::for_state(updated.clone()) {
                let _ = self.inner.events.send(event);
            }
            if updated.is_terminal() {
                self.inner.watchers.remove(&id);
            }
        }
        Ok(updated)
    }

    // ── Delivery ─────────────────────────────────────────────────────

    fn spawn_delivery(&self, id: Uuid) {
        let Some(token) = self.claim(id) else {
            return;
        };
        let engine = self.clone();
        tokio::spawn(async move {
            let outcome = engine.deliver(id, &token).await;
            engine.inner.deliveries.remove(&id);
            log_outcome(id, outcome);
        });
    }

    fn claim(&self, id: Uuid) -> Option<CancellationToken> {
        match self.inner.deliveries.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => Some(slot.insert(self.inner.cancel.child_token()).clone()),
        }
    }

    async fn deliver_claimed(&self, id: Uuid) -> Delivery {
        let Some(token) = self.claim(id) else {
            return Delivery::Skipped;
        };
        let outcome = self.deliver(id, &token).await;
        self.inner.deliveries.remove(&id);
        log_outcome(id, outcome)
    }

    /// Attempt delivery until receipt is confirmed, the command fails, or
    /// connectivity drops.
    async fn deliver(&self, id: Uuid, token: &CancellationToken) -> Result<Delivery, CoreError> {
        let retry = &self.inner.config.retry;
        let seed = id.as_u64_pair().0;
        loop {
            let Some(command) = self.command(id) else {
                return Ok(Delivery::Skipped);
            };
            if command.state != CommandState::Pending {
                return Ok(Delivery::Skipped);
            }
            if !self.is_online() {
                return Ok(Delivery::Deferred);
            }

            let path = format!("devices/{}/commands", command.device_id);
            let body = serde_json::to_value(command_request(&command))?;
            let key = id.to_string();
            let result = tokio::select! {
                biased;
                () = token.cancelled() => return Ok(Delivery::Cancelled),
                result = self.send(&path, &body, &key) => result,
            };

            match result {
                Ok(ack) => return self.apply_ack(id, ack.status, &ack.payload),
                Err(e) if e.retryable => {
                    // Possibly received: stays pending, and the platform
                    // dedups the retry on the command id.
                    let message = e.to_string();
                    let updated = self.advance(id, |c| {
                        c.record_attempt(Some(message.clone()));
                        Ok(())
                    })?;
                    if retry.exhausted(updated.attempts) {
                        self.advance(id, |c| {
                            c.fail(
                                FailureCause::Exhausted,
                                format!("gave up after {} attempts: {message}", c.attempts),
                            )
                        })?;
                        return Ok(Delivery::Failed);
                    }
                    let delay = retry.delay(updated.attempts.saturating_sub(1), seed);
                    warn!(
                        command_id = %id,
                        attempt = updated.attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "command delivery failed; retrying"
                    );
                    tokio::select! {
                        biased;
                        () = token.cancelled() => return Ok(Delivery::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    self.advance(id, |c| {
                        c.record_attempt(Some(message.clone()));
                        c.fail(FailureCause::Rejected, message)
                    })?;
                    return Ok(Delivery::Failed);
                }
            }
        }
    }

    fn apply_ack(
        &self,
        id: Uuid,
        status: AckStatus,
        payload: &serde_json::Value,
    ) -> Result<Delivery, CoreError> {
        match status {
            AckStatus::Received => {
                self.advance(id, |c| {
                    c.record_attempt(None);
                    c.transition(CommandState::Sent)
                })?;
                Ok(Delivery::Delivered)
            }
            AckStatus::Completed => {
                self.advance(id, |c| {
                    c.record_attempt(None);
                    c.transition(CommandState::Sent)
                })?;
                self.advance(id, |c| c.transition(CommandState::Acknowledged))?;
                Ok(Delivery::Delivered)
            }
            AckStatus::Rejected => {
                let message = rejection_message(payload);
                self.advance(id, |c| {
                    c.record_attempt(None);
                    c.fail(FailureCause::Rejected, message)
                })?;
                Ok(Delivery::Failed)
            }
        }
    }

    /// Deliver pending commands one at a time, oldest first.
    ///
    /// Stops as soon as connectivity drops or the engine shuts down; the
    /// rest stay pending. A command cancelled mid-drain is skipped.
    pub async fn drain_pending(&self) -> DrainReport {
        let pending = self.pending_commands();
        let mut report = DrainReport::default();
        for (index, command) in pending.iter().enumerate() {
            let outcome = if self.inner.cancel.is_cancelled() {
                Delivery::Cancelled
            } else {
                self.deliver_claimed(command.id).await
            };
            let stop = match outcome {
                Delivery::Delivered => {
                    report.delivered += 1;
                    false
                }
                Delivery::Failed => {
                    report.failed += 1;
                    false
                }
                Delivery::Deferred => true,
                // A local cancel only ends that command's delivery.
                Delivery::Cancelled => self.inner.cancel.is_cancelled(),
                Delivery::Skipped => false,
            };
            if stop {
                report.deferred = pending.len() - index;
                break;
            }
        }
        report
    }

    // ── Reconciliation ───────────────────────────────────────────────

    /// Poll the platform for commands that were received but not yet
    /// reported complete. Returns how many reached a terminal state.
    pub async fn reconcile_sent_commands(&self) -> Result<usize, CoreError> {
        let sent = self
            .inner
            .store
            .commands_in_state(&self.inner.tenant, CommandState::Sent);
        let mut resolved = 0;
        for command in sent {
            if !self.is_online() || self.inner.cancel.is_cancelled() {
                break;
            }
            let path = format!("devices/{}/commands/{}", command.device_id, command.id);
            let fetched = match self.fetch(&path, &[]).await {
                Ok(fetched) => fetched,
                Err(e) if e.retryable => return Err(e.into()),
                Err(e) => {
                    debug!(command_id = %command.id, error = %e, "status poll failed");
                    continue;
                }
            };
            let status: CommandStatusRecord = serde_json::from_value(fetched.payload)?;
            let outcome = match remote_outcome(&status) {
                RemoteOutcome::Outstanding => continue,
                RemoteOutcome::Acknowledged => {
                    self.advance(command.id, |c| c.transition(CommandState::Acknowledged))
                }
                RemoteOutcome::Failed(message) => {
                    self.advance(command.id, |c| c.fail(FailureCause::Rejected, message))
                }
            };
            match outcome {
                Ok(_) => resolved += 1,
                Err(CoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(resolved)
    }
}

fn log_outcome(id: Uuid, outcome: Result<Delivery, CoreError>) -> Delivery {
    match outcome {
        Ok(delivery) => delivery,
        // Resolved elsewhere (cancelled or reconciled) while in flight.
        Err(CoreError::InvalidTransition { .. }) => Delivery::Skipped,
        Err(e) => {
            error!(command_id = %id, error = %e, "command delivery aborted");
            Delivery::Skipped
        }
    }
}
