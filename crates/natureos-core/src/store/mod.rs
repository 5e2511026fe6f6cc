// ── Local store ──
//
// Tenant-scoped cache of devices, commands, and sensor readings.
//
// Concurrency: the entity table and the reading series are `DashMap`s.
// Every mutation runs inside its key's entry guard, so version checks,
// dedup, and state-machine validation are atomic with the write while
// unrelated keys proceed in parallel. Readers clone an `Arc` out and
// never hold a guard past the lookup.
//
// Durability: with a journal, each mutation is journaled before it is
// applied in memory. A read guard on `gate` is held by every mutation;
// `compact()` takes it exclusively so the rewritten journal is an exact
// snapshot. Once the records appended since the last compaction reach
// `compact_after`, the mutation that crossed the line compacts on its way
// out, keeping the file within a small multiple of the live state.

mod journal;
mod query;
mod series;

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::CoreError;
use crate::model::{
    Command, CommandState, Cursor, Device, Entity, EntityKey, EntityType, EntityVersion,
    SensorReading, SeriesKey, TenantId, Versioned,
};

use journal::{Journal, JournalRecord};
use series::{Admission, ReadingSeries};

pub use query::{EntityFilter, Query, QueryIter};
pub use series::AppendOutcome;

/// Result of [`LocalStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Updated,
}

/// `(tenant, device, command type)` slot for exclusive command types.
type ExclusiveKey = (TenantId, String, String);

pub struct LocalStore {
    entities: DashMap<EntityKey, Arc<Versioned<Entity>>>,
    series: DashMap<SeriesKey, ReadingSeries>,
    exclusive: DashMap<ExclusiveKey, Uuid>,
    exclusive_types: HashSet<String>,
    max_readings_per_series: usize,
    journal: Option<Journal>,
    gate: RwLock<()>,
    /// Journal records written since the last compaction.
    appended: AtomicUsize,
    compact_after: AtomicUsize,
    compact_min_records: usize,
    changes: watch::Sender<u64>,
}

/// Shared hold on the store gate for one mutation.
struct WriteGate<'a> {
    store: &'a LocalStore,
    held: Option<RwLockReadGuard<'a, ()>>,
}

impl Drop for WriteGate<'_> {
    fn drop(&mut self) {
        drop(self.held.take());
        if self.store.compaction_due() {
            if let Err(e) = self.store.rewrite_journal(true) {
                warn!(error = %e, "journal compaction failed");
            }
        }
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::in_memory(&StoreConfig::default())
    }
}

impl LocalStore {
    // ── Construction ─────────────────────────────────────────────────

    /// A store that forgets everything when dropped.
    pub fn in_memory(config: &StoreConfig) -> Self {
        Self::build(config, None)
    }

    /// Open the store at `config.path`, replaying its journal.
    ///
    /// Without a path this is [`in_memory`](Self::in_memory). The journal
    /// is compacted after replay.
    pub fn open(config: &StoreConfig) -> Result<Self, CoreError> {
        let Some(path) = config.path.as_deref() else {
            return Ok(Self::in_memory(config));
        };
        let (journal, records) = Journal::open(path)?;
        let replayed = records.len();

        let store = Self::build(config, Some(journal));
        for record in records {
            store.replay(record);
        }
        store.rebuild_exclusive_slots();
        store.compact()?;

        info!(
            path = %path.display(),
            replayed,
            entities = store.entities.len(),
            series = store.series.len(),
            "local store opened"
        );
        Ok(store)
    }

    fn build(config: &StoreConfig, journal: Option<Journal>) -> Self {
        let (changes, _) = watch::channel(0u64);
        Self {
            entities: DashMap::new(),
            series: DashMap::new(),
            exclusive: DashMap::new(),
            exclusive_types: config.exclusive_command_types.iter().cloned().collect(),
            max_readings_per_series: config.max_readings_per_series,
            journal,
            gate: RwLock::new(()),
            appended: AtomicUsize::new(0),
            compact_after: AtomicUsize::new(config.compact_min_records.max(1)),
            compact_min_records: config.compact_min_records.max(1),
            changes,
        }
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_ref().map(Journal::path)
    }

    // ── Entities ─────────────────────────────────────────────────────

    pub fn get(
        &self,
        tenant: &TenantId,
        entity_type: EntityType,
        id: &str,
    ) -> Option<Arc<Versioned<Entity>>> {
        self.entity(&EntityKey::new(tenant.clone(), entity_type, id))
    }

    pub fn device(&self, tenant: &TenantId, id: &str) -> Option<Versioned<Device>> {
        let record = self.get(tenant, EntityType::Device, id)?;
        let device = record.value.as_device()?.clone();
        Some(Versioned::new(device, record.version, record.fetched_at))
    }

    pub fn command(&self, tenant: &TenantId, id: Uuid) -> Option<Command> {
        self.get(tenant, EntityType::Command, &id.to_string())
            .and_then(|r| r.value.as_command().cloned())
    }

    /// Version-aware upsert of a platform-sourced record.
    ///
    /// A record older than the stored one is rejected with
    /// `VersionConflict`; equal versions replace (refreshing `fetched_at`).
    /// Commands are not accepted here: their state is owned by the sync
    /// engine through [`enqueue_command`](Self::enqueue_command) and
    /// [`update_command`](Self::update_command).
    pub fn put(&self, tenant: &TenantId, record: Versioned<Entity>) -> Result<PutOutcome, CoreError> {
        tenant.ensure_owns(record.value.tenant_id())?;
        if matches!(record.value, Entity::Command(_)) {
            return Err(CoreError::Validation {
                message: "commands are written through enqueue_command/update_command".into(),
            });
        }

        let key = record.value.key();
        let _gate = self.gate()?;
        let outcome = match self.entities.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let stored = slot.get().version;
                if record.version < stored {
                    debug!(%key, %stored, incoming = %record.version, "stale write rejected");
                    return Err(CoreError::VersionConflict {
                        key: key.to_string(),
                        stored,
                        incoming: record.version,
                    });
                }
                self.journal(&JournalRecord::Put { key, record: record.clone() }, false)?;
                slot.insert(Arc::new(record));
                PutOutcome::Updated
            }
            Entry::Vacant(slot) => {
                self.journal(&JournalRecord::Put { key, record: record.clone() }, false)?;
                slot.insert(Arc::new(record));
                PutOutcome::Inserted
            }
        };
        self.bump();
        Ok(outcome)
    }

    pub fn query(&self, tenant: &TenantId, entity_type: EntityType, filter: EntityFilter) -> Query<'_> {
        Query::new(self, tenant.clone(), entity_type, filter)
    }

    pub(crate) fn entity(&self, key: &EntityKey) -> Option<Arc<Versioned<Entity>>> {
        self.entities.get(key).map(|r| Arc::clone(r.value()))
    }

    pub(crate) fn keys_for(&self, tenant: &TenantId, entity_type: EntityType) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self
            .entities
            .iter()
            .filter(|r| r.key().tenant_id == *tenant && r.key().entity_type == entity_type)
            .map(|r| r.key().clone())
            .collect();
        keys.sort();
        keys
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Durably record a new `pending` command.
    ///
    /// Re-enqueueing an id that is already stored returns the stored
    /// command unchanged. For exclusive command types a second in-flight
    /// command for the same device fails with `CommandInFlight`.
    pub fn enqueue_command(&self, tenant: &TenantId, command: Command) -> Result<Command, CoreError> {
        tenant.ensure_owns(&command.tenant_id)?;
        if command.state != CommandState::Pending {
            return Err(CoreError::Validation {
                message: format!("new command {} must be pending, not {}", command.id, command.state),
            });
        }

        let key = EntityKey::new(tenant.clone(), EntityType::Command, command.id.to_string());
        let _gate = self.gate()?;
        let claimed = self.claim_exclusive(&command)?;

        let result = match self.entities.entry(key.clone()) {
            Entry::Occupied(existing) => existing
                .get()
                .value
                .as_command()
                .map(|stored| (stored.clone(), false))
                .ok_or_else(|| CoreError::Internal(format!("{key} holds a non-command entity"))),
            Entry::Vacant(slot) => {
                let record = Versioned::new(
                    Entity::Command(command.clone()),
                    EntityVersion::tentative(0, 1),
                    command.created_at,
                );
                self.journal(&JournalRecord::Put { key, record: record.clone() }, true)
                    .map(|()| {
                        slot.insert(Arc::new(record));
                        (command, true)
                    })
            }
        };

        match result {
            Ok((stored, inserted)) => {
                if inserted {
                    debug!(id = %stored.id, device = %stored.device_id, kind = %stored.command_type, "command enqueued");
                    self.bump();
                }
                Ok(stored)
            }
            Err(e) => {
                if let Some(slot) = claimed {
                    self.exclusive.remove(&slot);
                }
                Err(e)
            }
        }
    }

    /// Pending commands of `tenant`, oldest first.
    pub fn list_pending_commands(&self, tenant: &TenantId) -> Vec<Command> {
        self.commands_in_state(tenant, CommandState::Pending)
    }

    /// Commands of `tenant` in `state`, in creation order.
    pub fn commands_in_state(&self, tenant: &TenantId, state: CommandState) -> Vec<Command> {
        let mut commands: Vec<Command> = self
            .entities
            .iter()
            .filter(|r| r.key().tenant_id == *tenant && r.key().entity_type == EntityType::Command)
            .filter_map(|r| r.value().value.as_command().filter(|c| c.state == state).cloned())
            .collect();
        commands.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        commands
    }

    /// Atomically apply `change` to a stored command.
    ///
    /// `change` runs under the command's entry lock and must not call back
    /// into the store. The result is rejected if it moves the state
    /// backwards or alters the command's identity.
    pub fn update_command<F>(&self, tenant: &TenantId, id: Uuid, change: F) -> Result<Command, CoreError>
    where
        F: FnOnce(&mut Command) -> Result<(), CoreError>,
    {
        let key = EntityKey::new(tenant.clone(), EntityType::Command, id.to_string());
        let _gate = self.gate()?;
        let Some(mut slot) = self.entities.get_mut(&key) else {
            return Err(CoreError::NotFound {
                entity_type: EntityType::Command.to_string(),
                identifier: id.to_string(),
            });
        };

        let current = slot
            .value
            .as_command()
            .ok_or_else(|| CoreError::Internal(format!("{key} holds a non-command entity")))?;
        let before = current.state;
        let mut next = current.clone();
        change(&mut next)?;

        if next.id != current.id || next.tenant_id != current.tenant_id || next.device_id != current.device_id {
            return Err(CoreError::Validation {
                message: format!("command {id} identity is immutable"),
            });
        }
        if next.state != before && !before.can_transition_to(next.state) {
            return Err(CoreError::InvalidTransition {
                id,
                from: before,
                to: next.state,
            });
        }

        let record = Versioned::new(
            Entity::Command(next.clone()),
            slot.version.next_tentative(),
            slot.fetched_at,
        );
        self.journal(&JournalRecord::Put { key, record: record.clone() }, true)?;
        *slot = Arc::new(record);
        drop(slot);

        if next.is_terminal() && !before.is_terminal() {
            self.release_exclusive(&next);
        }
        self.bump();
        Ok(next)
    }

    /// Drop terminal commands last updated more than `retention` before `now`.
    pub fn purge_terminal_commands(
        &self,
        tenant: &TenantId,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, CoreError> {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return Ok(0);
        };
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return Ok(0);
        };

        let expired: Vec<EntityKey> = self
            .entities
            .iter()
            .filter(|r| r.key().tenant_id == *tenant)
            .filter(|r| {
                r.value()
                    .value
                    .as_command()
                    .is_some_and(|c| c.is_terminal() && c.updated_at < cutoff)
            })
            .map(|r| r.key().clone())
            .collect();

        let _gate = self.gate()?;
        let mut purged = 0;
        for key in expired {
            if let Entry::Occupied(slot) = self.entities.entry(key.clone()) {
                self.journal(&JournalRecord::Remove { key }, false)?;
                slot.remove();
                purged += 1;
            }
        }
        if purged > 0 {
            info!(tenant = %tenant, purged, "purged terminal commands");
            self.bump();
        }
        Ok(purged)
    }

    fn claim_exclusive(&self, command: &Command) -> Result<Option<ExclusiveKey>, CoreError> {
        if !self.exclusive_types.contains(&command.command_type) {
            return Ok(None);
        }
        let slot_key = (
            command.tenant_id.clone(),
            command.device_id.clone(),
            command.command_type.clone(),
        );
        match self.exclusive.entry(slot_key.clone()) {
            Entry::Occupied(slot) if *slot.get() != command.id => Err(CoreError::CommandInFlight {
                device_id: command.device_id.clone(),
                command_type: command.command_type.clone(),
                existing: *slot.get(),
            }),
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(slot) => {
                slot.insert(command.id);
                Ok(Some(slot_key))
            }
        }
    }

    fn release_exclusive(&self, command: &Command) {
        let slot_key = (
            command.tenant_id.clone(),
            command.device_id.clone(),
            command.command_type.clone(),
        );
        self.exclusive.remove_if(&slot_key, |_, holder| *holder == command.id);
    }

    fn rebuild_exclusive_slots(&self) {
        for record in &self.entities {
            if let Some(command) = record.value().value.as_command() {
                if !command.is_terminal() && self.exclusive_types.contains(&command.command_type) {
                    self.exclusive.insert(
                        (
                            command.tenant_id.clone(),
                            command.device_id.clone(),
                            command.command_type.clone(),
                        ),
                        command.id,
                    );
                }
            }
        }
    }

    // ── Readings ─────────────────────────────────────────────────────

    /// Idempotent append to the reading's series.
    pub fn append_reading(
        &self,
        tenant: &TenantId,
        reading: SensorReading,
    ) -> Result<AppendOutcome, CoreError> {
        tenant.ensure_owns(&reading.tenant_id)?;
        if !reading.value.is_finite() {
            return Err(CoreError::Validation {
                message: format!("reading value {} is not finite", reading.value),
            });
        }

        let _gate = self.gate()?;
        let series_key = reading.series();
        let mut series = self
            .series
            .entry(series_key.clone())
            .or_insert_with(|| ReadingSeries::new(self.max_readings_per_series));

        let outcome = match series.admit(&reading.cursor()) {
            Admission::Duplicate => AppendOutcome::Duplicate,
            Admission::Expired => {
                debug!(series = %series_key, cursor = %reading.cursor(), "reading older than retained history");
                AppendOutcome::Expired
            }
            Admission::Accept => {
                self.journal(&JournalRecord::Reading { reading: reading.clone() }, false)?;
                let evicted = series.insert(reading);
                if let Some(cursor) = evicted {
                    debug!(series = %series_key, %cursor, "evicted oldest reading at capacity");
                }
                AppendOutcome::Inserted { evicted }
            }
        };
        drop(series);

        if outcome.is_new() {
            self.bump();
        }
        Ok(outcome)
    }

    /// Readings of one series after `after` (exclusive), oldest first.
    pub fn readings(
        &self,
        tenant: &TenantId,
        device_id: &str,
        sensor_type: &str,
        after: Option<Cursor>,
    ) -> Vec<SensorReading> {
        self.series
            .get(&SeriesKey::new(tenant.clone(), device_id, sensor_type))
            .map(|s| s.after(after.as_ref()))
            .unwrap_or_default()
    }

    /// Readings of a device within `[start, end]`, across one or all
    /// sensor types, ordered by cursor and truncated to `limit`.
    pub fn readings_between(
        &self,
        tenant: &TenantId,
        device_id: &str,
        sensor_type: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Vec<SensorReading> {
        let mut out: Vec<SensorReading> = self
            .series
            .iter()
            .filter(|s| {
                let key = s.key();
                key.tenant_id == *tenant
                    && key.device_id == device_id
                    && sensor_type.is_none_or(|t| key.sensor_type == t)
            })
            .flat_map(|s| s.value().between(start, end).cloned().collect::<Vec<_>>())
            .collect();
        out.sort_by(|a, b| a.cursor().cmp(&b.cursor()).then_with(|| a.sensor_type.cmp(&b.sensor_type)));
        out.truncate(limit);
        out
    }

    pub fn reading_count(&self, tenant: &TenantId, device_id: &str, sensor_type: &str) -> usize {
        self.series
            .get(&SeriesKey::new(tenant.clone(), device_id, sensor_type))
            .map_or(0, |s| s.len())
    }

    pub fn latest_cursor(&self, tenant: &TenantId, device_id: &str, sensor_type: &str) -> Option<Cursor> {
        self.series
            .get(&SeriesKey::new(tenant.clone(), device_id, sensor_type))
            .and_then(|s| s.latest())
    }

    /// Explicitly drop readings strictly older than `before`.
    pub fn evict_readings_before(
        &self,
        tenant: &TenantId,
        device_id: &str,
        sensor_type: &str,
        before: Cursor,
    ) -> Result<usize, CoreError> {
        let series_key = SeriesKey::new(tenant.clone(), device_id, sensor_type);
        let _gate = self.gate()?;
        let Some(mut series) = self.series.get_mut(&series_key) else {
            return Ok(0);
        };
        self.journal(
            &JournalRecord::Evict {
                series: series_key.clone(),
                before,
            },
            false,
        )?;
        let removed = series.evict_before(&before);
        drop(series);

        if removed > 0 {
            info!(series = %series_key, %before, removed, "evicted readings");
            self.bump();
        }
        Ok(removed)
    }

    // ── Change tracking ──────────────────────────────────────────────

    /// Monotonic count of applied mutations.
    pub fn change_count(&self) -> u64 {
        *self.changes.borrow()
    }

    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn bump(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    // ── Journal ──────────────────────────────────────────────────────

    /// Rewrite the journal as a snapshot of current state.
    pub fn compact(&self) -> Result<(), CoreError> {
        self.rewrite_journal(false).map(|_| ())
    }

    /// Records appended to the journal since it was last compacted.
    pub fn journal_backlog(&self) -> usize {
        self.appended.load(Ordering::Relaxed)
    }

    fn compaction_due(&self) -> bool {
        self.journal.is_some()
            && self.appended.load(Ordering::Relaxed) >= self.compact_after.load(Ordering::Relaxed)
    }

    /// Snapshot the store into the journal. With `only_if_due`, the
    /// threshold is re-checked under the exclusive gate so concurrent
    /// writers crossing it together compact once.
    fn rewrite_journal(&self, only_if_due: bool) -> Result<bool, CoreError> {
        let Some(journal) = &self.journal else {
            return Ok(false);
        };
        let _exclusive = self
            .gate
            .write()
            .map_err(|_| CoreError::Internal("store gate poisoned".into()))?;
        if only_if_due && !self.compaction_due() {
            return Ok(false);
        }

        let mut records: Vec<JournalRecord> = self
            .entities
            .iter()
            .map(|r| JournalRecord::Put {
                key: r.key().clone(),
                record: (**r.value()).clone(),
            })
            .collect();
        for series in &self.series {
            records.extend(series.value().iter().map(|reading| JournalRecord::Reading {
                reading: reading.clone(),
            }));
        }
        journal.rewrite(&records)?;

        self.appended.store(0, Ordering::Relaxed);
        self.compact_after.store(
            self.compact_min_records.max(records.len().saturating_mul(2)),
            Ordering::Relaxed,
        );
        Ok(true)
    }

    fn journal(&self, record: &JournalRecord, durable: bool) -> Result<(), CoreError> {
        if let Some(journal) = &self.journal {
            journal.append(record, durable)?;
            self.appended.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn gate(&self) -> Result<WriteGate<'_>, CoreError> {
        let held = self
            .gate
            .read()
            .map_err(|_| CoreError::Internal("store gate poisoned".into()))?;
        Ok(WriteGate {
            store: self,
            held: Some(held),
        })
    }

    fn replay(&self, record: JournalRecord) {
        match record {
            JournalRecord::Put { key, record } => {
                self.entities.insert(key, Arc::new(record));
            }
            JournalRecord::Remove { key } => {
                self.entities.remove(&key);
            }
            JournalRecord::Reading { reading } => {
                let mut series = self
                    .series
                    .entry(reading.series())
                    .or_insert_with(|| ReadingSeries::new(self.max_readings_per_series));
                if series.admit(&reading.cursor()) == Admission::Accept {
                    series.insert(reading);
                }
            }
            JournalRecord::Evict { series, before } => {
                if let Some(mut s) = self.series.get_mut(&series) {
                    s.evict_before(&before);
                }
            }
        }
    }
}
