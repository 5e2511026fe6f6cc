// ── SyncEngine: reads, registration, background loop ──

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use natureos_api::models::{DeviceRecord, Items, ReadingRecord};
use natureos_api::{Ack, AckStatus, Fetched, Transport, TransportError};
use tokio::sync::{broadcast, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::commands::CommandEvent;
use super::{DeviceQuery, Freshness, ReadResult, SensorQuery, sort_readings};
use crate::config::SyncConfig;
use crate::convert::{
    device_from_payload, device_from_record, device_from_registration, reading_from_record,
    register_request,
};
use crate::error::CoreError;
use crate::model::{
    Command, Device, Entity, EntityType, EntityVersion, MycoBrainRegistration, NewDevice,
    SensorReading, TenantId, Versioned,
};
use crate::store::{EntityFilter, LocalStore};

const EVENT_CHANNEL_SIZE: usize = 256;

/// Cloneable handle to the sync engine of one tenant.
#[derive(Clone)]
pub struct SyncEngine {
    pub(super) inner: Arc<SyncInner>,
}

pub(super) struct SyncInner {
    pub(super) tenant: TenantId,
    pub(super) config: SyncConfig,
    pub(super) store: Arc<LocalStore>,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) connectivity: watch::Receiver<bool>,
    pub(super) events: broadcast::Sender<CommandEvent>,
    /// Live handles of non-terminal commands.
    pub(super) watchers: DashMap<Uuid, watch::Sender<Command>>,
    /// One entry per command with a delivery in progress.
    pub(super) deliveries: DashMap<Uuid, CancellationToken>,
    pub(super) cancel: CancellationToken,
}

impl SyncEngine {
    pub fn new(
        tenant: TenantId,
        config: SyncConfig,
        store: Arc<LocalStore>,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> Self {
        let connectivity = transport.connectivity();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(SyncInner {
                tenant,
                config,
                store,
                transport,
                connectivity,
                events,
                watchers: DashMap::new(),
                deliveries: DashMap::new(),
                cancel,
            }),
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.inner.tenant
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.inner.store
    }

    /// Latest known reachability of the platform.
    pub fn is_online(&self) -> bool {
        *self.inner.connectivity.borrow()
    }

    // ── Transport calls (all time-bounded) ───────────────────────────

    async fn timed<T>(
        &self,
        call: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        let limit = self.inner.config.request_timeout;
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or_else(|_| Err(TransportError::timeout(limit)))
    }

    pub(super) async fn fetch(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Fetched, TransportError> {
        debug!(path, tenant = %self.inner.tenant, "fetch");
        self.timed(self.inner.transport.fetch(path, params, self.inner.tenant.as_str()))
            .await
    }

    pub(super) async fn send(
        &self,
        path: &str,
        body: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<Ack, TransportError> {
        debug!(path, idempotency_key, "send");
        self.timed(self.inner.transport.send(path, body, idempotency_key))
            .await
    }

    /// Repeat `call` while it fails retryably, up to the retry budget.
    async fn with_retry<T, F, Fut>(&self, what: &str, seed: u64, mut call: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let retry = &self.inner.config.retry;
        let mut attempt: u32 = 0;
        loop {
            match call().await {
                Err(e) if e.retryable => {
                    attempt = attempt.saturating_add(1);
                    if retry.exhausted(attempt) || !self.is_online() {
                        warn!(what, attempt, error = %e, "giving up");
                        return Err(e.into());
                    }
                    let delay = retry.delay(attempt - 1, seed);
                    warn!(
                        what,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "retryable failure"
                    );
                    self.pause(delay).await?;
                }
                other => return other.map_err(CoreError::from),
            }
        }
    }

    pub(super) async fn pause(&self, delay: Duration) -> Result<(), CoreError> {
        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => Err(CoreError::Shutdown),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Cache-first device read.
    ///
    /// A cached copy younger than `max_staleness` (default: the configured
    /// bound) is returned without a network call. Otherwise the device is
    /// fetched; if that fails retryably the cached copy is returned as
    /// [`Freshness::Stale`]. Fatal failures are never masked by the cache.
    pub async fn read_device(
        &self,
        id: &str,
        max_staleness: Option<Duration>,
    ) -> Result<ReadResult<Device>, CoreError> {
        let max_staleness = max_staleness.unwrap_or(self.inner.config.max_staleness);
        let cached = self.inner.store.device(&self.inner.tenant, id);

        if let Some(ref c) = cached {
            if c.is_fresh(max_staleness, Utc::now()) {
                debug!(device = id, "cache hit");
                return Ok(read_result(c.clone(), Freshness::Cached));
            }
        }
        if !self.is_online() {
            return match cached {
                Some(c) => Ok(read_result(c, Freshness::Stale)),
                None => Err(CoreError::Offline {
                    what: format!("device {id}"),
                }),
            };
        }

        let path = format!("devices/{id}");
        let fetched = match cached {
            Some(c) => match self.fetch(&path, &[]).await {
                Ok(fetched) => fetched,
                Err(e) if e.retryable => {
                    warn!(device = id, error = %e, "refresh failed; serving cached device");
                    return Ok(read_result(c, Freshness::Stale));
                }
                Err(e) => return Err(e.into()),
            },
            None => {
                self.with_retry(&path, seed_of(id), || self.fetch(&path, &[]))
                    .await?
            }
        };

        let device = device_from_payload(fetched.payload, &self.inner.tenant)?;
        if device.id != id {
            return Err(CoreError::Validation {
                message: format!("requested device {id}, platform returned {}", device.id),
            });
        }
        self.cache_device(device, fetched.version, Utc::now())
    }

    /// Generic read by entity type. Commands are local state and never
    /// fetched; readings are served by [`sensor_history`](Self::sensor_history).
    pub async fn read_entity(
        &self,
        entity_type: EntityType,
        id: &str,
        max_staleness: Option<Duration>,
    ) -> Result<ReadResult<Entity>, CoreError> {
        match entity_type {
            EntityType::Device => Ok(self.read_device(id, max_staleness).await?.map(Entity::Device)),
            EntityType::Command => {
                let record = self
                    .inner
                    .store
                    .get(&self.inner.tenant, EntityType::Command, id)
                    .ok_or_else(|| CoreError::NotFound {
                        entity_type: entity_type.to_string(),
                        identifier: id.to_owned(),
                    })?;
                Ok(ReadResult {
                    value: record.value.clone(),
                    freshness: Freshness::Cached,
                    fetched_at: record.fetched_at,
                })
            }
            EntityType::SensorReading => Err(CoreError::Validation {
                message: "sensor readings are read by series, not by id".into(),
            }),
        }
    }

    /// List devices, caching each one. Falls back to the cached set when
    /// the platform is unreachable.
    pub async fn list_devices(&self, query: &DeviceQuery) -> Result<ReadResult<Vec<Device>>, CoreError> {
        if self.is_online() {
            match self.fetch("devices", &query.params()).await {
                Ok(fetched) => {
                    let page: Items<DeviceRecord> = serde_json::from_value(fetched.payload)?;
                    let now = Utc::now();
                    let mut devices = Vec::with_capacity(page.items.len());
                    for record in page.items {
                        let version = record.version.unwrap_or(fetched.version);
                        let device = device_from_record(record, &self.inner.tenant)?;
                        devices.push(self.cache_device(device, version, now)?.value);
                    }
                    debug!(count = devices.len(), "device list fetched");
                    return Ok(ReadResult {
                        value: devices,
                        freshness: Freshness::Fetched,
                        fetched_at: now,
                    });
                }
                Err(e) if e.retryable => warn!(error = %e, "device list failed; serving cache"),
                Err(e) => return Err(e.into()),
            }
        }

        let mut filters = Vec::new();
        if let Some(ref t) = query.device_type {
            filters.push(EntityFilter::DeviceType(t.clone()));
        }
        if let Some(status) = query.status {
            filters.push(EntityFilter::DeviceStatus(status));
        }
        let cached: Vec<Arc<Versioned<Entity>>> = self
            .inner
            .store
            .query(&self.inner.tenant, EntityType::Device, EntityFilter::And(filters))
            .iter()
            .take(query.limit)
            .collect();
        let fetched_at = cached.iter().map(|r| r.fetched_at).min().unwrap_or_else(Utc::now);
        Ok(ReadResult {
            value: cached
                .iter()
                .filter_map(|r| r.value.as_device().cloned())
                .collect(),
            freshness: Freshness::Stale,
            fetched_at,
        })
    }

    /// Historical readings for a device. Fetched readings are appended to
    /// the local series (duplicates are ignored); when the platform is
    /// unreachable the locally retained window is returned.
    pub async fn sensor_history(
        &self,
        query: &SensorQuery,
    ) -> Result<ReadResult<Vec<SensorReading>>, CoreError> {
        let now = Utc::now();
        if self.is_online() {
            let path = format!("devices/{}/sensor-data", query.device_id);
            match self.fetch(&path, &query.params(now)).await {
                Ok(fetched) => {
                    let page: Items<ReadingRecord> = serde_json::from_value(fetched.payload)?;
                    let mut readings = Vec::with_capacity(page.items.len());
                    for record in page.items {
                        let reading = reading_from_record(record, &self.inner.tenant);
                        match self.inner.store.append_reading(&self.inner.tenant, reading.clone()) {
                            Ok(_) => readings.push(reading),
                            Err(CoreError::Validation { message }) => {
                                warn!(device = %query.device_id, %message, "skipping invalid reading");
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    sort_readings(&mut readings);
                    return Ok(ReadResult {
                        value: readings,
                        freshness: Freshness::Fetched,
                        fetched_at: now,
                    });
                }
                Err(e) if e.retryable => warn!(error = %e, "sensor history failed; serving cache"),
                Err(e) => return Err(e.into()),
            }
        }

        let (start, end) = query.window(now);
        Ok(ReadResult {
            value: self.inner.store.readings_between(
                &self.inner.tenant,
                &query.device_id,
                query.sensor_type.as_deref(),
                start,
                end,
                query.limit,
            ),
            freshness: Freshness::Stale,
            fetched_at: now,
        })
    }

    fn cache_device(
        &self,
        device: Device,
        version: u64,
        fetched_at: DateTime<Utc>,
    ) -> Result<ReadResult<Device>, CoreError> {
        let record = Versioned::new(
            Entity::Device(device.clone()),
            EntityVersion::confirmed(version),
            fetched_at,
        );
        match self.inner.store.put(&self.inner.tenant, record) {
            Ok(_) => Ok(ReadResult {
                value: device,
                freshness: Freshness::Fetched,
                fetched_at,
            }),
            Err(CoreError::VersionConflict { key, stored, incoming }) => {
                // The platform served an older copy than one we already hold.
                debug!(%key, %stored, %incoming, "keeping newer cached device");
                let kept = self
                    .inner
                    .store
                    .device(&self.inner.tenant, &device.id)
                    .ok_or_else(|| CoreError::Internal(format!("{key} vanished after conflict")))?;
                Ok(read_result(kept, Freshness::Cached))
            }
            Err(e) => Err(e),
        }
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Register a device with the platform and cache the result.
    ///
    /// Registration needs connectivity; it is idempotent on `device_id`
    /// and retried on transient failures.
    pub async fn register_device(&self, request: NewDevice) -> Result<Device, CoreError> {
        if request.device_id.trim().is_empty() {
            return Err(CoreError::Validation {
                message: "device_id must not be empty".into(),
            });
        }
        if !self.is_online() {
            return Err(CoreError::Offline {
                what: format!("registration of {}", request.device_id),
            });
        }

        let body = serde_json::to_value(register_request(&request))?;
        let ack = self
            .with_retry("devices/register", seed_of(&request.device_id), || {
                self.send("devices/register", &body, &request.device_id)
            })
            .await?;

        if ack.status == AckStatus::Rejected {
            return Err(CoreError::Rejected {
                message: rejection_message(&ack.payload),
            });
        }

        let device = if ack.payload.get("id").or_else(|| ack.payload.get("device_id")).is_some() {
            device_from_payload(ack.payload.clone(), &self.inner.tenant)?
        } else {
            device_from_registration(&request, &self.inner.tenant)
        };
        let cached = self.cache_device(device, ack.version.unwrap_or(0), Utc::now())?;
        info!(device = %cached.value.id, device_type = %cached.value.device_type, "device registered");
        Ok(cached.value)
    }

    /// Register a MycoBrain board (device type `mycobrain`).
    pub async fn register_mycobrain_device(
        &self,
        registration: MycoBrainRegistration,
    ) -> Result<Device, CoreError> {
        self.register_device(registration.into()).await
    }

    // ── Background ───────────────────────────────────────────────────

    /// Re-read cached devices older than the configured staleness bound.
    pub async fn refresh_stale(&self) -> usize {
        let max_staleness = self.inner.config.max_staleness;
        let Ok(age) = chrono::Duration::from_std(max_staleness) else {
            return 0;
        };
        let cutoff = Utc::now() - age;
        let stale: Vec<String> = self
            .inner
            .store
            .query(&self.inner.tenant, EntityType::Device, EntityFilter::FetchedBefore(cutoff))
            .iter()
            .map(|r| r.value.entity_id())
            .collect();

        let mut refreshed = 0;
        for id in stale {
            if !self.is_online() || self.inner.cancel.is_cancelled() {
                break;
            }
            match self.read_device(&id, Some(max_staleness)).await {
                Ok(r) if r.freshness == Freshness::Fetched => refreshed += 1,
                Ok(_) => {}
                Err(e) => warn!(device = %id, error = %e, "stale refresh failed"),
            }
        }
        if refreshed > 0 {
            debug!(refreshed, "refreshed stale devices");
        }
        refreshed
    }

    /// Commands first, then outstanding acknowledgements, then passive
    /// cache refresh.
    pub async fn catch_up(&self) {
        let report = self.drain_pending().await;
        if report.delivered + report.failed > 0 || report.deferred > 0 {
            info!(
                delivered = report.delivered,
                failed = report.failed,
                deferred = report.deferred,
                "pending commands drained"
            );
        }
        if report.deferred > 0 {
            return;
        }
        match self.reconcile_sent_commands().await {
            Ok(0) => {}
            Ok(resolved) => info!(resolved, "reconciled sent commands"),
            Err(e) => warn!(error = %e, "command reconciliation failed"),
        }
        self.refresh_stale().await;
    }

    /// Drive the engine until the cancellation token fires.
    ///
    /// Every offline→online edge triggers [`catch_up`](Self::catch_up).
    /// While online the refresh tick repeats it; while offline the tick
    /// probes the platform instead.
    pub async fn run(&self) {
        let cancel = self.inner.cancel.clone();
        let mut connectivity = self.inner.connectivity.clone();
        let period = self.inner.config.refresh_interval;
        let mut ticker = (!period.is_zero()).then(|| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        if let Some(interval) = ticker.as_mut() {
            interval.tick().await; // consume the immediate first tick
        }

        let mut online = *connectivity.borrow_and_update();
        info!(tenant = %self.inner.tenant, online, "sync engine started");
        if online {
            self.catch_up().await;
        }

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now_online = *connectivity.borrow_and_update();
                    if now_online && !online {
                        info!("connectivity restored; catching up");
                        self.catch_up().await;
                    }
                    online = now_online;
                }
                () = next_tick(ticker.as_mut()) => {
                    if self.is_online() {
                        self.catch_up().await;
                    } else if let Err(e) = self.timed(self.inner.transport.probe()).await {
                        debug!(error = %e, "platform still unreachable");
                    }
                }
            }
        }
        info!(tenant = %self.inner.tenant, "sync engine stopped");
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

async fn next_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn read_result(record: Versioned<Device>, freshness: Freshness) -> ReadResult<Device> {
    ReadResult {
        value: record.value,
        freshness,
        fetched_at: record.fetched_at,
    }
}

/// Stable jitter seed for string keys (FNV-1a).
pub(super) fn seed_of(key: &str) -> u64 {
    key.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

pub(super) fn rejection_message(payload: &serde_json::Value) -> String {
    ["error", "message", "detail"]
        .iter()
        .find_map(|k| payload.get(*k).and_then(serde_json::Value::as_str))
        .map_or_else(|| "rejected by platform".to_owned(), str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seeds_differ_per_key() {
        assert_ne!(seed_of("esp32-001"), seed_of("esp32-002"));
        assert_eq!(seed_of("esp32-001"), seed_of("esp32-001"));
    }

    #[test]
    fn rejection_message_prefers_error_field() {
        assert_eq!(rejection_message(&json!({"error": "unknown channel"})), "unknown channel");
        assert_eq!(rejection_message(&json!({"detail": "nope"})), "nope");
        assert_eq!(rejection_message(&json!({})), "rejected by platform");
    }
}
