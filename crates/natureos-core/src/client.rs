// ── Client facade ──
//
// Thin composition of the store, sync engine, and subscription manager
// behind one cloneable handle. Owns the background sync task.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use natureos_api::transport::{TlsMode, TransportConfig};
use natureos_api::{HttpTransport, Transport};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{ClientConfig, TlsVerification};
use crate::error::CoreError;
use crate::model::{
    Command, Cursor, Device, MycoBrainRegistration, NewCommand, NewDevice, SensorReading,
    SubscriptionId,
};
use crate::store::LocalStore;
use crate::stream::{Subscription, SubscriptionManager};
use crate::sync::{CommandEvent, CommandHandle, DeviceQuery, ReadResult, SensorQuery, SyncEngine};

/// Entry point for applications.
///
/// Cheaply cloneable via `Arc<ClientInner>`. Reads degrade to cached data
/// while offline; commands are persisted and delivered when connectivity
/// returns.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    store: Arc<LocalStore>,
    sync: SyncEngine,
    streams: SubscriptionManager,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    // ── Construction ─────────────────────────────────────────────────

    /// Connect over HTTPS using the configured URL, key, and TLS mode.
    pub async fn connect(config: ClientConfig) -> Result<Self, CoreError> {
        let transport = HttpTransport::new(
            config.api_url.as_str(),
            config.api_key.as_ref(),
            Some(config.tenant.as_str()),
            &build_transport(&config),
        )?;
        Self::with_transport(config, Arc::new(transport)).await
    }

    /// Build a client over any [`Transport`].
    ///
    /// Opens (and replays) the local store, purges expired terminal
    /// commands, and starts the background sync loop, which delivers
    /// commands left pending by a previous run.
    pub async fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, CoreError> {
        let store = match config.store.path.clone() {
            Some(_) => {
                let store_config = config.store.clone();
                tokio::task::spawn_blocking(move || LocalStore::open(&store_config))
                    .await
                    .map_err(|e| CoreError::Internal(format!("store open task failed: {e}")))??
            }
            None => LocalStore::in_memory(&config.store),
        };
        let store = Arc::new(store);
        store.purge_terminal_commands(&config.tenant, config.sync.command_retention, Utc::now())?;

        let cancel = CancellationToken::new();
        let sync = SyncEngine::new(
            config.tenant.clone(),
            config.sync.clone(),
            Arc::clone(&store),
            Arc::clone(&transport),
            cancel.clone(),
        );
        let streams = SubscriptionManager::new(
            config.tenant.clone(),
            config.stream.clone(),
            Arc::clone(&store),
            Arc::clone(&transport),
            cancel.clone(),
        );

        let pending = store.list_pending_commands(&config.tenant).len();
        let engine = sync.clone();
        let handles = vec![tokio::spawn(async move { engine.run().await })];

        info!(
            tenant = %config.tenant,
            api_url = %config.api_url,
            pending,
            "client started"
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                store,
                sync,
                streams,
                transport,
                cancel,
                task_handles: Mutex::new(handles),
            }),
        })
    }

    /// Stop background work and close all subscriptions.
    ///
    /// Pending commands stay in the store and are delivered by the next
    /// client opened on the same store path.
    pub async fn shutdown(&self) {
        self.inner.streams.close_all();
        self.inner.cancel.cancel();

        let mut handles = self.inner.task_handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
        if let Err(e) = self.inner.store.compact() {
            debug!(error = %e, "journal compaction on shutdown failed");
        }
        debug!("client shut down");
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.inner.store
    }

    pub fn sync(&self) -> &SyncEngine {
        &self.inner.sync
    }

    pub fn streams(&self) -> &SubscriptionManager {
        &self.inner.streams
    }

    /// Connectivity change notifications.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.inner.transport.connectivity()
    }

    // ── Devices ──────────────────────────────────────────────────────

    pub async fn list_devices(&self, query: &DeviceQuery) -> Result<ReadResult<Vec<Device>>, CoreError> {
        self.inner.sync.list_devices(query).await
    }

    /// Device by id, using the configured staleness bound.
    pub async fn get_device(&self, id: &str) -> Result<Device, CoreError> {
        Ok(self.inner.sync.read_device(id, None).await?.value)
    }

    /// Device by id with an explicit staleness bound and provenance.
    pub async fn get_device_with(
        &self,
        id: &str,
        max_staleness: Duration,
    ) -> Result<ReadResult<Device>, CoreError> {
        self.inner.sync.read_device(id, Some(max_staleness)).await
    }

    pub async fn register_device(&self, request: NewDevice) -> Result<Device, CoreError> {
        self.inner.sync.register_device(request).await
    }

    pub async fn register_mycobrain_device(
        &self,
        registration: MycoBrainRegistration,
    ) -> Result<Device, CoreError> {
        self.inner.sync.register_mycobrain_device(registration).await
    }

    // ── Sensor data ──────────────────────────────────────────────────

    pub async fn get_sensor_data(&self, query: &SensorQuery) -> Result<ReadResult<Vec<SensorReading>>, CoreError> {
        self.inner.sync.sensor_history(query).await
    }

    /// Live readings for one device sensor; see [`SubscriptionManager::open`].
    pub fn subscribe(
        &self,
        device_id: impl Into<String>,
        sensor_type: impl Into<String>,
        from: Option<Cursor>,
    ) -> Result<Subscription, CoreError> {
        self.inner.streams.open(device_id, sensor_type, from)
    }

    pub fn close_subscription(&self, id: SubscriptionId) -> bool {
        self.inner.streams.close(id)
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Queue a command; see [`SyncEngine::submit_command`].
    pub fn send_command(&self, request: NewCommand) -> Result<CommandHandle, CoreError> {
        self.inner.sync.submit_command(request)
    }

    /// Stop tracking a command locally. The device may still execute a
    /// command the platform already received.
    pub fn cancel_command(&self, id: Uuid) -> Result<Command, CoreError> {
        self.inner.sync.cancel_command(id)
    }

    pub fn command(&self, id: Uuid) -> Option<Command> {
        self.inner.sync.command(id)
    }

    pub fn pending_commands(&self) -> Vec<Command> {
        self.inner.sync.pending_commands()
    }

    pub fn command_events(&self) -> broadcast::Receiver<CommandEvent> {
        self.inner.sync.subscribe_commands()
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn build_transport(config: &ClientConfig) -> TransportConfig {
    TransportConfig {
        tls: tls_to_transport(&config.tls),
        timeout: config.sync.request_timeout,
    }
}

fn tls_to_transport(tls: &TlsVerification) -> TlsMode {
    match tls {
        TlsVerification::SystemDefaults => TlsMode::System,
        TlsVerification::CustomCa(path) => TlsMode::CustomCa(path.clone()),
        TlsVerification::DangerAcceptInvalid => TlsMode::DangerAcceptInvalid,
    }
}
