// ── SubscriptionManager ──

use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use natureos_api::Transport;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::subscription::{Subscription, mark_closed};
use super::worker::Worker;
use crate::config::StreamConfig;
use crate::error::CoreError;
use crate::model::{CloseReason, Cursor, SubscriptionId, SubscriptionInfo, SubscriptionState, TenantId};
use crate::store::LocalStore;

struct Slot {
    cancel: CancellationToken,
    info: Arc<ArcSwap<SubscriptionInfo>>,
}

/// Owns every live sensor subscription of one tenant.
///
/// Cheaply cloneable. Subscriptions do not share timers or locks; each
/// reconnects on its own schedule.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    tenant: TenantId,
    store: Arc<LocalStore>,
    transport: Arc<dyn Transport>,
    config: StreamConfig,
    connectivity: watch::Receiver<bool>,
    subscriptions: Arc<DashMap<SubscriptionId, Slot>>,
    cancel: CancellationToken,
}

impl SubscriptionManager {
    pub fn new(
        tenant: TenantId,
        config: StreamConfig,
        store: Arc<LocalStore>,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> Self {
        let connectivity = transport.connectivity();
        Self {
            inner: Arc::new(ManagerInner {
                tenant,
                store,
                transport,
                config,
                connectivity,
                subscriptions: Arc::new(DashMap::new()),
                cancel,
            }),
        }
    }

    /// Start streaming `(device_id, sensor_type)`.
    ///
    /// With `from`, only readings after that cursor are requested. The
    /// subscription starts in `connecting` and reconnects on its own until
    /// closed.
    pub fn open(
        &self,
        device_id: impl Into<String>,
        sensor_type: impl Into<String>,
        from: Option<Cursor>,
    ) -> Result<Subscription, CoreError> {
        let device_id = device_id.into();
        let sensor_type = sensor_type.into();
        if device_id.trim().is_empty() || sensor_type.trim().is_empty() {
            return Err(CoreError::Validation {
                message: "subscriptions need a device_id and a sensor_type".into(),
            });
        }
        if self.inner.cancel.is_cancelled() {
            return Err(CoreError::Shutdown);
        }

        let id = SubscriptionId::new();
        let info = Arc::new(ArcSwap::from_pointee(SubscriptionInfo {
            id,
            tenant_id: self.inner.tenant.clone(),
            device_id: device_id.clone(),
            sensor_type: sensor_type.clone(),
            state: SubscriptionState::Connecting,
            cursor: from,
            reconnects: 0,
            delivered: 0,
            close_reason: None,
        }));
        let (events_tx, events_rx) = mpsc::channel(self.inner.config.listener_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Connecting);
        let cancel = self.inner.cancel.child_token();

        self.inner.subscriptions.insert(
            id,
            Slot {
                cancel: cancel.clone(),
                info: Arc::clone(&info),
            },
        );

        let worker = Worker {
            id,
            tenant: self.inner.tenant.clone(),
            device_id,
            sensor_type,
            store: Arc::clone(&self.inner.store),
            transport: Arc::clone(&self.inner.transport),
            config: self.inner.config.clone(),
            connectivity: self.inner.connectivity.clone(),
            events: events_tx,
            state: state_tx,
            info: Arc::clone(&info),
            cancel: cancel.clone(),
            cursor: from,
            dropped: 0,
            last_gap: None,
        };
        let subscriptions = Arc::clone(&self.inner.subscriptions);
        tokio::spawn(async move {
            worker.run().await;
            subscriptions.remove(&id);
        });

        info!(subscription = %id, tenant = %self.inner.tenant, "subscription opened");
        Ok(Subscription::new(id, events_rx, state_rx, info, cancel))
    }

    /// Close a subscription. Returns `false` if it was already closed.
    pub fn close(&self, id: SubscriptionId) -> bool {
        let Some((_, slot)) = self.inner.subscriptions.remove(&id) else {
            return false;
        };
        mark_closed(&slot.info, CloseReason::Requested);
        slot.cancel.cancel();
        debug!(subscription = %id, "subscription close requested");
        true
    }

    /// Close every subscription with [`CloseReason::Shutdown`].
    pub fn close_all(&self) {
        let ids: Vec<SubscriptionId> = self.inner.subscriptions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, slot)) = self.inner.subscriptions.remove(&id) {
                mark_closed(&slot.info, CloseReason::Shutdown);
                slot.cancel.cancel();
            }
        }
    }

    pub fn info(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        self.inner
            .subscriptions
            .get(&id)
            .map(|slot| SubscriptionInfo::clone(&slot.info.load()))
    }

    /// Snapshots of all open subscriptions.
    pub fn list(&self) -> Vec<SubscriptionInfo> {
        let mut all: Vec<SubscriptionInfo> = self
            .inner
            .subscriptions
            .iter()
            .map(|slot| SubscriptionInfo::clone(&slot.info.load()))
            .collect();
        all.sort_by(|a, b| (&a.device_id, &a.sensor_type, a.id).cmp(&(&b.device_id, &b.sensor_type, b.id)));
        all
    }

    pub fn len(&self) -> usize {
        self.inner.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.subscriptions.is_empty()
    }
}
