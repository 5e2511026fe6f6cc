// ── Per-subscription reconnect loop ──
//
// connect → pump until the stream ends → backoff → reconnect from cursor.
// The worker owns the cursor; nothing else writes it.

use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_util::StreamExt;
use natureos_api::models::ReadingRecord;
use natureos_api::{EventStream, FailureKind, StreamEvent, Transport, TransportError};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::subscription::{SubscriptionEvent, mark_closed};
use crate::config::StreamConfig;
use crate::convert::reading_from_record;
use crate::model::{
    CloseReason, Cursor, SubscriptionId, SubscriptionInfo, SubscriptionState, TenantId,
};
use crate::store::{AppendOutcome, LocalStore};

/// How one connected session ended.
enum Session {
    /// Stop for good.
    Exit(CloseReason),
    /// Stream dropped; `None` for a clean end.
    Disconnected(Option<TransportError>),
}

pub(super) struct Worker {
    pub(super) id: SubscriptionId,
    pub(super) tenant: TenantId,
    pub(super) device_id: String,
    pub(super) sensor_type: String,
    pub(super) store: Arc<LocalStore>,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) config: StreamConfig,
    pub(super) connectivity: watch::Receiver<bool>,
    pub(super) events: mpsc::Sender<SubscriptionEvent>,
    pub(super) state: watch::Sender<SubscriptionState>,
    pub(super) info: Arc<ArcSwap<SubscriptionInfo>>,
    pub(super) cancel: CancellationToken,
    pub(super) cursor: Option<Cursor>,
    /// Readings dropped since the last `ListenerLag` was delivered.
    pub(super) dropped: u64,
    /// Requested cursor of the last reported gap.
    pub(super) last_gap: Option<Option<Cursor>>,
}

impl Worker {
    pub(super) async fn run(mut self) -> CloseReason {
        let mut attempt: u32 = 0;
        let path = self.stream_path();

        let reason = loop {
            self.set_state(SubscriptionState::Connecting);
            if let Some(reason) = self.wait_online().await {
                break reason;
            }

            debug!(subscription = %self.id, cursor = ?self.cursor, "opening stream");
            let open = tokio::time::timeout(
                self.config.open_timeout,
                self.transport.open_stream(&path, self.cursor.map(Into::into)),
            );
            let opened = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break self.cancelled_reason(),
                opened = open => opened.unwrap_or_else(|_| Err(TransportError::timeout(self.config.open_timeout))),
            };

            let failure = match opened {
                Ok(stream) => {
                    self.set_state(SubscriptionState::Live);
                    info!(subscription = %self.id, device = %self.device_id, sensor = %self.sensor_type, "stream live");
                    attempt = 0;
                    match self.pump(stream).await {
                        Session::Exit(reason) => break reason,
                        Session::Disconnected(failure) => failure,
                    }
                }
                Err(e) => Some(e),
            };

            if let Some(ref e) = failure {
                if !e.retryable {
                    warn!(subscription = %self.id, error = %e, "stream refused");
                    break CloseReason::Fatal(e.to_string());
                }
            }
            attempt = attempt.saturating_add(1);
            if self.config.reconnect.exhausted(attempt) {
                warn!(subscription = %self.id, attempt, "stream reconnect limit reached");
                break CloseReason::RetriesExhausted;
            }

            let delay = self.config.reconnect.delay(attempt - 1, self.id.seed());
            self.set_state(SubscriptionState::Backoff);
            self.update_info(|i| i.reconnects = i.reconnects.saturating_add(1));
            warn!(
                subscription = %self.id,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = failure.as_ref().map_or_else(|| "clean disconnect".to_owned(), ToString::to_string),
                "stream disconnected; backing off"
            );
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break self.cancelled_reason(),
                () = self.events.closed() => break CloseReason::ListenerDropped,
                () = tokio::time::sleep(delay) => {}
            }
        };

        self.finish(reason)
    }

    fn stream_path(&self) -> String {
        let sensor: String = url::form_urlencoded::byte_serialize(self.sensor_type.as_bytes()).collect();
        format!("devices/{}/sensor-data/stream?sensor_type={sensor}", self.device_id)
    }

    /// Block until online. `Some` means stop instead.
    async fn wait_online(&mut self) -> Option<CloseReason> {
        loop {
            if *self.connectivity.borrow_and_update() {
                return None;
            }
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Some(self.cancelled_reason()),
                () = self.events.closed() => return Some(CloseReason::ListenerDropped),
                changed = self.connectivity.changed() => {
                    if changed.is_err() {
                        return Some(CloseReason::Shutdown);
                    }
                }
            }
        }
    }

    async fn pump(&mut self, mut stream: EventStream) -> Session {
        let requested = self.cursor;
        loop {
            let item = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Session::Exit(self.cancelled_reason()),
                () = self.events.closed() => return Session::Exit(CloseReason::ListenerDropped),
                changed = self.connectivity.changed() => {
                    if changed.is_err() || !*self.connectivity.borrow_and_update() {
                        return Session::Disconnected(Some(TransportError::retryable(
                            FailureKind::Connect,
                            "connectivity lost",
                        )));
                    }
                    continue;
                }
                item = stream.next() => item,
            };

            let exit = match item {
                None => return Session::Disconnected(None),
                Some(Err(e)) => return Session::Disconnected(Some(e)),
                Some(Ok(StreamEvent::Heartbeat)) => None,
                Some(Ok(StreamEvent::CursorExpired { requested: asked, earliest })) => {
                    self.report_gap(asked.map(Into::into).or(requested), earliest.map(Into::into))
                        .await
                }
                Some(Ok(StreamEvent::Reading(record))) => self.on_reading(record),
            };
            if let Some(reason) = exit {
                return Session::Exit(reason);
            }
        }
    }

    async fn report_gap(&mut self, requested: Option<Cursor>, resumed_from: Option<Cursor>) -> Option<CloseReason> {
        if self.last_gap == Some(requested) {
            return None;
        }
        self.last_gap = Some(requested);
        warn!(
            subscription = %self.id,
            requested = ?requested,
            resumed_from = ?resumed_from,
            "cursor older than platform retention; readings were missed"
        );
        // Control events wait for room rather than being dropped.
        let event = SubscriptionEvent::GapDetected { requested, resumed_from };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Some(self.cancelled_reason()),
            sent = self.events.send(event) => sent.err().map(|_| CloseReason::ListenerDropped),
        }
    }

    fn on_reading(&mut self, record: ReadingRecord) -> Option<CloseReason> {
        if record.device_id != self.device_id || record.sensor_type != self.sensor_type {
            debug!(subscription = %self.id, device = %record.device_id, sensor = %record.sensor_type, "ignoring reading for another series");
            return None;
        }
        let reading = reading_from_record(record, &self.tenant);
        let cursor = reading.cursor();
        if self.cursor.is_some_and(|c| cursor <= c) {
            return None;
        }

        // The cursor alone decides delivery; another subscription or a
        // history fetch may already have stored this reading.
        match self.store.append_reading(&self.tenant, reading.clone()) {
            Ok(AppendOutcome::Expired) => {
                debug!(subscription = %self.id, %cursor, "reading older than retained history; delivered but not stored");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(subscription = %self.id, %cursor, error = %e, "reading not stored");
                return None;
            }
        }
        self.cursor = Some(cursor);
        self.update_info(|i| i.cursor = Some(cursor));
        self.forward(SubscriptionEvent::Data(reading))
    }

    /// Non-blocking delivery; a full queue counts as lag.
    fn forward(&mut self, event: SubscriptionEvent) -> Option<CloseReason> {
        if self.dropped > 0 {
            match self.events.try_send(SubscriptionEvent::ListenerLag { dropped: self.dropped }) {
                Ok(()) => self.dropped = 0,
                Err(TrySendError::Full(_)) => {
                    self.dropped += 1;
                    return None;
                }
                Err(TrySendError::Closed(_)) => return Some(CloseReason::ListenerDropped),
            }
        }
        match self.events.try_send(event) {
            Ok(()) => {
                self.update_info(|i| i.delivered = i.delivered.saturating_add(1));
                None
            }
            Err(TrySendError::Full(_)) => {
                if self.dropped == 0 {
                    warn!(subscription = %self.id, "listener lagging; dropping readings");
                }
                self.dropped += 1;
                None
            }
            Err(TrySendError::Closed(_)) => Some(CloseReason::ListenerDropped),
        }
    }

    fn cancelled_reason(&self) -> CloseReason {
        self.info
            .load()
            .close_reason
            .clone()
            .unwrap_or(CloseReason::Shutdown)
    }

    fn set_state(&self, state: SubscriptionState) {
        self.state.send_replace(state);
        self.update_info(|i| i.state = state);
    }

    fn update_info(&self, change: impl Fn(&mut SubscriptionInfo)) {
        self.info.rcu(|current| {
            let mut next = SubscriptionInfo::clone(current);
            change(&mut next);
            next
        });
    }

    fn finish(&self, reason: CloseReason) -> CloseReason {
        mark_closed(&self.info, reason);
        self.set_state(SubscriptionState::Closed);
        let reason = self.cancelled_reason();
        info!(subscription = %self.id, %reason, "subscription closed");
        reason
    }
}
