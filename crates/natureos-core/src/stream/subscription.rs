// ── Subscription handle ──

use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_core::Stream;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use crate::model::{CloseReason, Cursor, SensorReading, SubscriptionId, SubscriptionInfo, SubscriptionState};

/// What a subscription delivers to its listener.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// A reading not previously seen, in cursor order.
    Data(SensorReading),
    /// The platform no longer retains readings after `requested`; the
    /// stream resumed from `resumed_from`. Reported once per cursor.
    GapDetected {
        requested: Option<Cursor>,
        resumed_from: Option<Cursor>,
    },
    /// `dropped` readings were not delivered because the listener fell
    /// behind. They are still in the local store.
    ListenerLag { dropped: u64 },
    /// Terminal. Nothing follows.
    Closed { reason: CloseReason },
}

/// Listener side of one subscription.
///
/// Dropping the handle closes the subscription.
pub struct Subscription {
    id: SubscriptionId,
    events: mpsc::Receiver<SubscriptionEvent>,
    state: watch::Receiver<SubscriptionState>,
    info: Arc<ArcSwap<SubscriptionInfo>>,
    cancel: CancellationToken,
    closed_seen: bool,
}

impl Subscription {
    pub(super) fn new(
        id: SubscriptionId,
        events: mpsc::Receiver<SubscriptionEvent>,
        state: watch::Receiver<SubscriptionState>,
        info: Arc<ArcSwap<SubscriptionInfo>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            events,
            state,
            info,
            cancel,
            closed_seen: false,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next event, or `None` after `Closed` has been returned.
    ///
    /// Once the subscription is closed locally, buffered readings are
    /// discarded and a single `Closed` is returned.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        if self.closed_seen {
            return None;
        }
        if self.cancel.is_cancelled() {
            return Some(self.closed());
        }
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Some(self.closed()),
            event = self.events.recv() => match event {
                Some(event) => Some(event),
                None => Some(self.closed()),
            },
        }
    }

    /// Close from the listener side. Idempotent.
    pub fn close(&self) {
        mark_closed(&self.info, CloseReason::Requested);
        self.cancel.cancel();
    }

    pub fn state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }

    pub fn state_stream(&self) -> WatchStream<SubscriptionState> {
        WatchStream::new(self.state.clone())
    }

    /// Position of the last reading written by this subscription.
    pub fn cursor(&self) -> Option<Cursor> {
        self.info.load().cursor
    }

    pub fn info(&self) -> SubscriptionInfo {
        (**self.info.load()).clone()
    }

    /// Events as a `Stream`, ending after `Closed`.
    pub fn into_stream(self) -> impl Stream<Item = SubscriptionEvent> + Send {
        futures_util::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        })
    }

    fn closed(&mut self) -> SubscriptionEvent {
        self.closed_seen = true;
        self.events.close();
        let reason = self
            .info
            .load()
            .close_reason
            .clone()
            .unwrap_or(CloseReason::Shutdown);
        SubscriptionEvent::Closed { reason }
    }
}

/// Record `reason` unless the subscription already has one.
pub(super) fn mark_closed(info: &ArcSwap<SubscriptionInfo>, reason: CloseReason) {
    info.rcu(|current| {
        let mut next = SubscriptionInfo::clone(current);
        if next.close_reason.is_none() {
            next.close_reason = Some(reason.clone());
        }
        next
    });
}
