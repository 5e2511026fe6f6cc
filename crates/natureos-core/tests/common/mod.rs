// Scripted in-memory `Transport` for driving the engines in tests.
#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use futures_util::StreamExt;
use natureos_api::models::ReadingRecord;
use natureos_api::{
    Ack, Connectivity, EventStream, FailureKind, Fetched, StreamEvent, StreamPosition, Transport,
    TransportError,
};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub type SendHandler = dyn Fn(&str, &Value, &str) -> Result<Ack, TransportError> + Send + Sync;

/// One call the engines made.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Fetch { path: String },
    Send { path: String, key: String },
    Open { path: String, from: Option<StreamPosition> },
    Probe,
}

pub enum StreamScript {
    Refuse(TransportError),
    /// Yield the events, then end (or stay open).
    Events {
        events: Vec<Result<StreamEvent, TransportError>>,
        hold_open: bool,
    },
    /// Events pushed by the test through the paired sender.
    Live(mpsc::UnboundedReceiver<Result<StreamEvent, TransportError>>),
    /// The open call never completes.
    Hang,
}

pub struct ScriptedTransport {
    connectivity: Connectivity,
    fetches: Mutex<HashMap<String, VecDeque<Result<Fetched, TransportError>>>>,
    sends: Mutex<HashMap<String, VecDeque<Result<Ack, TransportError>>>>,
    send_handler: Mutex<Arc<SendHandler>>,
    streams: Mutex<VecDeque<StreamScript>>,
    hung: Mutex<HashSet<String>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub fn online() -> Arc<Self> {
        Arc::new(Self::with_connectivity(true))
    }

    pub fn offline() -> Arc<Self> {
        Arc::new(Self::with_connectivity(false))
    }

    fn with_connectivity(online: bool) -> Self {
        let received: Arc<SendHandler> =
            Arc::new(|_: &str, _: &Value, _: &str| -> Result<Ack, TransportError> { Ok(Ack::received()) });
        Self {
            connectivity: Connectivity::new(online),
            fetches: Mutex::default(),
            sends: Mutex::default(),
            send_handler: Mutex::new(received),
            streams: Mutex::default(),
            hung: Mutex::default(),
            calls: Mutex::default(),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.connectivity.set(online);
    }

    // ── Scripting ───────────────────────────────────────────────────

    pub fn push_fetch(&self, path: &str, result: Result<Fetched, TransportError>) {
        self.fetches
            .lock()
            .unwrap()
            .entry(path.to_owned())
            .or_default()
            .push_back(result);
    }

    pub fn fetch_ok(&self, path: &str, payload: Value, version: u64) {
        self.push_fetch(path, Ok(Fetched { payload, version }));
    }

    pub fn push_send(&self, path: &str, result: Result<Ack, TransportError>) {
        self.sends
            .lock()
            .unwrap()
            .entry(path.to_owned())
            .or_default()
            .push_back(result);
    }

    /// Fallback for sends with nothing queued. Defaults to `Ack::received()`.
    pub fn on_send(
        &self,
        handler: impl Fn(&str, &Value, &str) -> Result<Ack, TransportError> + Send + Sync + 'static,
    ) {
        *self.send_handler.lock().unwrap() = Arc::new(handler);
    }

    pub fn push_stream(&self, script: StreamScript) {
        self.streams.lock().unwrap().push_back(script);
    }

    pub fn push_events(&self, events: Vec<Result<StreamEvent, TransportError>>, hold_open: bool) {
        self.push_stream(StreamScript::Events { events, hold_open });
    }

    /// Queue a stream the test feeds by hand.
    pub fn push_live(&self) -> mpsc::UnboundedSender<Result<StreamEvent, TransportError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push_stream(StreamScript::Live(rx));
        tx
    }

    /// Fetches and sends on `path` never answer until released.
    pub fn hang(&self, path: &str) {
        self.hung.lock().unwrap().insert(path.to_owned());
    }

    pub fn release(&self, path: &str) {
        self.hung.lock().unwrap().remove(path);
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sends(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send { path, key } => Some((path, key)),
                _ => None,
            })
            .collect()
    }

    pub fn fetch_count(&self, path: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Fetch { path: p } if p == path))
            .count()
    }

    pub fn opens(&self) -> Vec<Option<StreamPosition>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Open { from, .. } => Some(from),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn is_hung(&self, path: &str) -> bool {
        self.hung.lock().unwrap().contains(path)
    }

    fn unreachable() -> TransportError {
        TransportError::retryable(FailureKind::Connect, "network unreachable")
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(
        &self,
        path: &str,
        _params: &[(&str, String)],
        _tenant: &str,
    ) -> Result<Fetched, TransportError> {
        self.record(Call::Fetch { path: path.to_owned() });
        if !self.connectivity.is_online() {
            return Err(Self::unreachable());
        }
        if self.is_hung(path) {
            return std::future::pending().await;
        }
        self.fetches
            .lock()
            .unwrap()
            .get_mut(path)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(TransportError::fatal(FailureKind::NotFound, path.to_owned())))
    }

    async fn send(&self, path: &str, body: &Value, idempotency_key: &str) -> Result<Ack, TransportError> {
        self.record(Call::Send {
            path: path.to_owned(),
            key: idempotency_key.to_owned(),
        });
        if !self.connectivity.is_online() {
            return Err(Self::unreachable());
        }
        if self.is_hung(path) {
            return std::future::pending().await;
        }
        let queued = self.sends.lock().unwrap().get_mut(path).and_then(VecDeque::pop_front);
        match queued {
            Some(result) => result,
            None => {
                let handler = Arc::clone(&self.send_handler.lock().unwrap());
                handler(path, body, idempotency_key)
            }
        }
    }

    async fn open_stream(
        &self,
        path: &str,
        from: Option<StreamPosition>,
    ) -> Result<EventStream, TransportError> {
        self.record(Call::Open {
            path: path.to_owned(),
            from,
        });
        if !self.connectivity.is_online() {
            return Err(Self::unreachable());
        }
        let script = self.streams.lock().unwrap().pop_front();
        match script {
            None => Ok(Box::pin(futures_util::stream::pending())),
            Some(StreamScript::Refuse(e)) => Err(e),
            Some(StreamScript::Events { events, hold_open }) => {
                let events = futures_util::stream::iter(events);
                if hold_open {
                    Ok(Box::pin(events.chain(futures_util::stream::pending())))
                } else {
                    Ok(Box::pin(events))
                }
            }
            Some(StreamScript::Live(rx)) => Ok(Box::pin(UnboundedReceiverStream::new(rx))),
            Some(StreamScript::Hang) => std::future::pending().await,
        }
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.connectivity.subscribe()
    }

    async fn probe(&self) -> Result<(), TransportError> {
        self.record(Call::Probe);
        Ok(())
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

pub fn reading(device: &str, sensor: &str, ts: i64, seq: u64) -> Result<StreamEvent, TransportError> {
    Ok(StreamEvent::Reading(ReadingRecord {
        device_id: device.to_owned(),
        sensor_type: sensor.to_owned(),
        timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
        sequence: seq,
        value: 20.0 + f64::from(u32::try_from(ts % 10).unwrap()),
        unit: Some("C".to_owned()),
    }))
}

pub fn position(ts: i64, seq: u64) -> StreamPosition {
    StreamPosition {
        timestamp: DateTime::from_timestamp(ts, 0).unwrap(),
        sequence: seq,
    }
}

pub fn retryable(message: &str) -> TransportError {
    TransportError::retryable(FailureKind::Server, message)
}

/// Route engine logs to the test harness; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `cond` under paused time until it holds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}
