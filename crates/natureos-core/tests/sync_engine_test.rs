#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use common::{ScriptedTransport, eventually, retryable};
use natureos_api::{Ack, AckStatus, FailureKind, TransportError};
use natureos_core::{
    BackoffConfig, CommandEvent, CommandState, CoreError, Device, DeviceQuery, DeviceStatus,
    DrainReport, Entity, EntityVersion, FailureCause, Freshness, LocalStore, MycoBrainRegistration,
    NewCommand, NewDevice, SensorQuery, StoreConfig, SyncConfig, SyncEngine, TenantId, Versioned,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;

const COMMANDS: &str = "devices/esp32-001/commands";

fn config() -> SyncConfig {
    SyncConfig {
        retry: BackoffConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts: Some(3),
            jitter: 0.0,
        },
        refresh_interval: Duration::ZERO,
        ..SyncConfig::default()
    }
}

fn engine(transport: &Arc<ScriptedTransport>) -> (SyncEngine, Arc<LocalStore>) {
    engine_with(transport, config())
}

fn engine_with(transport: &Arc<ScriptedTransport>, config: SyncConfig) -> (SyncEngine, Arc<LocalStore>) {
    common::init_tracing();
    let store = Arc::new(LocalStore::in_memory(&StoreConfig::default()));
    let engine = SyncEngine::new(
        TenantId::default_tenant(),
        config,
        Arc::clone(&store),
        transport.clone(),
        CancellationToken::new(),
    );
    (engine, store)
}

fn pump(channel: u32) -> NewCommand {
    NewCommand::new("esp32-001", "set_mosfet")
        .param("channel", channel)
        .param("state", true)
}

fn lab_device() -> Device {
    Device {
        id: "esp32-001".into(),
        tenant_id: TenantId::default_tenant(),
        name: "Lab".into(),
        device_type: "esp32".into(),
        status: DeviceStatus::Online,
        last_seen: None,
        location: None,
        metadata: serde_json::Map::new(),
    }
}

/// Cache `device` as if it had been fetched an hour ago.
fn seed_stale(store: &LocalStore, device: Device) {
    let fetched_at = Utc::now() - chrono::Duration::hours(1);
    store
        .put(
            &TenantId::default_tenant(),
            Versioned::new(Entity::Device(device), EntityVersion::confirmed(1), fetched_at),
        )
        .unwrap();
}

// ── Commands ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn offline_command_is_delivered_after_reconnect() {
    let transport = ScriptedTransport::offline();
    transport.on_send(|_, _, _| Ok(Ack::completed()));
    let (engine, store) = engine(&transport);

    let handle = engine.submit_command(pump(1)).unwrap();
    let id = handle.id();
    assert_eq!(handle.current().state, CommandState::Pending);
    assert_eq!(store.list_pending_commands(engine.tenant()).len(), 1);
    assert!(transport.sends().is_empty());

    let runner = engine.clone();
    tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.command(id).unwrap().state, CommandState::Pending);

    transport.set_online(true);
    let done = handle.wait().await.unwrap();

    assert_eq!(done.state, CommandState::Acknowledged);
    assert_eq!(transport.sends(), vec![(COMMANDS.to_owned(), id.to_string())]);
    assert!(engine.pending_commands().is_empty());
}

#[tokio::test(start_paused = true)]
async fn received_command_is_acknowledged_by_reconciliation() {
    let transport = ScriptedTransport::online();
    let (engine, _store) = engine(&transport);
    let mut events = engine.subscribe_commands();

    let handle = engine.submit_command(pump(1)).unwrap();
    let id = handle.id();
    let sent = events.recv().await.unwrap();
    assert!(matches!(sent, CommandEvent::Sent(ref c) if c.id == id));

    let status_path = format!("{COMMANDS}/{id}");
    transport.fetch_ok(&status_path, json!({ "command_id": id.to_string(), "status": "executed" }), 2);
    assert_eq!(engine.reconcile_sent_commands().await.unwrap(), 1);

    let acked = events.recv().await.unwrap();
    assert!(matches!(acked, CommandEvent::Acknowledged(ref c) if c.id == id));
    assert_eq!(handle.wait().await.unwrap().state, CommandState::Acknowledged);
    assert_eq!(transport.fetch_count(&status_path), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_until_received() {
    let transport = ScriptedTransport::online();
    transport.push_send(COMMANDS, Err(retryable("502 bad gateway")));
    transport.push_send(COMMANDS, Err(retryable("503 unavailable")));
    let (engine, _store) = engine(&transport);
    let mut events = engine.subscribe_commands();

    let id = engine.submit_command(pump(2)).unwrap().id();
    let event = events.recv().await.unwrap();

    assert!(matches!(event, CommandEvent::Sent(_)));
    let command = engine.command(id).unwrap();
    assert_eq!(command.state, CommandState::Sent);
    assert_eq!(command.attempts, 3);
    assert_eq!(command.last_error, None);
    assert_eq!(transport.sends().len(), 3);
    assert!(transport.sends().iter().all(|(_, key)| *key == id.to_string()));
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_the_command_once() {
    let transport = ScriptedTransport::online();
    for _ in 0..3 {
        transport.push_send(COMMANDS, Err(retryable("connection reset")));
    }
    let (engine, _store) = engine(&transport);
    let mut events = engine.subscribe_commands();

    let handle = engine.submit_command(pump(3)).unwrap();
    let id = handle.id();
    let err = handle.wait().await.unwrap_err();

    assert!(matches!(err, CoreError::CommandFailed { id: failed, .. } if failed == id));
    let command = engine.command(id).unwrap();
    assert_eq!(command.state, CommandState::Failed);
    assert_eq!(command.attempts, 3);
    assert_eq!(command.failure.unwrap().cause, FailureCause::Exhausted);

    assert!(matches!(events.recv().await.unwrap(), CommandEvent::Failed(_)));
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn platform_rejection_fails_without_retry() {
    let transport = ScriptedTransport::online();
    transport.push_send(
        COMMANDS,
        Ok(Ack {
            status: AckStatus::Rejected,
            version: None,
            payload: json!({ "error": "unknown channel" }),
        }),
    );
    let (engine, _store) = engine(&transport);

    let handle = engine.submit_command(pump(9)).unwrap();
    let id = handle.id();
    let err = handle.wait().await.unwrap_err();

    match err {
        CoreError::CommandFailed { reason, .. } => assert_eq!(reason, "rejected: unknown channel"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.command(id).unwrap().attempts, 1);
    assert_eq!(transport.sends().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn fatal_transport_error_rejects_the_command() {
    let transport = ScriptedTransport::online();
    transport.push_send(
        COMMANDS,
        Err(TransportError::fatal(FailureKind::Unauthorized, "invalid api key")),
    );
    let (engine, _store) = engine(&transport);

    let handle = engine.submit_command(pump(1)).unwrap();
    let id = handle.id();
    assert!(handle.wait().await.is_err());

    let failure = engine.command(id).unwrap().failure.unwrap();
    assert_eq!(failure.cause, FailureCause::Rejected);
    assert!(failure.message.contains("invalid api key"));
}

#[tokio::test(start_paused = true)]
async fn concurrent_submissions_are_each_delivered_once() {
    let transport = ScriptedTransport::online();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    transport.on_send(move |_, body, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        let channel = body["parameters"]["channel"].as_u64().unwrap_or_default();
        if channel % 2 == 0 {
            Ok(Ack::completed())
        } else {
            Ok(Ack::received())
        }
    });
    let (engine, _store) = engine(&transport);

    let handles: Vec<_> = (0..6).map(|ch| engine.submit_command(pump(ch)).unwrap()).collect();
    // A drain racing the spawned deliveries must not double-send.
    let report = engine.drain_pending().await;
    assert_eq!(report.deferred, 0);

    eventually(|| engine.pending_commands().is_empty()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 6);

    let mut keys: Vec<String> = transport.sends().into_iter().map(|(_, key)| key).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 6);

    for (channel, handle) in handles.iter().enumerate() {
        let expected = if channel % 2 == 0 {
            CommandState::Acknowledged
        } else {
            CommandState::Sent
        };
        assert_eq!(engine.command(handle.id()).unwrap().state, expected);
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_offline_command_is_never_sent() {
    let transport = ScriptedTransport::offline();
    let (engine, _store) = engine(&transport);

    let handle = engine.submit_command(pump(1)).unwrap();
    let id = handle.id();
    let cancelled = engine.cancel_command(id).unwrap();
    assert_eq!(cancelled.state, CommandState::Failed);
    assert_eq!(cancelled.failure.unwrap().cause, FailureCause::Cancelled);
    assert!(handle.wait().await.is_err());

    transport.set_online(true);
    let report = engine.drain_pending().await;
    assert_eq!(report.delivered, 0);
    assert!(transport.sends().is_empty());

    let again = engine.cancel_command(id).unwrap_err();
    assert!(matches!(again, CoreError::InvalidTransition { .. }));
}

#[tokio::test(start_paused = true)]
async fn cancel_during_backoff_stops_delivery() {
    let transport = ScriptedTransport::online();
    transport.push_send(COMMANDS, Err(retryable("gateway timeout")));
    let (engine, _store) = engine(&transport);

    let id = engine.submit_command(pump(1)).unwrap().id();
    eventually(|| engine.command(id).is_some_and(|c| c.attempts == 1)).await;

    engine.cancel_command(id).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(transport.sends().len(), 1);
    let command = engine.command(id).unwrap();
    assert_eq!(command.state, CommandState::Failed);
    assert_eq!(command.failure.unwrap().cause, FailureCause::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn cancelling_one_command_does_not_stall_the_drain() {
    let transport = ScriptedTransport::offline();
    transport.push_send(COMMANDS, Err(retryable("gateway timeout")));
    transport.on_send(|_, _, _| Ok(Ack::completed()));
    let (engine, _store) = engine(&transport);

    let first = engine.submit_command(pump(1)).unwrap().id();
    // Distinct creation times fix the drain order.
    std::thread::sleep(Duration::from_millis(2));
    let second = engine
        .submit_command(NewCommand::new("esp32-002", "set_mosfet").param("channel", 1))
        .unwrap();

    transport.set_online(true);
    let drainer = engine.clone();
    let drain = tokio::spawn(async move { drainer.drain_pending().await });
    eventually(|| engine.command(first).is_some_and(|c| c.attempts == 1)).await;
    engine.cancel_command(first).unwrap();

    let report = drain.await.unwrap();
    assert_eq!(
        report,
        DrainReport {
            delivered: 1,
            failed: 0,
            deferred: 0
        }
    );
    assert_eq!(second.wait().await.unwrap().state, CommandState::Acknowledged);
    let cancelled = engine.command(first).unwrap();
    assert_eq!(cancelled.failure.unwrap().cause, FailureCause::Cancelled);
    assert_eq!(transport.sends().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_drain_and_keeps_commands_pending() {
    let transport = ScriptedTransport::offline();
    let store = Arc::new(LocalStore::in_memory(&StoreConfig::default()));
    let shutdown = CancellationToken::new();
    let engine = SyncEngine::new(
        TenantId::default_tenant(),
        config(),
        Arc::clone(&store),
        transport.clone(),
        shutdown.clone(),
    );
    let ids: Vec<_> = (0..3).map(|ch| engine.submit_command(pump(ch)).unwrap().id()).collect();

    transport.set_online(true);
    shutdown.cancel();
    let report = engine.drain_pending().await;

    assert_eq!(report.deferred, 3);
    assert!(transport.sends().is_empty());
    assert_eq!(store.list_pending_commands(engine.tenant()).len(), ids.len());
}

#[tokio::test(start_paused = true)]
async fn unanswered_send_times_out_as_a_retryable_attempt() {
    let transport = ScriptedTransport::online();
    transport.hang(COMMANDS);
    let (engine, _store) = engine_with(
        &transport,
        SyncConfig {
            request_timeout: Duration::from_secs(1),
            ..config()
        },
    );

    let handle = engine.submit_command(pump(1)).unwrap();
    let id = handle.id();
    eventually(|| engine.command(id).is_some_and(|c| c.attempts == 1)).await;

    let waiting = engine.command(id).unwrap();
    assert_eq!(waiting.state, CommandState::Pending);
    assert!(waiting.last_error.unwrap().contains("no response within 1000ms"));

    assert!(handle.wait().await.is_err());
    let failed = engine.command(id).unwrap();
    assert_eq!(failed.attempts, 3);
    assert_eq!(failed.failure.unwrap().cause, FailureCause::Exhausted);
    assert_eq!(transport.sends().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn empty_command_type_is_rejected_before_queueing() {
    let transport = ScriptedTransport::online();
    let (engine, store) = engine(&transport);

    let err = engine.submit_command(NewCommand::new("esp32-001", " ")).unwrap_err();
    assert!(matches!(err, CoreError::Validation { .. }));
    assert!(store.list_pending_commands(engine.tenant()).is_empty());
}

// ── Reads ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unanswered_refresh_serves_the_stale_cache() {
    let transport = ScriptedTransport::online();
    transport.hang("devices/esp32-001");
    let (engine, store) = engine_with(
        &transport,
        SyncConfig {
            request_timeout: Duration::from_secs(1),
            ..config()
        },
    );
    seed_stale(&store, lab_device());

    let started = tokio::time::Instant::now();
    let read = engine.read_device("esp32-001", None).await.unwrap();

    assert_eq!(read.freshness, Freshness::Stale);
    assert_eq!(read.value, lab_device());
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(transport.fetch_count("devices/esp32-001"), 1);
}

#[tokio::test(start_paused = true)]
async fn fresh_cache_hit_skips_the_network() {
    let transport = ScriptedTransport::online();
    transport.fetch_ok("devices/esp32-001", json!({ "id": "esp32-001", "name": "Lab", "status": "online" }), 3);
    let (engine, store) = engine(&transport);

    let first = engine.read_device("esp32-001", None).await.unwrap();
    assert_eq!(first.freshness, Freshness::Fetched);
    assert_eq!(first.value.status, DeviceStatus::Online);

    let second = engine.read_device("esp32-001", None).await.unwrap();
    assert_eq!(second.freshness, Freshness::Cached);
    assert_eq!(second.value, first.value);
    assert_eq!(transport.fetch_count("devices/esp32-001"), 1);

    let cached = store.device(engine.tenant(), "esp32-001").unwrap();
    assert_eq!(cached.version, EntityVersion::confirmed(3));
}

#[tokio::test(start_paused = true)]
async fn stale_cache_is_served_when_refresh_fails() {
    let transport = ScriptedTransport::online();
    transport.push_fetch("devices/esp32-001", Err(retryable("503 unavailable")));
    let (engine, store) = engine(&transport);
    seed_stale(&store, lab_device());

    let read = engine.read_device("esp32-001", None).await.unwrap();

    assert_eq!(read.freshness, Freshness::Stale);
    assert!(read.is_stale());
    assert_eq!(read.value.name, "Lab");
    assert_eq!(transport.fetch_count("devices/esp32-001"), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_cache_is_refreshed_when_reachable() {
    let transport = ScriptedTransport::online();
    transport.fetch_ok("devices/esp32-001", json!({ "id": "esp32-001", "name": "Lab (moved)", "status": "offline" }), 2);
    let (engine, store) = engine(&transport);
    seed_stale(&store, lab_device());

    let read = engine.read_device("esp32-001", Some(Duration::from_secs(60))).await.unwrap();

    assert_eq!(read.freshness, Freshness::Fetched);
    assert_eq!(read.value.name, "Lab (moved)");
    assert_eq!(
        store.device(engine.tenant(), "esp32-001").unwrap().version,
        EntityVersion::confirmed(2)
    );
}

#[tokio::test(start_paused = true)]
async fn fatal_errors_are_not_masked_by_the_cache() {
    let transport = ScriptedTransport::online();
    transport.push_fetch(
        "devices/esp32-001",
        Err(TransportError::fatal(FailureKind::Unauthorized, "invalid api key")),
    );
    let (engine, store) = engine(&transport);
    seed_stale(&store, lab_device());

    let err = engine.read_device("esp32-001", None).await.unwrap_err();
    assert!(matches!(err, CoreError::Transport(ref e) if e.kind == FailureKind::Unauthorized));
}

#[tokio::test(start_paused = true)]
async fn offline_reads_use_cache_or_report_offline() {
    let transport = ScriptedTransport::offline();
    let (engine, store) = engine(&transport);

    let err = engine.read_device("esp32-001", None).await.unwrap_err();
    assert!(matches!(err, CoreError::Offline { .. }));

    seed_stale(&store, lab_device());
    let read = engine.read_device("esp32-001", None).await.unwrap();
    assert_eq!(read.freshness, Freshness::Stale);

    let listed = engine.list_devices(&DeviceQuery::default()).await.unwrap();
    assert_eq!(listed.freshness, Freshness::Stale);
    assert_eq!(listed.value.len(), 1);
    assert!(transport.fetch_count("devices/esp32-001") == 0);
}

#[tokio::test(start_paused = true)]
async fn uncached_read_retries_transient_failures() {
    let transport = ScriptedTransport::online();
    transport.push_fetch("devices/esp32-001", Err(retryable("502 bad gateway")));
    transport.fetch_ok("devices/esp32-001", json!({ "id": "esp32-001" }), 1);
    let (engine, _store) = engine(&transport);

    let read = engine.read_device("esp32-001", None).await.unwrap();
    assert_eq!(read.freshness, Freshness::Fetched);
    assert_eq!(read.value.name, "esp32-001");
    assert_eq!(transport.fetch_count("devices/esp32-001"), 2);
}

#[tokio::test(start_paused = true)]
async fn device_list_is_cached_and_filtered_offline() {
    let transport = ScriptedTransport::online();
    transport.fetch_ok(
        "devices",
        json!({ "items": [
            { "id": "esp32-001", "type": "esp32", "status": "online" },
            { "id": "myco-7", "type": "mycobrain", "status": "offline" },
        ] }),
        5,
    );
    let (engine, _store) = engine(&transport);

    let listed = engine.list_devices(&DeviceQuery::default()).await.unwrap();
    assert_eq!(listed.freshness, Freshness::Fetched);
    assert_eq!(listed.value.len(), 2);

    transport.set_online(false);
    let offline = engine
        .list_devices(&DeviceQuery::default().of_type("mycobrain"))
        .await
        .unwrap();
    assert_eq!(offline.freshness, Freshness::Stale);
    let ids: Vec<_> = offline.value.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, ["myco-7"]);
}

#[tokio::test(start_paused = true)]
async fn sensor_history_is_retained_for_offline_reads() {
    let transport = ScriptedTransport::online();
    let now = Utc::now();
    let at = |mins: i64| (now - chrono::Duration::minutes(mins)).to_rfc3339();
    transport.fetch_ok(
        "devices/esp32-001/sensor-data",
        json!({ "items": [
            { "device_id": "esp32-001", "sensor_type": "temperature", "timestamp": at(5), "sequence": 2, "value": 21.5 },
            { "device_id": "esp32-001", "sensor_type": "temperature", "timestamp": at(10), "sequence": 1, "value": 21.0 },
        ] }),
        0,
    );
    let (engine, store) = engine(&transport);
    let query = SensorQuery::new("esp32-001").sensor("temperature");

    let fetched = engine.sensor_history(&query).await.unwrap();
    assert_eq!(fetched.freshness, Freshness::Fetched);
    let values: Vec<f64> = fetched.value.iter().map(|r| r.value).collect();
    assert_eq!(values, [21.0, 21.5]);
    assert_eq!(store.reading_count(engine.tenant(), "esp32-001", "temperature"), 2);

    transport.set_online(false);
    let cached = engine.sensor_history(&query).await.unwrap();
    assert_eq!(cached.freshness, Freshness::Stale);
    assert_eq!(cached.value, fetched.value);
}

// ── Registration ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn mycobrain_registration_caches_the_device() {
    let transport = ScriptedTransport::online();
    transport.push_send(
        "devices/register",
        Ok(Ack {
            status: AckStatus::Received,
            version: Some(1),
            payload: json!({ "id": "myco-7", "name": "Bench board", "type": "mycobrain", "status": "online" }),
        }),
    );
    let (engine, store) = engine(&transport);

    let device = engine
        .register_mycobrain_device(MycoBrainRegistration::new("myco-7", "MB-0007", "Bench board").with_firmware("1.4.2"))
        .await
        .unwrap();

    assert_eq!(device.device_type, "mycobrain");
    assert_eq!(transport.sends(), vec![("devices/register".to_owned(), "myco-7".to_owned())]);
    assert_eq!(store.device(engine.tenant(), "myco-7").unwrap().value, device);
}

#[tokio::test(start_paused = true)]
async fn registration_requires_connectivity() {
    let transport = ScriptedTransport::offline();
    let (engine, _store) = engine(&transport);

    let err = engine
        .register_device(NewDevice::new("esp32-002", "Greenhouse", "esp32"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Offline { .. }));
    assert!(transport.sends().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rejected_registration_surfaces_the_reason() {
    let transport = ScriptedTransport::online();
    transport.push_send(
        "devices/register",
        Ok(Ack {
            status: AckStatus::Rejected,
            version: None,
            payload: json!({ "detail": "device_id already registered to another tenant" }),
        }),
    );
    let (engine, store) = engine(&transport);

    let err = engine
        .register_device(NewDevice::new("esp32-002", "Greenhouse", "esp32"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Rejected { ref message } if message.contains("another tenant")));
    assert!(store.device(engine.tenant(), "esp32-002").is_none());
}
