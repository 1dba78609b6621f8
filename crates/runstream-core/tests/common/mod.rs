//! Shared setup for runstream-core integration tests.

#![allow(dead_code)]

use runstream_core::{
    BrokerSettings, CallbackRegistry, CoordinatorSettings, ExecutionError, Executor, RunContext,
    RunCoordinator, RunError, StreamBroker, StreamItem, Subscription,
};
use runstream_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use runstream_log::{LogSettings, SqliteEventLog};
use runstream_types::Event;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub struct Harness {
    pub coordinator: Arc<RunCoordinator>,
    pub pool: DbPool,
    _dir: tempfile::TempDir,
}

pub fn harness() -> Harness {
    harness_with(
        LogSettings::default(),
        BrokerSettings::default(),
        CoordinatorSettings::default(),
    )
}

/// Builds a coordinator over a fresh file-backed database.
pub fn harness_with(
    log_settings: LogSettings,
    broker_settings: BrokerSettings,
    coordinator_settings: CoordinatorSettings,
) -> Harness {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let db_path = dir.path().join("runstream.db");
    let pool = create_pool(
        db_path.to_str().expect("utf-8 path"),
        DbRuntimeSettings {
            busy_timeout_ms: 5_000,
            pool_max_size: 4,
        },
    )
    .expect("should create pool");
    {
        let conn = pool.get().expect("should get connection");
        run_migrations(&conn).expect("migrations should succeed");
    }

    let log = Arc::new(SqliteEventLog::new(pool.clone(), log_settings));
    let broker = Arc::new(StreamBroker::new(log.clone(), broker_settings));
    let coordinator = RunCoordinator::new(
        Arc::new(CallbackRegistry::new()),
        log,
        broker,
        coordinator_settings,
    );

    Harness {
        coordinator,
        pool,
        _dir: dir,
    }
}

/// How a drained subscription ended.
#[derive(Debug)]
pub enum Ending {
    Closed,
    Failed(RunError),
    Exhausted,
}

/// Reads events until the stream closes or fails, skipping heartbeats.
pub async fn drain(subscription: &mut Subscription) -> (Vec<Event>, Ending) {
    let mut events = Vec::new();
    let ending = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match subscription.next().await {
                Some(Ok(StreamItem::Event(event))) => events.push(event),
                Some(Ok(StreamItem::Heartbeat)) => continue,
                Some(Ok(StreamItem::Closed)) => return Ending::Closed,
                Some(Err(e)) => return Ending::Failed(e),
                None => return Ending::Exhausted,
            }
        }
    })
    .await
    .expect("stream should end within 30s");
    (events, ending)
}

/// Reads exactly `count` events, skipping heartbeats.
pub async fn take(subscription: &mut Subscription, count: usize) -> Vec<Event> {
    let mut events = Vec::with_capacity(count);
    tokio::time::timeout(Duration::from_secs(30), async {
        while events.len() < count {
            match subscription.next().await {
                Some(Ok(StreamItem::Event(event))) => events.push(event),
                Some(Ok(StreamItem::Heartbeat)) => continue,
                other => panic!("expected event, got {other:?}"),
            }
        }
    })
    .await
    .expect("events should arrive within 30s");
    events
}

pub fn assert_strictly_increasing(events: &[Event]) {
    for pair in events.windows(2) {
        assert!(
            pair[0].id < pair[1].id,
            "event {} delivered after {}",
            pair[1].id,
            pair[0].id
        );
    }
}

/// Numeric `n` payload field of output events.
pub fn output_numbers(events: &[Event]) -> Vec<u64> {
    events
        .iter()
        .filter(|e| e.action == "worker_output")
        .filter_map(|e| e.payload.get("n").and_then(|n| n.as_u64()))
        .collect()
}

/// Boxes a closure as an executor, pinning its signature.
pub fn executor<F>(f: F) -> Arc<dyn Executor>
where
    F: Fn(RunContext) -> Result<Value, ExecutionError> + Send + Sync + 'static,
{
    Arc::new(f)
}
