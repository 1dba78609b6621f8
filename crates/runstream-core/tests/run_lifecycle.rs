//! Integration tests for run start, finalization and cancellation.

mod common;

use common::{drain, executor, harness, harness_with, take, Ending};
use runstream_core::{
    BrokerSettings, CoordinatorSettings, Emitter, ExecutionError, RunContext, RunError,
};
use runstream_log::{LogCursor, LogSettings};
use runstream_types::{lifecycle, Category, Event, EventDraft, EventId, RunStatus};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn output(n: u64) -> EventDraft {
    EventDraft::new(Category::Output, "worker_output").with_field("n", n)
}

fn lifecycle_actions(events: &[Event]) -> Vec<&str> {
    events
        .iter()
        .filter(|e| e.category == Category::Lifecycle)
        .map(|e| e.action.as_str())
        .collect()
}

// ── isolation ────────────────────────────────────────────────────────

/// Emits tagged outputs from several worker threads.
fn tagged(ctx: RunContext) -> Result<Value, ExecutionError> {
    let tag = ctx.task().to_string();
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let emitter = ctx.emitter();
            let tag = tag.clone();
            std::thread::spawn(move || -> Result<(), ExecutionError> {
                for step in 0..20u64 {
                    emitter.emit(
                        EventDraft::new(Category::Output, "worker_output")
                            .with_field("tag", tag.clone())
                            .with_field("step", step),
                    )?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle
            .join()
            .map_err(|_| ExecutionError::Failed("worker panicked".into()))??;
    }
    Ok(json!({ "tag": tag }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_never_see_each_others_events() {
    let h = harness();
    let alpha = h.coordinator.create_run("ALPHA");
    let beta = h.coordinator.create_run("BETA");

    let mut alpha_sub = h
        .coordinator
        .subscribe_live(&alpha, None)
        .await
        .expect("subscribe alpha");
    let mut beta_sub = h
        .coordinator
        .subscribe_live(&beta, None)
        .await
        .expect("subscribe beta");

    let a = h.coordinator.start(&alpha, Arc::new(tagged)).expect("start alpha");
    let b = h.coordinator.start(&beta, Arc::new(tagged)).expect("start beta");

    let ((alpha_events, alpha_end), (beta_events, beta_end)) =
        tokio::join!(drain(&mut alpha_sub), drain(&mut beta_sub));
    assert_eq!(a.await.expect("join alpha"), RunStatus::Completed);
    assert_eq!(b.await.expect("join beta"), RunStatus::Completed);
    assert!(matches!(alpha_end, Ending::Closed), "got {alpha_end:?}");
    assert!(matches!(beta_end, Ending::Closed), "got {beta_end:?}");

    for (run_id, own, other, events) in [
        (&alpha, "ALPHA", "BETA", &alpha_events),
        (&beta, "BETA", "ALPHA", &beta_events),
    ] {
        assert_eq!(events.len(), 1 + 60 + 1, "started + outputs + completed");
        assert!(events.iter().all(|e| e.run_id == *run_id));
        let encoded = serde_json::to_string(events).expect("encode events");
        assert!(!encoded.contains(other), "{own} stream leaked {other}");
        assert!(events
            .iter()
            .filter(|e| e.action == "worker_output")
            .all(|e| e.payload["tag"] == own));

        let last = events.last().expect("terminal event");
        assert_eq!(last.action, lifecycle::COMPLETED);
        assert_eq!(last.run_id, *run_id);
        assert_eq!(last.payload["result"]["tag"], own);
        common::assert_strictly_increasing(events);
    }
}

// ── lifecycle ────────────────────────────────────────────────────────

#[tokio::test]
async fn completed_run_records_started_and_completed_events() {
    let h = harness();
    let run = h.coordinator.create_run("count to three");
    assert_eq!(
        h.coordinator.run_info(&run).expect("run info").status,
        RunStatus::Pending
    );
    assert_eq!(h.coordinator.active_run_ids(), vec![run.clone()]);

    let status = h
        .coordinator
        .start(
            &run,
            executor(|ctx| {
                for n in 1..=3 {
                    ctx.emit(output(n))?;
                }
                Ok(json!(3))
            }),
        )
        .expect("start")
        .await
        .expect("join");
    assert_eq!(status, RunStatus::Completed);

    let page = h
        .coordinator
        .query_history(&run, LogCursor::Earliest, LogCursor::Latest, None)
        .await
        .expect("history");
    assert_eq!(
        lifecycle_actions(&page.events),
        vec![lifecycle::STARTED, lifecycle::COMPLETED]
    );
    assert_eq!(page.events[0].payload["task"], "count to three");
    assert_eq!(common::output_numbers(&page.events), vec![1, 2, 3]);
    let sequences: Vec<u64> = page.events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);

    let info = h.coordinator.run_info(&run).expect("run info");
    assert_eq!(info.status, RunStatus::Completed);
    assert_eq!(info.result, Some(json!(3)));
    assert!(info.started_at.is_some() && info.finished_at.is_some());
    assert!(h.coordinator.active_run_ids().is_empty());
}

#[tokio::test]
async fn failing_and_panicking_executors_finalize_as_failed() {
    let h = harness();

    let failing = h.coordinator.create_run("fail");
    let status = h
        .coordinator
        .start(
            &failing,
            executor(|_ctx| Err(ExecutionError::Failed("model unavailable".into()))),
        )
        .expect("start")
        .await
        .expect("join");
    assert_eq!(status, RunStatus::Failed);

    let panicking = h.coordinator.create_run("panic");
    let status = h
        .coordinator
        .start(
            &panicking,
            executor(|_ctx| panic!("worker exploded")),
        )
        .expect("start")
        .await
        .expect("join should succeed even when the executor panics");
    assert_eq!(status, RunStatus::Failed);

    for (run, needle) in [(&failing, "model unavailable"), (&panicking, "worker exploded")] {
        let page = h
            .coordinator
            .query_history(run, LogCursor::Earliest, LogCursor::Latest, None)
            .await
            .expect("history");
        let last = page.events.last().expect("terminal event");
        assert_eq!(last.action, lifecycle::FAILED);
        assert!(
            last.payload["error"]
                .as_str()
                .is_some_and(|e| e.contains(needle)),
            "error payload: {}",
            last.payload["error"]
        );
        let info = h.coordinator.run_info(run).expect("run info");
        assert!(info.error.is_some_and(|e| e.contains(needle)));
    }
}

#[tokio::test]
async fn start_rejects_unknown_and_already_started_runs() {
    let h = harness();
    let err = h
        .coordinator
        .start(
            &runstream_types::RunId::from("ghost"),
            executor(|_ctx| Ok(Value::Null)),
        )
        .expect_err("unknown run");
    assert!(matches!(err, RunError::NotFound(_)), "got {err:?}");

    let run = h.coordinator.create_run("once");
    let handle = h
        .coordinator
        .start(&run, executor(|_ctx| Ok(Value::Null)))
        .expect("first start");
    let err = h
        .coordinator
        .start(&run, executor(|_ctx| Ok(Value::Null)))
        .expect_err("second start");
    assert!(matches!(err, RunError::AlreadyStarted(_)), "got {err:?}");
    assert_eq!(handle.await.expect("join"), RunStatus::Completed);
}

// ── cancellation ─────────────────────────────────────────────────────

/// Emits until the run is cancelled, from two threads.
fn emit_until_cancelled(ctx: RunContext) -> Result<Value, ExecutionError> {
    let handles: Vec<_> = (0..2u64)
        .map(|worker| {
            let emitter = ctx.emitter();
            std::thread::spawn(move || -> Result<(), ExecutionError> {
                let mut n = worker * 1_000_000;
                loop {
                    n += 1;
                    emitter.emit(output(n))?;
                    std::thread::sleep(Duration::from_millis(2));
                }
            })
        })
        .collect();
    let mut outcome = Ok(());
    for handle in handles {
        let joined = handle
            .join()
            .map_err(|_| ExecutionError::Failed("worker panicked".into()))
            .and_then(|result| result);
        if outcome.is_ok() {
            outcome = joined;
        }
    }
    outcome.map(|()| Value::Null)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_stops_only_the_cancelled_run() {
    let h = harness();
    let doomed = h.coordinator.create_run("doomed");
    let survivor = h.coordinator.create_run("survivor");

    let mut doomed_sub = h
        .coordinator
        .subscribe_live(&doomed, None)
        .await
        .expect("subscribe");

    let doomed_handle = h
        .coordinator
        .start(&doomed, Arc::new(emit_until_cancelled))
        .expect("start doomed");
    let survivor_handle = h
        .coordinator
        .start(
            &survivor,
            executor(|ctx| {
                for n in 1..=20 {
                    ctx.emit(output(n))?;
                    std::thread::sleep(Duration::from_millis(2));
                }
                Ok(json!("done"))
            }),
        )
        .expect("start survivor");

    // Let the doomed run produce a little before pulling the plug.
    take(&mut doomed_sub, 6).await;
    assert!(h.coordinator.cancel(&doomed).expect("cancel"));
    assert!(
        !h.coordinator.cancel(&doomed).expect("second cancel"),
        "flag is set at most once"
    );

    assert_eq!(doomed_handle.await.expect("join"), RunStatus::Cancelled);
    assert_eq!(survivor_handle.await.expect("join"), RunStatus::Completed);

    let (_, ending) = drain(&mut doomed_sub).await;
    assert!(matches!(ending, Ending::Closed), "got {ending:?}");

    let doomed_history = h
        .coordinator
        .query_history(&doomed, LogCursor::Earliest, LogCursor::Latest, Some(1_000))
        .await
        .expect("doomed history");
    let cancelled: Vec<_> = doomed_history
        .events
        .iter()
        .filter(|e| e.action == lifecycle::CANCELLED)
        .collect();
    assert_eq!(cancelled.len(), 1, "exactly one cancelled event");
    assert_eq!(
        doomed_history.events.last().map(|e| e.action.as_str()),
        Some(lifecycle::CANCELLED),
        "nothing is written after the cancelled event"
    );

    let survivor_history = h
        .coordinator
        .query_history(&survivor, LogCursor::Earliest, LogCursor::Latest, None)
        .await
        .expect("survivor history");
    assert_eq!(common::output_numbers(&survivor_history.events).len(), 20);
    assert!(survivor_history
        .events
        .iter()
        .all(|e| e.action != lifecycle::CANCELLED));
    assert_eq!(
        survivor_history.events.last().map(|e| e.action.as_str()),
        Some(lifecycle::COMPLETED)
    );

    assert!(
        !h.coordinator.cancel(&doomed).expect("cancel finished run"),
        "cancel on a terminal run is a no-op"
    );
    let err = h
        .coordinator
        .cancel(&runstream_types::RunId::from("ghost"))
        .expect_err("unknown run");
    assert!(matches!(err, RunError::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn run_cancelled_before_start_skips_the_executor() {
    let h = harness();
    let run = h.coordinator.create_run("never");
    assert!(h.coordinator.cancel(&run).expect("cancel pending run"));
    assert!(h.coordinator.run_info(&run).expect("info").cancel_requested);

    let invoked = Arc::new(AtomicBool::new(false));
    let seen = invoked.clone();
    let status = h
        .coordinator
        .start(
            &run,
            executor(move |_ctx| {
                seen.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            }),
        )
        .expect("start")
        .await
        .expect("join");

    assert_eq!(status, RunStatus::Cancelled);
    assert!(!invoked.load(Ordering::SeqCst));
    let page = h
        .coordinator
        .query_history(&run, LogCursor::Earliest, LogCursor::Latest, None)
        .await
        .expect("history");
    assert_eq!(lifecycle_actions(&page.events), vec![lifecycle::CANCELLED]);
}

// ── teardown ─────────────────────────────────────────────────────────

#[tokio::test]
async fn late_emission_after_teardown_is_dropped() {
    let h = harness();
    let run = h.coordinator.create_run("leaky");
    let leaked: Arc<Mutex<Option<Emitter>>> = Arc::new(Mutex::new(None));
    let slot = leaked.clone();

    h.coordinator
        .start(
            &run,
            executor(move |ctx| {
                ctx.emit(output(1))?;
                *slot.lock().expect("slot lock") = Some(ctx.emitter());
                Ok(Value::Null)
            }),
        )
        .expect("start")
        .await
        .expect("join");

    let registry = h.coordinator.registry();
    assert!(registry.lookup_sink(&run).is_none());
    assert!(registry.lookup_cancellation_predicate(&run).is_none());
    assert!(!registry.deregister_sink(&run), "second deregistration is a no-op");
    assert!(!registry.deregister_cancellation_predicate(&run));

    let emitter = leaked
        .lock()
        .expect("slot lock")
        .take()
        .expect("executor stored its emitter");
    assert!(emitter.emit(output(2)).is_ok(), "late emission is silently dropped");
    assert!(!emitter.is_cancelled());

    let page = h
        .coordinator
        .query_history(&run, LogCursor::Earliest, LogCursor::Latest, None)
        .await
        .expect("history");
    assert_eq!(common::output_numbers(&page.events), vec![1]);
    assert_eq!(
        page.events.last().map(|e| e.action.as_str()),
        Some(lifecycle::COMPLETED)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_outage_does_not_fail_the_run() {
    let h = harness();
    let run = h.coordinator.create_run("outage");
    let (go_tx, go_rx) = std::sync::mpsc::channel::<()>();
    let go_rx = Mutex::new(go_rx);

    let mut sub = h
        .coordinator
        .subscribe_live(&run, None)
        .await
        .expect("subscribe");
    let handle = h
        .coordinator
        .start(
            &run,
            executor(move |ctx| {
                go_rx
                    .lock()
                    .expect("gate lock")
                    .recv()
                    .map_err(|e| ExecutionError::Failed(e.to_string()))?;
                for n in 1..=3 {
                    ctx.emit(output(n))?;
                }
                Ok(json!("finished without a store"))
            }),
        )
        .expect("start");

    let started = take(&mut sub, 1).await;
    assert_eq!(started[0].action, lifecycle::STARTED);

    h.pool
        .get()
        .expect("should get connection")
        .execute_batch("DROP TABLE run_events;")
        .expect("should drop table");
    go_tx.send(()).expect("release executor");

    assert_eq!(handle.await.expect("join"), RunStatus::Completed);
    let info = h.coordinator.run_info(&run).expect("info");
    assert_eq!(info.status, RunStatus::Completed);
    assert_eq!(info.result, Some(json!("finished without a store")));

    let (events, ending) = drain(&mut sub).await;
    assert!(events.is_empty(), "nothing was stored, nothing was published");
    assert!(matches!(ending, Ending::Closed), "got {ending:?}");

    let err = h
        .coordinator
        .query_history(&run, LogCursor::Earliest, LogCursor::Latest, None)
        .await
        .expect_err("history read should fail");
    assert!(matches!(err, RunError::StoreUnavailable(_)), "got {err:?}");
}

// ── history and expiry ───────────────────────────────────────────────

#[tokio::test]
async fn history_pages_through_a_finished_run() {
    let h = harness();
    let run = h.coordinator.create_run("pages");
    h.coordinator
        .start(
            &run,
            executor(|ctx| {
                for n in 1..=10 {
                    ctx.emit(output(n))?;
                }
                Ok(Value::Null)
            }),
        )
        .expect("start")
        .await
        .expect("join");

    let first = h
        .coordinator
        .query_history(&run, LogCursor::Earliest, LogCursor::Latest, Some(5))
        .await
        .expect("first page");
    assert_eq!(first.events.len(), 5);
    assert!(first.has_more);
    let next = first.next_id.expect("next id");

    let second = h
        .coordinator
        .query_history(&run, LogCursor::At(next), LogCursor::Latest, Some(100))
        .await
        .expect("second page");
    assert!(!second.has_more);
    assert_eq!(second.next_id, None);
    assert_eq!(second.events.first().map(|e| e.id), Some(next));
    assert_eq!(first.events.len() + second.events.len(), 12);

    let clamped = h
        .coordinator
        .query_history(&run, LogCursor::Earliest, LogCursor::Latest, Some(0))
        .await
        .expect("zero limit is clamped");
    assert_eq!(clamped.events.len(), 1);
}

#[tokio::test]
async fn history_of_a_run_that_has_not_written_yet_is_empty() {
    let h = harness();
    let run = h.coordinator.create_run("quiet");

    let page = h
        .coordinator
        .query_history(&run, LogCursor::Earliest, LogCursor::Latest, None)
        .await
        .expect("known run without a log");
    assert!(page.events.is_empty());
    assert!(!page.has_more);
    assert_eq!(page.next_id, None);
}

#[tokio::test]
async fn history_from_an_id_past_every_event_is_empty() {
    let h = harness();
    let run = h.coordinator.create_run("bounded");
    h.coordinator
        .start(
            &run,
            executor(|ctx| {
                for n in 1..=10 {
                    ctx.emit(output(n))?;
                }
                Ok(Value::Null)
            }),
        )
        .expect("start")
        .await
        .expect("join");

    let page = h
        .coordinator
        .query_history(
            &run,
            LogCursor::At(EventId::new(u64::MAX, 0)),
            LogCursor::Latest,
            None,
        )
        .await
        .expect("history read");
    assert!(page.events.is_empty(), "got {} events", page.events.len());
}

#[tokio::test]
async fn history_expires_after_ttl() {
    let h = harness_with(
        LogSettings::default(),
        BrokerSettings::default(),
        CoordinatorSettings {
            log_ttl: Duration::ZERO,
            run_retention: Duration::from_secs(3_600),
        },
    );
    let run = h.coordinator.create_run("ephemeral");
    h.coordinator
        .start(
            &run,
            executor(|ctx| {
                ctx.emit(output(1))?;
                Ok(Value::Null)
            }),
        )
        .expect("start")
        .await
        .expect("join");

    let err = h
        .coordinator
        .query_history(&run, LogCursor::Earliest, LogCursor::Latest, None)
        .await
        .expect_err("expired history");
    assert!(matches!(err, RunError::Expired(_)), "got {err:?}");

    let err = h
        .coordinator
        .subscribe_live(&run, None)
        .await
        .expect_err("expired run cannot be replayed");
    assert!(matches!(err, RunError::Expired(_)), "got {err:?}");

    let err = h
        .coordinator
        .query_history(
            &runstream_types::RunId::from("never-existed"),
            LogCursor::Earliest,
            LogCursor::Latest,
            None,
        )
        .await
        .expect_err("unknown run");
    assert!(matches!(err, RunError::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn maintenance_sweep_purges_logs_and_evicts_records() {
    let h = harness_with(
        LogSettings::default(),
        BrokerSettings::default(),
        CoordinatorSettings {
            log_ttl: Duration::ZERO,
            run_retention: Duration::ZERO,
        },
    );
    let finished = h.coordinator.create_run("finished");
    let abandoned = h.coordinator.create_run("abandoned");
    let mut waiting = h
        .coordinator
        .subscribe_live(&abandoned, None)
        .await
        .expect("subscribe to pending run");
    h.coordinator
        .start(
            &finished,
            executor(|ctx| {
                ctx.emit(output(1))?;
                Ok(Value::Null)
            }),
        )
        .expect("start")
        .await
        .expect("join");

    let (purged, evicted) = runstream_core::maintenance::sweep_once(&h.coordinator).await;
    assert_eq!(purged, 1);
    assert_eq!(evicted, 2);

    assert!(h.coordinator.run_info(&finished).is_none());
    assert!(h.coordinator.run_info(&abandoned).is_none());
    assert!(!h.coordinator.broker().is_open(&abandoned));

    let (events, ending) = drain(&mut waiting).await;
    assert!(events.is_empty());
    assert!(matches!(ending, Ending::Closed), "got {ending:?}");

    let err = h
        .coordinator
        .start(&abandoned, executor(|_| Ok(Value::Null)))
        .expect_err("evicted run cannot start");
    assert!(matches!(err, RunError::NotFound(_)), "got {err:?}");

    let err = h
        .coordinator
        .query_history(&finished, LogCursor::Earliest, LogCursor::Latest, None)
        .await
        .expect_err("purged history");
    assert!(matches!(err, RunError::Expired(_)), "got {err:?}");
}

#[tokio::test]
async fn maintenance_sweep_keeps_recent_pending_runs() {
    let h = harness_with(
        LogSettings::default(),
        BrokerSettings::default(),
        CoordinatorSettings {
            log_ttl: Duration::from_secs(3_600),
            run_retention: Duration::from_secs(3_600),
        },
    );
    let pending = h.coordinator.create_run("pending");

    let (purged, evicted) = runstream_core::maintenance::sweep_once(&h.coordinator).await;
    assert_eq!((purged, evicted), (0, 0));

    let info = h.coordinator.run_info(&pending).expect("still tracked");
    assert_eq!(info.status, RunStatus::Pending);
    assert!(h.coordinator.broker().is_open(&pending));
}
