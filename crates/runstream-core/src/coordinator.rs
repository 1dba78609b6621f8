//! Run lifecycle: creation, start, finalization, cancellation, and the
//! read-side entry points for history and live streams.

use chrono::{DateTime, Utc};
use runstream_log::{EventLog, LogCursor, LogError};
use runstream_types::{
    lifecycle, Category, Event, EventDraft, EventId, EventSource, ProducerType, RunId, RunStatus,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::broker::StreamBroker;
use crate::error::{ExecutionError, RunError};
use crate::executor::{Executor, RunContext};
use crate::registry::{CallbackRegistry, Emitter};
use crate::sink::RunSink;
use crate::subscription::Subscription;

/// Default page size for history queries.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;
/// Largest page a history query may ask for.
pub const MAX_HISTORY_LIMIT: usize = 1_000;

const COORDINATOR_ID: &str = "coordinator";

/// Lifetimes the coordinator applies once runs finish.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    /// How long a finished run's history stays readable.
    pub log_ttl: Duration,
    /// How long a finished run's record is kept for status queries.
    pub run_retention: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            log_ttl: Duration::from_secs(86_400),
            run_retention: Duration::from_secs(86_400),
        }
    }
}

/// Snapshot of a run's state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub run_id: RunId,
    pub task: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub cancel_requested: bool,
}

/// One page of a history query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub events: Vec<Event>,
    pub has_more: bool,
    /// Start bound for the next page when `has_more` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_id: Option<EventId>,
}

struct RunState {
    status: RunStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    result: Option<Value>,
    error: Option<String>,
}

struct RunRecord {
    run_id: RunId,
    task: String,
    cancel_flag: Arc<AtomicBool>,
    state: Mutex<RunState>,
}

impl RunRecord {
    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn info(&self) -> RunInfo {
        let state = self.state();
        RunInfo {
            run_id: self.run_id.clone(),
            task: self.task.clone(),
            status: state.status,
            created_at: state.created_at,
            started_at: state.started_at,
            finished_at: state.finished_at,
            result: state.result.clone(),
            error: state.error.clone(),
            cancel_requested: self.cancel_flag.load(Ordering::Acquire),
        }
    }
}

enum Outcome {
    Completed(Value),
    Failed(String),
    Cancelled,
}

impl Outcome {
    fn status(&self) -> RunStatus {
        match self {
            Self::Completed(_) => RunStatus::Completed,
            Self::Failed(_) => RunStatus::Failed,
            Self::Cancelled => RunStatus::Cancelled,
        }
    }

    fn terminal_event(&self) -> EventDraft {
        let draft = EventDraft::new(Category::Lifecycle, self.status().as_str())
            .with_source(coordinator_source())
            .with_field("status", self.status().as_str());
        match self {
            Self::Completed(result) => draft.with_field("result", result.clone()),
            Self::Failed(error) => draft.with_field("error", error.clone()),
            Self::Cancelled => draft,
        }
    }
}

fn coordinator_source() -> EventSource {
    EventSource::new(COORDINATOR_ID, ProducerType::Coordinator, COORDINATOR_ID)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("executor panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("executor panicked: {message}")
    } else {
        "executor panicked".to_string()
    }
}

/// Owns every run's lifecycle and wires its sink, cancellation predicate
/// and live channel.
pub struct RunCoordinator {
    registry: Arc<CallbackRegistry>,
    log: Arc<dyn EventLog>,
    broker: Arc<StreamBroker>,
    runs: RwLock<HashMap<RunId, Arc<RunRecord>>>,
    settings: CoordinatorSettings,
}

impl RunCoordinator {
    pub fn new(
        registry: Arc<CallbackRegistry>,
        log: Arc<dyn EventLog>,
        broker: Arc<StreamBroker>,
        settings: CoordinatorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            log,
            broker,
            runs: RwLock::new(HashMap::new()),
            settings,
        })
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    pub fn event_log(&self) -> Arc<dyn EventLog> {
        Arc::clone(&self.log)
    }

    pub fn broker(&self) -> &Arc<StreamBroker> {
        &self.broker
    }

    fn record(&self, run_id: &RunId) -> Option<Arc<RunRecord>> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    /// Creates a pending run and opens its live channel so subscribers can
    /// attach before it starts.
    pub fn create_run(&self, task: impl Into<String>) -> RunId {
        let run_id = RunId::generate();
        let record = Arc::new(RunRecord {
            run_id: run_id.clone(),
            task: task.into(),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(RunState {
                status: RunStatus::Pending,
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                result: None,
                error: None,
            }),
        });

        self.broker.open(run_id.clone());
        self.runs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.clone(), record);
        tracing::info!(run_id = %run_id, "run created");
        run_id
    }

    /// Starts a pending run on a blocking thread.
    ///
    /// The sink and cancellation predicate are registered before this
    /// returns. The handle resolves to the run's terminal status once it
    /// has been finalized. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown run, `AlreadyStarted` if it is not pending.
    pub fn start(
        self: &Arc<Self>,
        run_id: &RunId,
        executor: Arc<dyn Executor>,
    ) -> Result<JoinHandle<RunStatus>, RunError> {
        let record = self
            .record(run_id)
            .ok_or_else(|| RunError::NotFound(run_id.clone()))?;

        {
            let mut state = record.state();
            if !state.status.can_transition_to(RunStatus::Running) {
                return Err(RunError::AlreadyStarted(run_id.clone()));
            }
            state.status = RunStatus::Running;
            state.started_at = Some(Utc::now());
        }

        let sink = Arc::new(RunSink::new(
            run_id.clone(),
            Arc::clone(&self.log),
            Arc::clone(&self.broker),
        ));
        self.registry.register_sink(run_id.clone(), sink.clone());
        let flag = Arc::clone(&record.cancel_flag);
        self.registry.register_cancellation_predicate(
            run_id.clone(),
            Arc::new(move || flag.load(Ordering::Acquire)),
        );

        let ctx = RunContext::new(
            run_id.clone(),
            record.task.clone(),
            Emitter::new(run_id.clone(), Arc::clone(&self.registry)),
        );
        tracing::info!(run_id = %run_id, "run started");

        let coordinator = Arc::clone(self);
        Ok(tokio::task::spawn_blocking(move || {
            coordinator.drive(&record, &sink, executor, ctx)
        }))
    }

    fn drive(
        &self,
        record: &RunRecord,
        sink: &RunSink,
        executor: Arc<dyn Executor>,
        ctx: RunContext,
    ) -> RunStatus {
        let outcome = if record.cancel_flag.load(Ordering::Acquire) {
            tracing::info!(run_id = %record.run_id, "run cancelled before execution");
            Outcome::Cancelled
        } else {
            // A cancel racing this event is picked up by the executor.
            let _ = ctx.emit(
                EventDraft::new(Category::Lifecycle, lifecycle::STARTED)
                    .with_source(coordinator_source())
                    .with_field("task", record.task.clone()),
            );
            match panic::catch_unwind(AssertUnwindSafe(|| executor.execute(ctx))) {
                Ok(Ok(result)) => Outcome::Completed(result),
                Ok(Err(ExecutionError::Cancelled)) => Outcome::Cancelled,
                Ok(Err(ExecutionError::Failed(error))) => Outcome::Failed(error),
                Err(panic) => Outcome::Failed(panic_message(panic.as_ref())),
            }
        };
        self.finalize(record, sink, outcome)
    }

    /// Tears a run down: deregisters its callbacks, records the terminal
    /// status, writes the terminal event, closes live delivery and starts
    /// the history TTL.
    fn finalize(&self, record: &RunRecord, sink: &RunSink, outcome: Outcome) -> RunStatus {
        let run_id = &record.run_id;
        self.registry.deregister_sink(run_id);
        self.registry.deregister_cancellation_predicate(run_id);

        let status = outcome.status();
        {
            let mut state = record.state();
            state.status = status;
            state.finished_at = Some(Utc::now());
            match &outcome {
                Outcome::Completed(result) => state.result = Some(result.clone()),
                Outcome::Failed(error) => state.error = Some(error.clone()),
                Outcome::Cancelled => {}
            }
        }

        if sink.seal_with(outcome.terminal_event()).is_none() {
            tracing::warn!(run_id = %run_id, status = %status, "terminal event was not recorded");
        }
        self.broker.close(run_id);

        if let Err(e) = self.log.set_expiry(run_id, self.settings.log_ttl) {
            tracing::warn!(run_id = %run_id, error = %e, "failed to set history expiry");
        }

        match &outcome {
            Outcome::Failed(error) => {
                tracing::warn!(run_id = %run_id, error = %error, "run failed");
            }
            _ => tracing::info!(run_id = %run_id, status = %status, "run finished"),
        }
        status
    }

    /// Requests cancellation of a run.
    ///
    /// Returns `true` if this call set the flag, `false` if the run had
    /// already finished or was already cancelled. The executor observes the
    /// request at its next emission.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown run.
    pub fn cancel(&self, run_id: &RunId) -> Result<bool, RunError> {
        let record = self
            .record(run_id)
            .ok_or_else(|| RunError::NotFound(run_id.clone()))?;

        let state = record.state();
        if state.status.is_terminal() {
            tracing::debug!(run_id = %run_id, status = %state.status, "cancel ignored for finished run");
            return Ok(false);
        }
        let first = !record.cancel_flag.swap(true, Ordering::AcqRel);
        if first {
            tracing::info!(run_id = %run_id, status = %state.status, "run cancellation requested");
        }
        Ok(first)
    }

    /// Attaches a live subscriber; see [`StreamBroker::attach`].
    pub async fn subscribe_live(
        &self,
        run_id: &RunId,
        last_event_id: Option<EventId>,
    ) -> Result<Subscription, RunError> {
        self.broker.attach(run_id.clone(), last_event_id).await
    }

    /// Reads one page of a run's stored history.
    ///
    /// `limit` defaults to [`DEFAULT_HISTORY_LIMIT`] and is clamped to
    /// `1..=MAX_HISTORY_LIMIT`.
    ///
    /// A known run that has not written anything yet reads as an empty
    /// page.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Expired` or `StoreUnavailable` as reported by the log.
    pub async fn query_history(
        &self,
        run_id: &RunId,
        start: LogCursor,
        end: LogCursor,
        limit: Option<usize>,
    ) -> Result<HistoryPage, RunError> {
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        let log = Arc::clone(&self.log);
        let run = run_id.clone();

        let read = tokio::task::spawn_blocking(move || {
            log.range(&run, start, end, Some(limit + 1))
        })
        .await
        .map_err(|e| RunError::StoreUnavailable(format!("history read task failed: {e}")))?;

        let mut events = match read {
            Ok(events) => events,
            Err(LogError::NotFound(_)) if self.record(run_id).is_some() => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let has_more = events.len() > limit;
        let next_id = if has_more {
            events.get(limit).map(|event| event.id)
        } else {
            None
        };
        events.truncate(limit);

        Ok(HistoryPage {
            events,
            has_more,
            next_id,
        })
    }

    pub fn run_info(&self, run_id: &RunId) -> Option<RunInfo> {
        self.record(run_id).map(|record| record.info())
    }

    /// Ids of runs that are pending or running.
    pub fn active_run_ids(&self) -> Vec<RunId> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|record| !record.state().status.is_terminal())
            .map(|record| record.run_id.clone())
            .collect()
    }

    /// Drops records of runs that finished longer ago than the configured
    /// retention, and of runs created that long ago that never started.
    /// Abandoned runs are marked cancelled and their live channel is
    /// closed. Returns how many records were removed.
    pub fn evict_stale_runs(&self) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(self.settings.run_retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };

        let mut abandoned = Vec::new();
        let removed = {
            let mut runs = self.runs.write().unwrap_or_else(PoisonError::into_inner);
            let before = runs.len();
            runs.retain(|run_id, record| {
                let mut state = record.state();
                if let Some(finished_at) = state.finished_at {
                    return finished_at > cutoff;
                }
                if state.status != RunStatus::Pending || state.created_at > cutoff {
                    return true;
                }
                // Holding the state lock keeps a concurrent start out.
                state.status = RunStatus::Cancelled;
                state.finished_at = Some(Utc::now());
                abandoned.push(run_id.clone());
                false
            });
            before - runs.len()
        };

        for run_id in &abandoned {
            self.broker.close(run_id);
            tracing::info!(run_id = %run_id, "evicted run that was never started");
        }
        removed
    }
}
