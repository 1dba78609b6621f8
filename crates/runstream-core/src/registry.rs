//! Run-id-keyed callback registry.
//!
//! Producer code runs on threads the coordinator does not control, so it
//! cannot be handed a sink at construction time. Instead it carries the run
//! id and resolves the sink through this registry on every emission.
//!
//! Locks are held only for the map access itself. Sinks and predicates are
//! cloned out of the map and invoked after the guard is released, so one
//! run's I/O never stalls another run's lookups.

use runstream_types::{CancellationRequested, EventDraft, RunId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Destination for a run's events.
pub trait EventSink: Send + Sync {
    /// Accepts one event. Must not fail back into the producer: storage or
    /// delivery problems are the sink's to log and absorb.
    fn emit(&self, draft: EventDraft);
}

/// Returns `true` once the run should unwind.
pub type CancellationPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Thread-safe map from run id to that run's sink and cancellation
/// predicate.
///
/// Uses `std::sync::RwLock` intentionally: every acquisition is a single
/// `HashMap` operation that never spans an `.await`, and producers call in
/// from plain OS threads.
#[derive(Default)]
pub struct CallbackRegistry {
    sinks: RwLock<HashMap<RunId, Arc<dyn EventSink>>>,
    predicates: RwLock<HashMap<RunId, CancellationPredicate>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the sink for `run_id`, replacing any previous one.
    pub fn register_sink(&self, run_id: RunId, sink: Arc<dyn EventSink>) {
        let replaced = self
            .sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.clone(), sink)
            .is_some();
        if replaced {
            tracing::debug!(run_id = %run_id, "replaced existing event sink");
        }
    }

    pub fn lookup_sink(&self, run_id: &RunId) -> Option<Arc<dyn EventSink>> {
        self.sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    /// Removes the sink for `run_id`. Returns `false` if there was none.
    pub fn deregister_sink(&self, run_id: &RunId) -> bool {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id)
            .is_some()
    }

    /// Installs the cancellation predicate for `run_id`, replacing any
    /// previous one.
    pub fn register_cancellation_predicate(
        &self,
        run_id: RunId,
        predicate: CancellationPredicate,
    ) {
        let replaced = self
            .predicates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.clone(), predicate)
            .is_some();
        if replaced {
            tracing::debug!(run_id = %run_id, "replaced existing cancellation predicate");
        }
    }

    pub fn lookup_cancellation_predicate(&self, run_id: &RunId) -> Option<CancellationPredicate> {
        self.predicates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    /// Removes the predicate for `run_id`. Returns `false` if there was none.
    pub fn deregister_cancellation_predicate(&self, run_id: &RunId) -> bool {
        self.predicates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id)
            .is_some()
    }

    /// Number of runs with a registered sink.
    pub fn sink_count(&self) -> usize {
        self.sinks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns `true` if the run's predicate says it should unwind.
    ///
    /// A run without a predicate is never considered cancelled.
    pub fn is_cancelled(&self, run_id: &RunId) -> bool {
        self.lookup_cancellation_predicate(run_id)
            .is_some_and(|predicate| predicate())
    }

    /// Routes one event to the run's sink.
    ///
    /// Every call is a cancellation checkpoint: if the run has been
    /// cancelled the event is not written and `CancellationRequested` is
    /// returned for the producer to propagate. A missing sink is not an
    /// error; the event is dropped.
    pub fn emit(&self, run_id: &RunId, draft: EventDraft) -> Result<(), CancellationRequested> {
        if self.is_cancelled(run_id) {
            return Err(CancellationRequested);
        }

        match self.lookup_sink(run_id) {
            Some(sink) => sink.emit(draft),
            None => {
                tracing::trace!(
                    run_id = %run_id,
                    action = %draft.action,
                    "no sink registered for run, dropping event"
                );
            }
        }
        Ok(())
    }
}

/// Cheap, cloneable handle that producer threads use to report progress for
/// one run.
///
/// Holds only the run id and the registry. The sink is looked up on every
/// call, so an emitter that outlives its run simply stops delivering.
#[derive(Clone)]
pub struct Emitter {
    run_id: RunId,
    registry: Arc<CallbackRegistry>,
}

impl Emitter {
    pub fn new(run_id: RunId, registry: Arc<CallbackRegistry>) -> Self {
        Self { run_id, registry }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Emits an event; see [`CallbackRegistry::emit`].
    pub fn emit(&self, draft: EventDraft) -> Result<(), CancellationRequested> {
        self.registry.emit(&self.run_id, draft)
    }

    pub fn is_cancelled(&self) -> bool {
        self.registry.is_cancelled(&self.run_id)
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter").field("run_id", &self.run_id).finish()
    }
}
