//! The seam between the coordinator and the code that does a run's work.

use runstream_types::{CancellationRequested, EventDraft, RunId};
use serde_json::Value;

use crate::error::ExecutionError;
use crate::registry::Emitter;

/// Runs the work for one run.
///
/// Called on a blocking thread. Implementations may fan out to their own
/// threads; each of them reports progress through a clone of
/// [`RunContext::emitter`] and should propagate `CancellationRequested`
/// (which converts into [`ExecutionError::Cancelled`]) as soon as an
/// emission returns it.
pub trait Executor: Send + Sync {
    fn execute(&self, ctx: RunContext) -> Result<Value, ExecutionError>;
}

impl<F> Executor for F
where
    F: Fn(RunContext) -> Result<Value, ExecutionError> + Send + Sync,
{
    fn execute(&self, ctx: RunContext) -> Result<Value, ExecutionError> {
        self(ctx)
    }
}

/// What an executor is given: the run it works for, the task it was
/// created with, and a handle for reporting events.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: RunId,
    task: String,
    emitter: Emitter,
}

impl RunContext {
    pub(crate) fn new(run_id: RunId, task: String, emitter: Emitter) -> Self {
        Self {
            run_id,
            task,
            emitter,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    /// Handle to pass to worker threads.
    pub fn emitter(&self) -> Emitter {
        self.emitter.clone()
    }

    pub fn emit(&self, draft: EventDraft) -> Result<(), CancellationRequested> {
        self.emitter.emit(draft)
    }

    pub fn is_cancelled(&self) -> bool {
        self.emitter.is_cancelled()
    }
}
