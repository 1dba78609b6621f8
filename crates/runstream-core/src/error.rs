//! Error types surfaced by the run coordinator and stream broker.

use runstream_log::LogError;
use runstream_types::{CancellationRequested, RunId};

/// Errors returned to callers of the coordinator's run, history and
/// streaming operations.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// No run or log is known under this id.
    #[error("run not found: {0}")]
    NotFound(RunId),

    /// The run existed but its history has aged out.
    #[error("history for run {0} has expired")]
    Expired(RunId),

    /// The event store could not serve the request.
    #[error("event store unavailable: {0}")]
    StoreUnavailable(String),

    /// `start` was called on a run that is no longer pending.
    #[error("run {0} has already been started")]
    AlreadyStarted(RunId),

    /// The subscriber's buffer filled up and it was disconnected. The
    /// client may reconnect with its last seen event id.
    #[error("subscriber to run {0} fell behind and was disconnected")]
    SubscriberOverflow(RunId),
}

impl From<LogError> for RunError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::NotFound(run_id) => Self::NotFound(run_id),
            LogError::Expired(run_id) => Self::Expired(run_id),
            LogError::StoreUnavailable(message) => Self::StoreUnavailable(message),
        }
    }
}

/// How an executor's work ended, other than with a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// The executor unwound in response to a cancellation request.
    #[error("run cancelled")]
    Cancelled,

    /// The executor failed with the given message.
    #[error("run failed: {0}")]
    Failed(String),
}

impl From<CancellationRequested> for ExecutionError {
    fn from(_: CancellationRequested) -> Self {
        Self::Cancelled
    }
}
