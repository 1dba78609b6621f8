//! Error types for the event log.

use runstream_types::RunId;

/// Errors that can occur during event log operations.
///
/// The three variants are the three conditions callers must be able to
/// tell apart: the log never existed, the log existed but aged out, or the
/// backing store could not answer.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// No log has ever been written for this run (or it was deleted).
    #[error("no event log for run {0}")]
    NotFound(RunId),

    /// The run's log outlived its TTL and may have been evicted.
    #[error("event log for run {0} has expired")]
    Expired(RunId),

    /// The backing store failed or returned data it could not decode.
    #[error("event store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<rusqlite::Error> for LogError {
    fn from(e: rusqlite::Error) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<r2d2::Error> for LogError {
    fn from(e: r2d2::Error) -> Self {
        Self::StoreUnavailable(format!("pool connection error: {e}"))
    }
}

impl From<serde_json::Error> for LogError {
    fn from(e: serde_json::Error) -> Self {
        Self::StoreUnavailable(format!("event encoding error: {e}"))
    }
}
