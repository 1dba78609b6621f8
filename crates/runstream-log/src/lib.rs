//! Durable, ordered, per-run event log.
//!
//! Every event a run produces is appended here before it is fanned out to
//! live subscribers. The log serves two readers: history queries, and
//! reconnecting subscribers that need a gap-free catch-up read from their
//! last seen event id.
//!
//! # Retention
//!
//! | Rule | Behaviour |
//! |------|-----------|
//! | Length cap | Each run keeps roughly the newest `max_len` events. Trimming happens once the log overshoots by `trim_slack`, so the bound is approximate. |
//! | Expiry | A run's log is readable until its TTL elapses. After that reads answer [`LogError::Expired`], and [`EventLog::purge_expired`] may drop its rows. |
//! | Tombstones | A purged log leaves a tombstone so reads keep answering `Expired`. Tombstones older than `tombstone_retention` are dropped by a later purge, after which the run reads as [`LogError::NotFound`]. |
//! | Deletion | [`EventLog::delete`] removes the log outright; later reads answer [`LogError::NotFound`]. |
//!
//! # Usage
//!
//! ```rust,ignore
//! use runstream_log::{EventLog, LogCursor, SqliteEventLog};
//!
//! let log = SqliteEventLog::new(pool, LogSettings::default());
//! let event = log.append(&run_id, 1, now_ms, &draft)?;
//! let history = log.range(&run_id, LogCursor::Earliest, LogCursor::Latest, Some(100))?;
//! let missed = log.range_after(&run_id, event.id, None)?;
//! ```

mod cursor;
mod error;
mod store;

pub use cursor::{LogCursor, ParseLogCursorError};
pub use error::LogError;
pub use store::{LogSettings, SqliteEventLog};

use runstream_types::{Event, EventDraft, EventId, RunId};
use std::time::Duration;

/// Per-run append-only event store.
///
/// Implementations must be safe to call from any thread. Keys are disjoint
/// per run, so no operation on one run may block on another run's state
/// beyond the backing store's own write serialization.
pub trait EventLog: Send + Sync {
    /// Appends an event and returns it with its store-assigned id.
    ///
    /// Ids are strictly increasing per run. The length cap is enforced here.
    fn append(
        &self,
        run_id: &RunId,
        sequence: u64,
        timestamp_millis: i64,
        draft: &EventDraft,
    ) -> Result<Event, LogError>;

    /// Inclusive range read from `start` to `end`, oldest first.
    fn range(
        &self,
        run_id: &RunId,
        start: LogCursor,
        end: LogCursor,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, LogError>;

    /// Events strictly after `after`, oldest first.
    fn range_after(
        &self,
        run_id: &RunId,
        after: EventId,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, LogError>;

    /// Makes the run's log evictable once `ttl` has elapsed from now.
    fn set_expiry(&self, run_id: &RunId, ttl: Duration) -> Result<(), LogError>;

    /// Removes the run's log. Removing a log that does not exist is a no-op.
    fn delete(&self, run_id: &RunId) -> Result<(), LogError>;

    /// Evicts every log whose TTL has elapsed. Returns the number evicted.
    fn purge_expired(&self) -> Result<usize, LogError>;
}
