//! SQLite-backed [`EventLog`].
//!
//! Appends run inside an `IMMEDIATE` transaction that assigns the next event
//! id from the per-run high-water mark in `run_logs`, inserts the row, and
//! trims the oldest rows once the log overshoots its cap. Reads first check
//! the `run_logs` row so that a missing log and an expired log are reported
//! as different errors.

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use runstream_db::DbPool;
use runstream_types::{Event, EventDraft, EventId, RunId};
use std::time::Duration;

use crate::cursor::LogCursor;
use crate::error::LogError;
use crate::EventLog;

const EVENT_COLUMNS: &str =
    "id_ms, id_seq, sequence, timestamp_ms, source_json, category, action, payload_json";

/// Length and trimming settings for [`SqliteEventLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    /// Number of events kept per run after a trim.
    pub max_len: u64,
    /// How far a log may overshoot `max_len` before it is trimmed.
    pub trim_slack: u64,
    /// How long an evicted log keeps answering `Expired` before its
    /// tombstone is dropped and the run becomes unknown.
    pub tombstone_retention: Duration,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            max_len: 10_000,
            trim_slack: 100,
            tombstone_retention: Duration::from_secs(7 * 86_400),
        }
    }
}

/// Event log stored in the `run_logs` / `run_events` tables.
#[derive(Clone)]
pub struct SqliteEventLog {
    pool: DbPool,
    settings: LogSettings,
}

impl SqliteEventLog {
    /// Wraps a pool whose database has already been migrated.
    pub fn new(pool: DbPool, settings: LogSettings) -> Self {
        let settings = LogSettings {
            max_len: settings.max_len.max(1),
            ..settings
        };
        Self { pool, settings }
    }

    pub fn settings(&self) -> LogSettings {
        self.settings
    }

    /// Returns the number of events currently retained for a run.
    ///
    /// # Errors
    ///
    /// Returns `LogError::NotFound` if the run has no log, and
    /// `LogError::StoreUnavailable` on SQL failure.
    pub fn len(&self, run_id: &RunId) -> Result<u64, LogError> {
        let conn = self.pool.get()?;
        let count: Option<i64> = conn
            .query_row(
                "SELECT event_count FROM run_logs WHERE run_id = ?1",
                [run_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        count
            .map(|c| c.max(0) as u64)
            .ok_or_else(|| LogError::NotFound(run_id.clone()))
    }

    fn read(
        &self,
        run_id: &RunId,
        lower: (EventId, bool),
        upper: EventId,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, LogError> {
        let conn = self.pool.get()?;
        ensure_readable(&conn, run_id, now_millis())?;

        let (lower_id, inclusive) = lower;
        let lower_seq_op = if inclusive { ">=" } else { ">" };
        let sql = format!(
            "SELECT {EVENT_COLUMNS}
             FROM run_events
             WHERE run_id = ?1
               AND (id_ms > ?2 OR (id_ms = ?2 AND id_seq {lower_seq_op} ?3))
               AND (id_ms < ?4 OR (id_ms = ?4 AND id_seq <= ?5))
             ORDER BY id_ms ASC, id_seq ASC
             LIMIT ?6"
        );

        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(-1);

        let (lower_millis, lower_seq) = id_columns(lower_id);
        let (upper_millis, upper_seq) = id_columns(upper);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![
                run_id.as_str(),
                lower_millis,
                lower_seq,
                upper_millis,
                upper_seq,
                limit,
            ],
            |row| event_from_row(run_id, row),
        )?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }
}

impl EventLog for SqliteEventLog {
    fn append(
        &self,
        run_id: &RunId,
        sequence: u64,
        timestamp_millis: i64,
        draft: &EventDraft,
    ) -> Result<Event, LogError> {
        let source_json = draft
            .source
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let payload_json = serde_json::to_string(&draft.payload)?;

        let now = now_millis();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO run_logs (run_id, created_at_ms) VALUES (?1, ?2)
             ON CONFLICT(run_id) DO NOTHING",
            params![run_id.as_str(), now],
        )?;

        let (last_ms, last_seq, evicted): (i64, i64, bool) = tx.query_row(
            "SELECT last_id_ms, last_id_seq, evicted FROM run_logs WHERE run_id = ?1",
            [run_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        if evicted {
            return Err(LogError::Expired(run_id.clone()));
        }

        let id = EventId::new(last_ms as u64, last_seq as u64).successor(now.max(0) as u64);
        let (id_ms, id_seq) = id_columns(id);

        tx.execute(
            "INSERT INTO run_events
                (run_id, id_ms, id_seq, sequence, timestamp_ms, source_json, category, action, payload_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run_id.as_str(),
                id_ms,
                id_seq,
                sequence as i64,
                timestamp_millis,
                source_json,
                draft.category.as_str(),
                draft.action,
                payload_json,
            ],
        )?;

        let event_count: i64 = tx.query_row(
            "UPDATE run_logs
             SET last_id_ms = ?2, last_id_seq = ?3, event_count = event_count + 1
             WHERE run_id = ?1
             RETURNING event_count",
            params![run_id.as_str(), id_ms, id_seq],
            |row| row.get(0),
        )?;

        let cap = self.settings.max_len as i64;
        if event_count > cap + self.settings.trim_slack as i64 {
            let removed = trim_oldest(&tx, run_id, event_count - cap)?;
            tracing::debug!(run_id = %run_id, removed, "trimmed event log to length cap");
        }

        tx.commit()?;

        Ok(Event {
            id,
            run_id: run_id.clone(),
            sequence,
            timestamp_millis,
            source: draft.source.clone(),
            category: draft.category,
            action: draft.action.clone(),
            payload: draft.payload.clone(),
        })
    }

    fn range(
        &self,
        run_id: &RunId,
        start: LogCursor,
        end: LogCursor,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, LogError> {
        self.read(run_id, (start.resolve(), true), end.resolve(), limit)
    }

    fn range_after(
        &self,
        run_id: &RunId,
        after: EventId,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, LogError> {
        self.read(run_id, (after, false), EventId::MAX, limit)
    }

    fn set_expiry(&self, run_id: &RunId, ttl: Duration) -> Result<(), LogError> {
        let now = now_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now.saturating_add(ttl_ms);

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO run_logs (run_id, created_at_ms, expires_at_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(run_id) DO UPDATE SET expires_at_ms = excluded.expires_at_ms
             WHERE evicted = 0",
            params![run_id.as_str(), now, expires_at],
        )?;
        Ok(())
    }

    fn delete(&self, run_id: &RunId) -> Result<(), LogError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM run_events WHERE run_id = ?1", [run_id.as_str()])?;
        tx.execute("DELETE FROM run_logs WHERE run_id = ?1", [run_id.as_str()])?;
        tx.commit()?;
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, LogError> {
        let now = now_millis();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let expired: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT run_id FROM run_logs
                 WHERE evicted = 0 AND expires_at_ms IS NOT NULL AND expires_at_ms <= ?1",
            )?;
            let rows = stmt.query_map([now], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        for run_id in &expired {
            tx.execute("DELETE FROM run_events WHERE run_id = ?1", [run_id])?;
            tx.execute(
                "UPDATE run_logs SET evicted = 1, event_count = 0 WHERE run_id = ?1",
                [run_id],
            )?;
        }

        let tombstone_ms =
            i64::try_from(self.settings.tombstone_retention.as_millis()).unwrap_or(i64::MAX);
        let dropped = tx.execute(
            "DELETE FROM run_logs WHERE evicted = 1 AND expires_at_ms <= ?1",
            [now.saturating_sub(tombstone_ms)],
        )?;

        tx.commit()?;
        if dropped > 0 {
            tracing::debug!(count = dropped, "dropped aged event log tombstones");
        }
        Ok(expired.len())
    }
}

/// Column values for an id. Parts past `i64::MAX` saturate, so such a
/// bound still sorts after every stored event.
fn id_columns(id: EventId) -> (i64, i64) {
    let clamp = |part: u64| i64::try_from(part).unwrap_or(i64::MAX);
    (clamp(id.millis), clamp(id.seq))
}

/// Fails with `NotFound` or `Expired` unless the run's log may be read.
fn ensure_readable(conn: &Connection, run_id: &RunId, now: i64) -> Result<(), LogError> {
    let row: Option<(Option<i64>, bool)> = conn
        .query_row(
            "SELECT expires_at_ms, evicted FROM run_logs WHERE run_id = ?1",
            [run_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        None => Err(LogError::NotFound(run_id.clone())),
        Some((_, true)) => Err(LogError::Expired(run_id.clone())),
        Some((Some(expires_at), false)) if expires_at <= now => {
            Err(LogError::Expired(run_id.clone()))
        }
        Some(_) => Ok(()),
    }
}

/// Deletes the `excess` oldest events of a run. Returns the rows removed.
fn trim_oldest(conn: &Connection, run_id: &RunId, excess: i64) -> Result<usize, LogError> {
    let cutoff: Option<(i64, i64)> = conn
        .query_row(
            "SELECT id_ms, id_seq FROM run_events
             WHERE run_id = ?1
             ORDER BY id_ms ASC, id_seq ASC
             LIMIT 1 OFFSET ?2",
            params![run_id.as_str(), excess - 1],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((cutoff_ms, cutoff_seq)) = cutoff else {
        return Ok(0);
    };

    let removed = conn.execute(
        "DELETE FROM run_events
         WHERE run_id = ?1 AND (id_ms < ?2 OR (id_ms = ?2 AND id_seq <= ?3))",
        params![run_id.as_str(), cutoff_ms, cutoff_seq],
    )?;
    conn.execute(
        "UPDATE run_logs SET event_count = event_count - ?2 WHERE run_id = ?1",
        params![run_id.as_str(), removed as i64],
    )?;
    Ok(removed)
}

fn event_from_row(run_id: &RunId, row: &Row<'_>) -> rusqlite::Result<Event> {
    let id_ms: i64 = row.get(0)?;
    let id_seq: i64 = row.get(1)?;
    let sequence: i64 = row.get(2)?;
    let source_json: Option<String> = row.get(4)?;
    let category: String = row.get(5)?;
    let payload_json: String = row.get(7)?;

    let source = source_json
        .map(|json| serde_json::from_str(&json))
        .transpose()
        .map_err(|e| conversion_failure(4, e))?;
    let category = category.parse().map_err(|e| conversion_failure(5, e))?;
    let payload = serde_json::from_str(&payload_json).map_err(|e| conversion_failure(7, e))?;

    Ok(Event {
        id: EventId::new(id_ms as u64, id_seq as u64),
        run_id: run_id.clone(),
        sequence: sequence as u64,
        timestamp_millis: row.get(3)?,
        source,
        category,
        action: row.get(6)?,
        payload,
    })
}

fn conversion_failure<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
