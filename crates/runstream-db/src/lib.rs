//! Database layer for runstream.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! and embedded SQL migrations for the event log tables.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: the event log is written by many runs at once
//!   and read by many subscribers. WAL allows concurrent readers alongside
//!   the single writer, and keys are disjoint per run so no cross-run
//!   transaction discipline is needed.
//! - **`r2d2` connection pool**: producer threads are uncontrolled, so each
//!   append borrows a pooled connection for the duration of one statement
//!   batch instead of owning one.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!` and cannot drift from the code that depends on them.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
