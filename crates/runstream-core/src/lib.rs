//! Run-scoped event routing.
//!
//! Producers running on arbitrary threads report progress through an
//! [`Emitter`] that resolves the run's sink from the [`CallbackRegistry`].
//! Every event is appended to the durable per-run log and then fanned out
//! to live subscribers by the [`StreamBroker`]. The [`RunCoordinator`]
//! owns each run's lifecycle, including cooperative cancellation.

pub mod broker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod maintenance;
pub mod registry;
mod sink;
pub mod subscription;
pub mod telemetry;

pub use broker::{BrokerSettings, StreamBroker};
pub use config::{load_config, Config, ConfigError};
pub use coordinator::{
    CoordinatorSettings, HistoryPage, RunCoordinator, RunInfo, DEFAULT_HISTORY_LIMIT,
    MAX_HISTORY_LIMIT,
};
pub use error::{ExecutionError, RunError};
pub use executor::{Executor, RunContext};
pub use registry::{CallbackRegistry, CancellationPredicate, Emitter, EventSink};
pub use subscription::{StreamItem, Subscription};

use runstream_db::DbPool;
use runstream_log::SqliteEventLog;
use std::sync::Arc;

/// Wires a coordinator over a migrated SQLite pool using `config`.
pub fn build_coordinator(pool: DbPool, config: &Config) -> Arc<RunCoordinator> {
    let log: Arc<SqliteEventLog> = Arc::new(SqliteEventLog::new(pool, config.log.settings()));
    let broker = Arc::new(StreamBroker::new(log.clone(), config.stream.broker_settings()));
    RunCoordinator::new(
        Arc::new(CallbackRegistry::new()),
        log,
        broker,
        config.coordinator_settings(),
    )
}
