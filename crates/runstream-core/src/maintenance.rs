//! Background task that evicts expired history and stale run records.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::coordinator::RunCoordinator;

/// Runs one maintenance sweep: purges expired event logs, then drops run
/// records past their retention. Returns `(logs_purged, runs_evicted)`.
///
/// A failed purge is logged and counted as zero; record eviction still runs.
pub async fn sweep_once(coordinator: &RunCoordinator) -> (usize, usize) {
    let log = coordinator.event_log();
    let result = tokio::task::spawn_blocking(move || log.purge_expired()).await;

    let purged = match result {
        Ok(Ok(count)) => {
            if count > 0 {
                tracing::info!(count, "purged expired run histories");
            } else {
                tracing::debug!("no expired run histories to purge");
            }
            count
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "failed to purge expired run histories");
            0
        }
        Err(e) => {
            tracing::error!(error = %e, "history purge panicked or was cancelled");
            0
        }
    };

    let evicted = coordinator.evict_stale_runs();
    if evicted > 0 {
        tracing::info!(count = evicted, "evicted stale run records");
    }

    (purged, evicted)
}

/// Starts a background task that sweeps every `interval`.
///
/// This task runs indefinitely; the first sweep happens after one interval.
pub async fn start_maintenance_task(coordinator: Arc<RunCoordinator>, interval: Duration) {
    tracing::info!(
        interval_seconds = interval.as_secs(),
        "starting run maintenance task"
    );

    loop {
        sleep(interval).await;
        sweep_once(&coordinator).await;
    }
}
