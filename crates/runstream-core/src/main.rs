//! Demo binary: runs two tagged runs side by side and prints each run's
//! stream as JSON lines.

use runstream_core::telemetry::init_tracing;
use runstream_core::{
    build_coordinator, load_config, ExecutionError, RunContext, RunCoordinator, StreamItem,
};
use runstream_types::{Category, EventDraft, EventSource, ProducerType, RunId};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const WORKERS: usize = 3;
const STEPS_PER_WORKER: u64 = 5;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("RUNSTREAM_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

/// Fans the task out to worker threads that each report a few steps.
fn tagged_workers(ctx: RunContext) -> Result<Value, ExecutionError> {
    let tag = ctx.task().to_string();
    ctx.emit(
        EventDraft::new(Category::Dispatch, "delegate")
            .with_source(EventSource::new("sup-1", ProducerType::Supervisor, "lead"))
            .with_field("tag", tag.clone())
            .with_field("workers", WORKERS),
    )?;

    let handles: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let emitter = ctx.emitter();
            let tag = tag.clone();
            std::thread::spawn(move || -> Result<(), ExecutionError> {
                let source = EventSource::new(
                    format!("w-{worker}"),
                    ProducerType::Worker,
                    format!("worker-{worker}"),
                )
                .with_group(tag.to_lowercase());
                for step in 1..=STEPS_PER_WORKER {
                    emitter.emit(
                        EventDraft::new(Category::Output, "worker_output")
                            .with_source(source.clone())
                            .with_field("tag", tag.clone())
                            .with_field("step", step),
                    )?;
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(())
            })
        })
        .collect();

    for handle in handles {
        handle
            .join()
            .map_err(|_| ExecutionError::Failed("worker thread panicked".to_string()))??;
    }

    Ok(json!({ "tag": tag, "steps": WORKERS as u64 * STEPS_PER_WORKER }))
}

/// Prints every item of a run's stream until it closes.
async fn print_stream(coordinator: Arc<RunCoordinator>, run_id: RunId) {
    let mut subscription = match coordinator.subscribe_live(&run_id, None).await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::error!(run_id = %run_id, error = %e, "failed to subscribe");
            return;
        }
    };

    while let Some(item) = subscription.next().await {
        match item {
            Ok(StreamItem::Event(event)) => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "failed to encode event"),
            },
            Ok(StreamItem::Heartbeat) => tracing::debug!(run_id = %run_id, "heartbeat"),
            Ok(StreamItem::Closed) => break,
            Err(e) => {
                tracing::warn!(run_id = %run_id, error = %e, "stream ended with error");
                break;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = load_config(selected_config_path)?;
    init_tracing(&config.logging)?;

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let pool = runstream_db::create_pool(&config.database.path, config.database.runtime_settings())?;
    {
        let conn = pool.get()?;
        let applied = runstream_db::run_migrations(&conn)?;
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    let coordinator = build_coordinator(pool, &config);
    tokio::spawn(runstream_core::maintenance::start_maintenance_task(
        Arc::clone(&coordinator),
        config.retention.sweep_interval(),
    ));

    let alpha = coordinator.create_run("ALPHA");
    let beta = coordinator.create_run("BETA");

    let printers = [
        tokio::spawn(print_stream(Arc::clone(&coordinator), alpha.clone())),
        tokio::spawn(print_stream(Arc::clone(&coordinator), beta.clone())),
    ];

    let runs = [
        coordinator.start(&alpha, Arc::new(tagged_workers))?,
        coordinator.start(&beta, Arc::new(tagged_workers))?,
    ];
    for run in runs {
        let status = run.await?;
        tracing::info!(status = %status, "run joined");
    }
    for printer in printers {
        printer.await?;
    }

    Ok(())
}
