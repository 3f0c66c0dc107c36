// Scheduler binary entry point

mod tasks;

use anyhow::Context;
use schedbot::config::{SchedulerSettings, Settings};
use schedbot::scheduler::{Scheduler, SchedulerConfig, TaskScheduler};
use schedbot::telemetry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    settings
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let runtime = build_runtime(&settings.scheduler)?;
    runtime.block_on(run(settings))
}

/// Multi-threaded runtime whose worker threads carry the configured name prefix
fn build_runtime(settings: &SchedulerSettings) -> anyhow::Result<tokio::runtime::Runtime> {
    let prefix = settings.thread_name_prefix.clone();
    let next_thread = AtomicUsize::new(1);

    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.pool_size)
        .thread_name_fn(move || {
            let id = next_thread.fetch_add(1, Ordering::SeqCst);
            format!("{}{}", prefix, id)
        })
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;

    info!(
        pool_size = settings.scheduler.pool_size,
        saturation_policy = ?settings.scheduler.saturation_policy,
        timezone = %settings.scheduler.timezone,
        "Starting schedbot scheduler"
    );

    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    let timezone = settings.scheduler.timezone()?;
    let scheduler = Arc::new(TaskScheduler::new(SchedulerConfig::from(&settings.scheduler)));

    for task in tasks::demo_tasks(timezone)? {
        let handle = scheduler.register(task)?;
        info!(task_id = %handle.id(), task_name = handle.name(), "Demo task scheduled");
    }

    let dispatch = scheduler.start();

    // Handle SIGINT for graceful shutdown
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
    }
    info!("Received Ctrl+C signal, initiating graceful shutdown");

    let report = scheduler.shutdown_gracefully().await;
    if !report.abandoned.is_empty() {
        warn!(abandoned = report.abandoned.len(), "Some executions did not finish in time");
    }

    dispatch.await??;
    telemetry::shutdown_tracer();

    info!("Scheduler stopped");
    Ok(())
}
