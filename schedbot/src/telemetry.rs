// Telemetry module for structured logging, metrics, and tracing

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::task::TaskId;

const SERVICE_NAME: &str = "schedbot";

/// Initialize structured logging with JSON formatting.
///
/// `RUST_LOG` takes precedence over `log_level`. When `tracing_endpoint` is
/// set, spans are also exported over OTLP.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
#[tracing::instrument(skip_all)]
fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized");

    Ok(tracer)
}

/// Flush remaining spans; call on graceful shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Install the Prometheus exporter and describe the scheduler metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!("task_success_total", "Total number of successful task executions");
    describe_counter!("task_failed_total", "Total number of failed task executions");
    describe_counter!(
        "task_skipped_total",
        "Total number of firings skipped because the worker pool was saturated"
    );
    describe_histogram!("task_duration_seconds", "Duration of task executions in seconds");
    describe_gauge!("scheduler_pending_tasks", "Tasks waiting for their next fire time");
    describe_gauge!("scheduler_in_flight_tasks", "Task executions currently running");

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_task_success(task_id: &TaskId, task_name: &str) {
    counter!("task_success_total", "task_id" => task_id.to_string(), "task_name" => task_name.to_string()).increment(1);
}

#[inline]
pub fn record_task_failure(task_id: &TaskId, task_name: &str) {
    counter!("task_failed_total", "task_id" => task_id.to_string(), "task_name" => task_name.to_string()).increment(1);
}

#[inline]
pub fn record_task_skipped(task_id: &TaskId, task_name: &str) {
    counter!("task_skipped_total", "task_id" => task_id.to_string(), "task_name" => task_name.to_string()).increment(1);
}

#[inline]
pub fn record_task_duration(task_id: &TaskId, task_name: &str, duration_seconds: f64) {
    histogram!(
        "task_duration_seconds",
        "task_id" => task_id.to_string(),
        "task_name" => task_name.to_string()
    )
    .record(duration_seconds);
}

#[inline]
pub fn update_pending_tasks(size: usize) {
    gauge!("scheduler_pending_tasks").set(size as f64);
}

#[inline]
pub fn update_in_flight_tasks(size: usize) {
    gauge!("scheduler_in_flight_tasks").set(size as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_twice_fails() {
        // The first call may lose to another test that installed a subscriber
        let _ = init_logging("info", None);
        let second = init_logging("info", None);
        assert!(second.is_err());
    }

    #[test]
    fn test_metrics_recording_without_recorder() {
        let task_id = TaskId::new();
        record_task_success(&task_id, "test-task");
        record_task_failure(&task_id, "test-task");
        record_task_skipped(&task_id, "test-task");
        record_task_duration(&task_id, "test-task", 1.5);
        update_pending_tasks(3);
        update_in_flight_tasks(1);
    }
}
