use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Metric name prefix for all engine metrics
const PREFIX: &str = "signature_engine";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Counter
    pub static ref SIGNATURES_COUNTED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_signatures_counted_total"),
        "Validated signatures added to cached petition counts"
    ).expect("Failed to create signatures_counted_total metric");

    pub static ref COUNTER_PETITIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_counter_petitions_total"), "Petitions visited by counter passes"),
        &["outcome"]
    ).expect("Failed to create counter_petitions_total metric");

    // Auditor and corrector
    pub static ref DRIFT_DETECTED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_drift_detected_total"),
        "Petitions whose cached count disagreed with the true count"
    ).expect("Failed to create drift_detected_total metric");

    pub static ref STUCK_RESETS_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_stuck_resets_total"),
        "Count resets found holding a petition past the timeout"
    ).expect("Failed to create stuck_resets_total metric");

    pub static ref CORRECTIONS_APPLIED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_corrections_applied_total"),
        "Completed signature count resets"
    ).expect("Failed to create corrections_applied_total metric");

    // Batch processing
    pub static ref BATCH_ROWS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_batch_rows_total"), "Rows handled by batch steps"),
        &["step", "outcome"]
    ).expect("Failed to create batch_rows_total metric");

    // Job queue
    pub static ref QUEUE_JOBS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_queue_jobs_total"), "Queued job executions by outcome"),
        &["job_type", "outcome"]
    ).expect("Failed to create queue_jobs_total metric");

    pub static ref QUEUE_JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_queue_job_duration_seconds"),
            "Queued job execution duration in seconds"
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        &["job_type"]
    ).expect("Failed to create queue_job_duration_seconds metric");

    pub static ref QUEUE_LANE_DEPTH: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_queue_lane_depth"), "Pending jobs per queue lane"),
        &["lane"]
    ).expect("Failed to create queue_lane_depth metric");

    // Scheduled background jobs
    pub static ref BACKGROUND_JOB_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_background_job_executions_total"), "Background job executions"),
        &["job_id", "status"]
    ).expect("Failed to create background_job_executions_total metric");

    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_background_job_duration_seconds"),
            "Background job duration in seconds"
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0]),
        &["job_id"]
    ).expect("Failed to create background_job_duration_seconds metric");

    pub static ref BACKGROUND_JOB_RUNNING: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_background_job_running"), "1 while a background job runs"),
        &["job_id"]
    ).expect("Failed to create background_job_running metric");
}

/// Register all metrics with the registry. Safe to call more than once.
pub fn init_metrics() {
    let _ = REGISTRY.register(Box::new(SIGNATURES_COUNTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(COUNTER_PETITIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(DRIFT_DETECTED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(STUCK_RESETS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CORRECTIONS_APPLIED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BATCH_ROWS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(QUEUE_JOBS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(QUEUE_JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(QUEUE_LANE_DEPTH.clone()));
    let _ = REGISTRY.register(Box::new(BACKGROUND_JOB_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(BACKGROUND_JOB_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(BACKGROUND_JOB_RUNNING.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_signatures_counted(delta: i64) {
    SIGNATURES_COUNTED_TOTAL.inc_by(delta.max(0) as f64);
}

/// `outcome` is one of advanced, nothing_to_count, conflict.
pub fn record_counter_petition(outcome: &str) {
    COUNTER_PETITIONS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_drift_detected() {
    DRIFT_DETECTED_TOTAL.inc();
}

pub fn record_stuck_reset() {
    STUCK_RESETS_TOTAL.inc();
}

pub fn record_correction_applied() {
    CORRECTIONS_APPLIED_TOTAL.inc();
}

pub fn record_batch_rows(step: &str, outcome: &str, rows: usize) {
    BATCH_ROWS_TOTAL
        .with_label_values(&[step, outcome])
        .inc_by(rows as f64);
}

pub fn record_queue_job(job_type: &str, outcome: &str, duration: Duration) {
    QUEUE_JOBS_TOTAL
        .with_label_values(&[job_type, outcome])
        .inc();
    QUEUE_JOB_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(duration.as_secs_f64());
}

pub fn set_queue_lane_depth(lane: &str, depth: usize) {
    QUEUE_LANE_DEPTH.with_label_values(&[lane]).set(depth as f64);
}

pub fn record_background_job_execution(job_id: &str, status: &str, duration: Duration) {
    BACKGROUND_JOB_EXECUTIONS_TOTAL
        .with_label_values(&[job_id, status])
        .inc();
    BACKGROUND_JOB_DURATION_SECONDS
        .with_label_values(&[job_id])
        .observe(duration.as_secs_f64());
}

pub fn set_background_job_running(job_id: &str, running: bool) {
    BACKGROUND_JOB_RUNNING
        .with_label_values(&[job_id])
        .set(if running { 1.0 } else { 0.0 });
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_default();
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Serves `/metrics` on localhost until the shutdown token is cancelled.
pub async fn run_metrics_server(port: u16, shutdown_token: CancellationToken) -> Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;

    info!("Metrics available at port {}", port);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await?;
    Ok(())
}
