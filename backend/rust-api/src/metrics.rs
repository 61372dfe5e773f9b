use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Database Metrics (MongoDB)
    pub static ref DB_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "db_operations_total",
        "Total number of database operations",
        &["operation", "collection", "status"]
    )
    .unwrap();

    pub static ref DB_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "db_operation_duration_seconds",
        "Database operation duration in seconds",
        &["operation", "collection"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap();

    // Sandbox Metrics
    pub static ref SANDBOX_EXECUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sandbox_executions_total",
        "Total number of sandbox executions",
        &["backend", "outcome"]
    )
    .unwrap();

    pub static ref SANDBOX_EXECUTION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "sandbox_execution_duration_seconds",
        "Sandbox round-trip duration in seconds",
        &["backend"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();

    // Player Metrics
    pub static ref PLAYER_SESSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "player_sessions_total",
        "Total number of player sessions created",
        &["kind"]
    )
    .unwrap();

    pub static ref PLAYER_EVALUATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "player_evaluations_total",
        "Total number of evaluated player actions",
        &["action"]
    )
    .unwrap();

    pub static ref NAVIGATION_EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "navigation_events_total",
        "Total number of navigation transitions",
        &["mode", "event"]
    )
    .unwrap();

    pub static ref PEER_CONTESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "peer_contests_total",
        "Total number of peer contests created or resolved",
        &["status"]
    )
    .unwrap();

    pub static ref ACTIVITIES_TERMINATED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "activities_terminated_total",
        "Total number of terminated activities",
        &["reason"]
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Helper: track database operation with metrics
pub async fn track_db_operation<F, T>(
    operation: &str,
    collection: &str,
    future: F,
) -> Result<T, anyhow::Error>
where
    F: std::future::Future<Output = Result<T, anyhow::Error>>,
{
    let start = std::time::Instant::now();
    let result = future.await;
    let duration = start.elapsed().as_secs_f64();

    let status = if result.is_ok() { "success" } else { "error" };

    DB_OPERATIONS_TOTAL
        .with_label_values(&[operation, collection, status])
        .inc();

    DB_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation, collection])
        .observe(duration);

    result
}

pub fn record_navigation_event(mode: &str, event: &str) {
    NAVIGATION_EVENTS_TOTAL.with_label_values(&[mode, event]).inc();
}
