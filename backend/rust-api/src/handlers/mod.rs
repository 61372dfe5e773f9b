use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose, Engine as _};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::metrics;
use crate::services::AppState;

pub mod player;

pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store = check_dependency("session store", state.sessions.ping()).await;
    let locks = check_dependency("activity lock", state.locks.ping()).await;

    let all_healthy = [&store, &locks]
        .iter()
        .all(|result| result.get("status").and_then(Value::as_str) == Some("healthy"));

    let mut dependencies = Map::new();
    dependencies.insert("sessionStore".to_string(), Value::Object(store));
    dependencies.insert("activityLock".to_string(), Value::Object(locks));

    let (status_code, status) = if all_healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status_code,
        Json(json!({
            "status": status,
            "service": "player-engine-api",
            "version": env!("CARGO_PKG_VERSION"),
            "storage": state.config.storage_backend.as_str(),
            "dependencies": dependencies
        })),
    )
}

async fn check_dependency<F>(name: &str, ping: F) -> Map<String, Value>
where
    F: Future<Output = anyhow::Result<()>>,
{
    let mut result = Map::new();
    match tokio::time::timeout(Duration::from_secs(1), ping).await {
        Ok(Ok(())) => {
            result.insert("status".to_string(), json!("healthy"));
        }
        Ok(Err(e)) => {
            tracing::warn!("Health check of {} failed: {:#}", name, e);
            result.insert("status".to_string(), json!("unhealthy"));
            result.insert("error".to_string(), json!(format!("{:#}", e)));
        }
        Err(_) => {
            result.insert("status".to_string(), json!("unhealthy"));
            result.insert("error".to_string(), json!(format!("{} timeout after 1s", name)));
        }
    }
    result
}

pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::render_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to render metrics: {}", e),
        ),
    }
}

/// HTTP Basic auth in front of `/metrics`; credentials come from
/// `METRICS_AUTH` as `username:password`.
pub async fn metrics_auth_middleware(
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let credentials = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|encoded| general_purpose::STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let expected = std::env::var("METRICS_AUTH").unwrap_or_else(|_| "admin:changeme".to_string());
    if credentials != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}
