use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::sandbox::SandboxError;

pub type PlayerResult<T> = std::result::Result<T, PlayerError>;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("Sandbox execution timed out after {}s", .0.as_secs_f64())]
    SandboxTimeout(Duration),

    #[error("Sandbox execution failed: {0}")]
    SandboxUnknown(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PlayerError {
    pub fn not_found(message: impl Into<String>) -> Self {
        PlayerError::NotFound(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        PlayerError::Forbidden(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        PlayerError::BadRequest(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            PlayerError::SandboxTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            PlayerError::SandboxUnknown(_) => StatusCode::BAD_GATEWAY,
            PlayerError::NotFound(_) => StatusCode::NOT_FOUND,
            PlayerError::Forbidden(_) => StatusCode::FORBIDDEN,
            PlayerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            PlayerError::Configuration(_) | PlayerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            PlayerError::SandboxTimeout(_) => "SANDBOX_TIMEOUT",
            PlayerError::SandboxUnknown(_) => "SANDBOX_UNKNOWN",
            PlayerError::NotFound(_) => "NOT_FOUND",
            PlayerError::Forbidden(_) => "FORBIDDEN",
            PlayerError::BadRequest(_) => "BAD_REQUEST",
            PlayerError::Configuration(_) => "CONFIGURATION_ERROR",
            PlayerError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<SandboxError> for PlayerError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Timeout(duration) => PlayerError::SandboxTimeout(duration),
            SandboxError::Unknown(detail) => PlayerError::SandboxUnknown(detail),
        }
    }
}

impl From<validator::ValidationErrors> for PlayerError {
    fn from(err: validator::ValidationErrors) -> Self {
        PlayerError::BadRequest(err.to_string())
    }
}

impl IntoResponse for PlayerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            PlayerError::Internal(err) => tracing::error!("Player request failed: {:#}", err),
            PlayerError::Configuration(msg) => tracing::error!("Player misconfigured: {}", msg),
            PlayerError::SandboxUnknown(detail) => {
                tracing::error!("Sandbox failure surfaced to caller: {}", detail)
            }
            other => tracing::debug!("Player request rejected: {}", other),
        }

        let body = json!({
            "message": self.to_string(),
            "status": status.as_u16(),
            "code": self.code(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_timeout_is_never_reclassified() {
        let err: PlayerError = SandboxError::Timeout(Duration::from_secs(3)).into();
        assert!(matches!(err, PlayerError::SandboxTimeout(d) if d == Duration::from_secs(3)));
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);

        let err: PlayerError = SandboxError::Unknown("boom".into()).into();
        assert!(matches!(err, PlayerError::SandboxUnknown(ref d) if d == "boom"));
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn taxonomy_maps_to_http_statuses() {
        assert_eq!(PlayerError::not_found("x").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(PlayerError::forbidden("x").status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            PlayerError::Configuration("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
