use axum::{
    body::Bytes,
    extract::{Path, State},
    Extension, Json,
};
use std::sync::Arc;
use validator::Validate;

use crate::error::{PlayerError, PlayerResult};
use crate::extractors::{AppJson, MaybeClaims};
use crate::middlewares::auth::JwtClaims;
use crate::models::{
    EvaluateRequest, EvaluateResponse, Navigation, PlayActivityRequest, PlayExercisesRequest,
    PlayExercisesResponse, PlayerActivity, PreviewRequest, PreviewResponse, TerminateRequest,
};
use crate::services::evaluation_service::EvaluationService;
use crate::services::navigation_service::NavigationService;
use crate::services::preview_service::PreviewService;
use crate::services::AppState;

/// POST /player/play/activity
pub async fn play_activity(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    AppJson(payload): AppJson<PlayActivityRequest>,
) -> PlayerResult<Json<PlayerActivity>> {
    payload.validate()?;

    let service = NavigationService::new(&state);
    let activity = service.play_activity(&claims.sub, payload).await?;
    Ok(Json(activity))
}

/// POST /player/play/exercises
pub async fn play_exercises(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    AppJson(payload): AppJson<PlayExercisesRequest>,
) -> PlayerResult<Json<PlayExercisesResponse>> {
    payload.validate()?;

    let service = NavigationService::new(&state);
    let response = service.play_exercises(&claims.sub, payload).await?;
    Ok(Json(response))
}

/// POST /player/evaluate
pub async fn evaluate(
    State(state): State<Arc<AppState>>,
    claims: MaybeClaims,
    AppJson(payload): AppJson<EvaluateRequest>,
) -> PlayerResult<Json<EvaluateResponse>> {
    payload.validate()?;

    let service = EvaluationService::new(&state);
    let response = service.evaluate(claims.user_id(), payload).await?;
    Ok(Json(response))
}

/// POST /player/terminate/{session_id}
pub async fn terminate(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<JwtClaims>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> PlayerResult<Json<Navigation>> {
    // The body is optional; an empty one means an explicit termination.
    let request: TerminateRequest = if body.is_empty() {
        TerminateRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| PlayerError::bad_request(format!("Invalid terminate request: {}", e)))?
    };
    let reason = request.reason;

    let service = NavigationService::new(&state);
    let navigation = service.terminate(&claims.sub, &session_id, reason).await?;
    Ok(Json(navigation))
}

/// POST /player/preview
pub async fn preview(
    State(state): State<Arc<AppState>>,
    claims: MaybeClaims,
    AppJson(payload): AppJson<PreviewRequest>,
) -> PlayerResult<Json<PreviewResponse>> {
    payload.validate()?;

    let service = PreviewService::new(&state);
    let response = service.preview(claims.user_id(), payload).await?;
    Ok(Json(response))
}
