use std::sync::Arc;

use crate::error::{PlayerError, PlayerResult};
use crate::models::{PlayerExercise, PreviewRequest, PreviewResponse};

use super::navigation_service::NavigationService;
use super::resource_compiler::{ResourceCompiler, ResourceRef};
use super::session_builder::SessionBuilder;
use super::AppState;

/// One-off plays of a resource outside any enrolment.
pub struct PreviewService {
    compiler: Arc<dyn ResourceCompiler>,
    builder: SessionBuilder,
    navigation: NavigationService,
}

impl PreviewService {
    pub fn new(state: &AppState) -> Self {
        Self {
            compiler: state.compiler.clone(),
            builder: SessionBuilder::new(
                state.sessions.clone(),
                state.compiler.clone(),
                state.sandboxes.clone(),
            ),
            navigation: NavigationService::new(state),
        }
    }

    pub async fn preview(&self, user_id: Option<&str>, req: PreviewRequest) -> PlayerResult<PreviewResponse> {
        let source = match (req.source, req.resource) {
            (Some(source), _) => {
                if user_id.is_none() {
                    return Err(PlayerError::forbidden(
                        "Inline sources can only be previewed by identified callers",
                    ));
                }
                source
            }
            (None, Some(resource)) => {
                let reference = ResourceRef::new(resource, req.version);
                if user_id.is_none() && !self.compiler.is_previewable(&reference).await? {
                    return Err(PlayerError::forbidden(format!(
                        "Resource {} is not publicly previewable",
                        reference.id
                    )));
                }
                self.compiler
                    .compile(&reference, &req.overrides)
                    .await?
                    .ok_or_else(|| PlayerError::not_found(format!("Resource {} not found", reference.id)))?
            }
            (None, None) => return Err(PlayerError::bad_request("Either resource or source is required")),
        };

        let session = self.builder.create_session(user_id, source, None, false).await?;
        tracing::info!(
            "Preview session {} created (activity={}, user={:?})",
            session.id,
            session.is_activity(),
            user_id
        );

        if session.is_activity() {
            let activity = self.navigation.open_activity(session).await?;
            return Ok(PreviewResponse::Activity(activity));
        }

        let built = self.builder.build_exercise(&session).await?;
        Ok(PreviewResponse::Exercise(PlayerExercise::from_session(&built, None)))
    }
}
