use anyhow::Result;
use async_trait::async_trait;

use crate::metrics::ACTIVITIES_TERMINATED_TOTAL;
use crate::models::{PlayerExercise, TerminationReason};

/// Outbound player events. Delivery belongs to the implementation; callers
/// treat every method as best-effort.
#[async_trait]
pub trait PlayerNotifier: Send + Sync {
    async fn notify_exercise_changes(
        &self,
        user_id: &str,
        session_id: &str,
        exercise: &PlayerExercise,
    ) -> Result<()>;

    /// Every visible exercise of an activity reached success.
    async fn on_challenge_succeeded(&self, user_id: Option<&str>, activity_session_id: &str) -> Result<()>;

    async fn on_terminate(
        &self,
        user_id: Option<&str>,
        activity_session_id: &str,
        reason: TerminationReason,
    ) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct LoggingNotifier;

#[async_trait]
impl PlayerNotifier for LoggingNotifier {
    async fn notify_exercise_changes(
        &self,
        user_id: &str,
        session_id: &str,
        exercise: &PlayerExercise,
    ) -> Result<()> {
        tracing::debug!(
            "Exercise {} changed for user {} (grade={}, attempts={})",
            session_id,
            user_id,
            exercise.grade,
            exercise.attempts
        );
        Ok(())
    }

    async fn on_challenge_succeeded(&self, user_id: Option<&str>, activity_session_id: &str) -> Result<()> {
        tracing::info!(
            "Activity {} completed by {}",
            activity_session_id,
            user_id.unwrap_or("anonymous")
        );
        Ok(())
    }

    async fn on_terminate(
        &self,
        user_id: Option<&str>,
        activity_session_id: &str,
        reason: TerminationReason,
    ) -> Result<()> {
        ACTIVITIES_TERMINATED_TOTAL
            .with_label_values(&[reason.as_str()])
            .inc();
        tracing::info!(
            "Activity {} terminated for {} ({})",
            activity_session_id,
            user_id.unwrap_or("anonymous"),
            reason.as_str()
        );
        Ok(())
    }
}
