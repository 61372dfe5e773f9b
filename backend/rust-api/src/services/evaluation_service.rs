use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::error::{PlayerError, PlayerResult};
use crate::metrics::PLAYER_EVALUATIONS_TOTAL;
use crate::models::{
    ActivitySettings, EvaluateRequest, EvaluateResponse, Navigation, NavigationExercise,
    NavigationMode, PeerRole, PlayerAction, PlayerExercise, Session, SessionChanges, SUCCESS_GRADE,
};
use crate::sandbox::SandboxDispatcher;

use super::navigation_service::{EvaluationFollowUp, NavigationService};
use super::notifier::PlayerNotifier;
use super::peer_resolver::comparison_verdict;
use super::session_builder::SessionBuilder;
use super::session_store::{update_with_retry, SessionStore};
use super::AppState;

/// Owners act on their sessions; anonymous callers only on ownerless ones.
fn authorize(session: &Session, user_id: Option<&str>) -> PlayerResult<()> {
    match (&session.user_id, user_id) {
        (None, _) => Ok(()),
        (Some(_), Some(user_id)) if session.is_owned_by(user_id) => Ok(()),
        (Some(_), _) => Err(PlayerError::forbidden(format!(
            "Session {} belongs to another learner",
            session.id
        ))),
    }
}

/// Activity policies checked before any sandbox call.
fn check_activity_policy(
    activity: &Session,
    session: &Session,
    action: PlayerAction,
    user_id: Option<&str>,
) -> PlayerResult<()> {
    let settings = ActivitySettings::from_variables(&activity.variables);

    if settings.mode() == NavigationMode::Peer && user_id.is_none() {
        return Err(PlayerError::forbidden("Peer activities cannot be played anonymously"));
    }

    let enabled = match action {
        PlayerAction::CheckAnswer => true,
        PlayerAction::RerollExercise => settings.actions.reroll,
        PlayerAction::NextHint => settings.actions.hints,
        PlayerAction::ShowSolution => settings.actions.solution,
    };
    if !enabled {
        return Err(PlayerError::forbidden(format!(
            "{} is disabled for this activity",
            action.as_str()
        )));
    }

    if action == PlayerAction::CheckAnswer {
        check_attempts(settings.max_attempts(), session.attempts)?;
    }

    Ok(())
}

fn check_attempts(limit: Option<u32>, attempts: u32) -> PlayerResult<()> {
    match limit {
        Some(limit) if attempts >= limit => Err(PlayerError::forbidden(format!(
            "No attempts left ({} of {})",
            attempts, limit
        ))),
        _ => Ok(()),
    }
}

/// Navigation entry of the exercise a peer activity presents. Peer
/// activities refuse actions on any other exercise.
fn presented_peer_entry(activity: &Session, session: &Session) -> PlayerResult<Option<NavigationExercise>> {
    if ActivitySettings::from_variables(&activity.variables).mode() != NavigationMode::Peer {
        return Ok(None);
    }
    let navigation = Navigation::from_variables(&activity.variables);
    let presented = navigation
        .current
        .as_ref()
        .is_some_and(|current| current.session_id == session.id);
    if !presented {
        return Err(PlayerError::forbidden(format!(
            "Session {} is not the exercise presented by activity {}",
            session.id, activity.id
        )));
    }
    Ok(navigation.find_by_session(&session.id).cloned())
}

pub struct EvaluationService {
    sessions: Arc<dyn SessionStore>,
    sandboxes: Arc<SandboxDispatcher>,
    notifier: Arc<dyn PlayerNotifier>,
    builder: SessionBuilder,
    navigation: NavigationService,
}

impl EvaluationService {
    pub fn new(state: &AppState) -> Self {
        Self {
            sessions: state.sessions.clone(),
            sandboxes: state.sandboxes.clone(),
            notifier: state.notifier.clone(),
            builder: SessionBuilder::new(
                state.sessions.clone(),
                state.compiler.clone(),
                state.sandboxes.clone(),
            ),
            navigation: NavigationService::new(state),
        }
    }

    async fn load_parent(&self, session: &mut Session) -> PlayerResult<Option<Session>> {
        let Some(parent_id) = session.parent_id.clone() else {
            return Ok(None);
        };
        if let Some(parent) = session.parent.take() {
            return Ok(Some(*parent));
        }
        let parent = self
            .sessions
            .find_by_id(&parent_id, false)
            .await?
            .ok_or_else(|| PlayerError::not_found(format!("Activity session {} not found", parent_id)))?;
        Ok(Some(parent))
    }

    /// Runs one learner action against the session's script and records the
    /// outcome. The script decides what the action does.
    pub async fn evaluate(&self, user_id: Option<&str>, req: EvaluateRequest) -> PlayerResult<EvaluateResponse> {
        let mut session = self
            .sessions
            .find_by_id(&req.session_id, true)
            .await?
            .ok_or_else(|| PlayerError::not_found(format!("Session {} not found", req.session_id)))?;
        if session.is_activity() {
            return Err(PlayerError::bad_request("Activities are not evaluated directly"));
        }
        authorize(&session, user_id)?;

        let activity = match self.load_parent(&mut session).await? {
            Some(activity) => {
                let activity = self.navigation.guard_open(activity).await?;
                check_activity_policy(&activity, &session, req.action, user_id)?;
                Some(activity)
            }
            None => None,
        };
        let peer_entry = match &activity {
            Some(activity) => presented_peer_entry(activity, &session)?,
            None => None,
        };
        let attempt_limit = activity
            .as_ref()
            .and_then(|activity| ActivitySettings::from_variables(&activity.variables).max_attempts());

        let session = if session.is_built {
            session
        } else {
            self.builder.build_exercise(&session).await?
        };

        let mut input = session.variables.clone();
        input.insert("answers".into(), Value::Object(req.answers.clone()));
        input.insert("action".into(), Value::String(req.action.as_str().to_string()));
        let output = self.sandboxes.run(&session, input).await?;

        let check = req.action == PlayerAction::CheckAnswer;
        let output_grade = output.variables.get("grade").and_then(Value::as_f64);
        let correct_comparison = check
            && peer_entry.as_ref().and_then(|entry| entry.role) == Some(PeerRole::Comparison)
            && output_grade.unwrap_or(session.grade) >= SUCCESS_GRADE;
        if correct_comparison {
            comparison_verdict(&output.variables)?;
        }

        let now = Utc::now();
        let updated = update_with_retry(self.sessions.as_ref(), &session.id, |current| {
            let mut changes = SessionChanges {
                envid: output.envid.clone(),
                started_at: current.started_at.is_none().then_some(now),
                variables: Some(output.variables.clone()),
                ..Default::default()
            };
            if check {
                check_attempts(attempt_limit, current.attempts)?;
                changes.attempts = Some(current.attempts + 1);
                changes.grade = Some(output_grade.unwrap_or(current.grade));
                changes.last_graded_at = Some(now);
            }
            Ok(changes)
        })
        .await?;

        PLAYER_EVALUATIONS_TOTAL
            .with_label_values(&[req.action.as_str()])
            .inc();
        tracing::debug!(
            "Evaluated {} on session {} (grade={}, attempts={})",
            req.action.as_str(),
            updated.id,
            updated.grade,
            updated.attempts
        );

        let follow_up = match &activity {
            Some(activity) => {
                self.navigation
                    .on_exercise_evaluated(activity, &updated, req.action)
                    .await?
            }
            None => EvaluationFollowUp::default(),
        };

        let entry_of = |session_id: &str| {
            follow_up
                .full_navigation
                .as_ref()
                .and_then(|navigation| navigation.find_by_session(session_id))
        };
        let exercise = PlayerExercise::from_session(&updated, entry_of(&updated.id));

        if let Some(owner) = updated.user_id.as_deref() {
            if let Err(err) = self
                .notifier
                .notify_exercise_changes(owner, &updated.id, &exercise)
                .await
            {
                tracing::warn!("Exercise change for {} not delivered: {:#}", updated.id, err);
            }
        }

        let next_exercise = follow_up
            .next_exercise
            .as_ref()
            .map(|next| PlayerExercise::from_session(next, entry_of(&next.id)));

        Ok(EvaluateResponse {
            exercise,
            navigation: follow_up.navigation,
            auto_next: follow_up.auto_next,
            next_exercise,
        })
    }
}
