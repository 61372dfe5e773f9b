use std::sync::Arc;

use serde_json::Value;

use crate::error::{PlayerError, PlayerResult};
use crate::metrics::{record_navigation_event, PEER_CONTESTS_TOTAL};
use crate::models::{
    ExerciseState, Navigation, NavigationExercise, NavigationMode, NewPeerContest, PeerContest,
    PeerRole, Session, SessionChanges, Variables, SUCCESS_GRADE, UNGRADED,
};

use super::peer_service::PeerService;
use super::session_builder::SessionBuilder;
use super::session_store::{update_with_retry, SessionStore};

/// Where a peer activity goes after an answer.
pub struct PeerOutcome {
    pub activity: Session,
    pub navigation: Navigation,
    pub next: Session,
}

/// Activity identifier shared by every learner of the same authored activity.
pub fn activity_ref(activity: &Session) -> String {
    activity
        .source
        .resource
        .clone()
        .unwrap_or_else(|| activity.id.clone())
}

/// Winner index and peer match designated by a correct comparison answer.
/// Index 0 picks player 1, index 1 player 2.
pub fn comparison_verdict(variables: &Variables) -> PlayerResult<(usize, &str)> {
    let winner = variables
        .get("winner")
        .and_then(Value::as_u64)
        .filter(|winner| *winner <= 1)
        .ok_or_else(|| PlayerError::forbidden("Comparison answered without a valid winner (0 or 1)"))?;
    let match_id = variables
        .get("peerMatchId")
        .and_then(Value::as_str)
        .ok_or_else(|| PlayerError::forbidden("Comparison answered without a peer match"))?;
    Ok((winner as usize, match_id))
}

/// Answered copy as shown to a comparing learner.
fn copy_of(session: &Session) -> Value {
    session
        .variables
        .get("answers")
        .cloned()
        .unwrap_or_else(|| Value::Object(session.variables.clone()))
}

pub struct PeerResolver {
    sessions: Arc<dyn SessionStore>,
    peers: Arc<dyn PeerService>,
    builder: SessionBuilder,
}

impl PeerResolver {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        peers: Arc<dyn PeerService>,
        builder: SessionBuilder,
    ) -> Self {
        Self {
            sessions,
            peers,
            builder,
        }
    }

    /// Handles a graded answer on one exercise of a peer activity.
    /// Callers hold the activity lock.
    pub async fn on_answer(&self, activity: &Session, answered: &Session) -> PlayerResult<PeerOutcome> {
        let user_id = activity
            .user_id
            .as_deref()
            .ok_or_else(|| PlayerError::forbidden("Peer activities require an identified learner"))?;

        let navigation = Navigation::from_variables(&activity.variables);
        let entry = navigation
            .find_by_session(&answered.id)
            .cloned()
            .ok_or_else(|| {
                PlayerError::not_found(format!(
                    "Session {} is not part of activity {}",
                    answered.id, activity.id
                ))
            })?;

        let state = ExerciseState::from_grade(answered.grade);
        if answered.grade < SUCCESS_GRADE {
            tracing::debug!("Peer answer on {} not correct, presenting it again", answered.id);
            let updated = self.persist(activity, &answered.id, state, &answered.id).await?;
            return Ok(PeerOutcome {
                navigation: Navigation::from_variables(&updated.variables),
                activity: updated,
                next: answered.clone(),
            });
        }

        match entry.role {
            Some(PeerRole::Exercise) => {
                let contest = self
                    .peers
                    .create_match(NewPeerContest::self_paired(
                        &activity_ref(activity),
                        user_id,
                        &answered.id,
                    ))
                    .await?;
                PEER_CONTESTS_TOTAL.with_label_values(&["created"]).inc();
                tracing::info!(
                    "Peer contest {} registered for {} on activity {}",
                    contest.id,
                    user_id,
                    contest.activity_id
                );
            }
            Some(PeerRole::Comparison) => {
                let (winner, match_id) = comparison_verdict(&answered.variables)?;
                let contest = self
                    .peers
                    .resolve_game(match_id, winner)
                    .await?
                    .ok_or_else(|| {
                        PlayerError::forbidden(format!("Peer match {} is not pending", match_id))
                    })?;
                PEER_CONTESTS_TOTAL.with_label_values(&["resolved"]).inc();
                tracing::info!(
                    "Peer contest {} resolved by {} (winner={:?})",
                    contest.id,
                    user_id,
                    contest.winner_id
                );
            }
            _ => {}
        }

        let after_answer = navigation.with_state(&answered.id, state);
        let next = self.decide(activity, &after_answer, user_id).await?;
        let updated = self.persist(activity, &answered.id, state, &next.id).await?;

        Ok(PeerOutcome {
            navigation: Navigation::from_variables(&updated.variables),
            activity: updated,
            next,
        })
    }

    /// Next exercise for a learner: a queued comparison, else remaining
    /// training, else the waiting exercise.
    pub async fn decide(
        &self,
        activity: &Session,
        navigation: &Navigation,
        user_id: &str,
    ) -> PlayerResult<Session> {
        if let Some(contest) = self
            .peers
            .get_next_copy(user_id, &activity_ref(activity))
            .await?
        {
            let comparison = Self::entry_with_role(navigation, PeerRole::Comparison).ok_or_else(|| {
                PlayerError::Configuration(format!(
                    "Peer activity {} declares no comparison exercise",
                    activity.id
                ))
            })?;
            record_navigation_event(NavigationMode::Peer.as_str(), "comparison");
            return self.present_comparison(activity, comparison, &contest).await;
        }

        let training = navigation.exercises.iter().find(|entry| {
            entry.role == Some(PeerRole::Training) && entry.state != ExerciseState::Succeeded
        });
        if let Some(entry) = training {
            record_navigation_event(NavigationMode::Peer.as_str(), "training");
            return self.load_built(activity, entry).await;
        }

        let waiting = Self::entry_with_role(navigation, PeerRole::Waiting).ok_or_else(|| {
            PlayerError::Configuration(format!(
                "Peer activity {} declares no waiting exercise",
                activity.id
            ))
        })?;
        record_navigation_event(NavigationMode::Peer.as_str(), "waiting");
        self.load_built(activity, waiting).await
    }

    fn entry_with_role(navigation: &Navigation, role: PeerRole) -> Option<&NavigationExercise> {
        navigation
            .exercises
            .iter()
            .find(|entry| entry.role == Some(role))
    }

    async fn load(&self, activity: &Session, session_id: &str) -> PlayerResult<Session> {
        self.sessions
            .find_exercise_session_by_activity_id(&activity.id, session_id)
            .await?
            .ok_or_else(|| PlayerError::not_found(format!("Session {} not found", session_id)))
    }

    async fn load_built(&self, activity: &Session, entry: &NavigationExercise) -> PlayerResult<Session> {
        let session = self.load(activity, &entry.session_id).await?;
        if session.is_built {
            Ok(session)
        } else {
            self.builder.build_exercise(&session).await
        }
    }

    /// Mutates the comparison session in place so its environment stays reusable.
    async fn present_comparison(
        &self,
        activity: &Session,
        entry: &NavigationExercise,
        contest: &PeerContest,
    ) -> PlayerResult<Session> {
        let comparison = self.load(activity, &entry.session_id).await?;
        let first = self
            .sessions
            .find_by_id(&contest.player1_session_id, false)
            .await?
            .ok_or_else(|| {
                PlayerError::not_found(format!("Session {} not found", contest.player1_session_id))
            })?;
        let second = self
            .sessions
            .find_by_id(&contest.player2_session_id, false)
            .await?
            .ok_or_else(|| {
                PlayerError::not_found(format!("Session {} not found", contest.player2_session_id))
            })?;

        let mut variables = comparison.variables.clone();
        variables.remove("winner");
        variables.insert("copy1".into(), copy_of(&first));
        variables.insert("copy2".into(), copy_of(&second));
        variables.insert("peerMatchId".into(), Value::String(contest.id.clone()));

        let changes = SessionChanges {
            variables: Some(variables),
            grade: Some(UNGRADED),
            ..Default::default()
        };
        let staged = self
            .sessions
            .update(&comparison.id, changes)
            .await?
            .ok_or_else(|| PlayerError::not_found(format!("Session {} not found", comparison.id)))?;

        self.builder.build_exercise(&staged).await
    }

    async fn persist(
        &self,
        activity: &Session,
        answered_id: &str,
        state: ExerciseState,
        next_id: &str,
    ) -> PlayerResult<Session> {
        update_with_retry(self.sessions.as_ref(), &activity.id, |current| {
            let navigation = Navigation::from_variables(&current.variables)
                .with_state(answered_id, state)
                .mark_started(next_id)
                .with_current(next_id);
            let mut variables = current.variables.clone();
            variables.insert("navigation".into(), navigation.to_value());
            Ok(SessionChanges {
                variables: Some(variables),
                ..Default::default()
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Source, SourceKind, Variables};
    use serde_json::json;

    fn session_with(variables: Value) -> Session {
        let source = Source {
            kind: SourceKind::Exercise,
            resource: None,
            version: None,
            script: String::new(),
            variables: Variables::new(),
            files: Vec::new(),
        };
        Session::new(
            "s1".into(),
            Some("u1".into()),
            Some("a1".into()),
            source,
            variables.as_object().cloned().unwrap_or_default(),
        )
    }

    #[test]
    fn copy_prefers_recorded_answers() {
        let answered = session_with(json!({ "answers": { "text": "42" }, "statement": "?" }));
        assert_eq!(copy_of(&answered), json!({ "text": "42" }));

        let bare = session_with(json!({ "statement": "?" }));
        assert_eq!(copy_of(&bare), json!({ "statement": "?" }));
    }

    #[test]
    fn comparison_verdict_accepts_player_indices_only() {
        let picked = session_with(json!({ "winner": 0, "peerMatchId": "m1" }));
        assert_eq!(comparison_verdict(&picked.variables).unwrap(), (0, "m1"));

        let second = session_with(json!({ "winner": 1, "peerMatchId": "m1" }));
        assert_eq!(comparison_verdict(&second.variables).unwrap(), (1, "m1"));

        for winner in [json!(7), json!(-1), json!(0.5), json!("1")] {
            let answered = session_with(json!({ "winner": winner, "peerMatchId": "m1" }));
            assert!(matches!(
                comparison_verdict(&answered.variables),
                Err(PlayerError::Forbidden(_))
            ));
        }

        let unmatched = session_with(json!({ "winner": 1 }));
        assert!(matches!(
            comparison_verdict(&unmatched.variables),
            Err(PlayerError::Forbidden(_))
        ));
    }

    #[test]
    fn activity_ref_falls_back_to_session_id() {
        let mut activity = session_with(json!({}));
        activity.id = "act-session".into();
        assert_eq!(activity_ref(&activity), "act-session");

        activity.source.resource = Some("act-resource".into());
        assert_eq!(activity_ref(&activity), "act-resource");
    }
}
