use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::join_all;
use serde_json::Value;

use crate::error::{PlayerError, PlayerResult};
use crate::metrics::record_navigation_event;
use crate::models::{
    ActivitySettings, AutoNext, ExerciseState, Navigation, NavigationCommand, NavigationMode,
    PeerRole, PlayActivityRequest, PlayExercisesRequest, PlayerAction, PlayerActivity,
    PlayExercisesResponse, PlayerExercise, Session, SessionChanges, TerminationReason,
};

use super::activity_lock::ActivityLock;
use super::notifier::PlayerNotifier;
use super::peer_resolver::PeerResolver;
use super::peer_service::PeerService;
use super::resource_compiler::{ResourceCompiler, ResourceRef};
use super::session_builder::SessionBuilder;
use super::session_store::{update_with_retry, SessionStore};
use super::AppState;

/// Delay the client waits before advancing on its own.
pub const AUTO_NEXT_DELAY_MS: u64 = 2000;

/// Navigation consequences of one evaluation.
#[derive(Default)]
pub struct EvaluationFollowUp {
    /// Navigation as shown to the learner.
    pub navigation: Option<Navigation>,
    /// Stored navigation, peer pools included.
    pub full_navigation: Option<Navigation>,
    pub auto_next: Option<AutoNext>,
    pub next_exercise: Option<Session>,
}

/// Mean of the visible exercise grades, ungraded exercises counting 0.
pub fn aggregate_grade(navigation: &Navigation, mode: NavigationMode, children: &[Session]) -> f64 {
    let grades: HashMap<&str, f64> = children
        .iter()
        .map(|session| (session.id.as_str(), session.grade))
        .collect();

    let visible = navigation.visible(mode);
    if visible.is_empty() {
        return 0.0;
    }

    let total: f64 = visible
        .iter()
        .map(|entry| {
            grades
                .get(entry.session_id.as_str())
                .copied()
                .unwrap_or(0.0)
                .max(0.0)
        })
        .sum();
    total / visible.len() as f64
}

pub struct NavigationService {
    sessions: Arc<dyn SessionStore>,
    peers: Arc<dyn PeerService>,
    compiler: Arc<dyn ResourceCompiler>,
    locks: Arc<dyn ActivityLock>,
    notifier: Arc<dyn PlayerNotifier>,
    builder: SessionBuilder,
}

impl NavigationService {
    pub fn new(state: &AppState) -> Self {
        Self {
            sessions: state.sessions.clone(),
            peers: state.peers.clone(),
            compiler: state.compiler.clone(),
            locks: state.locks.clone(),
            notifier: state.notifier.clone(),
            builder: SessionBuilder::new(
                state.sessions.clone(),
                state.compiler.clone(),
                state.sandboxes.clone(),
            ),
        }
    }

    fn peer_resolver(&self) -> PeerResolver {
        PeerResolver::new(self.sessions.clone(), self.peers.clone(), self.builder.clone())
    }

    /// Runs `work` while holding the activity's lock.
    async fn with_lock<T, F>(&self, activity_id: &str, work: F) -> PlayerResult<T>
    where
        F: Future<Output = PlayerResult<T>>,
    {
        let lease = self.locks.acquire(activity_id).await?;
        let result = work.await;
        if let Err(err) = self.locks.release(lease).await {
            tracing::warn!("Failed to release lock on activity {}: {:#}", activity_id, err);
        }
        result
    }

    async fn load_activity(&self, activity_id: &str) -> PlayerResult<Session> {
        let activity = self
            .sessions
            .find_by_id(activity_id, false)
            .await?
            .ok_or_else(|| PlayerError::not_found(format!("Activity session {} not found", activity_id)))?;
        if !activity.is_activity() {
            return Err(PlayerError::bad_request(format!(
                "Session {} is not an activity",
                activity_id
            )));
        }
        Ok(activity)
    }

    async fn load_built(&self, activity_id: &str, session_id: &str) -> PlayerResult<Session> {
        let session = self
            .sessions
            .find_exercise_session_by_activity_id(activity_id, session_id)
            .await?
            .ok_or_else(|| PlayerError::not_found(format!("Session {} not found", session_id)))?;
        if session.is_built {
            Ok(session)
        } else {
            self.builder.build_exercise(&session).await
        }
    }

    /// Builds every unbuilt session in parallel. A failing build does not
    /// cancel its siblings; the first error is returned once all settled.
    async fn build_all(&self, activity_id: &str, session_ids: &[String]) -> PlayerResult<Vec<Session>> {
        join_all(
            session_ids
                .iter()
                .map(|session_id| self.load_built(activity_id, session_id)),
        )
        .await
        .into_iter()
        .collect()
    }

    fn ensure_owner(activity: &Session, user_id: Option<&str>) -> PlayerResult<()> {
        match (&activity.user_id, user_id) {
            (None, _) => Ok(()),
            (Some(_), Some(user_id)) if activity.is_owned_by(user_id) => Ok(()),
            _ => Err(PlayerError::forbidden(format!(
                "Activity session {} belongs to another learner",
                activity.id
            ))),
        }
    }

    /// Rejects actions outside the activity's timing window. An expired
    /// window terminates the activity before rejecting.
    pub async fn guard_open(&self, activity: Session) -> PlayerResult<Session> {
        let settings = ActivitySettings::from_variables(&activity.variables);
        let now = Utc::now();

        if let Some(open_at) = settings.open_at {
            if now < open_at {
                return Err(PlayerError::forbidden(format!(
                    "Activity opens at {}",
                    open_at.to_rfc3339()
                )));
            }
        }
        if Navigation::from_variables(&activity.variables).terminated {
            return Err(PlayerError::forbidden("Activity is terminated"));
        }

        let past_close = settings.close_at.is_some_and(|close_at| now >= close_at);
        let past_duration = match (settings.duration, activity.started_at) {
            (Some(minutes), Some(started_at)) if minutes > 0 => {
                now >= started_at + Duration::minutes(minutes)
            }
            _ => false,
        };
        if past_close || past_duration {
            tracing::info!("Activity {} reached its time limit", activity.id);
            self.snapshot_terminate(&activity, TerminationReason::Timeout)
                .await?;
            return Err(PlayerError::forbidden("Activity is closed"));
        }

        Ok(activity)
    }

    /// Freezes the aggregate grade and flips `terminated`. Events fire only
    /// for the request that performed the transition.
    async fn snapshot_terminate(&self, activity: &Session, reason: TerminationReason) -> PlayerResult<Session> {
        let mode = ActivitySettings::from_variables(&activity.variables).mode();
        let children = self.sessions.find_all_with_parent(&activity.id).await?;
        let already_terminated = AtomicBool::new(false);

        let updated = update_with_retry(self.sessions.as_ref(), &activity.id, |current| {
            let navigation = Navigation::from_variables(&current.variables);
            if navigation.terminated {
                already_terminated.store(true, Ordering::SeqCst);
                return Ok(SessionChanges::default());
            }
            already_terminated.store(false, Ordering::SeqCst);

            let grade = match mode {
                NavigationMode::Next => None,
                _ => Some(aggregate_grade(&navigation, mode, &children)),
            };
            let mut variables = current.variables.clone();
            variables.insert("navigation".into(), navigation.terminate().to_value());

            Ok(SessionChanges {
                variables: Some(variables),
                grade,
                ..Default::default()
            })
        })
        .await?;

        if !already_terminated.load(Ordering::SeqCst) {
            self.announce_termination(&updated, mode, reason).await;
        }

        Ok(updated)
    }

    /// Events of a termination transition, whoever performed it.
    async fn announce_termination(&self, activity: &Session, mode: NavigationMode, reason: TerminationReason) {
        record_navigation_event(mode.as_str(), "terminate");
        tracing::info!(
            "Activity {} terminated ({}), grade {}",
            activity.id,
            reason.as_str(),
            activity.grade
        );
        if let Err(err) = self
            .notifier
            .on_terminate(activity.user_id.as_deref(), &activity.id, reason)
            .await
        {
            tracing::warn!("Termination event for {} not delivered: {:#}", activity.id, err);
        }
    }

    pub async fn terminate(
        &self,
        user_id: &str,
        activity_id: &str,
        reason: TerminationReason,
    ) -> PlayerResult<Navigation> {
        let activity = self.load_activity(activity_id).await?;
        Self::ensure_owner(&activity, Some(user_id))?;

        let settings = ActivitySettings::from_variables(&activity.variables);
        let mode = settings.mode();
        let enabled = match reason {
            TerminationReason::LoseFocus => settings.security.terminate_on_lose_focus,
            TerminationReason::LeavePage => settings.security.terminate_on_leave_page,
            TerminationReason::Explicit | TerminationReason::Timeout => true,
        };
        if !enabled {
            tracing::debug!(
                "Ignoring {} signal on activity {}",
                reason.as_str(),
                activity.id
            );
            return Ok(Navigation::from_variables(&activity.variables).public_view(mode));
        }

        let updated = self.snapshot_terminate(&activity, reason).await?;
        Ok(Navigation::from_variables(&updated.variables).public_view(mode))
    }

    async fn resolve_activity(&self, user_id: &str, req: &PlayActivityRequest) -> PlayerResult<Session> {
        if let Some(activity_session_id) = &req.activity_session_id {
            let activity = self.load_activity(activity_session_id).await?;
            Self::ensure_owner(&activity, Some(user_id))?;
            return Ok(activity);
        }

        let activity_id = req.activity_id.as_deref().ok_or_else(|| {
            PlayerError::bad_request("Either activitySessionId or activityId is required")
        })?;

        // One activity session per learner and activity, even on concurrent first plays.
        let key = format!("{}:{}", user_id, activity_id);
        self.with_lock(&key, async {
            if let Some(existing) = self
                .sessions
                .find_user_activity_session(user_id, activity_id)
                .await?
            {
                return Ok(existing);
            }

            let resource = ResourceRef::new(activity_id, req.version.clone());
            let source = self
                .compiler
                .compile(&resource, &req.overrides)
                .await?
                .ok_or_else(|| PlayerError::not_found(format!("Activity {} not found", activity_id)))?;
            if !source.is_activity() {
                return Err(PlayerError::bad_request(format!(
                    "Resource {} is not an activity",
                    activity_id
                )));
            }

            self.builder
                .create_session(Some(user_id), source, None, false)
                .await
        })
        .await
    }

    pub async fn play_activity(&self, user_id: &str, req: PlayActivityRequest) -> PlayerResult<PlayerActivity> {
        let activity = self.resolve_activity(user_id, &req).await?;
        self.open_activity(activity).await
    }

    /// First or repeated play of an activity: reconciles its navigation and
    /// presents the exercises its mode starts on.
    pub async fn open_activity(&self, activity: Session) -> PlayerResult<PlayerActivity> {
        if Navigation::from_variables(&activity.variables).terminated {
            return self.read_only_view(&activity).await;
        }
        let activity = self.guard_open(activity).await?;
        let mode = ActivitySettings::from_variables(&activity.variables).mode();

        let added = self.builder.materialize_navigation(&activity).await?;
        let activity = update_with_retry(self.sessions.as_ref(), &activity.id, |current| {
            let navigation = Navigation::from_variables(&current.variables)
                .with_entries(&added)
                .start();
            let mut variables = current.variables.clone();
            variables.insert("navigation".into(), navigation.to_value());
            Ok(SessionChanges {
                variables: Some(variables),
                started_at: current.started_at.or_else(|| Some(Utc::now())),
                ..Default::default()
            })
        })
        .await?;
        let navigation = Navigation::from_variables(&activity.variables);
        record_navigation_event(mode.as_str(), "play");

        let (activity, exercises) = match mode {
            NavigationMode::Manual => {
                let target = navigation
                    .current
                    .as_ref()
                    .or_else(|| navigation.visible(mode).into_iter().next())
                    .map(|entry| entry.session_id.clone());
                match target {
                    Some(session_id) => {
                        let sessions = self.build_all(&activity.id, &[session_id.clone()]).await?;
                        let activity = self.present(&activity, &sessions, Some(&session_id)).await?;
                        (activity, sessions)
                    }
                    None => (activity, Vec::new()),
                }
            }
            NavigationMode::Next => match navigation.current.clone() {
                Some(current) if !navigation.next_exercises_history.is_empty() => {
                    let sessions = self.build_all(&activity.id, &[current.session_id.clone()]).await?;
                    (activity, sessions)
                }
                _ => self.first_next(&activity.id).await?,
            },
            NavigationMode::Composed => {
                let session_ids: Vec<String> = navigation
                    .visible(mode)
                    .iter()
                    .map(|entry| entry.session_id.clone())
                    .collect();
                let sessions = self.build_all(&activity.id, &session_ids).await?;
                (activity, sessions)
            }
            NavigationMode::Peer => {
                let target = navigation
                    .current
                    .as_ref()
                    .or_else(|| {
                        navigation
                            .exercises
                            .iter()
                            .find(|entry| entry.role == Some(PeerRole::Exercise))
                    })
                    .map(|entry| entry.session_id.clone())
                    .ok_or_else(|| {
                        PlayerError::Configuration(format!(
                            "Peer activity {} declares no primary exercise",
                            activity.id
                        ))
                    })?;
                let sessions = self.build_all(&activity.id, &[target.clone()]).await?;
                let activity = self.present(&activity, &sessions, Some(&target)).await?;
                (activity, sessions)
            }
        };

        Ok(Self::view(&activity, &exercises))
    }

    /// Asks the activity script for its first exercise, unless a concurrent
    /// request already did.
    async fn first_next(&self, activity_id: &str) -> PlayerResult<(Session, Vec<Session>)> {
        self.with_lock(activity_id, async {
            let fresh = self.load_activity(activity_id).await?;
            let navigation = Navigation::from_variables(&fresh.variables);
            if let (Some(current), false) = (&navigation.current, navigation.next_exercises_history.is_empty()) {
                let sessions = self.build_all(activity_id, &[current.session_id.clone()]).await?;
                return Ok((fresh, sessions));
            }
            self.advance_next(&fresh).await
        })
        .await
    }

    /// `buildNext` followed by the build of the exercise it chose. A script
    /// that ends the activity gets nothing built.
    async fn advance_next(&self, activity: &Session) -> PlayerResult<(Session, Vec<Session>)> {
        let outcome = self.builder.build_next(activity).await?;
        if outcome.terminated {
            self.announce_termination(&outcome.activity, NavigationMode::Next, TerminationReason::Explicit)
                .await;
            return Ok((outcome.activity, Vec::new()));
        }
        match outcome.next {
            Some(next) => {
                let next = if next.is_built {
                    next
                } else {
                    self.builder.build_exercise(&next).await?
                };
                let activity = self
                    .present(&outcome.activity, std::slice::from_ref(&next), Some(&next.id))
                    .await?;
                Ok((activity, vec![next]))
            }
            None => Ok((outcome.activity, Vec::new())),
        }
    }

    /// History replay in next mode; only moving past the last entry asks the
    /// script for a fresh decision.
    async fn navigate_next(
        &self,
        activity_id: &str,
        command: NavigationCommand,
    ) -> PlayerResult<(Session, Vec<Session>)> {
        self.with_lock(activity_id, async {
            let fresh = self.load_activity(activity_id).await?;
            let navigation = Navigation::from_variables(&fresh.variables);
            let (moved, target) = match command {
                NavigationCommand::Previous => navigation.history_back(),
                NavigationCommand::Next => navigation.history_forward(),
            };

            match (target, command) {
                (Some(exercise_id), _) => {
                    let entry = moved.find_by_exercise(&exercise_id).cloned().ok_or_else(|| {
                        PlayerError::not_found(format!("Exercise {} not found in navigation", exercise_id))
                    })?;
                    let position = moved.next_exercises_history_position;
                    let activity = update_with_retry(self.sessions.as_ref(), activity_id, |current| {
                        let mut navigation = Navigation::from_variables(&current.variables);
                        navigation.next_exercises_history_position = position
                            .min(navigation.next_exercises_history.len().saturating_sub(1));
                        let navigation = navigation.with_current(&entry.session_id);
                        let mut variables = current.variables.clone();
                        variables.insert("navigation".into(), navigation.to_value());
                        Ok(SessionChanges {
                            variables: Some(variables),
                            ..Default::default()
                        })
                    })
                    .await?;
                    record_navigation_event(NavigationMode::Next.as_str(), "replay");
                    let sessions = self.build_all(activity_id, &[entry.session_id]).await?;
                    Ok((activity, sessions))
                }
                (None, NavigationCommand::Previous) => {
                    Err(PlayerError::bad_request("No previous exercise to go back to"))
                }
                (None, NavigationCommand::Next) => self.advance_next(&fresh).await,
            }
        })
        .await
    }

    pub async fn play_exercises(&self, user_id: &str, req: PlayExercisesRequest) -> PlayerResult<PlayExercisesResponse> {
        let activity = self.load_activity(&req.activity_session_id).await?;
        Self::ensure_owner(&activity, Some(user_id))?;
        let activity = self.guard_open(activity).await?;
        let mode = ActivitySettings::from_variables(&activity.variables).mode();

        let (activity, sessions) = match (mode, req.navigation) {
            (NavigationMode::Next, Some(command)) => self.navigate_next(&activity.id, command).await?,
            _ => {
                if req.exercise_session_ids.is_empty() {
                    return Err(PlayerError::bad_request("exerciseSessionIds must not be empty"));
                }
                let navigation = Navigation::from_variables(&activity.variables);
                for session_id in &req.exercise_session_ids {
                    if navigation.find_by_session(session_id).is_none() {
                        return Err(PlayerError::not_found(format!(
                            "Session {} is not part of activity {}",
                            session_id, activity.id
                        )));
                    }
                }
                if mode == NavigationMode::Peer {
                    let current = navigation.current.as_ref().map(|entry| entry.session_id.as_str());
                    if req
                        .exercise_session_ids
                        .iter()
                        .any(|session_id| Some(session_id.as_str()) != current)
                    {
                        return Err(PlayerError::forbidden(
                            "Peer activities only play the exercise they present",
                        ));
                    }
                }

                let sessions = self.build_all(&activity.id, &req.exercise_session_ids).await?;
                let current = match mode {
                    NavigationMode::Composed => None,
                    _ => req.exercise_session_ids.first().map(String::as_str),
                };
                let activity = self.present(&activity, &sessions, current).await?;
                (activity, sessions)
            }
        };

        let view = Self::view(&activity, &sessions);
        Ok(PlayExercisesResponse {
            exercises: view.exercises,
            navigation: view.navigation,
            has_next: view.has_next,
            has_previous: view.has_previous,
        })
    }

    /// Single navigation write after all builds of a request settled.
    async fn present(&self, activity: &Session, sessions: &[Session], current: Option<&str>) -> PlayerResult<Session> {
        let mode = ActivitySettings::from_variables(&activity.variables).mode();
        update_with_retry(self.sessions.as_ref(), &activity.id, |stored| {
            let mut navigation = Navigation::from_variables(&stored.variables);
            if mode != NavigationMode::Composed {
                for session in sessions {
                    navigation = navigation.mark_started(&session.id);
                }
            }
            if let Some(current) = current {
                navigation = navigation.with_current(current);
            }
            if navigation == Navigation::from_variables(&stored.variables) {
                return Ok(SessionChanges::default());
            }
            let mut variables = stored.variables.clone();
            variables.insert("navigation".into(), navigation.to_value());
            Ok(SessionChanges {
                variables: Some(variables),
                ..Default::default()
            })
        })
        .await
    }

    async fn read_only_view(&self, activity: &Session) -> PlayerResult<PlayerActivity> {
        let mode = ActivitySettings::from_variables(&activity.variables).mode();
        let navigation = Navigation::from_variables(&activity.variables);
        let children = self.sessions.find_all_with_parent(&activity.id).await?;
        let visible: Vec<Session> = children
            .into_iter()
            .filter(|session| {
                navigation
                    .visible(mode)
                    .iter()
                    .any(|entry| entry.session_id == session.id)
            })
            .collect();
        Ok(Self::view(activity, &visible))
    }

    fn view(activity: &Session, sessions: &[Session]) -> PlayerActivity {
        let mode = ActivitySettings::from_variables(&activity.variables).mode();
        let navigation = Navigation::from_variables(&activity.variables);
        let exercises = sessions
            .iter()
            .map(|session| PlayerExercise::from_session(session, navigation.find_by_session(&session.id)))
            .collect();

        PlayerActivity {
            session_id: activity.id.clone(),
            title: activity.title(),
            mode,
            grade: activity.grade,
            has_next: navigation.has_next(mode),
            has_previous: navigation.has_previous(mode),
            navigation: navigation.public_view(mode),
            exercises,
        }
    }

    /// Updates the activity after one of its exercises was evaluated.
    pub async fn on_exercise_evaluated(
        &self,
        activity: &Session,
        exercise: &Session,
        action: PlayerAction,
    ) -> PlayerResult<EvaluationFollowUp> {
        let settings = ActivitySettings::from_variables(&activity.variables);
        let mode = settings.mode();
        let mut follow_up = EvaluationFollowUp::default();

        if action == PlayerAction::CheckAnswer {
            if mode == NavigationMode::Peer {
                let outcome = self
                    .with_lock(&activity.id, async {
                        let fresh = self.load_activity(&activity.id).await?;
                        self.peer_resolver().on_answer(&fresh, exercise).await
                    })
                    .await?;
                follow_up.navigation = Some(outcome.navigation.public_view(mode));
                follow_up.full_navigation = Some(outcome.navigation);
                if outcome.next.id != exercise.id {
                    follow_up.next_exercise = Some(outcome.next);
                }
            } else {
                let state = ExerciseState::from_grade(exercise.grade);
                let was_complete = AtomicBool::new(false);
                let updated = update_with_retry(self.sessions.as_ref(), &activity.id, |current| {
                    let navigation = Navigation::from_variables(&current.variables);
                    was_complete.store(navigation.all_succeeded(mode), Ordering::SeqCst);
                    let navigation = navigation.with_state(&exercise.id, state);
                    let mut variables = current.variables.clone();
                    variables.insert("navigation".into(), navigation.to_value());
                    Ok(SessionChanges {
                        variables: Some(variables),
                        ..Default::default()
                    })
                })
                .await?;

                let navigation = Navigation::from_variables(&updated.variables);
                record_navigation_event(mode.as_str(), state.as_str());
                if mode != NavigationMode::Next
                    && !was_complete.load(Ordering::SeqCst)
                    && navigation.all_succeeded(mode)
                {
                    if let Err(err) = self
                        .notifier
                        .on_challenge_succeeded(updated.user_id.as_deref(), &updated.id)
                        .await
                    {
                        tracing::warn!("Completion event for {} not delivered: {:#}", updated.id, err);
                    }
                }

                if mode == NavigationMode::Next {
                    follow_up.auto_next = settings
                        .navigation
                        .auto_next_grade
                        .filter(|threshold| exercise.grade >= *threshold)
                        .map(|_| AutoNext {
                            delay_ms: AUTO_NEXT_DELAY_MS,
                        });
                }
                follow_up.navigation = Some(navigation.public_view(mode));
                follow_up.full_navigation = Some(navigation);
            }
        }

        let requested_termination = exercise
            .variables
            .get("navigation")
            .and_then(|navigation| navigation.get("terminate"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if requested_termination {
            tracing::info!("Exercise {} asked to terminate activity {}", exercise.id, activity.id);
            let updated = self
                .snapshot_terminate(activity, TerminationReason::Explicit)
                .await?;
            let navigation = Navigation::from_variables(&updated.variables);
            follow_up.navigation = Some(navigation.public_view(mode));
            follow_up.full_navigation = Some(navigation);
        }

        Ok(follow_up)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NavigationExercise, Source, Variables};

    fn entry(id: &str, session_id: &str, role: Option<PeerRole>) -> NavigationExercise {
        NavigationExercise {
            id: id.into(),
            title: id.into(),
            state: ExerciseState::NotStarted,
            session_id: session_id.into(),
            role,
        }
    }

    fn graded(id: &str, grade: f64) -> Session {
        let source = Source {
            kind: Default::default(),
            resource: None,
            version: None,
            script: String::new(),
            variables: Variables::new(),
            files: Vec::new(),
        };
        let mut session = Session::new(id.into(), None, Some("a".into()), source, Variables::new());
        session.grade = grade;
        session
    }

    #[test]
    fn aggregate_counts_ungraded_as_zero() {
        let navigation = Navigation {
            exercises: vec![entry("e1", "s1", None), entry("e2", "s2", None)],
            ..Default::default()
        };
        let children = vec![graded("s1", 100.0), graded("s2", -1.0)];
        assert_eq!(aggregate_grade(&navigation, NavigationMode::Manual, &children), 50.0);
    }

    #[test]
    fn aggregate_ignores_hidden_peer_pools() {
        let navigation = Navigation {
            exercises: vec![
                entry("main", "s1", Some(PeerRole::Exercise)),
                entry("wait", "s2", Some(PeerRole::Waiting)),
            ],
            ..Default::default()
        };
        let children = vec![graded("s1", 80.0), graded("s2", 0.0)];
        assert_eq!(aggregate_grade(&navigation, NavigationMode::Peer, &children), 80.0);
        assert_eq!(aggregate_grade(&Navigation::default(), NavigationMode::Peer, &[]), 0.0);
    }
}
