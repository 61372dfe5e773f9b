use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use futures::future::try_join_all;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{PlayerError, PlayerResult};
use crate::metrics::{record_navigation_event, PLAYER_SESSIONS_TOTAL};
use crate::models::navigation::{exercise_groups, ActivityExercise, GENERATED_GROUP};
use crate::models::{
    ActivitySettings, ExerciseMeta, ExerciseState, Navigation, NavigationExercise, NavigationMode,
    PeerRole, Session, SessionChanges, Source, Variables,
};
use crate::sandbox::SandboxDispatcher;

use super::resource_compiler::{ResourceCompiler, ResourceRef};
use super::session_store::{update_with_retry, SessionStore};

/// Seeds are capped to this range.
pub const SEED_RANGE: i64 = 100;

const EXERCISES_VARIABLES: &str = "exercisesVariables";
const EXERCISES_META: &str = "exercisesMeta";
const NAVIGATION: &str = "navigation";
/// Keys assembled for a next-mode run that are never written back.
const SYNTHETIC_INPUTS: [&str; 3] = [EXERCISES_VARIABLES, EXERCISES_META, NAVIGATION];

/// Hash to exercise id mapping of generated exercises.
const GENERATED_EXERCISES: &str = "generatedExercises";

/// Declared seed reduced to `[0, SEED_RANGE)`, or a fresh random one when the
/// declaration is missing or unparsable.
pub fn parse_seed(raw: Option<&Value>) -> i64 {
    let parsed = match raw {
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|value| value as i64)),
        Some(Value::String(text)) => text.trim().parse::<i64>().ok(),
        _ => None,
    };

    match parsed {
        Some(seed) => seed.rem_euclid(SEED_RANGE),
        None => rand::random_range(0..SEED_RANGE),
    }
}

/// Result of one next-mode continuation.
pub struct NextOutcome {
    pub activity: Session,
    pub navigation: Navigation,
    /// Exercise chosen by the script, with forwarded logs applied. Never set
    /// when the script ends the activity.
    pub next: Option<Session>,
    /// This run moved the activity to terminated.
    pub terminated: bool,
}

#[derive(Clone)]
pub struct SessionBuilder {
    sessions: Arc<dyn SessionStore>,
    compiler: Arc<dyn ResourceCompiler>,
    sandboxes: Arc<SandboxDispatcher>,
}

impl SessionBuilder {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        compiler: Arc<dyn ResourceCompiler>,
        sandboxes: Arc<SandboxDispatcher>,
    ) -> Self {
        Self {
            sessions,
            compiler,
            sandboxes,
        }
    }

    /// Creates a session row. An activity source materialises its navigation
    /// and every exercise session in the same atomic write.
    pub async fn create_session(
        &self,
        user_id: Option<&str>,
        source: Source,
        parent: Option<&Session>,
        is_built: bool,
    ) -> PlayerResult<Session> {
        let seed = Self::seed_for(&source, parent);
        let mut variables = source.variables.clone();
        variables.insert("seed".into(), json!(seed));

        let mut session = Session::new(
            Uuid::new_v4().to_string(),
            user_id.map(str::to_string),
            parent.map(|parent| parent.id.clone()),
            source,
            variables,
        );
        session.is_built = is_built;

        if session.is_activity() {
            let (navigation, exercises) = self.create_navigation(&session, user_id).await?;
            session
                .variables
                .insert(NAVIGATION.into(), navigation.to_value());

            let exercise_count = exercises.len();
            let mut rows = Vec::with_capacity(exercise_count + 1);
            rows.push(session.clone());
            rows.extend(exercises);
            self.sessions
                .create_many(rows)
                .await
                .context("Failed to create activity sessions")?;

            PLAYER_SESSIONS_TOTAL.with_label_values(&["activity"]).inc();
            PLAYER_SESSIONS_TOTAL
                .with_label_values(&["exercise"])
                .inc_by(exercise_count as u64);
            tracing::info!(
                "Activity session {} created with {} exercises (user={:?})",
                session.id,
                exercise_count,
                user_id
            );
            return Ok(session);
        }

        let created = self
            .sessions
            .create(session)
            .await
            .context("Failed to create exercise session")?;
        let kind = if created.is_preview() { "preview" } else { "exercise" };
        PLAYER_SESSIONS_TOTAL.with_label_values(&[kind]).inc();
        tracing::debug!("Exercise session {} created ({})", created.id, kind);
        Ok(created)
    }

    fn seed_for(source: &Source, parent: Option<&Session>) -> i64 {
        let inherited = parent
            .filter(|parent| !ActivitySettings::from_variables(&parent.variables).seed_per_exercise)
            .and_then(|parent| parent.variables.get("seed"))
            .and_then(Value::as_i64);

        inherited.unwrap_or_else(|| parse_seed(source.variables.get("seed")))
    }

    /// Reconciles the declared exercise groups with the activity's navigation.
    ///
    /// Exercises without an entry get a fresh session (not persisted here) and a
    /// `NOT_STARTED` entry appended; existing entries are left untouched, so a
    /// second call with unchanged groups creates nothing.
    pub async fn create_navigation(
        &self,
        activity: &Session,
        user_id: Option<&str>,
    ) -> PlayerResult<(Navigation, Vec<Session>)> {
        let settings = ActivitySettings::from_variables(&activity.variables);
        let mut navigation = Navigation::from_variables(&activity.variables);

        let mut pending: Vec<(Option<PeerRole>, ActivityExercise)> = Vec::new();
        for (key, group) in exercise_groups(&activity.variables) {
            let role = match settings.mode() {
                NavigationMode::Peer => group.peer_role(&key),
                _ => None,
            };
            for exercise in group.exercises {
                let known = navigation.find_by_exercise(&exercise.id).is_some()
                    || pending.iter().any(|(_, queued)| queued.id == exercise.id);
                if !known {
                    pending.push((role, exercise));
                }
            }
        }

        if pending.is_empty() {
            return Ok((navigation, Vec::new()));
        }

        let sources = try_join_all(
            pending
                .iter()
                .map(|(_, exercise)| self.exercise_source(exercise)),
        )
        .await?;

        let activity_seed = activity.variables.get("seed").and_then(Value::as_i64);
        let mut sessions = Vec::with_capacity(pending.len());
        for ((role, exercise), source) in pending.into_iter().zip(sources) {
            let seed = match activity_seed {
                Some(seed) if !settings.seed_per_exercise => seed,
                _ => parse_seed(source.variables.get("seed")),
            };
            let mut variables = source.variables.clone();
            variables.insert("seed".into(), json!(seed));

            let session = Session::new(
                Uuid::new_v4().to_string(),
                user_id.map(str::to_string),
                Some(activity.id.clone()),
                source,
                variables,
            );

            let title = exercise
                .title
                .clone()
                .filter(|title| !title.is_empty())
                .or_else(|| Some(session.title()).filter(|title| !title.is_empty()))
                .unwrap_or_else(|| exercise.id.clone());

            navigation.exercises.push(NavigationExercise {
                id: exercise.id,
                title,
                state: ExerciseState::NotStarted,
                session_id: session.id.clone(),
                role,
            });
            sessions.push(session);
        }

        Ok((navigation, sessions))
    }

    async fn exercise_source(&self, exercise: &ActivityExercise) -> PlayerResult<Source> {
        if let Some(source) = &exercise.source {
            let mut source = source.clone();
            for (key, value) in &exercise.overrides {
                source.variables.insert(key.clone(), value.clone());
            }
            return Ok(source);
        }

        let resource = ResourceRef::new(
            exercise.resource.clone().unwrap_or_else(|| exercise.id.clone()),
            exercise.version.clone(),
        );
        self.compiler
            .compile(&resource, &exercise.overrides)
            .await?
            .ok_or_else(|| {
                PlayerError::not_found(format!("Exercise resource {} not found", resource.id))
            })
    }

    /// Persists the sessions missing from the navigation and returns their entries.
    pub async fn materialize_navigation(&self, activity: &Session) -> PlayerResult<Vec<NavigationExercise>> {
        let known = Navigation::from_variables(&activity.variables).exercises.len();
        let (navigation, sessions) = self
            .create_navigation(activity, activity.user_id.as_deref())
            .await?;
        if sessions.is_empty() {
            return Ok(Vec::new());
        }

        let count = sessions.len();
        self.sessions
            .create_many(sessions)
            .await
            .context("Failed to create exercise sessions")?;
        PLAYER_SESSIONS_TOTAL
            .with_label_values(&["exercise"])
            .inc_by(count as u64);
        tracing::info!("Materialised {} exercises under activity {}", count, activity.id);

        Ok(navigation.exercises.into_iter().skip(known).collect())
    }

    /// First execution (or in-place rebuild) of an exercise session.
    /// Failures are returned unchanged; nothing is retried.
    pub async fn build_exercise(&self, session: &Session) -> PlayerResult<Session> {
        let output = self.sandboxes.build(session).await?;

        let changes = SessionChanges {
            envid: output.envid,
            variables: Some(output.variables),
            is_built: Some(true),
            ..Default::default()
        };
        self.sessions
            .update(&session.id, changes)
            .await?
            .ok_or_else(|| PlayerError::not_found(format!("Session {} not found", session.id)))
    }

    /// Continuation run of a next-mode activity. Callers hold the activity lock.
    pub async fn build_next(&self, activity: &Session) -> PlayerResult<NextOutcome> {
        let settings = ActivitySettings::from_variables(&activity.variables);
        let navigation = Navigation::from_variables(&activity.variables);
        let children = self.sessions.find_all_with_parent(&activity.id).await?;
        let by_session: HashMap<&str, &Session> = children
            .iter()
            .map(|session| (session.id.as_str(), session))
            .collect();

        let mut metas = Variables::new();
        let mut forwarded = Variables::new();
        for entry in &navigation.exercises {
            let session = by_session.get(entry.session_id.as_str());
            let meta = match session {
                Some(session) if session.is_built => ExerciseMeta {
                    built: true,
                    attempts: session.attempts,
                    grade: session.grade,
                    consumed_hints: session.consumed_hints(),
                    state: entry.state,
                },
                _ => ExerciseMeta::default(),
            };
            metas.insert(
                entry.id.clone(),
                serde_json::to_value(&meta).context("Failed to encode exercise metadata")?,
            );
            if let Some(session) = session {
                forwarded.insert(entry.id.clone(), Value::Object(session.variables.clone()));
            }
        }

        let mut input = activity.variables.clone();
        if settings.next.forward_exercise_variables {
            input.insert(EXERCISES_VARIABLES.into(), Value::Object(forwarded));
        }
        input.insert(EXERCISES_META.into(), Value::Object(metas));
        input.insert(NAVIGATION.into(), navigation.to_value());

        let output = self.sandboxes.run(activity, input).await?;
        let returned = output.variables;

        let mut updates: Variables = returned
            .iter()
            .filter(|(key, _)| !SYNTHETIC_INPUTS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        // Groups come back verbatim; only the reserved group is carried over.
        let reserved_group = activity
            .variables
            .get("exerciseGroups")
            .and_then(|groups| groups.get(GENERATED_GROUP))
            .cloned();
        if let (Some(group), Some(Value::Object(groups))) =
            (reserved_group, updates.get_mut("exerciseGroups"))
        {
            groups.entry(GENERATED_GROUP).or_insert(group);
        }

        let mut staged = activity.variables.clone();
        for (key, value) in &updates {
            staged.insert(key.clone(), value.clone());
        }

        let generated_id = match returned
            .get("generatedExerciseHash")
            .and_then(Value::as_str)
            .filter(|hash| !hash.is_empty())
        {
            Some(hash) => Some(register_generated(
                &mut staged,
                hash,
                returned.get("generatedExercise"),
            )?),
            None => None,
        };
        for key in ["exerciseGroups", GENERATED_EXERCISES] {
            if let Some(value) = staged.get(key) {
                updates.insert(key.to_string(), value.clone());
            }
        }

        let mut staged_activity = activity.clone();
        staged_activity.variables = staged;
        let added = self.materialize_navigation(&staged_activity).await?;
        let reconciled = navigation.with_entries(&added);

        let terminate = returned
            .get("terminate")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let next_exercise_id = returned
            .get("nextExerciseId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(generated_id)
            .filter(|_| !terminate);
        let next_entry = match &next_exercise_id {
            Some(id) => Some(reconciled.find_by_exercise(id).cloned().ok_or_else(|| {
                PlayerError::not_found(format!("Next exercise {} is not declared by the activity", id))
            })?),
            None => None,
        };

        let next = match &next_entry {
            Some(entry) => {
                let session = self
                    .sessions
                    .find_exercise_session_by_activity_id(&activity.id, &entry.session_id)
                    .await?
                    .ok_or_else(|| {
                        PlayerError::not_found(format!("Session {} not found", entry.session_id))
                    })?;
                match returned.get("logs").filter(|logs| !logs.is_null()) {
                    Some(logs) => Some(self.forward_logs(session, logs).await?),
                    None => Some(session),
                }
            }
            None => None,
        };

        let grade = returned.get("grade").and_then(Value::as_f64);
        let envid = output.envid;
        let ended_here = AtomicBool::new(false);

        let updated = update_with_retry(self.sessions.as_ref(), &activity.id, |current| {
            let mut variables = current.variables.clone();
            for (key, value) in &updates {
                variables.insert(key.clone(), value.clone());
            }

            let mut navigation = Navigation::from_variables(&current.variables)
                .with_entries(&added)
                .start();
            if let Some(entry) = &next_entry {
                navigation = navigation
                    .push_history(&entry.id)
                    .with_current(&entry.session_id);
            }
            ended_here.store(terminate && !navigation.terminated, Ordering::SeqCst);
            if terminate {
                navigation = navigation.terminate();
            }
            variables.insert(NAVIGATION.into(), navigation.to_value());

            Ok(SessionChanges {
                envid: envid.clone(),
                variables: Some(variables),
                grade,
                is_built: Some(true),
                ..Default::default()
            })
        })
        .await?;

        record_navigation_event(NavigationMode::Next.as_str(), "build_next");
        tracing::debug!(
            "buildNext on activity {} chose {:?} (terminate={})",
            activity.id,
            next_exercise_id,
            terminate
        );

        Ok(NextOutcome {
            navigation: Navigation::from_variables(&updated.variables),
            activity: updated,
            next,
            terminated: ended_here.load(Ordering::SeqCst),
        })
    }

    /// Injects script logs as parameters of the next exercise, on both its live
    /// and its source variables so a rebuild sees them too.
    async fn forward_logs(&self, session: Session, logs: &Value) -> PlayerResult<Session> {
        let mut variables = session.variables.clone();
        let mut source_variables = session.source.variables.clone();
        match logs {
            Value::Object(entries) => {
                for (key, value) in entries {
                    variables.insert(key.clone(), value.clone());
                    source_variables.insert(key.clone(), value.clone());
                }
            }
            other => {
                variables.insert("logs".into(), other.clone());
                source_variables.insert("logs".into(), other.clone());
            }
        }

        let changes = SessionChanges {
            variables: Some(variables),
            source_variables: Some(source_variables),
            ..Default::default()
        };
        self.sessions
            .update(&session.id, changes)
            .await?
            .ok_or_else(|| PlayerError::not_found(format!("Session {} not found", session.id)))
    }
}

/// Returns the exercise id bound to `hash`, declaring a new exercise in the
/// reserved group the first time the hash is seen.
fn register_generated(
    variables: &mut Variables,
    hash: &str,
    generated: Option<&Value>,
) -> PlayerResult<String> {
    if let Some(id) = variables
        .get(GENERATED_EXERCISES)
        .and_then(|mapping| mapping.get(hash))
        .and_then(Value::as_str)
    {
        return Ok(id.to_string());
    }

    let source: Source = generated
        .cloned()
        .and_then(|value| serde_json::from_value(value).ok())
        .ok_or_else(|| {
            PlayerError::SandboxUnknown(format!("Generated exercise {} has no valid source", hash))
        })?;

    let id = Uuid::new_v4().to_string();
    let exercise = ActivityExercise {
        id: id.clone(),
        title: source.title().map(str::to_string),
        resource: None,
        version: None,
        overrides: Variables::new(),
        source: Some(source),
    };
    let exercise = serde_json::to_value(&exercise).context("Failed to encode generated exercise")?;

    let groups = variables
        .entry("exerciseGroups")
        .or_insert_with(|| json!({}));
    if !groups.is_object() {
        *groups = json!({});
    }
    if let Some(groups) = groups.as_object_mut() {
        let group = groups
            .entry(GENERATED_GROUP)
            .or_insert_with(|| json!({ "name": GENERATED_GROUP, "exercises": [] }));
        if !group.is_object() {
            *group = json!({ "name": GENERATED_GROUP, "exercises": [] });
        }
        match group.get_mut("exercises").and_then(Value::as_array_mut) {
            Some(exercises) => exercises.push(exercise),
            None => group["exercises"] = Value::Array(vec![exercise]),
        }
    }

    let mapping = variables
        .entry(GENERATED_EXERCISES)
        .or_insert_with(|| json!({}));
    if !mapping.is_object() {
        *mapping = json!({});
    }
    if let Some(mapping) = mapping.as_object_mut() {
        mapping.insert(hash.to_string(), Value::String(id.clone()));
    }

    Ok(id)
}
