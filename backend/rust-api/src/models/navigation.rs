use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::peer::PeerRole;
use super::session::{Source, SUCCESS_GRADE};
use super::Variables;

/// Group key reserved for exercises synthesised by a next-mode script.
pub const GENERATED_GROUP: &str = "__generated__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExerciseState {
    #[default]
    NotStarted,
    Started,
    Progressing,
    Succeeded,
    Failed,
}

impl ExerciseState {
    /// State reached after a graded attempt. Ungraded answers keep the exercise started.
    pub fn from_grade(grade: f64) -> Self {
        if grade < 0.0 {
            ExerciseState::Started
        } else if grade >= SUCCESS_GRADE {
            ExerciseState::Succeeded
        } else if grade == 0.0 {
            ExerciseState::Failed
        } else {
            ExerciseState::Progressing
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExerciseState::NotStarted => "NOT_STARTED",
            ExerciseState::Started => "STARTED",
            ExerciseState::Progressing => "PROGRESSING",
            ExerciseState::Succeeded => "SUCCEEDED",
            ExerciseState::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NavigationMode {
    #[default]
    Manual,
    Next,
    Composed,
    Peer,
}

impl NavigationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NavigationMode::Manual => "manual",
            NavigationMode::Next => "next",
            NavigationMode::Composed => "composed",
            NavigationMode::Peer => "peer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationExercise {
    pub id: String,
    pub title: String,
    pub state: ExerciseState,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<PeerRole>,
}

impl NavigationExercise {
    /// Entries of the comparison, waiting and training pools.
    pub fn is_peer_tagged(&self) -> bool {
        matches!(self.role, Some(role) if role != PeerRole::Exercise)
    }
}

/// Navigation state embedded in an activity session's variables.
///
/// Every transition consumes the value and returns the next one; nothing is
/// written until the caller hands the result to the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Navigation {
    #[serde(default)]
    pub exercises: Vec<NavigationExercise>,
    #[serde(default)]
    pub current: Option<NavigationExercise>,
    #[serde(default)]
    pub started: bool,
    #[serde(default)]
    pub terminated: bool,
    #[serde(default)]
    pub next_exercises_history: Vec<String>,
    #[serde(default)]
    pub next_exercises_history_position: usize,
}

impl Navigation {
    pub fn from_variables(variables: &Variables) -> Self {
        variables
            .get("navigation")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn find_by_session(&self, session_id: &str) -> Option<&NavigationExercise> {
        self.exercises
            .iter()
            .find(|entry| entry.session_id == session_id)
    }

    pub fn find_by_exercise(&self, exercise_id: &str) -> Option<&NavigationExercise> {
        self.exercises.iter().find(|entry| entry.id == exercise_id)
    }

    pub fn position_of(&self, session_id: &str) -> Option<usize> {
        self.exercises
            .iter()
            .position(|entry| entry.session_id == session_id)
    }

    /// Appends entries for exercises not listed yet; existing entries win.
    pub fn with_entries(mut self, entries: &[NavigationExercise]) -> Self {
        for entry in entries {
            if self.find_by_exercise(&entry.id).is_none() {
                self.exercises.push(entry.clone());
            }
        }
        self
    }

    pub fn start(mut self) -> Self {
        self.started = true;
        self
    }

    /// Terminated is absorbing: once set it is never cleared.
    pub fn terminate(mut self) -> Self {
        self.terminated = true;
        self
    }

    pub fn with_current(mut self, session_id: &str) -> Self {
        if let Some(entry) = self.find_by_session(session_id).cloned() {
            self.current = Some(entry);
        }
        self
    }

    pub fn with_state(mut self, session_id: &str, state: ExerciseState) -> Self {
        for entry in self
            .exercises
            .iter_mut()
            .filter(|entry| entry.session_id == session_id)
        {
            entry.state = state;
        }
        if let Some(current) = self.current.as_mut() {
            if current.session_id == session_id {
                current.state = state;
            }
        }
        self
    }

    /// Marks a not-started entry as started; later states are left alone.
    pub fn mark_started(self, session_id: &str) -> Self {
        match self.find_by_session(session_id).map(|entry| entry.state) {
            Some(ExerciseState::NotStarted) => self.with_state(session_id, ExerciseState::Started),
            _ => self,
        }
    }

    /// Appends to the next-mode history unless it repeats the last entry, then
    /// moves the cursor to the end.
    pub fn push_history(mut self, exercise_id: &str) -> Self {
        if self.next_exercises_history.last().map(String::as_str) != Some(exercise_id) {
            self.next_exercises_history.push(exercise_id.to_string());
        }
        self.next_exercises_history_position = self.next_exercises_history.len().saturating_sub(1);
        self
    }

    pub fn history_current(&self) -> Option<&str> {
        self.next_exercises_history
            .get(self.next_exercises_history_position)
            .map(String::as_str)
    }

    /// Moves the cursor one step back, clamped at the first entry.
    pub fn history_back(mut self) -> (Self, Option<String>) {
        self.next_exercises_history_position = self.next_exercises_history_position.saturating_sub(1);
        let id = self.history_current().map(str::to_string);
        (self, id)
    }

    /// Replays one step forward; `None` means the cursor sits on the last known
    /// entry and a fresh decision is required.
    pub fn history_forward(mut self) -> (Self, Option<String>) {
        if self.next_exercises_history_position + 1 < self.next_exercises_history.len() {
            self.next_exercises_history_position += 1;
            let id = self.history_current().map(str::to_string);
            (self, id)
        } else {
            (self, None)
        }
    }

    pub fn has_next(&self, mode: NavigationMode) -> bool {
        match mode {
            NavigationMode::Manual => self
                .current
                .as_ref()
                .and_then(|current| self.position_of(&current.session_id))
                .map(|index| index + 1 < self.exercises.len())
                .unwrap_or(!self.exercises.is_empty()),
            NavigationMode::Next => !self.terminated,
            NavigationMode::Composed | NavigationMode::Peer => false,
        }
    }

    pub fn has_previous(&self, mode: NavigationMode) -> bool {
        match mode {
            NavigationMode::Manual => self
                .current
                .as_ref()
                .and_then(|current| self.position_of(&current.session_id))
                .map(|index| index > 0)
                .unwrap_or(false),
            NavigationMode::Next => self.next_exercises_history_position > 0,
            NavigationMode::Composed | NavigationMode::Peer => false,
        }
    }

    /// The list a learner sees; peer pools are hidden in peer mode.
    pub fn visible(&self, mode: NavigationMode) -> Vec<&NavigationExercise> {
        self.exercises
            .iter()
            .filter(|entry| mode != NavigationMode::Peer || !entry.is_peer_tagged())
            .collect()
    }

    pub fn all_succeeded(&self, mode: NavigationMode) -> bool {
        let visible = self.visible(mode);
        !visible.is_empty()
            && visible
                .iter()
                .all(|entry| entry.state == ExerciseState::Succeeded)
    }

    /// Copy trimmed to what the learner may see.
    pub fn public_view(&self, mode: NavigationMode) -> Navigation {
        let mut view = self.clone();
        view.exercises = self.visible(mode).into_iter().cloned().collect();
        view
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NavigationSettings {
    pub mode: NavigationMode,
    pub auto_next_grade: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecuritySettings {
    pub terminate_on_leave_page: bool,
    pub terminate_on_lose_focus: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NextSettings {
    pub forward_exercise_variables: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionSettings {
    pub reroll: bool,
    pub hints: bool,
    pub solution: bool,
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self {
            reroll: true,
            hints: true,
            solution: true,
        }
    }
}

/// Read-only view over `variables.settings` of an activity.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActivitySettings {
    pub navigation: NavigationSettings,
    pub open_at: Option<DateTime<Utc>>,
    pub close_at: Option<DateTime<Utc>>,
    /// Minutes allowed from the activity's first play.
    pub duration: Option<i64>,
    pub security: SecuritySettings,
    pub seed_per_exercise: bool,
    pub next: NextSettings,
    pub actions: ActionSettings,
    pub attempts: Option<u32>,
}

impl ActivitySettings {
    pub fn from_variables(variables: &Variables) -> Self {
        match variables.get("settings") {
            Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|err| {
                tracing::warn!("Ignoring malformed activity settings: {}", err);
                ActivitySettings::default()
            }),
            None => ActivitySettings::default(),
        }
    }

    pub fn mode(&self) -> NavigationMode {
        self.navigation.mode
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.attempts.filter(|limit| *limit > 0)
    }
}

/// One exercise declared by an activity group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityExercise {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub overrides: Variables,
    /// Inline compiled source, used by generated exercises.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseGroup {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<PeerRole>,
    #[serde(default)]
    pub exercises: Vec<ActivityExercise>,
}

impl ExerciseGroup {
    /// Explicit role tag, falling back to the legacy group-name convention.
    pub fn peer_role(&self, key: &str) -> Option<PeerRole> {
        self.role
            .or_else(|| PeerRole::from_group_name(&self.name))
            .or_else(|| PeerRole::from_group_name(key))
    }
}

/// Typed read of `variables.exerciseGroups`, in declaration order. Malformed
/// groups are skipped; the raw JSON is never rewritten from this view.
pub fn exercise_groups(variables: &Variables) -> Vec<(String, ExerciseGroup)> {
    let Some(Value::Object(groups)) = variables.get("exerciseGroups") else {
        return Vec::new();
    };

    groups
        .iter()
        .filter_map(|(key, value)| {
            match serde_json::from_value::<ExerciseGroup>(value.clone()) {
                Ok(group) => Some((key.clone(), group)),
                Err(err) => {
                    tracing::warn!("Skipping malformed exercise group {}: {}", key, err);
                    None
                }
            }
        })
        .collect()
}

/// Per-exercise progress handed to next-mode scripts.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExerciseMeta {
    pub built: bool,
    pub attempts: u32,
    pub grade: f64,
    pub consumed_hints: u64,
    pub state: ExerciseState,
}

impl Default for ExerciseMeta {
    fn default() -> Self {
        Self {
            built: false,
            attempts: 0,
            grade: super::session::UNGRADED,
            consumed_hints: 0,
            state: ExerciseState::NotStarted,
        }
    }
}
