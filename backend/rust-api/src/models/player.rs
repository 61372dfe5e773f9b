use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use super::navigation::{ExerciseState, Navigation, NavigationExercise, NavigationMode};
use super::session::{Session, Source};
use super::Variables;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerAction {
    CheckAnswer,
    RerollExercise,
    ShowSolution,
    NextHint,
}

impl PlayerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerAction::CheckAnswer => "CHECK_ANSWER",
            PlayerAction::RerollExercise => "REROLL_EXERCISE",
            PlayerAction::ShowSolution => "SHOW_SOLUTION",
            PlayerAction::NextHint => "NEXT_HINT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    #[default]
    Explicit,
    Timeout,
    LoseFocus,
    LeavePage,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Explicit => "explicit",
            TerminationReason::Timeout => "timeout",
            TerminationReason::LoseFocus => "lose-focus",
            TerminationReason::LeavePage => "leave-page",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavigationCommand {
    Next,
    Previous,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PlayActivityRequest {
    #[validate(length(min = 1))]
    pub activity_session_id: Option<String>,
    #[validate(length(min = 1))]
    pub activity_id: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub overrides: Variables,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PlayExercisesRequest {
    #[validate(length(min = 1))]
    pub activity_session_id: String,
    #[serde(default)]
    pub exercise_session_ids: Vec<String>,
    #[serde(default)]
    pub navigation: Option<NavigationCommand>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateRequest {
    #[validate(length(min = 1))]
    pub session_id: String,
    pub action: PlayerAction,
    #[serde(default)]
    pub answers: Variables,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminateRequest {
    #[serde(default)]
    pub reason: TerminationReason,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    #[validate(length(min = 1))]
    pub resource: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub overrides: Variables,
    pub source: Option<Source>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerExercise {
    pub session_id: String,
    pub activity_session_id: Option<String>,
    pub title: String,
    pub state: Option<ExerciseState>,
    pub grade: f64,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_graded_at: Option<DateTime<Utc>>,
    pub variables: Variables,
}

impl PlayerExercise {
    /// View of an exercise session. `entry` is its navigation entry, taken
    /// from the full navigation so pooled peer exercises keep their state; it
    /// also supplies the group-declared title when the script sets none.
    pub fn from_session(session: &Session, entry: Option<&NavigationExercise>) -> Self {
        let title = Some(session.title())
            .filter(|title| !title.is_empty())
            .or_else(|| entry.map(|entry| entry.title.clone()))
            .unwrap_or_default();
        Self {
            session_id: session.id.clone(),
            activity_session_id: session.parent_id.clone(),
            title,
            state: entry.map(|entry| entry.state),
            grade: session.grade,
            attempts: session.attempts,
            started_at: session.started_at,
            last_graded_at: session.last_graded_at,
            variables: session.variables.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerActivity {
    pub session_id: String,
    pub title: String,
    pub mode: NavigationMode,
    pub grade: f64,
    pub navigation: Navigation,
    pub has_next: bool,
    pub has_previous: bool,
    pub exercises: Vec<PlayerExercise>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayExercisesResponse {
    pub exercises: Vec<PlayerExercise>,
    pub navigation: Navigation,
    pub has_next: bool,
    pub has_previous: bool,
}

/// Hint for the client to advance on its own after a short delay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoNext {
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResponse {
    pub exercise: PlayerExercise,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub navigation: Option<Navigation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_next: Option<AutoNext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_exercise: Option<PlayerExercise>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum PreviewResponse {
    Activity(PlayerActivity),
    Exercise(PlayerExercise),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PeerRole, SourceKind};
    use serde_json::json;

    fn session(variables: serde_json::Value) -> Session {
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

    fn entry(title: &str, state: ExerciseState) -> NavigationExercise {
        NavigationExercise {
            id: "e1".into(),
            title: title.into(),
            state,
            session_id: "s1".into(),
            role: Some(PeerRole::Training),
        }
    }

    #[test]
    fn group_title_and_state_come_from_the_entry() {
        let view = PlayerExercise::from_session(
            &session(json!({})),
            Some(&entry("Training", ExerciseState::Started)),
        );
        assert_eq!(view.title, "Training");
        assert_eq!(view.state, Some(ExerciseState::Started));
    }

    #[test]
    fn script_title_wins_over_the_group_title() {
        let view = PlayerExercise::from_session(
            &session(json!({ "title": "Fractions" })),
            Some(&entry("Training", ExerciseState::NotStarted)),
        );
        assert_eq!(view.title, "Fractions");

        let bare = PlayerExercise::from_session(&session(json!({})), None);
        assert_eq!(bare.title, "");
        assert_eq!(bare.state, None);
    }
}
