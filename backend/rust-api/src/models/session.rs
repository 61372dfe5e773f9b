use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Variables;

/// Grade stored on a session that has never been graded.
pub const UNGRADED: f64 = -1.0;

/// Grade at or above which an answer counts as correct.
pub const SUCCESS_GRADE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Exercise,
    Activity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

/// Compiled script produced by the resource compiler.
///
/// The backend tag lives in `variables.sandbox`; everything else in the bag is
/// the initial state handed to the first build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub script: String,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<SourceFile>,
}

impl Source {
    pub fn sandbox_tag(&self) -> Option<&str> {
        self.variables.get("sandbox").and_then(Value::as_str)
    }

    pub fn is_activity(&self) -> bool {
        self.kind == SourceKind::Activity
    }

    pub fn title(&self) -> Option<&str> {
        self.variables.get("title").and_then(Value::as_str)
    }
}

/// One persisted execution context for an exercise or an activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub envid: Option<String>,
    #[serde(default)]
    pub variables: Variables,
    pub source: Source,
    pub grade: f64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_graded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_built: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped on every write; guards read-modify-write of activity rows.
    #[serde(default)]
    pub version: i64,
    #[serde(skip)]
    pub parent: Option<Box<Session>>,
}

impl Session {
    pub fn new(
        id: String,
        user_id: Option<String>,
        parent_id: Option<String>,
        source: Source,
        variables: Variables,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            parent_id,
            user_id,
            envid: None,
            variables,
            source,
            grade: UNGRADED,
            attempts: 0,
            started_at: None,
            last_graded_at: None,
            is_built: false,
            created_at: now,
            updated_at: now,
            version: 0,
            parent: None,
        }
    }

    pub fn is_activity(&self) -> bool {
        self.source.is_activity()
    }

    /// Preview sessions have neither an owning activity nor an owner.
    pub fn is_preview(&self) -> bool {
        self.parent_id.is_none() && self.user_id.is_none()
    }

    /// Environment handle to present to a sandbox; a never-built session has none.
    pub fn reusable_envid(&self) -> Option<&str> {
        if self.is_built {
            self.envid.as_deref()
        } else {
            None
        }
    }

    pub fn title(&self) -> String {
        self.variables
            .get("title")
            .and_then(Value::as_str)
            .or_else(|| self.source.title())
            .unwrap_or("")
            .to_string()
    }

    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id.as_deref() == Some(user_id)
    }

    /// Number of hints the script reports as consumed.
    pub fn consumed_hints(&self) -> u64 {
        self.variables
            .get("hints")
            .and_then(|hints| hints.get("consumed"))
            .and_then(|consumed| {
                consumed
                    .as_u64()
                    .or_else(|| consumed.as_array().map(|list| list.len() as u64))
            })
            .unwrap_or(0)
    }
}

/// Partial update applied by the session store; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionChanges {
    pub envid: Option<String>,
    pub variables: Option<Variables>,
    pub source_variables: Option<Variables>,
    pub grade: Option<f64>,
    pub attempts: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_graded_at: Option<DateTime<Utc>>,
    pub is_built: Option<bool>,
}

impl SessionChanges {
    pub fn is_empty(&self) -> bool {
        self.envid.is_none()
            && self.variables.is_none()
            && self.source_variables.is_none()
            && self.grade.is_none()
            && self.attempts.is_none()
            && self.started_at.is_none()
            && self.last_graded_at.is_none()
            && self.is_built.is_none()
    }

    /// Applies the changes to an in-memory copy, mirroring what the store persists.
    pub fn apply_to(&self, session: &mut Session) {
        if let Some(envid) = &self.envid {
            session.envid = Some(envid.clone());
        }
        if let Some(variables) = &self.variables {
            session.variables = variables.clone();
        }
        if let Some(variables) = &self.source_variables {
            session.source.variables = variables.clone();
        }
        if let Some(grade) = self.grade {
            session.grade = grade;
        }
        if let Some(attempts) = self.attempts {
            session.attempts = attempts;
        }
        if let Some(started_at) = self.started_at {
            session.started_at = Some(started_at);
        }
        if let Some(last_graded_at) = self.last_graded_at {
            session.last_graded_at = Some(last_graded_at);
        }
        if let Some(is_built) = self.is_built {
            session.is_built = is_built;
        }
        session.updated_at = Utc::now();
        session.version += 1;
    }
}
