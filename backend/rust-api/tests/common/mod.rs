#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;

use player_engine::config::Config;
use player_engine::create_router;
use player_engine::middlewares::auth::{JwtClaims, JwtService};
use player_engine::models::{PlayerExercise, Source, SourceKind, TerminationReason, Variables};
use player_engine::sandbox::{Sandbox, SandboxDispatcher, SandboxError, SandboxInput, SandboxOutput};
use player_engine::services::activity_lock::LocalActivityLock;
use player_engine::services::notifier::{LoggingNotifier, PlayerNotifier};
use player_engine::services::peer_service::InMemoryPeerService;
use player_engine::services::resource_compiler::{ResourceCompiler, ResourceRef};
use player_engine::services::session_store::InMemorySessionStore;
use player_engine::services::AppState;

pub const TEST_SECRET: &str = "test-secret";

/// Script behaviour: receives the script name and the input bag, answers with
/// the output bag.
pub type Behaviour = dyn Fn(&str, &Variables) -> Result<Variables, SandboxError> + Send + Sync;

/// Sandbox whose scripts are Rust closures. Counts runs per script.
pub struct ScriptedSandbox {
    behaviour: Box<Behaviour>,
    runs: Mutex<HashMap<String, usize>>,
}

impl ScriptedSandbox {
    pub fn new<F>(behaviour: F) -> Self
    where
        F: Fn(&str, &Variables) -> Result<Variables, SandboxError> + Send + Sync + 'static,
    {
        Self {
            behaviour: Box::new(behaviour),
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn runs(&self, script: &str) -> usize {
        self.runs.lock().unwrap().get(script).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn run(
        &self,
        input: SandboxInput,
        script: &str,
        _timeout: Duration,
    ) -> Result<SandboxOutput, SandboxError> {
        *self
            .runs
            .lock()
            .unwrap()
            .entry(script.to_string())
            .or_insert(0) += 1;

        let variables = (self.behaviour)(script, &input.variables)?;
        Ok(SandboxOutput {
            envid: input.envid.or_else(|| Some(format!("env-{}", script))),
            variables,
        })
    }
}

/// Compiler serving a fixed set of sources.
#[derive(Default)]
pub struct StaticCompiler {
    sources: HashMap<String, Source>,
    previewable: Vec<String>,
}

impl StaticCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: &str, source: Source) -> Self {
        self.sources.insert(id.to_string(), source);
        self
    }

    pub fn previewable(mut self, id: &str) -> Self {
        self.previewable.push(id.to_string());
        self
    }
}

#[async_trait]
impl ResourceCompiler for StaticCompiler {
    async fn compile(&self, resource: &ResourceRef, overrides: &Variables) -> Result<Option<Source>> {
        Ok(self.sources.get(&resource.id).cloned().map(|mut source| {
            source.resource = Some(resource.id.clone());
            source.version = resource.version.clone();
            for (key, value) in overrides {
                source.variables.insert(key.clone(), value.clone());
            }
            source
        }))
    }

    async fn get_title(&self, resource: &ResourceRef) -> Result<Option<String>> {
        Ok(self
            .sources
            .get(&resource.id)
            .and_then(|source| source.title().map(str::to_string)))
    }

    async fn is_previewable(&self, resource: &ResourceRef) -> Result<bool> {
        Ok(self.previewable.contains(&resource.id))
    }
}

/// Logs like the default notifier and remembers terminations.
#[derive(Default)]
pub struct RecordingNotifier {
    inner: LoggingNotifier,
    terminations: Mutex<Vec<(String, TerminationReason)>>,
}

impl RecordingNotifier {
    pub fn terminations(&self) -> Vec<(String, TerminationReason)> {
        self.terminations.lock().unwrap().clone()
    }
}

#[async_trait]
impl PlayerNotifier for RecordingNotifier {
    async fn notify_exercise_changes(
        &self,
        user_id: &str,
        session_id: &str,
        exercise: &PlayerExercise,
    ) -> Result<()> {
        self.inner.notify_exercise_changes(user_id, session_id, exercise).await
    }

    async fn on_challenge_succeeded(&self, user_id: Option<&str>, activity_session_id: &str) -> Result<()> {
        self.inner.on_challenge_succeeded(user_id, activity_session_id).await
    }

    async fn on_terminate(
        &self,
        user_id: Option<&str>,
        activity_session_id: &str,
        reason: TerminationReason,
    ) -> Result<()> {
        self.terminations
            .lock()
            .unwrap()
            .push((activity_session_id.to_string(), reason));
        self.inner.on_terminate(user_id, activity_session_id, reason).await
    }
}

pub struct TestApp {
    pub router: Router,
    pub sessions: Arc<InMemorySessionStore>,
    pub peers: Arc<InMemoryPeerService>,
    pub sandbox: Arc<ScriptedSandbox>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn create_test_app(compiler: StaticCompiler, sandbox: ScriptedSandbox) -> TestApp {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let sessions = Arc::new(InMemorySessionStore::new());
    let peers = Arc::new(InMemoryPeerService::new());
    let sandbox = Arc::new(sandbox);
    let notifier = Arc::new(RecordingNotifier::default());
    let sandboxes = SandboxDispatcher::new(Duration::from_secs(5)).register_tag("test", sandbox.clone());

    let state = AppState::from_parts(
        Config::local(TEST_SECRET),
        sessions.clone(),
        peers.clone(),
        Arc::new(compiler),
        Arc::new(sandboxes),
        Arc::new(LocalActivityLock::new()),
        notifier.clone(),
    );

    TestApp {
        router: create_router(Arc::new(state)),
        sessions,
        peers,
        sandbox,
        notifier,
    }
}

pub fn exercise(script: &str, variables: Value) -> Source {
    let mut variables = variables.as_object().cloned().unwrap_or_default();
    variables
        .entry("sandbox")
        .or_insert_with(|| Value::String("test".into()));
    Source {
        kind: SourceKind::Exercise,
        resource: None,
        version: None,
        script: script.to_string(),
        variables,
        files: Vec::new(),
    }
}

pub fn activity(script: &str, variables: Value) -> Source {
    Source {
        kind: SourceKind::Activity,
        ..exercise(script, variables)
    }
}

pub fn token(user_id: &str) -> String {
    let now = Utc::now().timestamp() as usize;
    JwtService::new(TEST_SECRET)
        .generate_token(JwtClaims {
            sub: user_id.to_string(),
            role: "learner".to_string(),
            group_ids: Vec::new(),
            exp: now + 3600,
            iat: now,
        })
        .unwrap()
}

pub async fn post_json(app: &TestApp, uri: &str, user: Option<&str>, body: Value) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(user) = user {
        request = request.header("authorization", format!("Bearer {}", token(user)));
    }

    let response = app
        .router
        .clone()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

pub async fn play_activity(app: &TestApp, user: &str, activity_id: &str) -> (StatusCode, Value) {
    post_json(
        app,
        "/player/play/activity",
        Some(user),
        json!({ "activityId": activity_id }),
    )
    .await
}

pub async fn evaluate(
    app: &TestApp,
    user: Option<&str>,
    session_id: &str,
    action: &str,
    answers: Value,
) -> (StatusCode, Value) {
    post_json(
        app,
        "/player/evaluate",
        user,
        json!({ "sessionId": session_id, "action": action, "answers": answers }),
    )
    .await
}

/// Input bag echoed back with `extra` merged in.
pub fn echo(input: &Variables, extra: Value) -> Variables {
    let mut output = input.clone();
    if let Value::Object(extra) = extra {
        for (key, value) in extra {
            output.insert(key, value);
        }
    }
    output
}

pub fn is_check(input: &Variables) -> bool {
    input.get("action").and_then(Value::as_str) == Some("CHECK_ANSWER")
}
