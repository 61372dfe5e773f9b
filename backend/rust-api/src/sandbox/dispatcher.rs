use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{PlayerError, PlayerResult};
use crate::metrics::{SANDBOX_EXECUTIONS_TOTAL, SANDBOX_EXECUTION_DURATION_SECONDS};
use crate::models::{Session, Source, Variables};

use super::{PythonSandbox, Sandbox, SandboxError, SandboxInput, SandboxOutput, ScriptSandbox};

pub type SandboxPredicate = Box<dyn Fn(&Source) -> bool + Send + Sync>;

/// Ordered registry of `(predicate, backend)` pairs. The first predicate that
/// accepts a session's source wins; no match is a configuration error.
pub struct SandboxDispatcher {
    entries: Vec<(SandboxPredicate, Arc<dyn Sandbox>)>,
    timeout: Duration,
}

impl SandboxDispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: Vec::new(),
            timeout,
        }
    }

    /// Registry with the deployed backends: `python` then `node`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let python = PythonSandbox::new(&config.python_sandbox_url)?;
        let script = ScriptSandbox::new(&config.script_sandbox_url)?;

        Ok(Self::new(Duration::from_secs(config.sandbox_timeout_secs))
            .register_tag("python", Arc::new(python))
            .register_tag("node", Arc::new(script)))
    }

    pub fn register<P>(mut self, predicate: P, sandbox: Arc<dyn Sandbox>) -> Self
    where
        P: Fn(&Source) -> bool + Send + Sync + 'static,
    {
        self.entries.push((Box::new(predicate), sandbox));
        self
    }

    /// Registers a backend for sources whose `variables.sandbox` equals `tag`.
    pub fn register_tag(self, tag: &str, sandbox: Arc<dyn Sandbox>) -> Self {
        let tag = tag.to_string();
        self.register(move |source: &Source| source.sandbox_tag() == Some(tag.as_str()), sandbox)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn select(&self, source: &Source) -> PlayerResult<Arc<dyn Sandbox>> {
        self.entries
            .iter()
            .find(|(predicate, _)| predicate(source))
            .map(|(_, sandbox)| sandbox.clone())
            .ok_or_else(|| {
                PlayerError::Configuration(format!(
                    "No sandbox supports backend {:?} (resource {:?})",
                    source.sandbox_tag(),
                    source.resource
                ))
            })
    }

    /// Runs the session against its own variables. Used for first builds and
    /// for rebuilds after the variables were changed in place.
    pub async fn build(&self, session: &Session) -> PlayerResult<SandboxOutput> {
        self.execute(session, Self::input(session, session.variables.clone()), self.timeout)
            .await
    }

    /// Continuation run with a caller-assembled variable bag.
    pub async fn run(&self, session: &Session, variables: Variables) -> PlayerResult<SandboxOutput> {
        self.run_within(session, variables, self.timeout).await
    }

    /// [`run`](Self::run) bounded by `timeout` instead of the configured one.
    pub async fn run_within(
        &self,
        session: &Session,
        variables: Variables,
        timeout: Duration,
    ) -> PlayerResult<SandboxOutput> {
        self.execute(session, Self::input(session, variables), timeout)
            .await
    }

    /// Source files travel only when no provisioned environment can be reused.
    fn input(session: &Session, variables: Variables) -> SandboxInput {
        let envid = session.reusable_envid().map(str::to_string);
        let files = if envid.is_some() {
            None
        } else {
            Some(session.source.files.clone())
        };

        SandboxInput {
            variables,
            files,
            envid,
        }
    }

    async fn execute(
        &self,
        session: &Session,
        input: SandboxInput,
        timeout: Duration,
    ) -> PlayerResult<SandboxOutput> {
        let sandbox = self.select(&session.source)?;
        let backend = sandbox.name().to_string();
        let start = Instant::now();

        tracing::debug!(
            "Running session {} on sandbox {} (envid={:?}, timeout={:?})",
            session.id,
            backend,
            input.envid,
            timeout
        );

        let result = match tokio::time::timeout(
            timeout,
            sandbox.run(input, &session.source.script, timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SandboxError::Timeout(timeout)),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(SandboxError::Timeout(_)) => "timeout",
            Err(SandboxError::Unknown(_)) => "unknown",
        };
        SANDBOX_EXECUTIONS_TOTAL
            .with_label_values(&[backend.as_str(), outcome])
            .inc();
        SANDBOX_EXECUTION_DURATION_SECONDS
            .with_label_values(&[backend.as_str()])
            .observe(start.elapsed().as_secs_f64());

        match &result {
            Err(SandboxError::Timeout(d)) => tracing::warn!(
                "Sandbox {} timed out after {:?} for session {}",
                backend,
                d,
                session.id
            ),
            Err(SandboxError::Unknown(detail)) => tracing::error!(
                "Sandbox {} failed for session {}: {}",
                backend,
                session.id,
                detail
            ),
            Ok(_) => {}
        }

        result.map_err(PlayerError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        name: &'static str,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Echo {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Sandbox for Echo {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(
            &self,
            input: SandboxInput,
            _script: &str,
            _timeout: Duration,
        ) -> Result<SandboxOutput, SandboxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let mut variables = input.variables;
            variables.insert("backend".into(), json!(self.name));
            variables.insert("hadFiles".into(), json!(input.files.is_some()));
            Ok(SandboxOutput {
                envid: Some(input.envid.unwrap_or_else(|| format!("{}-env", self.name))),
                variables,
            })
        }
    }

    fn session(tag: &str) -> Session {
        let source = Source {
            kind: Default::default(),
            resource: Some("r".into()),
            version: None,
            script: "pass".into(),
            variables: json!({ "sandbox": tag }).as_object().cloned().unwrap(),
            files: Vec::new(),
        };
        let variables = source.variables.clone();
        Session::new("s1".into(), None, None, source, variables)
    }

    #[tokio::test]
    async fn first_matching_backend_wins() {
        let first = Arc::new(Echo::new("first"));
        let second = Arc::new(Echo::new("second"));
        let dispatcher = SandboxDispatcher::new(Duration::from_secs(1))
            .register_tag("python", first.clone())
            .register(|_| true, second.clone());

        let output = dispatcher.build(&session("python")).await.unwrap();
        assert_eq!(output.variables["backend"], "first");
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);

        let output = dispatcher.build(&session("node")).await.unwrap();
        assert_eq!(output.variables["backend"], "second");
    }

    #[tokio::test]
    async fn unmatched_backend_is_configuration_error() {
        let dispatcher = SandboxDispatcher::new(Duration::from_secs(1))
            .register_tag("python", Arc::new(Echo::new("python")));

        let err = dispatcher.build(&session("cobol")).await.unwrap_err();
        assert!(matches!(err, PlayerError::Configuration(_)));
    }

    #[tokio::test]
    async fn slow_backend_reports_timeout() {
        let mut slow = Echo::new("slow");
        slow.delay = Duration::from_millis(200);
        let dispatcher = SandboxDispatcher::new(Duration::from_millis(20))
            .register_tag("python", Arc::new(slow));

        let err = dispatcher.build(&session("python")).await.unwrap_err();
        assert!(matches!(err, PlayerError::SandboxTimeout(_)));
    }

    #[tokio::test]
    async fn per_call_timeout_overrides_the_configured_one() {
        let mut slow = Echo::new("slow");
        slow.delay = Duration::from_millis(200);
        let dispatcher = SandboxDispatcher::new(Duration::from_secs(5))
            .register_tag("python", Arc::new(slow));
        let target = session("python");

        let bound = Duration::from_millis(20);
        let err = dispatcher
            .run_within(&target, target.variables.clone(), bound)
            .await
            .unwrap_err();
        assert!(matches!(err, PlayerError::SandboxTimeout(d) if d == bound));

        let output = dispatcher
            .run_within(&target, target.variables.clone(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(output.variables["backend"], "slow");
    }

    #[tokio::test]
    async fn rebuild_reuses_environment_without_files() {
        let dispatcher = SandboxDispatcher::new(Duration::from_secs(1))
            .register_tag("python", Arc::new(Echo::new("python")));

        let mut built = session("python");
        built.is_built = true;
        built.envid = Some("env-42".into());

        let output = dispatcher.build(&built).await.unwrap();
        assert_eq!(output.envid.as_deref(), Some("env-42"));
        assert_eq!(output.variables["hadFiles"], false);

        let output = dispatcher.build(&session("python")).await.unwrap();
        assert_eq!(output.variables["hadFiles"], true);
    }
}
