//! Execution backends for session scripts.
//!
//! A backend receives a script, the variable bag and optionally an environment
//! handle from a previous run, and answers with the updated bag and the handle
//! to reuse next time. The [`SandboxDispatcher`] picks the backend for a
//! session and enforces the wall-clock timeout.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{SourceFile, Variables};

pub mod dispatcher;
pub mod python;
pub mod script;

pub use dispatcher::SandboxDispatcher;
pub use python::PythonSandbox;
pub use script::ScriptSandbox;

/// Status a remote executor reports when the run exceeded its time budget.
pub const TIMEOUT_STATUS: i64 = -2;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SandboxError {
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Unknown(String),
}

#[derive(Debug, Clone, Default)]
pub struct SandboxInput {
    pub variables: Variables,
    /// Files needed to assemble the environment; only sent on a first build.
    pub files: Option<Vec<SourceFile>>,
    pub envid: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SandboxOutput {
    pub envid: Option<String>,
    pub variables: Variables,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Backend name for logs and metrics.
    fn name(&self) -> &str;

    async fn run(
        &self,
        input: SandboxInput,
        script: &str,
        timeout: Duration,
    ) -> Result<SandboxOutput, SandboxError>;
}

/// Turns a remote `result` field into a variable bag. Executors return either
/// an object or a JSON document serialised as a string.
pub(crate) fn parse_result_variables(
    result: Option<serde_json::Value>,
) -> Result<Variables, SandboxError> {
    match result {
        Some(serde_json::Value::Object(map)) => Ok(map),
        Some(serde_json::Value::String(raw)) => serde_json::from_str::<Variables>(&raw)
            .map_err(|err| SandboxError::Unknown(format!("Malformed execution result: {}", err))),
        Some(serde_json::Value::Null) | None => Err(SandboxError::Unknown(
            "Execution succeeded without a result".to_string(),
        )),
        Some(other) => Err(SandboxError::Unknown(format!(
            "Unexpected execution result type: {}",
            other
        ))),
    }
}
