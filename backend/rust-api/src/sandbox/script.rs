use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::models::{SourceFile, Variables};

use super::{
    parse_result_variables, Sandbox, SandboxError, SandboxInput, SandboxOutput, TIMEOUT_STATUS,
};

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    script: &'a str,
    variables: &'a Variables,
    #[serde(skip_serializing_if = "Option::is_none")]
    envid: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<&'a [SourceFile]>,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    status: i64,
    #[serde(default)]
    variables: Option<serde_json::Value>,
    #[serde(default)]
    envid: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Interpreted-script executor behind a JSON `POST /run` endpoint.
pub struct ScriptSandbox {
    client: Client,
    url: String,
}

impl ScriptSandbox {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to build script sandbox HTTP client")?;
        Ok(Self::with_client(client, url))
    }

    pub fn with_client(client: Client, url: &str) -> Self {
        Self {
            client,
            url: url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Sandbox for ScriptSandbox {
    fn name(&self) -> &str {
        "node"
    }

    async fn run(
        &self,
        input: SandboxInput,
        script: &str,
        timeout: Duration,
    ) -> Result<SandboxOutput, SandboxError> {
        let body = RunRequest {
            script,
            variables: &input.variables,
            envid: input.envid.as_deref(),
            files: input.files.as_deref(),
            timeout_ms: timeout.as_millis() as u64,
        };

        let response = self
            .client
            .post(format!("{}/run", self.url))
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    SandboxError::Timeout(timeout)
                } else {
                    SandboxError::Unknown(format!("Sandbox request failed: {}", err))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SandboxError::Unknown(format!(
                "Sandbox returned HTTP {}: {}",
                status, body
            )));
        }

        let payload: RunResponse = response
            .json()
            .await
            .map_err(|err| SandboxError::Unknown(format!("Malformed sandbox response: {}", err)))?;

        match payload.status {
            0 => Ok(SandboxOutput {
                envid: payload.envid.or(input.envid),
                variables: parse_result_variables(payload.variables)?,
            }),
            TIMEOUT_STATUS => Err(SandboxError::Timeout(timeout)),
            status => Err(SandboxError::Unknown(
                payload
                    .error
                    .unwrap_or_else(|| format!("execution failed with status {}", status)),
            )),
        }
    }
}
