use std::io::{self, Write};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use flate2::{write::GzEncoder, Compression};
use reqwest::{multipart, Client};
use serde::{Deserialize, Serialize};

use crate::models::{SourceFile, Variables};

use super::{
    parse_result_variables, Sandbox, SandboxError, SandboxInput, SandboxOutput, TIMEOUT_STATUS,
};

const SCRIPT_PATH: &str = "script.py";
const RUNNER_PATH: &str = "runner.py";
const VARIABLES_PATH: &str = "variables.json";
const RESULT_PATH: &str = "result.json";

/// Loads the variable bag as the script's globals, executes the script and
/// dumps every JSON-serialisable global back out.
const RUNNER: &str = r#"import json
import sys


def main(script_path, variables_path, result_path):
    with open(variables_path) as handle:
        scope = json.load(handle)
    with open(script_path) as handle:
        code = compile(handle.read(), script_path, "exec")
    exec(code, scope)

    result = {}
    for key, value in scope.items():
        if key.startswith("__"):
            continue
        try:
            json.dumps(value)
        except (TypeError, ValueError):
            continue
        result[key] = value

    with open(result_path, "w") as handle:
        json.dump(result, handle)


if __name__ == "__main__":
    main(*sys.argv[1:4])
"#;

#[derive(Debug, Serialize)]
struct RunConfig {
    save: bool,
    commands: Vec<String>,
    result_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    environment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    status: i64,
    #[serde(default)]
    execution: Vec<CommandOutcome>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    environment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommandOutcome {
    #[serde(default)]
    exit_code: i64,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

/// Remote isolated-process executor speaking the `/execute/` multipart protocol.
pub struct PythonSandbox {
    client: Client,
    url: String,
}

impl PythonSandbox {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to build python sandbox HTTP client")?;
        Ok(Self::with_client(client, url))
    }

    pub fn with_client(client: Client, url: &str) -> Self {
        Self {
            client,
            url: url.trim_end_matches('/').to_string(),
        }
    }

    fn run_config(envid: Option<String>) -> RunConfig {
        RunConfig {
            save: true,
            commands: vec![format!(
                "python3 {} {} {} {}",
                RUNNER_PATH, SCRIPT_PATH, VARIABLES_PATH, RESULT_PATH
            )],
            result_path: RESULT_PATH.to_string(),
            environment: envid,
        }
    }

    fn interpret(response: ExecuteResponse, timeout: Duration) -> Result<SandboxOutput, SandboxError> {
        match response.status {
            0 => {
                let variables = parse_result_variables(response.result)?;
                Ok(SandboxOutput {
                    envid: response.environment,
                    variables,
                })
            }
            TIMEOUT_STATUS => Err(SandboxError::Timeout(timeout)),
            status => {
                let detail = response
                    .execution
                    .first()
                    .map(|command| {
                        if command.stderr.is_empty() {
                            format!("exit code {}: {}", command.exit_code, command.stdout)
                        } else {
                            command.stderr.clone()
                        }
                    })
                    .unwrap_or_else(|| format!("execution failed with status {}", status));
                Err(SandboxError::Unknown(detail))
            }
        }
    }
}

#[async_trait]
impl Sandbox for PythonSandbox {
    fn name(&self) -> &str {
        "python"
    }

    async fn run(
        &self,
        input: SandboxInput,
        script: &str,
        timeout: Duration,
    ) -> Result<SandboxOutput, SandboxError> {
        let archive = build_archive(script, &input.variables, input.files.as_deref())
            .map_err(|err| SandboxError::Unknown(format!("Failed to package environment: {}", err)))?;

        let config = serde_json::to_string(&Self::run_config(input.envid))
            .map_err(|err| SandboxError::Unknown(format!("Failed to encode run config: {}", err)))?;

        let environment = multipart::Part::bytes(archive)
            .file_name("environment.tgz")
            .mime_str("application/gzip")
            .map_err(|err| SandboxError::Unknown(err.to_string()))?;

        let form = multipart::Form::new()
            .text("config", config)
            .part("environment", environment);

        let url = format!("{}/execute/", self.url);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| transport_error(err, timeout))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(SandboxError::Unknown(format!(
                "Sandbox returned HTTP {}: {}",
                status, body
            )));
        }

        let payload: ExecuteResponse = response
            .json()
            .await
            .map_err(|err| transport_error(err, timeout))?;

        Self::interpret(payload, timeout)
    }
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> SandboxError {
    if err.is_timeout() {
        SandboxError::Timeout(timeout)
    } else {
        SandboxError::Unknown(format!("Sandbox request failed: {}", err))
    }
}

/// Packs the script, the runner stub, the variable bag and any source files
/// into one gzip-compressed tarball.
pub(crate) fn build_archive(
    script: &str,
    variables: &Variables,
    files: Option<&[SourceFile]>,
) -> io::Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let variables = serde_json::to_vec(variables)?;
    append_entry(&mut builder, SCRIPT_PATH, script.as_bytes())?;
    append_entry(&mut builder, RUNNER_PATH, RUNNER.as_bytes())?;
    append_entry(&mut builder, VARIABLES_PATH, &variables)?;

    for file in files.unwrap_or_default() {
        append_entry(&mut builder, &file.path, file.content.as_bytes())?;
    }

    builder.into_inner()?.finish()
}

fn append_entry<W: Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8]) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data)
}
