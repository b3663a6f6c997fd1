//! `exec` capability: runs a shell command in a fresh sandbox.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{
    Action, Capability, CapabilityError, CapabilityRequest, CapabilityResponse, ErrorCode, Field,
    FieldType, Schema,
};
use crate::sandbox::{Command, Runtime, SandboxConfig, SandboxError, SandboxLease};

#[derive(Deserialize)]
struct RunParams {
    cmd: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

/// Each `run` creates a sandbox on the runtime, executes `sh -lc <cmd>`
/// in it and destroys it again.
pub struct ExecCapability {
    runtime: Arc<dyn Runtime>,
    config: SandboxConfig,
    languages: BTreeSet<String>,
}

impl ExecCapability {
    pub fn new<I, S>(runtime: Arc<dyn Runtime>, config: SandboxConfig, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            runtime,
            config,
            languages: languages
                .into_iter()
                .map(|l| l.into().to_lowercase())
                .collect(),
        }
    }

    async fn run(&self, params: RunParams, request: &CapabilityRequest) -> anyhow::Result<CapabilityResponse> {
        if let Some(language) = params.language.as_deref().filter(|l| !l.is_empty()) {
            if !self.languages.contains(&language.to_lowercase()) {
                return Ok(CapabilityResponse::fail(
                    ErrorCode::LanguageNotAllowed,
                    format!("language '{language}' is not allowed"),
                ));
            }
        }
        if params.cmd.trim().is_empty() {
            return Ok(CapabilityResponse::fail(ErrorCode::MissingCmd, "cmd is required"));
        }

        let lease = SandboxLease::acquire(Arc::clone(&self.runtime), self.config.clone()).await?;
        let sandbox_id = lease.sandbox().id().to_string();

        let mut command = Command::shell(params.cmd.as_str());
        command.env = params.env;
        command.timeout = request.timeout;
        debug!(
            "exec for agent {} in sandbox {}: {}",
            request.agent_id(),
            sandbox_id,
            params.cmd
        );

        let outcome = lease.sandbox().exec(&command).await;
        lease.release().await;

        let result = match outcome {
            Ok(result) => result,
            Err(e @ SandboxError::Spawn { .. }) => {
                return Ok(CapabilityResponse::fail(ErrorCode::ExecFailed, e.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let data = json!({
            "sandbox_id": sandbox_id,
            "exit_code": result.exit_code,
            "stdout": result.stdout,
            "stderr": result.stderr,
            "duration_ms": u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            "timed_out": result.timed_out,
        });
        if result.success() {
            return Ok(CapabilityResponse::ok(data));
        }
        let message = if result.timed_out {
            format!("command timed out after {:?}", result.duration)
        } else {
            format!("command exited with status {}", result.exit_code)
        };
        Ok(CapabilityResponse::failure_with_data(
            CapabilityError::new(ErrorCode::ExecFailed, message),
            data,
        ))
    }
}

#[async_trait]
impl Capability for ExecCapability {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute shell commands inside a sandbox"
    }

    fn schema(&self) -> Schema {
        Schema::new().action(
            Action::new("run", "Run a shell command")
                .field("cmd", Field::required(FieldType::String, "Command line, run with sh -lc"))
                .field("language", Field::optional(FieldType::String, "Language tag checked against the allowlist"))
                .field("env", Field::optional(FieldType::Object, "Extra environment variables"))
                .output("exit_code", Field::required(FieldType::Integer, "Exit status"))
                .output("stdout", Field::required(FieldType::String, "Captured stdout"))
                .output("stderr", Field::required(FieldType::String, "Captured stderr")),
        )
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        self.runtime.health_check().await?;
        Ok(())
    }

    async fn execute(&self, request: &CapabilityRequest) -> anyhow::Result<CapabilityResponse> {
        match request.action.as_str() {
            "run" => match request.params::<RunParams>() {
                Ok(params) => self.run(params, request).await,
                Err(e) => Ok(e.into()),
            },
            other => Ok(CapabilityResponse::fail(ErrorCode::InvalidAction, other)),
        }
    }
}
