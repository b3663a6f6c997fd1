//! Capabilities: uniform, schema-described action executors.
//!
//! Every agent-requested action goes through a `Capability`. Callers
//! build a `CapabilityRequest`, dispatch it through a `Registry`, and
//! read back a `CapabilityResponse`.
//!
//! Failures come in two tiers:
//!
//! - **transport**: the call itself could not be made (empty action,
//!   unknown capability, resolver misconfigured). Returned as `Err`.
//! - **domain**: the action ran and was refused or failed (blocked by
//!   policy, file missing, command failed). Returned as
//!   `Ok(CapabilityResponse::failure(..))` with a stable `ErrorCode`.

pub mod browser;
pub mod builtin;
pub mod exec;
pub mod fs;
pub mod mcp;
pub mod memory;
pub mod net;
pub mod registry;
pub mod schema;
pub mod secrets;
pub mod tools;

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub use builtin::build_registry;
pub use registry::{CapabilityHealth, Registry, RegistryError};
pub use schema::{Action, Field, FieldType, Schema};

/// Slack granted past `request.timeout` before `invoke` gives up. Larger
/// than the sandbox kill grace so a killed command still reports its output.
pub const TIMEOUT_GRACE: Duration = Duration::from_secs(5);

// ── Request ──────────────────────────────────────────────

/// Who is asking, for logging and auditing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl ExecutionContext {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// One action invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityRequest {
    pub action: String,
    /// JSON object of parameters. `Null` is treated as `{}`.
    pub params: Value,
    pub context: Option<ExecutionContext>,
    pub timeout: Option<Duration>,
}

impl CapabilityRequest {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params: Value::Object(Default::default()),
            context: None,
            timeout: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Deserializes the parameters into an action's typed struct.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, CapabilityError> {
        let params = match &self.params {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(params).map_err(|e| {
            CapabilityError::new(
                ErrorCode::InvalidParams,
                format!("{}: {e}", self.action),
            )
        })
    }

    pub fn agent_id(&self) -> &str {
        self.context
            .as_ref()
            .map(|c| c.agent_id.as_str())
            .unwrap_or("-")
    }
}

// ── Response ─────────────────────────────────────────────

/// Stable machine-readable failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidAction,
    InvalidRequest,
    InvalidParams,
    MissingCmd,
    MissingPath,
    LanguageNotAllowed,
    AccessDenied,
    ExecFailed,
    Blocked,
    DnsFailed,
    HttpFailed,
    InvalidUrl,
    NotFound,
    NoHandler,
    InvokeFailed,
    KvGetFailed,
    KvSetFailed,
    VectorPutFailed,
    VectorSearchFailed,
    ReadFailed,
    WriteFailed,
    CopyFailed,
    ResolveFailed,
    McpFailed,
    Timeout,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidAction => "invalid_action",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::InvalidParams => "invalid_params",
            ErrorCode::MissingCmd => "missing_cmd",
            ErrorCode::MissingPath => "missing_path",
            ErrorCode::LanguageNotAllowed => "language_not_allowed",
            ErrorCode::AccessDenied => "access_denied",
            ErrorCode::ExecFailed => "exec_failed",
            ErrorCode::Blocked => "blocked",
            ErrorCode::DnsFailed => "dns_failed",
            ErrorCode::HttpFailed => "http_failed",
            ErrorCode::InvalidUrl => "invalid_url",
            ErrorCode::NotFound => "not_found",
            ErrorCode::NoHandler => "no_handler",
            ErrorCode::InvokeFailed => "invoke_failed",
            ErrorCode::KvGetFailed => "kv_get_failed",
            ErrorCode::KvSetFailed => "kv_set_failed",
            ErrorCode::VectorPutFailed => "vector_put_failed",
            ErrorCode::VectorSearchFailed => "vector_search_failed",
            ErrorCode::ReadFailed => "read_failed",
            ErrorCode::WriteFailed => "write_failed",
            ErrorCode::CopyFailed => "copy_failed",
            ErrorCode::ResolveFailed => "resolve_failed",
            ErrorCode::McpFailed => "mcp_failed",
            ErrorCode::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain-level failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityError {
    pub code: ErrorCode,
    pub message: String,
}

impl CapabilityError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CapabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CapabilityError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub duration_ms: u64,
}

impl ExecutionMetrics {
    pub fn since(started: Instant) -> Self {
        Self {
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Outcome of one invocation.
///
/// `success` holds exactly when `error` is absent; the fields are private
/// so only the constructors below can build one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<CapabilityError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<ExecutionMetrics>,
}

impl CapabilityResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metrics: None,
        }
    }

    pub fn failure(error: CapabilityError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            metrics: None,
        }
    }

    /// Shorthand for `failure(CapabilityError::new(code, message))`.
    pub fn fail(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::failure(CapabilityError::new(code, message))
    }

    /// A failure that still carries partial output (e.g. a failed command's stdout).
    pub fn failure_with_data(error: CapabilityError, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::failure(error)
        }
    }

    pub fn with_metrics(mut self, metrics: ExecutionMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    pub fn into_data(self) -> Option<Value> {
        self.data
    }

    pub fn error(&self) -> Option<&CapabilityError> {
        self.error.as_ref()
    }

    /// The failure code, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }

    pub fn metrics(&self) -> Option<ExecutionMetrics> {
        self.metrics
    }
}

impl From<CapabilityError> for CapabilityResponse {
    fn from(error: CapabilityError) -> Self {
        Self::failure(error)
    }
}

// ── Capability trait ─────────────────────────────────────

/// A uniform action executor.
///
/// Implementors provide `schema()` and `execute()`; callers go through
/// `invoke()`, which validates the request against the schema, bounds
/// execution time and stamps metrics before `execute` sees it.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Registry key (matched case-insensitively).
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "v1"
    }

    fn description(&self) -> &str;

    /// Applies capability-specific settings. Called once before use.
    async fn initialize(&self, _config: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Declared actions and their input fields.
    fn schema(&self) -> Schema;

    /// Runs an already-validated request.
    async fn execute(&self, request: &CapabilityRequest) -> anyhow::Result<CapabilityResponse>;

    /// Validates, bounds and measures one request.
    async fn invoke(&self, request: &CapabilityRequest) -> anyhow::Result<CapabilityResponse> {
        if request.action.trim().is_empty() {
            anyhow::bail!("{}: request action is required", self.name());
        }
        let started = Instant::now();

        if let Err(error) = self.schema().validate(&request.action, &request.params) {
            return Ok(CapabilityResponse::failure(error).with_metrics(ExecutionMetrics::since(started)));
        }

        let response = match request.timeout {
            Some(limit) => {
                let bound = limit.saturating_add(TIMEOUT_GRACE);
                match tokio::time::timeout(bound, self.execute(request)).await {
                    Ok(response) => response?,
                    Err(_) => {
                        warn!(
                            "{}.{} for agent {} exceeded {:?}",
                            self.name(),
                            request.action,
                            request.agent_id(),
                            limit
                        );
                        CapabilityResponse::fail(
                            ErrorCode::Timeout,
                            format!("{} did not finish within {limit:?}", request.action),
                        )
                    }
                }
            }
            None => self.execute(request).await?,
        };

        Ok(response.with_metrics(ExecutionMetrics::since(started)))
    }
}
