//! `tools` capability: a table of named tools, each a descriptor plus an
//! optional handler.
//!
//! Descriptors registered through the `register` action carry no handler;
//! invoking one yields `no_handler` until the host binds one with
//! [`ToolsCapability::register_tool`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::{
    Action, Capability, CapabilityRequest, CapabilityResponse, ErrorCode, Field, FieldType, Schema,
};
use crate::sandbox::{Command, Runtime, SandboxConfig, SandboxLease};

/// Environment variable carrying the JSON input of a [`CommandTool`].
pub const TOOL_INPUT_ENV: &str = "TOOL_INPUT";

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: Value) -> anyhow::Result<Value>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON-schema style object; only its `required` list is enforced.
    #[serde(default = "empty_object")]
    pub schema: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: empty_object(),
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    pub fn required_fields(&self) -> Vec<&str> {
        self.schema
            .get("required")
            .and_then(Value::as_array)
            .map(|fields| fields.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    fn check_input(&self, input: &Map<String, Value>) -> Result<(), String> {
        match self.required_fields().into_iter().find(|f| !input.contains_key(*f)) {
            Some(missing) => Err(format!("tool '{}': missing required field '{missing}'", self.name)),
            None => Ok(()),
        }
    }
}

struct Tool {
    descriptor: ToolDescriptor,
    handler: Option<Arc<dyn ToolHandler>>,
}

// ── CommandTool ──────────────────────────────────────────

/// Runs a shell command in a fresh sandbox, passing the input as JSON in
/// `TOOL_INPUT`. Stdout is returned as JSON when it parses, otherwise as
/// `{"stdout": ...}`.
pub struct CommandTool {
    runtime: Arc<dyn Runtime>,
    config: SandboxConfig,
    command: String,
}

impl CommandTool {
    pub fn new(runtime: Arc<dyn Runtime>, config: SandboxConfig, command: impl Into<String>) -> Self {
        Self {
            runtime,
            config,
            command: command.into(),
        }
    }
}

#[async_trait]
impl ToolHandler for CommandTool {
    async fn call(&self, input: Value) -> anyhow::Result<Value> {
        let lease = SandboxLease::acquire(Arc::clone(&self.runtime), self.config.clone()).await?;
        let command = Command::shell(self.command.as_str()).env(TOOL_INPUT_ENV, input.to_string());
        let outcome = lease.sandbox().exec(&command).await;
        lease.release().await;

        let result = outcome?;
        if result.timed_out {
            anyhow::bail!("tool command timed out after {:?}", result.duration);
        }
        if result.exit_code != 0 {
            anyhow::bail!(
                "tool command exited with status {}: {}",
                result.exit_code,
                result.stderr.trim()
            );
        }
        Ok(serde_json::from_str(result.stdout.trim())
            .unwrap_or_else(|_| json!({ "stdout": result.stdout })))
    }
}

// ── ToolsCapability ──────────────────────────────────────

#[derive(Deserialize)]
struct InvokeParams {
    name: String,
    #[serde(default)]
    input: Map<String, Value>,
}

pub struct ToolsCapability {
    tools: RwLock<BTreeMap<String, Tool>>,
}

impl Default for ToolsCapability {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolsCapability {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(BTreeMap::new()),
        }
    }

    /// Binds a handler. Replaces any tool of the same name.
    pub fn register_tool(&self, descriptor: ToolDescriptor, handler: Arc<dyn ToolHandler>) -> anyhow::Result<()> {
        anyhow::ensure!(!descriptor.name.trim().is_empty(), "tool name is required");
        info!("Registered tool: {}", descriptor.name);
        self.tools.write().insert(
            descriptor.name.clone(),
            Tool {
                descriptor,
                handler: Some(handler),
            },
        );
        Ok(())
    }

    /// Adds a descriptor without a handler. Existing tools are never replaced.
    pub fn register_descriptor(&self, descriptor: ToolDescriptor) -> anyhow::Result<()> {
        anyhow::ensure!(!descriptor.name.trim().is_empty(), "tool name is required");
        let mut tools = self.tools.write();
        anyhow::ensure!(
            !tools.contains_key(&descriptor.name),
            "tool '{}' is already registered",
            descriptor.name
        );
        debug!("Registered tool descriptor: {}", descriptor.name);
        tools.insert(
            descriptor.name.clone(),
            Tool {
                descriptor,
                handler: None,
            },
        );
        Ok(())
    }

    /// Descriptors ordered by name.
    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.tools.read().values().map(|t| t.descriptor.clone()).collect()
    }

    /// Invokes a tool directly and returns its output. Named apart from
    /// [`Capability::invoke`], which takes a whole request.
    pub async fn invoke_tool(&self, name: &str, input: Map<String, Value>) -> anyhow::Result<Value> {
        let params = InvokeParams {
            name: name.to_string(),
            input,
        };
        let response = self.call_tool(params).await;
        if let Some(error) = response.error() {
            anyhow::bail!("invoke tool: {error}");
        }
        Ok(response.into_data().unwrap_or(Value::Null))
    }

    async fn call_tool(&self, params: InvokeParams) -> CapabilityResponse {
        let (descriptor, handler) = match self.tools.read().get(&params.name) {
            Some(tool) => (tool.descriptor.clone(), tool.handler.clone()),
            None => {
                return CapabilityResponse::fail(
                    ErrorCode::NotFound,
                    format!("tool '{}' not found", params.name),
                )
            }
        };
        let Some(handler) = handler else {
            return CapabilityResponse::fail(
                ErrorCode::NoHandler,
                format!("tool '{}' has no handler", params.name),
            );
        };
        if let Err(message) = descriptor.check_input(&params.input) {
            return CapabilityResponse::fail(ErrorCode::InvalidParams, message);
        }
        debug!("Invoking tool: {}", params.name);
        match handler.call(Value::Object(params.input)).await {
            Ok(output) => CapabilityResponse::ok(output),
            Err(e) => {
                warn!("Tool {} failed: {e}", params.name);
                CapabilityResponse::fail(ErrorCode::InvokeFailed, e.to_string())
            }
        }
    }
}

#[async_trait]
impl Capability for ToolsCapability {
    fn name(&self) -> &str {
        "tools"
    }

    fn description(&self) -> &str {
        "Tool registry and invocation"
    }

    fn schema(&self) -> Schema {
        Schema::new()
            .action(Action::new("list", "List registered tools"))
            .action(
                Action::new("invoke", "Invoke a tool by name")
                    .field("name", Field::required(FieldType::String, "Tool name"))
                    .field("input", Field::optional(FieldType::Object, "Tool input")),
            )
            .action(
                Action::new("register", "Register a tool descriptor without a handler")
                    .field("name", Field::required(FieldType::String, "Tool name"))
                    .field("description", Field::optional(FieldType::String, "What the tool does"))
                    .field("schema", Field::optional(FieldType::Object, "Input schema")),
            )
    }

    async fn execute(&self, request: &CapabilityRequest) -> anyhow::Result<CapabilityResponse> {
        let response = match request.action.as_str() {
            "list" => CapabilityResponse::ok(json!({ "tools": self.list() })),
            "invoke" => match request.params::<InvokeParams>() {
                Ok(params) => self.call_tool(params).await,
                Err(e) => e.into(),
            },
            "register" => match request.params::<ToolDescriptor>() {
                Ok(descriptor) => {
                    let name = descriptor.name.clone();
                    match self.register_descriptor(descriptor) {
                        Ok(()) => CapabilityResponse::ok(json!({ "name": name, "registered": true })),
                        Err(e) => CapabilityResponse::fail(ErrorCode::InvalidParams, e.to_string()),
                    }
                }
                Err(e) => e.into(),
            },
            other => CapabilityResponse::fail(ErrorCode::InvalidAction, other),
        };
        Ok(response)
    }
}
