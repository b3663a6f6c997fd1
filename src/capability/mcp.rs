//! `mcp` capability: calls tools on Model Context Protocol servers.
//!
//! Remote servers are reached with JSON-RPC 2.0 `tools/call` requests over
//! HTTP. [`McpServer`] is an in-process handler table behind the same
//! [`McpTransport`] seam, and [`McpBridge`] exposes one MCP tool as a
//! [`ToolHandler`] for the `tools` capability.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::net::read_capped;
use super::tools::ToolHandler;
use super::{
    Action, Capability, CapabilityRequest, CapabilityResponse, ErrorCode, Field, FieldType, Schema,
};

/// HTTP timeout for one MCP call, in seconds.
const CALL_TIMEOUT_SECS: u64 = 60;

/// HTTP connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Largest MCP response body accepted (1 MB).
const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn call(&self, tool: &str, input: Value) -> anyhow::Result<Value>;
}

// ── JSON-RPC types ───────────────────────────────────────

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: CallParams<'a>,
}

#[derive(Serialize)]
struct CallParams<'a> {
    name: &'a str,
    arguments: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

// ── HttpMcpClient ────────────────────────────────────────

pub struct HttpMcpClient {
    endpoint: url::Url,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpMcpClient {
    pub fn new(endpoint: &str) -> anyhow::Result<Self> {
        anyhow::ensure!(!endpoint.trim().is_empty(), "mcp endpoint is required");
        let endpoint = url::Url::parse(endpoint)
            .map_err(|e| anyhow::anyhow!("invalid mcp endpoint '{endpoint}': {e}"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(CALL_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| anyhow::anyhow!("building MCP client: {e}"))?;
        Ok(Self {
            endpoint,
            client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &url::Url {
        &self.endpoint
    }
}

#[async_trait]
impl McpTransport for HttpMcpClient {
    async fn call(&self, tool: &str, input: Value) -> anyhow::Result<Value> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method: "tools/call",
            params: CallParams {
                name: tool,
                arguments: input,
            },
        };
        debug!("MCP tools/call {tool} at {}", self.endpoint);

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        let body = read_capped(response, MAX_RESPONSE_SIZE).await?;
        if !status.is_success() {
            anyhow::bail!(
                "MCP server returned {status}: {}",
                String::from_utf8_lossy(&body.bytes)
            );
        }
        if body.truncated {
            anyhow::bail!("MCP response exceeds {MAX_RESPONSE_SIZE} bytes");
        }

        let rpc: RpcResponse = serde_json::from_slice(&body.bytes)?;
        if let Some(error) = rpc.error {
            anyhow::bail!("MCP error {}: {}", error.code, error.message);
        }
        rpc.result
            .ok_or_else(|| anyhow::anyhow!("MCP response has neither result nor error"))
    }
}

// ── McpServer ────────────────────────────────────────────

/// In-process MCP tool table.
#[derive(Default)]
pub struct McpServer {
    handlers: RwLock<BTreeMap<String, Arc<dyn ToolHandler>>>,
}

impl McpServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.handlers.write().insert(name.into(), handler);
    }

    pub fn tools(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }
}

#[async_trait]
impl McpTransport for McpServer {
    async fn call(&self, tool: &str, input: Value) -> anyhow::Result<Value> {
        let handler = self.handlers.read().get(tool).cloned();
        match handler {
            Some(handler) => handler.call(input).await,
            None => anyhow::bail!("unknown MCP tool '{tool}'"),
        }
    }
}

// ── McpBridge ────────────────────────────────────────────

/// One MCP tool seen as a local tool handler.
pub struct McpBridge {
    transport: Arc<dyn McpTransport>,
    tool: String,
}

impl McpBridge {
    pub fn new(transport: Arc<dyn McpTransport>, tool: impl Into<String>) -> Self {
        Self {
            transport,
            tool: tool.into(),
        }
    }
}

#[async_trait]
impl ToolHandler for McpBridge {
    async fn call(&self, input: Value) -> anyhow::Result<Value> {
        self.transport.call(&self.tool, input).await
    }
}

// ── McpCapability ────────────────────────────────────────

#[derive(Deserialize)]
struct CallRequestParams {
    server: String,
    tool: String,
    #[serde(default)]
    input: Map<String, Value>,
}

#[derive(Default)]
pub struct McpCapability {
    servers: RwLock<BTreeMap<String, Arc<dyn McpTransport>>>,
}

impl McpCapability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a server.
    pub fn add_server(&self, name: impl Into<String>, transport: Arc<dyn McpTransport>) {
        self.servers.write().insert(name.into(), transport);
    }

    pub fn server(&self, name: &str) -> Option<Arc<dyn McpTransport>> {
        self.servers.read().get(name).cloned()
    }

    pub fn server_names(&self) -> Vec<String> {
        self.servers.read().keys().cloned().collect()
    }

    async fn call(&self, params: CallRequestParams) -> CapabilityResponse {
        let Some(transport) = self.server(&params.server) else {
            return CapabilityResponse::fail(
                ErrorCode::NotFound,
                format!("MCP server '{}' not configured", params.server),
            );
        };
        match transport.call(&params.tool, Value::Object(params.input)).await {
            Ok(result) => CapabilityResponse::ok(result),
            Err(e) => {
                warn!("MCP call {}/{} failed: {e}", params.server, params.tool);
                CapabilityResponse::fail(ErrorCode::McpFailed, e.to_string())
            }
        }
    }
}

#[async_trait]
impl Capability for McpCapability {
    fn name(&self) -> &str {
        "mcp"
    }

    fn description(&self) -> &str {
        "Call tools on MCP servers"
    }

    fn schema(&self) -> Schema {
        Schema::new()
            .action(
                Action::new("call", "Call a tool on a configured MCP server")
                    .field("server", Field::required(FieldType::String, "Server name"))
                    .field("tool", Field::required(FieldType::String, "Tool name"))
                    .field("input", Field::optional(FieldType::Object, "Tool arguments")),
            )
            .action(Action::new("servers", "List configured MCP servers"))
    }

    async fn execute(&self, request: &CapabilityRequest) -> anyhow::Result<CapabilityResponse> {
        let response = match request.action.as_str() {
            "call" => match request.params::<CallRequestParams>() {
                Ok(params) => self.call(params).await,
                Err(e) => e.into(),
            },
            "servers" => CapabilityResponse::ok(json!({ "servers": self.server_names() })),
            other => CapabilityResponse::fail(ErrorCode::InvalidAction, other),
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{StubResponse, StubServer};

    struct Upper;

    #[async_trait]
    impl ToolHandler for Upper {
        async fn call(&self, input: Value) -> anyhow::Result<Value> {
            let text = input["text"].as_str().unwrap_or_default().to_uppercase();
            Ok(json!({ "text": text }))
        }
    }

    async fn call(mcp: &McpCapability, action: &str, params: Value) -> CapabilityResponse {
        mcp.invoke(&CapabilityRequest::new(action).with_params(params))
            .await
            .unwrap()
    }

    #[test]
    fn test_endpoint_is_required() {
        assert!(HttpMcpClient::new("").is_err());
        assert!(HttpMcpClient::new("not a url").is_err());
        assert!(HttpMcpClient::new("http://127.0.0.1:7000/mcp").is_ok());
    }

    #[tokio::test]
    async fn test_http_client_sends_tools_call() {
        let server = StubServer::fixed(StubResponse::json(
            200,
            json!({"jsonrpc": "2.0", "id": 1, "result": {"content": [{"type": "text", "text": "ok"}]}}),
        ))
        .await
        .unwrap();
        let client = HttpMcpClient::new(&format!("{}/mcp", server.url())).unwrap();

        let result = client.call("search", json!({"q": "rust"})).await.unwrap();
        assert_eq!(result["content"][0]["text"], "ok");

        let requests = server.requests();
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path, "/mcp");
        let body: Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(body["jsonrpc"], "2.0");
        assert_eq!(body["method"], "tools/call");
        assert_eq!(body["params"]["name"], "search");
        assert_eq!(body["params"]["arguments"]["q"], "rust");
    }

    #[tokio::test]
    async fn test_json_rpc_error_is_mcp_failed() {
        let server = StubServer::fixed(StubResponse::json(
            200,
            json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601, "message": "no such tool"}}),
        ))
        .await
        .unwrap();
        let mcp = McpCapability::new();
        mcp.add_server("remote", Arc::new(HttpMcpClient::new(&server.url()).unwrap()));

        let response = call(&mcp, "call", json!({"server": "remote", "tool": "x"})).await;
        assert_eq!(response.code(), Some(ErrorCode::McpFailed));
        assert!(response.error().unwrap().message.contains("no such tool"));
    }

    #[tokio::test]
    async fn test_oversized_response_is_rejected() {
        let blob = "x".repeat(MAX_RESPONSE_SIZE + 1);
        let server = StubServer::fixed(StubResponse::json(
            200,
            json!({"jsonrpc": "2.0", "id": 1, "result": {"blob": blob}}),
        ))
        .await
        .unwrap();
        let client = HttpMcpClient::new(&server.url()).unwrap();

        let err = client.call("dump", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{err}");
    }

    #[tokio::test]
    async fn test_error_status_body_is_reported() {
        let server = StubServer::fixed(StubResponse::text(502, "text/plain", "upstream gone"))
            .await
            .unwrap();
        let client = HttpMcpClient::new(&server.url()).unwrap();

        let err = client.call("x", json!({})).await.unwrap_err();
        assert!(err.to_string().contains("502"), "{err}");
        assert!(err.to_string().contains("upstream gone"), "{err}");
    }

    #[tokio::test]
    async fn test_in_process_server() {
        let local = Arc::new(McpServer::new());
        local.register("upper", Arc::new(Upper));
        let mcp = McpCapability::new();
        mcp.add_server("local", local.clone());

        let response = call(&mcp, "call", json!({"server": "local", "tool": "upper", "input": {"text": "hi"}})).await;
        assert_eq!(response.data().unwrap()["text"], "HI");

        let response = call(&mcp, "call", json!({"server": "local", "tool": "lower"})).await;
        assert_eq!(response.code(), Some(ErrorCode::McpFailed));

        let response = call(&mcp, "call", json!({"server": "nope", "tool": "upper"})).await;
        assert_eq!(response.code(), Some(ErrorCode::NotFound));

        let response = call(&mcp, "servers", json!({})).await;
        assert_eq!(response.data().unwrap()["servers"], json!(["local"]));
        assert_eq!(local.tools(), vec!["upper"]);
    }

    #[tokio::test]
    async fn test_bridge_as_tool_handler() {
        let local = Arc::new(McpServer::new());
        local.register("upper", Arc::new(Upper));
        let bridge = McpBridge::new(local, "upper");
        let output = bridge.call(json!({"text": "abc"})).await.unwrap();
        assert_eq!(output["text"], "ABC");
    }
}
