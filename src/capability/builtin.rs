//! Builds the registry of enabled capabilities from the configuration.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use super::browser::BrowserCapability;
use super::exec::ExecCapability;
use super::fs::FsCapability;
use super::mcp::{HttpMcpClient, McpBridge, McpCapability, McpTransport};
use super::memory::MemoryCapability;
use super::net::NetCapability;
use super::secrets::{EnvResolver, SchemeResolver, SecretsCapability, VaultResolver};
use super::tools::{CommandTool, ToolDescriptor, ToolsCapability};
use super::Registry;
use crate::config::Config;
use crate::policy::HostPolicy;
use crate::sandbox::Runtime;

/// Secret resolver for the configured schemes: `env://` always, `vault://`
/// when `[secrets.vault]` is present.
pub fn secret_resolver(config: &Config) -> anyhow::Result<SchemeResolver> {
    let strict = config.secrets.strict;
    let mut resolver = SchemeResolver::new().with(Arc::new(EnvResolver::new(strict)));
    if let Some(vault) = &config.secrets.vault {
        resolver = resolver.with(Arc::new(
            VaultResolver::new(vault.address.as_str(), vault.token.clone())?.strict(strict),
        ));
    }
    Ok(resolver)
}

/// Registers every enabled capability. `exec` and command tools create
/// their sandboxes on `runtime`.
pub fn build_registry(config: &Config, runtime: Arc<dyn Runtime>) -> anyhow::Result<Registry> {
    config.validate()?;
    let registry = Registry::new();
    let host_policy = || HostPolicy::new(config.net.allowlist.clone(), config.net.denylist.clone());

    if config.exec.enabled {
        registry.register(Arc::new(ExecCapability::new(
            runtime.clone(),
            config.sandbox.clone(),
            config.exec.languages.clone(),
        )))?;
    }
    if config.fs.enabled {
        registry.register(Arc::new(FsCapability::new(&config.fs.root)?))?;
    }
    if config.net.enabled {
        registry.register(Arc::new(NetCapability::new(host_policy())?))?;
    }
    if config.secrets.enabled {
        registry.register(Arc::new(SecretsCapability::new(Arc::new(secret_resolver(config)?))))?;
    }
    if config.memory.enabled {
        registry.register(Arc::new(MemoryCapability::new(
            config.memory.dimensions,
            config.memory.max_value_bytes,
        )))?;
    }
    if config.browser.enabled {
        registry.register(Arc::new(BrowserCapability::new(
            host_policy(),
            &config.browser.capture_dir,
        )?))?;
    }
    if config.tools.enabled {
        let tools = ToolsCapability::new();
        for custom in &config.tools.custom {
            let descriptor = ToolDescriptor::new(custom.name.as_str(), custom.description.as_str())
                .with_schema(custom.schema.clone().unwrap_or_else(|| json!({})));
            let handler = CommandTool::new(runtime.clone(), config.sandbox.clone(), custom.command.as_str());
            tools.register_tool(descriptor, Arc::new(handler))?;
        }

        let mcp = McpCapability::new();
        for server in &config.tools.mcp {
            let transport: Arc<dyn McpTransport> = Arc::new(HttpMcpClient::new(&server.uri)?);
            for tool in &server.tools {
                let descriptor = ToolDescriptor::new(
                    format!("{}.{tool}", server.name),
                    format!("MCP tool '{tool}' on server '{}'", server.name),
                );
                tools.register_tool(descriptor, Arc::new(McpBridge::new(transport.clone(), tool.as_str())))?;
            }
            mcp.add_server(server.name.as_str(), transport);
        }

        registry.register(Arc::new(tools))?;
        registry.register(Arc::new(mcp))?;
    }

    info!("Capabilities registered: {}", registry.names().join(", "));
    Ok(registry)
}
