use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::capability::secrets::SecretBinding;
use crate::sandbox::{RuntimesConfig, SandboxConfig};

/// Daemon-side configuration of the execution core. Every section is
/// optional and defaults to a working local setup.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub sandbox: SandboxConfig,
    pub runtimes: RuntimesConfig,
    pub exec: ExecConfig,
    pub fs: FsConfig,
    pub net: NetConfig,
    pub secrets: SecretsConfig,
    pub memory: MemoryConfig,
    pub browser: BrowserConfig,
    pub tools: ToolsConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExecConfig {
    pub enabled: bool,
    /// Values accepted for the optional `language` tag of `exec.run`
    pub languages: Vec<String>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            languages: ["bash", "sh", "python", "node"].map(String::from).to_vec(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FsConfig {
    pub enabled: bool,
    pub root: PathBuf,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: PathBuf::from("./data/workspace"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NetConfig {
    pub enabled: bool,
    /// Empty means every host not denied
    pub allowlist: Vec<String>,
    pub denylist: Vec<String>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowlist: Vec::new(),
            denylist: ["localhost", "127.0.0.1", "169.254.169.254", "metadata.google.internal"]
                .map(String::from)
                .to_vec(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SecretsConfig {
    pub enabled: bool,
    /// Missing env vars and Vault keys are errors instead of falling back
    pub strict: bool,
    /// Bindings resolved into the environment of sandboxes launched by the CLI
    pub inject: Vec<SecretBinding>,
    pub vault: Option<VaultConfig>,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strict: false,
            inject: Vec::new(),
            vault: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    pub address: String,
    /// Supports ${ENV_VAR} substitution; VAULT_TOKEN is used when unset
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    /// Fixed vector dimension; taken from the first vector when unset
    pub dimensions: Option<usize>,
    pub max_value_bytes: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dimensions: None,
            max_value_bytes: crate::capability::memory::DEFAULT_MAX_VALUE_BYTES,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrowserConfig {
    pub enabled: bool,
    pub capture_dir: PathBuf,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capture_dir: PathBuf::from("./data/captures"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ToolsConfig {
    pub enabled: bool,
    pub custom: Vec<CustomToolConfig>,
    pub mcp: Vec<McpServerConfig>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            custom: Vec::new(),
            mcp: Vec::new(),
        }
    }
}

/// A tool backed by a shell command run in a sandbox.
#[derive(Debug, Deserialize, Clone)]
pub struct CustomToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub schema: Option<Value>,
}

/// An MCP server reached over HTTP.
#[derive(Debug, Deserialize, Clone)]
pub struct McpServerConfig {
    pub name: String,
    pub uri: String,
    /// Tools exposed through the `tools` capability as `<name>.<tool>`
    #[serde(default)]
    pub tools: Vec<String>,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${VAULT_TOKEN}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that parse but cannot work together.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.sandbox.validate()?;

        let mut seen = BTreeSet::new();
        for server in &self.tools.mcp {
            anyhow::ensure!(!server.name.trim().is_empty(), "tools.mcp: server name is required");
            anyhow::ensure!(
                !server.uri.trim().is_empty(),
                "tools.mcp: server '{}' has an empty uri",
                server.name
            );
            anyhow::ensure!(
                seen.insert(server.name.as_str()),
                "tools.mcp: duplicate server name '{}'",
                server.name
            );
        }
        for tool in &self.tools.custom {
            anyhow::ensure!(!tool.name.trim().is_empty(), "tools.custom: tool name is required");
            anyhow::ensure!(
                !tool.command.trim().is_empty(),
                "tools.custom: tool '{}' has an empty command",
                tool.name
            );
        }
        if let Some(vault) = &self.secrets.vault {
            anyhow::ensure!(!vault.address.trim().is_empty(), "secrets.vault: address is required");
        }
        Ok(())
    }
}
