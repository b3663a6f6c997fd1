use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::SandboxError;

// ── Closed enumerations ──────────────────────────────────

/// Backend a sandbox is created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Native,
    Gvisor,
    Firecracker,
    Docker,
}

impl RuntimeKind {
    pub const ALL: [RuntimeKind; 4] = [
        RuntimeKind::Native,
        RuntimeKind::Gvisor,
        RuntimeKind::Firecracker,
        RuntimeKind::Docker,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Native => "native",
            RuntimeKind::Gvisor => "gvisor",
            RuntimeKind::Firecracker => "firecracker",
            RuntimeKind::Docker => "docker",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| {
                SandboxError::Config(format!(
                    "unknown runtime '{s}' (expected native, gvisor, firecracker or docker)"
                ))
            })
    }
}

/// Network posture granted to a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPolicy {
    None,
    Restricted,
    EgressOnly,
    Full,
}

impl NetworkPolicy {
    pub const ALL: [NetworkPolicy; 4] = [
        NetworkPolicy::None,
        NetworkPolicy::Restricted,
        NetworkPolicy::EgressOnly,
        NetworkPolicy::Full,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkPolicy::None => "none",
            NetworkPolicy::Restricted => "restricted",
            NetworkPolicy::EgressOnly => "egress-only",
            NetworkPolicy::Full => "full",
        }
    }
}

impl fmt::Display for NetworkPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkPolicy {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|policy| policy.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| {
                SandboxError::Config(format!(
                    "unknown network policy '{s}' (expected none, restricted, egress-only or full)"
                ))
            })
    }
}

/// Syscall filter mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeccompProfile {
    Strict,
    Moderate,
    Permissive,
}

impl SeccompProfile {
    pub const ALL: [SeccompProfile; 3] = [
        SeccompProfile::Strict,
        SeccompProfile::Moderate,
        SeccompProfile::Permissive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SeccompProfile::Strict => "strict",
            SeccompProfile::Moderate => "moderate",
            SeccompProfile::Permissive => "permissive",
        }
    }
}

impl fmt::Display for SeccompProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeccompProfile {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|profile| profile.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| {
                SandboxError::Config(format!(
                    "unknown seccomp profile '{s}' (expected strict, moderate or permissive)"
                ))
            })
    }
}

// ── Mounts ───────────────────────────────────────────────

/// Access granted on a mounted host path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountMode {
    #[default]
    Ro,
    Rw,
}

/// A host path exposed inside the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub source: PathBuf,
    pub target: PathBuf,
    #[serde(default)]
    pub mode: MountMode,
}

/// Network settings reported by a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkConfig {
    pub policy: NetworkPolicy,
}

// ── SandboxConfig ────────────────────────────────────────

/// Desired isolation posture of a sandbox.
///
/// A sandbox keeps its own copy behind an `Arc`; changing a config
/// after `Runtime::create` has no effect on sandboxes built from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub runtime: RuntimeKind,
    pub image: Option<String>,
    /// Memory limit in bytes (0 = unlimited).
    pub memory: u64,
    /// CPU share in cores.
    pub cpu: f64,
    /// Disk quota in bytes (0 = unlimited).
    pub disk: u64,
    /// Maximum number of processes (0 = unlimited).
    pub pids: u32,
    pub network: NetworkPolicy,
    pub seccomp: SeccompProfile,
    /// Linux capabilities retained inside the sandbox.
    pub capabilities: Vec<String>,
    pub read_only_root: bool,
    pub mounts: Vec<Mount>,
    /// Environment applied to every command, under the command's own overrides.
    pub env: BTreeMap<String, String>,
    pub start_timeout_secs: Option<u64>,
    pub exec_timeout_secs: Option<u64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::Gvisor,
            image: None,
            memory: 256 * 1024 * 1024,
            cpu: 0.5,
            disk: 0,
            pids: 0,
            network: NetworkPolicy::Restricted,
            seccomp: SeccompProfile::Strict,
            capabilities: Vec::new(),
            read_only_root: true,
            mounts: Vec::new(),
            env: BTreeMap::new(),
            start_timeout_secs: Some(30),
            exec_timeout_secs: Some(120),
        }
    }
}

impl SandboxConfig {
    /// Default posture on a specific runtime.
    pub fn for_runtime(runtime: RuntimeKind) -> Self {
        Self {
            runtime,
            ..Self::default()
        }
    }

    pub fn start_timeout(&self) -> Option<Duration> {
        self.start_timeout_secs.map(Duration::from_secs)
    }

    pub fn exec_timeout(&self) -> Option<Duration> {
        self.exec_timeout_secs.map(Duration::from_secs)
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            policy: self.network,
        }
    }

    /// Rejects values no backend could honor.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if !self.cpu.is_finite() || self.cpu <= 0.0 {
            return Err(SandboxError::Config(format!(
                "cpu must be a positive number of cores (got {})",
                self.cpu
            )));
        }
        if self.exec_timeout_secs == Some(0) {
            return Err(SandboxError::Config(
                "exec_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.start_timeout_secs == Some(0) {
            return Err(SandboxError::Config(
                "start_timeout_secs must be greater than zero".into(),
            ));
        }
        for mount in &self.mounts {
            if mount.source.as_os_str().is_empty() {
                return Err(SandboxError::Config("mount source is required".into()));
            }
            if !mount.target.is_absolute() {
                return Err(SandboxError::Config(format!(
                    "mount target must be absolute (got {})",
                    mount.target.display()
                )));
            }
        }
        Ok(())
    }
}

// ── Backend settings ─────────────────────────────────────

/// Per-backend binary and socket locations.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub binary: Option<String>,
    pub socket: Option<PathBuf>,
}

/// `[runtimes]` section: how to reach each isolated backend.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RuntimesConfig {
    pub gvisor: BackendConfig,
    pub firecracker: BackendConfig,
    pub docker: BackendConfig,
}
