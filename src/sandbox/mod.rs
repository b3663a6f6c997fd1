//! Sandboxes, runtimes and isolation strategies.
//!
//! The layering is:
//!
//! 1. `IsolationStrategy` is how a command is actually run (today: a
//!    direct host subprocess with deadline enforcement)
//! 2. `Sandbox` is one environment with a lifecycle state machine,
//!    delegating every side effect to its strategy
//! 3. `Runtime` creates and lists sandboxes for one backend
//!    (native, gVisor, Firecracker, Docker) and probes its health
//!
//! Backends differ only in the strategy they inject and their health
//! probe; optional features come from the strategy and lifecycle logic
//! lives in `Sandbox`.

pub mod config;
pub mod instance;
pub mod runtime;
pub mod strategy;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

pub use config::{
    BackendConfig, Mount, MountMode, NetworkConfig, NetworkPolicy, RuntimeKind, RuntimesConfig,
    SandboxConfig, SeccompProfile,
};
pub use instance::Sandbox;
pub use runtime::{BackendRuntime, HealthProbe, Runtime, SandboxLease};
pub use strategy::{DirectProcess, IsolationStrategy};

/// Timeout applied when neither the command nor the config sets one.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit code reported for a command killed at its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

// ── Command / ExecResult ─────────────────────────────────

/// One execution request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Command {
    pub path: String,
    pub args: Vec<String>,
    /// Overrides merged over the inherited process environment.
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl Command {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// `sh -lc <script>`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").args(["-lc".to_string(), script.into()])
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of one command. A non-zero `exit_code` is data, not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// The deadline expired and the process was killed.
    pub timed_out: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

// ── Lifecycle / features / metrics ───────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Created,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxState::Created => "created",
            SandboxState::Running => "running",
            SandboxState::Paused => "paused",
            SandboxState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Optional backend features a runtime may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Pause,
    Snapshots,
    Networking,
}

/// Resource usage reported by a strategy for one sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub restart_count: u64,
}

/// Point-in-time snapshot of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SandboxMetrics {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub uptime: Duration,
    pub restart_count: u64,
}

// ── Errors ───────────────────────────────────────────────

/// Failures of the sandbox API itself. A command that ran and exited
/// non-zero is never one of these.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid sandbox config: {0}")]
    Config(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("cannot {action} sandbox {id} while {state}")]
    InvalidTransition {
        id: String,
        action: &'static str,
        state: SandboxState,
    },

    #[error("sandbox {id}: the {strategy} strategy does not support {feature:?}")]
    Unsupported {
        id: String,
        strategy: &'static str,
        feature: Feature,
    },

        #[error("sandbox {id} is {state}; commands run only while running")]
    NotRunning { id: String, state: SandboxState },

    #[error("sandbox {id}: {action} timed out after {after:?}")]
    Timeout {
        id: String,
        action: &'static str,
        after: Duration,
    },

    #[error("failed to spawn '{path}': {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("runtime {kind} unavailable: {reason}")]
    Unavailable { kind: RuntimeKind, reason: String },
}
