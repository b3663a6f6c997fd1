use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    Command, ExecResult, Feature, IsolationStrategy, NetworkConfig, SandboxConfig, SandboxError,
    SandboxMetrics, SandboxState, DEFAULT_EXEC_TIMEOUT,
};

/// Mutable lifecycle bookkeeping, guarded by one lock.
struct Lifecycle {
    state: SandboxState,
    started_at: Option<DateTime<Utc>>,
    started: Option<Instant>,
    stopped: Option<Instant>,
    /// Teardown already ran (stop or destroy).
    released: bool,
}

/// One isolated execution environment.
///
/// State machine:
///
/// ```text
/// Created ──start──▶ Running ──pause──▶ Paused
///                      ▲  └───resume────┘  │
///                      └──stop──▶ Stopped ◀┘ (stop from Running or Paused)
/// ```
///
/// `pause` and `resume` need a strategy that supports [`Feature::Pause`].
/// `destroy` is accepted from every state, is idempotent and always
/// ends in `Stopped`.
pub struct Sandbox {
    id: String,
    config: Arc<SandboxConfig>,
    strategy: Arc<dyn IsolationStrategy>,
    created_at: DateTime<Utc>,
    lifecycle: Mutex<Lifecycle>,
}

impl Sandbox {
    pub(crate) fn new(config: Arc<SandboxConfig>, strategy: Arc<dyn IsolationStrategy>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            strategy,
            created_at: Utc::now(),
            lifecycle: Mutex::new(Lifecycle {
                state: SandboxState::Created,
                started_at: None,
                started: None,
                stopped: None,
                released: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn state(&self) -> SandboxState {
        self.lifecycle.lock().state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lifecycle.lock().started_at
    }

    pub fn network_config(&self) -> NetworkConfig {
        self.config.network_config()
    }

    /// Name of the injected isolation strategy.
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    // ── Lifecycle ────────────────────────────────────────

    /// `Created → Running`, applying the strategy's constraints first.
    pub async fn start(&self) -> Result<(), SandboxError> {
        self.require("start", &[SandboxState::Created])?;

        let constrain = self.strategy.constrain(&self.id, &self.config);
        match self.config.start_timeout() {
            Some(limit) => tokio::time::timeout(limit, constrain)
                .await
                .map_err(|_| SandboxError::Timeout {
                    id: self.id.clone(),
                    action: "start",
                    after: limit,
                })??,
            None => constrain.await?,
        }

        let mut lifecycle = self.lifecycle.lock();
        // destroy() may have run while constraints were applied
        if lifecycle.state != SandboxState::Created {
            return Err(self.invalid("start", lifecycle.state));
        }
        lifecycle.state = SandboxState::Running;
        lifecycle.started_at = Some(Utc::now());
        lifecycle.started = Some(Instant::now());
        info!("Sandbox {} started ({} strategy)", self.id, self.strategy.name());
        Ok(())
    }

    /// `Running → Paused`
    pub async fn pause(&self) -> Result<(), SandboxError> {
        self.require_feature(Feature::Pause)?;
        self.transition("pause", &[SandboxState::Running], SandboxState::Paused)
    }

    /// `Paused → Running`
    pub async fn resume(&self) -> Result<(), SandboxError> {
        self.require_feature(Feature::Pause)?;
        self.transition("resume", &[SandboxState::Paused], SandboxState::Running)
    }

    fn require_feature(&self, feature: Feature) -> Result<(), SandboxError> {
        if self.strategy.supports(feature) {
            return Ok(());
        }
        Err(SandboxError::Unsupported {
            id: self.id.clone(),
            strategy: self.strategy.name(),
            feature,
        })
    }

    /// `Running | Paused → Stopped`, tearing the environment down.
    pub async fn stop(&self) -> Result<(), SandboxError> {
        let release = {
            let mut lifecycle = self.lifecycle.lock();
            if !matches!(lifecycle.state, SandboxState::Running | SandboxState::Paused) {
                return Err(self.invalid("stop", lifecycle.state));
            }
            self.mark_stopped(&mut lifecycle)
        };
        info!("Sandbox {} stopped", self.id);
        if release {
            self.strategy.teardown(&self.id).await?;
        }
        Ok(())
    }

    /// Moves to `Stopped` from any state. Safe to call repeatedly;
    /// teardown failures are logged, never returned.
    pub async fn destroy(&self) -> Result<(), SandboxError> {
        let release = {
            let mut lifecycle = self.lifecycle.lock();
            self.mark_stopped(&mut lifecycle)
        };
        if release {
            debug!("Sandbox {} destroyed", self.id);
            if let Err(e) = self.strategy.teardown(&self.id).await {
                warn!("Sandbox {}: teardown failed during destroy: {e}", self.id);
            }
        }
        Ok(())
    }

    // ── Execution ────────────────────────────────────────

    /// Runs one command inside the sandbox.
    ///
    /// Only accepted while `Running`. A non-zero exit is returned as
    /// `Ok` with `exit_code` set; `Err` means the command could not be
    /// run at all.
    pub async fn exec(&self, command: &Command) -> Result<ExecResult, SandboxError> {
        if command.path.trim().is_empty() {
            return Err(SandboxError::InvalidCommand("path is required".into()));
        }
        let state = self.state();
        if state != SandboxState::Running {
            return Err(SandboxError::NotRunning {
                id: self.id.clone(),
                state,
            });
        }

        let timeout = effective_timeout(command, &self.config);
        let result = self
            .strategy
            .spawn(&self.id, &self.config, command, timeout)
            .await?;
        debug!(
            "Sandbox {}: {} exited {} in {:?}",
            self.id, command.path, result.exit_code, result.duration
        );
        Ok(result)
    }

    /// Stages a host file into the sandbox.
    pub async fn copy_in(&self, src: &Path, dst: &Path) -> Result<(), SandboxError> {
        self.require_live("copy into")?;
        self.strategy.copy_in(&self.id, src, dst).await
    }

    /// Stages a sandbox file out to the host.
    pub async fn copy_out(&self, src: &Path, dst: &Path) -> Result<(), SandboxError> {
        self.require_live("copy out of")?;
        self.strategy.copy_out(&self.id, src, dst).await
    }

    pub fn metrics(&self) -> SandboxMetrics {
        let usage = self.strategy.usage(&self.id);
        let lifecycle = self.lifecycle.lock();
        let uptime = match (lifecycle.started, lifecycle.stopped) {
            (Some(started), Some(stopped)) => stopped.saturating_duration_since(started),
            (Some(started), None) => started.elapsed(),
            _ => Duration::ZERO,
        };
        SandboxMetrics {
            cpu_percent: usage.cpu_percent,
            memory_bytes: usage.memory_bytes,
            uptime,
            restart_count: usage.restart_count,
        }
    }

    // ── Helpers ──────────────────────────────────────────

    fn transition(
        &self,
        action: &'static str,
        from: &[SandboxState],
        to: SandboxState,
    ) -> Result<(), SandboxError> {
        let mut lifecycle = self.lifecycle.lock();
        if !from.contains(&lifecycle.state) {
            return Err(self.invalid(action, lifecycle.state));
        }
        lifecycle.state = to;
        debug!("Sandbox {}: {action} → {to}", self.id);
        Ok(())
    }

    fn require(&self, action: &'static str, allowed: &[SandboxState]) -> Result<(), SandboxError> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(self.invalid(action, state))
        }
    }

    fn require_live(&self, action: &'static str) -> Result<(), SandboxError> {
        self.require(
            action,
            &[SandboxState::Created, SandboxState::Running, SandboxState::Paused],
        )
    }

    /// Returns true when the caller must run teardown.
    fn mark_stopped(&self, lifecycle: &mut Lifecycle) -> bool {
        if lifecycle.state != SandboxState::Stopped {
            lifecycle.state = SandboxState::Stopped;
            lifecycle.stopped = Some(Instant::now());
        }
        let release = !lifecycle.released;
        lifecycle.released = true;
        release
    }

    fn invalid(&self, action: &'static str, state: SandboxState) -> SandboxError {
        SandboxError::InvalidTransition {
            id: self.id.clone(),
            action,
            state,
        }
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

/// `command.timeout`, else `config.exec_timeout`, else 30 seconds.
pub(crate) fn effective_timeout(command: &Command, config: &SandboxConfig) -> Duration {
    command
        .timeout
        .filter(|t| !t.is_zero())
        .or_else(|| config.exec_timeout().filter(|t| !t.is_zero()))
        .unwrap_or(DEFAULT_EXEC_TIMEOUT)
}
