//! Runtimes: per-backend sandbox factories.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{
    DirectProcess, Feature, IsolationStrategy, RuntimeKind, RuntimesConfig, Sandbox,
    SandboxConfig, SandboxError, SandboxState,
};

const DEFAULT_GVISOR_BINARY: &str = "runsc";
const DEFAULT_FIRECRACKER_BINARY: &str = "firecracker";
const DEFAULT_DOCKER_BINARY: &str = "docker";
const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Creates and tracks sandboxes for one backend.
#[async_trait]
pub trait Runtime: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Validates `config` and returns a sandbox in the `Created` state.
    async fn create(&self, config: SandboxConfig) -> Result<Arc<Sandbox>, SandboxError>;

    /// Every sandbox this runtime created, ordered by id.
    fn list(&self) -> Vec<Arc<Sandbox>>;

    fn supports(&self, feature: Feature) -> bool;

    /// Checks the backend is usable on this host.
    async fn health_check(&self) -> Result<(), SandboxError>;

    /// Forgets stopped sandboxes. Returns how many were dropped.
    fn reap(&self) -> usize;
}

// ── Health probe ─────────────────────────────────────────

/// What must be present on the host for a backend to work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthProbe {
    /// Executable looked up on `PATH` (or used as-is when it contains a `/`).
    pub binary: Option<String>,
    /// Unix socket that must accept connections.
    pub socket: Option<PathBuf>,
}

impl HealthProbe {
    /// A probe that always passes.
    pub fn none() -> Self {
        Self::default()
    }

    pub async fn check(&self, kind: RuntimeKind) -> Result<(), SandboxError> {
        if let Some(binary) = &self.binary {
            if find_binary(binary).is_none() {
                return Err(SandboxError::Unavailable {
                    kind,
                    reason: format!("'{binary}' not found on PATH"),
                });
            }
        }
        if let Some(socket) = &self.socket {
            probe_socket(socket).await.map_err(|e| SandboxError::Unavailable {
                kind,
                reason: format!("socket {} unreachable: {e}", socket.display()),
            })?;
        }
        Ok(())
    }
}

fn find_binary(binary: &str) -> Option<PathBuf> {
    if binary.contains('/') {
        let path = PathBuf::from(binary);
        return path.is_file().then_some(path);
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

#[cfg(unix)]
async fn probe_socket(path: &Path) -> std::io::Result<()> {
    tokio::net::UnixStream::connect(path).await.map(|_| ())
}

#[cfg(not(unix))]
async fn probe_socket(path: &Path) -> std::io::Result<()> {
    tokio::fs::metadata(path).await.map(|_| ())
}

// ── BackendRuntime ───────────────────────────────────────

/// The one runtime implementation, parameterised by backend kind.
///
/// Backends differ only in the strategy they inject and their health
/// probe. Features are whatever the strategy can do.
pub struct BackendRuntime {
    kind: RuntimeKind,
    strategy: Arc<dyn IsolationStrategy>,
    probe: HealthProbe,
    sandboxes: RwLock<BTreeMap<String, Arc<Sandbox>>>,
}

impl BackendRuntime {
    pub fn new(kind: RuntimeKind, strategy: Arc<dyn IsolationStrategy>, probe: HealthProbe) -> Self {
        Self {
            kind,
            strategy,
            probe,
            sandboxes: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn native() -> Self {
        Self::new(RuntimeKind::Native, Arc::new(DirectProcess), HealthProbe::none())
    }

    pub fn gvisor(binary: Option<String>) -> Self {
        let probe = HealthProbe {
            binary: Some(binary.unwrap_or_else(|| DEFAULT_GVISOR_BINARY.to_string())),
            socket: None,
        };
        Self::new(RuntimeKind::Gvisor, Arc::new(DirectProcess), probe)
    }

    /// The API socket is only probed when one is configured.
    pub fn firecracker(binary: Option<String>, api_socket: Option<PathBuf>) -> Self {
        let probe = HealthProbe {
            binary: Some(binary.unwrap_or_else(|| DEFAULT_FIRECRACKER_BINARY.to_string())),
            socket: api_socket,
        };
        Self::new(RuntimeKind::Firecracker, Arc::new(DirectProcess), probe)
    }

    pub fn docker(binary: Option<String>, socket: Option<PathBuf>) -> Self {
        let probe = HealthProbe {
            binary: Some(binary.unwrap_or_else(|| DEFAULT_DOCKER_BINARY.to_string())),
            socket: Some(socket.unwrap_or_else(|| PathBuf::from(DEFAULT_DOCKER_SOCKET))),
        };
        Self::new(RuntimeKind::Docker, Arc::new(DirectProcess), probe)
    }

    /// Builds the backend `kind` using the `[runtimes]` settings.
    pub fn from_config(config: &RuntimesConfig, kind: RuntimeKind) -> Self {
        match kind {
            RuntimeKind::Native => Self::native(),
            RuntimeKind::Gvisor => Self::gvisor(config.gvisor.binary.clone()),
            RuntimeKind::Firecracker => Self::firecracker(
                config.firecracker.binary.clone(),
                config.firecracker.socket.clone(),
            ),
            RuntimeKind::Docker => {
                Self::docker(config.docker.binary.clone(), config.docker.socket.clone())
            }
        }
    }

    pub fn probe(&self) -> &HealthProbe {
        &self.probe
    }

    pub fn get(&self, id: &str) -> Option<Arc<Sandbox>> {
        self.sandboxes.read().get(id).cloned()
    }
}

#[async_trait]
impl Runtime for BackendRuntime {
    fn kind(&self) -> RuntimeKind {
        self.kind
    }

    async fn create(&self, config: SandboxConfig) -> Result<Arc<Sandbox>, SandboxError> {
        config.validate()?;
        let sandbox = Arc::new(Sandbox::new(Arc::new(config), Arc::clone(&self.strategy)));
        self.sandboxes
            .write()
            .insert(sandbox.id().to_string(), Arc::clone(&sandbox));
        info!("Created sandbox {} on {} runtime", sandbox.id(), self.kind);
        Ok(sandbox)
    }

    fn list(&self) -> Vec<Arc<Sandbox>> {
        self.sandboxes.read().values().cloned().collect()
    }

    fn supports(&self, feature: Feature) -> bool {
        self.strategy.supports(feature)
    }

    async fn health_check(&self) -> Result<(), SandboxError> {
        self.probe.check(self.kind).await
    }

    fn reap(&self) -> usize {
        let mut sandboxes = self.sandboxes.write();
        let before = sandboxes.len();
        sandboxes.retain(|_, sandbox| sandbox.state() != SandboxState::Stopped);
        let reaped = before - sandboxes.len();
        if reaped > 0 {
            debug!("{} runtime: reaped {reaped} stopped sandboxes", self.kind);
        }
        reaped
    }
}

// ── Lease ────────────────────────────────────────────────

/// A started sandbox held for one job.
///
/// [`SandboxLease::release`] destroys the sandbox and reaps it from the
/// runtime. A lease dropped before release (a cancelled caller) does the
/// same on a background task.
pub struct SandboxLease {
    sandbox: Arc<Sandbox>,
    runtime: Arc<dyn Runtime>,
    released: bool,
}

impl SandboxLease {
    /// Creates and starts a sandbox on `runtime`.
    pub async fn acquire(runtime: Arc<dyn Runtime>, config: SandboxConfig) -> Result<Self, SandboxError> {
        let sandbox = runtime.create(config).await?;
        let lease = Self {
            sandbox,
            runtime,
            released: false,
        };
        if let Err(e) = lease.sandbox.start().await {
            lease.release().await;
            return Err(e);
        }
        Ok(lease)
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.sandbox.destroy().await {
            warn!("Sandbox {}: destroy failed: {e}", self.sandbox.id());
        }
        self.runtime.reap();
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let sandbox = Arc::clone(&self.sandbox);
        let runtime = Arc::clone(&self.runtime);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Sandbox {}: lease dropped, destroying in background", sandbox.id());
                handle.spawn(async move {
                    if let Err(e) = sandbox.destroy().await {
                        warn!("Sandbox {}: destroy failed: {e}", sandbox.id());
                    }
                    runtime.reap();
                });
            }
            Err(_) => warn!(
                "Sandbox {}: lease dropped outside a tokio runtime, left running",
                sandbox.id()
            ),
        }
    }
}

impl std::fmt::Debug for BackendRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRuntime")
            .field("kind", &self.kind)
            .field("strategy", &self.strategy.name())
            .field("probe", &self.probe)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{BackendConfig, Command};

    #[test]
    fn test_features_follow_the_strategy() {
        let runtimes = [
            BackendRuntime::native(),
            BackendRuntime::gvisor(None),
            BackendRuntime::firecracker(None, None),
            BackendRuntime::docker(None, None),
        ];
        for runtime in &runtimes {
            assert!(runtime.supports(Feature::Networking), "{}", runtime.kind());
            assert!(!runtime.supports(Feature::Pause), "{}", runtime.kind());
            assert!(!runtime.supports(Feature::Snapshots), "{}", runtime.kind());
        }
    }

    #[tokio::test]
    async fn test_lease_release_destroys_and_reaps() {
        let runtime = Arc::new(BackendRuntime::native());
        let lease = SandboxLease::acquire(runtime.clone(), SandboxConfig::for_runtime(RuntimeKind::Native))
            .await
            .unwrap();
        assert_eq!(lease.sandbox().state(), SandboxState::Running);
        assert_eq!(runtime.list().len(), 1);

        lease.release().await;
        assert!(runtime.list().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_lease_is_cleaned_up() {
        let runtime = Arc::new(BackendRuntime::native());
        let lease = SandboxLease::acquire(runtime.clone(), SandboxConfig::for_runtime(RuntimeKind::Native))
            .await
            .unwrap();
        let sandbox = runtime.list().remove(0);
        drop(lease);

        for _ in 0..50 {
            if runtime.list().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(runtime.list().is_empty());
        assert_eq!(sandbox.state(), SandboxState::Stopped);
    }

    #[tokio::test]
    async fn test_cancelled_exec_does_not_leak_the_sandbox() {
        let runtime = Arc::new(BackendRuntime::native());
        let job = {
            let runtime = runtime.clone();
            async move {
                let lease = SandboxLease::acquire(runtime, SandboxConfig::for_runtime(RuntimeKind::Native))
                    .await
                    .unwrap();
                let result = lease.sandbox().exec(&Command::new("sleep").arg("30")).await;
                lease.release().await;
                result
            }
        };
        let cancelled = tokio::time::timeout(std::time::Duration::from_millis(200), job).await;
        assert!(cancelled.is_err());

        for _ in 0..50 {
            if runtime.list().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(runtime.list().is_empty());
    }

    #[tokio::test]
    async fn test_native_is_always_healthy() {
        BackendRuntime::native().health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary_is_unhealthy() {
        let runtime = BackendRuntime::gvisor(Some("definitely-not-installed-runsc".into()));
        let err = runtime.health_check().await.unwrap_err();
        assert!(matches!(err, SandboxError::Unavailable { kind: RuntimeKind::Gvisor, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_socket_is_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = BackendRuntime::docker(
            Some("sh".into()),
            Some(dir.path().join("missing.sock")),
        );
        let err = runtime.health_check().await.unwrap_err();
        assert!(err.to_string().contains("unreachable"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_listening_socket_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api.sock");
        let _listener = tokio::net::UnixListener::bind(&path).unwrap();
        let runtime = BackendRuntime::firecracker(Some("sh".into()), Some(path));
        runtime.health_check().await.unwrap();
    }

    #[test]
    fn test_docker_probes_default_socket() {
        let runtime = BackendRuntime::docker(None, None);
        assert_eq!(
            runtime.probe().socket.as_deref(),
            Some(Path::new(DEFAULT_DOCKER_SOCKET))
        );
        assert_eq!(runtime.probe().binary.as_deref(), Some("docker"));
    }

    #[test]
    fn test_from_config_uses_configured_binary() {
        let config = RuntimesConfig {
            gvisor: BackendConfig {
                binary: Some("/opt/gvisor/runsc".into()),
                socket: None,
            },
            ..RuntimesConfig::default()
        };
        let runtime = BackendRuntime::from_config(&config, RuntimeKind::Gvisor);
        assert_eq!(runtime.kind(), RuntimeKind::Gvisor);
        assert_eq!(runtime.probe().binary.as_deref(), Some("/opt/gvisor/runsc"));

        let native = BackendRuntime::from_config(&config, RuntimeKind::Native);
        assert_eq!(native.probe(), &HealthProbe::none());
    }

    #[tokio::test]
    async fn test_create_validates_config() {
        let runtime = BackendRuntime::native();
        let mut config = SandboxConfig::for_runtime(RuntimeKind::Native);
        config.cpu = -1.0;
        assert!(matches!(runtime.create(config).await, Err(SandboxError::Config(_))));
        assert!(runtime.list().is_empty());
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_id() {
        let runtime = BackendRuntime::native();
        for _ in 0..5 {
            runtime
                .create(SandboxConfig::for_runtime(RuntimeKind::Native))
                .await
                .unwrap();
        }
        let ids: Vec<String> = runtime.list().iter().map(|s| s.id().to_string()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids.len(), 5);
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn test_create_start_exec_reap() {
        let runtime = BackendRuntime::native();
        let sandbox = runtime
            .create(SandboxConfig::for_runtime(RuntimeKind::Native))
            .await
            .unwrap();
        assert_eq!(sandbox.state(), SandboxState::Created);
        assert!(runtime.get(sandbox.id()).is_some());

        sandbox.start().await.unwrap();
        let result = sandbox.exec(&Command::shell("exit 7")).await.unwrap();
        assert_eq!(result.exit_code, 7);

        assert_eq!(runtime.reap(), 0);
        sandbox.destroy().await.unwrap();
        assert_eq!(runtime.reap(), 1);
        assert!(runtime.list().is_empty());
    }
}
