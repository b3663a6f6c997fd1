//! Isolation strategies: the low-level mechanism a sandbox runs commands with.
//!
//! `DirectProcess` runs commands as plain host subprocesses and only
//! enforces logical limits (deadlines, output caps). Namespace/cgroup
//! or hypervisor-backed strategies plug in behind the same trait
//! without touching `Sandbox` or `Runtime` callers.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    Command, ExecResult, Feature, ResourceUsage, SandboxConfig, SandboxError, TIMEOUT_EXIT_CODE,
};

/// Time the child and its output readers get past the command timeout,
/// shared by the kill wait and the pipe drain.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

/// Per-stream capture cap; the pipe keeps being drained past it.
const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Low-level executor injected into every sandbox.
#[async_trait]
pub trait IsolationStrategy: Send + Sync {
    /// Short identifier used in logs (e.g. `"direct"`).
    fn name(&self) -> &'static str;

    /// Whether sandboxes using this strategy can offer `feature`.
    fn supports(&self, feature: Feature) -> bool;

    /// Applies the sandbox's resource posture. Called once, on start.
    async fn constrain(&self, sandbox_id: &str, config: &SandboxConfig) -> Result<(), SandboxError>;

    /// Runs one command to completion or until `timeout` expires.
    ///
    /// Must return within `timeout` plus [`KILL_GRACE`], killing the
    /// process on expiry.
    async fn spawn(
        &self,
        sandbox_id: &str,
        config: &SandboxConfig,
        command: &Command,
        timeout: Duration,
    ) -> Result<ExecResult, SandboxError>;

    /// Releases everything `constrain` and `spawn` acquired.
    async fn teardown(&self, sandbox_id: &str) -> Result<(), SandboxError>;

    /// Stages a host file into the sandbox.
    async fn copy_in(&self, sandbox_id: &str, src: &Path, dst: &Path) -> Result<(), SandboxError>;

    /// Stages a sandbox file out to the host.
    async fn copy_out(&self, sandbox_id: &str, src: &Path, dst: &Path) -> Result<(), SandboxError>;

    fn usage(&self, _sandbox_id: &str) -> ResourceUsage {
        ResourceUsage::default()
    }
}

// ── DirectProcess ────────────────────────────────────────

/// Runs commands directly on the host.
///
/// The sandbox shares the host filesystem, so staging files is a no-op.
/// Memory, CPU and seccomp settings are accepted but not enforced.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectProcess;

#[async_trait]
impl IsolationStrategy for DirectProcess {
    fn name(&self) -> &'static str {
        "direct"
    }

    /// Host processes can neither be frozen nor snapshotted.
    fn supports(&self, feature: Feature) -> bool {
        feature == Feature::Networking
    }

    async fn constrain(&self, sandbox_id: &str, config: &SandboxConfig) -> Result<(), SandboxError> {
        debug!(
            "Sandbox {sandbox_id}: direct strategy, limits are logical only \
             (memory={}B cpu={} network={} seccomp={})",
            config.memory, config.cpu, config.network, config.seccomp
        );
        Ok(())
    }

    async fn spawn(
        &self,
        sandbox_id: &str,
        config: &SandboxConfig,
        command: &Command,
        timeout: Duration,
    ) -> Result<ExecResult, SandboxError> {
        let started = Instant::now();

        let mut process = tokio::process::Command::new(&command.path);
        process
            .args(&command.args)
            .envs(&config.env)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = process.spawn().map_err(|source| SandboxError::Spawn {
            path: command.path.clone(),
            source,
        })?;
        debug!(
            "Sandbox {sandbox_id}: spawned {} (pid {:?}, timeout {:?})",
            command.path,
            child.id(),
            timeout
        );

        let (stdout, stdout_task) = capture(child.stdout.take());
        let (stderr, stderr_task) = capture(child.stderr.take());

        let waited = tokio::time::timeout(timeout, child.wait()).await;
        let (exit_code, timed_out, grace_deadline) = match waited {
            Ok(status) => {
                let grace_deadline = tokio::time::Instant::now() + KILL_GRACE;
                (exit_code(status?), false, grace_deadline)
            }
            Err(_) => {
                let grace_deadline = tokio::time::Instant::now() + KILL_GRACE;
                warn!(
                    "Sandbox {sandbox_id}: {} exceeded {:?}, killing",
                    command.path, timeout
                );
                if let Err(e) = child.start_kill() {
                    warn!("Sandbox {sandbox_id}: kill failed: {e}");
                }
                if tokio::time::timeout_at(grace_deadline, child.wait()).await.is_err() {
                    warn!("Sandbox {sandbox_id}: child did not exit within grace period");
                }
                (TIMEOUT_EXIT_CODE, true, grace_deadline)
            }
        };

        // Grandchildren can keep the pipes open; never wait on them past the grace.
        drain(stdout_task, grace_deadline).await;
        drain(stderr_task, grace_deadline).await;

        Ok(ExecResult {
            exit_code,
            stdout: take_text(&stdout),
            stderr: take_text(&stderr),
            duration: started.elapsed(),
            timed_out,
        })
    }

    async fn teardown(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        debug!("Sandbox {sandbox_id}: direct strategy has nothing to tear down");
        Ok(())
    }

    async fn copy_in(&self, _sandbox_id: &str, _src: &Path, _dst: &Path) -> Result<(), SandboxError> {
        Ok(())
    }

    async fn copy_out(&self, _sandbox_id: &str, _src: &Path, _dst: &Path) -> Result<(), SandboxError> {
        Ok(())
    }
}

// ── Output capture ───────────────────────────────────────

type CaptureBuffer = Arc<Mutex<Vec<u8>>>;

/// Reads a child stream into a shared buffer on a background task.
fn capture<R>(stream: Option<R>) -> (CaptureBuffer, Option<JoinHandle<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer: CaptureBuffer = Arc::new(Mutex::new(Vec::new()));
    let task = stream.map(|mut stream| {
        let sink = Arc::clone(&buffer);
        tokio::spawn(async move {
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let mut captured = sink.lock();
                        let room = MAX_CAPTURE_BYTES.saturating_sub(captured.len());
                        captured.extend_from_slice(&chunk[..n.min(room)]);
                    }
                }
            }
        })
    });
    (buffer, task)
}

/// Waits for a reader until `deadline`, then aborts it.
async fn drain(task: Option<JoinHandle<()>>, deadline: tokio::time::Instant) {
    if let Some(mut task) = task {
        if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
            task.abort();
        }
    }
}

fn take_text(buffer: &CaptureBuffer) -> String {
    String::from_utf8_lossy(&buffer.lock()).into_owned()
}

/// Exit status as a shell would report it (`128 + signal` for signal deaths).
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(command: Command, timeout: Duration) -> Result<ExecResult, SandboxError> {
        DirectProcess
            .spawn("test", &SandboxConfig::default(), &command, timeout)
            .await
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr_separately() {
        let result = run(
            Command::shell("echo out; echo err >&2"),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_data() {
        let result = run(Command::shell("exit 7"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 7);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_missing_executable_is_spawn_error() {
        let result = run(
            Command::new("/definitely/not/a/real/binary"),
            Duration::from_secs(10),
        )
        .await;
        assert!(matches!(result, Err(SandboxError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_env_overrides_are_applied() {
        let mut config = SandboxConfig::default();
        config.env.insert("FROM_CONFIG".into(), "config".into());
        config.env.insert("OVERRIDDEN".into(), "config".into());
        let command = Command::shell("echo $FROM_CONFIG-$OVERRIDDEN").env("OVERRIDDEN", "command");

        let result = DirectProcess
            .spawn("test", &config, &command, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "config-command");
    }

    #[tokio::test]
    async fn test_timeout_kills_and_returns_partial_output() {
        let started = Instant::now();
        let result = run(
            Command::shell("echo before; sleep 30; echo after"),
            Duration::from_millis(300),
        )
        .await
        .unwrap();

        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.stdout.contains("before"));
        assert!(!result.stdout.contains("after"));
        // `sleep` outlives the shell and holds the pipes until the grace runs out
        assert!(started.elapsed() < Duration::from_millis(300) + KILL_GRACE + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_background_child_does_not_hold_exit() {
        let started = Instant::now();
        let result = run(Command::shell("echo up; sleep 30 &"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(!result.timed_out);
        assert_eq!(result.stdout, "up\n");
        assert!(started.elapsed() < KILL_GRACE + Duration::from_millis(500));
    }

    #[test]
    fn test_direct_process_features() {
        assert!(DirectProcess.supports(Feature::Networking));
        assert!(!DirectProcess.supports(Feature::Pause));
        assert!(!DirectProcess.supports(Feature::Snapshots));
    }

    #[test]
    fn test_exit_code_from_status() {
        let status = std::process::Command::new("sh")
            .args(["-c", "exit 3"])
            .status()
            .unwrap();
        assert_eq!(exit_code(status), 3);
    }
}
