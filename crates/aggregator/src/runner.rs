//! Bounded execution of collaborator scripts.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tracing::{debug, error, info, warn};

use crate::error::RunnerError;
use crate::invoker::CommandComposer;

/// Exit code reported when a script was killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = i32::MIN;

/// Exit code reported when the OS gives neither a code nor a signal.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Timeout used by [`ScriptRunner::run_for_exit_code`].
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to keep reading output after the script has exited.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Result of one script execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Script that was executed.
    pub script: PathBuf,

    /// Exit code (0 = success, [`TIMEOUT_EXIT_CODE`] on timeout).
    pub exit_code: i32,

    /// Captured stdout, trimmed. Empty on timeout.
    pub stdout: String,

    /// Captured stderr, trimmed. Holds a diagnostic on timeout.
    pub stderr: String,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Result for a script that ran to completion.
    pub fn completed(
        script: impl Into<PathBuf>,
        exit_code: i32,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            script: script.into(),
            exit_code,
            stdout: stdout.into().trim().to_string(),
            stderr: stderr.into().trim().to_string(),
            duration_ms,
        }
    }

    /// Result for a script that was killed after `timeout`.
    pub fn timed_out_after(script: impl Into<PathBuf>, timeout: Duration, duration_ms: u64) -> Self {
        let script = script.into();
        let stderr = format!(
            "{} timed out after {}s and was killed",
            script.display(),
            timeout.as_secs_f64()
        );
        Self {
            script,
            exit_code: TIMEOUT_EXIT_CODE,
            stdout: String::new(),
            stderr,
            duration_ms,
        }
    }

    /// Whether the script exited with code 0.
    pub fn successful(&self) -> bool {
        self.exit_code == 0
    }

    /// Whether the script was killed for exceeding its timeout.
    pub fn timed_out(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.timed_out() {
            return write!(f, "{}", self.stderr);
        }
        write!(f, "{} exited with code {}", self.script.display(), self.exit_code)?;
        if !self.stderr.is_empty() {
            write!(f, ": {}", self.stderr)?;
        }
        Ok(())
    }
}

/// Runs collaborator scripts.
///
/// Implementations must never leave a child running once a call errors,
/// times out, or its future is dropped. A script that exits normally may
/// leave background processes behind.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run `script`, killing it if it is still running after `timeout`.
    ///
    /// A timeout is not an error: it yields a result carrying
    /// [`TIMEOUT_EXIT_CODE`]. Errors are reserved for launch failures.
    async fn run(&self, script: &Path, timeout: Duration) -> Result<ExecutionResult, RunnerError>;

    /// Run `script` under [`DEFAULT_SCRIPT_TIMEOUT`] and return only its exit code.
    async fn run_for_exit_code(&self, script: &Path) -> Result<i32, RunnerError> {
        let result = self.run(script, DEFAULT_SCRIPT_TIMEOUT).await?;
        if result.successful() {
            info!(script = %script.display(), output = %result.stdout, "Script completed");
        } else if !result.stderr.is_empty() {
            error!(script = %script.display(), stderr = %result.stderr, "Script failed");
        } else {
            error!(
                script = %script.display(),
                exit_code = result.exit_code,
                "Script returned non-zero without output"
            );
        }
        Ok(result.exit_code)
    }
}

/// Runs scripts as child processes of the current process.
pub struct ProcessRunner {
    composer: Arc<dyn CommandComposer>,
}

impl ProcessRunner {
    /// Create a runner using the given platform composer.
    pub fn new(composer: Arc<dyn CommandComposer>) -> Self {
        Self { composer }
    }

    /// Create a runner for the host platform.
    pub fn for_host() -> Result<Self, RunnerError> {
        Ok(Self::new(crate::invoker::host_composer()?))
    }
}

#[async_trait]
impl ScriptRunner for ProcessRunner {
    async fn run(&self, script: &Path, timeout: Duration) -> Result<ExecutionResult, RunnerError> {
        let start = Instant::now();

        debug!(
            script = %script.display(),
            composer = self.composer.name(),
            timeout_secs = timeout.as_secs(),
            "Launching script"
        );

        let mut command = self.composer.compose(script);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
            script: script.to_path_buf(),
            source,
        })?;
        let mut group = ProcessGroup::of(&child);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let waited = {
            let streams = drain_streams(
                child.stdout.take(),
                child.stderr.take(),
                &mut stdout,
                &mut stderr,
            );
            tokio::pin!(streams);
            let mut drained = false;

            let waited = tokio::time::timeout(timeout, async {
                loop {
                    tokio::select! {
                        status = child.wait() => break status,
                        read = &mut streams, if !drained => {
                            drained = true;
                            if let Err(e) = read {
                                warn!(script = %script.display(), error = %e, "Failed to read script output");
                            }
                        }
                    }
                }
            })
            .await;

            // Background processes started by the script may hold the pipes open.
            if matches!(waited, Ok(Ok(_)))
                && !drained
                && tokio::time::timeout(OUTPUT_GRACE, &mut streams).await.is_err()
            {
                debug!(script = %script.display(), "Script output still held open after exit");
            }
            waited
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match waited {
            Ok(Ok(status)) => {
                // Whatever the script left behind on a normal exit is not ours to kill.
                group.release();
                let exit_code = exit_code_of(status);
                debug!(script = %script.display(), exit_code, duration_ms, "Script exited");
                Ok(ExecutionResult::completed(
                    script,
                    exit_code,
                    String::from_utf8_lossy(&stdout),
                    String::from_utf8_lossy(&stderr),
                    duration_ms,
                ))
            }
            Ok(Err(source)) => {
                group.kill();
                let _ = child.kill().await;
                Err(RunnerError::Wait {
                    script: script.to_path_buf(),
                    source,
                })
            }
            Err(_elapsed) => {
                group.kill();
                if let Err(e) = child.kill().await {
                    warn!(script = %script.display(), error = %e, "Failed to kill timed out script");
                }
                Ok(ExecutionResult::timed_out_after(script, timeout, duration_ms))
            }
        }
    }
}

/// Process group of a running script, killed on drop unless released.
///
/// Covers cancellation: if the future running the script is dropped, every
/// process the script started goes with it.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self { pgid: child.id() }
    }

    fn release(&mut self) {
        self.pgid = None;
    }

    fn kill(&mut self) {
        let Some(pgid) = self.pgid.take() else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            // ESRCH just means the group is already gone.
            let _ = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL);
        }
        // Elsewhere `kill_on_drop` only reaches the direct child.
        #[cfg(not(unix))]
        let _ = pgid;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Drain both pipes so a chatty child cannot block on a full pipe.
///
/// Bytes land in the buffers as they arrive, so a partial read survives
/// the future being dropped.
async fn drain_streams(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    out: &mut Vec<u8>,
    err: &mut Vec<u8>,
) -> std::io::Result<()> {
    tokio::try_join!(drain(stdout, out), drain(stderr, err))?;
    Ok(())
}

async fn drain<R: AsyncRead + Unpin>(stream: Option<R>, buf: &mut Vec<u8>) -> std::io::Result<()> {
    let Some(mut stream) = stream else {
        return Ok(());
    };
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
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
    UNKNOWN_EXIT_CODE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_result_trims_streams() {
        let result = ExecutionResult::completed("agg", 0, "  done\n", "\n", 12);
        assert!(result.successful());
        assert!(!result.timed_out());
        assert_eq!(result.stdout, "done");
        assert_eq!(result.stderr, "");
    }

    #[test]
    fn test_failed_result_display_includes_stderr() {
        let result = ExecutionResult::completed("/opt/agg/run", 3, "", "disk full", 5);
        assert!(!result.successful());
        assert_eq!(result.to_string(), "/opt/agg/run exited with code 3: disk full");
    }

    #[test]
    fn test_timed_out_result() {
        let result = ExecutionResult::timed_out_after("run_aggregator", Duration::from_secs(60), 60_000);
        assert!(result.timed_out());
        assert!(!result.successful());
        assert!(result.stdout.is_empty());
        assert!(result.stderr.contains("run_aggregator"));
        assert!(result.stderr.contains("timed out"));
        assert_eq!(result.to_string(), result.stderr);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::invoker::{BashComposer, DirectComposer};
        use tempfile::TempDir;

        // Scripts are run through `sh` so freshly written files never need exec permission.
        fn sh_runner() -> ProcessRunner {
            ProcessRunner::new(Arc::new(BashComposer {
                shell: PathBuf::from("sh"),
            }))
        }

        fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
            let path = dir.path().join(name);
            std::fs::write(&path, body).expect("write script");
            path
        }

        #[tokio::test]
        async fn test_run_captures_stdout_and_exit_code() {
            let dir = TempDir::new().unwrap();
            let script = write_script(&dir, "ok.sh", "echo hello\necho warn >&2\nexit 0\n");

            let result = sh_runner()
                .run(&script, Duration::from_secs(10))
                .await
                .expect("run failed");

            assert!(result.successful());
            assert_eq!(result.stdout, "hello");
            assert_eq!(result.stderr, "warn");
        }

        #[tokio::test]
        async fn test_run_reports_non_zero_exit() {
            let dir = TempDir::new().unwrap();
            let script = write_script(&dir, "fail.sh", "echo broken >&2\nexit 7\n");

            let result = sh_runner()
                .run(&script, Duration::from_secs(10))
                .await
                .expect("run failed");

            assert!(!result.successful());
            assert_eq!(result.exit_code, 7);
            assert_eq!(result.stderr, "broken");
        }

        #[tokio::test]
        async fn test_run_kills_script_on_timeout() {
            let dir = TempDir::new().unwrap();
            let script = write_script(&dir, "hang.sh", "exec sleep 30\n");

            let start = Instant::now();
            let result = sh_runner()
                .run(&script, Duration::from_millis(200))
                .await
                .expect("timeout is not an error");

            assert!(result.timed_out());
            assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
            assert!(result.stderr.contains("timed out"));
            assert!(start.elapsed() < Duration::from_secs(10));
        }

        /// Whether `pid` is still a live process. Zombies count as gone.
        fn is_alive(pid: i32) -> bool {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;
            if kill(Pid::from_raw(pid), None).is_err() {
                return false;
            }
            if !Path::new("/proc").exists() {
                return true;
            }
            match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                Ok(stat) => !stat
                    .rsplit(')')
                    .next()
                    .is_some_and(|rest| rest.trim_start().starts_with('Z')),
                Err(_) => false,
            }
        }

        async fn wait_until_gone(pid: i32) -> bool {
            for _ in 0..40 {
                if !is_alive(pid) {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            false
        }

        async fn read_pid(path: &Path) -> i32 {
            for _ in 0..40 {
                if let Ok(raw) = std::fs::read_to_string(path) {
                    if let Ok(pid) = raw.trim().parse() {
                        return pid;
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            panic!("no pid written to {}", path.display());
        }

        #[tokio::test]
        async fn test_background_process_does_not_hold_up_exit() {
            let dir = TempDir::new().unwrap();
            let script = write_script(&dir, "resume.sh", "sleep 5 &\necho resumed\nexit 0\n");

            let start = Instant::now();
            let result = sh_runner()
                .run(&script, Duration::from_secs(3))
                .await
                .expect("run failed");

            assert!(!result.timed_out(), "reported as timeout: {}", result);
            assert!(result.successful());
            assert_eq!(result.stdout, "resumed");
            assert!(start.elapsed() < Duration::from_secs(2));
        }

        #[tokio::test]
        async fn test_timeout_kills_grandchildren() {
            let dir = TempDir::new().unwrap();
            let pid_file = dir.path().join("pid");
            let script = write_script(
                &dir,
                "worker.sh",
                &format!("sleep 30 &\necho $! > '{}'\nwait\n", pid_file.display()),
            );

            let result = sh_runner()
                .run(&script, Duration::from_millis(500))
                .await
                .expect("timeout is not an error");
            assert!(result.timed_out());

            let grandchild = read_pid(&pid_file).await;
            assert!(wait_until_gone(grandchild).await, "pid {grandchild} survived the timeout");
        }

        #[tokio::test]
        async fn test_dropped_run_kills_script() {
            let dir = TempDir::new().unwrap();
            let pid_file = dir.path().join("pid");
            let script = write_script(
                &dir,
                "long.sh",
                &format!("sleep 30 &\necho $! > '{}'\nwait\n", pid_file.display()),
            );

            let runner = sh_runner();
            let cancelled =
                tokio::time::timeout(Duration::from_millis(500), runner.run(&script, Duration::from_secs(30)))
                    .await;
            assert!(cancelled.is_err());

            let grandchild = read_pid(&pid_file).await;
            assert!(wait_until_gone(grandchild).await, "pid {grandchild} survived cancellation");
        }

        #[tokio::test]
        async fn test_missing_script_is_launch_error() {
            let dir = TempDir::new().unwrap();
            let runner = ProcessRunner::new(Arc::new(DirectComposer));

            let err = runner
                .run(&dir.path().join("does_not_exist"), Duration::from_secs(5))
                .await
                .unwrap_err();

            assert!(matches!(err, RunnerError::Spawn { .. }));
        }

        #[tokio::test]
        async fn test_run_for_exit_code() {
            let dir = TempDir::new().unwrap();
            let script = write_script(&dir, "code.sh", "exit 4\n");

            let code = sh_runner().run_for_exit_code(&script).await.expect("run failed");
            assert_eq!(code, 4);
        }
    }
}
