//! In-memory fakes for the runner seam (testing only)
//!
//! Provides `ScriptedRunner`, which satisfies the [`ScriptRunner`] contract
//! without spawning processes and records every invocation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RunnerError;
use crate::runner::{ExecutionResult, ScriptRunner};

/// How a scripted script behaves when run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptBehavior {
    /// Exit with the given code and no output.
    Exit(i32),

    /// Exit with the given code and output.
    Output {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// Run past the timeout and get killed.
    Hang,

    /// Fail to launch at all.
    Missing,

    /// Never finish; only cancellation ends the call.
    Block,
}

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCall {
    pub script: PathBuf,
    pub timeout: Duration,
}

/// Runner that answers from a script table. Unscripted scripts exit 0.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    behaviors: Mutex<HashMap<PathBuf, ScriptBehavior>>,
    calls: Mutex<Vec<ScriptCall>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`ScriptedRunner::set`].
    pub fn with(self, script: impl Into<PathBuf>, behavior: ScriptBehavior) -> Self {
        self.set(script, behavior);
        self
    }

    pub fn set(&self, script: impl Into<PathBuf>, behavior: ScriptBehavior) {
        self.behaviors.lock().unwrap().insert(script.into(), behavior);
    }

    /// All invocations in order.
    pub fn calls(&self) -> Vec<ScriptCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Scripts invoked, in order.
    pub fn invoked_scripts(&self) -> Vec<PathBuf> {
        self.calls().into_iter().map(|c| c.script).collect()
    }

    pub fn was_invoked(&self, script: impl AsRef<Path>) -> bool {
        let script = script.as_ref();
        self.calls.lock().unwrap().iter().any(|c| c.script == script)
    }
}

#[async_trait]
impl ScriptRunner for ScriptedRunner {
    async fn run(&self, script: &Path, timeout: Duration) -> Result<ExecutionResult, RunnerError> {
        self.calls.lock().unwrap().push(ScriptCall {
            script: script.to_path_buf(),
            timeout,
        });

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(script)
            .cloned()
            .unwrap_or(ScriptBehavior::Exit(0));

        match behavior {
            ScriptBehavior::Exit(code) => Ok(ExecutionResult::completed(script, code, "", "", 0)),
            ScriptBehavior::Output {
                exit_code,
                stdout,
                stderr,
            } => Ok(ExecutionResult::completed(script, exit_code, stdout, stderr, 0)),
            ScriptBehavior::Hang => Ok(ExecutionResult::timed_out_after(
                script,
                timeout,
                timeout.as_millis() as u64,
            )),
            ScriptBehavior::Block => std::future::pending().await,
            ScriptBehavior::Missing => Err(RunnerError::Spawn {
                script: script.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted launch failure"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unscripted_script_succeeds() {
        let runner = ScriptedRunner::new();
        let result = runner.run(Path::new("a"), Duration::from_secs(1)).await.unwrap();
        assert!(result.successful());
        assert!(runner.was_invoked("a"));
    }

    #[tokio::test]
    async fn test_scripted_behaviors() {
        let runner = ScriptedRunner::new()
            .with("fail", ScriptBehavior::Exit(2))
            .with("hang", ScriptBehavior::Hang)
            .with("missing", ScriptBehavior::Missing);

        let fail = runner.run(Path::new("fail"), Duration::from_secs(1)).await.unwrap();
        assert_eq!(fail.exit_code, 2);

        let hang = runner.run(Path::new("hang"), Duration::from_secs(1)).await.unwrap();
        assert!(hang.timed_out());

        assert!(runner.run(Path::new("missing"), Duration::from_secs(1)).await.is_err());
        assert_eq!(
            runner.invoked_scripts(),
            vec![PathBuf::from("fail"), PathBuf::from("hang"), PathBuf::from("missing")]
        );
    }

    #[tokio::test]
    async fn test_blocked_script_only_ends_on_cancel() {
        let runner = ScriptedRunner::new().with("block", ScriptBehavior::Block);
        let run = runner.run(Path::new("block"), Duration::from_secs(1));
        assert!(tokio::time::timeout(Duration::from_millis(50), run).await.is_err());
        assert!(runner.was_invoked("block"));
    }
}
