//! Scoped suspension of the background listener.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error};

use crate::error::ScriptFailure;
use crate::runner::ScriptRunner;

/// Failure of one side of the guard. Never both.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// The listener was not stopped; the guarded work did not run.
    #[error("failed to stop listener: {0}")]
    StopFailed(ScriptFailure),

    /// The guarded work ran but the listener may be left stopped.
    #[error("failed to resume listener: {0}")]
    ResumeFailed(ScriptFailure),
}

/// Stops the listener before guarded work and resumes it afterwards.
pub struct ListenerGuard {
    runner: Arc<dyn ScriptRunner>,
    stop_script: PathBuf,
    resume_script: PathBuf,
    timeout: Duration,
}

impl ListenerGuard {
    pub fn new(
        runner: Arc<dyn ScriptRunner>,
        stop_script: impl Into<PathBuf>,
        resume_script: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            stop_script: stop_script.into(),
            resume_script: resume_script.into(),
            timeout,
        }
    }

    /// Run the stop script.
    pub async fn stop(&self) -> Result<(), ScriptFailure> {
        debug!(script = %self.stop_script.display(), "Stopping listener");
        self.run_step(&self.stop_script).await.inspect_err(|e| {
            error!(script = %self.stop_script.display(), error = %e, "Failed to stop listener");
        })
    }

    /// Run the resume script.
    pub async fn resume(&self) -> Result<(), ScriptFailure> {
        debug!(script = %self.resume_script.display(), "Resuming listener");
        self.run_step(&self.resume_script).await.inspect_err(|e| {
            error!(
                script = %self.resume_script.display(),
                error = %e,
                "Failed to resume listener; it may be left stopped"
            );
        })
    }

    /// Run `work` with the listener stopped.
    ///
    /// If stopping fails, `work` is not run and no resume is attempted.
    /// Otherwise resume runs on every exit from `work`, including a panic,
    /// which is re-raised once resume has been attempted.
    pub async fn scoped<F, Fut, T>(&self, work: F) -> Result<T, GuardError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.stop().await.map_err(GuardError::StopFailed)?;

        let outcome = AssertUnwindSafe(async move { work().await })
            .catch_unwind()
            .await;
        let resumed = self.resume().await;

        match outcome {
            Ok(value) => {
                resumed.map_err(GuardError::ResumeFailed)?;
                Ok(value)
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn run_step(&self, script: &Path) -> Result<(), ScriptFailure> {
        let result = self.runner.run(script, self.timeout).await?;
        if result.successful() {
            Ok(())
        } else {
            Err(ScriptFailure::NonZero(result))
        }
    }
}
