//! Aggregation orchestration and attempt recording.
//!
//! One invocation moves through:
//!
//! ```text
//! CheckingPrior -> Aborted
//!               -> Guarding -> Running -> Succeeded | Failed -> Persisting -> Done
//! ```
//!
//! A shutdown signal during `Guarding` or `Running` kills the running
//! script, resumes the listener and records the attempt as failed.
//!
//! A previous failed attempt blocks the run until an operator clears it.
//! At most one invocation may run per state file; the scheduler is
//! responsible for that, nothing here locks.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::AggregatorConfig;
use crate::error::{FailureCause, Result, ScriptFailure};
use crate::guard::{GuardError, ListenerGuard};
use crate::runner::ScriptRunner;
use crate::state::{AttemptRecord, Outcome, StateStore};

/// Result of one controller invocation.
#[derive(Debug)]
pub enum RunOutcome {
    /// Listener stopped and resumed, aggregation exited 0.
    Succeeded,

    /// Something went wrong after the prior-state check; recorded as failed.
    Failed(FailureCause),

    /// The previous attempt failed and is unresolved; nothing was run or written.
    Aborted { failed_at: DateTime<Utc> },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }

    /// Process exit status for the scheduler.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }
}

/// Run-once controller for the aggregation job.
pub struct AggregationController {
    store: StateStore,
    guard: ListenerGuard,
    runner: Arc<dyn ScriptRunner>,
    aggregation_script: PathBuf,
    aggregation_timeout: Duration,
}

impl AggregationController {
    pub fn new(
        store: StateStore,
        guard: ListenerGuard,
        runner: Arc<dyn ScriptRunner>,
        aggregation_script: impl Into<PathBuf>,
        aggregation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            guard,
            runner,
            aggregation_script: aggregation_script.into(),
            aggregation_timeout,
        }
    }

    /// Build a controller from validated configuration.
    pub fn from_config(config: &AggregatorConfig, runner: Arc<dyn ScriptRunner>) -> Result<Self> {
        config.validate()?;
        let guard = ListenerGuard::new(
            runner.clone(),
            config.stop_listener_script_path(),
            config.resume_listener_script_path(),
            config.listener_timeout(),
        );
        Ok(Self::new(
            StateStore::new(config.state_path()),
            guard,
            runner,
            config.aggregation_script_path(),
            config.aggregation_timeout(),
        ))
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run one invocation.
    ///
    /// Returns `Err` only when the state file cannot be read, parsed or
    /// written; every other failure is folded into the outcome.
    pub async fn run(&self) -> Result<RunOutcome> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Run one invocation, abandoning the guarded work when `shutdown` completes.
    ///
    /// Dropping the in-flight script run kills it. The listener is then
    /// resumed and the attempt recorded as failed.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<RunOutcome>
    where
        S: Future<Output = ()>,
    {
        let run_id = Uuid::new_v4();
        self.execute(shutdown)
            .instrument(info_span!("aggregation", run_id = %run_id))
            .await
    }

    async fn execute<S>(&self, shutdown: S) -> Result<RunOutcome>
    where
        S: Future<Output = ()>,
    {
        let prior = self.store.load().inspect_err(|e| {
            error!(error = %e, "Cannot read previous aggregation attempt; refusing to run");
        })?;

        match &prior {
            Some(record) if record.is_failed() => {
                error!(
                    failed_at = %record.timestamp(),
                    state_file = %self.store.path().display(),
                    "Previous aggregation failed and is unresolved; refusing to run"
                );
                return Ok(RunOutcome::Aborted {
                    failed_at: record.timestamp(),
                });
            }
            Some(record) => debug!(succeeded_at = %record.timestamp(), "Previous aggregation succeeded"),
            None => debug!("No previous aggregation attempt"),
        }

        let guarded = tokio::select! {
            guarded = self.guard.scoped(move || self.run_aggregation()) => Some(guarded),
            () = shutdown => None,
        };

        let outcome = match guarded {
            Some(Ok(Ok(()))) => RunOutcome::Succeeded,
            Some(Ok(Err(failure))) => RunOutcome::Failed(FailureCause::Aggregation(failure)),
            Some(Err(GuardError::StopFailed(failure))) => {
                report_launch(&failure);
                error!(error = %failure, "Aggregation did not run: listener could not be stopped");
                RunOutcome::Failed(FailureCause::ListenerStop(failure))
            }
            Some(Err(GuardError::ResumeFailed(failure))) => {
                report_launch(&failure);
                error!(
                    error = %failure,
                    "Listener could not be resumed after aggregation and may be left stopped"
                );
                RunOutcome::Failed(FailureCause::ListenerResume(failure))
            }
            None => {
                error!("Aggregation interrupted by shutdown signal; running script was killed");
                match self.guard.resume().await {
                    Ok(()) => RunOutcome::Failed(FailureCause::Interrupted),
                    Err(failure) => {
                        report_launch(&failure);
                        RunOutcome::Failed(FailureCause::ListenerResume(failure))
                    }
                }
            }
        };

        let record = AttemptRecord::now(if outcome.is_success() {
            Outcome::Success
        } else {
            Outcome::Failed
        });
        self.store.save(&record).inspect_err(|e| {
            error!(error = %e, "Failed to record aggregation outcome");
        })?;

        match &outcome {
            RunOutcome::Succeeded => info!("Aggregation completed successfully"),
            RunOutcome::Failed(FailureCause::Interrupted) => {
                warn!("Aggregation recorded as failed after interruption")
            }
            _ => error!("Aggregation failed"),
        }
        Ok(outcome)
    }

    async fn run_aggregation(&self) -> std::result::Result<(), ScriptFailure> {
        info!(
            script = %self.aggregation_script.display(),
            timeout_secs = self.aggregation_timeout.as_secs(),
            "Running aggregation"
        );

        let result = match self
            .runner
            .run(&self.aggregation_script, self.aggregation_timeout)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                let failure = ScriptFailure::from(e);
                report_launch(&failure);
                return Err(failure);
            }
        };

        if result.successful() {
            info!(duration_ms = result.duration_ms, "Aggregation script completed");
            return Ok(());
        }

        if result.timed_out() {
            error!(
                timeout_secs = self.aggregation_timeout.as_secs(),
                "Aggregation script timed out and was killed"
            );
        } else {
            error!(
                exit_code = result.exit_code,
                stderr = %result.stderr,
                "Aggregation script failed"
            );
        }
        Err(ScriptFailure::NonZero(result))
    }
}

fn report_launch(failure: &ScriptFailure) {
    if failure.is_launch() {
        error!(error = %failure, "Fatal: collaborator script could not be launched");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ExecutionResult;

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunOutcome::Succeeded.exit_code(), 0);
        assert_eq!(
            RunOutcome::Aborted {
                failed_at: Utc::now()
            }
            .exit_code(),
            1
        );
        let failure = ScriptFailure::NonZero(ExecutionResult::completed("agg", 2, "", "", 0));
        assert_eq!(
            RunOutcome::Failed(FailureCause::Aggregation(failure)).exit_code(),
            1
        );
    }

    #[test]
    fn test_from_config_rejects_invalid_config() {
        let config = AggregatorConfig {
            aggregation_timeout_secs: 0,
            ..Default::default()
        };
        let runner = Arc::new(crate::fakes::ScriptedRunner::new());
        assert!(AggregationController::from_config(&config, runner).is_err());
    }
}
