//! Error taxonomy for the aggregation controller.

use std::path::PathBuf;

use crate::runner::ExecutionResult;

/// Errors raised while launching or waiting on a collaborator script.
///
/// These never describe a script that ran and returned a non-zero code;
/// that case is an ordinary [`ExecutionResult`].
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to launch {script}: {source}")]
    Spawn {
        script: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed while waiting on {script}: {source}")]
    Wait {
        script: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("running scripts is not supported on this platform ({0})")]
    UnsupportedPlatform(&'static str),
}

/// Why a single collaborator script did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum ScriptFailure {
    #[error("{0}")]
    NonZero(ExecutionResult),

    #[error(transparent)]
    Launch(#[from] RunnerError),
}

impl ScriptFailure {
    /// Launch failures are fatal misconfigurations rather than job failures.
    pub fn is_launch(&self) -> bool {
        matches!(self, ScriptFailure::Launch(_))
    }
}

/// Non-fatal failure classes that end a run with a `Failed` record.
#[derive(Debug, thiserror::Error)]
pub enum FailureCause {
    #[error("listener could not be stopped, aggregation did not run: {0}")]
    ListenerStop(ScriptFailure),

    #[error("aggregation script failed: {0}")]
    Aggregation(ScriptFailure),

    #[error("listener could not be resumed and may be left stopped: {0}")]
    ListenerResume(ScriptFailure),

    /// A shutdown signal arrived while the listener was suspended.
    #[error("interrupted by a shutdown signal; running scripts were killed")]
    Interrupted,
}

/// Errors reading or writing the attempt state file.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse state file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid attempt record: {0}")]
    Invalid(String),
}

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Fatal errors that escape the controller instead of becoming an outcome.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_launch_failures_are_launch() {
        let launch = ScriptFailure::from(RunnerError::Spawn {
            script: PathBuf::from("run_aggregator"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        });
        assert!(launch.is_launch());
        assert!(launch.to_string().contains("run_aggregator"));

        let exited = ScriptFailure::NonZero(ExecutionResult::completed("run_aggregator", 2, "", "", 0));
        assert!(!exited.is_launch());
    }
}
