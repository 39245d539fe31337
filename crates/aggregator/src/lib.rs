//! Aggregator - orchestration controller for the periodic aggregation job
//!
//! Provides a run-once controller that:
//! - Refuses to run while the previous attempt is recorded as failed
//! - Stops the background listener for the duration of the job
//! - Runs the aggregation script under a bounded timeout
//! - Always resumes the listener and records the outcome for the next run

pub mod config;
pub mod controller;
pub mod error;
pub mod fakes;
pub mod guard;
pub mod invoker;
pub mod runner;
pub mod state;
pub mod telemetry;

// Re-export key types
pub use config::AggregatorConfig;
pub use controller::{AggregationController, RunOutcome};
pub use error::{ConfigError, ControllerError, FailureCause, Result, RunnerError, ScriptFailure, StateError};
pub use guard::{GuardError, ListenerGuard};
pub use invoker::{host_composer, BashComposer, CommandComposer, DirectComposer};
pub use runner::{ExecutionResult, ProcessRunner, ScriptRunner, TIMEOUT_EXIT_CODE};
pub use state::{AttemptRecord, Outcome, StateStore};
pub use telemetry::init_tracing;
