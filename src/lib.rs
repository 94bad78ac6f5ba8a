//! fixloop - improvement loop controller
//!
//! Coordinates a repeated improve-and-verify cycle over an external
//! pipeline: measure its errors, diagnose them, apply one fix, measure
//! again, and decide whether to keep going, retest later or stop.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`metrics`] - Metrics snapshots and improvement arithmetic
//! - [`progress`] - Cumulative progress, plateau and regression detection
//! - [`exit_policy`] - Ordered exit conditions
//! - [`evaluator`] - KEEP / MONITOR / ROLLBACK verdicts for a single fix
//! - [`decision`] - Next action after a verdict
//! - [`state`] - Run state and its atomic persistence
//! - [`collaborators`] - Contracts for the external phases, with process-backed and mock implementations
//! - [`controller`] - The loop itself, plus the final summary
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//!
//! # Example
//!
//! ```rust,ignore
//! use fixloop::{Collaborators, LoopConfig, LoopController, LoopOutcome};
//!
//! let config = LoopConfig::load(".".as_ref(), None)?;
//! let collaborators = Collaborators::from_config(&config)?;
//! let controller = LoopController::new(config, collaborators);
//!
//! match controller.run(false).await? {
//!     LoopOutcome::Completed(condition) => println!("done: {condition}"),
//!     LoopOutcome::Suspended { fix } => println!("retest {fix} later"),
//!     LoopOutcome::Paused | LoopOutcome::Interrupted => println!("state saved"),
//! }
//! ```

pub mod collaborators;
pub mod config;
pub mod controller;
pub mod decision;
pub mod error;
pub mod evaluator;
pub mod exit_policy;
pub mod metrics;
pub mod progress;
pub mod state;

// Re-export commonly used types
pub use error::{IntoLoopError, LoopError, Result};

pub use collaborators::{
    Aggregator, Collaborators, Diagnoser, Diagnosis, DiagnosisMode, Implementer, TestReport,
    Tester,
};
pub use config::{CollaboratorCommands, CommandSpec, LoopConfig};
pub use controller::{
    AutoContinue, ContinuePrompt, InterruptSignal, LoopController, LoopOutcome, StdinPrompt,
};
pub use decision::{DecisionEngine, NextAction};
pub use evaluator::{Evaluation, EvaluatorThresholds, SuccessEvaluator, TestVerdict, Verdict};
pub use exit_policy::ExitPolicy;
pub use metrics::{Improvement, Metric, MetricsSnapshot};
pub use progress::{ProgressSnapshot, ProgressTracker};
pub use state::{
    CheckpointReason, ExitCondition, FixCandidate, IterationRecord, Phase, PhaseResults,
    Priority, RunState, StateStore,
};
