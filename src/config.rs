//! Configuration for the improvement loop.
//!
//! Every threshold the controller acts on is a named option here. The
//! configuration is read from `fixloop.toml` in the work directory (or an
//! explicit path); missing keys take their defaults.
//!
//! # Example fixloop.toml
//!
//! ```toml
//! max_iterations = 8
//! plateau_threshold_pct = 5.0
//! interactive = false
//!
//! [evaluator]
//! keep_success_rate_pct = 75.0
//!
//! [collaborators.aggregation]
//! program = "python3"
//! args = ["scripts/aggregate_logs.py"]
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IntoLoopError, LoopError, Result};
use crate::evaluator::{EvaluatorThresholds, SuccessEvaluator};
use crate::exit_policy::ExitPolicy;
use crate::progress::ProgressTracker;
use crate::state::{persistence::STATE_FILE, StateStore, DEFAULT_MAX_ITERATIONS};

/// Default configuration file name inside the work directory.
pub const CONFIG_FILE: &str = "fixloop.toml";

/// Default final summary file name.
pub const SUMMARY_FILE: &str = "final_improvement_report.md";

/// An external program invoked for one collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Programs backing each collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorCommands {
    pub aggregation: Option<CommandSpec>,
    pub diagnosis: Option<CommandSpec>,
    pub implementation: Option<CommandSpec>,
    pub testing: Option<CommandSpec>,
}

impl CollaboratorCommands {
    /// (phase name, spec) pairs in loop order.
    #[must_use]
    pub fn entries(&self) -> [(&'static str, Option<&CommandSpec>); 4] {
        [
            ("aggregation", self.aggregation.as_ref()),
            ("diagnosis", self.diagnosis.as_ref()),
            ("implementation", self.implementation.as_ref()),
            ("testing", self.testing.as_ref()),
        ]
    }
}

/// Loop configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Iteration budget; reaching it ends the run.
    pub max_iterations: u32,
    /// Improvement between the last two aggregations (percent) below which
    /// progress has plateaued.
    pub plateau_threshold_pct: f64,
    /// Cumulative error reduction (percent) that ends the run as a success.
    pub success_reduction_pct: f64,
    /// Cumulative error reduction (percent) below which the run regressed.
    pub regression_threshold_pct: f64,
    /// Time window hint for the regular aggregation, in hours.
    pub aggregation_timeframe_hours: u32,
    /// Time window hint passed when retesting a monitored fix, in hours.
    pub retest_timeframe_hours: u32,
    /// Item budget for the testing collaborator.
    pub test_max_items: u32,
    /// Ask for confirmation between iterations.
    pub interactive: bool,
    /// State document name, relative to the work directory.
    pub state_file: PathBuf,
    /// Final summary name, relative to the work directory.
    pub summary_file: PathBuf,
    pub evaluator: EvaluatorThresholds,
    pub collaborators: CollaboratorCommands,
    /// Directory holding state, summary and per-iteration artifacts.
    #[serde(skip)]
    pub work_dir: PathBuf,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            plateau_threshold_pct: 5.0,
            success_reduction_pct: 90.0,
            regression_threshold_pct: -5.0,
            aggregation_timeframe_hours: 24,
            retest_timeframe_hours: 1,
            test_max_items: 20,
            interactive: true,
            state_file: PathBuf::from(STATE_FILE),
            summary_file: PathBuf::from(SUMMARY_FILE),
            evaluator: EvaluatorThresholds::default(),
            collaborators: CollaboratorCommands::default(),
            work_dir: PathBuf::from("."),
        }
    }
}

impl LoopConfig {
    /// Default configuration rooted at `work_dir`.
    #[must_use]
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration for `work_dir`.
    ///
    /// Reads `explicit` when given (it must exist), otherwise
    /// `<work_dir>/fixloop.toml` when present, otherwise defaults.
    pub fn load(work_dir: &Path, explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(LoopError::config_with_path(
                        "configuration file not found",
                        path.to_path_buf(),
                    ));
                }
                Some(path.to_path_buf())
            }
            None => Some(Self::config_path(work_dir)).filter(|p| p.exists()),
        };

        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(&path)?;
                toml::from_str::<LoopConfig>(&content).map_err(|e| {
                    LoopError::config_with_path(format!("failed to parse: {e}"), path.clone())
                })?
            }
            None => Self::default(),
        };
        config.work_dir = work_dir.to_path_buf();
        Ok(config)
    }

    /// Path of the default configuration file for a work directory.
    #[must_use]
    pub fn config_path(work_dir: &Path) -> PathBuf {
        work_dir.join(CONFIG_FILE)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).into_loop_config()
    }

    // =========================================================================
    // Builders
    // =========================================================================

    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    #[must_use]
    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    #[must_use]
    pub fn with_plateau_threshold(mut self, pct: f64) -> Self {
        self.plateau_threshold_pct = pct;
        self
    }

    #[must_use]
    pub fn with_success_reduction(mut self, pct: f64) -> Self {
        self.success_reduction_pct = pct;
        self
    }

    #[must_use]
    pub fn with_evaluator(mut self, thresholds: EvaluatorThresholds) -> Self {
        self.evaluator = thresholds;
        self
    }

    #[must_use]
    pub fn with_collaborators(mut self, collaborators: CollaboratorCommands) -> Self {
        self.collaborators = collaborators;
        self
    }

    // =========================================================================
    // Derived paths and components
    // =========================================================================

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.work_dir.join(&self.state_file)
    }

    #[must_use]
    pub fn summary_path(&self) -> PathBuf {
        self.work_dir.join(&self.summary_file)
    }

    /// Directory for one iteration's artifacts.
    #[must_use]
    pub fn iteration_dir(&self, iteration: u32) -> PathBuf {
        self.work_dir.join(format!("iteration_{iteration}"))
    }

    #[must_use]
    pub fn state_store(&self) -> StateStore {
        StateStore::new(self.state_path())
    }

    #[must_use]
    pub fn progress_tracker(&self) -> ProgressTracker {
        ProgressTracker::new(self.plateau_threshold_pct, self.regression_threshold_pct)
    }

    #[must_use]
    pub fn exit_policy(&self) -> ExitPolicy {
        ExitPolicy::new(self.progress_tracker(), self.success_reduction_pct)
    }

    #[must_use]
    pub fn success_evaluator(&self) -> SuccessEvaluator {
        SuccessEvaluator::new(self.evaluator.clone())
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Every problem with the configuration.
    #[must_use]
    pub fn problems(&self) -> Vec<LoopError> {
        let mut problems = Vec::new();
        let e = &self.evaluator;

        if self.max_iterations == 0 {
            problems.push(LoopError::invalid_config("max_iterations", "must be at least 1"));
        }
        if self.plateau_threshold_pct < 0.0 {
            problems.push(LoopError::invalid_config(
                "plateau_threshold_pct",
                "must not be negative",
            ));
        }
        if self.success_reduction_pct <= 0.0 || self.success_reduction_pct > 100.0 {
            problems.push(LoopError::invalid_config(
                "success_reduction_pct",
                "must be in (0, 100]",
            ));
        }
        if self.regression_threshold_pct > 0.0 {
            problems.push(LoopError::invalid_config(
                "regression_threshold_pct",
                "must be zero or negative",
            ));
        }
        if self.test_max_items == 0 {
            problems.push(LoopError::invalid_config("test_max_items", "must be at least 1"));
        }
        if e.monitor_success_rate_pct > e.keep_success_rate_pct {
            problems.push(LoopError::invalid_config(
                "evaluator.monitor_success_rate_pct",
                "must not exceed keep_success_rate_pct",
            ));
        }
        if e.critical_growth_factor <= 1.0 {
            problems.push(LoopError::invalid_config(
                "evaluator.critical_growth_factor",
                "must be greater than 1",
            ));
        }
        for (phase, spec) in self.collaborators.entries() {
            if let Some(spec) = spec {
                if spec.program.trim().is_empty() {
                    problems.push(LoopError::invalid_config(
                        format!("collaborators.{phase}.program"),
                        "must not be empty",
                    ));
                }
            }
        }
        problems
    }

    /// Fail with the first configuration problem, if any.
    pub fn validate(&self) -> Result<()> {
        match self.problems().into_iter().next() {
            Some(problem) => Err(problem),
            None => Ok(()),
        }
    }

    /// Collaborator programs that cannot be found on PATH or on disk.
    #[must_use]
    pub fn unresolved_programs(&self) -> Vec<(String, String)> {
        self.collaborators
            .entries()
            .into_iter()
            .filter_map(|(phase, spec)| spec.map(|s| (phase, s)))
            .filter(|(_, spec)| which::which(&spec.program).is_err())
            .map(|(phase, spec)| (phase.to_string(), spec.program.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = LoopConfig::default();
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.plateau_threshold_pct, 5.0);
        assert_eq!(config.success_reduction_pct, 90.0);
        assert_eq!(config.regression_threshold_pct, -5.0);
        assert_eq!(config.test_max_items, 20);
        assert_eq!(config.evaluator.keep_success_rate_pct, 75.0);
        assert_eq!(config.evaluator.monitor_success_rate_pct, 50.0);
        assert_eq!(config.success_evaluator().thresholds(), &config.evaluator);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = LoopConfig::load(temp.path(), None).unwrap();
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.work_dir, temp.path());
        assert_eq!(config.state_path(), temp.path().join("loop_state.json"));
    }

    #[test]
    fn test_load_partial_toml() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(CONFIG_FILE),
            r#"
max_iterations = 3
interactive = false

[evaluator]
keep_success_rate_pct = 80.0

[collaborators.aggregation]
program = "python3"
args = ["scripts/aggregate.py"]
"#,
        )
        .unwrap();

        let config = LoopConfig::load(temp.path(), None).unwrap();
        assert_eq!(config.max_iterations, 3);
        assert!(!config.interactive);
        assert_eq!(config.evaluator.keep_success_rate_pct, 80.0);
        assert_eq!(config.evaluator.monitor_success_rate_pct, 50.0);
        assert_eq!(
            config.collaborators.aggregation,
            Some(CommandSpec::new("python3").with_args(["scripts/aggregate.py"]))
        );
        assert!(config.collaborators.testing.is_none());
    }

    #[test]
    fn test_load_explicit_missing_is_error() {
        let temp = TempDir::new().unwrap();
        let err = LoopConfig::load(temp.path(), Some(&temp.path().join("nope.toml")))
            .expect_err("missing explicit config");
        assert!(matches!(err, LoopError::Config { .. }));
    }

    #[test]
    fn test_load_invalid_toml_is_error() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(CONFIG_FILE), "max_iterations = [").unwrap();
        assert!(matches!(
            LoopConfig::load(temp.path(), None),
            Err(LoopError::Config { .. })
        ));
    }

    #[test]
    fn test_validation_problems() {
        let config = LoopConfig::default()
            .with_max_iterations(0)
            .with_success_reduction(150.0);
        let problems = config.problems();
        assert_eq!(problems.len(), 2);
        assert!(matches!(
            config.validate(),
            Err(LoopError::InvalidConfig { ref field, .. }) if field == "max_iterations"
        ));
    }

    #[test]
    fn test_inverted_evaluator_thresholds_rejected() {
        let config = LoopConfig::default().with_evaluator(EvaluatorThresholds {
            keep_success_rate_pct: 40.0,
            ..EvaluatorThresholds::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_iteration_dir() {
        let config = LoopConfig::new("/work");
        assert_eq!(config.iteration_dir(3), PathBuf::from("/work/iteration_3"));
        assert_eq!(
            config.summary_path(),
            PathBuf::from("/work/final_improvement_report.md")
        );
    }

    #[test]
    fn test_unresolved_programs() {
        let config = LoopConfig::default().with_collaborators(CollaboratorCommands {
            aggregation: Some(CommandSpec::new("definitely-not-a-real-program-xyz")),
            ..CollaboratorCommands::default()
        });
        let missing = config.unresolved_programs();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].0, "aggregation");
    }

    #[test]
    fn test_to_toml_roundtrip() {
        let config = LoopConfig::default().with_max_iterations(4);
        let rendered = config.to_toml().unwrap();
        let parsed: LoopConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.max_iterations, 4);
    }
}
