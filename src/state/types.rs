//! Records and enums that make up the run state.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collaborators::DiagnosisMode;
use crate::evaluator::TestVerdict;
use crate::metrics::MetricsSnapshot;

/// Loop phase an iteration record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Aggregation,
    Diagnostics,
    Implementation,
    Testing,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aggregation => write!(f, "aggregation"),
            Self::Diagnostics => write!(f, "diagnostics"),
            Self::Implementation => write!(f, "implementation"),
            Self::Testing => write!(f, "testing"),
        }
    }
}

/// Priority assigned to a fix by diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "HIGH"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::Low => write!(f, "LOW"),
        }
    }
}

fn unknown_improvement() -> String {
    "Unknown".to_string()
}

/// A single named corrective change proposed by diagnosis.
///
/// The name is the fix's identity across iterations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixCandidate {
    pub name: String,
    pub priority: Priority,
    /// Descriptive only.
    #[serde(default = "unknown_improvement")]
    pub expected_improvement: String,
}

impl FixCandidate {
    #[must_use]
    pub fn new(name: impl Into<String>, priority: Priority) -> Self {
        Self {
            name: name.into(),
            priority,
            expected_improvement: unknown_improvement(),
        }
    }

    #[must_use]
    pub fn high(name: impl Into<String>) -> Self {
        Self::new(name, Priority::High)
    }

    #[must_use]
    pub fn with_expected_improvement(mut self, text: impl Into<String>) -> Self {
        self.expected_improvement = text.into();
        self
    }
}

/// Outcome of handing one fix to the implementation collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImplementationStatus {
    Applied,
    Failed,
}

/// Phase-specific payload of an iteration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhaseResults {
    Aggregation {
        report: PathBuf,
        metrics: MetricsSnapshot,
    },
    Diagnostics {
        report: PathBuf,
        mode: DiagnosisMode,
        fixes: Vec<FixCandidate>,
        error_types: Vec<String>,
    },
    Implementation {
        fix: FixCandidate,
        status: ImplementationStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Testing {
        fix: String,
        report: PathBuf,
        post_fix_metrics: MetricsSnapshot,
        verdict: TestVerdict,
        #[serde(default)]
        retest: bool,
    },
}

impl PhaseResults {
    /// Phase this payload belongs to.
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::Aggregation { .. } => Phase::Aggregation,
            Self::Diagnostics { .. } => Phase::Diagnostics,
            Self::Implementation { .. } => Phase::Implementation,
            Self::Testing { .. } => Phase::Testing,
        }
    }

    /// Short status shown in the iteration history.
    #[must_use]
    pub fn status(&self) -> String {
        match self {
            Self::Implementation {
                status: ImplementationStatus::Failed,
                ..
            } => "failed".to_string(),
            Self::Testing { verdict, .. } => verdict.decision.to_string(),
            _ => "success".to_string(),
        }
    }
}

/// One append-only entry in the run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based iteration the record was captured in.
    pub iteration: u32,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
    pub results: PhaseResults,
    /// Current snapshot at capture time. None before the first aggregation.
    pub metrics_snapshot: Option<MetricsSnapshot>,
}

impl IterationRecord {
    #[must_use]
    pub fn new(
        iteration: u32,
        results: PhaseResults,
        metrics_snapshot: Option<MetricsSnapshot>,
    ) -> Self {
        Self {
            iteration,
            phase: results.phase(),
            timestamp: Utc::now(),
            results,
            metrics_snapshot,
        }
    }

    /// Metrics measured by this record, if it is an aggregation record.
    #[must_use]
    pub fn aggregated_metrics(&self) -> Option<&MetricsSnapshot> {
        match &self.results {
            PhaseResults::Aggregation { metrics, .. } => Some(metrics),
            _ => None,
        }
    }
}

/// Why the loop stopped. Set once, never cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCondition {
    MaxIterationsReached,
    AllFixesAttempted,
    PlateauDetected,
    Success,
    RegressionDetected,
}

impl ExitCondition {
    /// Human-readable reason.
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::MaxIterationsReached => "Maximum iterations reached",
            Self::AllFixesAttempted => "All identified fixes have been attempted",
            Self::PlateauDetected => {
                "Progress has plateaued - no significant improvement between the last two measurements"
            }
            Self::Success => "Target improvement achieved",
            Self::RegressionDetected => "System performance has regressed - stopping",
        }
    }
}

impl std::fmt::Display for ExitCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxIterationsReached => write!(f, "max_iterations_reached"),
            Self::AllFixesAttempted => write!(f, "all_fixes_attempted"),
            Self::PlateauDetected => write!(f, "plateau_detected"),
            Self::Success => write!(f, "success"),
            Self::RegressionDetected => write!(f, "regression_detected"),
        }
    }
}

/// A fix that was applied but has no test verdict yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTest {
    pub fix: String,
    /// Iteration in which the fix was applied.
    pub iteration: u32,
    /// Aggregation artifact measured before the fix.
    pub baseline_report: PathBuf,
    /// Snapshot measured before the fix.
    pub pre_fix_metrics: MetricsSnapshot,
}

impl PendingTest {
    /// Carry the fix over to a retest after a MONITOR verdict.
    #[must_use]
    pub fn into_retest(self) -> PendingRetest {
        PendingRetest {
            fix: self.fix,
            iteration: self.iteration,
            baseline_report: self.baseline_report,
            pre_fix_metrics: self.pre_fix_metrics,
            suspended_at: Utc::now(),
            retest_count: 0,
        }
    }
}

/// A fix whose verdict was MONITOR and that waits for a retest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRetest {
    pub fix: String,
    /// Iteration in which the fix was applied.
    pub iteration: u32,
    /// Aggregation artifact measured before the fix.
    pub baseline_report: PathBuf,
    /// Snapshot measured before the fix.
    pub pre_fix_metrics: MetricsSnapshot,
    pub suspended_at: DateTime<Utc>,
    /// Retests already performed for this fix.
    #[serde(default)]
    pub retest_count: u32,
}
