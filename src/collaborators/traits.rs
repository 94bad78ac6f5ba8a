//! Collaborator contracts.
//!
//! The controller never does the real work of an iteration itself. Log
//! aggregation, diagnosis, applying a fix and measuring it are delegated to
//! the collaborators defined here, which lets the loop be driven by external
//! programs in production and by mocks in tests.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::evaluator::TestVerdict;
use crate::metrics::MetricsSnapshot;
use crate::state::FixCandidate;

/// How much analysis the diagnosis collaborator should perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisMode {
    /// Analyse everything; used on the first iteration.
    Full,
    /// Analyse only what remains after earlier fixes.
    Focused,
}

impl DiagnosisMode {
    /// Mode for a given iteration.
    #[must_use]
    pub fn for_iteration(iteration: u32) -> Self {
        if iteration <= 1 {
            Self::Full
        } else {
            Self::Focused
        }
    }
}

impl std::fmt::Display for DiagnosisMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Focused => write!(f, "focused"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationRequest {
    pub iteration: u32,
    /// How many hours of logs to aggregate.
    pub timeframe_hours: u32,
    /// Where the aggregation report is written.
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosisRequest {
    pub iteration: u32,
    pub aggregation_report: PathBuf,
    pub mode: DiagnosisMode,
    pub output: PathBuf,
}

/// Result of a diagnosis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Diagnosis {
    /// Proposed fixes in priority order.
    pub fixes: Vec<FixCandidate>,
    pub error_types: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImplementationRequest {
    pub iteration: u32,
    pub fix: FixCandidate,
    /// Diagnosis report the fix came from, when there is one.
    pub diagnosis_report: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRequest {
    pub iteration: u32,
    pub fix: String,
    /// Aggregation report measured before the fix.
    pub baseline_report: PathBuf,
    pub max_items: u32,
    /// Set when retesting a monitored fix over a shorter window.
    pub timeframe_hours: Option<u32>,
    pub output: PathBuf,
}

/// Result of testing a fix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub post_fix_metrics: MetricsSnapshot,
    /// Verdict computed by the tester. When absent the controller derives
    /// one from the snapshots.
    #[serde(default)]
    pub verdict: Option<TestVerdict>,
    #[serde(default)]
    pub alternative_solution: Option<String>,
}

/// Measures the system from its logs.
#[async_trait]
pub trait Aggregator: Send + Sync {
    /// Aggregate logs into a metrics snapshot.
    ///
    /// # Errors
    ///
    /// Any error is fatal for the run.
    async fn aggregate(&self, request: &AggregationRequest) -> Result<MetricsSnapshot>;
}

/// Turns an aggregation report into ranked fix candidates.
#[async_trait]
pub trait Diagnoser: Send + Sync {
    /// # Errors
    ///
    /// Any error is fatal for the run.
    async fn diagnose(&self, request: &DiagnosisRequest) -> Result<Diagnosis>;
}

/// Applies a fix to the system.
#[async_trait]
pub trait Implementer: Send + Sync {
    /// # Errors
    ///
    /// An error marks the fix as failed; the loop moves on.
    async fn implement(&self, request: &ImplementationRequest) -> Result<()>;
}

/// Exercises the system after a fix and measures it again.
#[async_trait]
pub trait Tester: Send + Sync {
    /// # Errors
    ///
    /// Any error is fatal for the run.
    async fn test(&self, request: &TestRequest) -> Result<TestReport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnosis_mode_for_iteration() {
        assert_eq!(DiagnosisMode::for_iteration(1), DiagnosisMode::Full);
        assert_eq!(DiagnosisMode::for_iteration(2), DiagnosisMode::Focused);
        assert_eq!(DiagnosisMode::Focused.to_string(), "focused");
    }

    #[test]
    fn test_diagnosis_defaults_missing_fields() {
        let diagnosis: Diagnosis =
            serde_json::from_str(r#"{"fixes":[{"name":"Enhanced Headers","priority":"HIGH"}]}"#)
                .unwrap();
        assert_eq!(diagnosis.fixes.len(), 1);
        assert_eq!(diagnosis.fixes[0].expected_improvement, "Unknown");
        assert!(diagnosis.error_types.is_empty());
    }

    #[test]
    fn test_report_without_verdict() {
        let report: TestReport = serde_json::from_str(
            r#"{"post_fix_metrics":{"total_search_ops":20,"title_failures":5}}"#,
        )
        .unwrap();
        assert!(report.verdict.is_none());
        assert_eq!(report.post_fix_metrics.title_failures, 5);
    }
}
