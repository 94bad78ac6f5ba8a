//! Success evaluation of a single fix.
//!
//! Compares the snapshot measured before a fix with the one measured after
//! it and turns the comparison into a KEEP / MONITOR / ROLLBACK verdict.
//! Every tracked metric is an error count, so lower is always better.
//!
//! Decision rule, first match wins:
//!
//! 1. any failure indicator → ROLLBACK
//! 2. success rate ≥ keep threshold (75%) → KEEP
//! 3. success rate ≥ monitor threshold (50%) → MONITOR
//! 4. otherwise → ROLLBACK

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::metrics::{round2, signed_change, Improvement, Metric, MetricsSnapshot};

/// Outcome of testing one fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Keep,
    Rollback,
    Monitor,
    Modify,
    /// Anything a collaborator reported that is not a known verdict.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Keep => write!(f, "KEEP"),
            Self::Rollback => write!(f, "ROLLBACK"),
            Self::Monitor => write!(f, "MONITOR"),
            Self::Modify => write!(f, "MODIFY"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Verdict for one tested fix. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestVerdict {
    /// Percentage of success indicators met, 2 dp.
    pub success_rate: f64,
    pub success_count: u32,
    pub total_indicators: u32,
    pub decision: Verdict,
    #[serde(default)]
    pub reason: String,
    /// Another approach to try when the fix is rolled back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternative_solution: Option<String>,
}

impl TestVerdict {
    #[must_use]
    pub fn with_alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternative_solution = Some(alternative.into());
        self
    }
}

/// Thresholds for the success evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorThresholds {
    /// Minimum error reduction (percent) for the reduction indicator.
    pub min_error_reduction_pct: f64,
    /// Error reduction (percent) below which the fix is a critical failure.
    pub failure_error_reduction_pct: f64,
    /// Success rate (percent) needed to KEEP.
    pub keep_success_rate_pct: f64,
    /// Success rate (percent) needed to MONITOR.
    pub monitor_success_rate_pct: f64,
    /// A metric growing past this multiple of its baseline is critical.
    pub critical_growth_factor: f64,
}

impl Default for EvaluatorThresholds {
    fn default() -> Self {
        Self {
            min_error_reduction_pct: 10.0,
            failure_error_reduction_pct: -10.0,
            keep_success_rate_pct: 75.0,
            monitor_success_rate_pct: 50.0,
            critical_growth_factor: 2.0,
        }
    }
}

/// Comparison of one metric between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricComparison {
    pub metric: Metric,
    pub baseline: u64,
    pub current: u64,
    pub change: i64,
    pub percent_change: f64,
    /// True iff the count went down.
    pub improved: bool,
}

impl MetricComparison {
    /// Compare one metric.
    ///
    /// A zero baseline reports 100% change when the metric appeared and 0%
    /// when it stayed at zero.
    #[must_use]
    pub fn new(metric: Metric, baseline: u64, current: u64) -> Self {
        let change = signed_change(baseline, current);
        let percent_change = if baseline == 0 {
            if current > 0 {
                100.0
            } else {
                0.0
            }
        } else {
            (current as f64 - baseline as f64) / baseline as f64 * 100.0
        };

        Self {
            metric,
            baseline,
            current,
            change,
            percent_change: round2(percent_change),
            improved: current < baseline,
        }
    }

    /// "IMPROVED", "UNCHANGED" or "WORSENED".
    #[must_use]
    pub fn status(&self) -> &'static str {
        if self.improved {
            "IMPROVED"
        } else if self.change == 0 {
            "UNCHANGED"
        } else {
            "WORSENED"
        }
    }
}

/// Compare every metric of two snapshots, in report order.
#[must_use]
pub fn compare(baseline: &MetricsSnapshot, current: &MetricsSnapshot) -> Vec<MetricComparison> {
    Metric::ALL
        .iter()
        .map(|&m| MetricComparison::new(m, baseline.get(m), current.get(m)))
        .collect()
}

/// A named indicator and whether it fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    pub name: String,
    pub met: bool,
}

impl Indicator {
    fn new(name: impl Into<String>, met: bool) -> Self {
        Self {
            name: name.into(),
            met,
        }
    }
}

/// Full evaluation output: comparisons, indicators and the verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub fix_name: String,
    pub comparisons: Vec<MetricComparison>,
    pub overall: Improvement,
    pub success_indicators: Vec<Indicator>,
    pub failure_indicators: Vec<Indicator>,
    pub verdict: TestVerdict,
}

impl Evaluation {
    /// Whether any failure indicator fired.
    #[must_use]
    pub fn failure_detected(&self) -> bool {
        self.failure_indicators.iter().any(|i| i.met)
    }
}

/// Evaluates fixes against fixed threshold rules.
#[derive(Debug, Clone, Default)]
pub struct SuccessEvaluator {
    thresholds: EvaluatorThresholds,
}

impl SuccessEvaluator {
    #[must_use]
    pub fn new(thresholds: EvaluatorThresholds) -> Self {
        Self { thresholds }
    }

    #[must_use]
    pub fn thresholds(&self) -> &EvaluatorThresholds {
        &self.thresholds
    }

    /// Evaluate a fix from the snapshots measured before and after it.
    ///
    /// # Example
    ///
    /// ```
    /// use fixloop::evaluator::{SuccessEvaluator, Verdict};
    /// use fixloop::metrics::MetricsSnapshot;
    ///
    /// let before = MetricsSnapshot::new(100)
    ///     .with_title_failures(50)
    ///     .with_url_errors(20)
    ///     .with_model_errors(10);
    /// let after = MetricsSnapshot::new(100)
    ///     .with_title_failures(10)
    ///     .with_url_errors(5)
    ///     .with_model_errors(10);
    ///
    /// let evaluation = SuccessEvaluator::default().evaluate("Enhanced Headers", &before, &after);
    /// assert_eq!(evaluation.verdict.decision, Verdict::Keep);
    /// ```
    #[must_use]
    pub fn evaluate(
        &self,
        fix_name: &str,
        baseline: &MetricsSnapshot,
        current: &MetricsSnapshot,
    ) -> Evaluation {
        let t = &self.thresholds;
        let comparisons = compare(baseline, current);
        let overall = Improvement::between(baseline, current);

        let lookup = |metric: Metric| {
            comparisons
                .iter()
                .find(|c| c.metric == metric)
                .map_or((0, 0), |c| (c.baseline, c.current))
        };

        let no_new_errors = Metric::ERRORS.iter().all(|&m| {
            let (before, after) = lookup(m);
            !(before == 0 && after > 0)
        });
        let (url_before, url_after) = lookup(Metric::UrlErrors);
        let (title_before, title_after) = lookup(Metric::TitleFailures);

        let success_indicators = vec![
            Indicator::new(
                format!("Error reduction >= {}%", t.min_error_reduction_pct),
                overall.error_reduction >= t.min_error_reduction_pct,
            ),
            Indicator::new("No new error types introduced", no_new_errors),
            Indicator::new("URL errors not increased", url_after <= url_before),
            Indicator::new("Title failures not increased", title_after <= title_before),
        ];

        let critical_growth = Metric::ERRORS.iter().any(|&m| {
            let (before, after) = lookup(m);
            before > 0 && after as f64 > before as f64 * t.critical_growth_factor
        });

        let failure_indicators = vec![
            Indicator::new(
                format!(
                    "Error rate increased significantly (>{}%)",
                    -t.failure_error_reduction_pct
                ),
                overall.error_reduction < t.failure_error_reduction_pct,
            ),
            Indicator::new("New critical errors introduced", critical_growth),
        ];

        let success_count = success_indicators.iter().filter(|i| i.met).count() as u32;
        let total_indicators = success_indicators.len() as u32;
        let success_rate = if total_indicators > 0 {
            f64::from(success_count) / f64::from(total_indicators) * 100.0
        } else {
            0.0
        };
        let failure_detected = failure_indicators.iter().any(|i| i.met);

        let (decision, reason) = if failure_detected {
            (Verdict::Rollback, "Critical failure indicators detected".to_string())
        } else if success_rate >= t.keep_success_rate_pct {
            (
                Verdict::Keep,
                format!("Met >={}% of success criteria", t.keep_success_rate_pct),
            )
        } else if success_rate >= t.monitor_success_rate_pct {
            (
                Verdict::Monitor,
                "Partial success - need more time or tweaking".to_string(),
            )
        } else {
            (
                Verdict::Rollback,
                format!(
                    "Failed to meet minimum success criteria (<{}%)",
                    t.monitor_success_rate_pct
                ),
            )
        };

        info!(
            "Evaluated '{}': {}/{} indicators, decision {}",
            fix_name, success_count, total_indicators, decision
        );

        Evaluation {
            fix_name: fix_name.to_string(),
            comparisons,
            overall,
            success_indicators,
            failure_indicators,
            verdict: TestVerdict {
                success_rate: round2(success_rate),
                success_count,
                total_indicators,
                decision,
                reason,
                alternative_solution: None,
            },
        }
    }
}
