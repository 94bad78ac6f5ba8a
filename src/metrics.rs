//! Metrics snapshots and the improvement arithmetic shared by progress
//! tracking, the exit policy and the success evaluator.

use serde::{Deserialize, Serialize};

/// Round to two decimal places, the precision every reported percentage uses.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Percentage drop from `before` to `after`.
///
/// A zero `before` means there was nothing to reduce, so the result is 0
/// rather than 100 or NaN.
pub fn reduction_pct(before: u64, after: u64) -> f64 {
    if before == 0 {
        return 0.0;
    }
    (before as f64 - after as f64) / before as f64 * 100.0
}

/// Signed change from `before` to `after`, saturating at the `i64` bounds.
pub fn signed_change(before: u64, after: u64) -> i64 {
    let change = i128::from(after) - i128::from(before);
    i64::try_from(change).unwrap_or(if change > 0 { i64::MAX } else { i64::MIN })
}

/// Named error metrics tracked by the loop. All of them are lower-is-better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    TotalSearchOps,
    TitlesFound,
    TitleFailures,
    ModelErrors,
    UrlErrors,
}

impl Metric {
    /// Every metric, in report order.
    pub const ALL: [Metric; 5] = [
        Metric::TotalSearchOps,
        Metric::TitlesFound,
        Metric::TitleFailures,
        Metric::ModelErrors,
        Metric::UrlErrors,
    ];

    /// The three counters summed into `error_count`.
    pub const ERRORS: [Metric; 3] = [Metric::UrlErrors, Metric::ModelErrors, Metric::TitleFailures];

    /// Field name as it appears in snapshots.
    pub fn key(self) -> &'static str {
        match self {
            Metric::TotalSearchOps => "total_search_ops",
            Metric::TitlesFound => "titles_found",
            Metric::TitleFailures => "title_failures",
            Metric::ModelErrors => "model_errors",
            Metric::UrlErrors => "url_errors",
        }
    }

    /// Human label for summaries.
    pub fn label(self) -> &'static str {
        match self {
            Metric::TotalSearchOps => "Total Searches",
            Metric::TitlesFound => "Titles Found",
            Metric::TitleFailures => "Title Failures",
            Metric::ModelErrors => "Model Errors",
            Metric::UrlErrors => "URL Errors",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Normalized counters for one measurement point.
///
/// Missing fields in a source document default to zero.
///
/// # Example
///
/// ```
/// use fixloop::metrics::MetricsSnapshot;
///
/// let snapshot = MetricsSnapshot::new(100)
///     .with_title_failures(50)
///     .with_url_errors(20)
///     .with_model_errors(10);
/// assert_eq!(snapshot.error_count(), 80);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSnapshot {
    pub total_search_ops: u64,
    pub titles_found: u64,
    pub title_failures: u64,
    pub model_errors: u64,
    pub url_errors: u64,
}

impl MetricsSnapshot {
    /// Create a snapshot with the given number of search operations.
    #[must_use]
    pub fn new(total_search_ops: u64) -> Self {
        Self {
            total_search_ops,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_titles_found(mut self, count: u64) -> Self {
        self.titles_found = count;
        self
    }

    #[must_use]
    pub fn with_title_failures(mut self, count: u64) -> Self {
        self.title_failures = count;
        self
    }

    #[must_use]
    pub fn with_model_errors(mut self, count: u64) -> Self {
        self.model_errors = count;
        self
    }

    #[must_use]
    pub fn with_url_errors(mut self, count: u64) -> Self {
        self.url_errors = count;
        self
    }

    /// Value of a single metric.
    #[must_use]
    pub fn get(&self, metric: Metric) -> u64 {
        match metric {
            Metric::TotalSearchOps => self.total_search_ops,
            Metric::TitlesFound => self.titles_found,
            Metric::TitleFailures => self.title_failures,
            Metric::ModelErrors => self.model_errors,
            Metric::UrlErrors => self.url_errors,
        }
    }

    /// Sum of title failures, URL errors and model errors.
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.title_failures
            .saturating_add(self.url_errors)
            .saturating_add(self.model_errors)
    }

    /// Share of search operations that did not error, in percent.
    ///
    /// Zero search operations yields 0.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_search_ops == 0 {
            return 0.0;
        }
        (self.total_search_ops as f64 - self.error_count() as f64) / self.total_search_ops as f64
            * 100.0
    }
}

/// Improvement between two snapshots, as reported in progress and test output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Improvement {
    pub baseline_errors: u64,
    pub current_errors: u64,
    /// Percentage drop in errors (negative when errors grew).
    pub error_reduction: f64,
    pub baseline_success_rate: f64,
    pub current_success_rate: f64,
    /// Percentage-point change in success rate.
    pub success_rate_improvement: f64,
}

impl Improvement {
    /// Compare `current` against `baseline`. Percentages are rounded to 2 dp.
    #[must_use]
    pub fn between(baseline: &MetricsSnapshot, current: &MetricsSnapshot) -> Self {
        let baseline_errors = baseline.error_count();
        let current_errors = current.error_count();
        let baseline_success_rate = baseline.success_rate();
        let current_success_rate = current.success_rate();

        Self {
            baseline_errors,
            current_errors,
            error_reduction: round2(reduction_pct(baseline_errors, current_errors)),
            baseline_success_rate: round2(baseline_success_rate),
            current_success_rate: round2(current_success_rate),
            success_rate_improvement: round2(current_success_rate - baseline_success_rate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_huge_counters_saturate() {
        let snapshot = MetricsSnapshot::new(u64::MAX)
            .with_title_failures(u64::MAX)
            .with_url_errors(1)
            .with_model_errors(1);
        assert_eq!(snapshot.error_count(), u64::MAX);
        assert_eq!(snapshot.success_rate(), 0.0);

        assert_eq!(signed_change(0, u64::MAX), i64::MAX);
        assert_eq!(signed_change(u64::MAX, 0), i64::MIN);
        assert_eq!(signed_change(u64::MAX - 1, u64::MAX), 1);
        assert_eq!(signed_change(10, 4), -6);
    }

    #[test]
    fn test_error_count_sums_three_counters() {
        let s = MetricsSnapshot::new(100)
            .with_titles_found(40)
            .with_title_failures(5)
            .with_url_errors(7)
            .with_model_errors(3);
        assert_eq!(s.error_count(), 15);
    }

    #[test]
    fn test_missing_fields_default_to_zero() {
        let s: MetricsSnapshot = serde_json::from_str(r#"{"url_errors": 4}"#).unwrap();
        assert_eq!(s.url_errors, 4);
        assert_eq!(s.total_search_ops, 0);
        assert_eq!(s.title_failures, 0);
    }

    #[test]
    fn test_reduction_zero_baseline_is_zero() {
        assert_eq!(reduction_pct(0, 0), 0.0);
        assert_eq!(reduction_pct(0, 12), 0.0);
    }

    #[test]
    fn test_reduction_negative_when_errors_grow() {
        assert_eq!(reduction_pct(10, 30), -200.0);
    }

    #[test]
    fn test_success_rate_guards_zero_searches() {
        let s = MetricsSnapshot::new(0).with_url_errors(3);
        assert_eq!(s.success_rate(), 0.0);
    }

    #[test]
    fn test_improvement_between() {
        let baseline = MetricsSnapshot::new(200)
            .with_title_failures(50)
            .with_url_errors(20)
            .with_model_errors(10);
        let current = MetricsSnapshot::new(200)
            .with_title_failures(10)
            .with_url_errors(5)
            .with_model_errors(10);

        let imp = Improvement::between(&baseline, &current);
        assert_eq!(imp.baseline_errors, 80);
        assert_eq!(imp.current_errors, 25);
        assert_eq!(imp.error_reduction, 68.75);
        assert_eq!(imp.baseline_success_rate, 60.0);
        assert_eq!(imp.current_success_rate, 87.5);
        assert_eq!(imp.success_rate_improvement, 27.5);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(33.333_333), 33.33);
        assert_eq!(round2(66.666_666), 66.67);
    }

    #[test]
    fn test_metric_keys() {
        assert_eq!(Metric::UrlErrors.to_string(), "url_errors");
        assert_eq!(Metric::TotalSearchOps.label(), "Total Searches");
    }
}
