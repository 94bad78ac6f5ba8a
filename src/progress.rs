//! Progress tracking across aggregation snapshots.
//!
//! Derives the cumulative improvement of a run (first vs latest aggregation),
//! detects plateaus from the last adjacent pair of aggregations, and flags
//! regressions against the run baseline.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::metrics::{reduction_pct, Improvement};
use crate::state::{PhaseResults, RunState};

/// Aggregate improvement signals for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Percentage drop in errors from the first to the latest aggregation.
    pub total_error_reduction: f64,
    /// Percentage-point change in success rate over the same span.
    pub success_rate_improvement: f64,
    /// Number of aggregation records.
    pub iterations: usize,
    pub fixes_successful: usize,
    pub fixes_failed: usize,
    pub baseline_errors: u64,
    pub current_errors: u64,
}

/// Progress calculations over the run history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressTracker {
    /// Pairwise improvement (percent) below which progress has plateaued.
    plateau_threshold_pct: f64,
    /// Cumulative reduction (percent) below which the run has regressed.
    regression_threshold_pct: f64,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(5.0, -5.0)
    }
}

impl ProgressTracker {
    #[must_use]
    pub fn new(plateau_threshold_pct: f64, regression_threshold_pct: f64) -> Self {
        Self {
            plateau_threshold_pct,
            regression_threshold_pct,
        }
    }

    /// Append a record for `results` to the history.
    ///
    /// The record carries the current iteration and current metrics of the
    /// state; existing records are left untouched.
    pub fn capture(&self, state: &mut RunState, results: PhaseResults) {
        debug!(
            "Recording {} results for iteration {}",
            results.phase(),
            state.iteration
        );
        state.push_record(results);
    }

    /// Cumulative progress from the first to the latest aggregation.
    ///
    /// Returns `None` until at least two aggregation records exist.
    ///
    /// # Example
    ///
    /// ```
    /// use std::path::PathBuf;
    /// use fixloop::metrics::MetricsSnapshot;
    /// use fixloop::progress::ProgressTracker;
    /// use fixloop::state::{PhaseResults, RunState};
    ///
    /// let tracker = ProgressTracker::default();
    /// let mut state = RunState::default();
    /// for errors in [100, 40] {
    ///     state.begin_iteration();
    ///     let metrics = MetricsSnapshot::new(200).with_title_failures(errors);
    ///     state.record_metrics(metrics);
    ///     tracker.capture(&mut state, PhaseResults::Aggregation {
    ///         report: PathBuf::from("aggregation.json"),
    ///         metrics,
    ///     });
    /// }
    ///
    /// let progress = tracker.calculate_progress(&state).unwrap();
    /// assert_eq!(progress.total_error_reduction, 60.0);
    /// ```
    #[must_use]
    pub fn calculate_progress(&self, state: &RunState) -> Option<ProgressSnapshot> {
        let mut snapshots = state.aggregation_snapshots();
        let first = snapshots.next()?;
        let mut count = 1;
        let mut latest = None;
        for snapshot in snapshots {
            latest = Some(snapshot);
            count += 1;
        }
        let latest = latest?;

        let improvement = Improvement::between(first, latest);

        Some(ProgressSnapshot {
            total_error_reduction: improvement.error_reduction,
            success_rate_improvement: improvement.success_rate_improvement,
            iterations: count,
            fixes_successful: state.fixes_successful.len(),
            fixes_failed: state.fixes_failed.len(),
            baseline_errors: improvement.baseline_errors,
            current_errors: improvement.current_errors,
        })
    }

    /// Whether the last two aggregations improved less than the plateau
    /// threshold.
    ///
    /// Only the single most recent adjacent pair is considered. Needs at
    /// least three history records and two aggregation records.
    #[must_use]
    pub fn detect_plateau(&self, state: &RunState) -> bool {
        if state.iteration_history.len() < 3 {
            return false;
        }

        let snapshots: Vec<_> = state.aggregation_snapshots().collect();
        let [.., previous, current] = snapshots.as_slice() else {
            return false;
        };

        let improvement = reduction_pct(previous.error_count(), current.error_count());
        debug!(
            "Plateau check: {} -> {} errors ({:.2}% improvement)",
            previous.error_count(),
            current.error_count(),
            improvement
        );
        improvement < self.plateau_threshold_pct
    }

    /// Whether errors got meaningfully worse against the run baseline.
    #[must_use]
    pub fn detect_regression(&self, progress: Option<&ProgressSnapshot>) -> bool {
        progress.is_some_and(|p| p.total_error_reduction < self.regression_threshold_pct)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::DiagnosisMode;
    use crate::metrics::MetricsSnapshot;
    use std::path::PathBuf;

    fn aggregate(tracker: &ProgressTracker, state: &mut RunState, snapshot: MetricsSnapshot) {
        state.begin_iteration();
        state.record_metrics(snapshot);
        tracker.capture(
            state,
            PhaseResults::Aggregation {
                report: PathBuf::from(format!("iteration_{}/aggregation.json", state.iteration)),
                metrics: snapshot,
            },
        );
    }

    fn diagnose(tracker: &ProgressTracker, state: &mut RunState) {
        tracker.capture(
            state,
            PhaseResults::Diagnostics {
                report: PathBuf::from("diagnosis.json"),
                mode: DiagnosisMode::Focused,
                fixes: Vec::new(),
                error_types: Vec::new(),
            },
        );
    }

    fn errors(n: u64) -> MetricsSnapshot {
        MetricsSnapshot::new(200).with_title_failures(n)
    }

    #[test]
    fn test_capture_appends_in_order() {
        let tracker = ProgressTracker::default();
        let mut state = RunState::default();
        aggregate(&tracker, &mut state, errors(10));
        diagnose(&tracker, &mut state);

        assert_eq!(state.iteration_history.len(), 2);
        assert_eq!(state.iteration_history[0].phase.to_string(), "aggregation");
        assert_eq!(state.iteration_history[1].phase.to_string(), "diagnostics");
    }

    #[test]
    fn test_progress_needs_two_aggregations() {
        let tracker = ProgressTracker::default();
        let mut state = RunState::default();
        assert!(tracker.calculate_progress(&state).is_none());

        aggregate(&tracker, &mut state, errors(100));
        diagnose(&tracker, &mut state);
        diagnose(&tracker, &mut state);
        assert!(tracker.calculate_progress(&state).is_none());

        aggregate(&tracker, &mut state, errors(40));
        let progress = tracker.calculate_progress(&state).expect("progress");
        assert_eq!(progress.total_error_reduction, 60.0);
        assert_eq!(progress.iterations, 2);
        assert_eq!(progress.baseline_errors, 100);
        assert_eq!(progress.current_errors, 40);
    }

    #[test]
    fn test_progress_uses_first_and_latest() {
        let tracker = ProgressTracker::default();
        let mut state = RunState::default();
        aggregate(&tracker, &mut state, errors(100));
        aggregate(&tracker, &mut state, errors(10));
        aggregate(&tracker, &mut state, errors(50));

        let progress = tracker.calculate_progress(&state).expect("progress");
        assert_eq!(progress.total_error_reduction, 50.0);
        assert_eq!(progress.iterations, 3);
    }

    #[test]
    fn test_progress_zero_baseline_is_zero_reduction() {
        let tracker = ProgressTracker::default();
        let mut state = RunState::default();
        aggregate(&tracker, &mut state, errors(0));
        aggregate(&tracker, &mut state, errors(0));

        let progress = tracker.calculate_progress(&state).expect("progress");
        assert_eq!(progress.total_error_reduction, 0.0);
        assert!(!progress.total_error_reduction.is_nan());
    }

    #[test]
    fn test_progress_zero_searches_success_rate() {
        let tracker = ProgressTracker::default();
        let mut state = RunState::default();
        aggregate(&tracker, &mut state, MetricsSnapshot::new(0));
        aggregate(&tracker, &mut state, MetricsSnapshot::new(100).with_url_errors(10));

        let progress = tracker.calculate_progress(&state).expect("progress");
        assert_eq!(progress.success_rate_improvement, 90.0);
    }

    #[test]
    fn test_progress_counts_fix_outcomes() {
        let tracker = ProgressTracker::default();
        let mut state = RunState::default();
        aggregate(&tracker, &mut state, errors(100));
        aggregate(&tracker, &mut state, errors(90));
        state.mark_successful("A");
        state.mark_failed("B");
        state.mark_failed("C");

        let progress = tracker.calculate_progress(&state).expect("progress");
        assert_eq!(progress.fixes_successful, 1);
        assert_eq!(progress.fixes_failed, 2);
    }

    #[test]
    fn test_plateau_needs_three_records() {
        let tracker = ProgressTracker::default();
        let mut state = RunState::default();
        aggregate(&tracker, &mut state, errors(50));
        aggregate(&tracker, &mut state, errors(50));
        assert!(!tracker.detect_plateau(&state));
    }

    #[test]
    fn test_plateau_needs_two_aggregations() {
        let tracker = ProgressTracker::default();
        let mut state = RunState::default();
        aggregate(&tracker, &mut state, errors(50));
        diagnose(&tracker, &mut state);
        diagnose(&tracker, &mut state);
        assert!(!tracker.detect_plateau(&state));
    }

    #[test]
    fn test_plateau_small_improvement() {
        let tracker = ProgressTracker::default();
        let mut state = RunState::default();
        aggregate(&tracker, &mut state, errors(50));
        diagnose(&tracker, &mut state);
        aggregate(&tracker, &mut state, errors(48));
        assert!(tracker.detect_plateau(&state));
    }

    #[test]
    fn test_no_plateau_on_large_improvement() {
        let tracker = ProgressTracker::default();
        let mut state = RunState::default();
        aggregate(&tracker, &mut state, errors(50));
        diagnose(&tracker, &mut state);
        aggregate(&tracker, &mut state, errors(40));
        assert!(!tracker.detect_plateau(&state));
    }

    #[test]
    fn test_plateau_only_looks_at_last_pair() {
        let tracker = ProgressTracker::default();
        let mut state = RunState::default();
        aggregate(&tracker, &mut state, errors(100));
        aggregate(&tracker, &mut state, errors(99));
        aggregate(&tracker, &mut state, errors(50));
        assert!(!tracker.detect_plateau(&state));

        aggregate(&tracker, &mut state, errors(49));
        assert!(tracker.detect_plateau(&state));
    }

    #[test]
    fn test_regression_below_threshold() {
        let tracker = ProgressTracker::default();
        let mut state = RunState::default();
        aggregate(&tracker, &mut state, errors(10));
        aggregate(&tracker, &mut state, errors(30));

        let progress = tracker.calculate_progress(&state);
        assert_eq!(
            progress.as_ref().map(|p| p.total_error_reduction),
            Some(-200.0)
        );
        assert!(tracker.detect_regression(progress.as_ref()));
    }

    #[test]
    fn test_small_increase_is_not_regression() {
        let tracker = ProgressTracker::default();
        let mut state = RunState::default();
        aggregate(&tracker, &mut state, errors(100));
        aggregate(&tracker, &mut state, errors(104));

        let progress = tracker.calculate_progress(&state);
        assert!(!tracker.detect_regression(progress.as_ref()));
        assert!(!tracker.detect_regression(None));
    }
}
