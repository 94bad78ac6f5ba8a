//! Exit policy: whether the loop must stop, and why.
//!
//! Conditions are checked in a fixed priority order and the first one that
//! holds wins:
//!
//! 1. iteration budget used up → `max_iterations_reached`
//! 2. latest diagnosis offers no pending HIGH fix → `all_fixes_attempted`
//! 3. last two aggregations plateaued → `plateau_detected`
//! 4. cumulative error reduction reached the target → `success`
//! 5. cumulative errors regressed → `regression_detected`

use tracing::info;

use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::state::{ExitCondition, RunState};

/// Evaluates the exit conditions against a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitPolicy {
    tracker: ProgressTracker,
    /// Cumulative error reduction (percent) that counts as success.
    success_reduction_pct: f64,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self::new(ProgressTracker::default(), 90.0)
    }
}

impl ExitPolicy {
    #[must_use]
    pub fn new(tracker: ProgressTracker, success_reduction_pct: f64) -> Self {
        Self {
            tracker,
            success_reduction_pct,
        }
    }

    /// First exit condition that holds, without touching the state.
    #[must_use]
    pub fn evaluate(
        &self,
        state: &RunState,
        progress: Option<&ProgressSnapshot>,
    ) -> Option<ExitCondition> {
        if state.budget_exhausted() {
            return Some(ExitCondition::MaxIterationsReached);
        }
        if state.fixes_exhausted() {
            return Some(ExitCondition::AllFixesAttempted);
        }
        if self.tracker.detect_plateau(state) {
            return Some(ExitCondition::PlateauDetected);
        }
        if progress.is_some_and(|p| p.total_error_reduction >= self.success_reduction_pct) {
            return Some(ExitCondition::Success);
        }
        if self.tracker.detect_regression(progress) {
            return Some(ExitCondition::RegressionDetected);
        }
        None
    }

    /// Decide whether to exit and record the condition on the state.
    ///
    /// Once a condition is recorded it is never replaced; a terminated state
    /// keeps reporting its original condition.
    pub fn should_exit(
        &self,
        state: &mut RunState,
        progress: Option<&ProgressSnapshot>,
    ) -> Option<ExitCondition> {
        if let Some(existing) = state.exit_condition {
            return Some(existing);
        }

        let condition = self.evaluate(state, progress)?;
        state.set_exit_condition(condition);
        info!("Exit condition reached: {} ({})", condition, condition.description());
        Some(condition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsSnapshot;
    use crate::state::{FixCandidate, PhaseResults};
    use std::path::PathBuf;

    fn aggregate(state: &mut RunState, errors: u64) {
        state.begin_iteration();
        let metrics = MetricsSnapshot::new(500).with_url_errors(errors);
        state.record_metrics(metrics);
        state.push_record(PhaseResults::Aggregation {
            report: PathBuf::from("aggregation.json"),
            metrics,
        });
    }

    fn with_pending_fix(mut state: RunState) -> RunState {
        state.set_candidates(vec![FixCandidate::high("Pending")]);
        state
    }

    fn check(state: &mut RunState) -> Option<ExitCondition> {
        let policy = ExitPolicy::default();
        let progress = ProgressTracker::default().calculate_progress(state);
        policy.should_exit(state, progress.as_ref())
    }

    #[test]
    fn test_continue_when_nothing_holds() {
        let mut state = with_pending_fix(RunState::new(10));
        aggregate(&mut state, 100);
        aggregate(&mut state, 60);
        assert_eq!(check(&mut state), None);
        assert!(state.exit_condition.is_none());
    }

    #[test]
    fn test_max_iterations_beats_success() {
        let mut state = with_pending_fix(RunState::new(2));
        aggregate(&mut state, 100);
        aggregate(&mut state, 5);

        assert_eq!(state.iteration, state.max_iterations);
        assert_eq!(check(&mut state), Some(ExitCondition::MaxIterationsReached));
        assert_eq!(state.exit_condition, Some(ExitCondition::MaxIterationsReached));
    }

    #[test]
    fn test_all_fixes_attempted() {
        let mut state = RunState::new(10);
        state.set_candidates(vec![FixCandidate::high("Only")]);
        state.mark_attempted("Only");
        aggregate(&mut state, 100);
        assert_eq!(check(&mut state), Some(ExitCondition::AllFixesAttempted));
    }

    #[test]
    fn test_unknown_candidates_do_not_exhaust() {
        let mut state = RunState::new(10);
        aggregate(&mut state, 100);
        assert_eq!(check(&mut state), None);
    }

    #[test]
    fn test_plateau_detected() {
        let mut state = with_pending_fix(RunState::new(10));
        aggregate(&mut state, 50);
        aggregate(&mut state, 49);
        aggregate(&mut state, 48);
        assert_eq!(check(&mut state), Some(ExitCondition::PlateauDetected));
    }

    #[test]
    fn test_plateau_beats_regression() {
        let mut state = with_pending_fix(RunState::new(10));
        aggregate(&mut state, 10);
        aggregate(&mut state, 30);
        aggregate(&mut state, 30);
        assert_eq!(check(&mut state), Some(ExitCondition::PlateauDetected));
    }

    #[test]
    fn test_success_on_ninety_percent() {
        let mut state = with_pending_fix(RunState::new(10));
        aggregate(&mut state, 100);
        aggregate(&mut state, 10);
        assert_eq!(check(&mut state), Some(ExitCondition::Success));
    }

    #[test]
    fn test_regression_detected() {
        let mut state = with_pending_fix(RunState::new(10));
        aggregate(&mut state, 10);
        aggregate(&mut state, 30);
        assert_eq!(check(&mut state), Some(ExitCondition::RegressionDetected));
    }

    #[test]
    fn test_condition_is_permanent() {
        let mut state = with_pending_fix(RunState::new(10));
        aggregate(&mut state, 10);
        aggregate(&mut state, 30);
        assert_eq!(check(&mut state), Some(ExitCondition::RegressionDetected));

        state.max_iterations = 1;
        assert_eq!(check(&mut state), Some(ExitCondition::RegressionDetected));
        assert_eq!(state.exit_condition, Some(ExitCondition::RegressionDetected));
    }

    #[test]
    fn test_evaluate_does_not_mutate() {
        let mut state = with_pending_fix(RunState::new(1));
        aggregate(&mut state, 10);
        let policy = ExitPolicy::default();
        assert_eq!(
            policy.evaluate(&state, None),
            Some(ExitCondition::MaxIterationsReached)
        );
        assert!(state.exit_condition.is_none());
    }
}
