//! Run state: the single source of truth for one improvement run.
//!
//! # Architecture
//!
//! ```text
//! RunState
//!   ├── iteration / max_iterations
//!   ├── baseline_metrics (first aggregation, set once)
//!   ├── current_metrics  (latest aggregation)
//!   ├── iteration_history: [IterationRecord] (append-only)
//!   ├── fixes_attempted ⊇ fixes_successful ∪ fixes_failed
//!   ├── fix_candidates / queued_alternative
//!   ├── pending_test (applied, not yet tested) / pending_retest
//!   └── exit_condition (set once)
//! ```
//!
//! The state is mutated only by the loop controller and persisted through
//! [`persistence::StateStore`] at every checkpoint.

pub mod persistence;
pub mod types;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::MetricsSnapshot;

pub use persistence::{CheckpointReason, StateStore, STATE_VERSION};
pub use types::{
    ExitCondition, FixCandidate, ImplementationStatus, IterationRecord, PendingRetest,
    PendingTest, Phase, PhaseResults, Priority,
};

/// Default iteration budget.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Durable, resumable record of loop progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    /// Incremented at the top of each loop pass.
    pub iteration: u32,
    pub max_iterations: u32,
    pub baseline_metrics: Option<MetricsSnapshot>,
    pub current_metrics: Option<MetricsSnapshot>,
    pub iteration_history: Vec<IterationRecord>,
    pub fixes_attempted: Vec<String>,
    pub fixes_successful: Vec<String>,
    pub fixes_failed: Vec<String>,
    /// Candidates from the most recent diagnosis; None when unknown.
    #[serde(default)]
    pub fix_candidates: Option<Vec<FixCandidate>>,
    #[serde(default)]
    pub queued_alternative: Option<FixCandidate>,
    /// Fix applied in the current iteration whose test has not completed.
    #[serde(default)]
    pub pending_test: Option<PendingTest>,
    #[serde(default)]
    pub pending_retest: Option<PendingRetest>,
    pub exit_condition: Option<ExitCondition>,
    pub start_time: DateTime<Utc>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITERATIONS)
    }
}

fn insert_unique(set: &mut Vec<String>, name: &str) -> bool {
    if set.iter().any(|n| n == name) {
        return false;
    }
    set.push(name.to_string());
    true
}

fn remove_name(set: &mut Vec<String>, name: &str) {
    set.retain(|n| n != name);
}

impl RunState {
    /// Fresh state for a new run.
    ///
    /// # Example
    ///
    /// ```
    /// use fixloop::state::RunState;
    ///
    /// let state = RunState::new(10);
    /// assert_eq!(state.iteration, 0);
    /// assert!(state.baseline_metrics.is_none());
    /// assert!(state.exit_condition.is_none());
    /// ```
    #[must_use]
    pub fn new(max_iterations: u32) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            iteration: 0,
            max_iterations,
            baseline_metrics: None,
            current_metrics: None,
            iteration_history: Vec::new(),
            fixes_attempted: Vec::new(),
            fixes_successful: Vec::new(),
            fixes_failed: Vec::new(),
            fix_candidates: None,
            queued_alternative: None,
            pending_test: None,
            pending_retest: None,
            exit_condition: None,
            start_time: Utc::now(),
        }
    }

    /// Start the next loop pass.
    pub fn begin_iteration(&mut self) -> u32 {
        self.iteration += 1;
        self.iteration
    }

    /// Whether the iteration budget is used up.
    #[must_use]
    pub fn budget_exhausted(&self) -> bool {
        self.iteration >= self.max_iterations
    }

    /// Store a freshly aggregated snapshot as current; the first one becomes
    /// the baseline.
    pub fn record_metrics(&mut self, snapshot: MetricsSnapshot) {
        if self.baseline_metrics.is_none() {
            self.baseline_metrics = Some(snapshot);
        }
        self.current_metrics = Some(snapshot);
    }

    /// Append a record for the current iteration.
    pub fn push_record(&mut self, results: PhaseResults) {
        let record = IterationRecord::new(self.iteration, results, self.current_metrics);
        self.iteration_history.push(record);
    }

    /// Snapshots of every aggregation record, oldest first.
    pub fn aggregation_snapshots(&self) -> impl Iterator<Item = &MetricsSnapshot> {
        self.iteration_history
            .iter()
            .filter_map(IterationRecord::aggregated_metrics)
    }

    /// Report path of the latest aggregation record.
    #[must_use]
    pub fn latest_aggregation_report(&self) -> Option<&std::path::Path> {
        self.iteration_history.iter().rev().find_map(|r| match &r.results {
            PhaseResults::Aggregation { report, .. } => Some(report.as_path()),
            _ => None,
        })
    }

    // =========================================================================
    // Fix bookkeeping
    // =========================================================================

    #[must_use]
    pub fn was_attempted(&self, name: &str) -> bool {
        self.fixes_attempted.iter().any(|n| n == name)
    }

    /// Record that a fix was handed to the implementation collaborator.
    pub fn mark_attempted(&mut self, name: &str) {
        insert_unique(&mut self.fixes_attempted, name);
    }

    /// Record a KEEP verdict. A later verdict replaces an earlier one.
    pub fn mark_successful(&mut self, name: &str) {
        self.mark_attempted(name);
        remove_name(&mut self.fixes_failed, name);
        insert_unique(&mut self.fixes_successful, name);
    }

    /// Record a ROLLBACK verdict or a failed implementation.
    pub fn mark_failed(&mut self, name: &str) {
        self.mark_attempted(name);
        remove_name(&mut self.fixes_successful, name);
        insert_unique(&mut self.fixes_failed, name);
    }

    /// Replace the candidate list with a new diagnosis.
    pub fn set_candidates(&mut self, fixes: Vec<FixCandidate>) {
        self.fix_candidates = Some(fixes);
    }

    /// Forget the candidate list so availability is unknown until the next
    /// diagnosis.
    pub fn invalidate_candidates(&mut self) {
        self.fix_candidates = None;
    }

    /// Queue an alternative to try before any diagnosed candidate.
    pub fn queue_alternative(&mut self, name: impl Into<String>) {
        self.queued_alternative = Some(
            FixCandidate::high(name).with_expected_improvement("Alternative to a rolled back fix"),
        );
    }

    /// First pending fix in scan order: a queued alternative, then HIGH
    /// candidates that have not been attempted.
    #[must_use]
    pub fn next_pending_fix(&self) -> Option<&FixCandidate> {
        let alternative = self
            .queued_alternative
            .as_ref()
            .filter(|fix| !self.was_attempted(&fix.name));

        alternative.or_else(|| {
            self.fix_candidates.as_deref().and_then(|fixes| {
                fixes
                    .iter()
                    .find(|fix| fix.priority == Priority::High && !self.was_attempted(&fix.name))
            })
        })
    }

    #[must_use]
    pub fn has_pending_fix(&self) -> bool {
        self.next_pending_fix().is_some()
    }

    /// True when the latest diagnosis is known and offers nothing left to try.
    #[must_use]
    pub fn fixes_exhausted(&self) -> bool {
        self.fix_candidates.is_some() && !self.has_pending_fix()
    }

    // =========================================================================
    // Termination
    // =========================================================================

    /// Set the exit condition. Returns false if one was already set.
    pub fn set_exit_condition(&mut self, condition: ExitCondition) -> bool {
        if self.exit_condition.is_some() {
            return false;
        }
        self.exit_condition = Some(condition);
        true
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.exit_condition.is_some()
    }

    /// Check the structural invariants of a state restored from disk.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        for name in self.fixes_successful.iter().chain(&self.fixes_failed) {
            if !self.was_attempted(name) {
                return Err(format!("fix '{name}' has an outcome but was never attempted"));
            }
        }
        if let Some(name) = self
            .fixes_successful
            .iter()
            .find(|n| self.fixes_failed.contains(n))
        {
            return Err(format!("fix '{name}' is both successful and failed"));
        }
        if let Some(record) = self
            .iteration_history
            .iter()
            .find(|r| r.iteration > self.iteration || r.iteration == 0)
        {
            return Err(format!(
                "history record for iteration {} does not fit run iteration {}",
                record.iteration, self.iteration
            ));
        }
        if let Some(pending) = &self.pending_test {
            if !self.was_attempted(&pending.fix) {
                return Err(format!("fix '{}' awaits a test but was never attempted", pending.fix));
            }
            if self.pending_retest.is_some() {
                return Err("a test and a retest are both pending".to_string());
            }
        }
        if self.current_metrics.is_some() && self.baseline_metrics.is_none() {
            return Err("current metrics present without a baseline".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn aggregation(errors: u64) -> PhaseResults {
        PhaseResults::Aggregation {
            report: PathBuf::from("aggregation.json"),
            metrics: MetricsSnapshot::new(100).with_title_failures(errors),
        }
    }

    #[test]
    fn test_new_state_is_empty() {
        let state = RunState::new(5);
        assert_eq!(state.iteration, 0);
        assert_eq!(state.max_iterations, 5);
        assert!(state.iteration_history.is_empty());
        assert!(state.fixes_attempted.is_empty());
        assert!(state.exit_condition.is_none());
        assert!(!state.run_id.is_empty());
    }

    #[test]
    fn test_baseline_is_first_snapshot_only() {
        let mut state = RunState::default();
        let first = MetricsSnapshot::new(100).with_url_errors(20);
        let second = MetricsSnapshot::new(100).with_url_errors(5);
        let third = MetricsSnapshot::new(90).with_url_errors(1);

        state.record_metrics(first);
        state.record_metrics(second);
        state.record_metrics(third);

        assert_eq!(state.baseline_metrics, Some(first));
        assert_eq!(state.current_metrics, Some(third));
    }

    #[test]
    fn test_push_record_uses_current_iteration_and_metrics() {
        let mut state = RunState::default();
        state.begin_iteration();
        state.record_metrics(MetricsSnapshot::new(10).with_title_failures(3));
        state.push_record(aggregation(3));

        let record = &state.iteration_history[0];
        assert_eq!(record.iteration, 1);
        assert_eq!(record.phase, Phase::Aggregation);
        assert_eq!(record.metrics_snapshot.map(|m| m.title_failures), Some(3));
    }

    #[test]
    fn test_outcomes_are_subsets_and_disjoint() {
        let mut state = RunState::default();
        state.mark_attempted("A");
        state.mark_successful("A");
        state.mark_failed("B");
        state.mark_failed("A");
        state.mark_successful("B");
        state.mark_successful("B");

        assert_eq!(state.fixes_attempted, vec!["A", "B"]);
        assert_eq!(state.fixes_failed, vec!["A"]);
        assert_eq!(state.fixes_successful, vec!["B"]);
        assert!(state.check_invariants().is_ok());
    }

    #[test]
    fn test_next_pending_fix_skips_attempted_and_non_high() {
        let mut state = RunState::default();
        state.set_candidates(vec![
            FixCandidate::new("Low one", Priority::Low),
            FixCandidate::high("Enhanced Headers"),
            FixCandidate::high("Update XPath Selectors"),
        ]);
        assert_eq!(
            state.next_pending_fix().map(|f| f.name.as_str()),
            Some("Enhanced Headers")
        );

        state.mark_attempted("Enhanced Headers");
        assert_eq!(
            state.next_pending_fix().map(|f| f.name.as_str()),
            Some("Update XPath Selectors")
        );

        state.mark_attempted("Update XPath Selectors");
        assert!(state.next_pending_fix().is_none());
        assert!(state.fixes_exhausted());
    }

    #[test]
    fn test_unknown_candidates_are_not_exhausted() {
        let mut state = RunState::default();
        assert!(!state.fixes_exhausted());

        state.set_candidates(Vec::new());
        assert!(state.fixes_exhausted());

        state.invalidate_candidates();
        assert!(!state.fixes_exhausted());
    }

    #[test]
    fn test_queued_alternative_comes_first() {
        let mut state = RunState::default();
        state.set_candidates(vec![FixCandidate::high("Update XPath Selectors")]);
        state.queue_alternative("Rotate User Agents");

        assert_eq!(
            state.next_pending_fix().map(|f| f.name.as_str()),
            Some("Rotate User Agents")
        );
        state.mark_attempted("Rotate User Agents");
        assert_eq!(
            state.next_pending_fix().map(|f| f.name.as_str()),
            Some("Update XPath Selectors")
        );
    }

    #[test]
    fn test_exit_condition_set_once() {
        let mut state = RunState::default();
        assert!(state.set_exit_condition(ExitCondition::PlateauDetected));
        assert!(!state.set_exit_condition(ExitCondition::Success));
        assert_eq!(state.exit_condition, Some(ExitCondition::PlateauDetected));
        assert!(state.is_terminated());
    }

    #[test]
    fn test_check_invariants_rejects_unattempted_outcome() {
        let mut state = RunState::default();
        state.fixes_successful.push("Ghost".to_string());
        assert!(state.check_invariants().is_err());
    }

    #[test]
    fn test_check_invariants_rejects_future_records() {
        let mut state = RunState::default();
        state.begin_iteration();
        state.push_record(aggregation(1));
        state.iteration = 0;
        assert!(state.check_invariants().is_err());
    }

    #[test]
    fn test_latest_aggregation_report() {
        let mut state = RunState::default();
        state.begin_iteration();
        state.push_record(PhaseResults::Aggregation {
            report: PathBuf::from("iteration_1/aggregation.json"),
            metrics: MetricsSnapshot::default(),
        });
        state.begin_iteration();
        state.push_record(PhaseResults::Aggregation {
            report: PathBuf::from("iteration_2/aggregation.json"),
            metrics: MetricsSnapshot::default(),
        });
        assert_eq!(
            state.latest_aggregation_report(),
            Some(std::path::Path::new("iteration_2/aggregation.json"))
        );
    }
}
