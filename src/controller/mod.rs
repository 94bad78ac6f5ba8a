//! Loop controller: drives runs from the first aggregation to an exit
//! condition.
//!
//! # Architecture
//!
//! ```text
//! INIT ──► AGGREGATE ──► DIAGNOSE ──► IMPLEMENT ──► TEST ──► DECIDE ──┐
//!              ▲                          │ (failed)                  │
//!              └──────────────────────────┴───────────────────────────┘
//!                                                   │
//!                      exit policy ──► TERMINAL     └──► SUSPENDED (retest later)
//! ```
//!
//! Every phase boundary is a checkpoint. Aggregation, diagnosis and testing
//! failures end the run after a `collaborator_failure` checkpoint; a failed
//! implementation only marks the fix as failed. A MONITOR verdict suspends
//! the run until [`LoopController::resume`] retests the fix.

pub mod prompt;
pub mod summary;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

pub use prompt::{AutoContinue, ContinuePrompt, InterruptSignal, StdinPrompt};

use crate::collaborators::{
    command::file_slug, AggregationRequest, Collaborators, DiagnosisMode, DiagnosisRequest,
    ImplementationRequest, TestReport, TestRequest,
};
use crate::config::LoopConfig;
use crate::decision::{DecisionEngine, NextAction};
use crate::error::{LoopError, Result};
use crate::evaluator::{SuccessEvaluator, TestVerdict, Verdict};
use crate::exit_policy::ExitPolicy;
use crate::metrics::MetricsSnapshot;
use crate::progress::ProgressTracker;
use crate::state::{
    CheckpointReason, ExitCondition, ImplementationStatus, PendingRetest, PendingTest,
    PhaseResults, RunState, StateStore,
};

/// How a call to [`LoopController::run`] or [`LoopController::resume`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The exit policy stopped the run.
    Completed(ExitCondition),
    /// A fix is being monitored; resume the run to retest it.
    Suspended { fix: String },
    /// The operator declined to continue.
    Paused,
    /// The interrupt signal fired.
    Interrupted,
}

/// Whether the loop keeps going after a step.
enum Step {
    Continue,
    Stop(LoopOutcome),
}

/// Orchestrates improvement runs.
pub struct LoopController {
    config: LoopConfig,
    collaborators: Collaborators,
    store: StateStore,
    tracker: ProgressTracker,
    exit_policy: ExitPolicy,
    evaluator: SuccessEvaluator,
    decision: DecisionEngine,
    prompt: Arc<dyn ContinuePrompt>,
    interrupt: InterruptSignal,
}

impl std::fmt::Debug for LoopController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopController")
            .field("config", &self.config)
            .field("collaborators", &self.collaborators)
            .field("store", &self.store)
            .field("interrupted", &self.interrupt.is_triggered())
            .finish_non_exhaustive()
    }
}

impl LoopController {
    /// Create a controller. Interactive configurations prompt on the
    /// terminal between passes.
    #[must_use]
    pub fn new(config: LoopConfig, collaborators: Collaborators) -> Self {
        let prompt: Arc<dyn ContinuePrompt> = if config.interactive {
            Arc::new(StdinPrompt)
        } else {
            Arc::new(AutoContinue)
        };

        Self {
            store: config.state_store(),
            tracker: config.progress_tracker(),
            exit_policy: config.exit_policy(),
            evaluator: config.success_evaluator(),
            decision: DecisionEngine,
            prompt,
            interrupt: InterruptSignal::new(),
            config,
            collaborators,
        }
    }

    #[must_use]
    pub fn with_prompt(mut self, prompt: Arc<dyn ContinuePrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    #[must_use]
    pub fn with_interrupt(mut self, interrupt: InterruptSignal) -> Self {
        self.interrupt = interrupt;
        self
    }

    #[must_use]
    pub fn interrupt_signal(&self) -> InterruptSignal {
        self.interrupt.clone()
    }

    #[must_use]
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Start a run, or continue an unfinished one.
    ///
    /// With `fresh` any saved state is discarded. A saved state keeps its own
    /// iteration budget, and a fix it applied without testing is tested
    /// before the next pass.
    ///
    /// # Errors
    ///
    /// - [`LoopError::AlreadyTerminated`] if the saved run has finished
    /// - [`LoopError::AwaitingRetest`] if the saved run waits for a retest
    /// - collaborator errors, after the state has been checkpointed
    pub async fn run(&self, fresh: bool) -> Result<LoopOutcome> {
        let mut state = if fresh {
            self.store.delete()?;
            RunState::new(self.config.max_iterations)
        } else {
            self.store.load_or_fresh(self.config.max_iterations)?
        };

        ensure_unfinished(&state)?;
        if let Some(pending) = &state.pending_retest {
            return Err(LoopError::AwaitingRetest {
                fix: pending.fix.clone(),
            });
        }

        if state.iteration == 0 {
            info!("Starting run {}", state.run_id);
        } else {
            info!(
                "Continuing run {} after iteration {}",
                state.run_id, state.iteration
            );
        }
        self.save(&state, CheckpointReason::Checkpoint)?;
        self.drive(&mut state).await
    }

    /// Resume a saved run. A suspended run first retests its monitored fix
    /// against the snapshot measured before that fix; a run stopped between
    /// IMPLEMENT and TEST tests the applied fix.
    ///
    /// # Errors
    ///
    /// - [`LoopError::NotSuspended`] if there is no saved run
    /// - [`LoopError::AlreadyTerminated`] if the saved run has finished
    pub async fn resume(&self) -> Result<LoopOutcome> {
        let Some(mut state) = self.store.load()? else {
            return Err(LoopError::NotSuspended);
        };
        ensure_unfinished(&state)?;

        if state.pending_retest.is_some() {
            if let Step::Stop(outcome) = self.retest(&mut state).await? {
                return Ok(outcome);
            }
        } else {
            info!("Resuming run {} after iteration {}", state.run_id, state.iteration);
        }
        self.drive(&mut state).await
    }

    async fn drive(&self, state: &mut RunState) -> Result<LoopOutcome> {
        if state.pending_test.is_some() {
            if let Step::Stop(outcome) = self.test_applied(state).await? {
                return Ok(outcome);
            }
        }
        loop {
            if state.budget_exhausted() {
                if let Some(condition) = self.check_exit(state) {
                    return self.finish(state, condition);
                }
            }
            if let Step::Stop(outcome) = self.pass(state).await? {
                return Ok(outcome);
            }
        }
    }

    /// One AGGREGATE → DIAGNOSE → IMPLEMENT → TEST → DECIDE pass.
    async fn pass(&self, state: &mut RunState) -> Result<Step> {
        let iteration = state.begin_iteration();
        info!("=== Iteration {}/{} ===", iteration, state.max_iterations);
        let dir = self.config.iteration_dir(iteration);
        std::fs::create_dir_all(&dir)?;

        // Aggregate
        let aggregation_report = dir.join("aggregation.json");
        let request = AggregationRequest {
            iteration,
            timeframe_hours: self.config.aggregation_timeframe_hours,
            output: aggregation_report.clone(),
        };
        let Some(result) = self
            .interruptible(self.collaborators.aggregator.aggregate(&request))
            .await
        else {
            return self.interrupted(state);
        };
        let metrics = match result {
            Ok(metrics) => metrics,
            Err(e) => return self.fail(state, LoopError::aggregation(iteration, format!("{e:#}"))),
        };
        info!(
            "Aggregation complete: {} errors over {} searches",
            metrics.error_count(),
            metrics.total_search_ops
        );
        state.record_metrics(metrics);
        self.tracker.capture(
            state,
            PhaseResults::Aggregation {
                report: aggregation_report.clone(),
                metrics,
            },
        );
        self.save(state, CheckpointReason::AggregationComplete)?;

        // Diagnose
        let diagnosis_report = dir.join("diagnosis.json");
        let mode = DiagnosisMode::for_iteration(iteration);
        let request = DiagnosisRequest {
            iteration,
            aggregation_report: aggregation_report.clone(),
            mode,
            output: diagnosis_report.clone(),
        };
        let Some(result) = self
            .interruptible(self.collaborators.diagnoser.diagnose(&request))
            .await
        else {
            return self.interrupted(state);
        };
        let diagnosis = match result {
            Ok(diagnosis) => diagnosis,
            Err(e) => return self.fail(state, LoopError::diagnosis(iteration, format!("{e:#}"))),
        };
        info!(
            "Diagnosis ({}) proposed {} fixes",
            mode,
            diagnosis.fixes.len()
        );
        state.set_candidates(diagnosis.fixes.clone());
        self.tracker.capture(
            state,
            PhaseResults::Diagnostics {
                report: diagnosis_report.clone(),
                mode,
                fixes: diagnosis.fixes,
                error_types: diagnosis.error_types,
            },
        );
        self.save(state, CheckpointReason::DiagnosticsComplete)?;

        // Select
        let Some(fix) = state.next_pending_fix().cloned() else {
            info!("No pending HIGH priority fix");
            return self.after_decision(state).await;
        };
        if state
            .queued_alternative
            .as_ref()
            .is_some_and(|alt| alt.name == fix.name)
        {
            state.queued_alternative = None;
        }

        // Implement
        info!("Implementing fix: {}", fix.name);
        state.mark_attempted(&fix.name);
        let request = ImplementationRequest {
            iteration,
            fix: fix.clone(),
            diagnosis_report: Some(diagnosis_report),
        };
        let Some(result) = self
            .interruptible(self.collaborators.implementer.implement(&request))
            .await
        else {
            return self.interrupted(state);
        };
        if let Err(e) = result {
            let err = LoopError::implementation(&fix.name, format!("{e:#}"));
            warn!("{err}; moving on to the next fix");
            state.mark_failed(&fix.name);
            self.tracker.capture(
                state,
                PhaseResults::Implementation {
                    fix,
                    status: ImplementationStatus::Failed,
                    error: Some(err.to_string()),
                },
            );
            self.save(state, CheckpointReason::ImplementationFailed)?;
            return Ok(Step::Continue);
        }
        self.tracker.capture(
            state,
            PhaseResults::Implementation {
                fix: fix.clone(),
                status: ImplementationStatus::Applied,
                error: None,
            },
        );
        state.pending_test = Some(PendingTest {
            fix: fix.name,
            iteration,
            baseline_report: aggregation_report,
            pre_fix_metrics: metrics,
        });
        self.save(state, CheckpointReason::ImplementationComplete)?;

        self.test_applied(state).await
    }

    /// TEST the fix recorded in `pending_test`, then decide.
    ///
    /// The marker is cleared only once the tester reports, so a run stopped
    /// between IMPLEMENT and TEST tests the applied fix when it continues.
    async fn test_applied(&self, state: &mut RunState) -> Result<Step> {
        let Some(pending) = state.pending_test.clone() else {
            return Ok(Step::Continue);
        };

        let dir = self.config.iteration_dir(pending.iteration);
        std::fs::create_dir_all(&dir)?;
        let output = dir.join(format!("test_{}.json", file_slug(&pending.fix)));
        let request = TestRequest {
            iteration: pending.iteration,
            fix: pending.fix.clone(),
            baseline_report: pending.baseline_report.clone(),
            max_items: self.config.test_max_items,
            timeframe_hours: None,
            output: output.clone(),
        };
        let Some(result) = self
            .interruptible(self.collaborators.tester.test(&request))
            .await
        else {
            return self.interrupted(state);
        };
        let report = match result {
            Ok(report) => report,
            Err(e) => return self.fail(state, LoopError::testing(&pending.fix, format!("{e:#}"))),
        };

        state.pending_test = None;
        let verdict = self.record_test(
            state,
            &pending.fix,
            &pending.pre_fix_metrics,
            report,
            output,
            false,
        )?;
        self.decide(state, &verdict, pending.into_retest()).await
    }

    /// Retest the monitored fix of a suspended run, then decide.
    async fn retest(&self, state: &mut RunState) -> Result<Step> {
        let Some(mut pending) = state.pending_retest.clone() else {
            return Ok(Step::Continue);
        };
        pending.retest_count += 1;
        info!(
            "Retesting '{}' from iteration {} (retest #{})",
            pending.fix, pending.iteration, pending.retest_count
        );

        let dir = self.config.iteration_dir(pending.iteration);
        std::fs::create_dir_all(&dir)?;
        let output = dir.join(format!(
            "retest_{}_{}.json",
            pending.retest_count,
            file_slug(&pending.fix)
        ));
        let request = TestRequest {
            iteration: state.iteration,
            fix: pending.fix.clone(),
            baseline_report: pending.baseline_report.clone(),
            max_items: self.config.test_max_items,
            timeframe_hours: Some(self.config.retest_timeframe_hours),
            output: output.clone(),
        };
        let Some(result) = self
            .interruptible(self.collaborators.tester.test(&request))
            .await
        else {
            return self.interrupted(state);
        };
        let report = match result {
            Ok(report) => report,
            Err(e) => return self.fail(state, LoopError::testing(&pending.fix, format!("{e:#}"))),
        };

        state.pending_retest = None;
        let fix = pending.fix.clone();
        let verdict =
            self.record_test(state, &fix, &pending.pre_fix_metrics, report, output, true)?;
        pending.suspended_at = Utc::now();
        self.decide(state, &verdict, pending).await
    }

    /// Settle the verdict for a tested fix and record it.
    ///
    /// A report without a verdict is evaluated against `pre_fix`.
    fn record_test(
        &self,
        state: &mut RunState,
        fix: &str,
        pre_fix: &MetricsSnapshot,
        report: TestReport,
        output: PathBuf,
        retest: bool,
    ) -> Result<TestVerdict> {
        let mut verdict = match report.verdict {
            Some(verdict) => verdict,
            None => {
                debug!("No verdict from tester; evaluating '{}' locally", fix);
                self.evaluator
                    .evaluate(fix, pre_fix, &report.post_fix_metrics)
                    .verdict
            }
        };
        if verdict.alternative_solution.is_none() {
            verdict.alternative_solution = report.alternative_solution;
        }

        info!(
            "Test verdict for '{}': {} ({}% of indicators met)",
            fix, verdict.decision, verdict.success_rate
        );
        match verdict.decision {
            Verdict::Keep => state.mark_successful(fix),
            Verdict::Rollback => state.mark_failed(fix),
            _ => {}
        }

        self.tracker.capture(
            state,
            PhaseResults::Testing {
                fix: fix.to_string(),
                report: output,
                post_fix_metrics: report.post_fix_metrics,
                verdict: verdict.clone(),
                retest,
            },
        );
        self.save(state, CheckpointReason::TestingComplete)?;
        Ok(verdict)
    }

    async fn decide(
        &self,
        state: &mut RunState,
        verdict: &TestVerdict,
        pending: PendingRetest,
    ) -> Result<Step> {
        match self.decision.next_action(verdict, state.has_pending_fix()) {
            NextAction::NextFix => {}
            NextAction::ReDiagnose => state.invalidate_candidates(),
            NextAction::TryAlternative => {
                if let Some(alternative) = &verdict.alternative_solution {
                    info!("Queueing alternative '{}' for '{}'", alternative, pending.fix);
                    state.queue_alternative(alternative.clone());
                }
            }
            NextAction::WaitAndRetest => {
                info!("Suspending run until '{}' is retested", pending.fix);
                let fix = pending.fix.clone();
                state.pending_retest = Some(pending);
                self.save(state, CheckpointReason::WaitingForRetest)?;
                return Ok(Step::Stop(LoopOutcome::Suspended { fix }));
            }
        }
        self.save(state, CheckpointReason::Decision)?;
        self.after_decision(state).await
    }

    /// Consult the exit policy, then the operator.
    async fn after_decision(&self, state: &mut RunState) -> Result<Step> {
        let progress = self.tracker.calculate_progress(state);
        if let Some(condition) = self.exit_policy.should_exit(state, progress.as_ref()) {
            return self.finish(state, condition).map(Step::Stop);
        }

        let Some(answer) = self
            .interruptible(self.prompt.confirm(state, progress.as_ref()))
            .await
        else {
            return self.interrupted(state);
        };
        if answer? {
            Ok(Step::Continue)
        } else {
            info!("Run paused after iteration {}", state.iteration);
            self.save(state, CheckpointReason::Checkpoint)?;
            Ok(Step::Stop(LoopOutcome::Paused))
        }
    }

    fn check_exit(&self, state: &mut RunState) -> Option<ExitCondition> {
        let progress = self.tracker.calculate_progress(state);
        self.exit_policy.should_exit(state, progress.as_ref())
    }

    fn finish(&self, state: &mut RunState, condition: ExitCondition) -> Result<LoopOutcome> {
        state.set_exit_condition(condition);
        let progress = self.tracker.calculate_progress(state);
        summary::write(&self.config.summary_path(), state, progress.as_ref())?;
        self.save(state, CheckpointReason::Final)?;
        info!(
            "Run finished: {} (summary: {})",
            condition.description(),
            self.config.summary_path().display()
        );
        Ok(LoopOutcome::Completed(condition))
    }

    /// Checkpoint and summarize after a fatal collaborator failure, then
    /// return the error.
    fn fail<T>(&self, state: &RunState, err: LoopError) -> Result<T> {
        error!("{err}");
        if let Err(save_err) = self.save(state, CheckpointReason::CollaboratorFailure) {
            warn!("Failed to checkpoint after collaborator failure: {save_err}");
        }
        let progress = self.tracker.calculate_progress(state);
        if let Err(summary_err) =
            summary::write(&self.config.summary_path(), state, progress.as_ref())
        {
            warn!("Failed to write summary: {summary_err}");
        }
        Err(err)
    }

    fn interrupted(&self, state: &RunState) -> Result<Step> {
        warn!("Interrupted during iteration {}", state.iteration);
        self.save(state, CheckpointReason::Interrupted)?;
        Ok(Step::Stop(LoopOutcome::Interrupted))
    }

    fn save(&self, state: &RunState, reason: CheckpointReason) -> Result<()> {
        self.store.save(state, reason)
    }

    /// Race `call` against the interrupt signal; `None` means interrupted.
    async fn interruptible<T>(&self, call: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            biased;
            () = self.interrupt.triggered() => None,
            value = call => Some(value),
        }
    }
}

fn ensure_unfinished(state: &RunState) -> Result<()> {
    match state.exit_condition {
        Some(condition) => Err(LoopError::AlreadyTerminated {
            condition: condition.to_string(),
        }),
        None => Ok(()),
    }
}
