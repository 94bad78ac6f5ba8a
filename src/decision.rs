//! Decision engine: what the loop does after a fix has been tested.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::evaluator::{TestVerdict, Verdict};

/// Next step after a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    /// Move on to the next pending fix.
    NextFix,
    /// Ask diagnosis for a fresh set of candidates.
    ReDiagnose,
    /// Checkpoint and suspend; the fix is retested after a cooldown.
    WaitAndRetest,
    /// Try the alternative attached to a rolled back fix.
    TryAlternative,
}

impl std::fmt::Display for NextAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NextFix => write!(f, "next_fix"),
            Self::ReDiagnose => write!(f, "re_diagnose"),
            Self::WaitAndRetest => write!(f, "wait_and_retest"),
            Self::TryAlternative => write!(f, "try_alternative"),
        }
    }
}

/// Maps a test verdict to the next loop action.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecisionEngine;

impl DecisionEngine {
    /// Decide the next action.
    ///
    /// `pending_fix` tells whether another fix is waiting to be tried.
    /// Unknown verdicts fall through to [`NextAction::NextFix`] so the loop
    /// never stalls on a verdict it does not understand.
    ///
    /// # Example
    ///
    /// ```
    /// use fixloop::decision::{DecisionEngine, NextAction};
    /// use fixloop::evaluator::{TestVerdict, Verdict};
    ///
    /// let verdict = TestVerdict {
    ///     success_rate: 50.0,
    ///     success_count: 2,
    ///     total_indicators: 4,
    ///     decision: Verdict::Monitor,
    ///     reason: String::new(),
    ///     alternative_solution: None,
    /// };
    /// assert_eq!(DecisionEngine.next_action(&verdict, true), NextAction::WaitAndRetest);
    /// ```
    #[must_use]
    pub fn next_action(&self, verdict: &TestVerdict, pending_fix: bool) -> NextAction {
        let action = match verdict.decision {
            Verdict::Keep if pending_fix => NextAction::NextFix,
            Verdict::Keep => NextAction::ReDiagnose,
            Verdict::Rollback if verdict.alternative_solution.is_some() => {
                NextAction::TryAlternative
            }
            Verdict::Rollback => NextAction::NextFix,
            Verdict::Monitor => NextAction::WaitAndRetest,
            Verdict::Modify => NextAction::ReDiagnose,
            Verdict::Unknown => NextAction::NextFix,
        };

        info!("Decision for verdict {}: {}", verdict.decision, action);
        action
    }
}
