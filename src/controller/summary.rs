//! Final summary written when a run stops.

use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::metrics::{signed_change, Metric, MetricsSnapshot};
use crate::progress::ProgressSnapshot;
use crate::state::persistence::write_atomic;
use crate::state::{ExitCondition, RunState};

/// Rows of the baseline vs final table, in display order.
const TABLE_METRICS: [Metric; 4] = [
    Metric::TotalSearchOps,
    Metric::TitleFailures,
    Metric::UrlErrors,
    Metric::ModelErrors,
];

fn conclusion(condition: Option<ExitCondition>) -> &'static str {
    match condition {
        Some(ExitCondition::Success) => {
            "The improvement loop completed successfully with significant reductions in \
             error rates and improvements in metadata extraction success rates."
        }
        Some(ExitCondition::PlateauDetected) => {
            "The improvement loop reached a plateau where further iterations did not yield \
             significant improvements. The system has been optimized to the extent possible \
             with the current approach."
        }
        Some(ExitCondition::MaxIterationsReached) => {
            "The improvement loop completed after reaching the maximum number of iterations. \
             Further improvements may be possible with additional diagnostic work or \
             alternative approaches."
        }
        Some(ExitCondition::AllFixesAttempted) => {
            "Every fix proposed by diagnosis has been attempted. New diagnostic findings are \
             needed before another run can make progress."
        }
        Some(ExitCondition::RegressionDetected) => {
            "Error counts grew beyond the regression threshold relative to the baseline, so \
             the loop stopped. Review the failed fixes before running again."
        }
        None => {
            "The improvement loop stopped before reaching an exit condition. The saved state \
             can be resumed."
        }
    }
}

fn metric_row(out: &mut String, metric: Metric, baseline: &MetricsSnapshot, current: &MetricsSnapshot) {
    let before = baseline.get(metric);
    let after = current.get(metric);
    let change = signed_change(before, after);
    let pct = if before > 0 {
        (after as f64 - before as f64) / before as f64 * 100.0
    } else {
        0.0
    };
    let _ = writeln!(
        out,
        "| {} | {} | {} | {:+} | {:+.1}% |",
        metric.label(),
        before,
        after,
        change,
        pct
    );
}

fn fix_list(out: &mut String, title: &str, fixes: &[String]) {
    let _ = writeln!(out, "### {} ({})\n", title, fixes.len());
    for fix in fixes {
        let _ = writeln!(out, "- {fix}");
    }
    out.push('\n');
}

/// Render the final summary as markdown.
#[must_use]
pub fn render(
    state: &RunState,
    progress: Option<&ProgressSnapshot>,
    generated_at: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    let condition = state
        .exit_condition
        .map_or_else(|| "none".to_string(), |c| c.to_string());

    out.push_str("# Improvement Loop - Final Report\n\n");
    let _ = writeln!(out, "**Generated**: {}", generated_at.to_rfc3339());
    let _ = writeln!(out, "**Run**: {}", state.run_id);
    let _ = writeln!(out, "**Total Iterations**: {}", state.iteration);
    let _ = writeln!(out, "**Exit Condition**: {condition}\n");

    out.push_str("## Executive Summary\n\n");
    let _ = writeln!(
        out,
        "This improvement loop ran for {} iterations, attempting {} fixes with {} successful implementations.\n",
        state.iteration,
        state.fixes_attempted.len(),
        state.fixes_successful.len()
    );
    if let Some(p) = progress {
        out.push_str("**Overall Improvement**:\n");
        let _ = writeln!(out, "- Total Error Reduction: {}%", p.total_error_reduction);
        let _ = writeln!(out, "- Success Rate Improvement: {}%\n", p.success_rate_improvement);
    }

    out.push_str("## Baseline vs Final Metrics\n\n");
    let baseline = state.baseline_metrics.unwrap_or_default();
    let current = state.current_metrics.unwrap_or_default();
    out.push_str("| Metric | Baseline | Final | Change | % Change |\n");
    out.push_str("|--------|----------|-------|--------|----------|\n");
    for metric in TABLE_METRICS {
        metric_row(&mut out, metric, &baseline, &current);
    }

    out.push_str("\n## Fixes Applied\n\n");
    fix_list(&mut out, "Successful Fixes", &state.fixes_successful);
    fix_list(&mut out, "Failed Fixes", &state.fixes_failed);

    out.push_str("## Iteration History\n\n");
    for record in &state.iteration_history {
        let _ = writeln!(out, "### Iteration {} - {}", record.iteration, record.phase);
        let _ = writeln!(out, "Timestamp: {}", record.timestamp.to_rfc3339());
        let _ = writeln!(out, "Status: {}\n", record.results.status());
    }

    out.push_str("## Conclusion\n\n");
    out.push_str(conclusion(state.exit_condition));
    out.push('\n');
    out
}

/// Render and atomically write the summary to `path`.
pub fn write(path: &Path, state: &RunState, progress: Option<&ProgressSnapshot>) -> Result<()> {
    let report = render(state, progress, Utc::now());
    write_atomic(path, report.as_bytes())
}
