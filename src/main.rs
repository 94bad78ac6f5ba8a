//! fixloop - improvement loop controller
//!
//! Command line entry point: run, resume and inspect improvement runs.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;

use fixloop::collaborators::command::read_metrics;
use fixloop::evaluator::Verdict;
use fixloop::{Collaborators, LoopConfig, LoopController, LoopError, LoopOutcome, SuccessEvaluator};

/// Exit status after an interrupt.
const INTERRUPTED_EXIT: i32 = 130;

#[derive(Parser)]
#[command(name = "fixloop")]
#[command(version)]
#[command(about = "Drive an improve-and-verify loop over an external pipeline", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Work directory holding the state, summary and iteration artifacts
    #[arg(short, long, global = true, default_value = ".", env = "FIXLOOP_WORK_DIR")]
    work_dir: PathBuf,

    /// Configuration file (defaults to <work-dir>/fixloop.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a run, or continue an unfinished one
    Run {
        /// Discard any saved state and start over
        #[arg(long)]
        fresh: bool,

        /// Iteration budget for a new run
        #[arg(short, long)]
        max_iterations: Option<u32>,

        /// Do not ask for confirmation between iterations
        #[arg(long)]
        non_interactive: bool,
    },

    /// Resume a saved run, retesting a monitored fix first
    Resume {
        /// Do not ask for confirmation between iterations
        #[arg(long)]
        non_interactive: bool,
    },

    /// Show the saved run state
    Status {
        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Evaluate a fix from two metrics reports
    Evaluate {
        /// Metrics measured before the fix
        #[arg(long)]
        baseline: PathBuf,

        /// Metrics measured after the fix
        #[arg(long)]
        current: PathBuf,

        /// Name of the evaluated fix
        #[arg(long, default_value = "unnamed fix")]
        fix_name: String,

        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration
    Config {
        /// Check thresholds and collaborator programs
        #[arg(long)]
        validate: bool,
    },
}

fn exit_with(err: &LoopError) -> ! {
    eprintln!("{} {}", "Error:".red().bold(), err);
    std::process::exit(err.exit_code());
}

fn load_config(work_dir: &Path, explicit: Option<&Path>) -> LoopConfig {
    LoopConfig::load(work_dir, explicit).unwrap_or_else(|e| exit_with(&e))
}

fn build_controller(config: LoopConfig) -> LoopController {
    if let Err(e) = config.validate() {
        exit_with(&e);
    }
    let collaborators = Collaborators::from_config(&config).unwrap_or_else(|e| exit_with(&e));
    let controller = LoopController::new(config, collaborators);

    let signal = controller.interrupt_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.trigger();
        }
    });
    controller
}

fn report_outcome(outcome: LoopOutcome, config: &LoopConfig) {
    match outcome {
        LoopOutcome::Completed(condition) => {
            println!(
                "\n{} Run finished: {}",
                "OK".green().bold(),
                condition.description()
            );
            println!("   Summary: {}", config.summary_path().display());
            println!("   State:   {}", config.state_path().display());
        }
        LoopOutcome::Suspended { fix } => {
            println!(
                "\n{} Monitoring '{}'. Run `fixloop resume` after the cooldown to retest it.",
                "Suspended:".yellow().bold(),
                fix
            );
        }
        LoopOutcome::Paused => {
            println!(
                "\n{} State saved. Continue with `fixloop run`.",
                "Paused:".yellow().bold()
            );
        }
        LoopOutcome::Interrupted => {
            eprintln!(
                "\n{} State saved to {}. Continue with `fixloop resume`.",
                "Interrupted:".yellow().bold(),
                config.state_path().display()
            );
            std::process::exit(INTERRUPTED_EXIT);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "fixloop=debug,info"
    } else {
        "fixloop=info,warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let work_dir = cli.work_dir.canonicalize().unwrap_or(cli.work_dir.clone());
    if !work_dir.exists() {
        eprintln!(
            "{} Work directory does not exist: {}",
            "Error:".red().bold(),
            work_dir.display()
        );
        std::process::exit(1);
    }
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Run {
            fresh,
            max_iterations,
            non_interactive,
        } => {
            let mut config = load_config(&work_dir, config_path);
            if let Some(max) = max_iterations {
                config = config.with_max_iterations(max);
            }
            if non_interactive {
                config = config.with_interactive(false);
            }

            let controller = build_controller(config.clone());
            match controller.run(fresh).await {
                Ok(outcome) => report_outcome(outcome, &config),
                Err(e) => exit_with(&e),
            }
        }

        Commands::Resume { non_interactive } => {
            let mut config = load_config(&work_dir, config_path);
            if non_interactive {
                config = config.with_interactive(false);
            }

            let controller = build_controller(config.clone());
            match controller.resume().await {
                Ok(outcome) => report_outcome(outcome, &config),
                Err(e) => exit_with(&e),
            }
        }

        Commands::Status { json } => {
            let config = load_config(&work_dir, config_path);
            let store = config.state_store();
            let Some((state, info)) = store.load_with_info().unwrap_or_else(|e| exit_with(&e))
            else {
                if json {
                    println!("null");
                } else {
                    println!(
                        "{} No saved run in {}",
                        "Note:".yellow(),
                        work_dir.display()
                    );
                }
                return Ok(());
            };
            let progress = config.progress_tracker().calculate_progress(&state);

            if json {
                let output = serde_json::json!({
                    "state": state,
                    "checkpoint": {
                        "saved_at": info.saved_at,
                        "reason": info.reason,
                    },
                    "progress": progress,
                });
                println!("{}", serde_json::to_string_pretty(&output)?);
                return Ok(());
            }

            println!("{}", "Improvement run".bold());
            println!("   Run:        {}", state.run_id);
            println!("   Started:    {}", state.start_time.to_rfc3339());
            println!("   Iteration:  {}/{}", state.iteration, state.max_iterations);
            println!(
                "   Checkpoint: {} at {}",
                info.reason,
                info.saved_at.to_rfc3339()
            );
            if let (Some(baseline), Some(current)) = (state.baseline_metrics, state.current_metrics)
            {
                println!(
                    "   Errors:     {} -> {}",
                    baseline.error_count(),
                    current.error_count()
                );
            }
            if let Some(p) = &progress {
                println!("   Reduction:  {}%", p.total_error_reduction);
                println!("   Success rate change: {}%", p.success_rate_improvement);
            }
            println!(
                "   Fixes:      {} attempted, {} kept, {} failed",
                state.fixes_attempted.len(),
                state.fixes_successful.len().to_string().green(),
                state.fixes_failed.len().to_string().red()
            );
            if let Some(pending) = &state.pending_test {
                println!(
                    "   {} '{}' was applied in iteration {} and awaits its test",
                    "Untested:".yellow(),
                    pending.fix,
                    pending.iteration
                );
            }
            if let Some(pending) = &state.pending_retest {
                println!(
                    "   {} '{}' awaits a retest (suspended {})",
                    "Monitoring:".yellow(),
                    pending.fix,
                    pending.suspended_at.to_rfc3339()
                );
            }
            match state.exit_condition {
                Some(condition) => println!(
                    "   {} {} ({})",
                    "Finished:".green(),
                    condition,
                    condition.description()
                ),
                None => println!("   {} in progress", "Status:".cyan()),
            }
        }

        Commands::Evaluate {
            baseline,
            current,
            fix_name,
            json,
        } => {
            let config = load_config(&work_dir, config_path);
            let before = read_metrics(&baseline)?;
            let after = read_metrics(&current)?;
            let evaluation =
                SuccessEvaluator::new(config.evaluator.clone()).evaluate(&fix_name, &before, &after);

            if json {
                println!("{}", serde_json::to_string_pretty(&evaluation)?);
                return Ok(());
            }

            println!("{} {}", "Evaluation:".cyan().bold(), fix_name);
            println!();
            println!(
                "   {:<16} {:>9} {:>9} {:>8} {:>9}  Status",
                "Metric", "Baseline", "Current", "Change", "% Change"
            );
            for c in &evaluation.comparisons {
                println!(
                    "   {:<16} {:>9} {:>9} {:>+8} {:>+8.1}%  {}",
                    c.metric.label(),
                    c.baseline,
                    c.current,
                    c.change,
                    c.percent_change,
                    c.status()
                );
            }
            println!();
            println!(
                "   Error reduction: {}% ({} -> {})",
                evaluation.overall.error_reduction,
                evaluation.overall.baseline_errors,
                evaluation.overall.current_errors
            );
            println!();
            println!("   Success indicators:");
            for indicator in &evaluation.success_indicators {
                let mark = if indicator.met { "met".green() } else { "not met".red() };
                println!("     - {}: {}", indicator.name, mark);
            }
            println!("   Failure indicators:");
            for indicator in &evaluation.failure_indicators {
                let mark = if indicator.met { "FIRED".red() } else { "clear".green() };
                println!("     - {}: {}", indicator.name, mark);
            }
            println!();

            let verdict = &evaluation.verdict;
            let decision = match verdict.decision {
                Verdict::Keep => verdict.decision.to_string().green().bold(),
                Verdict::Monitor => verdict.decision.to_string().yellow().bold(),
                _ => verdict.decision.to_string().red().bold(),
            };
            println!(
                "   Decision: {} ({}/{} indicators, {}%)",
                decision, verdict.success_count, verdict.total_indicators, verdict.success_rate
            );
            if !verdict.reason.is_empty() {
                println!("   Reason:   {}", verdict.reason);
            }
        }

        Commands::Config { validate } => {
            let config = load_config(&work_dir, config_path);
            if !validate {
                print!("{}", config.to_toml().unwrap_or_else(|e| exit_with(&e)));
                return Ok(());
            }

            let problems = config.problems();
            let unresolved = config.unresolved_programs();
            let missing: Vec<_> = config
                .collaborators
                .entries()
                .into_iter()
                .filter(|(_, spec)| spec.is_none())
                .map(|(phase, _)| phase)
                .collect();

            for problem in &problems {
                println!("{} {}", "Invalid:".red().bold(), problem);
            }
            for (phase, program) in &unresolved {
                println!(
                    "{} {} program '{}' not found",
                    "Warning:".yellow().bold(),
                    phase,
                    program
                );
            }
            for phase in &missing {
                println!(
                    "{} no {} collaborator configured",
                    "Warning:".yellow().bold(),
                    phase
                );
            }

            if let Some(problem) = problems.into_iter().next() {
                std::process::exit(problem.exit_code());
            }
            println!("{} Configuration is valid", "OK".green().bold());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use fixloop::ProgressTracker;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_progress_tracker_from_config() {
        let config = LoopConfig::default().with_plateau_threshold(2.0);
        assert_eq!(config.progress_tracker(), ProgressTracker::new(2.0, -5.0));
    }
}
