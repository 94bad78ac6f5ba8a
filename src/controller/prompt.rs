//! Confirmation between loop passes, and the interrupt signal.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use crate::progress::ProgressSnapshot;
use crate::state::RunState;

/// Asked after every pass whether the loop should go on.
#[async_trait]
pub trait ContinuePrompt: Send + Sync {
    /// Return false to pause the run after the current checkpoint.
    async fn confirm(&self, state: &RunState, progress: Option<&ProgressSnapshot>)
        -> Result<bool>;
}

/// Always continues. Used for non-interactive runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoContinue;

#[async_trait]
impl ContinuePrompt for AutoContinue {
    async fn confirm(&self, _state: &RunState, _progress: Option<&ProgressSnapshot>) -> Result<bool> {
        Ok(true)
    }
}

/// Prints progress and asks on the terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinPrompt;

#[async_trait]
impl ContinuePrompt for StdinPrompt {
    async fn confirm(&self, state: &RunState, progress: Option<&ProgressSnapshot>) -> Result<bool> {
        if let Some(p) = progress {
            println!();
            println!("{}", "Overall progress".bold());
            println!("  Iterations:               {}", p.iterations);
            println!("  Fixes successful:         {}", p.fixes_successful.to_string().green());
            println!("  Fixes failed:             {}", p.fixes_failed.to_string().red());
            println!("  Total error reduction:    {}%", p.total_error_reduction);
            println!("  Success rate improvement: {}%", p.success_rate_improvement);
        }
        println!();
        println!(
            "Iteration {}/{} complete. Continue? [Y/n]",
            state.iteration, state.max_iterations
        );

        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        if read == 0 {
            return Ok(false);
        }
        let answer = line.trim().to_lowercase();
        Ok(answer.is_empty() || answer == "y" || answer == "yes")
    }
}

/// Cooperative cancellation flag shared between the CLI and the controller.
///
/// Cloning shares the flag; triggering any clone interrupts them all.
#[derive(Debug, Clone)]
pub struct InterruptSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for InterruptSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptSignal {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the signal has been triggered.
    pub async fn triggered(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|interrupted| *interrupted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
