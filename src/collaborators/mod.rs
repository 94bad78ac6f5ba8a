//! Collaborators the loop delegates its phases to.
//!
//! - [`traits`]: the async contracts
//! - [`command`]: implementations that run configured programs
//! - [`mocks`]: scripted test doubles

pub mod command;
pub mod mocks;
pub mod traits;

use std::sync::Arc;

pub use command::{
    CommandAggregator, CommandDiagnoser, CommandImplementer, CommandRunner, CommandTester,
};
pub use traits::{
    AggregationRequest, Aggregator, Diagnoser, Diagnosis, DiagnosisMode, DiagnosisRequest,
    Implementer, ImplementationRequest, TestReport, TestRequest, Tester,
};

use crate::config::{CommandSpec, LoopConfig};
use crate::error::{LoopError, Result};

/// The four collaborators a loop run needs.
///
/// # Example
///
/// ```rust,ignore
/// let collaborators = Collaborators::new(
///     Arc::new(MockAggregator::new()),
///     Arc::new(MockDiagnoser::new()),
///     Arc::new(MockImplementer::new()),
///     Arc::new(MockTester::new()),
/// );
/// ```
#[derive(Clone)]
pub struct Collaborators {
    pub aggregator: Arc<dyn Aggregator>,
    pub diagnoser: Arc<dyn Diagnoser>,
    pub implementer: Arc<dyn Implementer>,
    pub tester: Arc<dyn Tester>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("aggregator", &"<dyn Aggregator>")
            .field("diagnoser", &"<dyn Diagnoser>")
            .field("implementer", &"<dyn Implementer>")
            .field("tester", &"<dyn Tester>")
            .finish()
    }
}

impl Collaborators {
    #[must_use]
    pub fn new(
        aggregator: Arc<dyn Aggregator>,
        diagnoser: Arc<dyn Diagnoser>,
        implementer: Arc<dyn Implementer>,
        tester: Arc<dyn Tester>,
    ) -> Self {
        Self {
            aggregator,
            diagnoser,
            implementer,
            tester,
        }
    }

    /// Process-backed collaborators from the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`LoopError::MissingCollaborator`] for the first phase that
    /// has no program configured.
    pub fn from_config(config: &LoopConfig) -> Result<Self> {
        let commands = &config.collaborators;
        let runner = |phase: &str, spec: Option<&CommandSpec>| -> Result<CommandRunner> {
            spec.cloned()
                .map(|spec| CommandRunner::new(spec, &config.work_dir))
                .ok_or_else(|| LoopError::MissingCollaborator {
                    phase: phase.to_string(),
                })
        };

        Ok(Self::new(
            Arc::new(CommandAggregator(runner(
                "aggregation",
                commands.aggregation.as_ref(),
            )?)),
            Arc::new(CommandDiagnoser(runner(
                "diagnosis",
                commands.diagnosis.as_ref(),
            )?)),
            Arc::new(CommandImplementer(runner(
                "implementation",
                commands.implementation.as_ref(),
            )?)),
            Arc::new(CommandTester(runner("testing", commands.testing.as_ref())?)),
        ))
    }
}
