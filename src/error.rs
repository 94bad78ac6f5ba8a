//! Custom error types for fixloop.
//!
//! The taxonomy mirrors how the controller treats each failure: collaborator
//! errors from aggregation, diagnosis and testing end the run, an
//! implementation failure only costs the fix that was being applied, and a
//! malformed state document is surfaced to the caller instead of being
//! silently replaced.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for fixloop operations
#[derive(Error, Debug)]
pub enum LoopError {
    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// The aggregation collaborator failed to produce a metrics snapshot
    #[error("Aggregation failed in iteration {iteration}: {message}")]
    Aggregation { iteration: u32, message: String },

    /// The diagnosis collaborator failed to produce fix candidates
    #[error("Diagnosis failed in iteration {iteration}: {message}")]
    Diagnosis { iteration: u32, message: String },

    /// The testing collaborator failed to produce post-fix metrics
    #[error("Testing of '{fix}' failed: {message}")]
    Testing { fix: String, message: String },

    /// The implementation collaborator could not apply a fix
    #[error("Implementation of '{fix}' failed: {message}")]
    Implementation { fix: String, message: String },

    // =========================================================================
    // State Errors
    // =========================================================================
    /// The persisted state document is not a well-formed state
    #[error("Corrupt state file {path}: {reason}")]
    StateCorrupt { path: PathBuf, reason: String },

    /// Another process holds the state lock
    #[error("State file is locked by another process: {path}")]
    StateLocked { path: PathBuf },

    /// The run already reached a terminal exit condition
    #[error("Run already terminated ({condition}); start a fresh run to continue")]
    AlreadyTerminated { condition: String },

    /// Resume was requested but there is no saved run
    #[error("No saved run to resume")]
    NotSuspended,

    /// Run was requested while a retest is pending
    #[error("Run is suspended waiting to retest '{fix}'; use resume")]
    AwaitingRetest { fix: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    /// No collaborator configured for a phase
    #[error("No {phase} collaborator configured")]
    MissingCollaborator { phase: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// TOML error wrapper
    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LoopError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create an aggregation error
    pub fn aggregation(iteration: u32, message: impl Into<String>) -> Self {
        Self::Aggregation {
            iteration,
            message: message.into(),
        }
    }

    /// Create a diagnosis error
    pub fn diagnosis(iteration: u32, message: impl Into<String>) -> Self {
        Self::Diagnosis {
            iteration,
            message: message.into(),
        }
    }

    /// Create a testing error
    pub fn testing(fix: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Testing {
            fix: fix.into(),
            message: message.into(),
        }
    }

    /// Create an implementation error
    pub fn implementation(fix: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Implementation {
            fix: fix.into(),
            message: message.into(),
        }
    }

    /// Create a corrupt state error
    pub fn state_corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::StateCorrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Whether this is a collaborator failure that ends the run
    pub fn is_collaborator_failure(&self) -> bool {
        matches!(
            self,
            Self::Aggregation { .. } | Self::Diagnosis { .. } | Self::Testing { .. }
        )
    }

    /// Check if this error is recoverable (the loop continues with the next fix)
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Implementation { .. })
    }

    /// Check if this error is fatal (should abort the run)
    pub fn is_fatal(&self) -> bool {
        !self.is_recoverable()
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Aggregation { .. } | Self::Diagnosis { .. } | Self::Testing { .. } => 3,
            Self::StateCorrupt { .. } | Self::StateLocked { .. } => 4,
            Self::AlreadyTerminated { .. }
            | Self::NotSuspended
            | Self::AwaitingRetest { .. } => 5,
            Self::Config { .. } | Self::InvalidConfig { .. } | Self::MissingCollaborator { .. } => {
                7
            }
            _ => 1,
        }
    }
}

/// Type alias for fixloop results
pub type Result<T> = std::result::Result<T, LoopError>;

/// Extension trait for converting foreign errors to LoopError
pub trait IntoLoopError<T> {
    fn into_loop_config(self) -> Result<T>;
    fn into_state_corrupt(self, path: &std::path::Path) -> Result<T>;
}

impl<T, E: Into<anyhow::Error>> IntoLoopError<T> for std::result::Result<T, E> {
    fn into_loop_config(self) -> Result<T> {
        self.map_err(|e| LoopError::config(e.into().to_string()))
    }

    fn into_state_corrupt(self, path: &std::path::Path) -> Result<T> {
        self.map_err(|e| LoopError::state_corrupt(path, e.into().to_string()))
    }
}
