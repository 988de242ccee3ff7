//! Error types for TrendRadar.
//!
//! Library crates use [`TrendRadarError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all TrendRadar operations.
#[derive(Debug, thiserror::Error)]
pub enum TrendRadarError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while talking to a collaborator.
    #[error("network error: {0}")]
    Network(String),

    /// A collaborator call exceeded its time budget.
    #[error("{operation} timed out after {}ms", elapsed.as_millis())]
    Timeout {
        operation: String,
        elapsed: Duration,
    },

    /// Malformed collaborator response (JSON, schema, etc.).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Language-model call failed (API error, empty completion, ...).
    #[error("language model error: {0}")]
    Llm(String),

    /// Report rendering failed.
    #[error("render error: {0}")]
    Render(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A stage broke its state contract (programming error).
    #[error("state violation in stage '{stage}': {message}")]
    StateViolation { stage: String, message: String },

    /// A stage's required upstream field is absent or empty.
    #[error("stage '{stage}' cannot run: required field '{field}' is {reason}")]
    DependencyMissing {
        stage: String,
        field: String,
        reason: String,
    },

    /// Input contract violated inside a stage (e.g., nothing to work on).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The run was cancelled by the operator.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, TrendRadarError>;

/// Coarse classification used by retry and failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient or per-unit collaborator failure; retried, then degrades one unit.
    RecoverableCollaboratorFailure,
    /// Stage contract breach; always aborts the run.
    StateViolation,
    /// Upstream field missing; aborts remaining stages, keeps partial state.
    FatalDependencyMissing,
    /// Invalid configuration; aborts before any stage runs.
    ConfigurationError,
    /// Anything else that cannot be retried (I/O, storage, validation, cancel).
    Fatal,
}

impl TrendRadarError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a state violation attributed to `stage`.
    pub fn state_violation(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StateViolation {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Create a missing-dependency error.
    pub fn dependency_missing(
        stage: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::DependencyMissing {
            stage: stage.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error for `operation`.
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    /// Map this error onto the failure taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Network(_)
            | Self::Timeout { .. }
            | Self::Parse { .. }
            | Self::Llm(_)
            | Self::Render(_) => ErrorClass::RecoverableCollaboratorFailure,
            Self::StateViolation { .. } => ErrorClass::StateViolation,
            Self::DependencyMissing { .. } => ErrorClass::FatalDependencyMissing,
            Self::Config { .. } => ErrorClass::ConfigurationError,
            Self::Storage(_) | Self::Io { .. } | Self::Validation { .. } | Self::Cancelled(_) => {
                ErrorClass::Fatal
            }
        }
    }

    /// Whether a retry of the same call could plausibly succeed.
    pub fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::RecoverableCollaboratorFailure
    }
}
