//! The stage contract.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use trendradar_shared::{ErrorClass, TrendRadarError};

use crate::pipeline::ProgressReporter;
use crate::state::{StageScope, StateField};

/// How strongly a stage needs an upstream field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// The field must have been written.
    Present,
    /// The field must have been written and hold usable content.
    NonEmpty,
}

/// A field a stage reads, checked before the stage is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub field: StateField,
    pub requirement: Requirement,
}

impl Dependency {
    pub const fn present(field: StateField) -> Self {
        Self {
            field,
            requirement: Requirement::Present,
        }
    }

    pub const fn non_empty(field: StateField) -> Self {
        Self {
            field,
            requirement: Requirement::NonEmpty,
        }
    }
}

/// Why a stage gave up.
#[derive(Debug)]
pub enum StageFailure {
    /// The whole stage failed for a transient reason and may be re-run.
    Recoverable(TrendRadarError),
    /// Re-running cannot help.
    Fatal(TrendRadarError),
}

impl StageFailure {
    pub fn error(&self) -> &TrendRadarError {
        match self {
            Self::Recoverable(e) | Self::Fatal(e) => e,
        }
    }

    pub fn into_error(self) -> TrendRadarError {
        match self {
            Self::Recoverable(e) | Self::Fatal(e) => e,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }
}

impl From<TrendRadarError> for StageFailure {
    fn from(err: TrendRadarError) -> Self {
        match err.class() {
            ErrorClass::RecoverableCollaboratorFailure => Self::Recoverable(err),
            _ => Self::Fatal(err),
        }
    }
}

/// Run-wide handles passed to every stage.
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    pub cancel: &'a CancellationToken,
    pub progress: &'a dyn ProgressReporter,
}

/// One unit of the pipeline.
///
/// A stage reads what it needs from `scope.state()`, writes only the
/// fields it lists in [`outputs`](Stage::outputs), and records per-unit
/// failures on the scope instead of failing the whole stage when it can
/// still produce a usable result.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn dependencies(&self) -> &[Dependency];

    fn outputs(&self) -> &[StateField];

    async fn run(
        &self,
        scope: &mut StageScope<'_>,
        ctx: &RunContext<'_>,
    ) -> Result<(), StageFailure>;
}
