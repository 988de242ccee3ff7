//! Core pipeline orchestration for TrendRadar.
//!
//! A run threads one [`SharedState`] through a graph of [`Stage`]s:
//! collection, analysis, discussion and report. The [`Orchestrator`] walks
//! the graph, checks each stage's dependencies, commits its writes, and
//! stops on fatal failures while keeping everything already produced.

pub mod cache;
pub mod orchestrator;
pub mod persist;
pub mod pipeline;
pub mod prompts;
pub mod retry;
pub mod stage;
pub mod stages;
pub mod state;

pub use orchestrator::{
    Edge, EdgeGuard, EdgeSelector, GuardedEdges, Orchestrator, OrchestratorBuilder, RunOutcome,
    RunStatus,
};
pub use persist::{RunArtifacts, load_snapshot, write_run_artifacts};
pub use pipeline::{
    Collaborators, PipelineRun, ProgressReporter, RunOptions, SilentProgress, build_orchestrator,
    run_pipeline,
};
pub use stage::{Dependency, Requirement, RunContext, Stage, StageFailure};
pub use state::{SharedState, StageErrorEntry, StageScope, StateField};
