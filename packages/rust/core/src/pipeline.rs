//! Pipeline assembly and the `run` entry point.
//!
//! Wires the collaborators from a [`RunConfig`] into the standard stage
//! graph (collection → analysis → discussion → report), runs it, and writes
//! the run's artifacts and bookkeeping.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use trendradar_collector::{NewsNowScraper, Scraper};
use trendradar_llm::{ChatCompletionsClient, LanguageModel};
use trendradar_report::{ReportRenderer, renderer_for};
use trendradar_shared::{Result, RunConfig};
use trendradar_storage::{RunSummary, Storage};

use crate::cache::CachedModel;
use crate::orchestrator::{Orchestrator, RunOutcome, RunStatus};
use crate::persist::{RunArtifacts, write_run_artifacts};
use crate::stages::{AnalysisStage, CollectionStage, DiscussionStage, History, ReportStage};
use crate::stages::{analysis, collection, discussion, report};
use crate::state::SharedState;

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when a stage enters a new phase of work.
    fn phase(&self, name: &str);
    /// Called when a stage is invoked (again on a stage-level retry).
    fn stage_started(&self, stage: &str);
    /// Called when one unit (platform, batch, persona) completes.
    fn unit_finished(&self, stage: &str, unit: &str, ok: bool);
    /// Called when a stage's outcome is known.
    fn stage_finished(&self, stage: &str, ok: bool);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn stage_started(&self, _stage: &str) {}
    fn unit_finished(&self, _stage: &str, _unit: &str, _ok: bool) {}
    fn stage_finished(&self, _stage: &str, _ok: bool) {}
}

/// External services the stages call.
#[derive(Clone)]
pub struct Collaborators {
    pub scraper: Arc<dyn Scraper>,
    pub model: Arc<dyn LanguageModel>,
    pub renderer: Arc<dyn ReportRenderer>,
}

impl Collaborators {
    /// NewsNow scraper, OpenAI-compatible model client and the configured
    /// renderer.
    pub fn live(config: &RunConfig) -> Result<Self> {
        Ok(Self {
            scraper: Arc::new(NewsNowScraper::new(config.collection.endpoint.clone())?),
            model: Arc::new(ChatCompletionsClient::new()?),
            renderer: Arc::from(renderer_for(config.report.format)),
        })
    }
}

/// Per-invocation switches that are not part of the configuration file.
#[derive(Debug, Default)]
pub struct RunOptions {
    /// Merge and record item history.
    pub use_history: bool,
    /// Continue from a saved snapshot instead of starting fresh.
    pub resume: Option<SharedState>,
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct PipelineRun {
    pub outcome: RunOutcome,
    pub artifacts: RunArtifacts,
}

/// Build the standard four-stage graph.
///
/// With `storage`, completions are cached (if enabled) and collection
/// merges item history (if `use_history`).
pub fn build_orchestrator(
    config: &RunConfig,
    collaborators: Collaborators,
    storage: Option<Arc<Storage>>,
    use_history: bool,
) -> Result<Orchestrator> {
    let Collaborators {
        scraper,
        model,
        renderer,
    } = collaborators;

    let model: Arc<dyn LanguageModel> = match &storage {
        Some(storage) if config.cache_completions => {
            Arc::new(CachedModel::new(model, storage.clone()))
        }
        _ => model,
    };

    let mut collection = CollectionStage::new(
        scraper,
        config.platforms.clone(),
        config.collection.clone(),
    );
    if let Some(storage) = storage.filter(|_| use_history && config.lookback_hours > 0) {
        collection = collection.with_history(History {
            storage,
            lookback: chrono::Duration::hours(i64::from(config.lookback_hours)),
        });
    }

    let mut report_stage = ReportStage::new(
        renderer,
        config.report.clone(),
        config.platforms.clone(),
        config.analysis.categories.clone(),
    );
    if config.report.executive_summary {
        report_stage = report_stage.with_summarizer(model.clone(), config.model.clone());
    }

    Orchestrator::builder()
        .stage(collection)
        .stage(AnalysisStage::new(
            model.clone(),
            config.model.clone(),
            config.analysis.clone(),
        ))
        .stage(DiscussionStage::new(
            model,
            config.model.clone(),
            config.personas.clone(),
            config.discussion.clone(),
        ))
        .stage(report_stage)
        .chain(&[collection::NAME, analysis::NAME, discussion::NAME, report::NAME])
        .stage_retries(config.stage_retries)
        .build()
}

/// Run the full pipeline once.
///
/// 1. Open the run database (history, completion cache, run records)
/// 2. Walk the stage graph
/// 3. Write the report, `index` copy and state snapshot
/// 4. Record the run outcome
#[instrument(skip_all, fields(platforms = config.platforms.len(), out = %config.output_dir.display()))]
pub async fn run_pipeline(
    config: &RunConfig,
    collaborators: Collaborators,
    options: RunOptions,
    cancel: &CancellationToken,
    progress: &dyn ProgressReporter,
) -> Result<PipelineRun> {
    std::fs::create_dir_all(&config.output_dir)
        .map_err(|e| trendradar_shared::TrendRadarError::io(&config.output_dir, e))?;

    let storage = match Storage::open(&config.database_path()).await {
        Ok(storage) => Some(Arc::new(storage)),
        Err(e) => {
            warn!(error = %e, "run database unavailable, continuing without history or cache");
            None
        }
    };

    let orchestrator =
        build_orchestrator(config, collaborators, storage.clone(), options.use_history)?;
    let state = options.resume.map(SharedState::resume).unwrap_or_default();
    let run_id = state.run_id().clone();
    match state.resumed_from() {
        Some(previous) => info!(%run_id, resumed_from = %previous, "resuming run"),
        None => info!(%run_id, "starting run"),
    }

    if let Some(storage) = &storage {
        if let Err(e) = storage.insert_run(&run_id, &state.started_at()).await {
            warn!(error = %e, "failed to record run start");
        }
    }

    let outcome = orchestrator.run(state, cancel, progress).await;
    let artifacts = write_run_artifacts(&config.output_dir, &outcome.state)?;

    if let Some(storage) = &storage {
        record_outcome(storage, &outcome, &artifacts).await;
    }

    Ok(PipelineRun { outcome, artifacts })
}

async fn record_outcome(storage: &Storage, outcome: &RunOutcome, artifacts: &RunArtifacts) {
    let error = match &outcome.status {
        RunStatus::Aborted { stage, error } => Some(format!("{stage}: {error}")),
        _ => None,
    };
    let report_path = artifacts.report.as_deref().map(Path::to_string_lossy);
    let summary = RunSummary {
        status: outcome.status.as_str(),
        item_count: outcome.state.raw_items().map_or(0, <[_]>::len),
        topic_count: outcome
            .state
            .analysis()
            .map_or(0, |a| a.analyzed().count()),
        report_path: report_path.as_deref(),
        error: error.as_deref(),
    };
    if let Err(e) = storage.finish_run(outcome.state.run_id(), &summary).await {
        warn!(error = %e, "failed to record run outcome");
    }
}
