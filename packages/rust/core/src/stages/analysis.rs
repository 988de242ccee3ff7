//! Batch topic analysis.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tracing::{info, instrument, warn};

use trendradar_llm::{LanguageModel, ModelConfig};
use trendradar_shared::{
    Analysis, AnalysisSettings, FALLBACK_CATEGORY, RawItem, Result, TopicInsight, TrendRadarError,
};

use crate::prompts::{BatchAnalysis, analysis_prompt, parse_analysis_response};
use crate::retry::call_with_retry;
use crate::stage::{Dependency, RunContext, Stage, StageFailure};
use crate::state::{StageScope, StateField};

pub const NAME: &str = "analysis";

const DEPENDENCIES: &[Dependency] = &[Dependency::non_empty(StateField::RawItems)];
const OUTPUTS: &[StateField] = &[StateField::Analysis];

/// Splits `raw_items` into batches and asks the model to merge, label and
/// score topics in each. A batch that keeps failing degrades to one
/// placeholder topic per item.
pub struct AnalysisStage {
    model: Arc<dyn LanguageModel>,
    model_config: ModelConfig,
    settings: AnalysisSettings,
}

impl AnalysisStage {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        model_config: ModelConfig,
        settings: AnalysisSettings,
    ) -> Self {
        Self {
            model,
            model_config,
            settings,
        }
    }

    async fn analyse_batches<'a>(
        &self,
        batches: &[&'a [RawItem]],
        ctx: &RunContext<'_>,
    ) -> Vec<Result<BatchAnalysis>> {
        let model = &*self.model;
        let config = &self.model_config;
        let retry = &self.settings.retry;
        let categories = self.settings.categories.as_slice();

        let units: Vec<_> = batches
            .iter()
            .copied()
            .enumerate()
            .map(|(i, batch)| async move {
                let number = i + 1;
                if ctx.cancel.is_cancelled() {
                    return Err(TrendRadarError::Cancelled(format!("analysis batch {number}")));
                }
                let prompt = analysis_prompt(batch, categories);
                let prompt = &prompt;
                let operation = format!("analysis batch {number}");
                let result = call_with_retry(&operation, retry, ctx.cancel, move |_| async move {
                    let completion = model.complete(prompt, config).await?;
                    let parsed = parse_analysis_response(&completion.text, batch, categories);
                    model
                        .feedback(prompt, config, &completion, parsed.is_ok())
                        .await;
                    parsed
                })
                .await;
                ctx.progress
                    .unit_finished(NAME, &format!("batch-{number}"), result.is_ok());
                result
            })
            .collect();

        stream::iter(units)
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await
    }
}

/// Fold a topic into `topics`, merging with an existing entry of the same id.
fn merge_topic(topics: &mut BTreeMap<String, TopicInsight>, topic: TopicInsight) {
    let Some(existing) = topics.get_mut(&topic.id) else {
        topics.insert(topic.id.clone(), topic);
        return;
    };
    if existing.is_placeholder() {
        *existing = topic;
        return;
    }
    existing.salience = match (existing.salience, topic.salience) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    if existing.summary.is_empty() {
        existing.summary = topic.summary;
    }
    for source in topic.sources {
        if !existing.sources.contains(&source) {
            existing.sources.push(source);
        }
    }
}

#[async_trait]
impl Stage for AnalysisStage {
    fn name(&self) -> &str {
        NAME
    }

    fn dependencies(&self) -> &[Dependency] {
        DEPENDENCIES
    }

    fn outputs(&self) -> &[StateField] {
        OUTPUTS
    }

    #[instrument(skip_all, fields(model = %self.model_config.model))]
    async fn run(
        &self,
        scope: &mut StageScope<'_>,
        ctx: &RunContext<'_>,
    ) -> std::result::Result<(), StageFailure> {
        let items = scope.state().raw_items().unwrap_or_default();
        if items.is_empty() {
            return Err(StageFailure::Fatal(TrendRadarError::dependency_missing(
                NAME, "raw_items", "empty",
            )));
        }

        let batches: Vec<&[RawItem]> = items.chunks(self.settings.batch_size.max(1)).collect();
        let total = batches.len();
        ctx.progress.phase("Analysing topics");
        info!(items = items.len(), batches = total, "analysis started");

        let results = self.analyse_batches(&batches, ctx).await;

        let mut analysis = Analysis {
            batches_total: total,
            ..Default::default()
        };
        let mut summaries = Vec::new();
        let mut succeeded = 0usize;

        // Batch order, so a deterministic model yields identical output.
        for (i, (batch, result)) in batches.iter().zip(results).enumerate() {
            let number = i + 1;
            match result {
                Ok(parsed) => {
                    succeeded += 1;
                    for topic in parsed.topics {
                        merge_topic(&mut analysis.topics, topic);
                    }
                    summaries.extend(parsed.summary);
                }
                Err(e) => {
                    warn!(batch = number, error = %e, "batch degraded to placeholders");
                    scope.record_unit_error(format!("batch-{number}"), &e);
                    analysis.batches_failed.push(number);
                    for item in batch.iter() {
                        let placeholder = TopicInsight::unknown(item, FALLBACK_CATEGORY);
                        analysis
                            .topics
                            .entry(placeholder.id.clone())
                            .or_insert(placeholder);
                    }
                }
            }
        }

        let ratio = succeeded as f64 / total as f64;
        analysis.acceptable = succeeded > 0 && ratio >= self.settings.min_success_ratio;
        if !analysis.acceptable {
            scope.record_detail(format!(
                "only {succeeded} of {total} batches succeeded (minimum ratio {})",
                self.settings.min_success_ratio
            ));
        }
        if !summaries.is_empty() {
            analysis.summary = Some(summaries.join(" "));
        }

        info!(
            topics = analysis.analyzed().count(),
            failed = analysis.batches_failed.len(),
            acceptable = analysis.acceptable,
            "analysis finished"
        );
        scope.set_analysis(analysis)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SilentProgress;
    use crate::cache::CachedModel;
    use crate::pipeline::test_support::{
        StubModel, analysis_json, analysis_settings, fast_retry, items, model_config,
    };
    use crate::state::SharedState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;
    use trendradar_storage::Storage;
    use uuid::Uuid;

    async fn analyse(stage: &AnalysisStage, raw: Vec<RawItem>) -> (SharedState, std::result::Result<(), StageFailure>) {
        let mut state = SharedState::new();
        let outputs = [StateField::RawItems];
        let mut seed = StageScope::new(&state, "seed", &outputs);
        seed.set_raw_items(raw).unwrap();
        let staged = seed.into_staged();
        state.commit("seed", &outputs, staged).unwrap();

        let cancel = CancellationToken::new();
        let ctx = RunContext {
            cancel: &cancel,
            progress: &SilentProgress,
        };
        let mut scope = StageScope::new(&state, NAME, OUTPUTS);
        let result = stage.run(&mut scope, &ctx).await;
        let staged = scope.into_staged();
        if result.is_ok() {
            state.commit(NAME, OUTPUTS, staged).unwrap();
        } else {
            state.merge_errors(NAME, staged.into_errors());
        }
        (state, result)
    }

    fn settings(batch_size: usize) -> AnalysisSettings {
        AnalysisSettings {
            batch_size,
            ..analysis_settings()
        }
    }

    #[tokio::test]
    async fn identical_input_gives_identical_analysis() {
        let model = Arc::new(StubModel::new(|p| Ok(analysis_json(&p.user))));
        let stage = AnalysisStage::new(model, model_config(), settings(2));
        let raw = items("weibo", &["a", "b", "c"]);

        let (first, r1) = analyse(&stage, raw.clone()).await;
        let (second, r2) = analyse(&stage, raw).await;
        r1.unwrap();
        r2.unwrap();
        assert_eq!(first.analysis(), second.analysis());
        assert_eq!(first.analysis().unwrap().batches_total, 2);
    }

    #[tokio::test]
    async fn failed_batch_becomes_placeholders() {
        let model = Arc::new(StubModel::new(|p| {
            if p.user.contains("] c") {
                Err(TrendRadarError::Llm("API error (500)".into()))
            } else {
                Ok(analysis_json(&p.user))
            }
        }));
        let stage = AnalysisStage::new(model, model_config(), settings(2));
        let (state, result) = analyse(&stage, items("weibo", &["a", "b", "c"])).await;
        result.unwrap();

        let analysis = state.analysis().unwrap();
        assert_eq!(analysis.batches_failed, vec![2]);
        assert!(analysis.acceptable);
        let placeholders: Vec<&TopicInsight> =
            analysis.topics.values().filter(|t| t.is_placeholder()).collect();
        assert_eq!(placeholders.len(), 1);
        assert_eq!(placeholders[0].name, "c");
        assert!(state.errors_for(NAME).unwrap().units.contains_key("batch-2"));
    }

    #[tokio::test]
    async fn all_batches_failing_leaves_empty_analysis() {
        let model = Arc::new(StubModel::new(|_| Ok("I cannot help with that".to_string())));
        let stage = AnalysisStage::new(model, model_config(), settings(10));
        let (state, result) = analyse(&stage, items("weibo", &["a", "b"])).await;
        result.unwrap();

        let analysis = state.analysis().unwrap();
        assert!(!analysis.acceptable);
        assert!(analysis.is_empty());
        assert!(!state.is_non_empty(StateField::Analysis));
        assert!(state.errors_for(NAME).unwrap().detail.is_some());
    }

    #[tokio::test]
    async fn min_success_ratio_is_enforced() {
        let model = Arc::new(StubModel::new(|p| {
            if p.user.contains("] c") {
                Err(TrendRadarError::Llm("boom".into()))
            } else {
                Ok(analysis_json(&p.user))
            }
        }));
        let strict = AnalysisSettings {
            min_success_ratio: 0.75,
            ..settings(2)
        };
        let stage = AnalysisStage::new(model, model_config(), strict);
        let (state, _) = analyse(&stage, items("weibo", &["a", "b", "c"])).await;
        assert!(!state.analysis().unwrap().acceptable);
    }

    #[tokio::test]
    async fn malformed_answer_is_retried_and_not_cached() {
        let path = std::env::temp_dir().join(format!("tr_test_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&path).await.unwrap());
        let counter = AtomicUsize::new(0);
        let stub = Arc::new(StubModel::new(move |p| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok("garbled".to_string())
            } else {
                Ok(analysis_json(&p.user))
            }
        }));
        let model: Arc<dyn LanguageModel> = Arc::new(CachedModel::new(stub.clone(), storage));
        let retrying = AnalysisSettings {
            retry: fast_retry(2),
            ..settings(10)
        };
        let stage = AnalysisStage::new(model, model_config(), retrying);
        let raw = items("weibo", &["a", "b"]);

        let (first, result) = analyse(&stage, raw.clone()).await;
        result.unwrap();
        let analysis = first.analysis().unwrap();
        assert!(analysis.batches_failed.is_empty());
        assert!(analysis.acceptable);
        assert_eq!(analysis.analyzed().count(), 2);
        assert_eq!(stub.calls(), 2);

        // Only the accepted answer was stored; the next run reuses it.
        let (second, result) = analyse(&stage, raw).await;
        result.unwrap();
        assert_eq!(second.analysis(), first.analysis());
        assert_eq!(stub.calls(), 2);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn topic_without_heat_or_known_sentiment_counts_as_analysed() {
        let model = Arc::new(StubModel::new(|_| {
            Ok(r#"{"top_topics":[{"topic":"Rate cut","sentiment":"cautiously optimistic","comment":"watching","category":"economy","items":[1]}],"summary":"quiet"}"#.to_string())
        }));
        let stage = AnalysisStage::new(model, model_config(), settings(10));
        let (state, result) = analyse(&stage, items("weibo", &["Rate cut"])).await;
        result.unwrap();

        let analysis = state.analysis().unwrap();
        assert_eq!(analysis.analyzed().count(), 1);
        assert!(analysis.batches_failed.is_empty());
        assert!(state.is_non_empty(StateField::Analysis));
        assert!(state.errors_for(NAME).is_none());
    }

    #[test]
    fn merge_keeps_hottest_score_and_all_sources() {
        let raw = items("weibo", &["x", "y"]);
        let mut topics = BTreeMap::new();
        let mut first = TopicInsight::unknown(&raw[0], "other");
        first.id = "t".into();
        first.placeholder = false;
        first.salience = Some(40.0);
        first.sentiment = trendradar_shared::Sentiment::Neutral;
        let mut second = first.clone();
        second.salience = Some(70.0);
        second.sources = vec![raw[1].key()];

        merge_topic(&mut topics, first);
        merge_topic(&mut topics, second);
        let merged = &topics["t"];
        assert_eq!(merged.salience, Some(70.0));
        assert_eq!(merged.sources, vec![raw[0].key(), raw[1].key()]);
    }
}
