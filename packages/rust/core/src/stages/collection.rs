//! Trending-list collection across platforms.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use tracing::{debug, info, instrument, warn};

use trendradar_collector::{FetchOptions, Scraper, merge_items};
use trendradar_shared::{
    CollectionSettings, PlatformConfig, RawItem, Result, RunId, TrendRadarError,
};
use trendradar_storage::Storage;

use crate::retry::call_with_retry;
use crate::stage::{Dependency, RunContext, Stage, StageFailure};
use crate::state::{StageScope, StateField};

pub const NAME: &str = "collection";

const OUTPUTS: &[StateField] = &[StateField::RawItems];

/// Item history used to widen each run's sample.
pub struct History {
    pub storage: Arc<Storage>,
    pub lookback: chrono::Duration,
}

/// Fetches every configured platform and merges the results into
/// `raw_items`. One failing platform only costs its own items.
pub struct CollectionStage {
    scraper: Arc<dyn Scraper>,
    platforms: Vec<PlatformConfig>,
    settings: CollectionSettings,
    history: Option<History>,
}

impl CollectionStage {
    pub fn new(
        scraper: Arc<dyn Scraper>,
        platforms: Vec<PlatformConfig>,
        settings: CollectionSettings,
    ) -> Self {
        Self {
            scraper,
            platforms,
            settings,
            history: None,
        }
    }

    pub fn with_history(mut self, history: History) -> Self {
        self.history = Some(history);
        self
    }

    async fn fetch_all(&self, ctx: &RunContext<'_>) -> Vec<(&PlatformConfig, Result<Vec<RawItem>>)> {
        let options = FetchOptions {
            max_items: self.settings.max_items_per_platform,
            timeout: self.settings.retry.timeout,
        };
        let options = &options;
        let scraper = &*self.scraper;
        let retry = &self.settings.retry;

        let units: Vec<_> = self
            .platforms
            .iter()
            .map(|platform| async move {
                if ctx.cancel.is_cancelled() {
                    return (
                        platform,
                        Err(TrendRadarError::Cancelled(format!("fetch {}", platform.id))),
                    );
                }
                let operation = format!("fetch {}", platform.id);
                let result = call_with_retry(&operation, retry, ctx.cancel, move |_| {
                    scraper.fetch(platform, options)
                })
                .await;
                ctx.progress.unit_finished(NAME, &platform.id, result.is_ok());
                (platform, result)
            })
            .collect();

        stream::iter(units)
            .buffered(self.settings.concurrency.max(1))
            .collect()
            .await
    }

    /// Merge `current` with items seen within the lookback window, then
    /// record `current` for later runs.
    async fn merge_history(
        history: &History,
        run_id: &RunId,
        current: &[RawItem],
    ) -> Result<Vec<RawItem>> {
        let cutoff = Utc::now() - history.lookback;
        let past = history.storage.items_since(&cutoff).await?;
        history.storage.record_items(run_id, current).await?;
        let pruned = history.storage.prune_history(&cutoff).await?;
        debug!(past = past.len(), pruned, "history merged");
        Ok(merge_items([past, current.to_vec()]))
    }
}

#[async_trait]
impl Stage for CollectionStage {
    fn name(&self) -> &str {
        NAME
    }

    fn dependencies(&self) -> &[Dependency] {
        &[]
    }

    fn outputs(&self) -> &[StateField] {
        OUTPUTS
    }

    #[instrument(skip_all, fields(platforms = self.platforms.len()))]
    async fn run(
        &self,
        scope: &mut StageScope<'_>,
        ctx: &RunContext<'_>,
    ) -> std::result::Result<(), StageFailure> {
        ctx.progress.phase("Collecting trending lists");

        let mut fetched = Vec::new();
        for (platform, result) in self.fetch_all(ctx).await {
            match result {
                Ok(items) => {
                    info!(platform = %platform.id, count = items.len(), "platform fetched");
                    fetched.push(items);
                }
                Err(e) => {
                    warn!(platform = %platform.id, error = %e, "platform failed");
                    scope.record_unit_error(platform.id.as_str(), &e);
                }
            }
        }

        if fetched.is_empty() {
            if ctx.cancel.is_cancelled() {
                return Err(StageFailure::Fatal(TrendRadarError::Cancelled(
                    "collection cancelled before any platform finished".into(),
                )));
            }
            return Err(StageFailure::Fatal(TrendRadarError::validation(format!(
                "all {} platforms failed",
                self.platforms.len()
            ))));
        }

        let current = merge_items(fetched);
        let items = match &self.history {
            Some(history) => {
                match Self::merge_history(history, scope.state().run_id(), &current).await {
                    Ok(merged) => merged,
                    Err(e) => {
                        warn!(error = %e, "history merge failed, using current items only");
                        scope.record_unit_error("history", &e);
                        current
                    }
                }
            }
            None => current,
        };

        info!(items = items.len(), "collection merged");
        scope.set_raw_items(items)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SilentProgress;
    use crate::pipeline::test_support::{StubScraper, collection_settings, items};
    use crate::state::SharedState;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn platforms(ids: &[&str]) -> Vec<PlatformConfig> {
        ids.iter().map(|id| PlatformConfig::new(*id, *id)).collect()
    }

    async fn run_stage(stage: &CollectionStage, state: &SharedState) -> (std::result::Result<(), StageFailure>, crate::state::StagedWrites) {
        let cancel = CancellationToken::new();
        let ctx = RunContext {
            cancel: &cancel,
            progress: &SilentProgress,
        };
        let mut scope = StageScope::new(state, NAME, OUTPUTS);
        let result = stage.run(&mut scope, &ctx).await;
        (result, scope.into_staged())
    }

    #[tokio::test]
    async fn merges_platforms_and_records_failures() {
        let scraper = StubScraper::new()
            .ok("a", items("a", &["one", "two"]))
            .failing("b", || TrendRadarError::Network("HTTP 503".into()));
        let stage = CollectionStage::new(
            Arc::new(scraper),
            platforms(&["a", "b"]),
            collection_settings(),
        );
        let mut state = SharedState::new();
        let (result, staged) = run_stage(&stage, &state).await;
        result.expect("one platform is enough");
        state.commit(NAME, OUTPUTS, staged).unwrap();

        let titles: Vec<&str> = state
            .raw_items()
            .unwrap()
            .iter()
            .map(|i| i.title.as_str())
            .collect();
        assert_eq!(titles, vec!["one", "two"]);
        assert!(state.errors_for(NAME).unwrap().units.contains_key("b"));
    }

    #[tokio::test]
    async fn all_platforms_failing_is_fatal() {
        let scraper = StubScraper::new()
            .failing("a", || TrendRadarError::Network("reset".into()))
            .failing("b", || TrendRadarError::parse("bad body"));
        let stage = CollectionStage::new(
            Arc::new(scraper),
            platforms(&["a", "b"]),
            collection_settings(),
        );
        let state = SharedState::new();
        let (result, staged) = run_stage(&stage, &state).await;
        let failure = result.unwrap_err();
        assert!(!failure.is_recoverable());
        assert!(failure.error().to_string().contains("all 2 platforms failed"));
        assert_eq!(staged.into_errors().units.len(), 2);
    }

    #[tokio::test]
    async fn history_widens_the_sample() {
        let path = std::env::temp_dir().join(format!("tr_test_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&path).await.unwrap());
        storage
            .record_items(&RunId::new(), &items("a", &["earlier", "one"]))
            .await
            .unwrap();

        let scraper = StubScraper::new().ok("a", items("a", &["one", "two"]));
        let stage = CollectionStage::new(Arc::new(scraper), platforms(&["a"]), collection_settings())
            .with_history(History {
                storage: storage.clone(),
                lookback: chrono::Duration::hours(24),
            });

        let mut state = SharedState::new();
        let (result, staged) = run_stage(&stage, &state).await;
        result.unwrap();
        state.commit(NAME, OUTPUTS, staged).unwrap();

        let titles: Vec<&str> = state
            .raw_items()
            .unwrap()
            .iter()
            .map(|i| i.title.as_str())
            .collect();
        assert_eq!(titles, vec!["earlier", "one", "two"]);

        let _ = std::fs::remove_file(&path);
    }
}
