//! Report composition.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, instrument, warn};

use trendradar_llm::{LanguageModel, ModelConfig};
use trendradar_report::ReportRenderer;
use trendradar_shared::{
    Analysis, PlatformConfig, RawItem, Report, ReportDocument, ReportSection, ReportSettings,
    Result, SectionBody, SectionKind, TopicGroup, TopicInsight, TrendRadarError,
};

use crate::prompts::executive_summary_prompt;
use crate::retry::call_with_retry;
use crate::stage::{Dependency, RunContext, Stage, StageFailure};
use crate::state::{SharedState, StageScope, StateField};

pub const NAME: &str = "report";

const DEPENDENCIES: &[Dependency] = &[Dependency::non_empty(StateField::RawItems)];
const OUTPUTS: &[StateField] = &[StateField::Report];

/// Builds the report document from whatever upstream stages produced and
/// hands it to the renderer. Missing or degraded inputs become explicit
/// "data unavailable" sections.
pub struct ReportStage {
    renderer: Arc<dyn ReportRenderer>,
    settings: ReportSettings,
    platforms: Vec<PlatformConfig>,
    categories: Vec<String>,
    summarizer: Option<(Arc<dyn LanguageModel>, ModelConfig)>,
}

impl ReportStage {
    pub fn new(
        renderer: Arc<dyn ReportRenderer>,
        settings: ReportSettings,
        platforms: Vec<PlatformConfig>,
        categories: Vec<String>,
    ) -> Self {
        Self {
            renderer,
            settings,
            platforms,
            categories,
            summarizer: None,
        }
    }

    /// Model used for the executive summary when it is enabled.
    pub fn with_summarizer(mut self, model: Arc<dyn LanguageModel>, config: ModelConfig) -> Self {
        self.summarizer = Some((model, config));
        self
    }

    async fn executive_summary(
        &self,
        items: &[RawItem],
        analysis: Option<&Analysis>,
        ctx: &RunContext<'_>,
    ) -> Option<Result<String>> {
        if !self.settings.executive_summary {
            return None;
        }
        let (model, config) = self.summarizer.as_ref()?;
        let model = &**model;
        let prompt = executive_summary_prompt(items, analysis);
        let prompt = &prompt;
        let result = call_with_retry("executive summary", &self.settings.retry, ctx.cancel, move |_| async move {
            let completion = model.complete(prompt, config).await?;
            let text = completion.text.trim().to_string();
            model.feedback(prompt, config, &completion, !text.is_empty()).await;
            if text.is_empty() {
                return Err(TrendRadarError::Llm("empty executive summary".into()));
            }
            Ok(text)
        })
        .await;
        Some(result)
    }

    fn build_document(
        &self,
        state: &SharedState,
        items: &[RawItem],
        executive: Option<SectionBody>,
    ) -> ReportDocument {
        let analysis = state.analysis();
        let usable = analysis.filter(|a| !a.is_empty());
        let mut sections = Vec::with_capacity(5);

        if let Some(body) = executive {
            sections.push(section(SectionKind::ExecutiveSummary, "Executive summary", body));
        }

        let overview = match usable.and_then(|a| a.summary.clone()) {
            Some(summary) => SectionBody::Text(summary),
            None => unavailable(analysis_gap(analysis)),
        };
        sections.push(section(SectionKind::Overview, "Overview", overview));

        let topics = match usable {
            Some(a) => SectionBody::Topics(group_topics(a, &self.categories)),
            None => unavailable(analysis_gap(analysis)),
        };
        sections.push(section(SectionKind::Topics, "Topic analysis", topics));

        let discussion = match state.discussion() {
            Some(d) if !d.is_empty() => SectionBody::Transcript(d.statements.clone()),
            Some(_) => unavailable("all personas failed"),
            None if state.errors_for("discussion").is_some() => {
                unavailable("the discussion stage failed")
            }
            None => unavailable("no discussion was run"),
        };
        sections.push(section(SectionKind::Discussion, "Discussion", discussion));

        sections.push(section(
            SectionKind::Sources,
            "Sources",
            SectionBody::Sources(order_sources(items, &self.platforms)),
        ));

        let window = items
            .iter()
            .map(|i| i.fetched_at)
            .min()
            .zip(items.iter().map(|i| i.fetched_at).max());

        ReportDocument {
            title: self.settings.title.clone(),
            generated_at: Utc::now(),
            window,
            item_count: items.len(),
            topic_count: usable.map_or(0, |a| a.analyzed().count()),
            sections,
        }
    }
}

fn section(kind: SectionKind, title: &str, body: SectionBody) -> ReportSection {
    ReportSection {
        kind,
        title: title.to_string(),
        body,
    }
}

fn unavailable(reason: impl Into<String>) -> SectionBody {
    SectionBody::Unavailable {
        reason: reason.into(),
    }
}

fn analysis_gap(analysis: Option<&Analysis>) -> &'static str {
    match analysis {
        None => "topic analysis did not run",
        Some(a) if !a.acceptable => "topic analysis failed for too many batches",
        Some(_) => "no topics were identified",
    }
}

/// Group analysed topics by cluster.
///
/// Topics inside a group are ordered by heat. Groups are ordered by their
/// hottest topic, then by their position in `categories` (unlisted
/// clusters last, by name).
pub fn group_topics(analysis: &Analysis, categories: &[String]) -> Vec<TopicGroup> {
    let mut groups: Vec<TopicGroup> = Vec::new();
    for topic in analysis.ranked() {
        match groups.iter_mut().find(|g| g.cluster == topic.cluster) {
            Some(group) => group.topics.push(topic.clone()),
            None => groups.push(TopicGroup {
                cluster: topic.cluster.clone(),
                topics: vec![topic.clone()],
            }),
        }
    }

    let position = |cluster: &str| {
        categories
            .iter()
            .position(|c| c == cluster)
            .unwrap_or(usize::MAX)
    };
    groups.sort_by(|a, b| {
        max_heat(&b.topics)
            .total_cmp(&max_heat(&a.topics))
            .then_with(|| position(&a.cluster).cmp(&position(&b.cluster)))
            .then_with(|| a.cluster.cmp(&b.cluster))
    });
    groups
}

fn max_heat(topics: &[TopicInsight]) -> f64 {
    topics
        .iter()
        .filter_map(|t| t.salience)
        .fold(0.0, f64::max)
}

/// Items in configured platform order, then by rank.
fn order_sources(items: &[RawItem], platforms: &[PlatformConfig]) -> Vec<RawItem> {
    let position = |id: &str| {
        platforms
            .iter()
            .position(|p| p.id == id)
            .unwrap_or(usize::MAX)
    };
    let mut sorted = items.to_vec();
    sorted.sort_by(|a, b| {
        position(&a.platform)
            .cmp(&position(&b.platform))
            .then_with(|| a.platform.cmp(&b.platform))
            .then_with(|| a.rank.cmp(&b.rank))
    });
    sorted
}

#[async_trait]
impl Stage for ReportStage {
    fn name(&self) -> &str {
        NAME
    }

    fn dependencies(&self) -> &[Dependency] {
        DEPENDENCIES
    }

    fn outputs(&self) -> &[StateField] {
        OUTPUTS
    }

    #[instrument(skip_all, fields(format = self.renderer.extension()))]
    async fn run(
        &self,
        scope: &mut StageScope<'_>,
        ctx: &RunContext<'_>,
    ) -> std::result::Result<(), StageFailure> {
        let state = scope.state();
        let items = state.raw_items().unwrap_or_default();
        if items.is_empty() {
            return Err(StageFailure::Fatal(TrendRadarError::dependency_missing(
                NAME, "raw_items", "empty",
            )));
        }
        ctx.progress.phase("Rendering report");

        let usable = state.analysis().filter(|a| !a.is_empty());
        let executive = match self.executive_summary(items, usable, ctx).await {
            None => None,
            Some(Ok(text)) if !text.is_empty() => Some(SectionBody::Text(text)),
            Some(Ok(_)) => {
                scope.record_unit_error("executive_summary", "model returned an empty summary");
                Some(unavailable("the executive summary could not be generated"))
            }
            Some(Err(e)) => {
                warn!(error = %e, "executive summary failed");
                scope.record_unit_error("executive_summary", &e);
                Some(unavailable("the executive summary could not be generated"))
            }
        };

        let document = self.build_document(state, items, executive);
        let bytes = self.renderer.render(&document)?;
        let markup = String::from_utf8(bytes)
            .map_err(|e| TrendRadarError::Render(format!("renderer produced invalid UTF-8: {e}")))?;
        let degraded = document.sections.iter().any(ReportSection::is_unavailable);

        info!(
            sections = document.sections.len(),
            degraded,
            bytes = markup.len(),
            "report rendered"
        );
        scope.set_report(Report {
            document,
            markup,
            extension: self.renderer.extension().to_string(),
            degraded,
        })?;
        Ok(())
    }
}
