//! Multi-persona discussion of the analysed topics.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use trendradar_llm::{LanguageModel, ModelConfig};
use trendradar_shared::{
    Discussion, DiscussionSettings, PersonaConfig, Statement, TopicInsight, TrendRadarError,
};

use crate::prompts::{discussion_prompt, topic_refs};
use crate::retry::call_with_retry;
use crate::stage::{Dependency, RunContext, Stage, StageFailure};
use crate::state::{StageScope, StateField};

pub const NAME: &str = "discussion";

const DEPENDENCIES: &[Dependency] = &[Dependency::non_empty(StateField::Analysis)];
const OUTPUTS: &[StateField] = &[StateField::Discussion];

/// Personas speak one after another, each seeing every earlier statement.
pub struct DiscussionStage {
    model: Arc<dyn LanguageModel>,
    model_config: ModelConfig,
    personas: Vec<PersonaConfig>,
    settings: DiscussionSettings,
}

impl DiscussionStage {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        model_config: ModelConfig,
        personas: Vec<PersonaConfig>,
        settings: DiscussionSettings,
    ) -> Self {
        Self {
            model,
            model_config,
            personas,
            settings,
        }
    }

    async fn speak(
        &self,
        persona: &PersonaConfig,
        prompt: &trendradar_llm::Prompt,
        focus: &[&TopicInsight],
        ctx: &RunContext<'_>,
    ) -> trendradar_shared::Result<Statement> {
        let model = &*self.model;
        let config = &self.model_config;
        let name = persona.name.as_str();
        let operation = format!("discussion {name}");
        let completion = call_with_retry(&operation, &self.settings.retry, ctx.cancel, move |_| async move {
            let completion = model.complete(prompt, config).await?;
            let spoke = !completion.text.trim().is_empty();
            model.feedback(prompt, config, &completion, spoke).await;
            if !spoke {
                return Err(TrendRadarError::Llm(format!("{name} returned an empty statement")));
            }
            Ok(completion)
        })
        .await?;

        let text = completion.text.trim().to_string();
        Ok(Statement {
            persona: persona.name.clone(),
            role: persona.role.clone(),
            topic_refs: topic_refs(&text, focus),
            text,
        })
    }
}

#[async_trait]
impl Stage for DiscussionStage {
    fn name(&self) -> &str {
        NAME
    }

    fn dependencies(&self) -> &[Dependency] {
        DEPENDENCIES
    }

    fn outputs(&self) -> &[StateField] {
        OUTPUTS
    }

    #[instrument(skip_all, fields(personas = self.personas.len()))]
    async fn run(
        &self,
        scope: &mut StageScope<'_>,
        ctx: &RunContext<'_>,
    ) -> std::result::Result<(), StageFailure> {
        let analysis = scope
            .state()
            .analysis()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| {
                StageFailure::Fatal(TrendRadarError::dependency_missing(NAME, "analysis", "empty"))
            })?;
        let focus: Vec<&TopicInsight> = analysis
            .ranked()
            .into_iter()
            .take(self.settings.focus_topics.max(1))
            .collect();
        ctx.progress.phase("Running persona discussion");

        let mut transcript: Vec<Statement> = Vec::with_capacity(self.personas.len());
        for persona in &self.personas {
            if ctx.cancel.is_cancelled() {
                scope.record_unit_error(persona.name.as_str(), "cancelled before speaking");
                continue;
            }
            let prompt = discussion_prompt(persona, analysis, &focus, &transcript);
            match self.speak(persona, &prompt, &focus, ctx).await {
                Ok(statement) => {
                    info!(persona = %persona.name, chars = statement.text.len(), "persona spoke");
                    ctx.progress.unit_finished(NAME, &persona.name, true);
                    transcript.push(statement);
                }
                Err(e) => {
                    warn!(persona = %persona.name, error = %e, "persona skipped");
                    ctx.progress.unit_finished(NAME, &persona.name, false);
                    scope.record_unit_error(persona.name.as_str(), &e);
                }
            }
        }

        let total = self.personas.len();
        let spoke = transcript.len();
        let ratio = if total == 0 {
            0.0
        } else {
            spoke as f64 / total as f64
        };
        let degraded = spoke == 0 || ratio < self.settings.min_success_ratio;
        if degraded {
            scope.record_detail(format!("{spoke} of {total} personas produced a statement"));
        }

        scope.set_discussion(Discussion {
            statements: transcript,
            degraded,
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SilentProgress;
    use crate::pipeline::test_support::{StubModel, model_config, personas, state_with_analysis};
    use crate::state::SharedState;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;
    use trendradar_shared::RetryPolicy;

    fn settings() -> DiscussionSettings {
        DiscussionSettings {
            retry: RetryPolicy::new(0, 1, 5),
            min_success_ratio: 0.0,
            focus_topics: 3,
        }
    }

    async fn discuss(stage: &DiscussionStage, state: &mut SharedState) {
        let cancel = CancellationToken::new();
        let ctx = RunContext {
            cancel: &cancel,
            progress: &SilentProgress,
        };
        let mut scope = StageScope::new(state, NAME, OUTPUTS);
        stage.run(&mut scope, &ctx).await.expect("discussion succeeds");
        let staged = scope.into_staged();
        state.commit(NAME, OUTPUTS, staged).unwrap();
    }

    #[tokio::test]
    async fn personas_speak_in_order_and_see_prior_turns() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let log = seen.clone();
        let model = Arc::new(StubModel::new(move |p| {
            log.lock().unwrap().push(p.user.clone());
            let name = p
                .system
                .strip_prefix("You are ")
                .and_then(|s| s.split(',').next())
                .unwrap_or("?")
                .to_string();
            Ok(format!("{name} says hello"))
        }));
        let stage = DiscussionStage::new(model, model_config(), personas(&["P1", "P2", "P3"]), settings());
        let mut state = state_with_analysis();
        discuss(&stage, &mut state).await;

        let discussion = state.discussion().unwrap();
        let speakers: Vec<&str> = discussion.statements.iter().map(|s| s.persona.as_str()).collect();
        assert_eq!(speakers, vec!["P1", "P2", "P3"]);
        assert!(!discussion.degraded);

        let prompts = seen.lock().unwrap();
        assert!(prompts[0].contains("You speak first."));
        assert!(prompts[1].contains("P1 (role): P1 says hello"));
        assert!(!prompts[1].contains("P2 says hello"));
        assert!(prompts[2].contains("P1 (role): P1 says hello"));
        assert!(prompts[2].contains("P2 (role): P2 says hello"));
    }

    #[tokio::test]
    async fn failing_persona_is_skipped() {
        let model = Arc::new(StubModel::new(|p| {
            if p.system.starts_with("You are P2,") {
                Err(TrendRadarError::Network("reset".into()))
            } else {
                Ok("fine".to_string())
            }
        }));
        let stage = DiscussionStage::new(model, model_config(), personas(&["P1", "P2", "P3"]), settings());
        let mut state = state_with_analysis();
        discuss(&stage, &mut state).await;

        let speakers: Vec<&str> = state
            .discussion()
            .unwrap()
            .statements
            .iter()
            .map(|s| s.persona.as_str())
            .collect();
        assert_eq!(speakers, vec!["P1", "P3"]);
        assert!(state.errors_for(NAME).unwrap().units.contains_key("P2"));
    }

    #[tokio::test]
    async fn all_personas_failing_still_succeeds_degraded() {
        let model = Arc::new(StubModel::new(|_| Err(TrendRadarError::Llm("down".into()))));
        let stage = DiscussionStage::new(model, model_config(), personas(&["P1", "P2"]), settings());
        let mut state = state_with_analysis();
        discuss(&stage, &mut state).await;

        let discussion = state.discussion().unwrap();
        assert!(discussion.is_empty());
        assert!(discussion.degraded);
        assert_eq!(state.errors_for(NAME).unwrap().units.len(), 2);
    }
}
