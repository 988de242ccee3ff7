//! Completion cache in front of a [`LanguageModel`].

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use trendradar_llm::{Completion, LanguageModel, ModelConfig, Prompt};
use trendradar_shared::Result;
use trendradar_storage::Storage;

/// Serves repeated prompts from the `llm_cache` table.
///
/// Entries are keyed by endpoint, model and a hash of the prompt plus
/// sampling temperature. A completion is stored only once the caller
/// accepts it through [`LanguageModel::feedback`], and a cached completion
/// the caller rejects is dropped. Cache read or write failures are logged
/// and the live model is used.
pub struct CachedModel {
    inner: Arc<dyn LanguageModel>,
    storage: Arc<Storage>,
}

impl CachedModel {
    pub fn new(inner: Arc<dyn LanguageModel>, storage: Arc<Storage>) -> Self {
        Self { inner, storage }
    }
}

/// Cache key for a prompt under a given sampling temperature.
pub fn prompt_hash(prompt: &Prompt, temperature: f32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.system.as_bytes());
    hasher.update([0u8]);
    hasher.update(prompt.user.as_bytes());
    hasher.update([0u8]);
    hasher.update(temperature.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl LanguageModel for CachedModel {
    async fn complete(&self, prompt: &Prompt, config: &ModelConfig) -> Result<Completion> {
        let hash = prompt_hash(prompt, config.temperature);
        let scope = config.base_url.as_str();

        match self.storage.get_llm_cache(scope, &hash, &config.model).await {
            Ok(Some(text)) => {
                debug!(hash = %&hash[..12], "completion cache hit");
                return Ok(Completion {
                    text,
                    tokens_in: 0,
                    tokens_out: 0,
                    model: config.model.clone(),
                    cached: true,
                });
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "completion cache read failed"),
        }

        self.inner.complete(prompt, config).await
    }

    async fn feedback(
        &self,
        prompt: &Prompt,
        config: &ModelConfig,
        completion: &Completion,
        accepted: bool,
    ) {
        let hash = prompt_hash(prompt, config.temperature);
        let scope = config.base_url.as_str();

        let result = match (accepted, completion.cached) {
            (true, false) => {
                self.storage
                    .set_llm_cache(scope, &hash, &config.model, &completion.text)
                    .await
            }
            (false, true) => {
                debug!(hash = %&hash[..12], "dropping rejected cached completion");
                self.storage
                    .remove_llm_cache(scope, &hash, &config.model)
                    .await
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(error = %e, "completion cache write failed");
        }
        self.inner.feedback(prompt, config, completion, accepted).await;
    }
}
