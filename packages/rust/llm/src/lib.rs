//! Language-model access for TrendRadar.
//!
//! Stages talk to a model only through [`LanguageModel::complete`]; the
//! endpoint, credentials and model id travel in a [`ModelConfig`] that the
//! caller passes through unchanged.

pub mod openai;

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub use openai::ChatCompletionsClient;
pub use trendradar_shared::ModelConfig;
use trendradar_shared::Result;

/// A single-turn prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Text returned by the model plus usage accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    pub model: String,
    /// Served from a cache rather than a live call.
    #[serde(default)]
    pub cached: bool,
}

/// The completion contract: `complete(prompt, config) -> text | failure`.
///
/// Errors are expected to be recoverable collaborator failures
/// (network, timeout, malformed response, API error).
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &Prompt, config: &ModelConfig) -> Result<Completion>;

    /// Tell the model whether the caller could use `completion`.
    ///
    /// Caching layers keep only accepted completions and drop a cached one
    /// that was rejected, so the next attempt reaches the live model.
    async fn feedback(
        &self,
        _prompt: &Prompt,
        _config: &ModelConfig,
        _completion: &Completion,
        _accepted: bool,
    ) {
    }
}

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*\s*\n?(.*?)\n?\s*```\s*$").expect("valid regex")
});

/// Strip a Markdown code fence wrapping the whole response, if any.
pub fn strip_code_fences(response: &str) -> &str {
    match CODE_FENCE.captures(response).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => response.trim(),
    }
}

/// Truncate a string to at most `max_bytes` bytes at a character boundary.
pub fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_fence() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  ```\n{}\n```  "), "{}");
    }

    #[test]
    fn leaves_unfenced_text() {
        assert_eq!(strip_code_fences(" {\"a\":1} "), "{\"a\":1}");
        assert_eq!(
            strip_code_fences("prefix ```json\n{}\n```"),
            "prefix ```json\n{}\n```"
        );
    }

    #[test]
    fn truncates_on_char_boundary() {
        let text = "热搜 headline";
        let cut = truncate_to_char_boundary(text, 4);
        assert!(cut.len() <= 4);
        assert!(text.starts_with(cut));
        assert_eq!(truncate_to_char_boundary("short", 100), "short");
    }
}
