//! OpenAI-compatible `/chat/completions` client.
//!
//! Works with any provider exposing the same wire format (Moonshot, OpenAI,
//! OpenRouter, local gateways).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use trendradar_shared::{ModelConfig, Result, TrendRadarError};

use crate::{Completion, LanguageModel, Prompt, truncate_to_char_boundary};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

// ---------------------------------------------------------------------------
// ChatCompletionsClient
// ---------------------------------------------------------------------------

/// HTTP client for chat-completions endpoints.
///
/// Per-call time limits are applied by the caller's retry policy; the
/// client-level timeout is only a backstop.
#[derive(Clone)]
pub struct ChatCompletionsClient {
    http: Client,
}

impl ChatCompletionsClient {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("TrendRadar/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| TrendRadarError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }

    fn endpoint(base_url: &str) -> Result<Url> {
        let base = format!("{}/", base_url.trim_end_matches('/'));
        Url::parse(&base)
            .and_then(|u| u.join("chat/completions"))
            .map_err(|e| TrendRadarError::config(format!("invalid llm.base_url '{base_url}': {e}")))
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsClient {
    #[instrument(skip_all, fields(model = %config.model))]
    async fn complete(&self, prompt: &Prompt, config: &ModelConfig) -> Result<Completion> {
        let url = Self::endpoint(&config.base_url)?;

        let request = ChatRequest {
            model: &config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        };

        debug!(prompt_bytes = prompt.user.len(), "chat completion request");

        let mut builder = self.http.post(url.as_str()).json(&request);
        if let Some(key) = config.api_key.as_deref() {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| TrendRadarError::config(format!("invalid API key header: {e}")))?;
            builder = builder.header(AUTHORIZATION, value);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TrendRadarError::timeout("chat completion", Duration::from_secs(300))
            } else {
                TrendRadarError::Network(format!("chat completion: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TrendRadarError::Llm(format!(
                "API error ({status}): {}",
                truncate_to_char_boundary(&body, 300)
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| TrendRadarError::parse(format!("invalid chat completion body: {e}")))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| TrendRadarError::Llm("empty completion".into()))?;

        let (tokens_in, tokens_out) = parsed
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();

        debug!(tokens_in, tokens_out, "chat completion received");

        Ok(Completion {
            text,
            tokens_in,
            tokens_out,
            model: parsed.model.unwrap_or_else(|| config.model.clone()),
            cached: false,
        })
    }
}
