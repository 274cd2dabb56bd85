/// LLM Client: the provider boundary for every governed AI call.
///
/// ARCHITECTURAL RULE: Only the orchestrator talks to a `ModelClient`.
/// Retries live in the orchestrator; clients make exactly one HTTP call per invocation.
///
/// Model: claude-sonnet-4-5 (hardcoded, do not make configurable to prevent drift)
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ai::tokens::estimate_text_tokens;
use crate::ai::types::{
    AiResponse, ChatMessage, ContentPart, FinishReason, GenerationOptions, ModelInfo, TokenUsage,
};

pub mod prompts;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// The model used for all governed calls.
/// This is intentionally hardcoded to prevent accidental drift.
pub const MODEL: &str = "claude-sonnet-4-5";
pub const CLIENT_ID: &str = "anthropic:claude-sonnet-4-5";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const CONTEXT_WINDOW: u32 = 200_000;
const MAX_OUTPUT_TOKENS: u32 = 64_000;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Unsupported attachment type: {0}")]
    UnsupportedContent(String),
}

/// A generative model provider.
///
/// Implementations report the provider's own token counts in `AiResponse` and
/// honour `GenerationOptions::timeout_ms`.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate_content(
        &self,
        prompt: &str,
        contents: &[ContentPart],
        options: &GenerationOptions,
    ) -> Result<AiResponse, LlmError>;

    async fn generate_chat_content(
        &self,
        history: &[ChatMessage],
        system_instruction: Option<&str>,
        options: &GenerationOptions,
    ) -> Result<AiResponse, LlmError>;

    fn calculate_tokens(&self, text: &str) -> u32;

    /// Stable identifier used as the rate-limit key.
    fn client_id(&self) -> &str;

    fn client_name(&self) -> &str;

    fn model_info(&self) -> ModelInfo;
}

// ────────────────────────────────────────────────────────────────────────────
// Anthropic Messages API wire types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<AnthropicMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "no_stop_sequences")]
    stop_sequences: &'a [String],
}

fn no_stop_sequences(stops: &&[String]) -> bool {
    stops.is_empty()
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: Vec<OutgoingBlock<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum OutgoingBlock<'a> {
    Text { text: &'a str },
    Image { source: Base64Source<'a> },
    Document { source: Base64Source<'a> },
}

#[derive(Debug, Serialize)]
struct Base64Source<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: &'a str,
    data: &'a str,
}

impl<'a> Base64Source<'a> {
    fn of(part: &'a ContentPart) -> Self {
        Self {
            kind: "base64",
            media_type: &part.mime_type,
            data: &part.data,
        }
    }
}

impl<'a> OutgoingBlock<'a> {
    fn from_part(part: &'a ContentPart) -> Result<Self, LlmError> {
        if part.is_text() {
            Ok(OutgoingBlock::Text { text: &part.data })
        } else if part.mime_type.starts_with("image/") {
            Ok(OutgoingBlock::Image {
                source: Base64Source::of(part),
            })
        } else if part.mime_type == "application/pdf" {
            Ok(OutgoingBlock::Document {
                source: Base64Source::of(part),
            })
        } else {
            Err(LlmError::UnsupportedContent(part.mime_type.clone()))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    pub content: Vec<ContentBlock>,
    pub usage: Usage,
    pub stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl LlmResponse {
    /// Concatenates every text block. Empty when the reply carried no text.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect()
    }

    /// Usage is kept even when there is no text; the response pipeline rejects
    /// empty content as a retryable failure.
    fn into_ai_response(self) -> AiResponse {
        AiResponse {
            content: self.text(),
            token_usage: TokenUsage::new(self.usage.input_tokens, self.usage.output_tokens),
            finish_reason: FinishReason::from_provider(self.stop_reason.as_deref()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorBody,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    message: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Client
// ────────────────────────────────────────────────────────────────────────────

/// Anthropic Messages API client.
#[derive(Clone)]
pub struct AnthropicClient {
    client: Client,
    api_key: String,
}

impl AnthropicClient {
    /// `timeout` applies to requests that do not set `GenerationOptions::timeout_ms`.
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, LlmError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            api_key,
        })
    }

    async fn send(&self, body: &AnthropicRequest<'_>, options: &GenerationOptions) -> Result<AiResponse, LlmError> {
        let mut request = self
            .client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body);
        if let Some(ms) = options.timeout_ms {
            request = request.timeout(Duration::from_millis(ms));
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let raw = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<AnthropicError>(&raw)
                .map(|e| e.error.message)
                .unwrap_or(raw);
            warn!("LLM API returned {}: {}", status, message);
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let raw = response.text().await?;
        let llm_response: LlmResponse = serde_json::from_str(&raw)?;

        debug!(
            "LLM call succeeded: input_tokens={}, output_tokens={}, stop_reason={:?}",
            llm_response.usage.input_tokens,
            llm_response.usage.output_tokens,
            llm_response.stop_reason
        );

        Ok(llm_response.into_ai_response())
    }
}

fn request_body<'a>(
    system: Option<&'a str>,
    messages: Vec<AnthropicMessage<'a>>,
    options: &'a GenerationOptions,
) -> AnthropicRequest<'a> {
    AnthropicRequest {
        model: MODEL,
        max_tokens: options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system,
        messages,
        temperature: options.temperature,
        top_p: options.top_p,
        stop_sequences: &options.stop_sequences,
    }
}

fn single_shot_message<'a>(
    prompt: &'a str,
    contents: &'a [ContentPart],
) -> Result<AnthropicMessage<'a>, LlmError> {
    let mut blocks = contents
        .iter()
        .map(OutgoingBlock::from_part)
        .collect::<Result<Vec<_>, _>>()?;
    blocks.push(OutgoingBlock::Text { text: prompt });
    Ok(AnthropicMessage {
        role: "user",
        content: blocks,
    })
}

fn chat_messages(history: &[ChatMessage]) -> Vec<AnthropicMessage<'_>> {
    history
        .iter()
        .map(|m| AnthropicMessage {
            role: m.role.as_str(),
            content: vec![OutgoingBlock::Text { text: &m.content }],
        })
        .collect()
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn generate_content(
        &self,
        prompt: &str,
        contents: &[ContentPart],
        options: &GenerationOptions,
    ) -> Result<AiResponse, LlmError> {
        let message = single_shot_message(prompt, contents)?;
        let body = request_body(None, vec![message], options);
        self.send(&body, options).await
    }

    async fn generate_chat_content(
        &self,
        history: &[ChatMessage],
        system_instruction: Option<&str>,
        options: &GenerationOptions,
    ) -> Result<AiResponse, LlmError> {
        let body = request_body(system_instruction, chat_messages(history), options);
        self.send(&body, options).await
    }

    fn calculate_tokens(&self, text: &str) -> u32 {
        estimate_text_tokens(text)
    }

    fn client_id(&self) -> &str {
        CLIENT_ID
    }

    fn client_name(&self) -> &str {
        "Anthropic Claude"
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "anthropic".to_string(),
            model: MODEL.to_string(),
            max_output_tokens: MAX_OUTPUT_TOKENS,
            context_window: CONTEXT_WINDOW,
        }
    }
}
