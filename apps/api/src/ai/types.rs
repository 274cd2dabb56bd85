//! Request/response shapes shared by the pipelines, the orchestrator and the
//! model client boundary.

use std::ops::AddAssign;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::ai::schema::SchemaValidator;

// ────────────────────────────────────────────────────────────────────────────
// Request side
// ────────────────────────────────────────────────────────────────────────────

/// Desired shape of the model output. Drives processor selection in both pipelines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
    Html,
}

/// An attachment sent alongside a single-shot prompt.
///
/// `text/*` parts carry raw text in `data`; everything else carries base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    pub mime_type: String,
    pub data: String,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            mime_type: "text/plain".to_string(),
            data: text.into(),
        }
    }

    pub fn inline(mime_type: impl Into<String>, base64_data: impl Into<String>) -> Self {
        Self {
            mime_type: mime_type.into(),
            data: base64_data.into(),
        }
    }

    pub fn is_text(&self) -> bool {
        self.mime_type.starts_with("text/")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    #[serde(alias = "model")]
    Assistant,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Generation knobs forwarded untouched to the model client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
    /// Per-request provider timeout. The orchestrator never cancels on its own.
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub user_id: Option<Uuid>,
    pub request_id: Option<String>,
}

/// A single governed AI call, as accepted by `RequestOrchestrator::execute_request`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AiRequest {
    pub prompt: String,
    #[serde(default)]
    pub response_format: ResponseFormat,
    #[serde(default)]
    pub contents: Vec<ContentPart>,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
    pub system_instruction: Option<String>,
    /// Structural JSON schema. A validator is derived from it when none is attached.
    pub schema: Option<Value>,
    /// Explicit validator. Takes precedence over `schema` for validation.
    #[serde(skip)]
    pub validator: Option<Arc<dyn SchemaValidator>>,
    #[serde(default)]
    pub options: GenerationOptions,
    #[serde(default)]
    pub context: RequestContext,
}

impl AiRequest {
    pub fn new(prompt: impl Into<String>, response_format: ResponseFormat) -> Self {
        Self {
            prompt: prompt.into(),
            response_format,
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.context.user_id = Some(user_id);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.context.request_id = Some(request_id.into());
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_chat_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.chat_history = history;
        self
    }

    pub fn with_contents(mut self, contents: Vec<ContentPart>) -> Self {
        self.contents = contents;
        self
    }

    /// A request with prior turns goes through the chat variant of the model client.
    pub fn is_chat(&self) -> bool {
        !self.chat_history.is_empty()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Response side
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        *self = TokenUsage::new(
            self.prompt_tokens.saturating_add(other.prompt_tokens),
            self.completion_tokens.saturating_add(other.completion_tokens),
        );
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    StopSequence,
    ContentFilter,
    #[default]
    Unknown,
}

impl FinishReason {
    /// Maps a provider stop reason onto the shared vocabulary.
    pub fn from_provider(reason: Option<&str>) -> Self {
        match reason {
            Some("end_turn") | Some("stop") | Some("STOP") => FinishReason::Stop,
            Some("max_tokens") | Some("length") | Some("MAX_TOKENS") => FinishReason::MaxTokens,
            Some("stop_sequence") => FinishReason::StopSequence,
            Some("refusal") | Some("content_filter") | Some("SAFETY") => {
                FinishReason::ContentFilter
            }
            _ => FinishReason::Unknown,
        }
    }
}

/// Raw provider output, before the response pipeline runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResponse {
    pub content: String,
    pub token_usage: TokenUsage,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub provider: String,
    pub model: String,
    pub max_output_tokens: u32,
    pub context_window: u32,
}

/// Provider output after the response pipeline, shaped by `ResponseFormat`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "format", content = "value", rename_all = "lowercase")]
pub enum ParsedOutput {
    Text(String),
    Json(Value),
    Html(String),
}

impl ParsedOutput {
    /// The value handed to a schema validator. Text and HTML validate as JSON strings.
    pub fn to_value(&self) -> Value {
        match self {
            ParsedOutput::Json(v) => v.clone(),
            ParsedOutput::Text(s) | ParsedOutput::Html(s) => Value::String(s.clone()),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParsedOutput::Text(s) | ParsedOutput::Html(s) => Some(s),
            ParsedOutput::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ParsedOutput::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// What `execute_request` hands back to callers.
///
/// `valid == false` means validation retries were exhausted and the last
/// structurally invalid output is being returned anyway.
#[derive(Debug, Clone, Serialize)]
pub struct AiResult {
    pub request_id: String,
    pub output: ParsedOutput,
    pub token_usage: TokenUsage,
    pub finish_reason: FinishReason,
    pub attempts: u32,
    pub valid: bool,
    pub validation_errors: Vec<String>,
}
