//! Prompt Pipeline: ordered, first-match-wins transformers that shape the
//! outgoing prompt for the requested `ResponseFormat`.
//!
//! New formats are supported by registering a processor; the orchestrator
//! never changes.

use crate::ai::error::AiError;
use crate::ai::schema::{append_schema_description, StructuralSchema};
use crate::ai::types::{AiRequest, ResponseFormat};
use crate::llm_client::prompts::{JSON_ONLY_INSTRUCTION, RAW_HTML_INSTRUCTION};

pub trait PromptProcessor: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_process(&self, request: &AiRequest) -> bool;
    fn process(&self, request: &AiRequest) -> Result<String, AiError>;
}

pub struct PromptPipeline {
    processors: Vec<Box<dyn PromptProcessor>>,
}

impl PromptPipeline {
    /// An empty pipeline: every prompt passes through unchanged.
    pub fn empty() -> Self {
        Self { processors: vec![] }
    }

    pub fn register(mut self, processor: Box<dyn PromptProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// Builds the outgoing prompt with the first matching processor, or identity.
    pub fn build(&self, request: &AiRequest) -> Result<String, AiError> {
        if request.prompt.trim().is_empty() && !request.is_chat() {
            return Err(AiError::PromptProcessing("prompt is empty".to_string()));
        }
        match self.processors.iter().find(|p| p.can_process(request)) {
            Some(processor) => {
                tracing::debug!("Building prompt with '{}' processor", processor.name());
                processor.process(request)
            }
            None => Ok(request.prompt.clone()),
        }
    }
}

impl Default for PromptPipeline {
    fn default() -> Self {
        Self::empty()
            .register(Box::new(JsonPromptProcessor))
            .register(Box::new(HtmlPromptProcessor))
            .register(Box::new(TextPromptProcessor))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Processors
// ────────────────────────────────────────────────────────────────────────────

pub struct JsonPromptProcessor;

impl PromptProcessor for JsonPromptProcessor {
    fn name(&self) -> &'static str {
        "json"
    }

    fn can_process(&self, request: &AiRequest) -> bool {
        request.response_format == ResponseFormat::Json
    }

    fn process(&self, request: &AiRequest) -> Result<String, AiError> {
        let mut prompt = request.prompt.clone();

        if !request.is_chat() {
            if let Some(schema) = &request.schema {
                prompt = append_schema_description(&prompt, &StructuralSchema::new(schema.clone()));
            }
        }
        if !mentions(&prompt, JSON_ONLY_INSTRUCTION, "valid json only") {
            prompt = format!("{}\n\n{JSON_ONLY_INSTRUCTION}", prompt.trim_end());
        }

        Ok(with_system_context(request, prompt))
    }
}

pub struct HtmlPromptProcessor;

impl PromptProcessor for HtmlPromptProcessor {
    fn name(&self) -> &'static str {
        "html"
    }

    fn can_process(&self, request: &AiRequest) -> bool {
        request.response_format == ResponseFormat::Html
    }

    fn process(&self, request: &AiRequest) -> Result<String, AiError> {
        let mut prompt = request.prompt.clone();
        if !mentions(&prompt, RAW_HTML_INSTRUCTION, "raw html") {
            prompt = format!("{}\n\n{RAW_HTML_INSTRUCTION}", prompt.trim_end());
        }
        Ok(with_system_context(request, prompt))
    }
}

pub struct TextPromptProcessor;

impl PromptProcessor for TextPromptProcessor {
    fn name(&self) -> &'static str {
        "text"
    }

    fn can_process(&self, request: &AiRequest) -> bool {
        request.response_format == ResponseFormat::Text
    }

    fn process(&self, request: &AiRequest) -> Result<String, AiError> {
        Ok(with_system_context(request, request.prompt.clone()))
    }
}

/// Single-shot prompts carry the system instruction inline; chat requests pass
/// it to the chat call instead.
fn with_system_context(request: &AiRequest, prompt: String) -> String {
    match &request.system_instruction {
        Some(system) if !request.is_chat() && !system.trim().is_empty() => {
            format!("{}\n\n{prompt}", system.trim())
        }
        _ => prompt,
    }
}

fn mentions(prompt: &str, instruction: &str, phrase: &str) -> bool {
    prompt.contains(instruction) || prompt.to_lowercase().contains(phrase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::types::ChatMessage;
    use crate::llm_client::prompts::SCHEMA_DESCRIPTION_HEADER;
    use serde_json::json;

    struct ShoutingProcessor;

    impl PromptProcessor for ShoutingProcessor {
        fn name(&self) -> &'static str {
            "shout"
        }
        fn can_process(&self, _request: &AiRequest) -> bool {
            true
        }
        fn process(&self, request: &AiRequest) -> Result<String, AiError> {
            Ok(request.prompt.to_uppercase())
        }
    }

    #[test]
    fn test_json_prompt_appends_instruction_and_schema() {
        let request = AiRequest::new("Extract skills", ResponseFormat::Json)
            .with_schema(json!({"type": "object", "required": ["skills"]}));
        let prompt = PromptPipeline::default().build(&request).unwrap();
        assert!(prompt.starts_with("Extract skills"));
        assert!(prompt.contains(SCHEMA_DESCRIPTION_HEADER));
        assert!(prompt.ends_with(JSON_ONLY_INSTRUCTION));
    }

    #[test]
    fn test_json_prompt_skips_schema_on_follow_up_turn() {
        let request = AiRequest::new("And now the tools?", ResponseFormat::Json)
            .with_schema(json!({"type": "object"}))
            .with_chat_history(vec![ChatMessage::user("hi"), ChatMessage::assistant("{}")]);
        let prompt = PromptPipeline::default().build(&request).unwrap();
        assert!(!prompt.contains(SCHEMA_DESCRIPTION_HEADER));
        assert!(prompt.contains(JSON_ONLY_INSTRUCTION));
    }

    #[test]
    fn test_json_instruction_not_duplicated() {
        let request = AiRequest::new(
            "List skills. Return valid JSON only, thanks.",
            ResponseFormat::Json,
        );
        let prompt = PromptPipeline::default().build(&request).unwrap();
        assert!(!prompt.contains(JSON_ONLY_INSTRUCTION));
    }

    #[test]
    fn test_html_prompt_appends_raw_html_once() {
        let request = AiRequest::new("Render the header", ResponseFormat::Html);
        let pipeline = PromptPipeline::default();
        let prompt = pipeline.build(&request).unwrap();
        assert!(prompt.ends_with(RAW_HTML_INSTRUCTION));

        let again = pipeline
            .build(&AiRequest::new(prompt.clone(), ResponseFormat::Html))
            .unwrap();
        assert_eq!(again, prompt);
    }

    #[test]
    fn test_text_prompt_only_prefixes_system_context() {
        let request = AiRequest::new("Write a summary", ResponseFormat::Text)
            .with_system_instruction("You are a resume coach.");
        let prompt = PromptPipeline::default().build(&request).unwrap();
        assert_eq!(prompt, "You are a resume coach.\n\nWrite a summary");
    }

    #[test]
    fn test_chat_requests_do_not_inline_system_context() {
        let request = AiRequest::new("next", ResponseFormat::Text)
            .with_system_instruction("You are a resume coach.")
            .with_chat_history(vec![ChatMessage::user("hi")]);
        let prompt = PromptPipeline::default().build(&request).unwrap();
        assert_eq!(prompt, "next");
    }

    #[test]
    fn test_empty_pipeline_is_identity() {
        let request = AiRequest::new("as-is", ResponseFormat::Json);
        assert_eq!(PromptPipeline::empty().build(&request).unwrap(), "as-is");
    }

    #[test]
    fn test_first_registered_match_wins() {
        let pipeline = PromptPipeline::empty()
            .register(Box::new(ShoutingProcessor))
            .register(Box::new(TextPromptProcessor));
        let request = AiRequest::new("quiet", ResponseFormat::Text);
        assert_eq!(pipeline.build(&request).unwrap(), "QUIET");
    }

    #[test]
    fn test_empty_prompt_is_processing_error() {
        let request = AiRequest::new("   ", ResponseFormat::Text);
        let err = PromptPipeline::default().build(&request).unwrap_err();
        assert!(matches!(err, AiError::PromptProcessing(_)));
    }
}
