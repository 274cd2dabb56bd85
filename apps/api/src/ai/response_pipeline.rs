//! Response Pipeline: turns raw provider text into a `ParsedOutput`.
//!
//! Same dispatch as the prompt pipeline: first processor whose predicate
//! matches wins. With no match, a format-based default parser runs.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::ai::error::AiError;
use crate::ai::types::{AiRequest, ParsedOutput, ResponseFormat};
use crate::llm_client::prompts::HTML_DOCUMENT_SHELL;

pub trait ResponseProcessor: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_process(&self, request: &AiRequest) -> bool;
    fn process(&self, raw: &str, request: &AiRequest) -> Result<ParsedOutput, AiError>;
}

pub struct ResponsePipeline {
    processors: Vec<Box<dyn ResponseProcessor>>,
}

impl ResponsePipeline {
    /// No processors registered: every response goes through the format default.
    pub fn empty() -> Self {
        Self { processors: vec![] }
    }

    pub fn register(mut self, processor: Box<dyn ResponseProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn parse(&self, raw: &str, request: &AiRequest) -> Result<ParsedOutput, AiError> {
        if raw.trim().is_empty() {
            return Err(AiError::ResponseProcessing {
                message: "model returned empty content".to_string(),
            });
        }
        match self.processors.iter().find(|p| p.can_process(request)) {
            Some(processor) => {
                tracing::debug!("Parsing response with '{}' processor", processor.name());
                processor.process(raw, request)
            }
            None => match request.response_format {
                ResponseFormat::Json => parse_json(raw).map(ParsedOutput::Json),
                ResponseFormat::Html => Ok(ParsedOutput::Html(strip_code_fences(raw).to_string())),
                ResponseFormat::Text => Ok(ParsedOutput::Text(raw.trim().to_string())),
            },
        }
    }
}

impl Default for ResponsePipeline {
    fn default() -> Self {
        Self::empty()
            .register(Box::new(JsonResponseProcessor))
            .register(Box::new(HtmlResponseProcessor))
            .register(Box::new(TextResponseProcessor))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Processors
// ────────────────────────────────────────────────────────────────────────────

pub struct JsonResponseProcessor;

impl ResponseProcessor for JsonResponseProcessor {
    fn name(&self) -> &'static str {
        "json"
    }

    fn can_process(&self, request: &AiRequest) -> bool {
        request.response_format == ResponseFormat::Json
    }

    fn process(&self, raw: &str, _request: &AiRequest) -> Result<ParsedOutput, AiError> {
        parse_json(raw).map(|v| ParsedOutput::Json(remove_nulls(v)))
    }
}

pub struct HtmlResponseProcessor;

impl ResponseProcessor for HtmlResponseProcessor {
    fn name(&self) -> &'static str {
        "html"
    }

    fn can_process(&self, request: &AiRequest) -> bool {
        request.response_format == ResponseFormat::Html
    }

    fn process(&self, raw: &str, request: &AiRequest) -> Result<ParsedOutput, AiError> {
        let html = strip_code_fences(raw);
        if is_bare_fragment(html) && !fragment_requested(&request.prompt) {
            return Ok(ParsedOutput::Html(HTML_DOCUMENT_SHELL.replace("{body}", html)));
        }
        Ok(ParsedOutput::Html(html.to_string()))
    }
}

pub struct TextResponseProcessor;

impl ResponseProcessor for TextResponseProcessor {
    fn name(&self) -> &'static str {
        "text"
    }

    fn can_process(&self, request: &AiRequest) -> bool {
        request.response_format == ResponseFormat::Text
    }

    fn process(&self, raw: &str, _request: &AiRequest) -> Result<ParsedOutput, AiError> {
        Ok(ParsedOutput::Text(raw.trim().to_string()))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Helpers
// ────────────────────────────────────────────────────────────────────────────

fn fenced_block() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("fence pattern is valid")
    })
}

/// Strips ```lang ... ``` fences. Handles output that is entirely fenced and
/// output where a fenced block is surrounded by prose.
pub fn strip_code_fences(text: &str) -> &str {
    let text = text.trim();
    if !text.contains("```") {
        return text;
    }
    if let Some(captures) = fenced_block().captures(text) {
        if let Some(inner) = captures.get(1) {
            return inner.as_str().trim();
        }
    }
    // Unterminated fence: drop the opening line only.
    match text.strip_prefix("```") {
        Some(rest) => rest.split_once('\n').map(|(_, body)| body).unwrap_or("").trim(),
        None => text,
    }
}

/// Bare JSON is parsed as is, so fences quoted inside string values survive.
/// Fences are only stripped when the direct parse fails.
fn parse_json(raw: &str) -> Result<Value, AiError> {
    let trimmed = raw.trim();
    let first_err = match serde_json::from_str::<Value>(trimmed) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };
    let stripped = strip_code_fences(trimmed);
    if stripped != trimmed {
        if let Ok(v) = serde_json::from_str::<Value>(stripped) {
            return Ok(v);
        }
    }
    [stripped, trimmed]
        .into_iter()
        .filter_map(extract_json_span)
        .find_map(|span| serde_json::from_str::<Value>(span).ok())
        .ok_or_else(|| AiError::ResponseProcessing {
            message: format!("invalid JSON in model output: {first_err}"),
        })
}

/// Outermost `{...}` or `[...]` span, for payloads wrapped in prose.
fn extract_json_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// Recursively drops object properties whose value is `null`.
/// Nulls inside arrays are kept; only properties are removed.
pub fn remove_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, remove_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(remove_nulls).collect()),
        other => other,
    }
}

fn is_bare_fragment(html: &str) -> bool {
    let lower = html.to_lowercase();
    html.starts_with('<') && !lower.starts_with("<!doctype") && !lower.contains("<html")
}

fn fragment_requested(prompt: &str) -> bool {
    prompt.to_lowercase().contains("fragment")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn json_request() -> AiRequest {
        AiRequest::new("Extract", ResponseFormat::Json)
    }

    #[test]
    fn test_fenced_json_is_stripped_and_nulls_removed() {
        let raw = "```json\n{\"a\":1,\"b\":null}\n```";
        let out = ResponsePipeline::default().parse(raw, &json_request()).unwrap();
        assert_eq!(out, ParsedOutput::Json(json!({"a": 1})));
    }

    #[test]
    fn test_nested_nulls_removed_but_array_nulls_kept() {
        let raw = r#"{"a":{"b":null,"c":[null,{"d":null,"e":2}]}}"#;
        let out = ResponsePipeline::default().parse(raw, &json_request()).unwrap();
        assert_eq!(out, ParsedOutput::Json(json!({"a": {"c": [null, {"e": 2}]}})));
    }

    #[test]
    fn test_json_surrounded_by_prose_is_recovered() {
        let raw = "Sure! Here is the data: {\"skills\": [\"rust\"]} Hope that helps.";
        let out = ResponsePipeline::default().parse(raw, &json_request()).unwrap();
        assert_eq!(out, ParsedOutput::Json(json!({"skills": ["rust"]})));
    }

    #[test]
    fn test_fence_after_prose_is_extracted() {
        let raw = "Here you go:\n```json\n[1, 2]\n```\n";
        let out = ResponsePipeline::default().parse(raw, &json_request()).unwrap();
        assert_eq!(out, ParsedOutput::Json(json!([1, 2])));
    }

    #[test]
    fn test_fences_inside_json_strings_are_kept() {
        let raw = r#"{"snippet": "use ```rust``` blocks", "n": 1}"#;
        let out = ResponsePipeline::default().parse(raw, &json_request()).unwrap();
        assert_eq!(out, ParsedOutput::Json(json!({"snippet": "use ```rust``` blocks", "n": 1})));

        let fenced = "```json\n{\"snippet\": \"use ```rust``` blocks\"}\n```";
        let out = ResponsePipeline::default().parse(fenced, &json_request()).unwrap();
        assert_eq!(out, ParsedOutput::Json(json!({"snippet": "use ```rust``` blocks"})));
    }

    #[test]
    fn test_invalid_json_is_retryable_processing_error() {
        let err = ResponsePipeline::default()
            .parse("not json at all", &json_request())
            .unwrap_err();
        assert!(matches!(err, AiError::ResponseProcessing { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_empty_output_is_processing_error() {
        let request = AiRequest::new("hi", ResponseFormat::Text);
        let err = ResponsePipeline::default().parse("  \n", &request).unwrap_err();
        assert!(matches!(err, AiError::ResponseProcessing { .. }));
    }

    #[test]
    fn test_html_fragment_is_wrapped_in_document() {
        let request = AiRequest::new("Render the header", ResponseFormat::Html);
        let out = ResponsePipeline::default()
            .parse("```html\n<h1>Jane Doe</h1>\n```", &request)
            .unwrap();
        let html = out.as_text().unwrap();
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<body>\n<h1>Jane Doe</h1>\n</body>"));
    }

    #[test]
    fn test_html_fragment_kept_when_prompt_asks_for_fragment() {
        let request = AiRequest::new("Return an HTML fragment for the header", ResponseFormat::Html);
        let out = ResponsePipeline::default()
            .parse("<h1>Jane Doe</h1>", &request)
            .unwrap();
        assert_eq!(out, ParsedOutput::Html("<h1>Jane Doe</h1>".to_string()));
    }

    #[test]
    fn test_full_html_document_untouched() {
        let request = AiRequest::new("Render", ResponseFormat::Html);
        let doc = "<!doctype html><html><body><p>x</p></body></html>";
        let out = ResponsePipeline::default().parse(doc, &request).unwrap();
        assert_eq!(out, ParsedOutput::Html(doc.to_string()));
    }

    #[test]
    fn test_text_is_trimmed() {
        let request = AiRequest::new("hi", ResponseFormat::Text);
        let out = ResponsePipeline::default().parse("  hello \n", &request).unwrap();
        assert_eq!(out, ParsedOutput::Text("hello".to_string()));
    }

    #[test]
    fn test_empty_pipeline_falls_back_to_format_default() {
        let out = ResponsePipeline::empty()
            .parse("```\n{\"a\":null}\n```", &json_request())
            .unwrap();
        // The default parser does not strip nulls; only the JSON processor does.
        assert_eq!(out, ParsedOutput::Json(json!({"a": null})));
    }

    #[test]
    fn test_strip_code_fences_variants() {
        assert_eq!(strip_code_fences("```json\n{\"k\": 1}\n```"), "{\"k\": 1}");
        assert_eq!(strip_code_fences("```\n{\"k\": 1}\n```"), "{\"k\": 1}");
        assert_eq!(strip_code_fences("{\"k\": 1}"), "{\"k\": 1}");
        assert_eq!(strip_code_fences("```json\n{\"k\": 1}"), "{\"k\": 1}");
    }
}
