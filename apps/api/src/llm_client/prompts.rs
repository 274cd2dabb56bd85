// Cross-cutting prompt fragments used by the prompt/response pipelines.
// Processors check for these verbatim before appending, so edits here must keep
// each fragment a stable, self-contained sentence.

/// Appended to JSON-format prompts.
pub const JSON_ONLY_INSTRUCTION: &str = "Return valid JSON only. \
    Do NOT wrap the JSON in markdown code fences. \
    Omit any field whose value would be null.";

/// Appended to HTML-format prompts.
pub const RAW_HTML_INSTRUCTION: &str = "Use raw HTML only. \
    Do NOT wrap the HTML in markdown code fences.";

/// Leads the machine-readable schema description appended on first-turn JSON requests.
pub const SCHEMA_DESCRIPTION_HEADER: &str =
    "The response must be a JSON value conforming to this JSON Schema:";

/// Minimal document shell wrapped around bare HTML fragments.
pub const HTML_DOCUMENT_SHELL: &str = "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n</head>\n<body>\n{body}\n</body>\n</html>";
