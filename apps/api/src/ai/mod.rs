//! AI request governance: admission (quota, rate), prompt/response shaping,
//! validation-driven retries and usage accounting around a `ModelClient`.

pub mod error;
pub mod handlers;
pub mod orchestrator;
pub mod prompt_pipeline;
pub mod rate_limit;
pub mod response_pipeline;
pub mod schema;
pub mod store;
pub mod tokens;
pub mod types;
pub mod usage;
