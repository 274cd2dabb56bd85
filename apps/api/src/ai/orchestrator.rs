//! Request Orchestrator: the single entry point for governed AI calls.
//!
//! Flow per request:
//!   1. Derive a validator from `schema` (and describe it in the prompt)
//!   2. Admission: quota check, then rate check (never retried)
//!   3. Attempt loop: prompt pipeline → model client → response pipeline → validator
//!   4. Record: charge the tokens spent across all attempts once and count the
//!      request against the rate limits, whether it was accepted or failed after
//!      the provider answered
//!
//! Provider and pipeline errors are retried with exponential backoff. Validation
//! failures are retried immediately. Nothing here holds a lock; concurrent
//! requests only meet in the store.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ai::error::AiError;
use crate::ai::prompt_pipeline::PromptPipeline;
use crate::ai::rate_limit::{RateLimiter, RateWindow};
use crate::ai::response_pipeline::ResponsePipeline;
use crate::ai::schema::{append_schema_description, SchemaValidator, StructuralSchema, ValidationOutcome};
use crate::ai::tokens::{HeuristicEstimator, TokenEstimator};
use crate::ai::types::{AiRequest, AiResult, ChatMessage, FinishReason, ParsedOutput, TokenUsage};
use crate::ai::usage::UsageQuotaTracker;
use crate::llm_client::ModelClient;

/// What to do when every attempt produced schema-invalid output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ValidationPolicy {
    /// Return the last output flagged `valid = false`.
    #[default]
    FailOpen,
    /// Count a failed request and return `AiError::ValidationFailed`.
    FailClosed,
}

impl FromStr for ValidationPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fail_open" | "open" => Ok(Self::FailOpen),
            "fail_closed" | "closed" => Ok(Self::FailClosed),
            other => anyhow::bail!("unknown validation policy '{other}' (expected fail_open or fail_closed)"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    /// Attempts per request = `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry after an error; doubles for each further error.
    /// Zero disables backoff.
    pub retry_backoff: Duration,
    pub validation_policy: ValidationPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
            validation_policy: ValidationPolicy::FailOpen,
        }
    }
}

/// One provider round trip. `parsed` may still fail while tokens were spent.
struct AttemptOutput {
    token_usage: TokenUsage,
    finish_reason: FinishReason,
    parsed: Result<ParsedOutput, AiError>,
}

/// Best invalid output seen so far, kept for fail-open acceptance.
struct InvalidOutput {
    output: ParsedOutput,
    finish_reason: FinishReason,
    errors: Vec<String>,
}

enum LastFailure {
    Invalid(Vec<String>),
    Error(AiError),
}

pub struct RequestOrchestrator {
    client: Arc<dyn ModelClient>,
    prompts: PromptPipeline,
    responses: ResponsePipeline,
    usage: Arc<UsageQuotaTracker>,
    rate_limiter: Arc<RateLimiter>,
    estimator: Arc<dyn TokenEstimator>,
    settings: OrchestratorSettings,
}

impl RequestOrchestrator {
    pub fn new(
        client: Arc<dyn ModelClient>,
        usage: Arc<UsageQuotaTracker>,
        rate_limiter: Arc<RateLimiter>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            client,
            prompts: PromptPipeline::default(),
            responses: ResponsePipeline::default(),
            usage,
            rate_limiter,
            estimator: Arc::new(HeuristicEstimator),
            settings,
        }
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_prompt_pipeline(mut self, prompts: PromptPipeline) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_response_pipeline(mut self, responses: ResponsePipeline) -> Self {
        self.responses = responses;
        self
    }

    pub fn client_id(&self) -> &str {
        self.client.client_id()
    }

    /// Runs one governed request end to end.
    pub async fn execute_request(&self, mut request: AiRequest) -> Result<AiResult, AiError> {
        let request_id = request
            .context
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let user_id = request.context.user_id;
        let validator = prepare_validator(&mut request);

        if let Some(user_id) = user_id {
            self.admit(user_id, &request, &request_id).await?;
        }

        let started = Instant::now();
        let max_attempts = self.settings.max_retries + 1;
        let mut spent = TokenUsage::default();
        let mut best_invalid: Option<InvalidOutput> = None;
        let mut last_failure: Option<LastFailure> = None;
        let mut consecutive_errors = 0u32;

        for attempt in 1..=max_attempts {
            if consecutive_errors > 0 {
                self.backoff(consecutive_errors).await;
            }
            debug!("[{request_id}] attempt {attempt}/{max_attempts} ({:?})", request.response_format);

            let output = match self.attempt(&request).await {
                Ok(output) => output,
                Err(e) => {
                    warn!("[{request_id}] attempt {attempt}/{max_attempts} failed before a response: {e}");
                    if !e.is_retryable() {
                        self.fail(user_id, spent, &request_id).await;
                        return Err(e);
                    }
                    consecutive_errors += 1;
                    last_failure = Some(LastFailure::Error(e));
                    continue;
                }
            };
            spent += output.token_usage;

            let parsed = match output.parsed {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("[{request_id}] attempt {attempt}/{max_attempts} response unusable: {e}");
                    consecutive_errors += 1;
                    last_failure = Some(LastFailure::Error(e));
                    continue;
                }
            };
            consecutive_errors = 0;

            let outcome = validator
                .as_ref()
                .map(|v| v.validate(&parsed.to_value()))
                .unwrap_or_else(ValidationOutcome::ok);

            if outcome.valid {
                let result = AiResult {
                    request_id,
                    output: parsed,
                    token_usage: spent,
                    finish_reason: output.finish_reason,
                    attempts: attempt,
                    valid: true,
                    validation_errors: vec![],
                };
                self.accept(user_id, started, &result).await;
                return Ok(result);
            }

            warn!(
                "[{request_id}] attempt {attempt}/{max_attempts} failed validation: {}",
                outcome.errors.join("; ")
            );
            last_failure = Some(LastFailure::Invalid(outcome.errors.clone()));
            best_invalid = Some(InvalidOutput {
                output: parsed,
                finish_reason: output.finish_reason,
                errors: outcome.errors,
            });
        }

        if let (ValidationPolicy::FailOpen, Some(invalid)) =
            (self.settings.validation_policy, best_invalid)
        {
            warn!(
                "[{request_id}] returning output that failed validation after {max_attempts} attempts"
            );
            let result = AiResult {
                request_id,
                output: invalid.output,
                token_usage: spent,
                finish_reason: invalid.finish_reason,
                attempts: max_attempts,
                valid: false,
                validation_errors: invalid.errors,
            };
            self.accept(user_id, started, &result).await;
            return Ok(result);
        }

        self.fail(user_id, spent, &request_id).await;

        let err = match last_failure {
            Some(LastFailure::Invalid(errors)) => AiError::ValidationFailed {
                attempts: max_attempts,
                errors,
            },
            Some(LastFailure::Error(source)) => AiError::ServiceFailure {
                attempts: max_attempts,
                source: Box::new(source),
            },
            None => AiError::PromptProcessing("no attempt was made".to_string()),
        };
        error!("[{request_id}] request failed: {err}");
        Err(err)
    }

    async fn admit(&self, user_id: Uuid, request: &AiRequest, request_id: &str) -> Result<(), AiError> {
        let estimate = self.estimator.estimate_request(request);
        let quota = self
            .usage
            .check_intent(user_id, u64::from(estimate.total_tokens))
            .await;
        if !quota.allowed {
            info!(
                "[{request_id}] denied: daily token limit for user {user_id} ({} tier)",
                quota.tier
            );
            return Err(AiError::TokenLimitExceeded {
                user_id,
                used: quota.current_usage,
                limit: quota.limit.unwrap_or_default(),
                tier: quota.tier,
            });
        }

        let rate = self
            .rate_limiter
            .check_rate_limit(user_id, self.client.client_id())
            .await;
        if !rate.allowed {
            info!("[{request_id}] denied: rate limit for user {user_id}");
            return Err(AiError::RateLimitExceeded {
                window: rate.window.unwrap_or(RateWindow::Minute),
                reason: rate.reason.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Builds the prompt and calls the provider. `Err` means no tokens were spent.
    async fn attempt(&self, request: &AiRequest) -> Result<AttemptOutput, AiError> {
        let prompt = self.prompts.build(request)?;

        let response = if request.is_chat() {
            let mut history = request.chat_history.clone();
            history.push(ChatMessage::user(prompt));
            self.client
                .generate_chat_content(&history, request.system_instruction.as_deref(), &request.options)
                .await?
        } else {
            self.client
                .generate_content(&prompt, &request.contents, &request.options)
                .await?
        };

        Ok(AttemptOutput {
            token_usage: response.token_usage,
            finish_reason: response.finish_reason,
            parsed: self.responses.parse(&response.content, request),
        })
    }

    async fn backoff(&self, consecutive_errors: u32) {
        if self.settings.retry_backoff.is_zero() {
            return;
        }
        let factor = 1u32 << consecutive_errors.saturating_sub(1).min(16);
        let delay = self.settings.retry_backoff.saturating_mul(factor);
        debug!("Retrying after {}ms", delay.as_millis());
        tokio::time::sleep(delay).await;
    }

    /// Usage and rate recording for an accepted request. Recording failures never
    /// fail a request that already succeeded.
    async fn accept(&self, user_id: Option<Uuid>, started: Instant, result: &AiResult) {
        info!(
            "[{}] accepted after {} attempt(s), valid={}, tokens={}",
            result.request_id, result.attempts, result.valid, result.token_usage.total_tokens
        );
        let Some(user_id) = user_id else {
            return;
        };
        let client_id = self.client.client_id();
        if let Err(e) = self
            .usage
            .record_usage(
                user_id,
                Some(client_id),
                u64::from(result.token_usage.prompt_tokens),
                u64::from(result.token_usage.completion_tokens),
                started.elapsed().as_millis() as u64,
            )
            .await
        {
            warn!("[{}] failed to record usage: {e:#}", result.request_id);
        }
        self.rate_limiter.record_request(user_id, client_id).await;
    }

    /// Counts a failed request and charges the tokens its attempts spent. Once the
    /// provider has answered at least once the request also counts against the
    /// rate limits.
    async fn fail(&self, user_id: Option<Uuid>, spent: TokenUsage, request_id: &str) {
        let Some(user_id) = user_id else {
            return;
        };
        let client_id = self.client.client_id();
        if let Err(e) = self
            .usage
            .record_failed_attempt(
                user_id,
                Some(client_id),
                u64::from(spent.prompt_tokens),
                u64::from(spent.completion_tokens),
            )
            .await
        {
            warn!("[{request_id}] failed to record failed attempt: {e:#}");
        }
        if spent.total_tokens > 0 {
            self.rate_limiter.record_request(user_id, client_id).await;
        }
    }
}

/// Uses the explicit validator when attached. Otherwise derives one from
/// `schema` and describes it in single-shot prompts.
fn prepare_validator(request: &mut AiRequest) -> Option<Arc<dyn SchemaValidator>> {
    if let Some(validator) = &request.validator {
        return Some(validator.clone());
    }
    let schema = StructuralSchema::new(request.schema.clone()?);
    if !request.is_chat() && !request.prompt.trim().is_empty() {
        request.prompt = append_schema_description(&request.prompt, &schema);
    }
    Some(Arc::new(schema))
}
