//! Admission-time token estimation.
//!
//! The estimate only feeds the quota admission check; real usage always comes
//! from the provider's reported counts.

use crate::ai::types::AiRequest;

const CHARS_PER_TOKEN: u32 = 4;
/// Flat cost charged for every non-text attachment (images, PDFs, ...).
pub const NON_TEXT_ATTACHMENT_TOKENS: u32 = 500;
/// Assumed completion size, as a percentage of the estimated prompt.
const COMPLETION_PERCENT: u32 = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenEstimate {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Swappable estimator. A provider-accurate tokenizer only needs `estimate_text`.
pub trait TokenEstimator: Send + Sync {
    fn estimate_text(&self, text: &str) -> u32;

    fn estimate_request(&self, request: &AiRequest) -> TokenEstimate {
        let mut prompt_tokens = self.estimate_text(&request.prompt);

        if let Some(system) = &request.system_instruction {
            prompt_tokens = prompt_tokens.saturating_add(self.estimate_text(system));
        }
        for message in &request.chat_history {
            prompt_tokens = prompt_tokens.saturating_add(self.estimate_text(&message.content));
        }
        for part in &request.contents {
            let cost = if part.is_text() {
                self.estimate_text(&part.data)
            } else {
                NON_TEXT_ATTACHMENT_TOKENS
            };
            prompt_tokens = prompt_tokens.saturating_add(cost);
        }

        let completion_tokens = prompt_tokens.saturating_mul(COMPLETION_PERCENT) / 100;
        TokenEstimate {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// ~1 token per 4 characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn estimate_text(&self, text: &str) -> u32 {
        estimate_text_tokens(text)
    }
}

pub fn estimate_text_tokens(text: &str) -> u32 {
    let chars = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
    chars.div_ceil(CHARS_PER_TOKEN)
}
