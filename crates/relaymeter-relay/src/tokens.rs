//! Local token counting for reservation estimates

use std::sync::LazyLock;

use tiktoken_rs::{CoreBPE, o200k_base};

use crate::types::{ChatRequest, RelayMode};

/// Per-message framing overhead
const TOKENS_PER_MESSAGE: u32 = 3;
/// Tokens priming the assistant reply
const REPLY_PRIMING: u32 = 3;

static ENCODER: LazyLock<Option<CoreBPE>> = LazyLock::new(|| {
    o200k_base()
        .inspect_err(|e| tracing::warn!(error = %e, "failed to load tokenizer, estimating by length"))
        .ok()
});

/// Token count of `text`, or a length-based guess without a tokenizer
pub fn count_text_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let count = ENCODER
        .as_ref()
        .map_or_else(|| text.len().div_ceil(4), |bpe| bpe.encode_with_special_tokens(text).len());
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Prompt tokens of a request, including message framing
pub fn count_prompt_tokens(request: &ChatRequest, mode: RelayMode) -> u32 {
    match mode {
        RelayMode::Completions => count_text_tokens(&request.prompt_text()),
        RelayMode::ChatCompletions => request
            .messages
            .iter()
            .fold(REPLY_PRIMING, |total, message| {
                let name = message
                    .name
                    .as_deref()
                    .map_or(0, |name| count_text_tokens(name).saturating_add(1));
                total
                    .saturating_add(TOKENS_PER_MESSAGE)
                    .saturating_add(count_text_tokens(&message.role))
                    .saturating_add(count_text_tokens(&message.text()))
                    .saturating_add(name)
            }),
    }
}
