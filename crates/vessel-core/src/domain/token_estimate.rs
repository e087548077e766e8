//! Pure token-estimation arithmetic backing the orchestrator's compaction
//! trigger (§4.10).
//!
//! Kept decoupled from the chat-message schema (which lives in
//! `application::ports`, since it is part of the LLM collaborator
//! contract) so this stays a domain-layer pure function: the orchestrator
//! computes the per-message character counts and passes them in.

/// Default characters-per-token ratio used when the caller has not
/// overridden it.
pub const DEFAULT_TOKENS_PER_CHAR: f64 = 0.25;

/// `estimateTokens = floor((len(systemPrompt) + Σ message_lens) × tokensPerChar)`.
///
/// Each entry of `message_lens` should already equal
/// `len(content) + Σ (len(toolCallName) + len(toolCallArgs))` for one
/// message, per §4.10.
#[must_use]
pub fn estimate_tokens(system_prompt_len: usize, message_lens: &[usize], tokens_per_char: f64) -> u64 {
    let total_chars: usize = system_prompt_len + message_lens.iter().sum::<usize>();
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let estimate = (total_chars as f64 * tokens_per_char).floor() as u64;
    estimate
}
