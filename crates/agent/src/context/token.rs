//! Token estimation utilities.
//!
//! Uses a character-based heuristic: 4 characters per token, floor-divided,
//! counting Unicode scalar values rather than bytes. Not a real tokenizer;
//! the estimate is deterministic and monotonic in content length.

use threadline_core::message::ContextMessage;

/// Structural tokens charged per message (role name, delimiters).
pub const MESSAGE_OVERHEAD: usize = 5;

/// Estimate the token count for a string: `floor(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// Estimate tokens for a single message including per-message overhead.
pub fn estimate_message_tokens(message: &ContextMessage) -> usize {
    MESSAGE_OVERHEAD + estimate_tokens(&message.content)
}

/// Estimate tokens for a slice of messages.
pub fn estimate_messages_tokens(messages: &[ContextMessage]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}
