//! Token estimation heuristics
//!
//! Estimation only has to be stable and conservative enough to keep the
//! compressed history under the model's context budget; chars/4 matches the
//! estimate used for providers that do not report usage.

use crate::agents::state::Message;

/// Flat token charge for an attached image
pub const IMAGE_TOKEN_ESTIMATE: usize = 1500;

pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

pub fn estimate_message_tokens(message: &Message) -> usize {
    estimate_tokens(&message.content) + message.images.len() * IMAGE_TOKEN_ESTIMATE
}
