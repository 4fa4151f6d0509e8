//! Conversation-memory compression

mod compressor;
mod estimate;

pub use compressor::{MemoryCompressor, Summarizer};
pub use estimate::{estimate_message_tokens, estimate_tokens};
