//! Bounding the conversation sent to the model
//!
//! The compressor never mutates canonical agent state: it maps the stored
//! message sequence to a bounded view. The most recent messages stay
//! verbatim, older non-system messages fold into cached chunk summaries, and
//! only the newest images ride along.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;

use crate::agents::state::{Message, Role};
use crate::Result;

use super::estimate::estimate_message_tokens;

/// Placeholder substituted for images beyond the retention window
pub const OLD_IMAGE_PLACEHOLDER: &str = "[Screenshot removed - only the 3 most recent screenshots are retained]";

/// Summarisation backend; implemented by the LLM gateway.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String>;
}

#[async_trait]
impl Summarizer for crate::gateway::LlmGateway {
    async fn summarize(&self, text: &str) -> Result<String> {
        crate::gateway::LlmGateway::summarize(self, text).await
    }
}

/// Conversation-memory compressor
pub struct MemoryCompressor {
    /// Most recent messages kept verbatim
    keep_recent: usize,
    /// Token budget above which older history is folded
    token_limit: usize,
    /// Messages folded per summary
    chunk_size: usize,
    /// Newest images retained
    max_images: usize,
    /// Chunk fingerprint -> summary text. Makes recompression byte-identical
    /// and avoids re-paying for summaries of stable history.
    summary_cache: Mutex<HashMap<u64, String>>,
}

impl Default for MemoryCompressor {
    fn default() -> Self {
        Self::new(15, 90_000)
    }
}

impl MemoryCompressor {
    pub fn new(keep_recent: usize, token_limit: usize) -> Self {
        Self {
            keep_recent,
            token_limit,
            chunk_size: 10,
            max_images: 3,
            summary_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Produce the bounded view of a conversation.
    pub async fn compress(
        &self,
        messages: &[Message],
        summarizer: &dyn Summarizer,
    ) -> Vec<Message> {
        let mut view: Vec<Message> = messages.to_vec();
        self.cap_images(&mut view);

        let total: usize = view.iter().map(estimate_message_tokens).sum();
        if total <= self.token_limit || view.len() <= self.keep_recent {
            return view;
        }

        let split = view.len() - self.keep_recent;
        let (head, tail) = view.split_at(split);

        let mut compressed: Vec<Message> = Vec::with_capacity(head.len() / self.chunk_size + tail.len() + 1);
        let mut chunk: Vec<&Message> = Vec::with_capacity(self.chunk_size);

        for message in head {
            if message.role == Role::System {
                self.flush_chunk(&mut compressed, &mut chunk, summarizer).await;
                compressed.push(message.clone());
                continue;
            }
            chunk.push(message);
            if chunk.len() == self.chunk_size {
                self.flush_chunk(&mut compressed, &mut chunk, summarizer).await;
            }
        }
        // Short remainder stays verbatim rather than paying for a summary
        compressed.extend(chunk.drain(..).cloned());

        compressed.extend_from_slice(tail);
        compressed
    }

    async fn flush_chunk(
        &self,
        out: &mut Vec<Message>,
        chunk: &mut Vec<&Message>,
        summarizer: &dyn Summarizer,
    ) {
        if chunk.len() < self.chunk_size {
            out.extend(chunk.drain(..).cloned());
            return;
        }

        let fingerprint = chunk_fingerprint(chunk);
        let cached = {
            let cache = self.summary_cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.get(&fingerprint).cloned()
        };

        let summary_text = match cached {
            Some(text) => text,
            None => {
                let source = chunk
                    .iter()
                    .map(|m| format!("{}: {}", role_label(m.role), m.content))
                    .collect::<Vec<_>>()
                    .join("\n");

                let text = match summarizer.summarize(&source).await {
                    Ok(summary) => format!("[Conversation summary]\n{summary}"),
                    Err(error) => {
                        // Truncation fallback; never raise out of compression
                        warn!(%error, "Summarisation failed, truncating chunk");
                        format!(
                            "[Earlier conversation truncated: {} messages omitted]",
                            chunk.len()
                        )
                    }
                };

                let mut cache = self.summary_cache.lock().unwrap_or_else(|e| e.into_inner());
                cache.entry(fingerprint).or_insert(text).clone()
            }
        };

        // Timestamp borrowed from the chunk head keeps the view deterministic
        let mut summary = Message::user(summary_text);
        summary.timestamp = chunk[0].timestamp;
        out.push(summary);
        chunk.clear();
    }

    fn cap_images(&self, messages: &mut [Message]) {
        let mut seen = 0usize;
        for message in messages.iter_mut().rev() {
            if message.images.is_empty() {
                continue;
            }
            let mut kept = Vec::with_capacity(message.images.len());
            // Newest image within a message is the last one
            for image in message.images.iter().rev() {
                if seen < self.max_images {
                    kept.push(image.clone());
                    seen += 1;
                }
            }
            kept.reverse();
            if kept.len() < message.images.len() {
                message.content.push('\n');
                message.content.push_str(OLD_IMAGE_PLACEHOLDER);
            }
            message.images = kept;
        }
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::ToolResult => "tool-result",
    }
}

fn chunk_fingerprint(chunk: &[&Message]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for message in chunk {
        role_label(message.role).hash(&mut hasher);
        message.content.hash(&mut hasher);
        message.images.len().hash(&mut hasher);
    }
    hasher.finish()
}
