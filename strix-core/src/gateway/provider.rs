//! Provider-facing request and response types
//!
//! The LLM HTTP client itself is an external collaborator; the gateway only
//! depends on the [`LlmProvider`] trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Role of a wire-level message sent to the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireRole {
    System,
    User,
    Assistant,
}

/// One message as shaped for the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: WireRole,
    pub text: String,
    /// Base64 data URLs attached to this message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    /// Prompt-cache breakpoint marker for providers that support caching
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cache_breakpoint: bool,
}

impl WireMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: WireRole::System,
            text: text.into(),
            images: Vec::new(),
            cache_breakpoint: false,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: WireRole::User,
            text: text.into(),
            images: Vec::new(),
            cache_breakpoint: false,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: WireRole::Assistant,
            text: text.into(),
            images: Vec::new(),
            cache_breakpoint: false,
        }
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }
}

/// Completion request after quirk shaping
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub messages: Vec<WireMessage>,
    pub max_tokens: u32,
    /// Stop sequences; empty for models that reject the parameter
    pub stop: Vec<String>,
    pub reasoning_effort: Option<&'static str>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<WireMessage>) -> Self {
        Self {
            system: None,
            messages,
            max_tokens: 8192,
            stop: Vec::new(),
            reasoning_effort: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

/// Token usage reported (or estimated) by the provider
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

/// Raw completion result from a provider
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub usage: TokenUsage,
}

/// LLM provider interface
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logging and pricing lookups
    fn name(&self) -> &str;

    /// Complete a request. Implementations surface transport and API errors
    /// as [`crate::Error::LlmFatal`]; retry classification happens in the
    /// gateway.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;
}
