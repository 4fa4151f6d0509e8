//! LLM providers backed by rig-core clients

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::anthropic::{self, ClientBuilder as AnthropicClientBuilder};
use rig::providers::openai;

use crate::config::LlmSettings;
use crate::{Error, Result};

use super::provider::{
    CompletionRequest, CompletionResponse, LlmProvider, TokenUsage, WireRole,
};
use super::quirks::normalize_model_name;

fn flatten_messages(request: &CompletionRequest) -> String {
    request
        .messages
        .iter()
        .map(|m| {
            let role = match m.role {
                WireRole::System => "system",
                WireRole::User => "user",
                WireRole::Assistant => "assistant",
            };
            format!("{role}: {}", m.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn estimate_usage(prompt: &str, response: &str) -> TokenUsage {
    // Rough chars/4 estimate; exact counts come from providers that report them
    TokenUsage {
        input_tokens: prompt.len() as u64 / 4,
        output_tokens: response.len() as u64 / 4,
        cache_read_tokens: 0,
        cache_creation_tokens: 0,
    }
}

/// Anthropic provider using rig-core
pub struct AnthropicProvider {
    client: anthropic::Client,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        let client = AnthropicClientBuilder::new(&api_key).build();

        Ok(Self {
            client,
            model: model.into(),
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let prompt = flatten_messages(&request);

        let agent = self
            .client
            .agent(&self.model)
            .preamble(request.system.as_deref().unwrap_or_default())
            .max_tokens(u64::from(request.max_tokens))
            .build();

        let content = agent
            .prompt(&prompt)
            .await
            .map_err(|e| Error::LlmFatal(format!("Anthropic completion failed: {e}")))?;

        let usage = estimate_usage(&prompt, &content);
        Ok(CompletionResponse { content, usage })
    }
}

/// OpenAI-compatible provider using rig-core.
///
/// Also serves any OpenAI-wire-compatible endpoint (LiteLLM proxies, local
/// gateways) via `LLM_API_BASE`.
pub struct OpenAiCompatProvider {
    client: openai::Client,
    model: String,
}

impl OpenAiCompatProvider {
    pub fn new(
        api_key: impl Into<String>,
        base_url: Option<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let api_key = api_key.into();
        let client = match base_url {
            Some(base_url) => openai::Client::from_url(&api_key, &base_url),
            None => openai::Client::new(&api_key),
        };

        Ok(Self {
            client,
            model: model.into(),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let prompt = flatten_messages(&request);

        let agent = self
            .client
            .agent(&self.model)
            .preamble(request.system.as_deref().unwrap_or_default())
            .max_tokens(u64::from(request.max_tokens))
            .build();

        let content = agent
            .prompt(&prompt)
            .await
            .map_err(|e| Error::LlmFatal(format!("OpenAI completion failed: {e}")))?;

        let usage = estimate_usage(&prompt, &content);
        Ok(CompletionResponse { content, usage })
    }
}

/// Create a provider from the `STRIX_LLM` model identifier.
///
/// `anthropic/<model>` selects the Anthropic client; everything else goes
/// through the OpenAI-compatible client, which covers OpenAI itself and any
/// proxy reachable via `LLM_API_BASE`.
pub fn create_provider(settings: &LlmSettings) -> Result<std::sync::Arc<dyn LlmProvider>> {
    let bare_model = normalize_model_name(&settings.model);
    let provider_prefix = settings
        .model
        .split_once('/')
        .map(|(prefix, _)| prefix.to_lowercase());

    match provider_prefix.as_deref() {
        Some("anthropic") => Ok(std::sync::Arc::new(AnthropicProvider::new(
            settings.api_key.clone(),
            bare_model,
        )?)),
        _ => Ok(std::sync::Arc::new(OpenAiCompatProvider::new(
            settings.api_key.clone(),
            settings.api_base.clone(),
            bare_model,
        )?)),
    }
}
