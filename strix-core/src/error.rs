//! Error types for strix-core

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using strix Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for strix
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
    #[error("Configuration error: {0}")]
    #[diagnostic(code(strix::config))]
    Config(String),

    #[error("Docker error: {0}")]
    #[diagnostic(code(strix::docker))]
    Docker(#[from] bollard::errors::Error),

    #[error("Sandbox unavailable: {0}")]
    #[diagnostic(code(strix::sandbox_unavailable))]
    SandboxUnavailable(String),

    #[error("Sandbox tool call timed out after {0} seconds")]
    #[diagnostic(code(strix::sandbox_timeout))]
    SandboxTimeout(u64),

    #[error("LLM rate limited: {0}")]
    #[diagnostic(code(strix::llm_rate_limited))]
    LlmRateLimited(String),

    #[error("LLM request failed: {0}")]
    #[diagnostic(code(strix::llm_fatal))]
    LlmFatal(String),

    #[error("Tool execution error: {0}")]
    #[diagnostic(code(strix::tool))]
    Tool(String),

    #[error("Agent error: {0}")]
    #[diagnostic(code(strix::agent))]
    Agent(String),

    #[error("Agent made no progress for two consecutive iterations")]
    #[diagnostic(code(strix::agent_stuck))]
    AgentStuck,

    #[error("Agent exhausted its iteration limit of {0}")]
    #[diagnostic(code(strix::agent_exhausted))]
    AgentExhausted(u32),

    #[error("Scan cancelled")]
    #[diagnostic(code(strix::cancelled))]
    Cancelled,

    #[error("Finding report error: {0}")]
    #[diagnostic(code(strix::report))]
    Report(String),

    #[error("HTTP error: {0}")]
    #[diagnostic(code(strix::http))]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    #[diagnostic(code(strix::io))]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(strix::serde))]
    Serde(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    #[diagnostic(code(strix::toml))]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error should abort the whole scan rather than a single
    /// tool call or LLM request.
    pub fn is_scan_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::SandboxUnavailable(_) | Self::Cancelled
        )
    }
}
