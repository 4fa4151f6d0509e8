//! Scan and environment configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default sandbox image when STRIX_IMAGE is unset
pub const DEFAULT_SANDBOX_IMAGE: &str = "ghcr.io/usestrix/strix-sandbox:0.1.10";

/// Scan depth, selects prompt modules and iteration discipline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Quick,
    #[default]
    Standard,
    Deep,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Standard => "standard",
            Self::Deep => "deep",
        }
    }
}

impl std::str::FromStr for ScanMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "quick" => Ok(Self::Quick),
            "standard" => Ok(Self::Standard),
            "deep" => Ok(Self::Deep),
            other => Err(Error::Config(format!("Unknown scan mode: {other}"))),
        }
    }
}

/// LLM gateway settings resolved from the environment
#[derive(Debug, Clone)]
pub struct LlmSettings {
    /// Model identifier, e.g. `anthropic/claude-sonnet-4-20250514`
    pub model: String,
    pub api_key: String,
    pub api_base: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    /// Delay inserted between request submissions
    pub rate_limit_delay: Duration,
    /// Upper bound on in-flight requests
    pub rate_limit_concurrent: usize,
}

/// Sandbox runtime settings resolved from the environment
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub image: String,
    /// Per tool call execution deadline
    pub execution_timeout: Duration,
    pub docker_host: Option<String>,
}

/// Complete runtime settings for one process
#[derive(Debug, Clone)]
pub struct Settings {
    pub llm: LlmSettings,
    pub sandbox: SandboxSettings,
    pub perplexity_api_key: Option<String>,
    pub disable_browser: bool,
}

impl Settings {
    /// Resolve settings from the process environment.
    ///
    /// Missing `STRIX_LLM` or `LLM_API_KEY` is fatal at startup.
    pub fn from_env() -> Result<Self> {
        let model = std::env::var("STRIX_LLM")
            .map_err(|_| Error::Config("STRIX_LLM is not set".to_string()))?;
        let api_key = std::env::var("LLM_API_KEY")
            .map_err(|_| Error::Config("LLM_API_KEY is not set".to_string()))?;

        if model.trim().is_empty() {
            return Err(Error::Config("STRIX_LLM is empty".to_string()));
        }

        Ok(Self {
            llm: LlmSettings {
                model,
                api_key,
                api_base: std::env::var("LLM_API_BASE").ok(),
                timeout: Duration::from_secs(env_u64("LLM_TIMEOUT", 300)?),
                rate_limit_delay: Duration::from_millis(
                    (env_f64("LLM_RATE_LIMIT_DELAY", 0.0)? * 1000.0) as u64,
                ),
                rate_limit_concurrent: env_u64("LLM_RATE_LIMIT_CONCURRENT", 5)? as usize,
            },
            sandbox: SandboxSettings {
                image: std::env::var("STRIX_IMAGE")
                    .unwrap_or_else(|_| DEFAULT_SANDBOX_IMAGE.to_string()),
                execution_timeout: Duration::from_secs(env_u64(
                    "STRIX_SANDBOX_EXECUTION_TIMEOUT",
                    500,
                )?),
                docker_host: std::env::var("DOCKER_HOST").ok(),
            },
            perplexity_api_key: std::env::var("PERPLEXITY_API_KEY").ok(),
            disable_browser: env_flag("STRIX_DISABLE_BROWSER"),
        })
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{name} is not a valid integer: {v}"))),
        Err(_) => Ok(default),
    }
}

fn env_f64(name: &str, default: f64) -> Result<f64> {
    match std::env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("{name} is not a valid number: {v}"))),
        Err(_) => Ok(default),
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v.to_lowercase() == "true" || v == "1")
        .unwrap_or(false)
}

/// Immutable description of one scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    pub id: String,
    pub target: String,
    pub scan_mode: ScanMode,
    /// Knowledge modules attached to the root agent (max 5)
    pub prompt_modules: Vec<String>,
    pub run_name: Option<String>,
    pub non_interactive: bool,
}

impl ScanConfig {
    pub fn new(target: impl Into<String>, scan_mode: ScanMode) -> Self {
        Self {
            id: format!("scan-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            target: target.into(),
            scan_mode,
            prompt_modules: Vec::new(),
            run_name: None,
            non_interactive: false,
        }
    }

    pub fn with_prompt_modules(mut self, modules: Vec<String>) -> Result<Self> {
        if modules.len() > crate::prompts::MAX_PROMPT_MODULES {
            return Err(Error::Config(format!(
                "At most {} prompt modules may be attached to an agent, got {}",
                crate::prompts::MAX_PROMPT_MODULES,
                modules.len()
            )));
        }
        self.prompt_modules = modules;
        Ok(self)
    }

    pub fn with_run_name(mut self, name: Option<String>) -> Self {
        self.run_name = name;
        self
    }

    /// Unattended runs never pause for operator input: a fatal model error
    /// fails the agent instead of parking it in the waiting state.
    pub fn with_non_interactive(mut self, non_interactive: bool) -> Self {
        self.non_interactive = non_interactive;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_mode_parse() {
        assert_eq!("quick".parse::<ScanMode>().unwrap(), ScanMode::Quick);
        assert_eq!("STANDARD".parse::<ScanMode>().unwrap(), ScanMode::Standard);
        assert_eq!("deep".parse::<ScanMode>().unwrap(), ScanMode::Deep);
        assert!("extreme".parse::<ScanMode>().is_err());
    }

    #[test]
    fn test_scan_config_module_cap() {
        let config = ScanConfig::new("https://example.com", ScanMode::Standard);
        let too_many: Vec<String> = (0..6).map(|i| format!("module-{i}")).collect();
        assert!(config.clone().with_prompt_modules(too_many).is_err());

        let ok: Vec<String> = (0..5).map(|i| format!("module-{i}")).collect();
        assert!(config.with_prompt_modules(ok).is_ok());
    }

    #[test]
    fn test_scan_defaults_to_interactive() {
        let config = ScanConfig::new("https://example.com", ScanMode::Standard);
        assert!(!config.non_interactive);

        let unattended = config.with_non_interactive(true);
        assert!(unattended.non_interactive);
    }

    #[test]
    fn test_scan_ids_are_unique() {
        let a = ScanConfig::new("t", ScanMode::Quick);
        let b = ScanConfig::new("t", ScanMode::Quick);
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("scan-"));
    }
}
