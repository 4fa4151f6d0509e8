//! Prompt templates, knowledge modules, and agent-kind descriptors
//!
//! Module selection is pure data on the scan configuration: an agent carries
//! at most [`MAX_PROMPT_MODULES`] module names, resolved here against the
//! embedded library. Unknown names are rejected at the boundary.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::config::ScanMode;
use crate::{Error, Result};

/// Upper bound on knowledge modules attached to one agent
pub const MAX_PROMPT_MODULES: usize = 5;

/// Agent role within a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Root,
    Child,
    Verifier,
}

/// Static descriptor for an agent kind: which system template it uses, how
/// many iterations it gets, and whether callers may pick its modules.
#[derive(Debug, Clone, Copy)]
pub struct AgentKindSpec {
    pub system_template: &'static str,
    pub iteration_limit: u32,
    /// When false the kind's module set is fixed (verifiers)
    pub caller_selects_modules: bool,
}

impl AgentKind {
    pub fn spec(&self) -> AgentKindSpec {
        match self {
            Self::Root | Self::Child => AgentKindSpec {
                system_template: "agent",
                iteration_limit: 300,
                caller_selects_modules: true,
            },
            Self::Verifier => AgentKindSpec {
                system_template: "verification",
                iteration_limit: 50,
                caller_selects_modules: false,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Child => "child",
            Self::Verifier => "verifier",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawLibrary {
    templates: HashMap<String, String>,
    modules: HashMap<String, String>,
}

/// Embedded prompt library
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    templates: HashMap<String, String>,
    modules: HashMap<String, String>,
}

static LIBRARY: Lazy<PromptLibrary> = Lazy::new(|| {
    let raw: RawLibrary =
        toml::from_str(include_str!("../prompts.toml")).expect("Embedded prompts.toml is valid");
    PromptLibrary {
        templates: raw.templates,
        modules: raw.modules,
    }
});

/// Outcome of validating a list of module names
#[derive(Debug, Clone, Default)]
pub struct ModuleValidation {
    pub valid: Vec<String>,
    pub invalid: Vec<String>,
}

impl PromptLibrary {
    pub fn load() -> &'static Self {
        &LIBRARY
    }

    pub fn module(&self, name: &str) -> Option<&str> {
        self.modules.get(name).map(String::as_str)
    }

    pub fn module_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn validate_modules(&self, names: &[String]) -> ModuleValidation {
        let mut validation = ModuleValidation::default();
        for name in names {
            if self.modules.contains_key(name) {
                validation.valid.push(name.clone());
            } else {
                validation.invalid.push(name.clone());
            }
        }
        validation
    }

    /// Name of the verification-type module matching a vulnerability type,
    /// falling back to the generic verification module.
    pub fn verification_module_for(&self, vulnerability_type: &str) -> String {
        let candidate = format!("verification_types/{vulnerability_type}");
        if self.modules.contains_key(&candidate) {
            candidate
        } else {
            "verification".to_string()
        }
    }

    /// Render the full system prompt for an agent: kind template, scan-mode
    /// module, selected knowledge modules, and the tool specification block.
    pub fn system_prompt(
        &self,
        kind: AgentKind,
        scan_mode: ScanMode,
        modules: &[String],
        tools_prompt: &str,
    ) -> Result<String> {
        if modules.len() > MAX_PROMPT_MODULES {
            return Err(Error::Config(format!(
                "At most {MAX_PROMPT_MODULES} prompt modules per agent, got {}",
                modules.len()
            )));
        }
        let validation = self.validate_modules(modules);
        if !validation.invalid.is_empty() {
            return Err(Error::Config(format!(
                "Unknown prompt modules: {}. Available: {}",
                validation.invalid.join(", "),
                self.module_names().join(", ")
            )));
        }

        let spec = kind.spec();
        let template = self.templates.get(spec.system_template).ok_or_else(|| {
            Error::Config(format!("Missing system template: {}", spec.system_template))
        })?;

        let mut prompt = template.clone();

        let scan_mode_module = format!("scan_modes/{}", scan_mode.as_str());
        if let Some(text) = self.module(&scan_mode_module) {
            prompt.push_str("\n\n");
            prompt.push_str(text);
        }

        for name in modules {
            if let Some(text) = self.module(name) {
                prompt.push_str("\n\n");
                prompt.push_str(text);
            }
        }

        prompt.push_str("\n\n");
        prompt.push_str(tools_prompt);

        Ok(prompt)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_limits() {
        assert_eq!(AgentKind::Root.spec().iteration_limit, 300);
        assert_eq!(AgentKind::Child.spec().iteration_limit, 300);
        assert_eq!(AgentKind::Verifier.spec().iteration_limit, 50);
        assert!(!AgentKind::Verifier.spec().caller_selects_modules);
    }

    #[test]
    fn test_library_has_scan_modes() {
        let lib = PromptLibrary::load();
        assert!(lib.module("scan_modes/quick").is_some());
        assert!(lib.module("scan_modes/standard").is_some());
        assert!(lib.module("scan_modes/deep").is_some());
    }

    #[test]
    fn test_validate_modules() {
        let lib = PromptLibrary::load();
        let validation = lib.validate_modules(&["idor".to_string(), "nonexistent".to_string()]);
        assert_eq!(validation.valid, vec!["idor".to_string()]);
        assert_eq!(validation.invalid, vec!["nonexistent".to_string()]);
    }

    #[test]
    fn test_system_prompt_rejects_unknown_module() {
        let lib = PromptLibrary::load();
        let result = lib.system_prompt(
            AgentKind::Root,
            ScanMode::Standard,
            &["bogus-module".to_string()],
            "",
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_system_prompt_includes_modules_and_tools() {
        let lib = PromptLibrary::load();
        let prompt = lib
            .system_prompt(
                AgentKind::Root,
                ScanMode::Deep,
                &["idor".to_string()],
                "TOOLS-BLOCK",
            )
            .unwrap();
        assert!(prompt.contains("IDOR"));
        assert!(prompt.contains("TOOLS-BLOCK"));
    }

    #[test]
    fn test_verification_module_fallback() {
        let lib = PromptLibrary::load();
        assert_eq!(lib.verification_module_for("idor"), "verification_types/idor");
        assert_eq!(lib.verification_module_for("unheard-of"), "verification");
    }
}
