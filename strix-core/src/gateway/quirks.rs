//! Per-model request shaping
//!
//! Model quirks are resolved here, not in the agent engine: stop-word
//! support, reasoning-effort parameters, vision support, and prompt-cache
//! breakpoints for providers that offer caching.

use once_cell::sync::Lazy;

use super::provider::WireMessage;

/// Models that reject the `stop` parameter
const SUPPORTS_STOP_WORDS_FALSE_PATTERNS: &[&str] = &[
    "o1*",
    "o3*",
    "grok-4-0709",
    "grok-code-fast-1",
    "deepseek-r1*",
];

/// Models that accept a `reasoning_effort` parameter
const REASONING_EFFORT_PATTERNS: &[&str] = &[
    "o1*",
    "o3*",
    "o4-mini*",
    "gpt-5*",
    "gemini-2.5-flash",
    "gemini-2.5-pro",
    "deepseek-r1*",
    "claude-sonnet-4-5*",
    "claude-haiku-4-5*",
];

/// Models that accept image content
const VISION_MODEL_PATTERNS: &[&str] = &[
    "claude-*",
    "gpt-4o*",
    "gpt-4-1*",
    "gpt-4.1*",
    "gpt-5*",
    "o3*",
    "gemini-*",
    "grok-4*",
];

const ANTHROPIC_PATTERNS: &[&str] = &["anthropic/*", "claude*"];

/// Placeholder inserted when images are stripped for non-vision models
pub const IMAGE_REMOVED_PLACEHOLDER: &str =
    "[Screenshot removed - model does not support vision. Use view_source or execute_js instead.]";

static WILDCARD_CACHE: Lazy<std::sync::Mutex<std::collections::HashMap<String, regex::Regex>>> =
    Lazy::new(|| std::sync::Mutex::new(std::collections::HashMap::new()));

/// Strip a provider prefix (`anthropic/claude-x`) and tag suffix
/// (`model:latest`) down to the bare model name.
pub fn normalize_model_name(model: &str) -> String {
    let raw = model.trim().to_lowercase();
    let name = match raw.rsplit_once('/') {
        Some((_, name)) => name,
        None => raw.as_str(),
    };
    let name = match name.split_once(':') {
        Some((base, _)) => base,
        None => name,
    };
    name.trim_end_matches("-gguf").to_string()
}

fn wildcard_match(value: &str, pattern: &str) -> bool {
    let mut cache = WILDCARD_CACHE.lock().unwrap_or_else(|e| e.into_inner());
    let re = cache.entry(pattern.to_string()).or_insert_with(|| {
        let escaped = regex::escape(pattern).replace(r"\*", ".*");
        regex::Regex::new(&format!("^{escaped}$")).expect("wildcard pattern is a valid regex")
    });
    re.is_match(value)
}

/// Match a model id against a pattern list. Patterns containing `/` match
/// the full id; bare patterns match the normalized model name.
pub fn model_matches(model: &str, patterns: &[&str]) -> bool {
    let raw = model.trim().to_lowercase();
    let name = normalize_model_name(model);
    patterns.iter().any(|pattern| {
        let pattern = pattern.to_lowercase();
        if pattern.contains('/') {
            wildcard_match(&raw, &pattern)
        } else {
            wildcard_match(&name, &pattern)
        }
    })
}

pub fn supports_stop_words(model: &str) -> bool {
    !model_matches(model, SUPPORTS_STOP_WORDS_FALSE_PATTERNS)
}

pub fn reasoning_effort(model: &str) -> Option<&'static str> {
    model_matches(model, REASONING_EFFORT_PATTERNS).then_some("high")
}

pub fn supports_vision(model: &str) -> bool {
    model_matches(model, VISION_MODEL_PATTERNS)
}

pub fn is_anthropic_model(model: &str) -> bool {
    model_matches(model, ANTHROPIC_PATTERNS)
}

/// Replace image attachments with a text placeholder for non-vision models.
pub fn strip_images(messages: &mut [WireMessage]) {
    for message in messages {
        if !message.images.is_empty() {
            message.images.clear();
            message.text.push('\n');
            message.text.push_str(IMAGE_REMOVED_PLACEHOLDER);
        }
    }
}

/// Interval between cache breakpoints, grown so no more than three
/// breakpoints are placed regardless of history length.
fn cache_interval(total_messages: usize) -> usize {
    const MAX_BREAKPOINTS: usize = 3;
    let mut interval = 10;
    while total_messages / interval > MAX_BREAKPOINTS {
        interval += 10;
    }
    interval
}

/// Mark prompt-cache breakpoints every 10 messages (at most 3) for
/// providers with prompt caching. No-op for other models.
pub fn mark_cache_breakpoints(model: &str, messages: &mut [WireMessage]) {
    if !is_anthropic_model(model) || messages.is_empty() {
        return;
    }

    let interval = cache_interval(messages.len());
    let mut marked = 0;
    let mut index = interval;
    while index < messages.len() && marked < 3 {
        messages[index].cache_breakpoint = true;
        marked += 1;
        index += interval;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_model_name() {
        assert_eq!(normalize_model_name("anthropic/claude-4-sonnet"), "claude-4-sonnet");
        assert_eq!(normalize_model_name("ollama/llama3:latest"), "llama3");
        assert_eq!(normalize_model_name("GPT-4o"), "gpt-4o");
    }

    #[test]
    fn test_stop_word_support() {
        assert!(supports_stop_words("anthropic/claude-4-sonnet"));
        assert!(supports_stop_words("openai/gpt-4o"));
        assert!(!supports_stop_words("openai/o1-2024-12-17"));
        assert!(!supports_stop_words("deepseek-r1-0528"));
    }

    #[test]
    fn test_reasoning_effort() {
        assert_eq!(reasoning_effort("openai/o3"), Some("high"));
        assert_eq!(reasoning_effort("gpt-5-mini"), Some("high"));
        assert_eq!(reasoning_effort("anthropic/claude-4-sonnet"), None);
    }

    #[test]
    fn test_vision_support() {
        assert!(supports_vision("anthropic/claude-4-sonnet"));
        assert!(supports_vision("openai/gpt-4o"));
        assert!(!supports_vision("deepseek/deepseek-chat"));
    }

    #[test]
    fn test_strip_images_inserts_placeholder() {
        let mut messages = vec![
            WireMessage::user("look at this").with_images(vec!["data:image/png;base64,x".into()]),
            WireMessage::user("plain"),
        ];
        strip_images(&mut messages);
        assert!(messages[0].images.is_empty());
        assert!(messages[0].text.contains(IMAGE_REMOVED_PLACEHOLDER));
        assert!(!messages[1].text.contains(IMAGE_REMOVED_PLACEHOLDER));
    }

    #[test]
    fn test_cache_breakpoints_every_ten() {
        let mut messages: Vec<WireMessage> =
            (0..25).map(|i| WireMessage::user(format!("m{i}"))).collect();
        mark_cache_breakpoints("anthropic/claude-4-sonnet", &mut messages);

        let marked: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.cache_breakpoint)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(marked, vec![10, 20]);
    }

    #[test]
    fn test_cache_breakpoints_capped_at_three() {
        let mut messages: Vec<WireMessage> =
            (0..200).map(|i| WireMessage::user(format!("m{i}"))).collect();
        mark_cache_breakpoints("claude-4-sonnet", &mut messages);
        let count = messages.iter().filter(|m| m.cache_breakpoint).count();
        assert!(count <= 3);
    }

    #[test]
    fn test_cache_breakpoints_skipped_for_other_models() {
        let mut messages: Vec<WireMessage> =
            (0..30).map(|i| WireMessage::user(format!("m{i}"))).collect();
        mark_cache_breakpoints("openai/gpt-4o", &mut messages);
        assert!(messages.iter().all(|m| !m.cache_breakpoint));
    }
}
