//! Tool-invocation parsing from assistant content
//!
//! Tool calls are emitted by the model as XML-ish function blocks:
//!
//! ```text
//! <function=terminal_execute>
//! <parameter=command>whoami</parameter>
//! </function>
//! ```
//!
//! Parameter values that parse as JSON are kept typed; everything else is a
//! string.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::tools::ToolInvocation;

static FUNCTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<function=([A-Za-z0-9_\-]+)>(.*?)</function>")
        .expect("function regex is valid")
});

static PARAMETER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<parameter=([A-Za-z0-9_\-]+)>(.*?)</parameter>")
        .expect("parameter regex is valid")
});

/// Drop trailing prose after the last complete function block so stray text
/// behind the stop sequence never reaches the conversation history.
pub fn truncate_after_last_function(content: &str) -> &str {
    const CLOSE: &str = "</function>";
    match content.rfind(CLOSE) {
        Some(index) => &content[..index + CLOSE.len()],
        None => content,
    }
}

/// Extract all tool invocations from assistant content, in emission order.
pub fn parse_tool_invocations(content: &str) -> Vec<ToolInvocation> {
    FUNCTION_RE
        .captures_iter(content)
        .map(|call| {
            let name = call[1].to_string();
            let mut args = serde_json::Map::new();
            for param in PARAMETER_RE.captures_iter(&call[2]) {
                let key = param[1].to_string();
                let raw = param[2].trim();
                let value = serde_json::from_str(raw)
                    .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
                args.insert(key, value);
            }
            ToolInvocation { name, args }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_single_invocation() {
        let content = "Let me check.\n<function=terminal_execute>\n<parameter=command>id</parameter>\n</function>";
        let invocations = parse_tool_invocations(content);
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].name, "terminal_execute");
        assert_eq!(invocations[0].args["command"], json!("id"));
    }

    #[test]
    fn test_parse_multiple_invocations_in_order() {
        let content = "\
<function=list_requests>\n</function>\n\
<function=view_request>\n<parameter=request_id>req-9</parameter>\n</function>";
        let invocations = parse_tool_invocations(content);
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0].name, "list_requests");
        assert_eq!(invocations[1].name, "view_request");
    }

    #[test]
    fn test_json_values_stay_typed() {
        let content = "\
<function=browser_action>\n\
<parameter=action>goto</parameter>\n\
<parameter=timeout>30</parameter>\n\
<parameter=headless>true</parameter>\n\
</function>";
        let invocations = parse_tool_invocations(content);
        assert_eq!(invocations[0].args["timeout"], json!(30));
        assert_eq!(invocations[0].args["headless"], json!(true));
        assert_eq!(invocations[0].args["action"], json!("goto"));
    }

    #[test]
    fn test_multiline_parameter_value() {
        let content = "\
<function=python_execute>\n\
<parameter=code>import os\nprint(os.getcwd())</parameter>\n\
</function>";
        let invocations = parse_tool_invocations(content);
        let code = invocations[0].args["code"].as_str().unwrap();
        assert!(code.contains('\n'));
        assert!(code.contains("getcwd"));
    }

    #[test]
    fn test_no_invocations() {
        assert!(parse_tool_invocations("Just thinking out loud.").is_empty());
    }

    #[test]
    fn test_unclosed_block_ignored() {
        let content = "<function=terminal_execute>\n<parameter=command>ls</parameter>";
        assert!(parse_tool_invocations(content).is_empty());
    }

    #[test]
    fn test_truncate_after_last_function() {
        let content = "a <function=x></function> trailing chatter";
        assert_eq!(
            truncate_after_last_function(content),
            "a <function=x></function>"
        );
        assert_eq!(truncate_after_last_function("no calls"), "no calls");
    }
}
