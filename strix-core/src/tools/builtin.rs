//! Built-in tool surface registered at scan startup

use serde_json::json;

use crate::config::Settings;
use crate::Result;

use super::registry::{HostToolKind, ToolDescriptor, ToolHandler, ToolRegistry};

fn host(
    name: &str,
    kind: HostToolKind,
    description: &str,
    parameters: serde_json::Value,
    parallelizable: bool,
) -> ToolDescriptor {
    ToolDescriptor {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
        handler: ToolHandler::Host(kind),
        parallelizable,
    }
}

fn sandbox(
    name: &str,
    description: &str,
    parameters: serde_json::Value,
    parallelizable: bool,
) -> ToolDescriptor {
    ToolDescriptor {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
        handler: ToolHandler::Sandbox,
        parallelizable,
    }
}

/// Build the default registry for a scan. Browser tools are skipped when
/// `STRIX_DISABLE_BROWSER` is set and web search when no Perplexity key is
/// configured.
pub fn default_registry(settings: &Settings) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();

    // Agent graph
    registry.register(host(
        "view_agent_graph",
        HostToolKind::ViewAgentGraph,
        "Show the current agent tree with task and status for each agent.",
        json!({"type": "object", "properties": {}}),
        true,
    ))?;
    registry.register(host(
        "create_agent",
        HostToolKind::CreateAgent,
        "Spawn a sub-agent for a delegated task. Returns immediately with the new agent id.",
        json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "Short name for the sub-agent"},
                "task": {"type": "string", "description": "The delegated task"},
                "prompt_modules": {
                    "type": "string",
                    "description": "Comma-separated knowledge modules to attach (max 5)"
                }
            },
            "required": ["name", "task"]
        }),
        false,
    ))?;
    registry.register(host(
        "send_message_to_agent",
        HostToolKind::SendMessageToAgent,
        "Send a message to another agent by id.",
        json!({
            "type": "object",
            "properties": {
                "target_agent_id": {"type": "string"},
                "message": {"type": "string"}
            },
            "required": ["target_agent_id", "message"]
        }),
        false,
    ))?;
    registry.register(host(
        "wait_for_message",
        HostToolKind::WaitForMessage,
        "Pause until a message arrives from another agent or the user.",
        json!({
            "type": "object",
            "properties": {
                "reason": {"type": "string", "description": "Why the agent is waiting"}
            }
        }),
        false,
    ))?;
    registry.register(host(
        "agent_finish",
        HostToolKind::AgentFinish,
        "Finish this sub-agent's task and report the result to the parent.",
        json!({
            "type": "object",
            "properties": {
                "result_summary": {"type": "string"},
                "success": {"type": "boolean"}
            },
            "required": ["result_summary"]
        }),
        false,
    ))?;
    registry.register(host(
        "finish_scan",
        HostToolKind::FinishScan,
        "Finish the whole scan. Only the root agent may call this.",
        json!({
            "type": "object",
            "properties": {"summary": {"type": "string"}},
            "required": ["summary"]
        }),
        false,
    ))?;

    // Reporting and verification
    registry.register(host(
        "report_vulnerability",
        HostToolKind::ReportVulnerability,
        "Submit a vulnerability finding with structured evidence. The report \
         enters the verification queue; it is not final until verified.",
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string"},
                "vulnerability_type": {"type": "string"},
                "severity": {"type": "string", "enum": ["critical", "high", "medium", "low", "info"]},
                "claim_assertion": {"type": "string"},
                "evidence": {"type": "object", "description": "Structured evidence package"}
            },
            "required": ["title", "vulnerability_type", "severity", "claim_assertion", "evidence"]
        }),
        false,
    ))?;
    registry.register(host(
        "verify_finding",
        HostToolKind::VerifyFinding,
        "Record the verification decision for a pending report. Verifiers only.",
        json!({
            "type": "object",
            "properties": {
                "report_id": {"type": "string"},
                "verified": {"type": "boolean"},
                "verification_evidence": {"type": "object"},
                "rejection_reason": {"type": "string"}
            },
            "required": ["report_id", "verified"]
        }),
        false,
    ))?;
    registry.register(host(
        "list_pending_verifications",
        HostToolKind::ListPendingVerifications,
        "List vulnerability reports still awaiting verification.",
        json!({"type": "object", "properties": {}}),
        true,
    ))?;

    // Sandbox tools: bodies live in the container worker
    registry.register(sandbox(
        "terminal_execute",
        "Run a shell command in the sandbox terminal session.",
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string"},
                "timeout": {"type": "number"}
            },
            "required": ["command"]
        }),
        false,
    ))?;
    registry.register(sandbox(
        "python_execute",
        "Run a Python snippet in the sandbox interpreter.",
        json!({
            "type": "object",
            "properties": {"code": {"type": "string"}},
            "required": ["code"]
        }),
        false,
    ))?;
    registry.register(sandbox(
        "send_request",
        "Send a raw HTTP request through the intercepting proxy.",
        json!({
            "type": "object",
            "properties": {
                "method": {"type": "string"},
                "url": {"type": "string"},
                "headers": {"type": "object"},
                "body": {"type": "string"}
            },
            "required": ["method", "url"]
        }),
        false,
    ))?;
    registry.register(sandbox(
        "list_requests",
        "List captured requests from the proxy history.",
        json!({
            "type": "object",
            "properties": {
                "filter": {"type": "string"},
                "limit": {"type": "number"}
            }
        }),
        true,
    ))?;
    registry.register(sandbox(
        "view_request",
        "Show one captured request/response pair by id.",
        json!({
            "type": "object",
            "properties": {"request_id": {"type": "string"}},
            "required": ["request_id"]
        }),
        true,
    ))?;
    registry.register(sandbox(
        "view_file",
        "Read a file from the shared /workspace directory.",
        json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        }),
        true,
    ))?;
    registry.register(sandbox(
        "edit_file",
        "Create or modify a file under /workspace.",
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"}
            },
            "required": ["path", "content"]
        }),
        false,
    ))?;

    if !settings.disable_browser {
        registry.register(sandbox(
            "browser_action",
            "Drive the sandbox browser: navigate, click, type, screenshot.",
            json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["goto", "click", "type", "screenshot", "execute_js", "view_source"]},
                    "target": {"type": "string"},
                    "value": {"type": "string"}
                },
                "required": ["action"]
            }),
            false,
        ))?;
    }

    if settings.perplexity_api_key.is_some() {
        registry.register(sandbox(
            "web_search",
            "Search the web for documentation or known-vulnerability context.",
            json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }),
            true,
        ))?;
    }

    Ok(registry)
}
