//! Canonical map from tool name to descriptor
//!
//! Registration happens once during scan startup; the registry is sealed
//! before the first agent iteration and immutable afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Version of the tool-schema format exposed to the model
pub const SCHEMA_VERSION: &str = "1";

/// Host-side tool identities, bound to scan services by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostToolKind {
    ViewAgentGraph,
    CreateAgent,
    SendMessageToAgent,
    WaitForMessage,
    AgentFinish,
    FinishScan,
    ReportVulnerability,
    VerifyFinding,
    ListPendingVerifications,
}

/// Where a tool executes.
///
/// A `Sandbox` handler carries no host code path at all: the invocation is
/// serialised and POSTed to the in-container worker. A `Host` handler never
/// needs container resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolHandler {
    Sandbox,
    Host(HostToolKind),
}

/// Immutable descriptor for one registered tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool's parameters
    pub parameters: serde_json::Value,
    pub handler: ToolHandler,
    pub parallelizable: bool,
}

impl ToolDescriptor {
    pub fn sandbox(&self) -> bool {
        matches!(self.handler, ToolHandler::Sandbox)
    }
}

/// Registry of all tools available to agents in this scan
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
    order: Vec<String>,
    sealed: AtomicBool,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
            sealed: AtomicBool::new(false),
        }
    }

    /// Register a tool descriptor.
    ///
    /// Idempotent for an identical descriptor, an error for a conflicting
    /// one, and rejected entirely once the registry has been sealed.
    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<()> {
        if self.sealed.load(Ordering::Acquire) {
            return Err(Error::Tool(format!(
                "Registry is sealed; cannot register '{}'",
                descriptor.name
            )));
        }
        if let Some(existing) = self.tools.get(&descriptor.name) {
            if *existing == descriptor {
                return Ok(());
            }
            return Err(Error::Tool(format!(
                "Conflicting registration for tool '{}'",
                descriptor.name
            )));
        }
        self.order.push(descriptor.name.clone());
        self.tools.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Freeze the registry; called once the scan begins.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    pub fn lookup(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// Unknown tools are conservatively treated as non-parallelizable.
    pub fn is_parallelizable(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.parallelizable)
    }

    pub fn is_sandbox(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(ToolDescriptor::sandbox)
    }

    /// Finish tools terminate the owning agent and always run last in a batch.
    pub fn is_finish_tool(name: &str) -> bool {
        matches!(name, "finish_scan" | "agent_finish")
    }

    /// All descriptors in registration order, for prompting the model.
    pub fn schemas(&self) -> Vec<&ToolDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    /// Render the tool specification block for the system prompt.
    pub fn tools_prompt(&self) -> String {
        let mut out = format!(
            "<tool_specification version=\"{SCHEMA_VERSION}\">\n\
             Call tools by emitting one or more blocks of the form:\n\
             <function=tool_name>\n<parameter=key>value</parameter>\n</function>\n\n"
        );
        for tool in self.schemas() {
            out.push_str(&format!(
                "## {}\n{}\nParameters: {}\n\n",
                tool.name, tool.description, tool.parameters
            ));
        }
        out.push_str("</tool_specification>");
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(name: &str, parallelizable: bool) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: format!("{name} tool"),
            parameters: json!({"type": "object", "properties": {}}),
            handler: ToolHandler::Sandbox,
            parallelizable,
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(descriptor("terminal_execute", false)).unwrap();

        assert!(registry.lookup("terminal_execute").is_some());
        assert!(registry.lookup("nonexistent").is_none());
    }

    #[test]
    fn test_identical_registration_is_idempotent() {
        let mut registry = ToolRegistry::new();
        registry.register(descriptor("view_request", true)).unwrap();
        registry.register(descriptor("view_request", true)).unwrap();
        assert_eq!(registry.names().len(), 1);
    }

    #[test]
    fn test_conflicting_registration_fails() {
        let mut registry = ToolRegistry::new();
        registry.register(descriptor("view_request", true)).unwrap();
        let err = registry.register(descriptor("view_request", false));
        assert!(err.is_err());
    }

    #[test]
    fn test_sealed_registry_rejects_registration() {
        let mut registry = ToolRegistry::new();
        registry.register(descriptor("a", true)).unwrap();
        registry.seal();
        assert!(registry.register(descriptor("b", true)).is_err());
        // Existing entries are still readable
        assert!(registry.lookup("a").is_some());
    }

    #[test]
    fn test_unknown_tools_not_parallelizable() {
        let registry = ToolRegistry::new();
        assert!(!registry.is_parallelizable("anything"));
    }

    #[test]
    fn test_schemas_preserve_registration_order() {
        let mut registry = ToolRegistry::new();
        registry.register(descriptor("zeta", true)).unwrap();
        registry.register(descriptor("alpha", true)).unwrap();
        let names: Vec<&str> = registry.schemas().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }

    #[test]
    fn test_finish_tool_names() {
        assert!(ToolRegistry::is_finish_tool("finish_scan"));
        assert!(ToolRegistry::is_finish_tool("agent_finish"));
        assert!(!ToolRegistry::is_finish_tool("terminal_execute"));
    }
}
