//! Tool registry and built-in tool surface

mod builtin;
mod registry;

pub use builtin::default_registry;
pub use registry::{
    HostToolKind, ToolDescriptor, ToolHandler, ToolRegistry, SCHEMA_VERSION,
};

use serde::{Deserialize, Serialize};

/// One tool call extracted from an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    pub args: serde_json::Map<String, serde_json::Value>,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: serde_json::Map::new(),
        }
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }
}
