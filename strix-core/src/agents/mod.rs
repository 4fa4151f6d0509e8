//! Agent execution engine and per-agent state

pub mod engine;
pub mod state;

pub use engine::{
    AgentEngine, AgentOutcome, ControlSignal, DispatchOutcome, EngineServices, ToolDispatch,
};
pub use state::{AgentState, AgentStatus, FailureReason, Message, Role, ToolCallRecord};
