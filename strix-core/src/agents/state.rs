//! Per-agent conversation state
//!
//! `AgentState` is mutated only by the engine instance that owns the agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::{RequestStats, WireMessage, WireRole};
use crate::prompts::AgentKind;
use crate::tools::ToolInvocation;

/// How long a waiting agent sleeps before auto-resuming
pub const WAITING_TIMEOUT_SECS: i64 = 600;

/// Fraction of the iteration limit at which the agent is warned
pub const LIMIT_WARNING_THRESHOLD: f64 = 0.85;

pub fn generate_agent_id() -> String {
    format!("agent_{}", &Uuid::new_v4().simple().to_string()[..8])
}

/// Agent lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Waiting,
    Finished,
    Failed,
}

/// Why a failed agent failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Stuck,
    Exhausted,
    Cancelled,
    LlmFatal,
}

/// Conversation message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    #[serde(rename = "tool-result")]
    ToolResult,
}

/// One tool call recorded on an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallRecord {
    pub fn started(invocation: &ToolInvocation) -> Self {
        Self {
            id: format!("call_{}", &Uuid::new_v4().simple().to_string()[..8]),
            name: invocation.name.clone(),
            args: serde_json::Value::Object(invocation.args.clone()),
            started_at: Utc::now(),
            ended_at: None,
            result: None,
            error: None,
        }
    }

    pub fn complete(&mut self, outcome: std::result::Result<serde_json::Value, String>) {
        self.ended_at = Some(Utc::now());
        match outcome {
            Ok(value) => self.result = Some(value),
            Err(error) => self.error = Some(error),
        }
    }
}

/// One message in an agent's conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            images: Vec::new(),
            tool_calls: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool_result(content: impl Into<String>) -> Self {
        Self::new(Role::ToolResult, content)
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCallRecord>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    /// Shape for the provider. Tool results travel as user messages on the
    /// wire; the typed role stays in canonical state.
    pub fn to_wire(&self) -> WireMessage {
        let role = match self.role {
            Role::System => WireRole::System,
            Role::Assistant => WireRole::Assistant,
            Role::User | Role::ToolResult => WireRole::User,
        };
        WireMessage {
            role,
            text: self.content.clone(),
            images: self.images.clone(),
            cache_breakpoint: false,
        }
    }
}

/// A tool invocation recorded against the iteration that issued it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub invocation: ToolInvocation,
}

/// Complete mutable state of one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub agent_name: String,
    pub kind: AgentKind,
    pub parent_id: Option<String>,
    pub sandbox_id: Option<String>,
    pub worker_id: Option<String>,

    pub task: String,
    pub iteration: u32,
    pub iteration_limit: u32,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,

    pub messages: Vec<Message>,
    pub actions: Vec<ActionRecord>,
    pub stats: RequestStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit_warning_sent: bool,

    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl AgentState {
    pub fn new(kind: AgentKind, agent_name: impl Into<String>, task: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            agent_id: generate_agent_id(),
            agent_name: agent_name.into(),
            kind,
            parent_id: None,
            sandbox_id: None,
            worker_id: None,
            task: task.into(),
            iteration: 0,
            iteration_limit: kind.spec().iteration_limit,
            status: AgentStatus::Running,
            failure: None,
            messages: Vec::new(),
            actions: Vec::new(),
            stats: RequestStats::default(),
            last_error: None,
            waiting_since: None,
            limit_warning_sent: false,
            started_at: now,
            last_updated: now,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    pub fn increment_iteration(&mut self) {
        self.iteration += 1;
        self.touch();
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
        self.touch();
    }

    pub fn add_action(&mut self, invocation: ToolInvocation) {
        self.actions.push(ActionRecord {
            iteration: self.iteration,
            timestamp: Utc::now(),
            invocation,
        });
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(format!("Iteration {}: {}", self.iteration, error.into()));
        self.touch();
    }

    pub fn enter_waiting(&mut self) {
        self.status = AgentStatus::Waiting;
        self.waiting_since = Some(Utc::now());
        self.touch();
    }

    pub fn resume_from_waiting(&mut self) {
        self.status = AgentStatus::Running;
        self.waiting_since = None;
        self.touch();
    }

    pub fn is_waiting(&self) -> bool {
        self.status == AgentStatus::Waiting
    }

    /// The waiting timeout fires regardless of other flags so agents never
    /// sleep forever.
    pub fn has_waiting_timeout(&self) -> bool {
        match (self.status, self.waiting_since) {
            (AgentStatus::Waiting, Some(since)) => {
                (Utc::now() - since).num_seconds() > WAITING_TIMEOUT_SECS
            }
            _ => false,
        }
    }

    pub fn reached_iteration_limit(&self) -> bool {
        self.iteration >= self.iteration_limit
    }

    pub fn approaching_iteration_limit(&self) -> bool {
        self.iteration >= (f64::from(self.iteration_limit) * LIMIT_WARNING_THRESHOLD) as u32
    }

    pub fn mark_finished(&mut self) {
        self.status = AgentStatus::Finished;
        self.failure = None;
        self.touch();
    }

    pub fn mark_failed(&mut self, reason: FailureReason) {
        self.status = AgentStatus::Failed;
        self.failure = Some(reason);
        self.touch();
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, AgentStatus::Finished | AgentStatus::Failed)
    }
}
