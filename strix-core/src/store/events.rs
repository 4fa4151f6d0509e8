//! Event types appended to each agent's event stream

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agents::state::{AgentStatus, FailureReason};
use crate::prompts::AgentKind;

/// One append-only event in `agents/<id>/events.jsonl`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Spawned {
        name: String,
        kind: AgentKind,
        parent_id: Option<String>,
        task: String,
    },
    StateTransition {
        status: AgentStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<FailureReason>,
    },
    ChatMessage {
        role: String,
        content: String,
    },
    ToolCallStarted {
        call_id: String,
        tool: String,
        args: serde_json::Value,
    },
    ToolCallFinished {
        call_id: String,
        tool: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    MessageSent {
        to: String,
        message_id: String,
    },
    MessageReceived {
        from: String,
        message_id: String,
    },
    FindingSubmitted {
        report_id: String,
        title: String,
    },
    FindingAdjudicated {
        report_id: String,
        verified: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Envelope written as one JSONL line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    #[serde(flatten)]
    pub event: AgentEvent,
}

impl EventRecord {
    pub fn new(agent_id: impl Into<String>, event: AgentEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            agent_id: agent_id.into(),
            event,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_round_trip() {
        let record = EventRecord::new(
            "agent_1",
            AgentEvent::ToolCallFinished {
                call_id: "call_1".to_string(),
                tool: "terminal_execute".to_string(),
                ok: false,
                result: None,
                error: Some("timeout".to_string()),
            },
        );
        let line = serde_json::to_string(&record).unwrap();
        assert!(line.contains("\"event\":\"tool_call_finished\""));

        let parsed: EventRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.agent_id, "agent_1");
        match parsed.event {
            AgentEvent::ToolCallFinished { ok, error, .. } => {
                assert!(!ok);
                assert_eq!(error.as_deref(), Some("timeout"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
