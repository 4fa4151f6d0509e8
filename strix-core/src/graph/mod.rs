//! Agent graph: parent/child relationships and inter-agent messaging
//!
//! Nodes are keyed by agent id; parent references are ids, never ownership
//! handles, which rules out reference cycles and keeps teardown trivial.
//! Message queues are per-recipient, mutated under per-queue locks, with a
//! notifier so a waiting engine wakes as soon as mail arrives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::agents::state::{AgentStatus, FailureReason};
use crate::prompts::AgentKind;
use crate::{Error, Result};

/// One message between agents (or from the user to an agent)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub read: bool,
}

/// Graph-visible record of one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentNode {
    pub id: String,
    pub name: String,
    pub kind: AgentKind,
    pub task: String,
    pub parent_id: Option<String>,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl AgentNode {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: AgentKind,
        task: impl Into<String>,
        parent_id: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            task: task.into(),
            parent_id,
            status: AgentStatus::Running,
            failure: None,
            created_at: Utc::now(),
            finished_at: None,
            result: None,
        }
    }
}

#[derive(Default)]
struct Mailbox {
    messages: Mutex<Vec<AgentMessage>>,
    notify: Notify,
}

impl Mailbox {
    fn unread_count(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| !m.read)
            .count()
    }
}

/// The scan-wide agent DAG and message router
#[derive(Default)]
pub struct AgentGraph {
    nodes: Mutex<HashMap<String, AgentNode>>,
    mailboxes: Mutex<HashMap<String, Arc<Mailbox>>>,
}

impl AgentGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an agent to the graph.
    ///
    /// The parent must exist, and the new node may not be an ancestor of its
    /// parent (cycle prevention, enforced at spawn time).
    pub fn register(&self, node: AgentNode) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());

        if nodes.contains_key(&node.id) {
            return Err(Error::Agent(format!("Agent {} already registered", node.id)));
        }
        if let Some(parent_id) = &node.parent_id {
            if !nodes.contains_key(parent_id) {
                return Err(Error::Agent(format!(
                    "Parent agent {parent_id} not found in graph"
                )));
            }
            if is_ancestor_locked(&nodes, &node.id, parent_id) {
                return Err(Error::Agent(format!(
                    "Agent {} may not become a child of its descendant {parent_id}",
                    node.id
                )));
            }
        }

        self.mailboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(node.id.clone())
            .or_default();
        nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub fn node(&self, agent_id: &str) -> Option<AgentNode> {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned()
    }

    pub fn children(&self, parent_id: &str) -> Vec<AgentNode> {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|n| n.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect()
    }

    /// Whether `candidate` appears on the parent chain above `of`.
    pub fn is_ancestor(&self, candidate: &str, of: &str) -> bool {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        is_ancestor_locked(&nodes, candidate, of)
    }

    pub fn update_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        failure: Option<FailureReason>,
    ) {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(node) = nodes.get_mut(agent_id) {
            node.status = status;
            node.failure = failure;
            if matches!(status, AgentStatus::Finished | AgentStatus::Failed) {
                node.finished_at = Some(Utc::now());
            }
        }
    }

    fn mailbox(&self, agent_id: &str) -> Result<Arc<Mailbox>> {
        self.mailboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::Agent(format!("Agent {agent_id} not found in graph")))
    }

    /// Enqueue a message for a recipient and wake its engine.
    pub fn send(&self, from: &str, to: &str, body: impl Into<String>) -> Result<String> {
        {
            let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            if !nodes.contains_key(to) {
                return Err(Error::Agent(format!("Target agent {to} not found in graph")));
            }
        }

        let mailbox = self.mailbox(to)?;
        let message = AgentMessage {
            id: format!("msg_{}", &Uuid::new_v4().simple().to_string()[..8]),
            from: from.to_string(),
            to: to.to_string(),
            body: body.into(),
            sent_at: Utc::now(),
            read: false,
        };
        let id = message.id.clone();

        mailbox
            .messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        mailbox.notify.notify_one();
        Ok(id)
    }

    /// Drain unread messages, marking them read.
    pub fn receive(&self, agent_id: &str) -> Vec<AgentMessage> {
        let Ok(mailbox) = self.mailbox(agent_id) else {
            return Vec::new();
        };
        let mut messages = mailbox.messages.lock().unwrap_or_else(|e| e.into_inner());
        let mut drained = Vec::new();
        for message in messages.iter_mut() {
            if !message.read {
                message.read = true;
                let mut delivered = message.clone();
                delivered.read = true;
                drained.push(delivered);
            }
        }
        drained
    }

    pub fn unread_count(&self, agent_id: &str) -> usize {
        self.mailbox(agent_id)
            .map(|mailbox| mailbox.unread_count())
            .unwrap_or(0)
    }

    /// Block until any message arrives or the deadline fires.
    ///
    /// Returns true when mail is available. This is one of the engine's
    /// documented suspension points.
    pub async fn wait(&self, agent_id: &str, deadline: Duration) -> Result<bool> {
        let mailbox = self.mailbox(agent_id)?;
        let end = Instant::now() + deadline;

        loop {
            if mailbox.unread_count() > 0 {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= end {
                return Ok(false);
            }
            let notified = mailbox.notify.notified();
            // Close the check-then-wait race
            if mailbox.unread_count() > 0 {
                return Ok(true);
            }
            if tokio::time::timeout(end - now, notified).await.is_err() {
                return Ok(false);
            }
        }
    }

    /// Finish an agent. Refused while unread messages exist: the engine must
    /// drain them first so nothing addressed to the agent is lost.
    pub fn finish(&self, agent_id: &str, summary: &str, success: bool) -> Result<()> {
        let unread = self.unread_count(agent_id);
        if unread > 0 {
            return Err(Error::Agent(format!(
                "Agent {agent_id} has {unread} unread messages and cannot finish"
            )));
        }

        let parent_id = {
            let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            let node = nodes
                .get_mut(agent_id)
                .ok_or_else(|| Error::Agent(format!("Agent {agent_id} not found in graph")))?;
            node.status = if success {
                AgentStatus::Finished
            } else {
                AgentStatus::Failed
            };
            node.finished_at = Some(Utc::now());
            node.result = Some(summary.to_string());
            node.parent_id.clone()
        };

        if let Some(parent_id) = parent_id {
            let node = self.node(agent_id);
            let name = node.as_ref().map(|n| n.name.clone()).unwrap_or_default();
            let task = node.map(|n| n.task).unwrap_or_default();
            let report = format!(
                "<agent_completion_report>\n\
                 <agent_name>{name}</agent_name>\n\
                 <agent_id>{agent_id}</agent_id>\n\
                 <task>{task}</task>\n\
                 <status>{}</status>\n\
                 <summary>{summary}</summary>\n\
                 </agent_completion_report>",
                if success { "SUCCESS" } else { "FAILED" }
            );
            // Parent may already be gone at scan teardown; that's fine
            let _ = self.send(agent_id, &parent_id, report);
        }

        Ok(())
    }

    /// Mark every non-terminal agent failed(cancelled) and wake all waiters.
    pub fn cancel_all(&self) {
        {
            let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            for node in nodes.values_mut() {
                if !matches!(node.status, AgentStatus::Finished | AgentStatus::Failed) {
                    node.status = AgentStatus::Failed;
                    node.failure = Some(FailureReason::Cancelled);
                    node.finished_at = Some(Utc::now());
                }
            }
        }
        let mailboxes = self.mailboxes.lock().unwrap_or_else(|e| e.into_inner());
        for mailbox in mailboxes.values() {
            mailbox.notify.notify_waiters();
            mailbox.notify.notify_one();
        }
    }

    /// Render the agent tree with per-status counts.
    pub fn view(&self, viewer_id: &str) -> String {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());

        let mut lines = vec!["=== AGENT GRAPH ===".to_string()];
        let roots: Vec<&AgentNode> = nodes.values().filter(|n| n.parent_id.is_none()).collect();
        for root in roots {
            render_subtree(&nodes, root, 0, viewer_id, &mut lines);
        }

        let count = |status: AgentStatus| nodes.values().filter(|n| n.status == status).count();
        lines.push(format!(
            "total: {} | running: {} | waiting: {} | finished: {} | failed: {}",
            nodes.len(),
            count(AgentStatus::Running),
            count(AgentStatus::Waiting),
            count(AgentStatus::Finished),
            count(AgentStatus::Failed),
        ));
        lines.join("\n")
    }

    pub fn all_nodes(&self) -> Vec<AgentNode> {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

fn is_ancestor_locked(nodes: &HashMap<String, AgentNode>, candidate: &str, of: &str) -> bool {
    let mut current = nodes.get(of).and_then(|n| n.parent_id.clone());
    while let Some(ancestor) = current {
        if ancestor == candidate {
            return true;
        }
        current = nodes.get(&ancestor).and_then(|n| n.parent_id.clone());
    }
    false
}

fn render_subtree(
    nodes: &HashMap<String, AgentNode>,
    node: &AgentNode,
    depth: usize,
    viewer_id: &str,
    lines: &mut Vec<String>,
) {
    let indent = "  ".repeat(depth);
    let marker = if node.id == viewer_id { " <- you" } else { "" };
    lines.push(format!(
        "{indent}* {} ({}) [{:?}]{marker}",
        node.name, node.id, node.status
    ));
    lines.push(format!("{indent}  task: {}", node.task));

    let mut children: Vec<&AgentNode> = nodes
        .values()
        .filter(|n| n.parent_id.as_deref() == Some(node.id.as_str()))
        .collect();
    children.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    for child in children {
        render_subtree(nodes, child, depth + 1, viewer_id, lines);
    }
}
