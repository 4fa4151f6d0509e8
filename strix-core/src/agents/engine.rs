//! Per-agent think-act loop
//!
//! One engine instance owns one agent: only this loop mutates the agent's
//! state. Each iteration compresses the conversation, asks the gateway for
//! the next assistant message, executes the extracted tool calls under the
//! parallel/serial discipline, and merges results back in request order.
//!
//! Suspension points: gateway calls, tool dispatch (sandbox HTTP), and
//! `AgentGraph::wait`. Nothing else blocks.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::StreamExt;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::LlmGateway;
use crate::graph::AgentGraph;
use crate::memory::MemoryCompressor;
use crate::store::{AgentEvent, RunStore};
use crate::tools::{ToolInvocation, ToolRegistry};
use crate::Error;

use super::state::{
    AgentState, AgentStatus, FailureReason, Message, ToolCallRecord, WAITING_TIMEOUT_SECS,
};

/// Concurrent fan-out bound for a parallel tool batch
const PARALLEL_FANOUT: usize = 4;

/// Consecutive tool-call-less iterations before the agent is stuck
const STUCK_THRESHOLD: u32 = 2;

/// Engine-level interpretation of a tool result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// The agent called its finish tool successfully
    Finish,
    /// The agent asked to wait for messages
    Wait,
}

/// Result of dispatching one tool invocation
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub result: std::result::Result<serde_json::Value, String>,
    pub control: Option<ControlSignal>,
}

impl DispatchOutcome {
    pub fn ok(value: serde_json::Value) -> Self {
        Self {
            result: Ok(value),
            control: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: Err(message.into()),
            control: None,
        }
    }

    pub fn with_control(mut self, control: ControlSignal) -> Self {
        self.control = Some(control);
        self
    }
}

/// Routes tool invocations to host handlers or the sandbox runtime.
/// Implemented by the scan supervisor.
#[async_trait::async_trait]
pub trait ToolDispatch: Send + Sync {
    async fn dispatch(&self, state: &AgentState, invocation: &ToolInvocation) -> DispatchOutcome;
}

/// Shared services handed to every engine in a scan
#[derive(Clone)]
pub struct EngineServices {
    pub gateway: Arc<LlmGateway>,
    pub registry: Arc<ToolRegistry>,
    pub graph: Arc<AgentGraph>,
    pub store: Arc<RunStore>,
    pub compressor: Arc<MemoryCompressor>,
    pub dispatcher: Arc<dyn ToolDispatch>,
    pub cancel: CancellationToken,
    /// Unattended scans fail an agent on fatal model errors; interactive
    /// runs park it in the waiting state for operator input instead
    pub non_interactive: bool,
}

/// Terminal result of one agent run
#[derive(Debug)]
pub struct AgentOutcome {
    pub status: AgentStatus,
    pub failure: Option<FailureReason>,
    pub state: AgentState,
}

/// The think-act loop for one agent
pub struct AgentEngine {
    state: AgentState,
    system_prompt: String,
    services: EngineServices,
    empty_streak: u32,
}

impl AgentEngine {
    pub fn new(state: AgentState, system_prompt: String, services: EngineServices) -> Self {
        Self {
            state,
            system_prompt,
            services,
            empty_streak: 0,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.state.agent_id
    }

    /// Drive the agent to a terminal state.
    pub async fn run(mut self) -> AgentOutcome {
        self.state.add_message(Message::user(self.state.task.clone()));

        loop {
            if self.services.cancel.is_cancelled() {
                return self.fail(FailureReason::Cancelled);
            }

            self.drain_inbox();

            if self.state.is_waiting() {
                self.wait_for_mail().await;
                continue;
            }

            if self.state.reached_iteration_limit() {
                return self.fail(FailureReason::Exhausted);
            }

            self.state.increment_iteration();
            self.maybe_warn_about_limit();

            let response = match self.next_assistant_message().await {
                Ok(response) => response,
                Err(Error::Cancelled) => return self.fail(FailureReason::Cancelled),
                Err(error) => {
                    self.state.record_error(error.to_string());
                    if self.services.non_interactive {
                        return self.fail(FailureReason::LlmFatal);
                    }
                    // Interactive runs park the agent for operator input; a
                    // user message (or the waiting timeout) resumes it
                    self.state.add_message(Message::system(
                        "The model request failed. Waiting for new instructions.",
                    ));
                    self.state.enter_waiting();
                    self.sync_graph_status();
                    continue;
                }
            };

            let content = response.content.trim().to_string();
            if content.is_empty() {
                // An empty reply is corrected, not counted as a stuck strike
                self.state.add_message(Message::user(
                    "You MUST NOT respond with empty messages. If you have nothing \
                     to do, use wait_for_message, or finish with agent_finish \
                     (sub-agents) / finish_scan (root agent).",
                ));
                continue;
            }

            let invocations = response.tool_invocations;
            if invocations.is_empty() {
                self.state.add_message(Message::assistant(content));
                self.empty_streak += 1;
                if self.empty_streak >= STUCK_THRESHOLD {
                    return self.fail(FailureReason::Stuck);
                }
                self.state.add_message(Message::user(
                    "Your reply contained no tool call. Every step must either \
                     call a tool or finish the task with the appropriate finish tool.",
                ));
                continue;
            }
            self.empty_streak = 0;

            let records: Vec<ToolCallRecord> =
                invocations.iter().map(ToolCallRecord::started).collect();
            self.state.add_message(
                Message::assistant(content.clone()).with_tool_calls(records.clone()),
            );
            self.log_event(AgentEvent::ChatMessage {
                role: "assistant".to_string(),
                content,
            });

            let signal = self.execute_batch(invocations, records).await;

            match signal {
                Some(ControlSignal::Finish) => {
                    self.state.mark_finished();
                    self.sync_graph_status();
                    info!(agent_id = %self.state.agent_id, "Agent finished");
                    return self.outcome();
                }
                Some(ControlSignal::Wait) => {
                    self.state.enter_waiting();
                    self.sync_graph_status();
                }
                None => {}
            }
        }
    }

    /// Deliver unread inter-agent mail into the conversation. A waiting
    /// agent resumes when mail arrives.
    fn drain_inbox(&mut self) {
        let messages = self.services.graph.receive(&self.state.agent_id);
        if messages.is_empty() {
            return;
        }
        if self.state.is_waiting() {
            self.state.resume_from_waiting();
            self.sync_graph_status();
        }
        for message in messages {
            self.log_event(AgentEvent::MessageReceived {
                from: message.from.clone(),
                message_id: message.id.clone(),
            });
            let body = if message.from == "user" {
                message.body
            } else {
                format!(
                    "<inter_agent_message>\n<from>{}</from>\n<sent_at>{}</sent_at>\n\
                     <content>\n{}\n</content>\n</inter_agent_message>",
                    message.from,
                    message.sent_at.to_rfc3339(),
                    message.body
                )
            };
            self.state.add_message(Message::user(body));
        }
    }

    /// Sleep until mail arrives or the waiting timeout fires. A timeout is
    /// recorded as a synthetic system message.
    async fn wait_for_mail(&mut self) {
        let elapsed = self
            .state
            .waiting_since
            .map(|since| (Utc::now() - since).num_seconds())
            .unwrap_or(0);
        let remaining = (WAITING_TIMEOUT_SECS - elapsed).max(0) as u64;

        let woke = tokio::select! {
            _ = self.services.cancel.cancelled() => return,
            woke = self
                .services
                .graph
                .wait(&self.state.agent_id, Duration::from_secs(remaining)) => woke.unwrap_or(false),
        };

        if !woke {
            self.state.resume_from_waiting();
            self.state.add_message(Message::system(
                "Waiting timeout reached. Resuming execution.",
            ));
            self.sync_graph_status();
        }
        // Mail is delivered by drain_inbox at the top of the loop
    }

    fn maybe_warn_about_limit(&mut self) {
        if self.state.approaching_iteration_limit() && !self.state.limit_warning_sent {
            self.state.limit_warning_sent = true;
            let remaining = self.state.iteration_limit - self.state.iteration;
            self.state.add_message(Message::user(format!(
                "URGENT: you are approaching the iteration limit \
                 ({}/{}, {} remaining). Prioritise completing the task and call \
                 the appropriate finish tool soon.",
                self.state.iteration, self.state.iteration_limit, remaining
            )));
        }
        if self.state.iteration + 3 == self.state.iteration_limit {
            self.state.add_message(Message::user(
                "CRITICAL: only 3 iterations left. Your next message MUST call \
                 the appropriate finish tool.",
            ));
        }
    }

    async fn next_assistant_message(&mut self) -> crate::Result<crate::gateway::GatewayResponse> {
        let compressed = self
            .services
            .compressor
            .compress(&self.state.messages, self.services.gateway.as_ref())
            .await;
        let wire = compressed.iter().map(Message::to_wire).collect();

        let response = self
            .services
            .gateway
            .generate(Some(self.system_prompt.clone()), wire)
            .await?;

        self.state.stats.add(&response.stats);
        Ok(response)
    }

    /// Execute one batch of tool calls.
    ///
    /// Finish tools always run last. The rest runs concurrently only when
    /// every call is parallelizable; one non-parallelizable call degrades
    /// the whole batch to serial model-emitted order. Results are merged
    /// back in request order no matter how execution interleaved.
    async fn execute_batch(
        &mut self,
        invocations: Vec<ToolInvocation>,
        mut records: Vec<ToolCallRecord>,
    ) -> Option<ControlSignal> {
        for invocation in &invocations {
            self.state.add_action(invocation.clone());
        }

        let mut finish_calls: Vec<(usize, ToolInvocation)> = Vec::new();
        let mut work_calls: Vec<(usize, ToolInvocation)> = Vec::new();
        for (index, invocation) in invocations.into_iter().enumerate() {
            if ToolRegistry::is_finish_tool(&invocation.name) {
                finish_calls.push((index, invocation));
            } else {
                work_calls.push((index, invocation));
            }
        }

        let all_parallel = work_calls
            .iter()
            .all(|(_, inv)| self.services.registry.is_parallelizable(&inv.name));

        let mut outcomes: Vec<(usize, DispatchOutcome)> =
            Vec::with_capacity(work_calls.len() + finish_calls.len());

        if all_parallel && work_calls.len() > 1 {
            let state = &self.state;
            let dispatcher = Arc::clone(&self.services.dispatcher);
            let mut stream = futures::stream::iter(work_calls.into_iter().map(
                |(index, invocation)| {
                    let dispatcher = Arc::clone(&dispatcher);
                    async move {
                        let outcome = dispatcher.dispatch(state, &invocation).await;
                        (index, invocation, outcome)
                    }
                },
            ))
            .buffer_unordered(PARALLEL_FANOUT)
            .collect::<Vec<_>>()
            .await;
            stream.sort_by_key(|(index, _, _)| *index);
            for (index, _invocation, outcome) in stream {
                outcomes.push((index, outcome));
            }
        } else {
            for (index, invocation) in work_calls {
                let outcome = self
                    .services
                    .dispatcher
                    .dispatch(&self.state, &invocation)
                    .await;
                outcomes.push((index, outcome));
            }
        }

        for (index, invocation) in finish_calls {
            let outcome = self
                .services
                .dispatcher
                .dispatch(&self.state, &invocation)
                .await;
            outcomes.push((index, outcome));
        }

        // Merge in request order regardless of completion order
        outcomes.sort_by_key(|(index, _)| *index);

        let mut signal = None;
        for (index, outcome) in outcomes {
            let record = &mut records[index];
            record.complete(outcome.result.clone());
            self.log_event(AgentEvent::ToolCallFinished {
                call_id: record.id.clone(),
                tool: record.name.clone(),
                ok: outcome.result.is_ok(),
                result: outcome.result.as_ref().ok().cloned(),
                error: outcome.result.as_ref().err().cloned(),
            });

            let message = tool_result_message(record);
            self.state.add_message(message);

            // The last control signal in request order wins; in practice a
            // batch carries at most one finish/wait call
            if outcome.control.is_some() {
                signal = outcome.control;
            }
        }

        // Keep the records on the assistant message current
        if let Some(assistant) = self
            .state
            .messages
            .iter_mut()
            .rev()
            .find(|m| !m.tool_calls.is_empty())
        {
            assistant.tool_calls = records;
        }

        signal
    }

    fn fail(&mut self, reason: FailureReason) -> AgentOutcome {
        warn!(agent_id = %self.state.agent_id, ?reason, "Agent failed");
        self.state.mark_failed(reason);
        self.sync_graph_status();
        self.outcome()
    }

    fn outcome(&mut self) -> AgentOutcome {
        self.log_event(AgentEvent::StateTransition {
            status: self.state.status,
            failure: self.state.failure,
        });
        AgentOutcome {
            status: self.state.status,
            failure: self.state.failure,
            state: self.state.clone(),
        }
    }

    fn sync_graph_status(&self) {
        self.services
            .graph
            .update_status(&self.state.agent_id, self.state.status, self.state.failure);
    }

    fn log_event(&self, event: AgentEvent) {
        if let Err(error) = self.services.store.append_event(&self.state.agent_id, event) {
            debug!(%error, "Failed to append agent event");
        }
    }
}

/// Render one completed tool call as a tool-result message, extracting a
/// screenshot payload into an image attachment when present.
fn tool_result_message(record: &ToolCallRecord) -> Message {
    match (&record.result, &record.error) {
        (_, Some(error)) => Message::tool_result(format!(
            "<tool_result>\n<tool_name>{}</tool_name>\n<error>{}</error>\n</tool_result>",
            record.name, error
        )),
        (Some(value), None) => {
            let (value, images) = extract_screenshot(value);
            let rendered = truncate_result(&render_result(&value));
            let message = Message::tool_result(format!(
                "<tool_result>\n<tool_name>{}</tool_name>\n<result>{rendered}</result>\n</tool_result>",
                record.name
            ));
            message.with_images(images)
        }
        (None, None) => Message::tool_result(format!(
            "<tool_result>\n<tool_name>{}</tool_name>\n<result>ok</result>\n</tool_result>",
            record.name
        )),
    }
}

fn render_result(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

const RESULT_TRUNCATE_LIMIT: usize = 10_000;

fn truncate_result(text: &str) -> String {
    if text.len() <= RESULT_TRUNCATE_LIMIT {
        return text.to_string();
    }
    let head: String = text.chars().take(4000).collect();
    let tail_chars: Vec<char> = text.chars().collect();
    let tail: String = tail_chars[tail_chars.len().saturating_sub(4000)..]
        .iter()
        .collect();
    format!("{head}\n\n... [middle content truncated] ...\n\n{tail}")
}

fn extract_screenshot(value: &serde_json::Value) -> (serde_json::Value, Vec<String>) {
    let Some(object) = value.as_object() else {
        return (value.clone(), Vec::new());
    };
    let Some(screenshot) = object.get("screenshot").and_then(|v| v.as_str()) else {
        return (value.clone(), Vec::new());
    };

    let image = format!("data:image/png;base64,{screenshot}");
    let mut stripped = object.clone();
    stripped.insert(
        "screenshot".to_string(),
        serde_json::Value::String("[image attached]".to_string()),
    );
    (serde_json::Value::Object(stripped), vec![image])
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::config::LlmSettings;
    use crate::gateway::{
        CompletionRequest, CompletionResponse, LlmProvider, TokenUsage,
    };
    use crate::graph::AgentNode;
    use crate::prompts::AgentKind;
    use crate::tools::{ToolDescriptor, ToolHandler};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;

    /// Provider that replays a fixed script of assistant messages
    struct ScriptedProvider {
        script: StdMutex<VecDeque<String>>,
    }

    impl ScriptedProvider {
        fn new(lines: Vec<String>) -> Self {
            Self {
                script: StdMutex::new(lines.into_iter().collect()),
            }
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _request: CompletionRequest) -> crate::Result<CompletionResponse> {
            let content = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "I am out of ideas.".to_string());
            Ok(CompletionResponse {
                content,
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    ..Default::default()
                },
            })
        }
    }

    /// Dispatcher that records execution order and overlap
    struct SpyDispatcher {
        graph: Arc<AgentGraph>,
        started: StdMutex<Vec<(String, Instant)>>,
        finished: StdMutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        hold: Duration,
    }

    impl SpyDispatcher {
        fn new(graph: Arc<AgentGraph>, hold: Duration) -> Self {
            Self {
                graph,
                started: StdMutex::new(Vec::new()),
                finished: StdMutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                hold,
            }
        }

        fn finished_order(&self) -> Vec<String> {
            self.finished.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl ToolDispatch for SpyDispatcher {
        async fn dispatch(
            &self,
            state: &AgentState,
            invocation: &ToolInvocation,
        ) -> DispatchOutcome {
            match invocation.name.as_str() {
                "agent_finish" | "finish_scan" => {
                    match self.graph.finish(&state.agent_id, "done", true) {
                        Ok(()) => DispatchOutcome::ok(serde_json::json!({"finished": true}))
                            .with_control(ControlSignal::Finish),
                        Err(error) => DispatchOutcome::error(error.to_string()),
                    }
                }
                "wait_for_message" => DispatchOutcome::ok(serde_json::json!({"status": "waiting"}))
                    .with_control(ControlSignal::Wait),
                "tool_fail" => DispatchOutcome::error("simulated tool failure"),
                name => {
                    let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    self.max_in_flight.fetch_max(current, Ordering::SeqCst);
                    self.started
                        .lock()
                        .unwrap()
                        .push((name.to_string(), Instant::now()));
                    tokio::time::sleep(self.hold).await;
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    self.finished.lock().unwrap().push(name.to_string());
                    DispatchOutcome::ok(serde_json::json!({"tool": name}))
                }
            }
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        graph: Arc<AgentGraph>,
        dispatcher: Arc<SpyDispatcher>,
        services: EngineServices,
    }

    fn llm_settings() -> LlmSettings {
        LlmSettings {
            model: "anthropic/claude-4-sonnet".to_string(),
            api_key: "test".to_string(),
            api_base: None,
            timeout: Duration::from_secs(5),
            rate_limit_delay: Duration::ZERO,
            rate_limit_concurrent: 4,
        }
    }

    fn harness(script: Vec<String>, hold: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RunStore::create(dir.path(), "engine-test").unwrap());
        let graph = Arc::new(AgentGraph::new());
        let dispatcher = Arc::new(SpyDispatcher::new(Arc::clone(&graph), hold));

        let gateway = Arc::new(LlmGateway::new(
            &llm_settings(),
            Arc::new(ScriptedProvider::new(script)),
            CancellationToken::new(),
        ));

        let mut registry = ToolRegistry::new();
        for (name, parallelizable) in [
            ("tool_a", true),
            ("tool_b", true),
            ("tool_c", false),
            ("tool_fail", false),
        ] {
            registry
                .register(ToolDescriptor {
                    name: name.to_string(),
                    description: format!("{name} test tool"),
                    parameters: serde_json::json!({"type": "object", "properties": {}}),
                    handler: ToolHandler::Sandbox,
                    parallelizable,
                })
                .unwrap();
        }

        let services = EngineServices {
            gateway,
            registry: Arc::new(registry),
            graph: Arc::clone(&graph),
            store,
            compressor: Arc::new(MemoryCompressor::default()),
            dispatcher: dispatcher.clone() as Arc<dyn ToolDispatch>,
            cancel: CancellationToken::new(),
            non_interactive: true,
        };

        Harness {
            _dir: dir,
            graph,
            dispatcher,
            services,
        }
    }

    fn spawn_state(harness: &Harness, kind: AgentKind) -> AgentState {
        let state = AgentState::new(kind, "test-agent", "probe the target");
        harness
            .graph
            .register(AgentNode::new(
                state.agent_id.clone(),
                "test-agent",
                kind,
                "probe the target",
                None,
            ))
            .unwrap();
        state
    }

    fn calls(tools: &[&str]) -> String {
        tools
            .iter()
            .map(|t| format!("<function={t}>\n</function>"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[tokio::test]
    async fn test_parallel_batch_runs_concurrently_results_in_order() {
        let harness = harness(
            vec![
                calls(&["tool_a", "tool_b"]),
                calls(&["agent_finish"]),
            ],
            Duration::from_millis(40),
        );
        let state = spawn_state(&harness, AgentKind::Root);
        let engine = AgentEngine::new(state, "system".to_string(), harness.services.clone());

        let outcome = engine.run().await;
        assert_eq!(outcome.status, AgentStatus::Finished);

        // Both parallelizable tools overlapped
        assert_eq!(harness.dispatcher.max_in_flight.load(Ordering::SeqCst), 2);

        // Tool results appear in request order in the history
        let results: Vec<&Message> = outcome
            .state
            .messages
            .iter()
            .filter(|m| m.role == crate::agents::state::Role::ToolResult)
            .collect();
        assert!(results[0].content.contains("tool_a"));
        assert!(results[1].content.contains("tool_b"));
    }

    #[tokio::test]
    async fn test_mixed_batch_degrades_to_serial() {
        let harness = harness(
            vec![
                calls(&["tool_a", "tool_c", "tool_b"]),
                calls(&["agent_finish"]),
            ],
            Duration::from_millis(20),
        );
        let state = spawn_state(&harness, AgentKind::Root);
        let engine = AgentEngine::new(state, "system".to_string(), harness.services.clone());

        let outcome = engine.run().await;
        assert_eq!(outcome.status, AgentStatus::Finished);

        // One non-parallelizable call serialises the whole batch, in order
        assert_eq!(harness.dispatcher.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(
            harness.dispatcher.finished_order(),
            vec!["tool_a", "tool_c", "tool_b"]
        );
    }

    #[tokio::test]
    async fn test_tool_error_returned_to_model_not_fatal() {
        let harness = harness(
            vec![
                calls(&["tool_fail"]),
                calls(&["agent_finish"]),
            ],
            Duration::from_millis(1),
        );
        let state = spawn_state(&harness, AgentKind::Root);
        let engine = AgentEngine::new(state, "system".to_string(), harness.services.clone());

        let outcome = engine.run().await;
        assert_eq!(outcome.status, AgentStatus::Finished);

        let error_result = outcome
            .state
            .messages
            .iter()
            .find(|m| m.content.contains("<error>"))
            .expect("tool error fed back to the model");
        assert!(error_result.content.contains("simulated tool failure"));
    }

    #[tokio::test]
    async fn test_two_idle_iterations_mark_agent_stuck() {
        let harness = harness(
            vec!["Let me think about it.".to_string(), "Still thinking.".to_string()],
            Duration::from_millis(1),
        );
        let state = spawn_state(&harness, AgentKind::Root);
        let engine = AgentEngine::new(state, "system".to_string(), harness.services.clone());

        let outcome = engine.run().await;
        assert_eq!(outcome.status, AgentStatus::Failed);
        assert_eq!(outcome.failure, Some(FailureReason::Stuck));
    }

    #[tokio::test]
    async fn test_iteration_limit_marks_exhausted() {
        let loop_forever = calls(&["tool_a"]);
        let script: Vec<String> = (0..20).map(|_| loop_forever.clone()).collect();
        let harness = harness(script, Duration::from_millis(1));
        let mut state = spawn_state(&harness, AgentKind::Root);
        state.iteration_limit = 5;

        let engine = AgentEngine::new(state, "system".to_string(), harness.services.clone());
        let outcome = engine.run().await;

        assert_eq!(outcome.status, AgentStatus::Failed);
        assert_eq!(outcome.failure, Some(FailureReason::Exhausted));
        // No more assistant messages than the limit allows
        let assistant_count = outcome
            .state
            .messages
            .iter()
            .filter(|m| m.role == crate::agents::state::Role::Assistant)
            .count();
        assert!(assistant_count <= 5);
    }

    #[tokio::test]
    async fn test_finish_refused_until_inbox_drained() {
        let harness = harness(
            vec![
                calls(&["agent_finish"]),
                calls(&["agent_finish"]),
            ],
            Duration::from_millis(1),
        );
        let state = spawn_state(&harness, AgentKind::Root);

        // A child reports in before the agent tries to finish
        harness
            .graph
            .register(AgentNode::new(
                "agent_child",
                "child",
                AgentKind::Child,
                "subtask",
                Some(state.agent_id.clone()),
            ))
            .unwrap();
        harness
            .graph
            .send("agent_child", &state.agent_id, "found an endpoint")
            .unwrap();

        let engine = AgentEngine::new(state, "system".to_string(), harness.services.clone());
        let outcome = engine.run().await;

        // First finish was refused; after draining, the second succeeded
        assert_eq!(outcome.status, AgentStatus::Finished);
        assert!(outcome
            .state
            .messages
            .iter()
            .any(|m| m.content.contains("unread messages")));
        assert!(outcome
            .state
            .messages
            .iter()
            .any(|m| m.content.contains("found an endpoint")));
    }

    #[tokio::test]
    async fn test_wait_resumes_on_queued_message() {
        let harness = harness(
            vec![
                calls(&["wait_for_message"]),
                calls(&["agent_finish"]),
            ],
            Duration::from_millis(1),
        );
        let state = spawn_state(&harness, AgentKind::Root);
        let agent_id = state.agent_id.clone();

        let graph = Arc::clone(&harness.graph);
        let engine = AgentEngine::new(state, "system".to_string(), harness.services.clone());
        let run = tokio::spawn(engine.run());

        // Give the engine time to enter waiting, then send mail
        tokio::time::sleep(Duration::from_millis(50)).await;
        graph.send("user", &agent_id, "carry on please").unwrap();

        let outcome = run.await.unwrap();
        assert_eq!(outcome.status, AgentStatus::Finished);
        assert!(outcome
            .state
            .messages
            .iter()
            .any(|m| m.content.contains("carry on please")));
    }

    /// Provider that fails its first request, then replays a script
    struct FailOnceProvider {
        failed: std::sync::atomic::AtomicBool,
        then: String,
    }

    #[async_trait::async_trait]
    impl LlmProvider for FailOnceProvider {
        fn name(&self) -> &str {
            "fail-once"
        }

        async fn complete(&self, _request: CompletionRequest) -> crate::Result<CompletionResponse> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(crate::Error::LlmFatal("401 Unauthorized".to_string()));
            }
            Ok(CompletionResponse {
                content: self.then.clone(),
                usage: TokenUsage::default(),
            })
        }
    }

    #[tokio::test]
    async fn test_non_interactive_fails_on_fatal_gateway_error() {
        let harness = harness(vec![], Duration::from_millis(1));
        let mut services = harness.services.clone();
        services.gateway = Arc::new(LlmGateway::new(
            &llm_settings(),
            Arc::new(FailOnceProvider {
                failed: std::sync::atomic::AtomicBool::new(false),
                then: String::new(),
            }),
            CancellationToken::new(),
        ));

        let state = spawn_state(&harness, AgentKind::Root);
        let engine = AgentEngine::new(state, "system".to_string(), services);
        let outcome = engine.run().await;

        assert_eq!(outcome.status, AgentStatus::Failed);
        assert_eq!(outcome.failure, Some(FailureReason::LlmFatal));
    }

    #[tokio::test]
    async fn test_interactive_waits_out_fatal_gateway_error() {
        let harness = harness(vec![], Duration::from_millis(1));
        let mut services = harness.services.clone();
        services.non_interactive = false;
        services.gateway = Arc::new(LlmGateway::new(
            &llm_settings(),
            Arc::new(FailOnceProvider {
                failed: std::sync::atomic::AtomicBool::new(false),
                then: calls(&["agent_finish"]),
            }),
            CancellationToken::new(),
        ));

        let state = spawn_state(&harness, AgentKind::Root);
        let agent_id = state.agent_id.clone();
        let graph = Arc::clone(&harness.graph);
        let engine = AgentEngine::new(state, "system".to_string(), services);
        let run = tokio::spawn(engine.run());

        // The agent parks in waiting after the failure; an operator message
        // resumes it and the next request succeeds
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            graph.node(&agent_id).unwrap().status,
            AgentStatus::Waiting
        );
        graph.send("user", &agent_id, "please retry").unwrap();

        let outcome = run.await.unwrap();
        assert_eq!(outcome.status, AgentStatus::Finished);
        assert!(outcome
            .state
            .messages
            .iter()
            .any(|m| m.content.contains("model request failed")));
    }

    #[tokio::test]
    async fn test_cancellation_fails_agent() {
        let harness = harness(vec![calls(&["tool_a"])], Duration::from_millis(1));
        harness.services.cancel.cancel();

        let state = spawn_state(&harness, AgentKind::Root);
        let engine = AgentEngine::new(state, "system".to_string(), harness.services.clone());
        let outcome = engine.run().await;

        assert_eq!(outcome.status, AgentStatus::Failed);
        assert_eq!(outcome.failure, Some(FailureReason::Cancelled));
    }

    #[test]
    fn test_screenshot_extraction() {
        let value = serde_json::json!({"screenshot": "aGVsbG8=", "url": "https://x.test"});
        let (stripped, images) = extract_screenshot(&value);
        assert_eq!(images.len(), 1);
        assert!(images[0].starts_with("data:image/png;base64,"));
        assert_eq!(stripped["screenshot"], "[image attached]");
        assert_eq!(stripped["url"], "https://x.test");
    }

    #[test]
    fn test_result_truncation() {
        let long = "a".repeat(20_000);
        let truncated = truncate_result(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.contains("[middle content truncated]"));
        assert_eq!(truncate_result("short"), "short");
    }
}
