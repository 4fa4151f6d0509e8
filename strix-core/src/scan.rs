//! Scan supervisor: wires the engine, graph, gateway, runtime, pipeline,
//! and store together for one scan
//!
//! The supervisor owns the scan lifecycle: environment preflight, sandbox
//! creation, root-agent spawn, child/verifier spawns requested through
//! tools, periodic statistics snapshots, and teardown on every exit path.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agents::{
    AgentEngine, AgentOutcome, AgentState, AgentStatus, ControlSignal, DispatchOutcome,
    EngineServices, ToolDispatch,
};
use crate::config::{ScanConfig, Settings};
use crate::gateway::{create_provider, LlmGateway};
use crate::graph::{AgentGraph, AgentNode};
use crate::memory::MemoryCompressor;
use crate::prompts::{AgentKind, PromptLibrary, MAX_PROMPT_MODULES};
use crate::runtime::{Sandbox, SandboxRuntime};
use crate::store::{AgentEvent, ReportLocation, RunStore, ScanRecord, ScanStats};
use crate::tools::{default_registry, HostToolKind, ToolHandler, ToolInvocation};
use crate::verify::{
    AdjudicationOutcome, FindingReport, FindingSubmission, VerificationDecision,
    VerificationPipeline, VerifierSpawner,
};
use crate::{Error, Result};

/// Grace period for engines to observe cancellation before teardown finishes
const CANCEL_GRACE: Duration = Duration::from_secs(8);

/// Interval between stats snapshots
const STATS_INTERVAL: Duration = Duration::from_secs(15);

/// Final counts reported to the CLI
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub verified_findings: usize,
    pub rejected_findings: usize,
    pub pending_findings: usize,
    pub agents_spawned: usize,
    pub root_succeeded: bool,
}

/// Shared services and lifecycle owner for one scan
pub struct ScanSupervisor {
    self_ref: Weak<ScanSupervisor>,
    config: ScanConfig,
    store: Arc<RunStore>,
    graph: Arc<AgentGraph>,
    registry: Arc<crate::tools::ToolRegistry>,
    gateway: Arc<LlmGateway>,
    runtime: Arc<SandboxRuntime>,
    pipeline: Arc<VerificationPipeline>,
    compressor: Arc<MemoryCompressor>,
    cancel: CancellationToken,
    sandbox: Mutex<Option<Sandbox>>,
    tasks: Mutex<Vec<JoinHandle<AgentOutcome>>>,
}

impl ScanSupervisor {
    /// Build the supervisor and all shared services. Fails fast on missing
    /// configuration; Docker reachability is checked in [`Self::run`].
    pub fn new(
        settings: &Settings,
        config: ScanConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let run_name = config
            .run_name
            .clone()
            .unwrap_or_else(|| config.id.clone());
        let store = Arc::new(RunStore::create(std::env::current_dir()?, &run_name)?);

        let registry = default_registry(settings)?;
        registry.seal();

        let provider = create_provider(&settings.llm)?;
        let gateway = Arc::new(LlmGateway::new(&settings.llm, provider, cancel.clone()));
        let runtime = Arc::new(SandboxRuntime::connect(&settings.sandbox)?);
        let pipeline = Arc::new(VerificationPipeline::new(Arc::clone(&store)));

        let supervisor = Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            config,
            store,
            graph: Arc::new(AgentGraph::new()),
            registry: Arc::new(registry),
            gateway,
            runtime,
            pipeline,
            compressor: Arc::new(MemoryCompressor::default()),
            cancel,
            sandbox: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        supervisor
            .pipeline
            .set_spawner(Arc::clone(&supervisor) as Arc<dyn VerifierSpawner>);
        Ok(supervisor)
    }

    fn strong(&self) -> Option<Arc<Self>> {
        self.self_ref.upgrade()
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.store
    }

    /// Run the scan to completion. Tears down all sandboxes on every exit
    /// path, including cancellation and fatal errors.
    pub async fn run(self: &Arc<Self>) -> Result<ScanSummary> {
        let started_at = Utc::now();
        self.store.write_scan(&ScanRecord {
            config: self.config.clone(),
            started_at,
            ended_at: None,
        })?;

        let result = self.run_inner().await;

        // Cleanup happens regardless of how the scan ended
        if let Err(teardown) = self.runtime.destroy_all().await {
            warn!(%teardown, "Sandbox teardown reported errors");
        }
        self.write_stats();
        self.store.write_scan(&ScanRecord {
            config: self.config.clone(),
            started_at,
            ended_at: Some(Utc::now()),
        })?;

        result
    }

    async fn run_inner(self: &Arc<Self>) -> Result<ScanSummary> {
        self.runtime.preflight().await?;

        let sandbox = self.runtime.create(&self.config.id).await?;
        *self.sandbox.lock().await = Some(sandbox);

        let task = format!(
            "Perform an authorized {} security scan of target: {}",
            self.config.scan_mode.as_str(),
            self.config.target
        );
        let root_id = self
            .spawn_agent(
                AgentKind::Root,
                "root",
                &task,
                None,
                self.config.prompt_modules.clone(),
                None,
            )
            .await?;
        info!(root_id, "Root agent started");

        let stats_task = self.spawn_stats_loop();

        let root_succeeded = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.shutdown_cancelled().await;
                stats_task.abort();
                return Err(Error::Cancelled);
            }
            root_succeeded = self.drain_tasks() => root_succeeded,
        };
        stats_task.abort();

        Ok(ScanSummary {
            verified_findings: self.store.count_reports(ReportLocation::Verified),
            rejected_findings: self.store.count_reports(ReportLocation::Rejected),
            pending_findings: self.store.count_reports(ReportLocation::Pending),
            agents_spawned: self.graph.all_nodes().len(),
            root_succeeded,
        })
    }

    /// Await every engine task, including ones spawned while draining
    /// (verifiers, late children). The first-spawned task is the root agent;
    /// its terminal status decides the scan result.
    async fn drain_tasks(self: &Arc<Self>) -> bool {
        let mut root_succeeded = false;
        let mut first = true;
        loop {
            let batch: Vec<JoinHandle<AgentOutcome>> = {
                let mut tasks = self.tasks.lock().await;
                tasks.drain(..).collect()
            };
            if batch.is_empty() {
                return root_succeeded;
            }
            for handle in batch {
                match handle.await {
                    Ok(outcome) => {
                        if first {
                            root_succeeded = outcome.status == AgentStatus::Finished;
                            first = false;
                        }
                    }
                    Err(join_error) => error!(%join_error, "Engine task panicked"),
                }
            }
        }
    }

    /// Cancellation path: mark agents failed, let engines observe the token,
    /// then destroy containers. Completes within 10 seconds.
    async fn shutdown_cancelled(self: &Arc<Self>) {
        warn!("Scan cancelled, shutting down");
        self.graph.cancel_all();

        let batch: Vec<JoinHandle<AgentOutcome>> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain(..).collect()
        };
        let drain = async {
            for handle in batch {
                let _ = handle.await;
            }
        };
        let _ = tokio::time::timeout(CANCEL_GRACE, drain).await;

        if let Err(teardown) = self.runtime.destroy_all().await {
            warn!(%teardown, "Teardown during cancellation reported errors");
        }
    }

    fn spawn_stats_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            loop {
                ticker.tick().await;
                supervisor.write_stats();
            }
        })
    }

    fn write_stats(&self) {
        let nodes = self.graph.all_nodes();
        let count = |status: AgentStatus| nodes.iter().filter(|n| n.status == status).count();
        let stats = ScanStats {
            timestamp: Some(Utc::now()),
            agents_total: nodes.len(),
            agents_running: count(AgentStatus::Running),
            agents_waiting: count(AgentStatus::Waiting),
            agents_finished: count(AgentStatus::Finished),
            agents_failed: count(AgentStatus::Failed),
            reports_pending: self.store.count_reports(ReportLocation::Pending),
            reports_verified: self.store.count_reports(ReportLocation::Verified),
            reports_rejected: self.store.count_reports(ReportLocation::Rejected),
            usage: self.gateway.counters().snapshot(),
        };
        if let Err(write_error) = self.store.write_stats(&stats) {
            warn!(%write_error, "Failed to write stats snapshot");
        }
    }

    /// Register and launch one agent engine. For verifiers, the pipeline is
    /// notified when the engine exits so an undecided report is re-assigned.
    async fn spawn_agent(
        self: &Arc<Self>,
        kind: AgentKind,
        name: &str,
        task: &str,
        parent_id: Option<String>,
        modules: Vec<String>,
        verifier_report: Option<String>,
    ) -> Result<String> {
        let mut state = AgentState::new(kind, name, task);
        if let Some(parent_id) = &parent_id {
            state = state.with_parent(parent_id.clone());
        }

        let system_prompt = PromptLibrary::load().system_prompt(
            kind,
            self.config.scan_mode,
            &modules,
            &self.registry.tools_prompt(),
        )?;

        self.graph.register(AgentNode::new(
            state.agent_id.clone(),
            name,
            kind,
            task,
            parent_id.clone(),
        ))?;

        // Every agent gets its own worker inside the shared scan sandbox
        if let Some(sandbox) = self.sandbox.lock().await.clone() {
            state.sandbox_id = Some(sandbox.container_id.clone());
            match self.runtime.register_agent(&sandbox, &state.agent_id).await {
                Ok(worker_id) => state.worker_id = Some(worker_id),
                Err(register_error) => {
                    warn!(agent_id = %state.agent_id, %register_error, "Worker registration failed");
                }
            }
        }

        self.store.append_event(
            &state.agent_id,
            AgentEvent::Spawned {
                name: name.to_string(),
                kind,
                parent_id,
                task: task.to_string(),
            },
        )?;

        let agent_id = state.agent_id.clone();
        let services = EngineServices {
            gateway: Arc::clone(&self.gateway),
            registry: Arc::clone(&self.registry),
            graph: Arc::clone(&self.graph),
            store: Arc::clone(&self.store),
            compressor: Arc::clone(&self.compressor),
            dispatcher: Arc::clone(self) as Arc<dyn ToolDispatch>,
            cancel: self.cancel.clone(),
            non_interactive: self.config.non_interactive,
        };
        let engine = AgentEngine::new(state, system_prompt, services);

        let pipeline = Arc::clone(&self.pipeline);
        let handle = tokio::spawn(async move {
            let outcome = engine.run().await;
            if let Some(report_id) = verifier_report {
                pipeline.handle_verifier_exit(&report_id).await;
            }
            outcome
        });
        self.tasks.lock().await.push(handle);
        Ok(agent_id)
    }

    fn validate_modules(&self, raw: Option<&str>) -> Result<Vec<String>> {
        let Some(raw) = raw else {
            return Ok(Vec::new());
        };
        let modules: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(ToString::to_string)
            .collect();
        if modules.len() > MAX_PROMPT_MODULES {
            return Err(Error::Config(format!(
                "Cannot attach more than {MAX_PROMPT_MODULES} prompt modules"
            )));
        }
        let validation = PromptLibrary::load().validate_modules(&modules);
        if !validation.invalid.is_empty() {
            return Err(Error::Config(format!(
                "Invalid prompt modules: {}",
                validation.invalid.join(", ")
            )));
        }
        Ok(modules)
    }

    async fn dispatch_host_tool(
        &self,
        kind: HostToolKind,
        state: &AgentState,
        invocation: &ToolInvocation,
    ) -> DispatchOutcome {
        let args = &invocation.args;
        let str_arg =
            |key: &str| args.get(key).and_then(|v| v.as_str()).map(ToString::to_string);

        match kind {
            HostToolKind::ViewAgentGraph => {
                DispatchOutcome::ok(json!({ "graph": self.graph.view(&state.agent_id) }))
            }

            HostToolKind::CreateAgent => {
                if state.kind == AgentKind::Verifier {
                    return DispatchOutcome::error("Verification agents may not spawn sub-agents");
                }
                let (Some(name), Some(task)) = (str_arg("name"), str_arg("task")) else {
                    return DispatchOutcome::error("create_agent requires 'name' and 'task'");
                };
                let modules = match self.validate_modules(str_arg("prompt_modules").as_deref()) {
                    Ok(modules) => modules,
                    Err(invalid) => return DispatchOutcome::error(invalid.to_string()),
                };
                let Some(this) = self.strong() else {
                    return DispatchOutcome::error("Scan is shutting down");
                };
                match this
                    .spawn_agent(
                        AgentKind::Child,
                        &name,
                        &task,
                        Some(state.agent_id.clone()),
                        modules,
                        None,
                    )
                    .await
                {
                    Ok(child_id) => DispatchOutcome::ok(json!({
                        "agent_id": child_id,
                        "name": name,
                        "status": "running",
                    })),
                    Err(spawn_error) => DispatchOutcome::error(spawn_error.to_string()),
                }
            }

            HostToolKind::SendMessageToAgent => {
                let (Some(target), Some(message)) =
                    (str_arg("target_agent_id"), str_arg("message"))
                else {
                    return DispatchOutcome::error(
                        "send_message_to_agent requires 'target_agent_id' and 'message'",
                    );
                };
                match self.graph.send(&state.agent_id, &target, message) {
                    Ok(message_id) => {
                        let _ = self.store.append_event(
                            &state.agent_id,
                            AgentEvent::MessageSent {
                                to: target.clone(),
                                message_id: message_id.clone(),
                            },
                        );
                        DispatchOutcome::ok(json!({ "message_id": message_id, "delivered": true }))
                    }
                    Err(send_error) => DispatchOutcome::error(send_error.to_string()),
                }
            }

            HostToolKind::WaitForMessage => DispatchOutcome::ok(json!({
                "status": "waiting",
                "resume_conditions": [
                    "message from another agent",
                    "message from user",
                    "waiting timeout reached",
                ],
            }))
            .with_control(ControlSignal::Wait),

            HostToolKind::AgentFinish => {
                if state.kind == AgentKind::Root {
                    return DispatchOutcome::error(
                        "agent_finish is for sub-agents; the root agent must use finish_scan",
                    );
                }
                self.finish_agent(state, str_arg("result_summary").unwrap_or_default())
            }

            HostToolKind::FinishScan => {
                if state.kind != AgentKind::Root {
                    return DispatchOutcome::error(
                        "finish_scan may only be called by the root agent",
                    );
                }
                self.finish_agent(state, str_arg("summary").unwrap_or_default())
            }

            HostToolKind::ReportVulnerability => self.submit_finding(state, invocation).await,

            HostToolKind::VerifyFinding => {
                if state.kind != AgentKind::Verifier {
                    return DispatchOutcome::error(
                        "verify_finding may only be called by verification agents",
                    );
                }
                self.adjudicate_finding(state, invocation)
            }

            HostToolKind::ListPendingVerifications => {
                let pending = self.pipeline.pending_summaries();
                DispatchOutcome::ok(json!({
                    "pending_count": pending.len(),
                    "pending_reports": pending,
                }))
            }
        }
    }

    fn finish_agent(&self, state: &AgentState, summary: String) -> DispatchOutcome {
        // A verifier cannot walk away from a report it has not adjudicated
        if state.kind == AgentKind::Verifier {
            let undecided: Vec<String> = self
                .pipeline
                .pending_summaries()
                .into_iter()
                .map(|pending| pending.id)
                .filter(|id| {
                    self.pipeline
                        .pending_report(id)
                        .and_then(|report| report.verifier_agent_id)
                        .as_deref()
                        == Some(state.agent_id.as_str())
                })
                .collect();
            if !undecided.is_empty() {
                return DispatchOutcome::error(format!(
                    "Cannot finish before recording a decision with verify_finding for: {}. \
                     If the finding could not be reproduced, record verified=false with a \
                     rejection_reason.",
                    undecided.join(", ")
                ));
            }
        }

        match self.graph.finish(&state.agent_id, &summary, true) {
            Ok(()) => DispatchOutcome::ok(json!({ "finished": true, "summary": summary }))
                .with_control(ControlSignal::Finish),
            Err(refusal) => DispatchOutcome::error(refusal.to_string()),
        }
    }

    async fn submit_finding(
        &self,
        state: &AgentState,
        invocation: &ToolInvocation,
    ) -> DispatchOutcome {
        let args = serde_json::Value::Object(invocation.args.clone());
        let severity = match args
            .get("severity")
            .and_then(|v| v.as_str())
            .unwrap_or("medium")
            .parse()
        {
            Ok(severity) => severity,
            Err(invalid) => return DispatchOutcome::error(invalid),
        };
        let evidence = match args.get("evidence") {
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(evidence) => evidence,
                Err(parse_error) => {
                    return DispatchOutcome::error(format!("Malformed evidence: {parse_error}"))
                }
            },
            None => return DispatchOutcome::error("report_vulnerability requires 'evidence'"),
        };

        let submission = FindingSubmission {
            title: args
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            vulnerability_type: args
                .get("vulnerability_type")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            severity,
            claim_assertion: args
                .get("claim_assertion")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            evidence,
            reporter_agent_id: state.agent_id.clone(),
        };
        let title = submission.title.clone();

        match self.pipeline.submit(submission).await {
            Ok(report_id) => {
                let _ = self.store.append_event(
                    &state.agent_id,
                    AgentEvent::FindingSubmitted {
                        report_id: report_id.clone(),
                        title,
                    },
                );
                DispatchOutcome::ok(json!({
                    "report_id": report_id,
                    "status": "pending_verification",
                }))
            }
            Err(submit_error) => DispatchOutcome::error(submit_error.to_string()),
        }
    }

    fn adjudicate_finding(&self, state: &AgentState, invocation: &ToolInvocation) -> DispatchOutcome {
        let args = serde_json::Value::Object(invocation.args.clone());
        let Some(report_id) = args.get("report_id").and_then(|v| v.as_str()) else {
            return DispatchOutcome::error("verify_finding requires 'report_id'");
        };
        let decision = VerificationDecision {
            verified: args.get("verified").and_then(|v| v.as_bool()).unwrap_or(false),
            verification_evidence: args
                .get("verification_evidence")
                .and_then(|value| serde_json::from_value(value.clone()).ok()),
            rejection_reason: args
                .get("rejection_reason")
                .and_then(|v| v.as_str())
                .map(ToString::to_string),
            notes: Vec::new(),
        };

        match self.pipeline.adjudicate(report_id, decision, &state.agent_id) {
            Ok(outcome) => {
                let _ = self.store.append_event(
                    &state.agent_id,
                    AgentEvent::FindingAdjudicated {
                        report_id: report_id.to_string(),
                        verified: outcome == AdjudicationOutcome::Verified,
                        reason: match &outcome {
                            AdjudicationOutcome::Rejected(reason) => Some(format!("{reason:?}")),
                            _ => None,
                        },
                    },
                );
                DispatchOutcome::ok(
                    json!({ "report_id": report_id, "outcome": format!("{outcome:?}") }),
                )
            }
            Err(adjudication_error) => DispatchOutcome::error(adjudication_error.to_string()),
        }
    }
}

#[async_trait]
impl ToolDispatch for ScanSupervisor {
    async fn dispatch(&self, state: &AgentState, invocation: &ToolInvocation) -> DispatchOutcome {
        let Some(descriptor) = self.registry.lookup(&invocation.name) else {
            return DispatchOutcome::error(format!("Tool '{}' is not available", invocation.name));
        };

        match descriptor.handler {
            ToolHandler::Host(kind) => self.dispatch_host_tool(kind, state, invocation).await,
            ToolHandler::Sandbox => {
                let sandbox = self.sandbox.lock().await.clone();
                let Some(sandbox) = sandbox else {
                    return DispatchOutcome::error("sandbox_unavailable: no sandbox for this scan");
                };
                match self
                    .runtime
                    .execute(&sandbox, &state.agent_id, &invocation.name, &invocation.args)
                    .await
                {
                    Ok(result) => DispatchOutcome::ok(result),
                    Err(Error::SandboxTimeout(secs)) => {
                        // The wedged worker is abandoned; fork a fresh one
                        if let Err(restart_error) =
                            self.runtime.register_agent(&sandbox, &state.agent_id).await
                        {
                            warn!(agent_id = %state.agent_id, %restart_error, "Worker restart failed");
                        }
                        DispatchOutcome::error(format!(
                            "sandbox_timeout: tool call exceeded {secs} seconds and was abandoned"
                        ))
                    }
                    Err(exec_error) => DispatchOutcome::error(exec_error.to_string()),
                }
            }
        }
    }
}

#[async_trait]
impl VerifierSpawner for ScanSupervisor {
    async fn spawn_verifier(&self, report: &FindingReport) -> Result<String> {
        let this = self
            .strong()
            .ok_or_else(|| Error::Agent("Scan is shutting down".to_string()))?;

        let module = PromptLibrary::load().verification_module_for(&report.vulnerability_type);
        let task = build_verification_task(report);
        let name = format!("verifier-{}", report.id);

        this.spawn_agent(
            AgentKind::Verifier,
            &name,
            &task,
            Some(report.reporter_agent_id.clone()),
            vec![module],
            Some(report.id.clone()),
        )
        .await
    }
}

/// Render the verification task handed to a verifier agent, seeded with the
/// report's evidence.
pub fn build_verification_task(report: &FindingReport) -> String {
    let evidence = &report.evidence;

    let mut http_evidence = String::new();
    for (index, pair) in evidence.primary_evidence.iter().enumerate() {
        http_evidence.push_str(&format!(
            "### HTTP evidence #{}\n{} {} -> {}\nResponse snippet: {}\n",
            index + 1,
            pair.method,
            pair.url,
            pair.response_status,
            pair.response_body_snippet,
        ));
    }

    let mut steps = String::new();
    for step in &evidence.reproduction_steps {
        steps.push_str(&format!(
            "{}. {} (expected: {}, observed: {})\n",
            step.step_number, step.description, step.expected_result, step.actual_result,
        ));
    }

    format!(
        "<verification_task>\n\
         <report_id>{id}</report_id>\n\
         <title>{title}</title>\n\
         <claim>{claim}</claim>\n\n\
         <objective>\n\
         Independently verify this finding. Phase 1: reproduce the exact \
         reported behavior at least 3 consecutive times, logging each attempt. \
         Phase 2: design and run at least one independent control test that a \
         non-vulnerable system would also pass.\n\
         </objective>\n\n\
         <evidence>\n\
         Target: {target}\n\
         Parameter: {parameter}\n\
         Baseline state: {baseline}\n\
         Exploited state: {exploited}\n\n\
         PoC payload:\n{poc}\n\n\
         {http_evidence}\n\
         Reproduction steps:\n{steps}\
         </evidence>\n\n\
         <instructions>\n\
         Record your decision with verify_finding(report_id=\"{id}\", \
         verified=true/false). A verified decision requires \
         verification_evidence covering both phases; a rejection requires a \
         rejection_reason (non_reproducible or invalid_inference). Do not \
         create new reports and do not modify this one.\n\
         </instructions>\n\
         </verification_task>",
        id = report.id,
        title = report.title,
        claim = report.claim_assertion,
        target = evidence.target_url,
        parameter = evidence.affected_parameter.as_deref().unwrap_or("N/A"),
        baseline = evidence.baseline_state.as_deref().unwrap_or("N/A"),
        exploited = evidence.exploited_state.as_deref().unwrap_or("N/A"),
        poc = evidence.poc_payload,
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::verify::report::tests::sample_report;

    #[test]
    fn test_verification_task_includes_evidence_and_protocol() {
        let report = sample_report("vuln-0007");
        let task = build_verification_task(&report);

        assert!(task.contains("vuln-0007"));
        assert!(task.contains(&report.title));
        assert!(task.contains(&report.evidence.poc_payload));
        assert!(task.contains("at least 3 consecutive times"));
        assert!(task.contains("control test"));
        assert!(task.contains("verify_finding"));
    }
}
