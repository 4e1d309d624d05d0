// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use quorum_config::{AgentEntry, Config, CoordinationOptions, SubagentInjectionStrategy};
use quorum_hooks::{HookEventKind, HookRegistry, InjectionStrategy, RegisteredHook};
use quorum_model::ChatBackend;
use quorum_tools::builtin::{DeleteFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use quorum_tools::{ToolPipeline, ToolRegistry};
use quorum_workspace::{ExecutionTrace, MtimeIndex, Workspace, WorkspaceManager, WriteReport};

use crate::events::{Directive, InjectionQueue, PeerUpdate, RunnerEvent, RunnerMessage, RunnerViolation};
use crate::hooks::{HighPriorityTaskReminderHook, MidStreamInjectionHook, SubagentCompleteHook};
use crate::runner::AgentRunner;
use crate::state::{
    AgentOutcome, CoordinationState, EnforcementReason, Phase, RunnerStatus, WorkflowRejection,
};
use crate::status::{AnswerRecord, HistoricalWorkspace, StatusStore};
use crate::subagent::{CheckSubagentStatusTool, SpawnSubagentsTool, SubagentManager, SubagentSpawner};
use crate::buffer::BufferCapture;

/// Result of one coordination run.
#[derive(Debug)]
pub struct CoordinationOutcome {
    pub phase: Phase,
    pub winner_label: Option<String>,
    pub final_label: Option<String>,
    pub final_answer: Option<String>,
    pub status_path: PathBuf,
}

/// Scheduler-side handle to one spawned runner.
struct AgentHandle {
    display: String,
    injections: InjectionQueue,
    workspace: Arc<Mutex<Workspace>>,
    /// Cached at spawn time; the root never moves.
    workspace_root: PathBuf,
    /// Cached at spawn time; context mounts are fixed for the run.
    writable_roots: Vec<PathBuf>,
    trace: Arc<Mutex<ExecutionTrace>>,
    pipeline: Arc<ToolPipeline>,
    join: JoinHandle<()>,
}

/// Runs N agent runners in parallel and owns the authoritative
/// [`CoordinationState`].
///
/// All state mutation happens in the single event loop; runners enqueue
/// events and block on per-event reply channels, which doubles as the
/// parking mechanism (a runner waiting for consensus simply waits on its
/// reply).  In-flight backend calls are never aborted: peer answers are
/// delivered at safe boundaries (inject-and-continue).
pub struct CoordinationScheduler {
    config: Config,
    backends: HashMap<String, Arc<dyn ChatBackend>>,
    run_dir: PathBuf,
    subagent_spawner: Option<Arc<dyn SubagentSpawner>>,
}

impl CoordinationScheduler {
    pub fn new(
        config: Config,
        backends: HashMap<String, Arc<dyn ChatBackend>>,
        run_dir: PathBuf,
    ) -> Self {
        Self {
            config,
            backends,
            run_dir,
            subagent_spawner: None,
        }
    }

    /// Enable `spawn_subagents` / `check_subagent_status` for all agents.
    pub fn with_subagent_spawner(mut self, spawner: Arc<dyn SubagentSpawner>) -> Self {
        self.subagent_spawner = Some(spawner);
        self
    }

    /// Run one coordination over `task` to completion.
    pub async fn run(&self, task: &str) -> anyhow::Result<CoordinationOutcome> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let session_stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S").to_string();
        let options = self.config.orchestrator.coordination.clone();
        let agents_cfg = self.config.agents.clone();
        let multi_agent = agents_cfg.len() > 1;
        let skip_voting = options.skip_voting && !multi_agent;
        if options.skip_voting && multi_agent {
            warn!("skip_voting is only meaningful for single-agent runs; ignoring");
        }

        let manager = WorkspaceManager::new(&self.run_dir, self.config.context_paths.clone())?;
        let status = Arc::new(StatusStore::new(&self.run_dir)?);
        let (events_tx, events_rx) = mpsc::channel::<RunnerMessage>(256);

        // One shared hook registry: config hooks plus the per-agent
        // built-ins (mid-stream injection, reminders, subagent completion).
        let agent_hook_cfgs: Vec<(String, quorum_config::HooksConfig)> = agents_cfg
            .iter()
            .map(|a| (a.id.clone(), a.hooks.clone()))
            .collect();
        let mut hook_registry = HookRegistry::from_config(&self.config.hooks, &agent_hook_cfgs);

        let mut handles: HashMap<String, AgentHandle> = HashMap::new();
        let mut queues: HashMap<String, InjectionQueue> = HashMap::new();

        // Built-ins must be registered before the registry is frozen into
        // the pipelines.
        hook_registry.register_global(RegisteredHook::new(
            HookEventKind::PostToolUse,
            None,
            Arc::new(HighPriorityTaskReminderHook),
            None,
        ));
        for agent in &agents_cfg {
            let queue = InjectionQueue::new();
            queues.insert(agent.id.clone(), queue.clone());
            hook_registry.register_for_agent(
                &agent.id,
                RegisteredHook::new(
                    HookEventKind::PostToolUse,
                    None,
                    Arc::new(MidStreamInjectionHook::new(queue)),
                    None,
                ),
            );
        }

        // Subagent managers are per-parent (separate queues and id spaces).
        let mut subagent_managers: HashMap<String, Arc<SubagentManager>> = HashMap::new();
        if let Some(spawner) = &self.subagent_spawner {
            for agent in &agents_cfg {
                let mgr = SubagentManager::new(
                    agent.id.clone(),
                    spawner.clone(),
                    self.run_dir.join("subagents").join(&agent.id),
                    options.async_subagents.max_background,
                    options.subagent_min_timeout,
                    options.subagent_max_timeout,
                    options.subagent_default_timeout,
                );
                let strategy = match options.async_subagents.injection_strategy {
                    SubagentInjectionStrategy::ToolResult => InjectionStrategy::ToolResult,
                    SubagentInjectionStrategy::UserMessage => InjectionStrategy::UserMessage,
                };
                hook_registry.register_for_agent(
                    &agent.id,
                    RegisteredHook::new(
                        HookEventKind::PostToolUse,
                        None,
                        Arc::new(SubagentCompleteHook::new(mgr.queue(), strategy)),
                        None,
                    ),
                );
                subagent_managers.insert(agent.id.clone(), mgr);
            }
        }
        let hook_registry = Arc::new(hook_registry);

        // Spawn one runner per agent.
        let mut quick_mode_mtime: Option<MtimeIndex> = None;
        for agent in &agents_cfg {
            let backend = self
                .backends
                .get(&agent.id)
                .ok_or_else(|| anyhow::anyhow!("no backend registered for agent {}", agent.id))?
                .clone();
            let mut workspace = manager.create_workspace(&agent.id)?;
            // Quick mode: a single agent with voting disabled gets write
            // access from the start instead of at a presentation boundary.
            let writable_roots = workspace.writable_context_roots();
            if skip_voting {
                workspace.enable_write_access();
                if !writable_roots.is_empty() {
                    quick_mode_mtime = Some(MtimeIndex::capture(&writable_roots));
                }
            }
            let workspace_root = workspace.root.clone();
            let workspace = Arc::new(Mutex::new(workspace));

            let mut registry = ToolRegistry::new(!skip_voting);
            registry.register_custom(ReadFileTool::new(workspace.clone()));
            registry.register_custom(WriteFileTool::new(workspace.clone()));
            registry.register_custom(DeleteFileTool::new(workspace.clone()));
            registry.register_custom(ListDirTool::new(workspace.clone()));
            if let Some(mgr) = subagent_managers.get(&agent.id) {
                registry.register_custom(SpawnSubagentsTool::new(
                    mgr.clone(),
                    options.async_subagents.enabled,
                ));
                registry.register_custom(CheckSubagentStatusTool::new(
                    self.run_dir.join("subagents").join(&agent.id),
                ));
            }

            let pipeline = Arc::new(ToolPipeline::new(
                Arc::new(registry),
                hook_registry.clone(),
                session_id.clone(),
                Duration::from_secs(options.tool_timeout),
                options.enable_planning_mode,
            ));

            let trace = Arc::new(Mutex::new(ExecutionTrace::new()));
            let injections = queues.get(&agent.id).cloned().unwrap_or_default();
            let runner = AgentRunner::new(
                &agent.id,
                agent.display_name(),
                backend,
                pipeline.clone(),
                workspace_root.clone(),
                trace.clone(),
                injections.clone(),
                events_tx.clone(),
            );
            let prompt = task.to_string();
            let join = tokio::spawn(runner.run(prompt));
            handles.insert(
                agent.id.clone(),
                AgentHandle {
                    display: agent.display_name(),
                    injections,
                    workspace,
                    workspace_root,
                    writable_roots,
                    trace,
                    pipeline,
                    join,
                },
            );
        }
        drop(events_tx);

        let agent_ids: Vec<String> = agents_cfg.iter().map(|a| a.id.clone()).collect();
        let state = CoordinationState::new(&agent_ids, options.answer_limit);
        status.update(|s| {
            s.coordination.phase = Phase::InitialAnswer;
            for id in &agent_ids {
                s.agents.entry(id.clone()).or_default();
            }
        });

        let mut run = EventLoop {
            options,
            agents_cfg,
            multi_agent,
            skip_voting,
            costs_input_rate: self.config.costs.input_per_1k,
            costs_output_rate: self.config.costs.output_per_1k,
            state,
            status: status.clone(),
            manager,
            handles,
            parked: HashMap::new(),
            presentation_mtime: quick_mode_mtime,
            session_stamp,
            final_label: None,
            final_answer: None,
            finished: false,
        };

        run.drive(events_rx).await;

        // Tear down whatever is still streaming; parked runners exit when
        // their reply channels drop with `run`.
        for handle in run.handles.values() {
            handle.join.abort();
        }

        let outcome = CoordinationOutcome {
            phase: run.state.phase,
            winner_label: run.state.winner.clone(),
            final_label: run.final_label.clone(),
            final_answer: run.final_answer.clone(),
            status_path: status.path().to_path_buf(),
        };
        info!(
            phase = ?outcome.phase,
            winner = outcome.winner_label.as_deref().unwrap_or("-"),
            "coordination finished"
        );
        Ok(outcome)
    }
}

struct EventLoop {
    options: CoordinationOptions,
    agents_cfg: Vec<AgentEntry>,
    multi_agent: bool,
    skip_voting: bool,
    costs_input_rate: f64,
    costs_output_rate: f64,
    state: CoordinationState,
    status: Arc<StatusStore>,
    manager: WorkspaceManager,
    handles: HashMap<String, AgentHandle>,
    /// Runners blocked on their reply channel, keyed by agent id.
    parked: HashMap<String, oneshot::Sender<Directive>>,
    presentation_mtime: Option<MtimeIndex>,
    session_stamp: String,
    final_label: Option<String>,
    final_answer: Option<String>,
    finished: bool,
}

impl EventLoop {
    async fn drive(&mut self, mut events: mpsc::Receiver<RunnerMessage>) {
        let deadline = self
            .options
            .coordination_timeout
            .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

        while !self.finished {
            let message = match deadline {
                Some(at) => match tokio::time::timeout_at(at, events.recv()).await {
                    Ok(m) => m,
                    Err(_elapsed) => {
                        self.recover_from_timeout().await;
                        break;
                    }
                },
                None => events.recv().await,
            };
            let Some(message) = message else {
                // All runners gone without a conclusion.
                if !self.finished {
                    self.fail("all agent runners exited");
                }
                break;
            };
            self.handle(message).await;
        }
    }

    async fn handle(&mut self, message: RunnerMessage) {
        let RunnerMessage {
            agent_id,
            event,
            reply,
        } = message;
        match event {
            RunnerEvent::Usage {
                input_tokens,
                output_tokens,
            } => {
                let cost = (input_tokens as f64 / 1000.0) * self.costs_input_rate
                    + (output_tokens as f64 / 1000.0) * self.costs_output_rate;
                self.status.update(|s| {
                    s.costs.total_input_tokens += input_tokens;
                    s.costs.total_output_tokens += output_tokens;
                    s.costs.estimated_cost += cost;
                });
            }
            RunnerEvent::WorkflowShapeError { message } => {
                self.status.update(|s| {
                    s.agents
                        .entry(agent_id.clone())
                        .or_default()
                        .workflow_errors
                        .push(message);
                });
            }
            RunnerEvent::Failed { error } => {
                warn!(%agent_id, %error, "agent runner failed");
                if let Some(agent) = self.state.agent_mut(&agent_id) {
                    agent.status = RunnerStatus::Failed;
                }
                self.status.update(|s| {
                    s.agents.entry(agent_id.clone()).or_default().status = RunnerStatus::Failed;
                });
                if let Some(reply) = reply {
                    let _ = reply.send(Directive::Stop);
                }
                self.reevaluate().await;
            }
            RunnerEvent::AnswerSubmitted {
                content,
                tool_calls,
                buffer,
            } => {
                let Some(reply) = reply else { return };
                self.on_answer(agent_id, content, tool_calls, buffer, reply)
                    .await;
            }
            RunnerEvent::VoteSubmitted {
                target,
                reason,
                tool_calls,
                buffer,
            } => {
                let Some(reply) = reply else { return };
                self.on_vote(agent_id, target, reason, tool_calls, buffer, reply)
                    .await;
            }
            RunnerEvent::ProtocolViolation {
                violation,
                tool_calls,
                buffer,
            } => {
                let Some(reply) = reply else { return };
                let (reason, detail) = match violation {
                    RunnerViolation::NoToolCalls => (EnforcementReason::NoToolCalls, None),
                    RunnerViolation::NoWorkflowTool => (EnforcementReason::NoWorkflowTool, None),
                    RunnerViolation::VoteAndAnswer => (EnforcementReason::VoteAndAnswer, None),
                    RunnerViolation::UnknownTool(name) => {
                        self.status.update(|s| {
                            s.agents
                                .entry(agent_id.clone())
                                .or_default()
                                .unknown_tools
                                .push(name.clone());
                        });
                        (EnforcementReason::UnknownTool, Some(name))
                    }
                };
                self.enforce(agent_id, reason, detail, tool_calls, buffer, reply)
                    .await;
            }
            RunnerEvent::FinalAnswer { content } => {
                self.on_final_answer(agent_id, content, reply).await;
            }
        }
    }

    // ── Answers ──────────────────────────────────────────────────────────

    async fn on_answer(
        &mut self,
        agent_id: String,
        content: String,
        tool_calls: u32,
        buffer: BufferCapture,
        reply: oneshot::Sender<Directive>,
    ) {
        if matches!(self.state.phase, Phase::Presentation | Phase::Done | Phase::Failed) {
            let _ = reply.send(Directive::Stop);
            return;
        }

        // Validate before snapshotting so a rejected submission leaves no
        // stray snapshot behind.
        if let Err(rejection) = self.state.validate_answer(&agent_id, &content) {
            self.reject_workflow(agent_id, rejection, tool_calls, buffer, reply)
                .await;
            return;
        }

        // Atomic snapshot at answer-submission time; peers only see the
        // answer after the snapshot is published.
        let label = self.state.next_label(&agent_id).unwrap_or_default();
        let handle = &self.handles[&agent_id];
        let trace_md = handle.trace.lock().await.render_markdown();
        let workspace_root = handle.workspace_root.clone();
        let snapshot = match self
            .manager
            .snapshots()
            .publish(&agent_id, &label, &workspace_root, &trace_md)
        {
            Ok(snap) => snap,
            Err(e) => {
                warn!(%agent_id, %e, "snapshot failed; aborting new_answer");
                let _ = reply.send(Directive::Chat {
                    inject: vec![],
                    note: Some(format!(
                        "Your answer could not be recorded (workspace snapshot \
                         failed: {e}). Submit it again with new_answer."
                    )),
                    final_presentation: false,
                });
                return;
            }
        };

        let answer = match self
            .state
            .record_answer(&agent_id, &content, Some(snapshot.clone()))
        {
            Ok(a) => a,
            Err(rejection) => {
                // validate_answer passed, so this is unreachable in
                // practice; treat it like any workflow rejection.
                self.reject_workflow(agent_id, rejection, tool_calls, buffer, reply)
                    .await;
                return;
            }
        };
        info!(%agent_id, label = %answer.label, round = self.state.voting_round, "answer recorded");

        {
            let mut trace = handle.trace.lock().await;
            let submissions = self.state.agent(&agent_id).map(|a| a.submissions).unwrap_or(0);
            trace.begin_round(submissions);
        }

        let round = self.state.voting_round;
        let vote_counts = self.state.live_vote_counts();
        self.status.update(|s| {
            s.coordination.phase = Phase::Enforcement;
            s.coordination.current_voting_round = round;
            s.results.votes = vote_counts.iter().cloned().collect();
            s.results.answers.push(AnswerRecord {
                label: answer.label.clone(),
                agent_id: answer.agent_id.clone(),
                content: answer.content.clone(),
                submitted_at: answer.submitted_at,
            });
            s.historical_workspaces.push(HistoricalWorkspace {
                agent_id: agent_id.clone(),
                answer_label: answer.label.clone(),
                timestamp: snapshot.timestamp,
                workspace_path: snapshot.snapshot_path.clone(),
            });
        });

        // Quick mode: the sole answer wins outright.
        if self.skip_voting {
            self.state.winner = Some(answer.label.clone());
            self.status.update(|s| s.results.winner = Some(answer.label.clone()));
            self.parked.insert(agent_id.clone(), reply);
            self.begin_presentation().await;
            return;
        }

        if !self.options.defer_voting_until_all_answered {
            self.distribute_update(&agent_id, &answer.label, &answer.content, &snapshot.snapshot_path);
        }

        if self.options.defer_voting_until_all_answered && !self.state.all_participants_answered() {
            // Hold the submitter until everyone has an answer; avoids
            // wasteful restarts in injection-disabled runs.
            if let Some(agent) = self.state.agent_mut(&agent_id) {
                agent.status = RunnerStatus::SuspendedForInjection;
            }
            self.parked.insert(agent_id, reply);
            return;
        }
        if self.options.defer_voting_until_all_answered {
            // Last answer arrived: open the voting phase for everyone.
            self.parked.insert(agent_id, reply);
            self.release_all_for_voting();
            return;
        }

        let _ = reply.send(Directive::Chat {
            inject: vec![],
            note: Some(format!(
                "Your answer was recorded as {label}. Current answers: {labels}. \
                 Review your peers' snapshots, then either refine with \
                 new_answer or vote for the best answer.",
                label = answer.label,
                labels = self.state.valid_labels().join(", ")
            )),
            final_presentation: false,
        });
    }

    /// Queue a peer answer for every other live runner.  Parked runners are
    /// woken with the update in their directive; streaming runners get it
    /// at their next safe boundary (mid-stream hook or next backend call).
    fn distribute_update(&mut self, from: &str, label: &str, content: &str, snapshot: &std::path::Path) {
        if self.options.disable_injection {
            // Updates still reach parked runners (their turn is over), just
            // never a live stream.
            self.wake_parked_with_update(from, label, content, snapshot);
            return;
        }
        let update = PeerUpdate {
            label: label.to_string(),
            agent_display: self
                .handles
                .get(from)
                .map(|h| h.display.clone())
                .unwrap_or_else(|| from.to_string()),
            content: content.to_string(),
            snapshot_path: Some(snapshot.to_path_buf()),
        };
        let parked_ids: Vec<String> = self.parked.keys().cloned().collect();
        for agent in &self.agents_cfg {
            if agent.id == from || !self.is_participant(&agent.id) {
                continue;
            }
            if parked_ids.contains(&agent.id) {
                if let Some(reply) = self.parked.remove(&agent.id) {
                    let _ = reply.send(Directive::Chat {
                        inject: vec![update.render()],
                        note: Some(format!(
                            "Voting round {round} is open. You must act again: \
                             vote for the best answer or refine yours. \
                             Valid labels: {labels}.",
                            round = self.state.voting_round,
                            labels = self.state.valid_labels().join(", ")
                        )),
                        final_presentation: false,
                    });
                }
            } else if let Some(handle) = self.handles.get(&agent.id) {
                handle.injections.push(update.clone());
            }
        }
    }

    fn wake_parked_with_update(&mut self, from: &str, label: &str, content: &str, snapshot: &std::path::Path) {
        let update = PeerUpdate {
            label: label.to_string(),
            agent_display: self
                .handles
                .get(from)
                .map(|h| h.display.clone())
                .unwrap_or_else(|| from.to_string()),
            content: content.to_string(),
            snapshot_path: Some(snapshot.to_path_buf()),
        };
        let parked_ids: Vec<String> = self.parked.keys().cloned().collect();
        for id in parked_ids {
            if id == from {
                continue;
            }
            if let Some(reply) = self.parked.remove(&id) {
                let _ = reply.send(Directive::Chat {
                    inject: vec![update.render()],
                    note: Some(format!(
                        "Voting round {round} is open. Vote for the best answer \
                         or refine yours. Valid labels: {labels}.",
                        round = self.state.voting_round,
                        labels = self.state.valid_labels().join(", ")
                    )),
                    final_presentation: false,
                });
            }
        }
    }

    /// Deferred-voting release: every parked runner gets the full answer
    /// list and a voting instruction.
    fn release_all_for_voting(&mut self) {
        let answers: Vec<(String, String, String)> = self
            .state
            .answers()
            .iter()
            .map(|a| (a.label.clone(), a.agent_id.clone(), a.content.clone()))
            .collect();
        let labels = self.state.valid_labels().join(", ");
        let parked_ids: Vec<String> = self.parked.keys().cloned().collect();
        for id in parked_ids {
            if let Some(reply) = self.parked.remove(&id) {
                let inject: Vec<String> = answers
                    .iter()
                    .filter(|(_, agent, _)| agent != &id)
                    .map(|(label, agent, content)| {
                        let display = self
                            .handles
                            .get(agent)
                            .map(|h| h.display.clone())
                            .unwrap_or_else(|| agent.clone());
                        PeerUpdate {
                            label: label.clone(),
                            agent_display: display,
                            content: content.clone(),
                            snapshot_path: None,
                        }
                        .render()
                    })
                    .collect();
                let _ = reply.send(Directive::Chat {
                    inject,
                    note: Some(format!(
                        "All agents have now submitted. Vote for the best \
                         answer or refine yours. Valid labels: {labels}."
                    )),
                    final_presentation: false,
                });
            }
        }
    }

    // ── Votes ────────────────────────────────────────────────────────────

    async fn on_vote(
        &mut self,
        agent_id: String,
        target: String,
        reason: String,
        tool_calls: u32,
        buffer: BufferCapture,
        reply: oneshot::Sender<Directive>,
    ) {
        if matches!(self.state.phase, Phase::Presentation | Phase::Done | Phase::Failed) {
            let _ = reply.send(Directive::Stop);
            return;
        }
        match self.state.record_vote(&agent_id, &target, &reason) {
            Err(rejection) => {
                self.reject_workflow(agent_id, rejection, tool_calls, buffer, reply)
                    .await;
            }
            Ok(()) => {
                info!(%agent_id, %target, round = self.state.voting_round, "vote recorded");
                let vote_counts = self.state.live_vote_counts();
                let round = self.state.voting_round;
                self.status.update(|s| {
                    s.coordination.current_voting_round = round;
                    s.results.votes = vote_counts.iter().cloned().collect();
                    s.agents.entry(agent_id.clone()).or_default().status = RunnerStatus::Voted;
                });
                self.parked.insert(agent_id, reply);
                if self.state.consensus_reached() {
                    self.begin_presentation().await;
                }
            }
        }
    }

    // ── Enforcement ──────────────────────────────────────────────────────

    async fn reject_workflow(
        &mut self,
        agent_id: String,
        rejection: WorkflowRejection,
        tool_calls: u32,
        buffer: BufferCapture,
        reply: oneshot::Sender<Directive>,
    ) {
        self.enforce(
            agent_id,
            rejection.reason,
            Some(rejection.message),
            tool_calls,
            buffer,
            reply,
        )
        .await;
    }

    /// Record an enforcement event, capture the buffer, and either restart
    /// the agent's turn (bounded) or drop it as non-compliant.
    async fn enforce(
        &mut self,
        agent_id: String,
        reason: EnforcementReason,
        detail: Option<String>,
        tool_calls: u32,
        buffer: BufferCapture,
        reply: oneshot::Sender<Directive>,
    ) {
        let round = self.state.voting_round.max(1);
        self.status.record_enforcement(
            &agent_id,
            round,
            reason,
            tool_calls,
            detail.clone(),
            &buffer,
        );

        let max = self.options.max_enforcement_retries;
        let retries = {
            let Some(agent) = self.state.agent_mut(&agent_id) else {
                let _ = reply.send(Directive::Stop);
                return;
            };
            agent.enforcement_retries += 1;
            agent.status = RunnerStatus::AwaitingRestart;
            agent.enforcement_retries
        };
        self.status.update(|s| {
            s.agents.entry(agent_id.clone()).or_default().status = RunnerStatus::AwaitingRestart;
        });

        if retries > max {
            info!(%agent_id, retries, "agent exceeded enforcement retries; dropping");
            if let Some(agent) = self.state.agent_mut(&agent_id) {
                agent.outcome = AgentOutcome::NonCompliant;
            }
            self.status.update(|s| {
                s.agents.entry(agent_id.clone()).or_default().outcome =
                    AgentOutcome::NonCompliant;
            });
            let _ = reply.send(Directive::Stop);
            self.reevaluate().await;
            return;
        }

        let note = retry_message(reason, retries, max, detail.as_deref(), &self.state);
        debug!(%agent_id, reason = reason.as_str(), retries, "enforcement restart");
        let _ = reply.send(Directive::Chat {
            inject: vec![],
            note: Some(note),
            final_presentation: false,
        });
    }

    /// After a failure or drop, consensus and deferred-release conditions
    /// may have become true without any new vote arriving.
    async fn reevaluate(&mut self) {
        if self.finished {
            return;
        }
        if self.options.defer_voting_until_all_answered
            && self.state.all_participants_answered()
            && !self.state.answers().is_empty()
            && !self.parked.is_empty()
        {
            self.release_all_for_voting();
        }
        if self.state.consensus_reached() {
            self.begin_presentation().await;
        } else if self.all_runners_gone() {
            self.recover_from_timeout().await;
        }
    }

    fn all_runners_gone(&self) -> bool {
        self.state.agents().iter().all(|a| {
            a.status == RunnerStatus::Failed || a.outcome != AgentOutcome::Ok
        })
    }

    fn is_participant(&self, agent_id: &str) -> bool {
        self.state
            .agent(agent_id)
            .map(|a| a.outcome == AgentOutcome::Ok && a.status != RunnerStatus::Failed)
            .unwrap_or(false)
    }

    // ── Presentation & completion ────────────────────────────────────────

    async fn begin_presentation(&mut self) {
        if self.finished || self.state.phase == Phase::Presentation {
            return;
        }
        let Some(winner) = self
            .state
            .select_winner()
            .map(|a| (a.agent_id.clone(), a.label.clone(), a.content.clone()))
            .or_else(|| {
                // Quick mode arrives here with the winner pre-set.
                self.state.winner.as_ref().and_then(|label| {
                    self.state
                        .answer_by_label(label)
                        .map(|a| (a.agent_id.clone(), a.label.clone(), a.content.clone()))
                })
            })
        else {
            self.fail("consensus reported but no winner selectable");
            return;
        };
        let (winner_id, winner_label, winner_content) = winner;
        self.state.winner = Some(winner_label.clone());
        if let Some(agent) = self.state.agent_mut(&winner_id) {
            agent.status = RunnerStatus::Won;
        }
        let counts = self.state.live_vote_counts();
        self.status.update(|s| {
            s.results.winner = Some(winner_label.clone());
            s.results.votes = counts.iter().cloned().collect();
            s.agents.entry(winner_id.clone()).or_default().status = RunnerStatus::Won;
        });
        info!(winner = %winner_label, "consensus reached");

        // Stop every non-winner.
        let parked_ids: Vec<String> = self.parked.keys().cloned().collect();
        for id in parked_ids {
            if id != winner_id {
                if let Some(reply) = self.parked.remove(&id) {
                    let _ = reply.send(Directive::Stop);
                }
            }
        }

        let writable_roots = self.handles[&winner_id].writable_roots.clone();
        let skip = self.options.skip_final_presentation
            || (writable_roots.is_empty()
                && self.multi_agent
                && self.options.disable_injection)
            || !self.parked.contains_key(&winner_id);

        if skip {
            if let Some(reply) = self.parked.remove(&winner_id) {
                let _ = reply.send(Directive::Stop);
            }
            self.complete(&winner_id, &winner_label, winner_content, None)
                .await;
            return;
        }

        // Open the write window and take the tracking index (quick mode
        // captured it at run start, when write access was first enabled).
        // Planning-mode restrictions also lift here: deferred side effects
        // run for real, but only for the winner.
        {
            let mut ws = self.handles[&winner_id].workspace.lock().await;
            ws.enable_write_access();
        }
        self.handles[&winner_id].pipeline.set_planning_mode(false);
        if self.presentation_mtime.is_none() && !writable_roots.is_empty() {
            self.presentation_mtime = Some(MtimeIndex::capture(&writable_roots));
        }
        self.state.phase = Phase::Presentation;
        self.status.update(|s| {
            s.coordination.phase = Phase::Presentation;
        });

        let write_note = if writable_roots.is_empty() {
            String::new()
        } else {
            format!(
                "\nWrite access is now enabled for: {}.",
                writable_roots
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        match self.parked.remove(&winner_id) {
            Some(reply) => {
                let _ = reply.send(Directive::Chat {
                    inject: vec![],
                    note: Some(format!(
                        "Your answer {winner_label} won the vote. Produce the \
                         final, presentation-quality answer now; finish in plain \
                         text or with one last new_answer call.{write_note}"
                    )),
                    final_presentation: true,
                });
            }
            None => {
                // The winner runner is gone; fall back to its recorded answer.
                self.complete(&winner_id, &winner_label, winner_content, None)
                    .await;
            }
        }
    }

    async fn on_final_answer(
        &mut self,
        agent_id: String,
        content: String,
        reply: Option<oneshot::Sender<Directive>>,
    ) {
        if let Some(reply) = reply {
            let _ = reply.send(Directive::Stop);
        }
        if self.finished {
            return;
        }
        let winner_label = match &self.state.winner {
            Some(l) => l.clone(),
            None => {
                self.fail("final answer without a winner");
                return;
            }
        };

        // Write-diff report for the write window.
        let report = self.presentation_mtime.take().map(|before| {
            let roots = self.handles[&agent_id].writable_roots.clone();
            let after = MtimeIndex::capture(&roots);
            WriteReport::new(before.diff_against(&after))
        });

        self.complete(&agent_id, &winner_label, content, report)
            .await;
    }

    /// Common completion path: label the final answer, attach the write
    /// report, publish the final snapshot, flip the phase to done.
    async fn complete(
        &mut self,
        winner_id: &str,
        winner_label: &str,
        content: String,
        report: Option<WriteReport>,
    ) {
        let index = self
            .state
            .agent(winner_id)
            .map(|a| a.index)
            .unwrap_or(0);
        let final_label = format!("agent{index}.final");

        let mut final_answer = content;
        if let Some(report) = report {
            let (summary, side) = report.render_for_answer("final_write_report.md");
            if let Some(side_content) = side {
                let side_path = self.manager.run_dir().join("final_write_report.md");
                if let Err(e) = std::fs::write(&side_path, side_content) {
                    warn!(%e, "could not write final write report");
                }
            }
            final_answer.push_str("\n\n");
            final_answer.push_str(&summary);
        }

        // Final snapshot carries the presentation-time workspace.
        if let Some(handle) = self.handles.get(winner_id) {
            let trace_md = handle.trace.lock().await.render_markdown();
            if let Err(e) = self.manager.snapshots().publish(
                winner_id,
                &final_label,
                &handle.workspace_root,
                &trace_md,
            ) {
                warn!(%e, "final snapshot failed; continuing with completion");
            }
        }

        // Persist the turn artifact under the session layout.
        match self.manager.session_turn_dir(&self.session_stamp, 1) {
            Ok(turn_dir) => {
                if let Err(e) = std::fs::write(turn_dir.join("final_answer.md"), &final_answer) {
                    warn!(%e, "could not persist final answer artifact");
                }
            }
            Err(e) => warn!(%e, "could not create session turn dir"),
        }

        self.state.phase = Phase::Done;
        self.final_label = Some(final_label.clone());
        self.final_answer = Some(final_answer.clone());
        self.finished = true;
        let winner_label = winner_label.to_string();
        let winner_id = winner_id.to_string();
        self.status.update(|s| {
            s.coordination.phase = Phase::Done;
            s.results.winner = Some(winner_label.clone());
            s.results.answers.push(AnswerRecord {
                label: final_label,
                agent_id: winner_id,
                content: final_answer,
                submitted_at: chrono::Utc::now(),
            });
        });
    }

    /// Overall-timeout recovery: never lose completed work.
    async fn recover_from_timeout(&mut self) {
        if self.finished {
            return;
        }
        match self
            .state
            .recovery_winner()
            .map(|a| (a.agent_id.clone(), a.label.clone(), a.content.clone()))
        {
            Some((agent_id, label, content)) => {
                warn!(winner = %label, "coordination timed out; selecting recovery winner");
                self.state.winner = Some(label.clone());
                self.complete(&agent_id, &label, content, None).await;
            }
            None => self.fail("coordination timed out with no answers"),
        }
    }

    fn fail(&mut self, why: &str) {
        warn!(why, "coordination failed");
        self.state.phase = Phase::Failed;
        self.finished = true;
        self.status.update(|s| {
            s.coordination.phase = Phase::Failed;
        });
    }
}

/// Enforcement restart message, including the retry budget and the
/// reason-specific guidance.
fn retry_message(
    reason: EnforcementReason,
    attempt: u32,
    max: u32,
    detail: Option<&str>,
    state: &CoordinationState,
) -> String {
    let specific = match reason {
        EnforcementReason::NoToolCalls => {
            "You produced no tool calls. Required: vote or new_answer".to_string()
        }
        EnforcementReason::NoWorkflowTool => {
            "You called tools but never finished the turn. Required: vote or new_answer"
                .to_string()
        }
        EnforcementReason::UnknownTool => format!(
            "Called {} (not workflow). Required: vote or new_answer",
            detail.unwrap_or("an unknown tool")
        ),
        EnforcementReason::VoteAndAnswer => {
            "You called both vote and new_answer in one response; call exactly one".to_string()
        }
        EnforcementReason::InvalidVoteId
        | EnforcementReason::VoteNoAnswers
        | EnforcementReason::AnswerLimit
        | EnforcementReason::AnswerNovelty
        | EnforcementReason::AnswerDuplicate => detail
            .map(|d| d.to_string())
            .unwrap_or_else(|| reason.as_str().to_string()),
    };
    let labels = state.valid_labels();
    let label_note = if labels.is_empty() {
        String::new()
    } else {
        format!(" Valid answer labels: {}.", labels.join(", "))
    };
    format!("Retry ({attempt}/{max}): {specific}.{label_note}")
}
