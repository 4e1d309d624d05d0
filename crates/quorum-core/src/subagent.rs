// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use quorum_tools::{Tool, ToolCall, ToolOutput};

use crate::state::Phase;
use crate::status::{read_status, StatusFile};

/// Outcome classification for a finished (or recovered) subagent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Completed,
    /// The child reached presentation before the timeout hit; its winner's
    /// answer was recovered.
    CompletedButTimeout,
    /// Partial work recovered from an interrupted enforcement phase.
    Partial,
    Timeout,
    Error,
}

impl SubagentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::CompletedButTimeout => "completed_but_timeout",
            Self::Partial => "partial",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

/// A completed/recovered subagent result, queued until the parent's next
/// tool boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSubagentResult {
    pub parent_agent_id: String,
    pub subagent_id: String,
    pub status: SubagentStatus,
    pub success: bool,
    pub answer: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub completion_percentage: Option<u8>,
    /// Always returned, so the parent can read artifacts even after a
    /// timeout.
    pub workspace_path: Option<PathBuf>,
    pub duration_secs: u64,
    pub warnings: Vec<String>,
}

/// Parent-scoped FIFO of finished subagents, drained by the
/// SubagentComplete hook.
#[derive(Clone, Default)]
pub struct SubagentQueue {
    inner: Arc<Mutex<VecDeque<PendingSubagentResult>>>,
}

impl SubagentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, result: PendingSubagentResult) {
        self.inner.lock().unwrap().push_back(result);
    }

    pub fn drain(&self) -> Vec<PendingSubagentResult> {
        self.inner.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

/// Runs one nested coordination session to completion.
///
/// The implementation owns the child's run directory, including its
/// `full_logs/status.json`; the recovery path reads that file when the
/// child is cancelled mid-flight.
#[async_trait]
pub trait SubagentSpawner: Send + Sync {
    async fn spawn(
        &self,
        subagent_id: &str,
        task: &str,
        context: &str,
        run_dir: &Path,
    ) -> anyhow::Result<String>;
}

/// One requested subagent task.
#[derive(Debug, Clone, Deserialize)]
pub struct SubagentTask {
    pub task: String,
    #[serde(default)]
    pub context: String,
    /// Requested timeout in seconds; clamped into the configured range.
    #[serde(default)]
    pub timeout: Option<u64>,
}

/// Spawns and supervises nested coordination sessions for one parent agent.
pub struct SubagentManager {
    parent_agent_id: String,
    spawner: Arc<dyn SubagentSpawner>,
    queue: SubagentQueue,
    semaphore: Arc<Semaphore>,
    runs_dir: PathBuf,
    min_timeout: Duration,
    max_timeout: Duration,
    default_timeout: Duration,
    counter: AtomicU32,
}

impl SubagentManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parent_agent_id: impl Into<String>,
        spawner: Arc<dyn SubagentSpawner>,
        runs_dir: PathBuf,
        max_background: usize,
        min_timeout_secs: u64,
        max_timeout_secs: u64,
        default_timeout_secs: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            parent_agent_id: parent_agent_id.into(),
            spawner,
            queue: SubagentQueue::new(),
            semaphore: Arc::new(Semaphore::new(max_background.max(1))),
            runs_dir,
            min_timeout: Duration::from_secs(min_timeout_secs),
            max_timeout: Duration::from_secs(max_timeout_secs),
            default_timeout: Duration::from_secs(default_timeout_secs),
            counter: AtomicU32::new(0),
        })
    }

    pub fn queue(&self) -> SubagentQueue {
        self.queue.clone()
    }

    /// Clamp a requested timeout into the configured `[min, max]` range.
    pub fn clamp_timeout(&self, requested: Option<u64>) -> Duration {
        match requested {
            None => self.default_timeout,
            Some(secs) => Duration::from_secs(secs)
                .max(self.min_timeout)
                .min(self.max_timeout),
        }
    }

    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-sub{}", self.parent_agent_id, n)
    }

    /// Blocking mode: run every task (bounded by the semaphore) and return
    /// all results in order.
    pub async fn run_blocking(self: &Arc<Self>, tasks: Vec<SubagentTask>) -> Vec<PendingSubagentResult> {
        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let mgr = Arc::clone(self);
            let id = self.next_id();
            handles.push(tokio::spawn(async move { mgr.run_one(id, task).await }));
        }
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(r) => results.push(r),
                Err(e) => warn!(%e, "subagent task panicked"),
            }
        }
        results
    }

    /// Async mode: spawn tasks in the background; completions land on the
    /// queue and reach the parent via the SubagentComplete hook.  Returns
    /// the assigned subagent ids immediately.
    ///
    /// Background subagents are not cancelled when the parent session
    /// completes; they finish orphaned with a logged warning.
    pub fn spawn_background(self: &Arc<Self>, tasks: Vec<SubagentTask>) -> Vec<String> {
        let mut ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            let id = self.next_id();
            ids.push(id.clone());
            let mgr = Arc::clone(self);
            tokio::spawn(async move {
                let result = mgr.run_one(id, task).await;
                mgr.queue.push(result);
            });
        }
        ids
    }

    async fn run_one(&self, subagent_id: String, task: SubagentTask) -> PendingSubagentResult {
        let _permit = self.semaphore.acquire().await;
        let timeout = self.clamp_timeout(task.timeout);
        let run_dir = self.runs_dir.join(&subagent_id);
        if let Err(e) = std::fs::create_dir_all(&run_dir) {
            return self.error_result(&subagent_id, &run_dir, 0, format!("mkdir: {e}"));
        }

        debug!(
            subagent_id,
            timeout_secs = timeout.as_secs(),
            "spawning subagent"
        );
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            timeout,
            self.spawner
                .spawn(&subagent_id, &task.task, &task.context, &run_dir),
        )
        .await;
        let duration_secs = started.elapsed().as_secs();

        match outcome {
            Ok(Ok(answer)) => {
                let status_file = read_status(&run_dir);
                let (input_tokens, output_tokens) = token_totals(status_file.as_ref());
                PendingSubagentResult {
                    parent_agent_id: self.parent_agent_id.clone(),
                    subagent_id,
                    status: SubagentStatus::Completed,
                    success: true,
                    answer: Some(answer),
                    input_tokens,
                    output_tokens,
                    completion_percentage: Some(100),
                    workspace_path: Some(run_dir),
                    duration_secs,
                    warnings: Vec::new(),
                }
            }
            Ok(Err(e)) => self.error_result(&subagent_id, &run_dir, duration_secs, format!("{e:#}")),
            Err(_elapsed) => {
                // Cancellation is a semantic event with potential partial
                // success; never discard the child's work unexamined.
                self.recover(&subagent_id, &run_dir, duration_secs)
            }
        }
    }

    fn error_result(
        &self,
        subagent_id: &str,
        run_dir: &Path,
        duration_secs: u64,
        error: String,
    ) -> PendingSubagentResult {
        PendingSubagentResult {
            parent_agent_id: self.parent_agent_id.clone(),
            subagent_id: subagent_id.to_string(),
            status: SubagentStatus::Error,
            success: false,
            answer: None,
            input_tokens: 0,
            output_tokens: 0,
            completion_percentage: None,
            workspace_path: Some(run_dir.to_path_buf()),
            duration_secs,
            warnings: vec![error],
        }
    }

    /// Workspace-based cancellation recovery (the child's `status.json` is
    /// the source of truth):
    /// 1. phase == presentation/done → winner's answer, `completed_but_timeout`
    /// 2. enforcement with answers → vote-logic selection, `partial`
    /// 3. answers but no votes → first registered agent's answer, `partial`
    /// 4. nothing → `timeout` with no answer
    fn recover(
        &self,
        subagent_id: &str,
        run_dir: &Path,
        duration_secs: u64,
    ) -> PendingSubagentResult {
        let status_file = match read_status(run_dir) {
            Some(s) => s,
            None => {
                return PendingSubagentResult {
                    parent_agent_id: self.parent_agent_id.clone(),
                    subagent_id: subagent_id.to_string(),
                    status: SubagentStatus::Timeout,
                    success: false,
                    answer: None,
                    input_tokens: 0,
                    output_tokens: 0,
                    completion_percentage: None,
                    workspace_path: Some(run_dir.to_path_buf()),
                    duration_secs,
                    warnings: vec!["no status.json found for recovery".into()],
                };
            }
        };

        let (status, answer, success, warning) = recover_outcome(&status_file);
        let (input_tokens, output_tokens) = token_totals(Some(&status_file));
        // A child caught at presentation had already finished the real
        // work; report it fully complete.
        let completion = if status == SubagentStatus::CompletedButTimeout {
            100
        } else {
            status_file.coordination.completion_percentage
        };
        PendingSubagentResult {
            parent_agent_id: self.parent_agent_id.clone(),
            subagent_id: subagent_id.to_string(),
            status,
            success,
            answer,
            input_tokens,
            output_tokens,
            completion_percentage: Some(completion),
            workspace_path: Some(run_dir.to_path_buf()),
            duration_secs,
            warnings: warning.into_iter().collect(),
        }
    }
}

fn token_totals(status: Option<&StatusFile>) -> (u64, u64) {
    status
        .map(|s| (s.costs.total_input_tokens, s.costs.total_output_tokens))
        .unwrap_or((0, 0))
}

/// Pure recovery classification over a child status file.
pub fn recover_outcome(
    status: &StatusFile,
) -> (SubagentStatus, Option<String>, bool, Option<String>) {
    let answers = &status.results.answers;
    let find = |label: &str| {
        answers
            .iter()
            .find(|a| a.label == label)
            .map(|a| a.content.clone())
    };

    match status.coordination.phase {
        Phase::Presentation | Phase::Done => {
            if let Some(answer) = status.results.winner.as_deref().and_then(find) {
                return (SubagentStatus::CompletedButTimeout, Some(answer), true, None);
            }
        }
        Phase::Enforcement | Phase::InitialAnswer | Phase::Failed => {}
    }

    if !answers.is_empty() {
        // Same selection logic as the scheduler: highest live vote count,
        // ties to the earliest submission.
        let voted = status
            .results
            .votes
            .iter()
            .max_by_key(|(label, count)| {
                let submitted = answers
                    .iter()
                    .find(|a| a.label == **label)
                    .map(|a| a.submitted_at);
                (**count, std::cmp::Reverse(submitted))
            })
            .and_then(|(label, _)| find(label));
        if let Some(answer) = voted {
            return (
                SubagentStatus::Partial,
                Some(answer),
                true,
                Some("recovered mid-enforcement via vote selection".into()),
            );
        }
        // No votes: the first registered agent's answer.  Registration
        // order is encoded in the label's agent index.
        let first = answers
            .iter()
            .min_by_key(|a| (parse_agent_index(&a.label), a.submitted_at))
            .map(|a| a.content.clone());
        return (
            SubagentStatus::Partial,
            first,
            true,
            Some("recovered first answer; no votes were cast".into()),
        );
    }

    (SubagentStatus::Timeout, None, false, None)
}

fn parse_agent_index(label: &str) -> u32 {
    label
        .strip_prefix("agent")
        .and_then(|rest| rest.split('.').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(u32::MAX)
}

/// Render finished subagents as one batched wrapper, minimizing cache
/// churn when several complete between two tool boundaries.
pub fn format_results(results: &[PendingSubagentResult]) -> String {
    let mut out = format!("<subagent_results count={}>\n", results.len());
    for r in results {
        out.push_str(&format!(
            "<subagent id=\"{}\" status=\"{}\" success=\"{}\" tokens=\"{}\" duration_s=\"{}\"{}>\n",
            r.subagent_id,
            r.status.as_str(),
            r.success,
            r.input_tokens + r.output_tokens,
            r.duration_secs,
            r.workspace_path
                .as_ref()
                .map(|p| format!(" workspace=\"{}\"", p.display()))
                .unwrap_or_default(),
        ));
        match &r.answer {
            Some(answer) => out.push_str(answer),
            None => out.push_str("(no answer recovered)"),
        }
        if !r.warnings.is_empty() {
            out.push_str(&format!("\n[warnings: {}]", r.warnings.join("; ")));
        }
        out.push_str("\n</subagent>\n");
    }
    out.push_str("</subagent_results>");
    out
}

/// Runs each subagent as a nested single-agent coordination in quick mode
/// (`skip_voting`): the child gets its own run directory, workspace tree,
/// and `status.json`, which is exactly what the recovery path reads back.
pub struct NestedCoordinationSpawner {
    backend_factory:
        Arc<dyn Fn(&str) -> Arc<dyn quorum_model::ChatBackend> + Send + Sync>,
}

impl NestedCoordinationSpawner {
    pub fn new(
        backend_factory: Arc<dyn Fn(&str) -> Arc<dyn quorum_model::ChatBackend> + Send + Sync>,
    ) -> Self {
        Self { backend_factory }
    }
}

#[async_trait]
impl SubagentSpawner for NestedCoordinationSpawner {
    async fn spawn(
        &self,
        subagent_id: &str,
        task: &str,
        context: &str,
        run_dir: &Path,
    ) -> anyhow::Result<String> {
        let mut config = quorum_config::Config {
            agents: vec![quorum_config::AgentEntry {
                id: subagent_id.to_string(),
                backend: "nested".into(),
                model: "nested".into(),
                api_key_env: None,
                hooks: Default::default(),
            }],
            ..quorum_config::Config::default()
        };
        config.orchestrator.coordination.skip_voting = true;

        let mut backends = std::collections::HashMap::new();
        backends.insert(subagent_id.to_string(), (self.backend_factory)(subagent_id));

        let prompt = if context.is_empty() {
            task.to_string()
        } else {
            format!("{context}\n\n{task}")
        };
        let scheduler = crate::scheduler::CoordinationScheduler::new(
            config,
            backends,
            run_dir.to_path_buf(),
        );
        let outcome = scheduler.run(&prompt).await?;
        outcome.final_answer.ok_or_else(|| {
            anyhow::anyhow!("nested coordination ended in phase {:?}", outcome.phase)
        })
    }
}

// ─── Tools ───────────────────────────────────────────────────────────────────

/// `spawn_subagents(tasks, async)`: delegate sub-tasks to nested
/// coordination sessions.
pub struct SpawnSubagentsTool {
    manager: Arc<SubagentManager>,
    async_enabled: bool,
}

impl SpawnSubagentsTool {
    pub fn new(manager: Arc<SubagentManager>, async_enabled: bool) -> Self {
        Self {
            manager,
            async_enabled,
        }
    }
}

#[async_trait]
impl Tool for SpawnSubagentsTool {
    fn name(&self) -> &str {
        "spawn_subagents"
    }

    fn description(&self) -> &str {
        "Spawn nested coordination sessions for delimited sub-tasks. \
         Blocking mode waits for all tasks; async mode returns immediately \
         and results are injected at a later tool boundary."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "tasks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "task": { "type": "string" },
                            "context": { "type": "string" },
                            "timeout": { "type": "integer", "description": "Seconds; clamped to configured bounds" }
                        },
                        "required": ["task"]
                    }
                },
                "async": { "type": "boolean", "description": "Return immediately (default false)" }
            },
            "required": ["tasks"],
            "additionalProperties": false
        })
    }

    fn side_effecting(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let tasks: Vec<SubagentTask> = match call
            .args
            .get("tasks")
            .cloned()
            .map(serde_json::from_value)
        {
            Some(Ok(tasks)) => tasks,
            Some(Err(e)) => return ToolOutput::err(&call.id, format!("invalid tasks: {e}")),
            None => return ToolOutput::err(&call.id, "missing required parameter 'tasks'"),
        };
        if tasks.is_empty() {
            return ToolOutput::err(&call.id, "tasks must not be empty");
        }
        let run_async = call
            .args
            .get("async")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if run_async {
            if !self.async_enabled {
                return ToolOutput::err(&call.id, "async subagents are disabled by configuration");
            }
            let ids = self.manager.spawn_background(tasks);
            ToolOutput::ok(
                &call.id,
                format!(
                    "spawned {} background subagents: {}. Results will be \
                     injected when they complete; check_subagent_status can \
                     poll them by id.",
                    ids.len(),
                    ids.join(", ")
                ),
            )
        } else {
            let results = self.manager.run_blocking(tasks).await;
            ToolOutput::ok(&call.id, format_results(&results))
        }
    }
}

/// `check_subagent_status(subagent_id)`: derived view over the child's
/// `status.json`, the single source of truth.  No second status file.
pub struct CheckSubagentStatusTool {
    runs_dir: PathBuf,
}

impl CheckSubagentStatusTool {
    pub fn new(runs_dir: PathBuf) -> Self {
        Self { runs_dir }
    }
}

#[async_trait]
impl Tool for CheckSubagentStatusTool {
    fn name(&self) -> &str {
        "check_subagent_status"
    }

    fn description(&self) -> &str {
        "Check a running or finished subagent by id. Reports phase-derived \
         status, token usage, and completion percentage."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "subagent_id": { "type": "string" }
            },
            "required": ["subagent_id"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let id = match call.args.get("subagent_id").and_then(|v| v.as_str()) {
            Some(id) => id,
            None => return ToolOutput::err(&call.id, "missing required parameter 'subagent_id'"),
        };
        match read_status(&self.runs_dir.join(id)) {
            Some(status) => {
                let summary = status.summary();
                ToolOutput::ok(
                    &call.id,
                    serde_json::to_string_pretty(&summary)
                        .unwrap_or_else(|e| format!("status serialization failed: {e}")),
                )
            }
            None => ToolOutput::err(&call.id, format!("no status found for subagent {id}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
