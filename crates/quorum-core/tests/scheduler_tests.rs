// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end coordination scenarios driven by scripted backends.
//!
//! Interleaving-sensitive scenarios use a gate in front of each scripted
//! backend: the test releases one permit per backend call after observing
//! the run's `status.json`, which pins the answer/vote/injection ordering
//! deterministically.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use quorum_config::{AgentEntry, Config, CoordinationOptions};
use quorum_core::{read_status, CoordinationScheduler, EnforcementReason, Phase, StatusFile};
use quorum_model::{ChatBackend, ChunkStream, CompletionRequest, ScriptedBackend, StreamEvent};

/// Scripted backend whose calls each consume one gate permit first.
struct GatedBackend {
    inner: ScriptedBackend,
    gate: Arc<Semaphore>,
}

impl GatedBackend {
    fn new(scripts: Vec<Vec<StreamEvent>>) -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (
            Arc::new(Self {
                inner: ScriptedBackend::new(scripts),
                gate: gate.clone(),
            }),
            gate,
        )
    }
}

#[async_trait]
impl ChatBackend for GatedBackend {
    fn name(&self) -> &str {
        "gated"
    }
    fn model_name(&self) -> &str {
        "gated-model"
    }
    async fn stream_chat(&self, req: CompletionRequest) -> anyhow::Result<ChunkStream> {
        let permit = self.gate.acquire().await?;
        permit.forget();
        self.inner.stream_chat(req).await
    }
}

fn agent_entry(id: &str) -> AgentEntry {
    AgentEntry {
        id: id.into(),
        backend: "scripted".into(),
        model: "scripted-model".into(),
        api_key_env: None,
        hooks: Default::default(),
    }
}

fn config(ids: &[&str], tune: impl FnOnce(&mut CoordinationOptions)) -> Config {
    let mut cfg = Config {
        agents: ids.iter().map(|id| agent_entry(id)).collect(),
        ..Config::default()
    };
    tune(&mut cfg.orchestrator.coordination);
    cfg
}

fn answer_turn(content: &str) -> Vec<StreamEvent> {
    ScriptedBackend::tool_turn("c-ans", "new_answer", json!({"content": content}).to_string())
}

fn vote_turn(target: &str, reason: &str) -> Vec<StreamEvent> {
    ScriptedBackend::tool_turn(
        "c-vote",
        "vote",
        json!({"target": target, "reason": reason}).to_string(),
    )
}

/// Poll `status.json` until `pred` holds (5s budget).
async fn wait_for(run_dir: &Path, pred: impl Fn(&StatusFile) -> bool) {
    for _ in 0..500 {
        if let Some(status) = read_status(run_dir) {
            if pred(&status) {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("status condition not reached within 5s");
}

// ── Scenario: two agents, no refinement needed ───────────────────────────────

#[tokio::test]
async fn two_agents_converge_on_first_answer() {
    let dir = tempfile::tempdir().unwrap();
    let (a1, g1) = GatedBackend::new(vec![
        answer_turn("the answer is 42"),
        vote_turn("agent1.1", "self"),
        ScriptedBackend::text_turn("Final: the answer is 42"),
    ]);
    let (a2, g2) = GatedBackend::new(vec![vote_turn("agent1.1", "correct")]);

    let mut backends: HashMap<String, Arc<dyn ChatBackend>> = HashMap::new();
    backends.insert("a1".into(), a1);
    backends.insert("a2".into(), a2);
    let scheduler =
        CoordinationScheduler::new(config(&["a1", "a2"], |_| {}), backends, dir.path().into());

    let run_dir = dir.path().to_path_buf();
    let run = tokio::spawn(async move { scheduler.run("what is 6 * 7?").await });

    // A1 submits first.
    g1.add_permits(1);
    wait_for(&run_dir, |s| {
        s.results.answers.iter().any(|a| a.label == "agent1.1")
    })
    .await;

    // A2 (mid-wait) now votes for the injected answer.
    g2.add_permits(1);
    wait_for(&run_dir, |s| s.results.votes.get("agent1.1") == Some(&1)).await;

    // Enforcement requires A1 to vote too; it votes for itself, then
    // presents.
    g1.add_permits(2);

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.phase, Phase::Done);
    assert_eq!(outcome.winner_label.as_deref(), Some("agent1.1"));
    assert_eq!(outcome.final_label.as_deref(), Some("agent1.final"));
    assert_eq!(
        outcome.final_answer.as_deref(),
        Some("Final: the answer is 42")
    );

    let status = read_status(&run_dir).unwrap();
    assert_eq!(status.coordination.phase, Phase::Done);
    assert_eq!(status.coordination.current_voting_round, 1);
    assert_eq!(status.results.votes.get("agent1.1"), Some(&2));
    assert_eq!(status.results.winner.as_deref(), Some("agent1.1"));
}

// ── Scenario: refinement round resets votes ──────────────────────────────────

#[tokio::test]
async fn refinement_invalidates_votes_and_requeues_voters() {
    let dir = tempfile::tempdir().unwrap();
    let (a1, g1) = GatedBackend::new(vec![
        answer_turn("first draft"),
        vote_turn("agent1.1", "self"),
        vote_turn("agent2.1", "better than mine"),
    ]);
    let (a2, g2) = GatedBackend::new(vec![
        answer_turn("a sharper answer"),
        vote_turn("agent2.1", "self"),
        ScriptedBackend::text_turn("Final: a sharper answer"),
    ]);

    let mut backends: HashMap<String, Arc<dyn ChatBackend>> = HashMap::new();
    backends.insert("a1".into(), a1);
    backends.insert("a2".into(), a2);
    let scheduler =
        CoordinationScheduler::new(config(&["a1", "a2"], |_| {}), backends, dir.path().into());

    let run_dir = dir.path().to_path_buf();
    let run = tokio::spawn(async move { scheduler.run("task").await });

    // A1 answers, then votes for itself in round 1.
    g1.add_permits(1);
    wait_for(&run_dir, |s| !s.results.answers.is_empty()).await;
    g1.add_permits(1);
    wait_for(&run_dir, |s| s.results.votes.get("agent1.1") == Some(&1)).await;

    // A2 submits a refinement: round 2 opens, the old vote is invalidated
    // and A1 is re-queued for action.
    g2.add_permits(1);
    wait_for(&run_dir, |s| s.coordination.current_voting_round == 2).await;
    let mid = read_status(&run_dir).unwrap();
    assert!(
        mid.results.votes.is_empty(),
        "round-1 votes must not be live after a new answer"
    );

    // Both agents vote for agent2.1; A2 then presents.
    g1.add_permits(1);
    g2.add_permits(2);

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.winner_label.as_deref(), Some("agent2.1"));
    assert_eq!(outcome.final_label.as_deref(), Some("agent2.final"));

    let status = read_status(&run_dir).unwrap();
    assert_eq!(status.results.votes.get("agent2.1"), Some(&2));
    assert_eq!(status.coordination.current_voting_round, 2);
}

// ── Scenario: enforcement restart on a text-only turn ────────────────────────

#[tokio::test]
async fn text_only_turn_is_restarted_and_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn ChatBackend> = Arc::new(ScriptedBackend::new(vec![
        ScriptedBackend::text_turn("I think the answer is probably 42, let me explain at length"),
        answer_turn("42"),
        vote_turn("agent1.1", "done refining"),
        ScriptedBackend::text_turn("Final: 42"),
    ]));
    let mut backends = HashMap::new();
    backends.insert("a1".to_string(), backend);
    let scheduler =
        CoordinationScheduler::new(config(&["a1"], |_| {}), backends, dir.path().into());

    let outcome = scheduler.run("task").await.unwrap();
    assert_eq!(outcome.phase, Phase::Done);
    assert_eq!(outcome.winner_label.as_deref(), Some("agent1.1"));

    let status = read_status(dir.path()).unwrap();
    let agent = &status.agents["a1"];
    assert_eq!(agent.total_enforcement_retries, 1);
    let attempt = &agent.enforcement_attempts[0];
    assert_eq!(attempt.reason, EnforcementReason::NoToolCalls);
    assert_eq!(attempt.round, 1);
    assert_eq!(attempt.attempt, 1);
    assert!(attempt.buffer_chars > 0, "discarded buffer must be measured");
    assert!(attempt.buffer_preview.contains("probably 42"));
    assert!(agent.total_buffer_chars_lost > 0);
}

// ── Scenario: unknown tool ───────────────────────────────────────────────────

#[tokio::test]
async fn unknown_tool_triggers_enforcement_with_retry_message() {
    let dir = tempfile::tempdir().unwrap();
    let scripted = Arc::new(ScriptedBackend::new(vec![
        ScriptedBackend::tool_turn("c1", "execute_command", json!({"cmd": "ls"}).to_string()),
        answer_turn("42"),
        vote_turn("agent1.1", "done"),
        ScriptedBackend::text_turn("Final: 42"),
    ]));
    let requests = scripted.requests.clone();
    let mut backends: HashMap<String, Arc<dyn ChatBackend>> = HashMap::new();
    backends.insert("a1".to_string(), scripted);
    let scheduler =
        CoordinationScheduler::new(config(&["a1"], |_| {}), backends, dir.path().into());

    let outcome = scheduler.run("task").await.unwrap();
    assert_eq!(outcome.phase, Phase::Done);

    let status = read_status(dir.path()).unwrap();
    let agent = &status.agents["a1"];
    assert_eq!(agent.enforcement_attempts[0].reason, EnforcementReason::UnknownTool);
    assert_eq!(agent.unknown_tools, vec!["execute_command".to_string()]);

    // The restart message carries the retry budget and the required tools.
    let retry_note = requests
        .lock()
        .unwrap()
        .iter()
        .flat_map(|r| r.messages.clone())
        .filter_map(|m| m.as_text().map(str::to_string))
        .find(|t| t.starts_with("Retry (1/3)"))
        .expect("retry message must be sent to the backend");
    assert!(retry_note.contains("execute_command (not workflow)"));
    assert!(retry_note.contains("vote or new_answer"));
}

// ── Scenario: invalid vote id ────────────────────────────────────────────────

#[tokio::test]
async fn invalid_vote_id_lists_valid_labels() {
    let dir = tempfile::tempdir().unwrap();
    let scripted = Arc::new(ScriptedBackend::new(vec![
        answer_turn("my answer"),
        vote_turn("agent5.1", "sounds right"),
        vote_turn("agent1.1", "corrected"),
        ScriptedBackend::text_turn("Final: my answer"),
    ]));
    let requests = scripted.requests.clone();
    let mut backends: HashMap<String, Arc<dyn ChatBackend>> = HashMap::new();
    backends.insert("a1".to_string(), scripted);
    let scheduler =
        CoordinationScheduler::new(config(&["a1"], |_| {}), backends, dir.path().into());

    let outcome = scheduler.run("task").await.unwrap();
    assert_eq!(outcome.winner_label.as_deref(), Some("agent1.1"));

    let status = read_status(dir.path()).unwrap();
    let agent = &status.agents["a1"];
    assert_eq!(
        agent.enforcement_attempts[0].reason,
        EnforcementReason::InvalidVoteId
    );

    let retry_note = requests
        .lock()
        .unwrap()
        .iter()
        .flat_map(|r| r.messages.clone())
        .filter_map(|m| m.as_text().map(str::to_string))
        .find(|t| t.starts_with("Retry (1/3)"))
        .expect("retry message must be sent");
    assert!(retry_note.contains("agent5.1"));
    assert!(retry_note.contains("agent1.1"), "{retry_note}");
}

// ── Quick mode: skip_voting single agent ─────────────────────────────────────

#[tokio::test]
async fn skip_voting_single_agent_wins_without_vote_tool() {
    let dir = tempfile::tempdir().unwrap();
    let scripted = Arc::new(ScriptedBackend::new(vec![
        answer_turn("only answer"),
        ScriptedBackend::text_turn("Final: only answer"),
    ]));
    let requests = scripted.requests.clone();
    let mut backends: HashMap<String, Arc<dyn ChatBackend>> = HashMap::new();
    backends.insert("solo".to_string(), scripted);
    let scheduler = CoordinationScheduler::new(
        config(&["solo"], |c| c.skip_voting = true),
        backends,
        dir.path().into(),
    );

    let outcome = scheduler.run("task").await.unwrap();
    assert_eq!(outcome.phase, Phase::Done);
    assert_eq!(outcome.winner_label.as_deref(), Some("agent1.1"));
    assert_eq!(outcome.final_answer.as_deref(), Some("Final: only answer"));

    // The vote tool is never injected in quick mode.
    let saw_vote_schema = requests
        .lock()
        .unwrap()
        .iter()
        .any(|r| r.tools.iter().any(|t| t.name == "vote"));
    assert!(!saw_vote_schema);
}

// ── Overall timeout recovery ─────────────────────────────────────────────────

#[tokio::test]
async fn timeout_selects_first_registered_answer_when_no_votes() {
    let dir = tempfile::tempdir().unwrap();
    let (a1, g1) = GatedBackend::new(vec![answer_turn("rescued answer")]);
    // A2 never gets a permit: it stalls mid-"thinking" forever.
    let (a2, _g2) = GatedBackend::new(vec![vote_turn("agent1.1", "never sent")]);

    let mut backends: HashMap<String, Arc<dyn ChatBackend>> = HashMap::new();
    backends.insert("a1".into(), a1);
    backends.insert("a2".into(), a2);
    let scheduler = CoordinationScheduler::new(
        config(&["a1", "a2"], |c| c.coordination_timeout = Some(1)),
        backends,
        dir.path().into(),
    );

    let run_dir = dir.path().to_path_buf();
    let run = tokio::spawn(async move { scheduler.run("task").await });
    g1.add_permits(1);
    wait_for(&run_dir, |s| !s.results.answers.is_empty()).await;

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.phase, Phase::Done, "completed work is never lost");
    assert_eq!(outcome.winner_label.as_deref(), Some("agent1.1"));
    assert_eq!(outcome.final_answer.as_deref(), Some("rescued answer"));
}

// ── Timeout with no answers fails ────────────────────────────────────────────

#[tokio::test]
async fn timeout_without_answers_fails_with_preserved_status() {
    let dir = tempfile::tempdir().unwrap();
    let (a1, _g1) = GatedBackend::new(vec![answer_turn("never released")]);
    let mut backends: HashMap<String, Arc<dyn ChatBackend>> = HashMap::new();
    backends.insert("a1".into(), a1);
    let scheduler = CoordinationScheduler::new(
        config(&["a1"], |c| c.coordination_timeout = Some(1)),
        backends,
        dir.path().into(),
    );

    let outcome = scheduler.run("task").await.unwrap();
    assert_eq!(outcome.phase, Phase::Failed);
    assert!(outcome.final_answer.is_none());
    // status.json survives for forensics.
    let status = read_status(dir.path()).unwrap();
    assert_eq!(status.coordination.phase, Phase::Failed);
}

// ── Snapshot atomicity across a full run ─────────────────────────────────────

#[tokio::test]
async fn every_published_snapshot_contains_the_trace() {
    let dir = tempfile::tempdir().unwrap();
    let backend: Arc<dyn ChatBackend> = Arc::new(ScriptedBackend::new(vec![
        answer_turn("v1"),
        answer_turn("v2"),
        vote_turn("agent1.2", "refined enough"),
        ScriptedBackend::text_turn("Final: v2"),
    ]));
    let mut backends = HashMap::new();
    backends.insert("a1".to_string(), backend);
    let scheduler =
        CoordinationScheduler::new(config(&["a1"], |_| {}), backends, dir.path().into());

    let outcome = scheduler.run("task").await.unwrap();
    assert_eq!(outcome.winner_label.as_deref(), Some("agent1.2"));

    let status = read_status(dir.path()).unwrap();
    assert_eq!(status.historical_workspaces.len(), 2);
    let labels: Vec<&str> = status
        .historical_workspaces
        .iter()
        .map(|w| w.answer_label.as_str())
        .collect();
    assert_eq!(labels, vec!["agent1.1", "agent1.2"]);
    for entry in &status.historical_workspaces {
        assert!(
            entry.workspace_path.join("execution_trace.md").exists(),
            "snapshot {} must be fully populated",
            entry.workspace_path.display()
        );
    }
}

// ── Forced-injection race: vote for an answer delivered mid-round ────────────

#[tokio::test]
async fn vote_racing_a_new_answer_is_either_valid_or_enforced() {
    // A2's vote targets agent1.2, which only exists after A1's refinement.
    // With the gate we force the submission to land first, so the vote is
    // valid even though it was delivered via injection in the same round.
    let dir = tempfile::tempdir().unwrap();
    let (a1, g1) = GatedBackend::new(vec![
        answer_turn("v1"),
        answer_turn("v2"),
        vote_turn("agent1.2", "self"),
        ScriptedBackend::text_turn("Final: v2"),
    ]);
    let (a2, g2) = GatedBackend::new(vec![vote_turn("agent1.2", "the refinement is right")]);

    let mut backends: HashMap<String, Arc<dyn ChatBackend>> = HashMap::new();
    backends.insert("a1".into(), a1);
    backends.insert("a2".into(), a2);
    let scheduler =
        CoordinationScheduler::new(config(&["a1", "a2"], |_| {}), backends, dir.path().into());

    let run_dir = dir.path().to_path_buf();
    let run = tokio::spawn(async move { scheduler.run("task").await });

    g1.add_permits(2);
    wait_for(&run_dir, |s| {
        s.results.answers.iter().any(|a| a.label == "agent1.2")
    })
    .await;
    g2.add_permits(1);
    wait_for(&run_dir, |s| s.results.votes.get("agent1.2") == Some(&1)).await;
    g1.add_permits(2);

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.winner_label.as_deref(), Some("agent1.2"));
    let status = read_status(&run_dir).unwrap();
    assert_eq!(status.results.votes.get("agent1.2"), Some(&2));
    // No enforcement was needed on this interleaving.
    assert_eq!(status.agents["a2"].total_enforcement_retries, 0);
}
