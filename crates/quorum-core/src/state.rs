// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use quorum_workspace::SnapshotRef;

/// Coordination phases, in the order a healthy run moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    InitialAnswer,
    Enforcement,
    Presentation,
    Done,
    Failed,
}

/// Per-agent runtime status as exposed in `status.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Waiting,
    Streaming,
    SuspendedForInjection,
    AwaitingRestart,
    Voted,
    Won,
    Failed,
}

/// Whether an agent is still a compliant participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentOutcome {
    #[default]
    Ok,
    NonCompliant,
    Dropped,
}

/// Workflow-protocol violation reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementReason {
    NoWorkflowTool,
    NoToolCalls,
    InvalidVoteId,
    VoteNoAnswers,
    VoteAndAnswer,
    AnswerLimit,
    AnswerNovelty,
    AnswerDuplicate,
    UnknownTool,
}

impl EnforcementReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoWorkflowTool => "no_workflow_tool",
            Self::NoToolCalls => "no_tool_calls",
            Self::InvalidVoteId => "invalid_vote_id",
            Self::VoteNoAnswers => "vote_no_answers",
            Self::VoteAndAnswer => "vote_and_answer",
            Self::AnswerLimit => "answer_limit",
            Self::AnswerNovelty => "answer_novelty",
            Self::AnswerDuplicate => "answer_duplicate",
            Self::UnknownTool => "unknown_tool",
        }
    }
}

/// A submitted answer.  Append-only; superseded answers remain accessible
/// under their labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub label: String,
    pub agent_id: String,
    pub content: String,
    pub submitted_at: DateTime<Utc>,
    /// Insertion sequence; tie-break key after the timestamp.
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<SnapshotRef>,
}

/// A vote for an answer.  Votes from superseded rounds stay recorded with
/// `invalid = true` and are never counted for winner selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub voter: String,
    pub target: String,
    pub reason: String,
    pub round: u32,
    pub submitted_at: DateTime<Utc>,
    pub invalid: bool,
}

/// Fixed per-agent runtime record.
#[derive(Debug, Clone)]
pub struct AgentRuntime {
    pub agent_id: String,
    /// 1-based position in the configured agent list; `agent{index}` in
    /// answer labels.
    pub index: u32,
    pub status: RunnerStatus,
    pub submissions: u32,
    pub voted_round: Option<u32>,
    pub outcome: AgentOutcome,
    pub enforcement_retries: u32,
}

/// Why an answer or vote was rejected; always maps onto an enforcement
/// restart.
#[derive(Debug, Clone)]
pub struct WorkflowRejection {
    pub reason: EnforcementReason,
    pub message: String,
}

/// The authoritative coordination state.  Mutated exclusively by the
/// scheduler; runners communicate through events.
pub struct CoordinationState {
    pub phase: Phase,
    /// Increments on every answer submission; votes from prior rounds are
    /// invalidated (kept for history).
    pub voting_round: u32,
    pub winner: Option<String>,
    agents: Vec<AgentRuntime>,
    answers: Vec<Answer>,
    votes: Vec<Vote>,
    answer_limit: u32,
}

impl CoordinationState {
    pub fn new(agent_ids: &[String], answer_limit: u32) -> Self {
        let agents = agent_ids
            .iter()
            .enumerate()
            .map(|(i, id)| AgentRuntime {
                agent_id: id.clone(),
                index: (i + 1) as u32,
                status: RunnerStatus::Waiting,
                submissions: 0,
                voted_round: None,
                outcome: AgentOutcome::Ok,
                enforcement_retries: 0,
            })
            .collect();
        Self {
            phase: Phase::InitialAnswer,
            voting_round: 0,
            winner: None,
            agents,
            answers: Vec::new(),
            votes: Vec::new(),
            answer_limit,
        }
    }

    pub fn agents(&self) -> &[AgentRuntime] {
        &self.agents
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentRuntime> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }

    pub fn agent_mut(&mut self, agent_id: &str) -> Option<&mut AgentRuntime> {
        self.agents.iter_mut().find(|a| a.agent_id == agent_id)
    }

    pub fn answers(&self) -> &[Answer] {
        &self.answers
    }

    pub fn votes(&self) -> &[Vote] {
        &self.votes
    }

    pub fn answer_by_label(&self, label: &str) -> Option<&Answer> {
        self.answers.iter().find(|a| a.label == label)
    }

    /// All labels an agent may currently vote for.
    pub fn valid_labels(&self) -> Vec<String> {
        self.answers.iter().map(|a| a.label.clone()).collect()
    }

    /// The label the next submission from `agent_id` will receive.
    pub fn next_label(&self, agent_id: &str) -> Option<String> {
        let agent = self.agent(agent_id)?;
        Some(format!("agent{}.{}", agent.index, agent.submissions + 1))
    }

    /// Pre-flight validation of a `new_answer` without mutating state.
    ///
    /// The scheduler calls this before publishing the snapshot, so rejected
    /// submissions never leave a stray snapshot behind.
    pub fn validate_answer(&self, agent_id: &str, content: &str) -> Result<(), WorkflowRejection> {
        let agent = self.agent(agent_id).ok_or_else(|| WorkflowRejection {
            reason: EnforcementReason::NoWorkflowTool,
            message: format!("unknown agent {agent_id}"),
        })?;
        if agent.submissions >= self.answer_limit {
            return Err(WorkflowRejection {
                reason: EnforcementReason::AnswerLimit,
                message: format!(
                    "answer limit reached ({} submissions); vote for an existing answer instead",
                    self.answer_limit
                ),
            });
        }
        let previous_own = self
            .answers
            .iter()
            .filter(|a| a.agent_id == agent_id)
            .next_back();
        if previous_own.map(|a| a.content.as_str()) == Some(content) {
            return Err(WorkflowRejection {
                reason: EnforcementReason::AnswerDuplicate,
                message: "this answer is identical to your previous submission; \
                          refine it or vote for an existing answer"
                    .into(),
            });
        }
        if let Some(existing) = self
            .answers
            .iter()
            .filter(|a| a.agent_id != agent_id)
            .find(|a| a.content == content)
        {
            return Err(WorkflowRejection {
                reason: EnforcementReason::AnswerNovelty,
                message: format!(
                    "this answer is identical to {}; vote for it instead of resubmitting",
                    existing.label
                ),
            });
        }
        Ok(())
    }

    /// Record a new answer submission.
    ///
    /// Validates the per-agent submission limit, rejects a resubmission of
    /// the agent's own previous content (`answer_duplicate`) and content
    /// identical to another agent's live answer (`answer_novelty`).  On
    /// success the voting round increments and all prior votes are marked
    /// invalid; agents that already voted are expected to be re-queued by
    /// the caller.
    pub fn record_answer(
        &mut self,
        agent_id: &str,
        content: &str,
        snapshot: Option<SnapshotRef>,
    ) -> Result<Answer, WorkflowRejection> {
        self.validate_answer(agent_id, content)?;

        let agent = self.agent_mut(agent_id).ok_or_else(|| WorkflowRejection {
            reason: EnforcementReason::NoWorkflowTool,
            message: format!("unknown agent {agent_id}"),
        })?;
        agent.submissions += 1;
        let label = format!("agent{}.{}", agent.index, agent.submissions);

        // New answer: open a new voting round, invalidate all earlier votes.
        self.voting_round += 1;
        let round = self.voting_round;
        for vote in &mut self.votes {
            if vote.round < round {
                vote.invalid = true;
            }
        }
        for a in &mut self.agents {
            a.voted_round = None;
        }

        let answer = Answer {
            label,
            agent_id: agent_id.to_string(),
            content: content.to_string(),
            submitted_at: Utc::now(),
            seq: self.answers.len() as u64,
            snapshot,
        };
        self.answers.push(answer.clone());
        if self.phase == Phase::InitialAnswer {
            self.phase = Phase::Enforcement;
        }
        Ok(answer)
    }

    /// Record a vote in the current round.
    pub fn record_vote(
        &mut self,
        voter: &str,
        target: &str,
        reason: &str,
    ) -> Result<(), WorkflowRejection> {
        if self.answers.is_empty() {
            return Err(WorkflowRejection {
                reason: EnforcementReason::VoteNoAnswers,
                message: "no answers exist yet; submit one with new_answer".into(),
            });
        }
        if self.answer_by_label(target).is_none() {
            return Err(WorkflowRejection {
                reason: EnforcementReason::InvalidVoteId,
                message: format!(
                    "unknown answer label {target}; valid labels: {}",
                    self.valid_labels().join(", ")
                ),
            });
        }
        let round = self.voting_round;
        self.votes.push(Vote {
            voter: voter.to_string(),
            target: target.to_string(),
            reason: reason.to_string(),
            round,
            submitted_at: Utc::now(),
            invalid: false,
        });
        if let Some(agent) = self.agent_mut(voter) {
            agent.voted_round = Some(round);
            agent.status = RunnerStatus::Voted;
        }
        Ok(())
    }

    /// Live vote counts (current round, not invalidated) per answer label.
    pub fn live_vote_counts(&self) -> Vec<(String, u32)> {
        let mut counts: Vec<(String, u32)> = Vec::new();
        for vote in self
            .votes
            .iter()
            .filter(|v| !v.invalid && v.round == self.voting_round)
        {
            match counts.iter_mut().find(|(l, _)| l == &vote.target) {
                Some((_, n)) => *n += 1,
                None => counts.push((vote.target.clone(), 1)),
            }
        }
        counts
    }

    /// Consensus: at least one answer, and every agent has either voted in
    /// the current round or stopped participating.
    pub fn consensus_reached(&self) -> bool {
        !self.answers.is_empty()
            && self.agents.iter().all(|a| {
                a.voted_round == Some(self.voting_round)
                    || a.outcome != AgentOutcome::Ok
                    || a.status == RunnerStatus::Failed
            })
    }

    /// Winner by live votes; ties break to the earliest-submitted answer.
    /// Deterministic across runs given identical inputs.
    pub fn select_winner(&self) -> Option<&Answer> {
        let counts = self.live_vote_counts();
        let best = counts.iter().map(|(_, n)| *n).max()?;
        counts
            .iter()
            .filter(|(_, n)| *n == best)
            .filter_map(|(label, _)| self.answer_by_label(label))
            .min_by_key(|a| (a.submitted_at, a.seq))
    }

    /// Timeout recovery: live-vote winner, else the first-registered
    /// agent's earliest answer, else nothing.
    pub fn recovery_winner(&self) -> Option<&Answer> {
        if let Some(winner) = self.select_winner() {
            return Some(winner);
        }
        self.agents
            .iter()
            .filter_map(|agent| {
                self.answers
                    .iter()
                    .find(|a| a.agent_id == agent.agent_id)
            })
            .next()
    }

    /// Every participant (outcome Ok) has at least one answer.  Used by the
    /// deferred-voting mode to decide when the voting phase opens.
    pub fn all_participants_answered(&self) -> bool {
        self.agents
            .iter()
            .filter(|a| a.outcome == AgentOutcome::Ok && a.status != RunnerStatus::Failed)
            .all(|a| a.submissions > 0)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
