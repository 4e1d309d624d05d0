// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::buffer::BufferCapture;
use crate::state::{AgentOutcome, EnforcementReason, Phase, RunnerStatus};

/// One recorded workflow-protocol violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementAttempt {
    pub round: u32,
    pub attempt: u32,
    pub reason: EnforcementReason,
    pub tool_calls: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// First 500 chars of the discarded streaming buffer.
    pub buffer_preview: String,
    pub buffer_chars: usize,
    pub timestamp: DateTime<Utc>,
}

/// Per-agent section of `status.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    pub status: RunnerStatus,
    pub enforcement_attempts: Vec<EnforcementAttempt>,
    /// Attempt counts keyed by round.
    pub by_round: BTreeMap<u32, u32>,
    pub unknown_tools: Vec<String>,
    pub workflow_errors: Vec<String>,
    pub total_enforcement_retries: u32,
    pub total_buffer_chars_lost: u64,
    pub outcome: AgentOutcome,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            status: RunnerStatus::Waiting,
            enforcement_attempts: Vec::new(),
            by_round: BTreeMap::new(),
            unknown_tools: Vec::new(),
            workflow_errors: Vec::new(),
            total_enforcement_retries: 0,
            total_buffer_chars_lost: 0,
            outcome: AgentOutcome::Ok,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostsSection {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultsSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
    /// Live vote counts per answer label.
    pub votes: BTreeMap<String, u32>,
    /// Submitted answers in order.  Carried so that a parent recovering a
    /// cancelled child run can extract content by label.
    pub answers: Vec<AnswerRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub label: String,
    pub agent_id: String,
    pub content: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationSection {
    pub phase: Phase,
    pub completion_percentage: u8,
    pub current_voting_round: u32,
}

impl Default for CoordinationSection {
    fn default() -> Self {
        Self {
            phase: Phase::InitialAnswer,
            completion_percentage: 0,
            current_voting_round: 0,
        }
    }
}

/// Entry in `historical_workspaces` (spec wire names are camelCase).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalWorkspace {
    pub agent_id: String,
    pub answer_label: String,
    pub timestamp: DateTime<Utc>,
    pub workspace_path: PathBuf,
}

/// The single authoritative status document for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusFile {
    pub coordination: CoordinationSection,
    pub agents: BTreeMap<String, AgentSection>,
    pub costs: CostsSection,
    pub results: ResultsSection,
    pub historical_workspaces: Vec<HistoricalWorkspace>,
}

pub fn phase_completion(phase: Phase) -> u8 {
    match phase {
        Phase::InitialAnswer => 25,
        Phase::Enforcement => 50,
        Phase::Presentation => 90,
        Phase::Done => 100,
        Phase::Failed => 100,
    }
}

/// Simplified view derived from the status file (what
/// `check_subagent_status` reports).  There is no second status file; this
/// is always computed from the one source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSummary {
    pub status: String,
    pub completion_percentage: u8,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
}

impl StatusFile {
    pub fn summary(&self) -> StatusSummary {
        let status = match self.coordination.phase {
            Phase::InitialAnswer | Phase::Enforcement => "running",
            Phase::Presentation => "presenting",
            Phase::Done => "completed",
            Phase::Failed => "failed",
        };
        StatusSummary {
            status: status.to_string(),
            completion_percentage: self.coordination.completion_percentage,
            total_input_tokens: self.costs.total_input_tokens,
            total_output_tokens: self.costs.total_output_tokens,
            winner: self.results.winner.clone(),
        }
    }
}

/// Serialized single-writer store for `status.json`.
///
/// Writes go through a temp file and an atomic rename, so readers observe
/// either the previous or the new complete document, never a partial one.
pub struct StatusStore {
    path: PathBuf,
    current: Mutex<StatusFile>,
}

impl StatusStore {
    /// Store rooted at `<run_log_dir>/full_logs/status.json`.
    pub fn new(run_log_dir: &Path) -> std::io::Result<Self> {
        let dir = run_log_dir.join("full_logs");
        fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join("status.json"),
            current: Mutex::new(StatusFile::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mutate the document and persist it atomically.
    ///
    /// Cost totals and retry counters only ever increase; this is asserted
    /// in tests rather than enforced here, because the mutation closure is
    /// trusted scheduler code.
    pub fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut StatusFile),
    {
        let mut current = self.current.lock().unwrap();
        mutate(&mut current);
        current.coordination.completion_percentage = phase_completion(current.coordination.phase);
        if let Err(e) = self.write_atomic(&current) {
            warn!(path = %self.path.display(), %e, "failed to persist status.json");
        }
    }

    pub fn snapshot(&self) -> StatusFile {
        self.current.lock().unwrap().clone()
    }

    fn write_atomic(&self, status: &StatusFile) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(status)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json)?;
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Record one enforcement attempt for an agent, keeping all the
    /// monotonic counters in sync.
    pub fn record_enforcement(
        &self,
        agent_id: &str,
        round: u32,
        reason: EnforcementReason,
        tool_calls: u32,
        error_message: Option<String>,
        buffer: &BufferCapture,
    ) {
        self.update(|s| {
            let agent = s.agents.entry(agent_id.to_string()).or_default();
            let attempt = agent.by_round.entry(round).or_insert(0);
            *attempt += 1;
            agent.enforcement_attempts.push(EnforcementAttempt {
                round,
                attempt: *attempt,
                reason,
                tool_calls,
                error_message,
                buffer_preview: buffer.preview.clone(),
                buffer_chars: buffer.chars,
                timestamp: Utc::now(),
            });
            agent.total_enforcement_retries += 1;
            agent.total_buffer_chars_lost += buffer.chars as u64;
        });
    }
}

/// Load and parse a `status.json` given its run log dir (used for subagent
/// recovery, which reads the child's store from outside).
pub fn read_status(run_log_dir: &Path) -> Option<StatusFile> {
    let path = run_log_dir.join("full_logs/status.json");
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
