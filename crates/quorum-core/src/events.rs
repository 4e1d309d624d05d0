// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::buffer::BufferCapture;

/// A peer answer delivered into a live agent's context.
#[derive(Debug, Clone)]
pub struct PeerUpdate {
    pub label: String,
    pub agent_display: String,
    pub content: String,
    pub snapshot_path: Option<PathBuf>,
}

impl PeerUpdate {
    /// Rendered UPDATE payload, identical whether it arrives via the
    /// mid-stream hook, a conversation-boundary message, or a wake-up
    /// directive.
    pub fn render(&self) -> String {
        let snapshot_note = self
            .snapshot_path
            .as_ref()
            .map(|p| format!("\nWorkspace snapshot (read-only): {}", p.display()))
            .unwrap_or_default();
        format!(
            "UPDATE: {} submitted answer {}.{snapshot_note}\n---\n{}\n---\n\
             Consider this when continuing. You must still finish with \
             new_answer or vote.",
            self.agent_display, self.label, self.content
        )
    }
}

/// Per-agent queue of pending peer updates, shared between the scheduler
/// (producer), the mid-stream injection hook, and the runner's
/// conversation-boundary drain (consumers).  Whoever reaches a safe
/// boundary first delivers the update.
#[derive(Clone, Default)]
pub struct InjectionQueue {
    inner: Arc<Mutex<VecDeque<PeerUpdate>>>,
}

impl InjectionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, update: PeerUpdate) {
        self.inner.lock().unwrap().push_back(update);
    }

    pub fn drain(&self) -> Vec<PeerUpdate> {
        self.inner.lock().unwrap().drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

/// Protocol violations the runner itself can detect.  The scheduler maps
/// them onto enforcement reason codes (it adds the ones only it can see:
/// invalid vote ids, duplicate answers, limits).
#[derive(Debug, Clone)]
pub enum RunnerViolation {
    /// The turn ended with plain text and no tool calls at all.
    NoToolCalls,
    /// Tools were called, but the turn ended without a workflow tool.
    NoWorkflowTool,
    /// A tool name resolved to nothing; carries the offending name.
    UnknownTool(String),
    /// More than one workflow tool in a single response.
    VoteAndAnswer,
}

/// Terminal outcome of one runner turn, reported to the scheduler.
#[derive(Debug)]
pub enum RunnerEvent {
    AnswerSubmitted {
        content: String,
        tool_calls: u32,
        buffer: BufferCapture,
    },
    VoteSubmitted {
        target: String,
        reason: String,
        tool_calls: u32,
        buffer: BufferCapture,
    },
    /// The turn ended without a valid workflow call.
    ProtocolViolation {
        violation: RunnerViolation,
        tool_calls: u32,
        buffer: BufferCapture,
    },
    /// Final-presentation turn produced the closing answer text.
    FinalAnswer { content: String },
    /// Fire-and-forget token usage (no reply expected).
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
    /// Fire-and-forget: a workflow tool was called with malformed
    /// arguments and the error was fed back inline.
    WorkflowShapeError { message: String },
    /// The runner hit an unrecoverable error.
    Failed { error: String },
}

/// Envelope from a runner to the scheduler.  Turn-terminal events carry a
/// reply channel; the runner blocks on it until the scheduler decides what
/// happens next (this is how runners park without busy-waiting).
pub struct RunnerMessage {
    pub agent_id: String,
    pub event: RunnerEvent,
    pub reply: Option<oneshot::Sender<Directive>>,
}

/// What the scheduler tells a runner to do next.
#[derive(Debug)]
pub enum Directive {
    /// Run another turn.  `inject` entries are appended to the conversation
    /// as UPDATE user messages first; `note` carries retry/instruction text.
    Chat {
        inject: Vec<String>,
        note: Option<String>,
        /// This turn is the winner's final presentation: a plain-text end
        /// of turn is the final answer, no workflow tool required.
        final_presentation: bool,
    },
    /// Terminate the runner.
    Stop,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injection_queue_is_fifo() {
        let q = InjectionQueue::new();
        for label in ["agent1.1", "agent2.1"] {
            q.push(PeerUpdate {
                label: label.into(),
                agent_display: "x (m)".into(),
                content: "c".into(),
                snapshot_path: None,
            });
        }
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].label, "agent1.1");
        assert!(q.is_empty());
    }

    #[test]
    fn peer_update_render_names_label_and_snapshot() {
        let u = PeerUpdate {
            label: "agent2.3".into(),
            agent_display: "beta (gpt-x)".into(),
            content: "the refined answer".into(),
            snapshot_path: Some(PathBuf::from("/run/snapshots/beta_1")),
        };
        let text = u.render();
        assert!(text.contains("agent2.3"));
        assert!(text.contains("beta (gpt-x)"));
        assert!(text.contains("/run/snapshots/beta_1"));
        assert!(text.contains("new_answer or vote"));
    }
}
