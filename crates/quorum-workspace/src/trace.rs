// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry in an agent's execution trace.  Full fidelity: arguments and
/// results are stored whole, never truncated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TraceKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceKind {
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
    ToolResult {
        name: String,
        content: String,
        is_error: bool,
    },
    Reasoning {
        content: String,
    },
    Error {
        message: String,
    },
    /// Opens a new round section in the markdown rendering; `answer_number`
    /// is the agent's submission counter at that point.
    Round {
        answer_number: u32,
    },
}

/// Append-only per-agent execution trace (rendered to `execution_trace.md`
/// inside each snapshot).
///
/// Peers read the rendered markdown from snapshot-derived temp workspaces to
/// follow another agent's reasoning; the compression-recovery message points
/// at it as the out-of-context history source.
#[derive(Debug, Default)]
pub struct ExecutionTrace {
    entries: Vec<TraceEntry>,
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, kind: TraceKind) {
        self.entries.push(TraceEntry {
            timestamp: Utc::now(),
            kind,
        });
    }

    pub fn begin_round(&mut self, answer_number: u32) {
        self.push(TraceKind::Round { answer_number });
    }

    pub fn record_tool_call(&mut self, name: &str, arguments: &serde_json::Value) {
        self.push(TraceKind::ToolCall {
            name: name.to_string(),
            arguments: arguments.clone(),
        });
    }

    pub fn record_tool_result(&mut self, name: &str, content: &str, is_error: bool) {
        self.push(TraceKind::ToolResult {
            name: name.to_string(),
            content: content.to_string(),
            is_error,
        });
    }

    pub fn record_reasoning(&mut self, content: &str) {
        self.push(TraceKind::Reasoning {
            content: content.to_string(),
        });
    }

    pub fn record_error(&mut self, message: &str) {
        self.push(TraceKind::Error {
            message: message.to_string(),
        });
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render the whole trace as markdown.
    pub fn render_markdown(&self) -> String {
        let mut out = String::from("# Execution trace\n");
        for entry in &self.entries {
            let ts = entry.timestamp.format("%H:%M:%S%.3f");
            match &entry.kind {
                TraceKind::Round { answer_number } => {
                    out.push_str(&format!("\n## Round {answer_number}\n"));
                }
                TraceKind::ToolCall { name, arguments } => {
                    let args = serde_json::to_string_pretty(arguments)
                        .unwrap_or_else(|_| arguments.to_string());
                    out.push_str(&format!(
                        "\n### [{ts}] tool call: `{name}`\n```json\n{args}\n```\n"
                    ));
                }
                TraceKind::ToolResult {
                    name,
                    content,
                    is_error,
                } => {
                    let tag = if *is_error { " (error)" } else { "" };
                    out.push_str(&format!(
                        "\n### [{ts}] result: `{name}`{tag}\n```\n{content}\n```\n"
                    ));
                }
                TraceKind::Reasoning { content } => {
                    out.push_str(&format!("\n### [{ts}] reasoning\n{content}\n"));
                }
                TraceKind::Error { message } => {
                    out.push_str(&format!("\n### [{ts}] error\n{message}\n"));
                }
            }
        }
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
