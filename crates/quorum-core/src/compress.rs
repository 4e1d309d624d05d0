// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use quorum_model::{Message, MessageContent, Role};

use crate::buffer::StreamingBuffer;

/// Per-message digest length in the compressed summary.
const DIGEST_CHARS: usize = 120;

/// Reactive context compression, invoked when a backend signals context
/// overflow mid-coordination.
///
/// Deterministic: no model call is made, so recovery always succeeds
/// regardless of how large the session grew.  The rebuilt message list:
/// 1. keeps the system message,
/// 2. summarizes the oldest turns into a digest block,
/// 3. injects a synthesized assistant message carrying the in-flight
///    streaming buffer (`[Tool execution results]`),
/// 4. lists evicted-tool-result files verbatim so the agent can re-read
///    them by byte range,
/// 5. keeps the most recent turns verbatim.
pub fn compress_for_retry(
    messages: &[Message],
    buffer: &StreamingBuffer,
    evicted_refs: &[PathBuf],
    keep_recent: usize,
    trace_path: Option<&Path>,
) -> Vec<Message> {
    let system: Option<Message> = messages
        .iter()
        .find(|m| m.role == Role::System)
        .cloned();
    let non_system: Vec<&Message> =
        messages.iter().filter(|m| m.role != Role::System).collect();

    let mut split = non_system.len().saturating_sub(keep_recent);
    // Never split inside a tool-call/tool-result group: an orphaned tool
    // result references a call id that was summarized away, which providers
    // reject on the retried request.
    while split > 0 && split < non_system.len() {
        match &non_system[split].content {
            MessageContent::ToolResult { .. } | MessageContent::ToolCall { .. } => split -= 1,
            _ => break,
        }
    }
    let (old, recent) = non_system.split_at(split);

    let mut out = Vec::new();
    if let Some(sys) = system {
        out.push(sys);
    }

    if !old.is_empty() {
        let mut summary = format!(
            "[Context compressed after overflow: {} earlier messages summarized]\n",
            old.len()
        );
        for m in old {
            summary.push_str(&format!("- {}: {}\n", role_name(m.role), digest(m)));
        }
        if let Some(trace) = trace_path {
            summary.push_str(&format!(
                "Full history is preserved out of context in {}.\n",
                trace.display()
            ));
        }
        out.push(Message::assistant(summary));
    }

    if !buffer.is_empty() {
        out.push(Message::assistant(format!(
            "[Tool execution results]\n{}",
            buffer.contents()
        )));
    }

    if !evicted_refs.is_empty() {
        let mut refs = String::from(
            "Large tool results previously evicted to disk (readable by byte range):\n",
        );
        for path in evicted_refs {
            refs.push_str(&format!("- {}\n", path.display()));
        }
        out.push(Message::assistant(refs));
    }

    out.extend(recent.iter().map(|m| (*m).clone()));
    out
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn digest(m: &Message) -> String {
    let text = match &m.content {
        MessageContent::Text(t) => t.clone(),
        MessageContent::ToolCall { function, .. } => {
            format!("tool call {}({})", function.name, function.arguments)
        }
        MessageContent::ToolResult { content, .. } => format!("tool result: {content}"),
    };
    let mut cut = DIGEST_CHARS.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut d = text[..cut].replace('\n', " ");
    if cut < text.len() {
        d.push('…');
    }
    d
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(turns: usize) -> Vec<Message> {
        let mut msgs = vec![Message::system("you are agent one")];
        for i in 0..turns {
            msgs.push(Message::user(format!("question {i}")));
            msgs.push(Message::assistant(format!("answer {i}")));
        }
        msgs
    }

    #[test]
    fn keeps_system_and_recent_verbatim() {
        let msgs = conversation(10);
        let buffer = StreamingBuffer::new();
        let out = compress_for_retry(&msgs, &buffer, &[], 4, None);
        assert_eq!(out[0].as_text(), Some("you are agent one"));
        let tail: Vec<&str> = out.iter().rev().take(4).filter_map(|m| m.as_text()).collect();
        assert!(tail.contains(&"answer 9"));
        assert!(tail.contains(&"question 8"));
        assert!(out.len() < msgs.len());
    }

    #[test]
    fn summary_digests_old_turns() {
        let msgs = conversation(10);
        let buffer = StreamingBuffer::new();
        let out = compress_for_retry(&msgs, &buffer, &[], 2, None);
        let summary = out[1].as_text().unwrap();
        assert!(summary.contains("messages summarized"));
        assert!(summary.contains("question 0"));
    }

    #[test]
    fn buffer_content_is_injected_as_tool_results_message() {
        let msgs = conversation(4);
        let mut buffer = StreamingBuffer::new();
        buffer.append_text("partial reasoning about the fix");
        let out = compress_for_retry(&msgs, &buffer, &[], 2, None);
        let injected = out
            .iter()
            .filter_map(|m| m.as_text())
            .find(|t| t.starts_with("[Tool execution results]"))
            .expect("buffer message missing");
        assert!(injected.contains("partial reasoning about the fix"));
    }

    #[test]
    fn evicted_refs_are_listed_verbatim() {
        let msgs = conversation(4);
        let buffer = StreamingBuffer::new();
        let refs = vec![PathBuf::from("/run/a1/.tool_results/grep_x.txt")];
        let out = compress_for_retry(&msgs, &buffer, &refs, 2, None);
        assert!(out
            .iter()
            .filter_map(|m| m.as_text())
            .any(|t| t.contains("/run/a1/.tool_results/grep_x.txt")));
    }

    #[test]
    fn split_never_orphans_tool_results() {
        let mut msgs = vec![Message::system("sys")];
        for i in 0..6 {
            msgs.push(Message::user(format!("u{i}")));
            msgs.push(Message::tool_call(format!("c{i}"), "grep", "{}"));
            msgs.push(Message::tool_result(format!("c{i}"), "out"));
        }
        let buffer = StreamingBuffer::new();
        // keep_recent lands mid-group on purpose.
        let out = compress_for_retry(&msgs, &buffer, &[], 2, None);
        // Every kept ToolResult must be preceded by its own ToolCall.
        let mut call_ids = Vec::new();
        for m in &out {
            match &m.content {
                MessageContent::ToolCall { tool_call_id, .. } => call_ids.push(tool_call_id.clone()),
                MessageContent::ToolResult { tool_call_id, .. } => {
                    assert!(
                        call_ids.contains(tool_call_id),
                        "orphaned tool result {tool_call_id}"
                    );
                }
                _ => {}
            }
        }
    }

    #[test]
    fn trace_pointer_is_mentioned() {
        let msgs = conversation(6);
        let buffer = StreamingBuffer::new();
        let out = compress_for_retry(
            &msgs,
            &buffer,
            &[],
            2,
            Some(Path::new("/snap/a1/execution_trace.md")),
        );
        assert!(out
            .iter()
            .filter_map(|m| m.as_text())
            .any(|t| t.contains("execution_trace.md")));
    }
}
