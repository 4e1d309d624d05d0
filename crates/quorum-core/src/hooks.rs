// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;

use quorum_hooks::{HookError, HookEvent, HookHandler, HookResult, InjectionStrategy};
use quorum_tools::is_workflow_tool;

use crate::events::InjectionQueue;
use crate::subagent::{format_results, SubagentQueue};

/// Banner prefixed to reminder injections.
const REMINDER_BANNER: &str = "[HIGH-PRIORITY TASK REMINDER]";

/// Delivers queued peer answers into the current tool response.
///
/// This is one of the three safe boundaries of inject-and-continue: the
/// runner's in-flight backend call is never aborted; the UPDATE rides on
/// the next tool result instead.  Workflow tools are excluded: their turn
/// is already over, the update will be delivered with the next directive.
pub struct MidStreamInjectionHook {
    queue: InjectionQueue,
}

impl MidStreamInjectionHook {
    pub fn new(queue: InjectionQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl HookHandler for MidStreamInjectionHook {
    fn name(&self) -> &str {
        "mid_stream_injection"
    }

    async fn handle(&self, event: &HookEvent) -> Result<HookResult, HookError> {
        if is_workflow_tool(&event.tool_name) || self.queue.is_empty() {
            return Ok(HookResult::allow());
        }
        let updates = self.queue.drain();
        let rendered: Vec<String> = updates.iter().map(|u| u.render()).collect();
        Ok(HookResult::inject(
            rendered.join("\n\n"),
            InjectionStrategy::ToolResult,
        ))
    }
}

/// Extracts a `reminder` field from JSON tool results and re-injects it as
/// a banner-prefixed user message, so buried task reminders survive long
/// tool transcripts.
pub struct HighPriorityTaskReminderHook;

#[async_trait]
impl HookHandler for HighPriorityTaskReminderHook {
    fn name(&self) -> &str {
        "high_priority_task_reminder"
    }

    async fn handle(&self, event: &HookEvent) -> Result<HookResult, HookError> {
        let Some(result) = &event.result else {
            return Ok(HookResult::allow());
        };
        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(result) else {
            return Ok(HookResult::allow());
        };
        match parsed.get("reminder").and_then(|v| v.as_str()) {
            Some(reminder) if !reminder.trim().is_empty() => Ok(HookResult::inject(
                format!("{REMINDER_BANNER}\n{reminder}"),
                InjectionStrategy::UserMessage,
            )),
            _ => Ok(HookResult::allow()),
        }
    }
}

/// Drains the parent's pending-subagent queue at every tool boundary and
/// injects completions as one batched `<subagent_results>` wrapper.
pub struct SubagentCompleteHook {
    queue: SubagentQueue,
    strategy: InjectionStrategy,
}

impl SubagentCompleteHook {
    pub fn new(queue: SubagentQueue, strategy: InjectionStrategy) -> Self {
        Self { queue, strategy }
    }
}

#[async_trait]
impl HookHandler for SubagentCompleteHook {
    fn name(&self) -> &str {
        "subagent_complete"
    }

    async fn handle(&self, event: &HookEvent) -> Result<HookResult, HookError> {
        if is_workflow_tool(&event.tool_name) || self.queue.is_empty() {
            return Ok(HookResult::allow());
        }
        let results = self.queue.drain();
        Ok(HookResult::inject(format_results(&results), self.strategy))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use quorum_hooks::HookEventKind;
    use serde_json::json;

    use super::*;
    use crate::events::PeerUpdate;
    use crate::subagent::{PendingSubagentResult, SubagentStatus};

    fn post_event(tool: &str, result: Option<&str>) -> HookEvent {
        HookEvent {
            event: HookEventKind::PostToolUse,
            tool_name: tool.into(),
            agent_id: "a1".into(),
            session_id: "s".into(),
            input: json!({}),
            result: result.map(|s| s.to_string()),
            is_error: false,
        }
    }

    fn update(label: &str) -> PeerUpdate {
        PeerUpdate {
            label: label.into(),
            agent_display: "beta (m)".into(),
            content: "peer answer body".into(),
            snapshot_path: Some(PathBuf::from("/snap/beta_1")),
        }
    }

    #[tokio::test]
    async fn midstream_hook_injects_queued_updates_into_tool_result() {
        let queue = InjectionQueue::new();
        queue.push(update("agent2.1"));
        let hook = MidStreamInjectionHook::new(queue.clone());
        let r = hook
            .handle(&post_event("custom_tool__read_file", Some("file body")))
            .await
            .unwrap();
        let inject = r.inject.expect("must inject");
        assert_eq!(inject.strategy, InjectionStrategy::ToolResult);
        assert!(inject.content.contains("agent2.1"));
        assert!(queue.is_empty(), "queue must be drained");
    }

    #[tokio::test]
    async fn midstream_hook_skips_workflow_tools() {
        let queue = InjectionQueue::new();
        queue.push(update("agent2.1"));
        let hook = MidStreamInjectionHook::new(queue.clone());
        let r = hook.handle(&post_event("vote", Some("ok"))).await.unwrap();
        assert!(r.inject.is_none());
        assert!(!queue.is_empty(), "updates stay queued for the directive path");
    }

    #[tokio::test]
    async fn midstream_hook_noop_on_empty_queue() {
        let hook = MidStreamInjectionHook::new(InjectionQueue::new());
        let r = hook
            .handle(&post_event("custom_tool__x", Some("y")))
            .await
            .unwrap();
        assert!(r.inject.is_none());
    }

    #[tokio::test]
    async fn reminder_hook_extracts_field_as_user_message() {
        let hook = HighPriorityTaskReminderHook;
        let result = r#"{"data": 1, "reminder": "finish the vote"}"#;
        let r = hook
            .handle(&post_event("custom_tool__todo", Some(result)))
            .await
            .unwrap();
        let inject = r.inject.expect("must inject");
        assert_eq!(inject.strategy, InjectionStrategy::UserMessage);
        assert!(inject.content.starts_with(REMINDER_BANNER));
        assert!(inject.content.contains("finish the vote"));
    }

    #[tokio::test]
    async fn reminder_hook_ignores_plain_text_results() {
        let hook = HighPriorityTaskReminderHook;
        let r = hook
            .handle(&post_event("custom_tool__todo", Some("not json")))
            .await
            .unwrap();
        assert!(r.inject.is_none());
    }

    #[tokio::test]
    async fn subagent_hook_batches_all_completions() {
        let queue = SubagentQueue::new();
        for id in ["s1", "s2"] {
            queue.push(PendingSubagentResult {
                parent_agent_id: "a1".into(),
                subagent_id: id.into(),
                status: SubagentStatus::Completed,
                success: true,
                answer: Some(format!("{id} answer")),
                input_tokens: 1,
                output_tokens: 1,
                completion_percentage: Some(100),
                workspace_path: None,
                duration_secs: 1,
                warnings: vec![],
            });
        }
        let hook = SubagentCompleteHook::new(queue.clone(), InjectionStrategy::ToolResult);
        let r = hook
            .handle(&post_event("custom_tool__read_file", Some("x")))
            .await
            .unwrap();
        let inject = r.inject.expect("must inject");
        assert!(inject.content.contains("<subagent_results count=2>"));
        assert!(queue.is_empty());
    }
}
