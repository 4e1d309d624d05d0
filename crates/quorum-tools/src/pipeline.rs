// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use quorum_hooks::{HookEvent, HookEventKind, HookRegistry, InjectionStrategy};
use quorum_workspace::ExecutionTrace;

use crate::evict::evict_if_large;
use crate::registry::ToolRegistry;
use crate::tool::{ToolCall, ToolOutput};
use crate::workflow::{parse_workflow_call, WorkflowCall};

/// Outcome of pushing one tool call through the pipeline.
#[derive(Debug)]
pub struct PipelineResult {
    /// The tool result fed back into the conversation (tool_result-strategy
    /// hook injections already appended).
    pub output: ToolOutput,
    /// Hook injections with `user_message` strategy, for the runner to add
    /// as follow-up user messages.
    pub user_injections: Vec<String>,
    /// Present when the call was a shape-valid workflow tool; terminal for
    /// the streamed turn.
    pub workflow: Option<WorkflowCall>,
    /// A workflow tool was called with malformed arguments.
    pub workflow_shape_error: Option<String>,
    /// The tool name resolved to nothing; triggers enforcement upstream.
    pub unknown_tool: bool,
    /// Path of the evicted full result, when eviction fired.
    pub evicted_to: Option<PathBuf>,
}

/// The single chokepoint for every tool invocation a backend emits.
///
/// Per call: resolve name → PreToolUse hooks → execute (with timeout) →
/// normalize → evict large results → PostToolUse hooks → trace.
pub struct ToolPipeline {
    registry: Arc<ToolRegistry>,
    hooks: Arc<HookRegistry>,
    session_id: String,
    tool_timeout: Duration,
    /// Dynamic: planning mode is lifted for the winner at the
    /// final-presentation boundary so deferred side effects actually run.
    planning_mode: std::sync::atomic::AtomicBool,
}

impl ToolPipeline {
    pub fn new(
        registry: Arc<ToolRegistry>,
        hooks: Arc<HookRegistry>,
        session_id: impl Into<String>,
        tool_timeout: Duration,
        planning_mode: bool,
    ) -> Self {
        Self {
            registry,
            hooks,
            session_id: session_id.into(),
            tool_timeout,
            planning_mode: std::sync::atomic::AtomicBool::new(planning_mode),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn planning_mode(&self) -> bool {
        self.planning_mode.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_planning_mode(&self, on: bool) {
        self.planning_mode
            .store(on, std::sync::atomic::Ordering::Relaxed);
    }

    /// Push one call through the full pipeline.
    ///
    /// `evict_dir` is the agent's workspace root (eviction files land in
    /// `.tool_results/` beneath it); `trace` receives the call/result pair.
    pub async fn dispatch(
        &self,
        agent_id: &str,
        call: &ToolCall,
        evict_dir: &Path,
        trace: &mut ExecutionTrace,
    ) -> PipelineResult {
        let mut result = self.dispatch_inner(agent_id, call).await;

        trace.record_tool_call(&call.name, &call.args);
        trace.record_tool_result(&call.name, &result.output.content, result.output.is_error);

        // Eviction applies after tracing: the trace keeps full fidelity, the
        // conversation gets the reference message.
        if !result.output.is_error && result.workflow.is_none() {
            match evict_if_large(evict_dir, &call.name, &result.output.content) {
                Ok(Some(evicted)) => {
                    result.output.content = evicted.reference_message.clone();
                    result.evicted_to = Some(evicted.path);
                }
                Ok(None) => {}
                Err(e) => warn!(tool = %call.name, %e, "eviction failed; keeping result inline"),
            }
        }

        result
    }

    async fn dispatch_inner(&self, agent_id: &str, call: &ToolCall) -> PipelineResult {
        let mut result = PipelineResult {
            output: ToolOutput::ok(&call.id, String::new()),
            user_injections: Vec::new(),
            workflow: None,
            workflow_shape_error: None,
            unknown_tool: false,
            evicted_to: None,
        };

        // 1. Resolve.
        let descriptor = match self.registry.get(&call.name) {
            Some(d) => d,
            None => {
                result.unknown_tool = true;
                result.output =
                    ToolOutput::err(&call.id, format!("unknown tool: {}", call.name));
                return result;
            }
        };

        // 2. PreToolUse hooks.  Any deny synthesizes an error tool result;
        // updated_input modifications chain.
        let pre = self
            .hooks
            .fire_pre(HookEvent {
                event: HookEventKind::PreToolUse,
                tool_name: call.name.clone(),
                agent_id: agent_id.to_string(),
                session_id: self.session_id.clone(),
                input: call.args.clone(),
                result: None,
                is_error: false,
            })
            .await;
        if let Some((hook, reason)) = pre.denied {
            debug!(tool = %call.name, hook, "tool call denied by hook");
            result.output = ToolOutput::err(&call.id, format!("denied by hook {hook}: {reason}"));
            return result;
        }
        let effective_call = ToolCall {
            id: call.id.clone(),
            name: call.name.clone(),
            args: pre.input,
        };

        // 3. Workflow tools: validate shape and hand the outcome upstream.
        // Their semantics (labels, snapshots, votes) live in the scheduler.
        if descriptor.is_workflow {
            match parse_workflow_call(&effective_call) {
                Ok(wf) => {
                    let ack = match &wf {
                        WorkflowCall::NewAnswer { .. } => "answer submitted",
                        WorkflowCall::Vote { .. } => "vote recorded",
                    };
                    result.output = ToolOutput::ok(&call.id, ack);
                    result.workflow = Some(wf);
                }
                Err(msg) => {
                    result.output = ToolOutput::err(&call.id, msg.clone());
                    result.workflow_shape_error = Some(msg);
                }
            }
            return result;
        }

        // 4. Planning mode: describe, don't execute.
        if self.planning_mode() && descriptor.side_effecting {
            result.output = ToolOutput::ok(
                &call.id,
                format!(
                    "[planning mode] {} was not executed; side-effecting tools \
                     run only during final presentation",
                    call.name
                ),
            );
        } else {
            // 5. Execute with the per-tool timeout.
            result.output = match tokio::time::timeout(
                self.tool_timeout,
                self.registry.execute(&effective_call),
            )
            .await
            {
                Ok(output) => output,
                Err(_) => ToolOutput::err(
                    &call.id,
                    format!(
                        "{} timed out after {:?}",
                        call.name, self.tool_timeout
                    ),
                ),
            };
        }

        // 6. PostToolUse hooks: tool_result injections append to the result
        // (cache-friendly), user_message injections go to the runner.
        let post = self
            .hooks
            .fire_post(&HookEvent {
                event: HookEventKind::PostToolUse,
                tool_name: call.name.clone(),
                agent_id: agent_id.to_string(),
                session_id: self.session_id.clone(),
                input: effective_call.args.clone(),
                result: Some(result.output.content.clone()),
                is_error: result.output.is_error,
            })
            .await;
        for injection in post.injections {
            match injection.strategy {
                InjectionStrategy::ToolResult => {
                    result.output.content.push_str("\n\n");
                    result.output.content.push_str(&injection.content);
                }
                InjectionStrategy::UserMessage => {
                    result.user_injections.push(injection.content);
                }
            }
        }

        result
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::*;
    use quorum_hooks::{HookHandler, HookResult, RegisteredHook};

    use crate::tool::Tool;

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "sleeps"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            tokio::time::sleep(Duration::from_secs(60)).await;
            ToolOutput::ok(&call.id, "done")
        }
    }

    struct ArgEchoTool;

    #[async_trait]
    impl Tool for ArgEchoTool {
        fn name(&self) -> &str {
            "arg_echo"
        }
        fn description(&self) -> &str {
            "echoes args"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, call.args.to_string())
        }
    }

    struct BigTool;

    #[async_trait]
    impl Tool for BigTool {
        fn name(&self) -> &str {
            "big"
        }
        fn description(&self) -> &str {
            "returns a huge result"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, "filler line\n".repeat(10_000))
        }
    }

    struct EffectTool;

    #[async_trait]
    impl Tool for EffectTool {
        fn name(&self) -> &str {
            "deploy"
        }
        fn description(&self) -> &str {
            "side effects"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn side_effecting(&self) -> bool {
            true
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, "deployed")
        }
    }

    struct InputRewriteHook;

    #[async_trait]
    impl HookHandler for InputRewriteHook {
        fn name(&self) -> &str {
            "rewrite"
        }
        async fn handle(
            &self,
            _e: &HookEvent,
        ) -> Result<HookResult, quorum_hooks::HookError> {
            Ok(HookResult::update_input(json!({"rewritten": true})))
        }
    }

    struct InjectBothHook;

    #[async_trait]
    impl HookHandler for InjectBothHook {
        fn name(&self) -> &str {
            "inject"
        }
        async fn handle(
            &self,
            _e: &HookEvent,
        ) -> Result<HookResult, quorum_hooks::HookError> {
            Ok(HookResult::inject("appended note", InjectionStrategy::ToolResult))
        }
    }

    fn pipeline_with(
        registry: ToolRegistry,
        hooks: HookRegistry,
        planning: bool,
    ) -> ToolPipeline {
        ToolPipeline::new(
            Arc::new(registry),
            Arc::new(hooks),
            "sess-1",
            Duration::from_millis(200),
            planning,
        )
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: name.into(),
            args,
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_flagged_for_enforcement() {
        let p = pipeline_with(ToolRegistry::new(true), HookRegistry::new(), false);
        let dir = tempfile::tempdir().unwrap();
        let mut trace = ExecutionTrace::new();
        let r = p
            .dispatch("a1", &call("execute_command", json!({})), dir.path(), &mut trace)
            .await;
        assert!(r.unknown_tool);
        assert!(r.output.is_error);
    }

    #[tokio::test]
    async fn workflow_call_is_terminal_and_not_executed() {
        let p = pipeline_with(ToolRegistry::new(true), HookRegistry::new(), false);
        let dir = tempfile::tempdir().unwrap();
        let mut trace = ExecutionTrace::new();
        let r = p
            .dispatch(
                "a1",
                &call("new_answer", json!({"content": "the answer"})),
                dir.path(),
                &mut trace,
            )
            .await;
        assert!(matches!(r.workflow, Some(WorkflowCall::NewAnswer { .. })));
        assert!(!r.output.is_error);
    }

    #[tokio::test]
    async fn malformed_workflow_args_surface_shape_error() {
        let p = pipeline_with(ToolRegistry::new(true), HookRegistry::new(), false);
        let dir = tempfile::tempdir().unwrap();
        let mut trace = ExecutionTrace::new();
        let r = p
            .dispatch("a1", &call("vote", json!({"reason": "x"})), dir.path(), &mut trace)
            .await;
        assert!(r.workflow.is_none());
        assert!(r.workflow_shape_error.is_some());
        assert!(r.output.is_error);
    }

    #[tokio::test]
    async fn deny_hook_synthesizes_error_result() {
        struct DenyHook;
        #[async_trait]
        impl HookHandler for DenyHook {
            fn name(&self) -> &str {
                "gate"
            }
            async fn handle(
                &self,
                _e: &HookEvent,
            ) -> Result<HookResult, quorum_hooks::HookError> {
                Ok(HookResult::deny("not in this phase"))
            }
        }
        let mut registry = ToolRegistry::new(true);
        registry.register_custom(ArgEchoTool);
        let mut hooks = HookRegistry::new();
        hooks.register_global(RegisteredHook::new(
            HookEventKind::PreToolUse,
            Some("custom_tool__arg_echo"),
            Arc::new(DenyHook),
            None,
        ));
        let p = pipeline_with(registry, hooks, false);
        let dir = tempfile::tempdir().unwrap();
        let mut trace = ExecutionTrace::new();
        let r = p
            .dispatch("a1", &call("custom_tool__arg_echo", json!({})), dir.path(), &mut trace)
            .await;
        assert!(r.output.is_error);
        assert!(r.output.content.contains("denied by hook"));
    }

    #[tokio::test]
    async fn updated_input_reaches_the_tool() {
        let mut registry = ToolRegistry::new(true);
        registry.register_custom(ArgEchoTool);
        let mut hooks = HookRegistry::new();
        hooks.register_global(RegisteredHook::new(
            HookEventKind::PreToolUse,
            None,
            Arc::new(InputRewriteHook),
            None,
        ));
        let p = pipeline_with(registry, hooks, false);
        let dir = tempfile::tempdir().unwrap();
        let mut trace = ExecutionTrace::new();
        let r = p
            .dispatch(
                "a1",
                &call("custom_tool__arg_echo", json!({"original": 1})),
                dir.path(),
                &mut trace,
            )
            .await;
        assert!(r.output.content.contains("rewritten"));
    }

    #[tokio::test]
    async fn tool_timeout_becomes_error_result() {
        let mut registry = ToolRegistry::new(true);
        registry.register_custom(SlowTool);
        let p = pipeline_with(registry, HookRegistry::new(), false);
        let dir = tempfile::tempdir().unwrap();
        let mut trace = ExecutionTrace::new();
        let r = p
            .dispatch("a1", &call("custom_tool__slow", json!({})), dir.path(), &mut trace)
            .await;
        assert!(r.output.is_error);
        assert!(r.output.content.contains("timed out"));
    }

    #[tokio::test]
    async fn large_result_is_evicted_with_reference() {
        let mut registry = ToolRegistry::new(true);
        registry.register_custom(BigTool);
        let p = pipeline_with(registry, HookRegistry::new(), false);
        let dir = tempfile::tempdir().unwrap();
        let mut trace = ExecutionTrace::new();
        let r = p
            .dispatch("a1", &call("custom_tool__big", json!({})), dir.path(), &mut trace)
            .await;
        let evicted = r.evicted_to.expect("must evict");
        assert!(evicted.exists());
        assert!(r.output.content.contains("evicted"));
        // The trace keeps the full result, not the reference.
        let md = trace.render_markdown();
        assert!(md.contains("filler line"));
    }

    #[tokio::test]
    async fn post_hook_injection_appends_to_result() {
        let mut registry = ToolRegistry::new(true);
        registry.register_custom(ArgEchoTool);
        let mut hooks = HookRegistry::new();
        hooks.register_global(RegisteredHook::new(
            HookEventKind::PostToolUse,
            None,
            Arc::new(InjectBothHook),
            None,
        ));
        let p = pipeline_with(registry, hooks, false);
        let dir = tempfile::tempdir().unwrap();
        let mut trace = ExecutionTrace::new();
        let r = p
            .dispatch("a1", &call("custom_tool__arg_echo", json!({})), dir.path(), &mut trace)
            .await;
        assert!(r.output.content.ends_with("appended note"));
    }

    #[tokio::test]
    async fn planning_mode_describes_side_effecting_tools() {
        let mut registry = ToolRegistry::new(true);
        registry.register_custom(EffectTool);
        registry.register_custom(ArgEchoTool);
        let p = pipeline_with(registry, HookRegistry::new(), true);
        let dir = tempfile::tempdir().unwrap();
        let mut trace = ExecutionTrace::new();
        let r = p
            .dispatch("a1", &call("custom_tool__deploy", json!({})), dir.path(), &mut trace)
            .await;
        assert!(r.output.content.contains("planning mode"));
        // Read-only tools still run.
        let r2 = p
            .dispatch("a1", &call("custom_tool__arg_echo", json!({})), dir.path(), &mut trace)
            .await;
        assert!(!r2.output.content.contains("planning mode"));

        // The winner's presentation phase lifts the restriction.
        p.set_planning_mode(false);
        let r3 = p
            .dispatch("a1", &call("custom_tool__deploy", json!({})), dir.path(), &mut trace)
            .await;
        assert_eq!(r3.output.content, "deployed");
    }
}
