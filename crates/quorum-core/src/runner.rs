// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use quorum_model::{
    is_context_overflow, ChatBackend, CompletionRequest, Message, StreamEvent,
};
use quorum_tools::{is_workflow_tool, ToolCall, ToolPipeline, WorkflowCall};
use quorum_workspace::ExecutionTrace;

use crate::buffer::StreamingBuffer;
use crate::compress::compress_for_retry;
use crate::events::{
    Directive, InjectionQueue, RunnerEvent, RunnerMessage, RunnerViolation,
};

/// Tool-call rounds allowed within a single turn before the runner gives up
/// and reports a protocol violation.
const MAX_TOOL_ROUNDS: u32 = 25;

/// Recent messages kept verbatim through context compression.
const COMPRESS_KEEP_RECENT: usize = 6;

/// Drives exactly one agent's streamed conversation.
///
/// The runner owns its streaming buffer and in-flight tool call; the
/// scheduler owns everything shared.  Communication is strictly through
/// [`RunnerMessage`]s: a turn-terminal event carries a reply channel and
/// the runner blocks on it, which is how the scheduler parks runners
/// without busy-waiting or mid-stream kills.
pub struct AgentRunner {
    agent_id: String,
    display_name: String,
    backend: Arc<dyn ChatBackend>,
    pipeline: Arc<ToolPipeline>,
    /// Workspace root; eviction files and the live trace copy land here.
    workspace_root: PathBuf,
    trace: Arc<Mutex<ExecutionTrace>>,
    injections: InjectionQueue,
    events: mpsc::Sender<RunnerMessage>,
    buffer: StreamingBuffer,
    conversation: Vec<Message>,
    evicted: Vec<PathBuf>,
}

impl AgentRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: impl Into<String>,
        display_name: impl Into<String>,
        backend: Arc<dyn ChatBackend>,
        pipeline: Arc<ToolPipeline>,
        workspace_root: PathBuf,
        trace: Arc<Mutex<ExecutionTrace>>,
        injections: InjectionQueue,
        events: mpsc::Sender<RunnerMessage>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            display_name: display_name.into(),
            backend,
            pipeline,
            workspace_root,
            trace,
            injections,
            events,
            buffer: StreamingBuffer::new(),
            conversation: Vec::new(),
            evicted: Vec::new(),
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are {display}, one of several agents working the same task in \
             parallel. Work in your own workspace; peers see your files only \
             through snapshots taken when you submit an answer.\n\
             Finish every turn by calling exactly one workflow tool:\n\
             - new_answer(content): submit or refine an answer\n\
             - vote(target, reason): endorse an existing answer by label\n\
             You will receive UPDATE messages when peers submit answers; weigh \
             them against your own work before deciding.",
            display = self.display_name
        )
    }

    /// Run the conversation to completion.  Consumes the runner.
    pub async fn run(mut self, task: String) {
        self.conversation.push(Message::system(self.system_prompt()));
        self.conversation.push(Message::user(task));

        let mut directive = Directive::Chat {
            inject: Vec::new(),
            note: None,
            final_presentation: false,
        };
        loop {
            match directive {
                Directive::Stop => break,
                Directive::Chat {
                    inject,
                    note,
                    final_presentation,
                } => {
                    for update in inject {
                        self.conversation.push(Message::user(update));
                    }
                    if let Some(note) = note {
                        self.conversation.push(Message::user(note));
                    }
                    let event = self.run_turn(final_presentation).await;
                    match self.send_terminal(event).await {
                        Some(next) => directive = next,
                        None => break,
                    }
                }
            }
        }
        debug!(agent_id = %self.agent_id, "runner finished");
    }

    /// One terminal turn: backend calls and tool rounds until a workflow
    /// tool ends the turn, a protocol violation is detected, or (in final
    /// presentation) the model finishes in plain text.
    async fn run_turn(&mut self, final_presentation: bool) -> RunnerEvent {
        let mut rounds = 0u32;
        let mut tool_calls_this_turn = 0u32;
        let mut had_tool_calls = false;

        loop {
            rounds += 1;
            if rounds > MAX_TOOL_ROUNDS {
                let buffer = self.buffer.capture();
                self.buffer.clear();
                return RunnerEvent::ProtocolViolation {
                    violation: RunnerViolation::NoWorkflowTool,
                    tool_calls: tool_calls_this_turn,
                    buffer,
                };
            }

            // Safe-boundary injection: peer updates queued while we were
            // streaming land in the conversation before the next call.
            for update in self.injections.drain() {
                self.conversation.push(Message::user(update.render()));
            }

            let (text, calls) = match self.stream_once().await {
                Ok(out) => out,
                Err(e) if is_context_overflow(&e) => {
                    warn!(agent_id = %self.agent_id, "context overflow; compressing and retrying");
                    self.compress_conversation().await;
                    continue;
                }
                Err(e) => {
                    return RunnerEvent::Failed {
                        error: format!("{e:#}"),
                    };
                }
            };

            if !text.is_empty() {
                self.conversation.push(Message::assistant(&text));
            }

            if calls.is_empty() {
                if final_presentation && !text.is_empty() {
                    self.buffer.clear();
                    return RunnerEvent::FinalAnswer { content: text };
                }
                let buffer = self.buffer.capture();
                self.buffer.clear();
                let violation = if had_tool_calls {
                    RunnerViolation::NoWorkflowTool
                } else {
                    RunnerViolation::NoToolCalls
                };
                return RunnerEvent::ProtocolViolation {
                    violation,
                    tool_calls: tool_calls_this_turn,
                    buffer,
                };
            }

            had_tool_calls = true;

            // A single response carrying more than one workflow call is
            // unresolvable (vote_and_answer): neither can be honored.
            let workflow_count = calls.iter().filter(|c| is_workflow_tool(&c.name)).count();
            if workflow_count > 1 {
                let buffer = self.buffer.capture();
                self.buffer.clear();
                return RunnerEvent::ProtocolViolation {
                    violation: RunnerViolation::VoteAndAnswer,
                    tool_calls: tool_calls_this_turn + calls.len() as u32,
                    buffer,
                };
            }

            let mut workflow_outcome: Option<WorkflowCall> = None;
            let mut unknown_tool: Option<String> = None;

            for call in &calls {
                tool_calls_this_turn += 1;
                self.conversation.push(Message::tool_call(
                    &call.id,
                    &call.name,
                    call.args.to_string(),
                ));

                let result = {
                    let mut trace = self.trace.lock().await;
                    self.pipeline
                        .dispatch(&self.agent_id, call, &self.workspace_root, &mut trace)
                        .await
                };

                self.conversation
                    .push(Message::tool_result(&call.id, &result.output.content));

                if let Some(path) = result.evicted_to {
                    self.evicted.push(path);
                }
                for injected in result.user_injections {
                    self.conversation.push(Message::user(injected));
                }

                if result.unknown_tool {
                    unknown_tool = Some(call.name.clone());
                    break;
                }
                if let Some(message) = result.workflow_shape_error {
                    // Observable error: fed back inline, reported for the
                    // reliability record, turn continues.
                    self.send_fire_and_forget(RunnerEvent::WorkflowShapeError { message })
                        .await;
                    continue;
                }
                if let Some(wf) = result.workflow {
                    workflow_outcome = Some(wf);
                    break;
                }
            }

            if let Some(name) = unknown_tool {
                let buffer = self.buffer.capture();
                self.buffer.clear();
                return RunnerEvent::ProtocolViolation {
                    violation: RunnerViolation::UnknownTool(name),
                    tool_calls: tool_calls_this_turn,
                    buffer,
                };
            }

            if let Some(wf) = workflow_outcome {
                let buffer = self.buffer.capture();
                self.buffer.clear();
                return match wf {
                    WorkflowCall::NewAnswer { content } if final_presentation => {
                        RunnerEvent::FinalAnswer { content }
                    }
                    WorkflowCall::NewAnswer { content } => RunnerEvent::AnswerSubmitted {
                        content,
                        tool_calls: tool_calls_this_turn,
                        buffer,
                    },
                    WorkflowCall::Vote { target, reason } => RunnerEvent::VoteSubmitted {
                        target,
                        reason,
                        tool_calls: tool_calls_this_turn,
                        buffer,
                    },
                };
            }
            // Non-workflow tools only: loop into the next backend call.
        }
    }

    /// One streamed backend call.  Returns the full text and the completed
    /// tool calls, with fragmented tool-call chunks accumulated by index.
    async fn stream_once(&mut self) -> anyhow::Result<(String, Vec<ToolCall>)> {
        let req = CompletionRequest {
            messages: self.conversation.clone(),
            tools: self.pipeline.registry().schemas(),
        };

        let mut stream = self.backend.stream_chat(req).await?;
        // The retried call was accepted: the preserved buffer content is now
        // part of the rebuilt conversation, so the hold can be released.
        if self.buffer.compression_retry() {
            self.buffer.force_clear();
        }

        let mut full_text = String::new();
        let mut reasoning = String::new();
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::TextDelta(delta) => {
                    self.buffer.append_text(&delta);
                    full_text.push_str(&delta);
                }
                StreamEvent::ReasoningDelta(delta) => {
                    self.buffer.append_reasoning(&delta);
                    reasoning.push_str(&delta);
                }
                StreamEvent::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    self.buffer.append_tool_call(&name, &arguments);
                    let ptc = pending.entry(index).or_insert_with(PendingToolCall::default);
                    if !id.is_empty() {
                        ptc.id = id;
                    }
                    if !name.is_empty() {
                        ptc.name = name;
                    }
                    ptc.args_buf.push_str(&arguments);
                }
                StreamEvent::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    self.send_fire_and_forget(RunnerEvent::Usage {
                        input_tokens,
                        output_tokens,
                    })
                    .await;
                }
                StreamEvent::Done => break,
                StreamEvent::Error(e) => {
                    return Err(anyhow::Error::new(e));
                }
            }
        }

        if !reasoning.is_empty() {
            self.trace.lock().await.record_reasoning(&reasoning);
        }

        // Flush accumulated tool calls ordered by index.  Calls with an
        // empty name cannot be dispatched and are dropped; an empty id gets
        // a synthetic fallback so the turn can still complete.
        let mut sorted: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
        sorted.sort_by_key(|(idx, _)| *idx);
        let mut calls = Vec::new();
        for (i, (_, ptc)) in sorted.into_iter().enumerate() {
            if ptc.name.is_empty() {
                warn!(agent_id = %self.agent_id, "dropping tool call with empty name");
                continue;
            }
            let mut call = ptc.finish();
            if call.id.is_empty() {
                call.id = format!("tc_synthetic_{i}");
            }
            calls.push(call);
        }

        Ok((full_text, calls))
    }

    /// Rebuild the conversation through the compression adapter, preserving
    /// the in-flight streaming buffer, and arm the retry flag so the buffer
    /// survives until the retried call is accepted.
    async fn compress_conversation(&mut self) {
        // Persist the live trace beside the workspace so the compressed
        // conversation can reference it as an out-of-context history source
        // (snapshots will carry the same file).
        let trace_file = self.workspace_root.join("execution_trace.md");
        let markdown = self.trace.lock().await.render_markdown();
        if let Err(e) = std::fs::write(&trace_file, markdown) {
            warn!(agent_id = %self.agent_id, %e, "could not persist live trace");
        }

        self.conversation = compress_for_retry(
            &self.conversation,
            &self.buffer,
            &self.evicted,
            COMPRESS_KEEP_RECENT,
            Some(&trace_file),
        );
        self.buffer.set_compression_retry(true);
    }

    async fn send_fire_and_forget(&self, event: RunnerEvent) {
        let _ = self
            .events
            .send(RunnerMessage {
                agent_id: self.agent_id.clone(),
                event,
                reply: None,
            })
            .await;
    }

    /// Report a turn-terminal event and block until the scheduler replies
    /// with the next directive.  `None` means the scheduler went away.
    async fn send_terminal(&mut self, event: RunnerEvent) -> Option<Directive> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.events
            .send(RunnerMessage {
                agent_id: self.agent_id.clone(),
                event,
                reply: Some(reply_tx),
            })
            .await
            .ok()?;
        reply_rx.await.ok()
    }
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self) -> ToolCall {
        // Always resolve to a JSON object; backends reject null tool input
        // on the next request.
        let args = if self.args_buf.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            serde_json::from_str(&self.args_buf).unwrap_or_else(|_| {
                warn!(tool = %self.name, "invalid JSON tool arguments; substituting {{}}");
                serde_json::Value::Object(Default::default())
            })
        };
        ToolCall {
            id: self.id,
            name: self.name,
            args,
        }
    }
}
