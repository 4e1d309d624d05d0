// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    backend::ChunkStream, BackendError, ChatBackend, CompletionRequest, StreamEvent,
};

/// A pre-scripted backend.  Each call to `stream_chat` pops the next
/// response script from the front of the queue, so tests can specify exact
/// event sequences (tool calls, usage, error chunks) without network
/// access.
pub struct ScriptedBackend {
    scripts: Arc<Mutex<Vec<Vec<StreamEvent>>>>,
    name: String,
    model: String,
    /// Every `CompletionRequest` seen by this backend, in call order.
    /// Written on each `stream_chat` call so tests can inspect what was sent.
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedBackend {
    /// Build a backend from an ordered list of response scripts.  The outer
    /// `Vec` is the list of calls; the inner `Vec` is the chunk sequence for
    /// that call.
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            name: "scripted".into(),
            model: "scripted-model".into(),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Convenience: a single turn that streams `text` and finishes.
    pub fn text_turn(text: impl Into<String>) -> Vec<StreamEvent> {
        vec![
            StreamEvent::TextDelta(text.into()),
            StreamEvent::Usage {
                input_tokens: 10,
                output_tokens: 10,
            },
            StreamEvent::Done,
        ]
    }

    /// Convenience: a single turn that emits one complete tool call.
    pub fn tool_turn(
        id: impl Into<String>,
        name: impl Into<String>,
        args_json: impl Into<String>,
    ) -> Vec<StreamEvent> {
        vec![
            StreamEvent::ToolCall {
                index: 0,
                id: id.into(),
                name: name.into(),
                arguments: args_json.into(),
            },
            StreamEvent::Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
            StreamEvent::Done,
        ]
    }

    /// Convenience: a turn that fails with a context-overflow error chunk.
    pub fn overflow_turn() -> Vec<StreamEvent> {
        vec![StreamEvent::Error(BackendError::context_overflow(
            "scripted overflow",
        ))]
    }

    /// Number of scripts not yet consumed.
    pub fn remaining(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(&self, req: CompletionRequest) -> anyhow::Result<ChunkStream> {
        self.requests.lock().unwrap().push(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Fallback when all scripts are consumed; visible in test
                // output so an exhausted script is easy to diagnose.
                vec![
                    StreamEvent::TextDelta("[no more scripts]".into()),
                    StreamEvent::Done,
                ]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<StreamEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

/// Echo backend: replies with the last user message.  Handy for smoke tests
/// and low-level driver tests.
#[derive(Default)]
pub struct EchoBackend;

#[async_trait]
impl ChatBackend for EchoBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn stream_chat(&self, req: CompletionRequest) -> anyhow::Result<ChunkStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();
        let events: Vec<anyhow::Result<StreamEvent>> = vec![
            Ok(StreamEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(StreamEvent::Usage {
                input_tokens: 10,
                output_tokens: 10,
            }),
            Ok(StreamEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// Offline driver that follows the coordination workflow protocol.
///
/// Behaviour per call, derived only from the conversation:
/// - told it "won the vote" → reply with plain final text,
/// - has already submitted (an "answer submitted" tool result is present)
///   and an answer label is visible → vote for that label,
/// - otherwise → submit a `new_answer` echoing the task.
///
/// This is the `mock` backend the CLI ships: good enough to drive a whole
/// coordination end to end without network access.
pub struct WorkflowEchoBackend {
    model: String,
    /// Distinguishes this instance's answers; without it, identical mock
    /// agents would trip the answer-novelty check against each other.
    salt: String,
}

impl WorkflowEchoBackend {
    pub fn new() -> Self {
        Self {
            model: "workflow-mock".into(),
            salt: String::new(),
        }
    }

    pub fn salted(salt: impl Into<String>) -> Self {
        Self {
            model: "workflow-mock".into(),
            salt: salt.into(),
        }
    }
}

impl Default for WorkflowEchoBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatBackend for WorkflowEchoBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(&self, req: CompletionRequest) -> anyhow::Result<ChunkStream> {
        let last_user = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("")
            .to_string();

        let won = last_user.contains("won the vote");
        let has_submitted = req.messages.iter().any(|m| {
            matches!(
                &m.content,
                crate::MessageContent::ToolResult { content, .. } if content == "answer submitted"
            )
        });
        let vote_available = req.tools.iter().any(|t| t.name == "vote");
        let label = req
            .messages
            .iter()
            .filter_map(|m| m.as_text())
            .find_map(find_answer_label);

        let events: Vec<StreamEvent> = if won {
            vec![
                StreamEvent::TextDelta("Final answer: the agents agree.".into()),
                StreamEvent::Usage {
                    input_tokens: 20,
                    output_tokens: 10,
                },
                StreamEvent::Done,
            ]
        } else if has_submitted && vote_available {
            if let Some(label) = label {
                vec![
                    StreamEvent::ToolCall {
                        index: 0,
                        id: "mock-vote".into(),
                        name: "vote".into(),
                        arguments: format!(
                            "{{\"target\":\"{label}\",\"reason\":\"mock consensus\"}}"
                        ),
                    },
                    StreamEvent::Done,
                ]
            } else {
                vec![
                    StreamEvent::TextDelta("no labels visible yet".into()),
                    StreamEvent::Done,
                ]
            }
        } else {
            let task = req
                .messages
                .iter()
                .find(|m| matches!(m.role, crate::Role::User))
                .and_then(|m| m.as_text())
                .unwrap_or("the task");
            let tag = if self.salt.is_empty() {
                String::new()
            } else {
                format!(" [{}]", self.salt)
            };
            let content = format!("MOCK ANSWER{tag}: {task}")
                .replace('"', "'")
                .replace('\n', " ");
            vec![
                StreamEvent::ToolCall {
                    index: 0,
                    id: "mock-answer".into(),
                    name: "new_answer".into(),
                    arguments: format!("{{\"content\":\"{content}\"}}"),
                },
                StreamEvent::Usage {
                    input_tokens: 20,
                    output_tokens: 10,
                },
                StreamEvent::Done,
            ]
        };
        let wrapped: Vec<anyhow::Result<StreamEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

/// Find the first `agent<N>.<k>` answer label in `text`.
fn find_answer_label(text: &str) -> Option<String> {
    for (pos, _) in text.match_indices("agent") {
        let rest = &text[pos + 5..];
        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        if digits.is_empty() {
            continue;
        }
        let after = &rest[digits.len()..];
        if !after.starts_with('.') {
            continue;
        }
        let sub: String = after[1..].chars().take_while(char::is_ascii_digit).collect();
        if sub.is_empty() {
            continue;
        }
        return Some(format!("agent{digits}.{sub}"));
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
