// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// A single message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    ToolCall {
        tool_call_id: String,
        function: FunctionCall,
    },
    ToolResult {
        tool_call_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON argument string as sent back to the backend.
    pub arguments: String,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::ToolResult {
                tool_call_id: id.into(),
                content: content.into(),
            },
        }
    }

    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::ToolCall {
                tool_call_id: id.into(),
                function: FunctionCall {
                    name: name.into(),
                    arguments: arguments.into(),
                },
            },
        }
    }

    /// Plain text of this message when it is a simple text message.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Approximate token count used for context management.
    /// Uses the 4-chars-per-token heuristic.
    pub fn approx_tokens(&self) -> usize {
        let chars = match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::ToolCall { function, .. } => {
                function.name.len() + function.arguments.len()
            }
            MessageContent::ToolResult { content, .. } => content.len(),
        };
        chars / 4
    }
}

/// JSON-schema description of a tool, as exposed to a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// One streamed completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
}

/// Why a backend call failed, as far as policy cares.
///
/// The backend is responsible only for classifying its wire errors into
/// these kinds; what to do about them (compression retry, backoff, abort)
/// is decided upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum BackendErrorKind {
    /// The request exceeded the model's context window.
    ContextOverflow(String),
    /// The provider asked us to slow down.
    RateLimited(String),
    Other(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("backend error: {kind:?}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
}

impl BackendError {
    pub fn context_overflow(detail: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::ContextOverflow(detail.into()),
        }
    }

    pub fn rate_limited(detail: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::RateLimited(detail.into()),
        }
    }

    pub fn other(detail: impl Into<String>) -> Self {
        Self {
            kind: BackendErrorKind::Other(detail.into()),
        }
    }

    pub fn is_context_overflow(&self) -> bool {
        matches!(self.kind, BackendErrorKind::ContextOverflow(_))
    }
}

/// Check whether an error chain bottoms out in a context-overflow signal.
pub fn is_context_overflow(err: &anyhow::Error) -> bool {
    err.downcast_ref::<BackendError>()
        .map(BackendError::is_context_overflow)
        .unwrap_or(false)
}

/// Typed chunks yielded by a streaming backend call.
///
/// `ToolCall` chunks may arrive fragmented: the backend sends the id and
/// name once and streams `arguments` piecewise, keyed by `index` for
/// parallel tool calls.  Consumers accumulate per index.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta(String),
    /// A reasoning/thinking chunk (extended-thinking APIs).
    ReasoningDelta(String),
    ToolCall {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
    /// Terminal event of a successful stream.
    Done,
    /// Terminal event of a failed stream.
    Error(BackendError),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approx_tokens_uses_quarter_chars() {
        assert_eq!(Message::user("12345678").approx_tokens(), 2);
        assert_eq!(Message::assistant("abc").approx_tokens(), 0);
    }

    #[test]
    fn tool_call_tokens_count_name_and_args() {
        let m = Message::tool_call("c1", "grep", r#"{"pattern":"x"}"#);
        assert_eq!(m.approx_tokens(), (4 + 15) / 4);
    }

    #[test]
    fn as_text_only_for_plain_text() {
        assert_eq!(Message::user("hi").as_text(), Some("hi"));
        assert!(Message::tool_result("c1", "out").as_text().is_none());
    }

    #[test]
    fn context_overflow_detected_through_anyhow_chain() {
        let err = anyhow::Error::new(BackendError::context_overflow("n_ctx=8192"));
        assert!(is_context_overflow(&err));
        let other = anyhow::Error::new(BackendError::rate_limited("429"));
        assert!(!is_context_overflow(&other));
    }

    #[test]
    fn backend_error_kind_serializes_snake_case() {
        let k = BackendErrorKind::ContextOverflow("x".into());
        let json = serde_json::to_string(&k).unwrap();
        assert!(json.contains("context_overflow"));
    }
}
