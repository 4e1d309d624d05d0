// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Hook firing points around a tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEventKind {
    PreToolUse,
    PostToolUse,
}

impl HookEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreToolUse => "PreToolUse",
            Self::PostToolUse => "PostToolUse",
        }
    }
}

/// The payload a hook handler receives.  Handlers get a copy; they never
/// touch core state directly, and they never hold core locks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookEvent {
    pub event: HookEventKind,
    pub tool_name: String,
    pub agent_id: String,
    pub session_id: String,
    /// Tool input as the pipeline currently sees it (PreToolUse hooks may
    /// have already chained modifications onto it).
    pub input: serde_json::Value,
    /// Normalized tool result text; present for PostToolUse only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Whether the tool execution errored; PostToolUse only.
    #[serde(default)]
    pub is_error: bool,
}

/// What a single hook handler decided.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<HookDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Replacement tool input (PreToolUse).  Chained across hooks in
    /// registration order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_input: Option<serde_json::Value>,
    /// Content to inject after the tool (PostToolUse).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inject: Option<Injection>,
}

impl HookResult {
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            decision: Some(HookDecision::Deny),
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn update_input(input: serde_json::Value) -> Self {
        Self {
            updated_input: Some(input),
            ..Self::default()
        }
    }

    pub fn inject(content: impl Into<String>, strategy: InjectionStrategy) -> Self {
        Self {
            inject: Some(Injection {
                content: content.into(),
                strategy,
            }),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookDecision {
    Allow,
    Deny,
    Ask,
}

/// A post-tool injection payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Injection {
    pub content: String,
    #[serde(default)]
    pub strategy: InjectionStrategy,
}

/// Where injected content lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionStrategy {
    /// Appended to the current tool result (cache-friendly: no new message).
    #[default]
    ToolResult,
    /// Delivered as a follow-up user message.
    UserMessage,
}

/// How a hook handler failed.  The distinction matters for policy:
/// spawn failures fail closed (deny the tool), runtime failures and
/// timeouts fail open (log and continue).
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("hook could not be started: {0}")]
    Spawn(String),
    #[error("hook failed at runtime: {0}")]
    Runtime(String),
    #[error("hook protocol error: {0}")]
    Protocol(String),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_result_roundtrips_json() {
        let r = HookResult::deny("blocked by policy");
        let json = serde_json::to_string(&r).unwrap();
        let back: HookResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.decision, Some(HookDecision::Deny));
        assert_eq!(back.reason.as_deref(), Some("blocked by policy"));
    }

    #[test]
    fn empty_result_parses_as_allow() {
        let r: HookResult = serde_json::from_str("{}").unwrap();
        assert!(r.decision.is_none());
        assert!(r.updated_input.is_none());
        assert!(r.inject.is_none());
    }

    #[test]
    fn injection_strategy_defaults_to_tool_result() {
        let r: HookResult =
            serde_json::from_str(r#"{"inject": {"content": "note"}}"#).unwrap();
        assert_eq!(r.inject.unwrap().strategy, InjectionStrategy::ToolResult);
    }

    #[test]
    fn event_kind_names_match_protocol() {
        assert_eq!(HookEventKind::PreToolUse.as_str(), "PreToolUse");
        assert_eq!(
            serde_json::to_string(&HookEventKind::PostToolUse).unwrap(),
            "\"PostToolUse\""
        );
    }
}
