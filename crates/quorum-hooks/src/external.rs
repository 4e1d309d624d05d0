// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::event::{HookError, HookEvent, HookResult};
use crate::registry::HookHandler;

/// A hook implemented as an external command.
///
/// Protocol: the spawned process receives one JSON line of [`HookEvent`] on
/// stdin and must write one JSON line of [`HookResult`] on stdout before the
/// registered timeout expires.  `HOOK_TYPE`, `TOOL_NAME`, `SESSION_ID`, and
/// `AGENT_ID` are carried in the environment for handlers that only need
/// routing information.
pub struct ExternalCommandHook {
    command: String,
}

impl ExternalCommandHook {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl HookHandler for ExternalCommandHook {
    fn name(&self) -> &str {
        &self.command
    }

    async fn handle(&self, event: &HookEvent) -> Result<HookResult, HookError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| HookError::Protocol(format!("serializing event: {e}")))?;

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("HOOK_TYPE", event.event.as_str())
            .env("TOOL_NAME", &event.tool_name)
            .env("SESSION_ID", &event.session_id)
            .env("AGENT_ID", &event.agent_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| HookError::Spawn(format!("{}: {e}", self.command)))?;

        {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| HookError::Spawn("stdin unavailable".into()))?;
            stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(|e| HookError::Runtime(format!("writing event: {e}")))?;
            stdin
                .write_all(b"\n")
                .await
                .map_err(|e| HookError::Runtime(format!("writing event: {e}")))?;
            // Dropping stdin closes it so line-oriented handlers see EOF.
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| HookError::Runtime(format!("waiting for hook: {e}")))?;
        if !output.status.success() {
            // 127 = command not found: the handler itself is missing, which
            // fails closed like an import error would.
            if output.status.code() == Some(127) {
                return Err(HookError::Spawn(format!("{}: not found", self.command)));
            }
            return Err(HookError::Runtime(format!(
                "{} exited with {}",
                self.command, output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("{}");
        debug!(command = %self.command, response = %line, "hook responded");
        serde_json::from_str(line)
            .map_err(|e| HookError::Protocol(format!("parsing hook result: {e}")))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::event::{HookDecision, HookEventKind};

    fn event(tool: &str) -> HookEvent {
        HookEvent {
            event: HookEventKind::PreToolUse,
            tool_name: tool.into(),
            agent_id: "a1".into(),
            session_id: "s1".into(),
            input: json!({"path": "x"}),
            result: None,
            is_error: false,
        }
    }

    #[tokio::test]
    async fn echo_allow_result() {
        let hook = ExternalCommandHook::new("echo '{}'");
        let r = hook.handle(&event("read_file")).await.unwrap();
        assert!(r.decision.is_none());
    }

    #[tokio::test]
    async fn deny_result_parses() {
        let hook =
            ExternalCommandHook::new(r#"echo '{"decision":"deny","reason":"not allowed"}'"#);
        let r = hook.handle(&event("delete_file")).await.unwrap();
        assert_eq!(r.decision, Some(HookDecision::Deny));
    }

    #[tokio::test]
    async fn env_vars_are_forwarded() {
        let hook = ExternalCommandHook::new(
            r#"test "$TOOL_NAME" = grep -a "$HOOK_TYPE" = PreToolUse && echo '{}' || exit 1"#,
        );
        assert!(hook.handle(&event("grep")).await.is_ok());
    }

    #[tokio::test]
    async fn stdin_carries_event_json() {
        // The handler reads the event and echoes the tool name back in the
        // deny reason, proving stdin delivery.
        let hook = ExternalCommandHook::new(
            r#"read line; printf '{"decision":"deny","reason":"%s"}' "$(printf '%s' "$line" | grep -o '"tool_name":"[a-z_]*"' | head -1)""#,
        );
        let r = hook.handle(&event("write_file")).await.unwrap();
        assert!(r.reason.unwrap().contains("write_file"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_runtime_error() {
        let hook = ExternalCommandHook::new("exit 3");
        let err = hook.handle(&event("x")).await.unwrap_err();
        assert!(matches!(err, HookError::Runtime(_)));
    }

    #[tokio::test]
    async fn garbage_output_is_protocol_error() {
        let hook = ExternalCommandHook::new("echo not-json");
        let err = hook.handle(&event("x")).await.unwrap_err();
        assert!(matches!(err, HookError::Protocol(_)));
    }
}
