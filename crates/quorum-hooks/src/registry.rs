// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

use quorum_config::{HookSpec, HooksConfig};

use crate::event::{
    HookDecision, HookError, HookEvent, HookEventKind, HookResult, Injection,
};
use crate::external::ExternalCommandHook;

/// A hook handler: in-process callable or external command.
#[async_trait]
pub trait HookHandler: Send + Sync {
    /// Stable name for logs and deny reasons.
    fn name(&self) -> &str;
    async fn handle(&self, event: &HookEvent) -> Result<HookResult, HookError>;
}

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// One registered hook.
#[derive(Clone)]
pub struct RegisteredHook {
    pub event: HookEventKind,
    matcher: Option<Regex>,
    handler: Arc<dyn HookHandler>,
    timeout: Duration,
}

impl RegisteredHook {
    pub fn new(
        event: HookEventKind,
        matcher: Option<&str>,
        handler: Arc<dyn HookHandler>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            event,
            matcher: matcher.and_then(glob_to_regex),
            handler,
            timeout: timeout.unwrap_or(DEFAULT_HOOK_TIMEOUT),
        }
    }

    /// Absent matcher means match-all.
    fn matches(&self, tool_name: &str) -> bool {
        match &self.matcher {
            Some(re) => re.is_match(tool_name),
            None => true,
        }
    }
}

#[derive(Default, Clone)]
struct AgentHooks {
    hooks: Vec<RegisteredHook>,
    override_globals: bool,
}

/// Global + per-agent hook registration with ordered aggregation.
///
/// Per-agent hooks extend the global set by default; with `override` set,
/// the agent's hooks replace the globals for any event the agent registers
/// hooks for.
#[derive(Default, Clone)]
pub struct HookRegistry {
    global: Vec<RegisteredHook>,
    per_agent: HashMap<String, AgentHooks>,
}

/// Aggregated PreToolUse outcome across all matching hooks.
#[derive(Debug, Default)]
pub struct PreToolOutcome {
    /// First deny wins; carries `(hook_name, reason)`.
    pub denied: Option<(String, String)>,
    /// Whether any hook asked for interactive approval.
    pub ask: bool,
    /// Final input after chaining all `updated_input` values in
    /// registration order.
    pub input: serde_json::Value,
}

/// Aggregated PostToolUse outcome: injections concatenate in order.
#[derive(Debug, Default)]
pub struct PostToolOutcome {
    pub injections: Vec<Injection>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_global(&mut self, hook: RegisteredHook) {
        self.global.push(hook);
    }

    pub fn register_for_agent(&mut self, agent_id: &str, hook: RegisteredHook) {
        self.per_agent
            .entry(agent_id.to_string())
            .or_default()
            .hooks
            .push(hook);
    }

    pub fn set_agent_override(&mut self, agent_id: &str, override_globals: bool) {
        self.per_agent
            .entry(agent_id.to_string())
            .or_default()
            .override_globals = override_globals;
    }

    /// Build a registry from config blocks (external command hooks).
    /// In-process built-ins are registered separately by the core.
    pub fn from_config(global: &HooksConfig, agents: &[(String, HooksConfig)]) -> Self {
        let mut registry = Self::new();
        for (event, specs) in [
            (HookEventKind::PreToolUse, &global.pre_tool_use),
            (HookEventKind::PostToolUse, &global.post_tool_use),
        ] {
            for spec in specs {
                registry.register_global(hook_from_spec(event, spec));
            }
        }
        for (agent_id, cfg) in agents {
            registry.set_agent_override(agent_id, cfg.override_globals);
            for (event, specs) in [
                (HookEventKind::PreToolUse, &cfg.pre_tool_use),
                (HookEventKind::PostToolUse, &cfg.post_tool_use),
            ] {
                for spec in specs {
                    registry.register_for_agent(agent_id, hook_from_spec(event, spec));
                }
            }
        }
        registry
    }

    /// Hooks that apply for `(agent_id, event)`, in registration order:
    /// globals first, then the agent's own, unless the agent overrides and
    /// has hooks for this event, in which case only the agent's run.
    fn applicable(&self, agent_id: &str, event: HookEventKind) -> Vec<RegisteredHook> {
        let agent = self.per_agent.get(agent_id);
        let agent_hooks: Vec<RegisteredHook> = agent
            .map(|a| {
                a.hooks
                    .iter()
                    .filter(|h| h.event == event)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let overriding = agent.map(|a| a.override_globals).unwrap_or(false);
        if overriding && !agent_hooks.is_empty() {
            return agent_hooks;
        }
        self.global
            .iter()
            .filter(|h| h.event == event)
            .cloned()
            .chain(agent_hooks)
            .collect()
    }

    /// Fire all matching PreToolUse hooks and aggregate.
    ///
    /// Any `deny` wins immediately.  `updated_input` values chain: each hook
    /// sees the input as modified by its predecessors.  Timeouts and runtime
    /// failures fail open; spawn failures fail closed.
    pub async fn fire_pre(&self, mut event: HookEvent) -> PreToolOutcome {
        debug_assert_eq!(event.event, HookEventKind::PreToolUse);
        let mut outcome = PreToolOutcome {
            input: event.input.clone(),
            ..Default::default()
        };
        for hook in self.applicable(&event.agent_id, HookEventKind::PreToolUse) {
            if !hook.matches(&event.tool_name) {
                continue;
            }
            match self.run_one(&hook, &event).await {
                Ok(result) => {
                    if result.decision == Some(HookDecision::Deny) {
                        let reason = result
                            .reason
                            .unwrap_or_else(|| "denied by hook".to_string());
                        outcome.denied = Some((hook.handler.name().to_string(), reason));
                        return outcome;
                    }
                    if result.decision == Some(HookDecision::Ask) {
                        outcome.ask = true;
                    }
                    if let Some(updated) = result.updated_input {
                        outcome.input = updated.clone();
                        event.input = updated;
                    }
                }
                Err(HookError::Spawn(msg)) => {
                    // Fail closed: a hook that cannot even start must not be
                    // silently bypassed.
                    outcome.denied = Some((hook.handler.name().to_string(), msg));
                    return outcome;
                }
                Err(err) => {
                    warn!(hook = hook.handler.name(), %err, "pre-tool hook failed open");
                }
            }
        }
        outcome
    }

    /// Fire all matching PostToolUse hooks; injections concatenate.
    pub async fn fire_post(&self, event: &HookEvent) -> PostToolOutcome {
        debug_assert_eq!(event.event, HookEventKind::PostToolUse);
        let mut outcome = PostToolOutcome::default();
        for hook in self.applicable(&event.agent_id, HookEventKind::PostToolUse) {
            if !hook.matches(&event.tool_name) {
                continue;
            }
            match self.run_one(&hook, event).await {
                Ok(result) => {
                    if let Some(inject) = result.inject {
                        outcome.injections.push(inject);
                    }
                }
                Err(err) => {
                    // PostToolUse has nothing to deny; every failure mode
                    // fails open.
                    warn!(hook = hook.handler.name(), %err, "post-tool hook failed open");
                }
            }
        }
        outcome
    }

    async fn run_one(
        &self,
        hook: &RegisteredHook,
        event: &HookEvent,
    ) -> Result<HookResult, HookError> {
        match tokio::time::timeout(hook.timeout, hook.handler.handle(event)).await {
            Ok(result) => result,
            Err(_) => Err(HookError::Runtime(format!(
                "timed out after {:?}",
                hook.timeout
            ))),
        }
    }
}

fn hook_from_spec(event: HookEventKind, spec: &HookSpec) -> RegisteredHook {
    RegisteredHook::new(
        event,
        spec.matcher.as_deref(),
        Arc::new(ExternalCommandHook::new(spec.command.clone())),
        Some(Duration::from_secs(spec.timeout)),
    )
}

/// Convert a simple glob (`*`, `?`) to an anchored [`Regex`].
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
