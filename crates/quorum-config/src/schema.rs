// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper that returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless explicitly
/// disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_max_background() -> usize {
    4
}

fn default_subagent_min_timeout() -> u64 {
    60
}

fn default_subagent_max_timeout() -> u64 {
    600
}

fn default_subagent_default_timeout() -> u64 {
    300
}

fn default_max_enforcement_retries() -> u32 {
    3
}

fn default_answer_limit() -> u32 {
    5
}

fn default_tool_timeout() -> u64 {
    120
}

fn default_hook_timeout() -> u64 {
    30
}

/// Top-level configuration for one coordination run.
///
/// Unknown keys anywhere in the tree are rejected at parse time so that a
/// typo in an option name fails loudly before coordination starts instead
/// of silently running with defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The fixed set of agents participating in the run.  Membership does
    /// not change mid-run.
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
    /// External directories mounted into every agent workspace with
    /// explicit permissions and optional protected subpaths.
    #[serde(default)]
    pub context_paths: Vec<ContextPathSpec>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Global hooks, applied to all agents (per-agent hooks extend these
    /// unless the agent sets `override: true`).
    #[serde(default)]
    pub hooks: HooksConfig,
    /// Root directory for workspaces, snapshots, and run logs.
    /// Defaults to `.quorum/runs` under the current directory.
    #[serde(default)]
    pub run_dir: Option<PathBuf>,
    #[serde(default)]
    pub costs: CostConfig,
}

/// One configured agent: identity plus backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentEntry {
    /// Stable identifier, unique within the run.  Used in answer labels,
    /// workspace directory names, and `status.json`.
    pub id: String,
    /// Backend driver identifier (e.g. "mock", "scripted").  Wire-format
    /// adapters are supplied by the embedder; this field selects which one.
    pub backend: String,
    /// Model name forwarded to the backend.
    pub model: String,
    /// Environment variable holding the backend API key.  When set, the
    /// variable must exist at validation time: a missing key is a fatal
    /// configuration error, not a runtime surprise mid-coordination.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Per-agent hooks.  Extend the global set by default; replace it for
    /// this agent when `override: true` is set inside.
    #[serde(default)]
    pub hooks: HooksConfig,
}

impl AgentEntry {
    /// Display form used in injection messages and logs: `id (model)`.
    pub fn display_name(&self) -> String {
        format!("{} ({})", self.id, self.model)
    }
}

/// Permission granted on a mounted context path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    #[default]
    Read,
    Write,
}

/// An external directory visible inside agent workspaces.
///
/// During coordination all context paths are effectively read-only; `Write`
/// permission only takes effect for the winning agent during final
/// presentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextPathSpec {
    /// Absolute path to the mounted directory.
    pub path: PathBuf,
    #[serde(default)]
    pub permission: Permission,
    /// Subpaths that must never be modified or deleted, under any
    /// permission.  Must resolve under `path`.
    #[serde(default)]
    pub protected: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub coordination: CoordinationOptions,
}

/// Options steering the coordination protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinationOptions {
    /// Describe side-effecting tools during enforcement instead of running
    /// them; only the winner executes them during presentation.
    #[serde(default)]
    pub enable_planning_mode: bool,
    /// Single-agent fast path: no vote tool is injected and the sole answer
    /// wins immediately.
    #[serde(default)]
    pub skip_voting: bool,
    /// Disable mid-run peer-answer injection.  Agents only see peer answers
    /// between their own turns.
    #[serde(default)]
    pub disable_injection: bool,
    /// With injection disabled, hold early finishers until every agent has
    /// submitted at least one answer before opening the voting phase.
    #[serde(default)]
    pub defer_voting_until_all_answered: bool,
    /// Skip the winner's final-presentation turn entirely.
    #[serde(default)]
    pub skip_final_presentation: bool,
    #[serde(default)]
    pub async_subagents: AsyncSubagentOptions,
    /// Lower clamp for requested subagent timeouts, in seconds.
    #[serde(default = "default_subagent_min_timeout")]
    pub subagent_min_timeout: u64,
    /// Upper clamp for requested subagent timeouts, in seconds.
    #[serde(default = "default_subagent_max_timeout")]
    pub subagent_max_timeout: u64,
    /// Timeout applied when a spawn request does not specify one, in seconds.
    #[serde(default = "default_subagent_default_timeout")]
    pub subagent_default_timeout: u64,
    /// Workflow-protocol restarts allowed per agent before it is marked
    /// non-compliant and dropped for the round.
    #[serde(default = "default_max_enforcement_retries")]
    pub max_enforcement_retries: u32,
    /// Maximum `new_answer` submissions per agent per run.
    #[serde(default = "default_answer_limit")]
    pub answer_limit: u32,
    /// Per-tool execution timeout, in seconds.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout: u64,
    /// Overall wall-clock budget for the whole coordination, in seconds.
    /// `None` means unbounded.
    #[serde(default)]
    pub coordination_timeout: Option<u64>,
}

impl Default for CoordinationOptions {
    fn default() -> Self {
        Self {
            enable_planning_mode: false,
            skip_voting: false,
            disable_injection: false,
            defer_voting_until_all_answered: false,
            skip_final_presentation: false,
            async_subagents: AsyncSubagentOptions::default(),
            subagent_min_timeout: default_subagent_min_timeout(),
            subagent_max_timeout: default_subagent_max_timeout(),
            subagent_default_timeout: default_subagent_default_timeout(),
            max_enforcement_retries: default_max_enforcement_retries(),
            answer_limit: default_answer_limit(),
            tool_timeout: default_tool_timeout(),
            coordination_timeout: None,
        }
    }
}

/// How a completed background subagent's result reaches the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubagentInjectionStrategy {
    /// Append to the parent's current tool response (cache-friendly).
    #[default]
    ToolResult,
    /// Deliver as a follow-up user message.
    UserMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AsyncSubagentOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub injection_strategy: SubagentInjectionStrategy,
    /// Also inject periodic progress updates, not just completions.
    #[serde(default)]
    pub inject_progress: bool,
    /// Concurrent background subagents; excess tasks queue.
    #[serde(default = "default_max_background")]
    pub max_background: usize,
}

impl Default for AsyncSubagentOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            injection_strategy: SubagentInjectionStrategy::default(),
            inject_progress: false,
            max_background: default_max_background(),
        }
    }
}

/// Hook registration block, usable globally and per-agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HooksConfig {
    #[serde(default)]
    pub pre_tool_use: Vec<HookSpec>,
    #[serde(default)]
    pub post_tool_use: Vec<HookSpec>,
    /// When set on a per-agent block, the agent's hooks REPLACE the global
    /// ones for that event instead of extending them.
    #[serde(default, rename = "override")]
    pub override_globals: bool,
}

impl HooksConfig {
    pub fn is_empty(&self) -> bool {
        self.pre_tool_use.is_empty() && self.post_tool_use.is_empty()
    }
}

/// One externally-registered hook: a command speaking the JSON
/// stdin/stdout protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookSpec {
    /// Glob on the tool name (`*` and `?`).  Absent means match-all.
    #[serde(default)]
    pub matcher: Option<String>,
    /// Command line to spawn.  Receives a `HookEvent` JSON line on stdin
    /// and must write a `HookResult` JSON line on stdout.
    pub command: String,
    #[serde(default = "default_hook_timeout")]
    pub timeout: u64,
}

/// Flat per-1k-token rate table used for the estimated-cost field in
/// `status.json`.  Zero rates are valid; the cost figure is informational
/// and only required to be monotonic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CostConfig {
    #[serde(default)]
    pub input_per_1k: f64,
    #[serde(default)]
    pub output_per_1k: f64,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordination_defaults_match_documented_timeouts() {
        let c = CoordinationOptions::default();
        assert_eq!(c.subagent_min_timeout, 60);
        assert_eq!(c.subagent_max_timeout, 600);
        assert_eq!(c.subagent_default_timeout, 300);
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let yaml = "agents: []\nnot_an_option: true\n";
        let result: Result<Config, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_coordination_option_is_rejected() {
        let yaml = "orchestrator:\n  coordination:\n    skip_votin: true\n";
        let result: Result<Config, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn minimal_agent_entry_parses() {
        let yaml = "agents:\n  - id: a1\n    backend: mock\n    model: mock-model\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.agents.len(), 1);
        assert_eq!(cfg.agents[0].display_name(), "a1 (mock-model)");
    }

    #[test]
    fn context_path_defaults_to_read() {
        let yaml = "context_paths:\n  - path: /srv/data\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.context_paths[0].permission, Permission::Read);
        assert!(cfg.context_paths[0].protected.is_empty());
    }

    #[test]
    fn per_agent_hook_override_flag_parses() {
        let yaml = r#"
agents:
  - id: a1
    backend: mock
    model: m
    hooks:
      override: true
      post_tool_use:
        - command: ./check.sh
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.agents[0].hooks.override_globals);
        assert_eq!(cfg.agents[0].hooks.post_tool_use[0].timeout, 30);
    }

    #[test]
    fn async_subagents_default_on_with_four_slots() {
        let opts = AsyncSubagentOptions::default();
        assert!(opts.enabled);
        assert_eq!(opts.max_background, 4);
        assert_eq!(
            opts.injection_strategy,
            SubagentInjectionStrategy::ToolResult
        );
    }
}
