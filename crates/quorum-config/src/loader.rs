// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// A configuration problem detected before coordination starts.
/// All variants are fatal, pre-run.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no agents configured")]
    NoAgents,
    #[error("duplicate agent id: {0}")]
    DuplicateAgentId(String),
    #[error("agent id {0:?} is empty or contains whitespace")]
    InvalidAgentId(String),
    #[error("agent {agent}: api_key_env {var} is not set in the environment")]
    MissingApiKey { agent: String, var: String },
    #[error("context path {0} is not absolute")]
    RelativeContextPath(PathBuf),
    #[error("protected path {protected} does not resolve under context path {root}")]
    ProtectedOutsideRoot { protected: PathBuf, root: PathBuf },
    #[error(
        "subagent timeouts must satisfy min <= default <= max \
         (got min={min}, default={default}, max={max})"
    )]
    SubagentTimeoutOrder { min: u64, default: u64, max: u64 },
    #[error("defer_voting_until_all_answered requires disable_injection")]
    DeferWithoutDisabledInjection,
    #[error("hook command is empty (matcher {0:?})")]
    EmptyHookCommand(Option<String>),
}

/// Load and validate a config file.  The path is mandatory here; the CLI
/// resolves search locations before calling in.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    debug!(path = %path.display(), "loading config");
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let expanded = shellexpand::env(&text)
        .map(|s| s.into_owned())
        .unwrap_or(text);
    let config: Config = serde_yaml::from_str(&expanded)
        .with_context(|| format!("parsing {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

/// Semantic validation of an already-parsed config.
///
/// Structural problems (unknown keys, type mismatches) are caught by serde;
/// this checks the combinations serde cannot see.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.agents.is_empty() {
        return Err(ConfigError::NoAgents);
    }

    let mut seen = HashSet::new();
    for agent in &config.agents {
        if agent.id.is_empty() || agent.id.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidAgentId(agent.id.clone()));
        }
        if !seen.insert(agent.id.as_str()) {
            return Err(ConfigError::DuplicateAgentId(agent.id.clone()));
        }
        if let Some(var) = &agent.api_key_env {
            if std::env::var(var).is_err() {
                return Err(ConfigError::MissingApiKey {
                    agent: agent.id.clone(),
                    var: var.clone(),
                });
            }
        }
    }

    for spec in &config.context_paths {
        if !spec.path.is_absolute() {
            return Err(ConfigError::RelativeContextPath(spec.path.clone()));
        }
        for protected in &spec.protected {
            // Protected entries may be given relative to the context root or
            // as absolute paths already under it.
            let resolved = if protected.is_absolute() {
                protected.clone()
            } else {
                spec.path.join(protected)
            };
            if !resolved.starts_with(&spec.path) {
                return Err(ConfigError::ProtectedOutsideRoot {
                    protected: protected.clone(),
                    root: spec.path.clone(),
                });
            }
        }
    }

    let coord = &config.orchestrator.coordination;
    if !(coord.subagent_min_timeout <= coord.subagent_default_timeout
        && coord.subagent_default_timeout <= coord.subagent_max_timeout)
    {
        return Err(ConfigError::SubagentTimeoutOrder {
            min: coord.subagent_min_timeout,
            default: coord.subagent_default_timeout,
            max: coord.subagent_max_timeout,
        });
    }
    if coord.defer_voting_until_all_answered && !coord.disable_injection {
        return Err(ConfigError::DeferWithoutDisabledInjection);
    }

    let all_hooks = std::iter::once(&config.hooks)
        .chain(config.agents.iter().map(|a| &a.hooks));
    for hooks in all_hooks {
        for spec in hooks.pre_tool_use.iter().chain(&hooks.post_tool_use) {
            if spec.command.trim().is_empty() {
                return Err(ConfigError::EmptyHookCommand(spec.matcher.clone()));
            }
        }
    }

    Ok(())
}

/// Resolve the run directory: explicit config value, else `.quorum/runs`
/// under the current directory.
pub fn resolve_run_dir(config: &Config) -> PathBuf {
    config
        .run_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(".quorum/runs"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
