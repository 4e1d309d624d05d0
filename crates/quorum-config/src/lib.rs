// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Validated configuration for a coordination run.
//!
//! The schema rejects unknown options; [`loader::validate`] catches the
//! combinations serde cannot express (duplicate agent ids, missing API-key
//! environment variables, inverted timeout bounds).  All validation failures
//! are fatal before any agent starts streaming.

pub mod loader;
mod schema;

pub use loader::{load, resolve_run_dir, validate, ConfigError};
pub use schema::{
    AgentEntry, AsyncSubagentOptions, Config, ContextPathSpec, CoordinationOptions, CostConfig,
    HookSpec, HooksConfig, OrchestratorConfig, Permission, SubagentInjectionStrategy,
};
