// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Multi-agent coordination engine: N parallel LLM agents converge on a
/// single answer through an observe-refine-vote protocol.
#[derive(Parser, Debug)]
#[command(name = "quorum", version, about)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr (RUST_LOG-style filters via QUORUM_LOG).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one coordination over a task and print the winning answer.
    Run {
        /// The user task for the agents.
        task: String,

        /// Override the run directory (default: from config, else
        /// .quorum/runs/<timestamp>).
        #[arg(long)]
        run_dir: Option<PathBuf>,

        /// Overall coordination timeout (e.g. "90s", "10m"); overrides the
        /// configured value.
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Option<std::time::Duration>,
    },

    /// Validate the configuration and print the resolved form.
    ShowConfig,
}
