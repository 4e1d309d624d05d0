// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use quorum_config::Config;
use quorum_core::{CoordinationScheduler, NestedCoordinationSpawner, Phase};
use quorum_model::{ChatBackend, WorkflowEchoBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("quorum.yaml"));
    let config = quorum_config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    match cli.command {
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Commands::Run {
            task,
            run_dir,
            timeout,
        } => run_coordination(config, &task, run_dir, timeout).await,
    }
}

async fn run_coordination(
    mut config: Config,
    task: &str,
    run_dir: Option<PathBuf>,
    timeout: Option<std::time::Duration>,
) -> anyhow::Result<()> {
    if let Some(t) = timeout {
        config.orchestrator.coordination.coordination_timeout = Some(t.as_secs().max(1));
    }

    let run_dir = run_dir.unwrap_or_else(|| {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        quorum_config::resolve_run_dir(&config).join(stamp.to_string())
    });

    let backends = build_backends(&config)?;
    // Subagents run as nested single-agent coordinations on the same
    // offline driver the parents use.
    let spawner = NestedCoordinationSpawner::new(Arc::new(|id: &str| {
        Arc::new(WorkflowEchoBackend::salted(id)) as Arc<dyn ChatBackend>
    }));
    let scheduler = CoordinationScheduler::new(config, backends, run_dir)
        .with_subagent_spawner(Arc::new(spawner));
    let outcome = scheduler.run(task).await?;

    match outcome.phase {
        Phase::Done => {
            if let Some(label) = &outcome.winner_label {
                eprintln!("winner: {label}");
            }
            println!("{}", outcome.final_answer.as_deref().unwrap_or(""));
            eprintln!("status: {}", outcome.status_path.display());
            Ok(())
        }
        phase => {
            bail!(
                "coordination ended in phase {phase:?}; see {} for details",
                outcome.status_path.display()
            )
        }
    }
}

/// Resolve each agent's backend driver.
///
/// Wire-format adapters (Anthropic/OpenAI/Gemini HTTP drivers) are supplied
/// by embedders through [`CoordinationScheduler`]; the CLI itself only
/// ships the offline `mock` driver, which is enough to exercise the
/// coordination protocol end to end.
fn build_backends(config: &Config) -> anyhow::Result<HashMap<String, Arc<dyn ChatBackend>>> {
    let mut backends: HashMap<String, Arc<dyn ChatBackend>> = HashMap::new();
    for agent in &config.agents {
        let backend: Arc<dyn ChatBackend> = match agent.backend.as_str() {
            "mock" => Arc::new(WorkflowEchoBackend::salted(&agent.id)),
            other => bail!(
                "agent {}: unknown backend driver {other:?} (the CLI ships \
                 only \"mock\"; real drivers are registered by the embedding \
                 application)",
                agent.id
            ),
        };
        backends.insert(agent.id.clone(), backend);
    }
    Ok(backends)
}

fn init_logging(verbose: bool) {
    if !verbose && std::env::var("QUORUM_LOG").is_err() {
        return;
    }
    let filter = EnvFilter::try_from_env("QUORUM_LOG")
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "info" } else { "warn" }));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}
