// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Offline end-to-end smoke test: two workflow-aware mock agents coordinate
//! to a final answer, exactly as `quorum run` does with `backend: mock`.

use std::collections::HashMap;
use std::sync::Arc;

use quorum_config::{AgentEntry, Config};
use quorum_core::{read_status, CoordinationScheduler, Phase};
use quorum_model::{ChatBackend, WorkflowEchoBackend};

fn mock_agent(id: &str) -> AgentEntry {
    AgentEntry {
        id: id.into(),
        backend: "mock".into(),
        model: "workflow-mock".into(),
        api_key_env: None,
        hooks: Default::default(),
    }
}

#[tokio::test]
async fn two_mock_agents_converge_offline() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        agents: vec![mock_agent("alpha"), mock_agent("beta")],
        ..Config::default()
    };
    quorum_config::validate(&config).unwrap();

    let mut backends: HashMap<String, Arc<dyn ChatBackend>> = HashMap::new();
    for agent in &config.agents {
        backends.insert(
            agent.id.clone(),
            Arc::new(WorkflowEchoBackend::salted(&agent.id)),
        );
    }

    let scheduler = CoordinationScheduler::new(config, backends, dir.path().into());
    let outcome = scheduler.run("what color is the sky?").await.unwrap();

    assert_eq!(outcome.phase, Phase::Done);
    let winner = outcome.winner_label.expect("a winner must be selected");
    assert!(winner.starts_with("agent"));
    assert!(outcome.final_answer.is_some());
    let final_label = outcome.final_label.expect("final label assigned");
    assert!(final_label.ends_with(".final"));

    // The status file is the single source of truth and survives the run.
    let status = read_status(dir.path()).unwrap();
    assert_eq!(status.coordination.phase, Phase::Done);
    assert_eq!(status.coordination.completion_percentage, 100);
    assert!(status.costs.total_input_tokens > 0);
    assert!(!status.historical_workspaces.is_empty());
    for ws in &status.historical_workspaces {
        assert!(ws.workspace_path.join("execution_trace.md").exists());
    }
}

#[tokio::test]
async fn single_mock_agent_quick_mode() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config {
        agents: vec![mock_agent("solo")],
        ..Config::default()
    };
    config.orchestrator.coordination.skip_voting = true;

    let mut backends: HashMap<String, Arc<dyn ChatBackend>> = HashMap::new();
    backends.insert("solo".into(), Arc::new(WorkflowEchoBackend::new()));

    let scheduler = CoordinationScheduler::new(config, backends, dir.path().into());
    let outcome = scheduler.run("say hello").await.unwrap();

    assert_eq!(outcome.phase, Phase::Done);
    assert_eq!(outcome.winner_label.as_deref(), Some("agent1.1"));
}
