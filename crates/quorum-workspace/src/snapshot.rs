// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::WorkspaceError;

/// Immutable reference to a published workspace snapshot.
///
/// Snapshots are copies of an agent's workspace taken at answer-submission
/// time, plus the agent's `execution_trace.md`.  Once published they are
/// never modified; peers read them to review concrete artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub agent_id: String,
    pub answer_label: String,
    pub timestamp: DateTime<Utc>,
    pub snapshot_path: PathBuf,
    pub execution_trace_path: PathBuf,
}

/// Shared registry of all published snapshots for a run
/// (`historical_workspaces` in `status.json`).
///
/// Publication is atomic: the tree is staged, the trace written, everything
/// fsynced, and only then renamed into place and registered.  Readers never
/// observe a partially-populated snapshot.
#[derive(Clone)]
pub struct SnapshotStore {
    snapshots_dir: PathBuf,
    temp_dir: PathBuf,
    refs: Arc<Mutex<Vec<SnapshotRef>>>,
}

impl SnapshotStore {
    pub fn new(run_dir: &Path) -> std::io::Result<Self> {
        let snapshots_dir = run_dir.join("snapshots");
        let temp_dir = run_dir.join("temp_workspaces");
        fs::create_dir_all(&snapshots_dir)?;
        fs::create_dir_all(&temp_dir)?;
        Ok(Self {
            snapshots_dir,
            temp_dir,
            refs: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Atomically publish a snapshot of `workspace_root`.
    ///
    /// Steps: stage the tree copy, write `execution_trace.md`, fsync, rename
    /// into place, register.  Any failure before the rename aborts without
    /// publishing; the staged directory is removed best-effort.
    pub fn publish(
        &self,
        agent_id: &str,
        answer_label: &str,
        workspace_root: &Path,
        trace_markdown: &str,
    ) -> Result<SnapshotRef, WorkspaceError> {
        let timestamp = Utc::now();
        let stamp = timestamp.format("%Y%m%dT%H%M%S%.3f");
        let final_dir = self.snapshots_dir.join(format!("{agent_id}_{stamp}"));
        let staging_dir = self.snapshots_dir.join(format!(".staging_{agent_id}_{stamp}"));

        let result = self.stage(&staging_dir, workspace_root, trace_markdown);
        if let Err(source) = result {
            let _ = fs::remove_dir_all(&staging_dir);
            return Err(WorkspaceError::SnapshotFailed {
                agent_id: agent_id.to_string(),
                source,
            });
        }

        fs::rename(&staging_dir, &final_dir).map_err(|source| {
            let _ = fs::remove_dir_all(&staging_dir);
            WorkspaceError::SnapshotFailed {
                agent_id: agent_id.to_string(),
                source,
            }
        })?;

        let snapshot = SnapshotRef {
            agent_id: agent_id.to_string(),
            answer_label: answer_label.to_string(),
            timestamp,
            execution_trace_path: final_dir.join("execution_trace.md"),
            snapshot_path: final_dir,
        };
        debug!(
            agent_id,
            answer_label,
            path = %snapshot.snapshot_path.display(),
            "snapshot published"
        );
        self.refs.lock().unwrap().push(snapshot.clone());
        Ok(snapshot)
    }

    fn stage(
        &self,
        staging_dir: &Path,
        workspace_root: &Path,
        trace_markdown: &str,
    ) -> std::io::Result<()> {
        copy_tree(workspace_root, staging_dir)?;
        let trace_path = staging_dir.join("execution_trace.md");
        fs::write(&trace_path, trace_markdown)?;
        // fsync the trace file and the staged directory so the rename
        // publishes a fully-durable tree.
        fs::File::open(&trace_path)?.sync_all()?;
        fs::File::open(staging_dir)?.sync_all()?;
        Ok(())
    }

    /// Snapshot-at-read-time copy of the registry.  The list is append-only,
    /// so iterating the copy is race-free.
    pub fn historical(&self) -> Vec<SnapshotRef> {
        self.refs.lock().unwrap().clone()
    }

    pub fn for_agent(&self, agent_id: &str) -> Vec<SnapshotRef> {
        self.refs
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.agent_id == agent_id)
            .cloned()
            .collect()
    }

    pub fn by_label(&self, answer_label: &str) -> Option<SnapshotRef> {
        self.refs
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.answer_label == answer_label)
            .cloned()
    }

    /// Whether `path` lies inside any published snapshot (read-only access).
    pub fn covers(&self, path: &Path) -> bool {
        self.refs
            .lock()
            .unwrap()
            .iter()
            .any(|r| path.starts_with(&r.snapshot_path))
    }

    /// Copy a snapshot into `temp_workspaces/<agent>_turn_<k>/` so a peer
    /// can inspect it (including the execution trace) without touching the
    /// immutable original.
    pub fn materialize(
        &self,
        snapshot: &SnapshotRef,
        turn: u32,
    ) -> Result<PathBuf, WorkspaceError> {
        let dest = self
            .temp_dir
            .join(format!("{}_turn_{turn}", snapshot.agent_id));
        if dest.exists() {
            warn!(path = %dest.display(), "temp workspace already exists; replacing");
            fs::remove_dir_all(&dest).map_err(|e| WorkspaceError::io(&dest, e))?;
        }
        copy_tree(&snapshot.snapshot_path, &dest).map_err(|e| WorkspaceError::io(&dest, e))?;
        Ok(dest)
    }
}

/// Recursive tree copy.  Follows the directory structure only; symlinks are
/// skipped (a snapshot must not reach outside its own tree).
pub(crate) fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(std::io::Error::other)?;
        let target = dest.join(rel);
        let ty = entry.file_type();
        if ty.is_dir() {
            fs::create_dir_all(&target)?;
        } else if ty.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
