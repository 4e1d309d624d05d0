// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use quorum_config::{ContextPathSpec, Permission};

use crate::error::WorkspaceError;
use crate::snapshot::SnapshotStore;

/// Extensions whose files are read-blocked by default.  Feeding raw media or
/// object code into a model context is never useful and often enormous.
const BINARY_EXTENSIONS: &[&str] = &[
    "mp3", "wav", "ogg", "flac", "mp4", "avi", "mkv", "mov", "webm", "o", "so", "a", "dylib",
    "dll", "exe", "bin", "class", "pyc", "zip", "tar", "gz", "bz2", "xz", "7z",
];

/// A context path mounted into a workspace, with resolved protected
/// subpaths.
#[derive(Debug, Clone)]
pub struct ContextPath {
    pub root: PathBuf,
    pub permission: Permission,
    pub protected: Vec<PathBuf>,
}

impl ContextPath {
    pub fn from_spec(spec: &ContextPathSpec) -> Self {
        let protected = spec
            .protected
            .iter()
            .map(|p| {
                if p.is_absolute() {
                    p.clone()
                } else {
                    spec.path.join(p)
                }
            })
            .collect();
        Self {
            root: spec.path.clone(),
            permission: spec.permission,
            protected,
        }
    }
}

/// One agent's isolated directory plus its mounted context paths.
///
/// The workspace is the root against which all relative tool paths resolve.
/// During coordination every context path is effectively read-only; write
/// access is switched on only for the winner at the final-presentation
/// boundary.
pub struct Workspace {
    pub agent_id: String,
    pub root: PathBuf,
    context_paths: Vec<ContextPath>,
    snapshots: SnapshotStore,
    write_access: bool,
    /// Paths successfully read in this session; consulted by the
    /// read-before-delete rule.
    read_log: HashSet<PathBuf>,
}

impl Workspace {
    pub fn context_paths(&self) -> &[ContextPath] {
        &self.context_paths
    }

    pub fn write_access(&self) -> bool {
        self.write_access
    }

    /// Grant write access to writable context paths.  Called exactly once,
    /// at the final-presentation boundary (or at run start in the
    /// single-agent quick mode).
    pub fn enable_write_access(&mut self) {
        debug!(agent_id = %self.agent_id, "write access enabled");
        self.write_access = true;
    }

    /// Roots that become writable once write access is enabled.
    pub fn writable_context_roots(&self) -> Vec<PathBuf> {
        self.context_paths
            .iter()
            .filter(|c| c.permission == Permission::Write)
            .map(|c| c.root.clone())
            .collect()
    }

    /// Resolve a tool-supplied path against the workspace root and
    /// normalize it lexically (no filesystem access, so `..` cannot be used
    /// to escape through symlinks before the containment check).
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        normalize(&absolute)
    }

    /// Check a read and record it for the read-before-delete rule.
    ///
    /// Reads are allowed within the agent's own workspace, any mounted
    /// context path, and any published snapshot.  Binary extensions are
    /// blocked regardless of location.
    pub fn check_read(&mut self, path: &Path) -> Result<PathBuf, WorkspaceError> {
        let resolved = self.resolve(path);
        if let Some(ext) = binary_extension(&resolved) {
            return Err(WorkspaceError::BinaryBlocked {
                path: resolved,
                ext,
            });
        }
        let in_scope = resolved.starts_with(&self.root)
            || self
                .context_paths
                .iter()
                .any(|c| resolved.starts_with(&c.root))
            || self.snapshots.covers(&resolved);
        if !in_scope {
            return Err(WorkspaceError::ReadDenied { path: resolved });
        }
        self.read_log.insert(resolved.clone());
        Ok(resolved)
    }

    /// Check a write.  Writes are allowed within the agent's own workspace
    /// always, and within `Write`-permission context paths once write
    /// access has been enabled.  Protected paths are immune in every phase.
    pub fn check_write(&self, path: &Path) -> Result<PathBuf, WorkspaceError> {
        let resolved = self.resolve(path);
        if self.is_protected(&resolved) {
            return Err(WorkspaceError::ProtectedPath { path: resolved });
        }
        if resolved.starts_with(&self.root) {
            return Ok(resolved);
        }
        let in_writable_context = self.write_access
            && self
                .context_paths
                .iter()
                .any(|c| c.permission == Permission::Write && resolved.starts_with(&c.root));
        if in_writable_context {
            Ok(resolved)
        } else {
            Err(WorkspaceError::WriteDenied { path: resolved })
        }
    }

    /// Check a delete: write rules plus the read-before-delete requirement.
    pub fn check_delete(&self, path: &Path) -> Result<PathBuf, WorkspaceError> {
        let resolved = self.check_write(path)?;
        if !self.read_log.contains(&resolved) {
            return Err(WorkspaceError::ReadBeforeDelete { path: resolved });
        }
        Ok(resolved)
    }

    pub fn is_protected(&self, resolved: &Path) -> bool {
        self.context_paths
            .iter()
            .flat_map(|c| &c.protected)
            .any(|p| resolved.starts_with(p))
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }
}

/// Creates and tracks per-agent workspaces under the run directory.
pub struct WorkspaceManager {
    run_dir: PathBuf,
    snapshots: SnapshotStore,
    context_specs: Vec<ContextPathSpec>,
}

impl WorkspaceManager {
    pub fn new(run_dir: &Path, context_specs: Vec<ContextPathSpec>) -> std::io::Result<Self> {
        fs::create_dir_all(run_dir.join("workspaces"))?;
        let snapshots = SnapshotStore::new(run_dir)?;
        Ok(Self {
            run_dir: run_dir.to_path_buf(),
            snapshots,
            context_specs,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Create (or reopen) the isolated directory for `agent_id` and mount
    /// the configured context paths.
    pub fn create_workspace(&self, agent_id: &str) -> Result<Workspace, WorkspaceError> {
        let root = self.run_dir.join("workspaces").join(agent_id);
        fs::create_dir_all(&root).map_err(|e| WorkspaceError::io(&root, e))?;
        Ok(Workspace {
            agent_id: agent_id.to_string(),
            root: normalize(&root),
            context_paths: self.context_specs.iter().map(ContextPath::from_spec).collect(),
            snapshots: self.snapshots.clone(),
            write_access: false,
            read_log: HashSet::new(),
        })
    }

    /// Directory for persisted per-turn session artifacts.
    pub fn session_turn_dir(&self, session_stamp: &str, turn: u32) -> std::io::Result<PathBuf> {
        let dir = self
            .run_dir
            .join("sessions")
            .join(format!("session_{session_stamp}"))
            .join(format!("turn_{turn}"));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

/// Lexical path normalization: strips `.` and folds `..` without touching
/// the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn binary_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_string_lossy().to_ascii_lowercase();
    BINARY_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_context(
        dir: &Path,
        permission: Permission,
        protected: Vec<PathBuf>,
    ) -> (WorkspaceManager, PathBuf) {
        let ctx_root = dir.join("shared");
        fs::create_dir_all(&ctx_root).unwrap();
        fs::write(ctx_root.join("data.txt"), "data").unwrap();
        let mgr = WorkspaceManager::new(
            &dir.join("run"),
            vec![ContextPathSpec {
                path: ctx_root.clone(),
                permission,
                protected,
            }],
        )
        .unwrap();
        (mgr, ctx_root)
    }

    #[test]
    fn workspace_read_and_write_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(&dir.path().join("run"), vec![]).unwrap();
        let mut ws = mgr.create_workspace("a1").unwrap();
        fs::write(ws.root.join("f.txt"), "x").unwrap();
        assert!(ws.check_read(Path::new("f.txt")).is_ok());
        assert!(ws.check_write(Path::new("new.txt")).is_ok());
    }

    #[test]
    fn read_outside_scope_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(&dir.path().join("run"), vec![]).unwrap();
        let mut ws = mgr.create_workspace("a1").unwrap();
        let err = ws.check_read(Path::new("/etc/hostname")).unwrap_err();
        assert!(matches!(err, WorkspaceError::ReadDenied { .. }));
    }

    #[test]
    fn dotdot_cannot_escape_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(&dir.path().join("run"), vec![]).unwrap();
        let ws = mgr.create_workspace("a1").unwrap();
        let err = ws.check_write(Path::new("../../../outside.txt")).unwrap_err();
        assert!(matches!(err, WorkspaceError::WriteDenied { .. }));
    }

    #[test]
    fn context_path_readable_but_not_writable_during_coordination() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, ctx) = manager_with_context(dir.path(), Permission::Write, vec![]);
        let mut ws = mgr.create_workspace("a1").unwrap();
        assert!(ws.check_read(&ctx.join("data.txt")).is_ok());
        // Even a Write-permission context path is read-only before the
        // presentation boundary.
        assert!(matches!(
            ws.check_write(&ctx.join("data.txt")),
            Err(WorkspaceError::WriteDenied { .. })
        ));
    }

    #[test]
    fn write_access_opens_writable_context_paths_only() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, ctx) = manager_with_context(dir.path(), Permission::Write, vec![]);
        let mut ws = mgr.create_workspace("a1").unwrap();
        ws.enable_write_access();
        assert!(ws.check_write(&ctx.join("data.txt")).is_ok());

        let (mgr_ro, ctx_ro) = manager_with_context(&dir.path().join("ro"), Permission::Read, vec![]);
        let mut ws_ro = mgr_ro.create_workspace("a1").unwrap();
        ws_ro.enable_write_access();
        assert!(matches!(
            ws_ro.check_write(&ctx_ro.join("data.txt")),
            Err(WorkspaceError::WriteDenied { .. })
        ));
    }

    #[test]
    fn protected_path_immune_even_with_write_access() {
        let dir = tempfile::tempdir().unwrap();
        let (mgr, ctx) = manager_with_context(
            dir.path(),
            Permission::Write,
            vec![PathBuf::from("data.txt")],
        );
        let mut ws = mgr.create_workspace("a1").unwrap();
        ws.enable_write_access();
        assert!(matches!(
            ws.check_write(&ctx.join("data.txt")),
            Err(WorkspaceError::ProtectedPath { .. })
        ));
        // Deletion is equally blocked, with or without a prior read.
        let _ = ws.check_read(&ctx.join("data.txt"));
        assert!(matches!(
            ws.check_delete(&ctx.join("data.txt")),
            Err(WorkspaceError::ProtectedPath { .. })
        ));
    }

    #[test]
    fn delete_requires_prior_read() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(&dir.path().join("run"), vec![]).unwrap();
        let mut ws = mgr.create_workspace("a1").unwrap();
        fs::write(ws.root.join("f.txt"), "x").unwrap();
        assert!(matches!(
            ws.check_delete(Path::new("f.txt")),
            Err(WorkspaceError::ReadBeforeDelete { .. })
        ));
        ws.check_read(Path::new("f.txt")).unwrap();
        assert!(ws.check_delete(Path::new("f.txt")).is_ok());
    }

    #[test]
    fn binary_extension_read_blocked() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(&dir.path().join("run"), vec![]).unwrap();
        let mut ws = mgr.create_workspace("a1").unwrap();
        let err = ws.check_read(Path::new("clip.mp4")).unwrap_err();
        assert!(matches!(err, WorkspaceError::BinaryBlocked { .. }));
    }

    #[test]
    fn snapshots_of_peers_are_readable() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(&dir.path().join("run"), vec![]).unwrap();
        let a1 = mgr.create_workspace("a1").unwrap();
        let mut a2 = mgr.create_workspace("a2").unwrap();
        fs::write(a1.root.join("artifact.txt"), "v1").unwrap();
        let snap = mgr
            .snapshots()
            .publish("a1", "agent1.1", &a1.root, "trace")
            .unwrap();
        // Peer may read the snapshot but not a1's live workspace.
        assert!(a2.check_read(&snap.snapshot_path.join("artifact.txt")).is_ok());
        assert!(a2.check_read(&a1.root.join("artifact.txt")).is_err());
        // And never write into a snapshot.
        assert!(a2.check_write(&snap.snapshot_path.join("artifact.txt")).is_err());
    }

    #[test]
    fn session_turn_dir_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(&dir.path().join("run"), vec![]).unwrap();
        let turn = mgr.session_turn_dir("20260101T000000", 3).unwrap();
        assert!(turn.ends_with("sessions/session_20260101T000000/turn_3"));
        assert!(turn.exists());
    }
}
