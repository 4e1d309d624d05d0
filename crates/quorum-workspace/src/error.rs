// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

/// Filesystem policy violations and snapshot failures.
///
/// Every variant maps onto a per-tool error result; none of them corrupt
/// workspace state.  Protected-path and read-before-delete violations are
/// never overridden.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("read denied: {path} is outside the workspace, context paths, and snapshots")]
    ReadDenied { path: PathBuf },
    #[error("write denied: {path} is not writable in the current phase")]
    WriteDenied { path: PathBuf },
    #[error("delete denied: {path} was not read in this session (read before delete)")]
    ReadBeforeDelete { path: PathBuf },
    #[error("protected path: {path} must never be modified or deleted")]
    ProtectedPath { path: PathBuf },
    #[error("binary file read blocked: {path} (extension {ext})")]
    BinaryBlocked { path: PathBuf, ext: String },
    #[error("snapshot failed for {agent_id}: {source}")]
    SnapshotFailed {
        agent_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
