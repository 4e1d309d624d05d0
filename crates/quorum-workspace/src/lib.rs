// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-agent workspaces, permissioned context paths, atomic snapshots, and
//! the execution-trace recorder.
//!
//! A workspace is the only place an agent's file tools may write during
//! coordination.  Peers see its contents exclusively through published
//! snapshots (immutable copies taken at answer-submission time), so no two
//! agents ever race on live files.

mod error;
mod mtime;
mod snapshot;
mod trace;
mod workspace;

pub use error::WorkspaceError;
pub use mtime::{MtimeIndex, WriteReport};
pub use snapshot::{SnapshotRef, SnapshotStore};
pub use trace::{ExecutionTrace, TraceEntry, TraceKind};
pub use workspace::{ContextPath, Workspace, WorkspaceManager};
