// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::debug;

use quorum_workspace::Workspace;

use crate::tool::{Tool, ToolCall, ToolOutput};

fn path_arg(call: &ToolCall) -> Result<String, ToolOutput> {
    match call.args.get("path").and_then(|v| v.as_str()) {
        Some(p) => Ok(p.to_string()),
        None => {
            let args_preview =
                serde_json::to_string(&call.args).unwrap_or_else(|_| "null".to_string());
            Err(ToolOutput::err(
                &call.id,
                format!("missing required parameter 'path'. Received: {args_preview}"),
            ))
        }
    }
}

/// Read a file, subject to workspace permissions (own workspace, context
/// paths, and published snapshots; binary extensions blocked).
pub struct ReadFileTool {
    workspace: Arc<Mutex<Workspace>>,
}

impl ReadFileTool {
    pub fn new(workspace: Arc<Mutex<Workspace>>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file from your workspace, a mounted context path, \
         or a published snapshot. Paths resolve relative to your workspace."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File to read" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match path_arg(call) {
            Ok(p) => p,
            Err(out) => return out,
        };
        debug!(path = %path, "read_file tool");
        let resolved = {
            let mut ws = self.workspace.lock().await;
            match ws.check_read(Path::new(&path)) {
                Ok(p) => p,
                Err(e) => return ToolOutput::err(&call.id, e.to_string()),
            }
        };
        match tokio::fs::read_to_string(&resolved).await {
            Ok(content) => ToolOutput::ok(&call.id, content),
            Err(e) => ToolOutput::err(&call.id, format!("read error: {e}")),
        }
    }
}

/// Create or overwrite a file inside the workspace (or a writable context
/// path during final presentation).
pub struct WriteFileTool {
    workspace: Arc<Mutex<Workspace>>,
}

impl WriteFileTool {
    pub fn new(workspace: Arc<Mutex<Workspace>>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a UTF-8 text file. Creates parent directories as needed. \
         Context paths become writable only during final presentation."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File to write" },
                "content": { "type": "string", "description": "Full file content" }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    fn side_effecting(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match path_arg(call) {
            Ok(p) => p,
            Err(out) => return out,
        };
        let content = call
            .args
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let resolved = {
            let ws = self.workspace.lock().await;
            match ws.check_write(Path::new(&path)) {
                Ok(p) => p,
                Err(e) => return ToolOutput::err(&call.id, e.to_string()),
            }
        };
        debug!(path = %resolved.display(), bytes = content.len(), "write_file tool");
        if let Some(parent) = resolved.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ToolOutput::err(&call.id, format!("mkdir error: {e}"));
            }
        }
        match tokio::fs::write(&resolved, content).await {
            Ok(_) => ToolOutput::ok(
                &call.id,
                format!("wrote {} bytes to {path}", content.len()),
            ),
            Err(e) => ToolOutput::err(&call.id, format!("write error: {e}")),
        }
    }
}

/// Delete a single file.  Requires a successful read of the same path
/// earlier in the session; protected paths are never deletable.
pub struct DeleteFileTool {
    workspace: Arc<Mutex<Workspace>>,
}

impl DeleteFileTool {
    pub fn new(workspace: Arc<Mutex<Workspace>>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a single file you have previously read in this session. \
         Permanent — no recovery."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File to delete" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn side_effecting(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match path_arg(call) {
            Ok(p) => p,
            Err(out) => return out,
        };
        let resolved = {
            let ws = self.workspace.lock().await;
            match ws.check_delete(Path::new(&path)) {
                Ok(p) => p,
                Err(e) => return ToolOutput::err(&call.id, e.to_string()),
            }
        };
        debug!(path = %resolved.display(), "delete_file tool");
        match tokio::fs::metadata(&resolved).await {
            Ok(m) if m.is_dir() => {
                return ToolOutput::err(&call.id, format!("{path} is a directory"));
            }
            Err(e) => return ToolOutput::err(&call.id, format!("stat error: {e}")),
            Ok(_) => {}
        }
        match tokio::fs::remove_file(&resolved).await {
            Ok(_) => ToolOutput::ok(&call.id, format!("deleted {path}")),
            Err(e) => ToolOutput::err(&call.id, format!("delete error: {e}")),
        }
    }
}

/// List a directory within readable scope.
pub struct ListDirTool {
    workspace: Arc<Mutex<Workspace>>,
}

impl ListDirTool {
    pub fn new(workspace: Arc<Mutex<Workspace>>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List directory entries (name and kind), non-recursive."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list (default: workspace root)" }
            },
            "additionalProperties": false
        })
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = call
            .args
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(".")
            .to_string();
        let resolved = {
            let mut ws = self.workspace.lock().await;
            match ws.check_read(Path::new(&path)) {
                Ok(p) => p,
                Err(e) => return ToolOutput::err(&call.id, e.to_string()),
            }
        };
        let mut entries = match tokio::fs::read_dir(&resolved).await {
            Ok(rd) => rd,
            Err(e) => return ToolOutput::err(&call.id, format!("read_dir error: {e}")),
        };
        let mut lines = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let kind = match entry.file_type().await {
                Ok(t) if t.is_dir() => "dir",
                Ok(_) => "file",
                Err(_) => "?",
            };
            lines.push(format!("{kind}  {}", entry.file_name().to_string_lossy()));
        }
        lines.sort();
        ToolOutput::ok(&call.id, lines.join("\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use quorum_workspace::WorkspaceManager;

    use super::*;

    async fn workspace() -> (tempfile::TempDir, Arc<Mutex<Workspace>>) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(&dir.path().join("run"), vec![]).unwrap();
        let ws = mgr.create_workspace("a1").unwrap();
        (dir, Arc::new(Mutex::new(ws)))
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: "t1".into(),
            name: name.into(),
            args,
        }
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let (_dir, ws) = workspace().await;
        let write = WriteFileTool::new(ws.clone());
        let read = ReadFileTool::new(ws);
        let out = write
            .execute(&call("write_file", json!({"path": "notes.md", "content": "hello"})))
            .await;
        assert!(!out.is_error, "{}", out.content);
        let out = read.execute(&call("read_file", json!({"path": "notes.md"}))).await;
        assert_eq!(out.content, "hello");
    }

    #[tokio::test]
    async fn delete_without_read_is_refused() {
        let (_dir, ws) = workspace().await;
        let write = WriteFileTool::new(ws.clone());
        let delete = DeleteFileTool::new(ws.clone());
        write
            .execute(&call("write_file", json!({"path": "f.txt", "content": "x"})))
            .await;
        let out = delete.execute(&call("delete_file", json!({"path": "f.txt"}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("read before delete"));

        // After a read, deletion succeeds.
        ReadFileTool::new(ws.clone())
            .execute(&call("read_file", json!({"path": "f.txt"})))
            .await;
        let out = delete.execute(&call("delete_file", json!({"path": "f.txt"}))).await;
        assert!(!out.is_error, "{}", out.content);
    }

    #[tokio::test]
    async fn read_outside_scope_is_denied() {
        let (_dir, ws) = workspace().await;
        let read = ReadFileTool::new(ws);
        let out = read
            .execute(&call("read_file", json!({"path": "/etc/hostname"})))
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("read denied"));
    }

    #[tokio::test]
    async fn missing_path_parameter_is_reported() {
        let (_dir, ws) = workspace().await;
        let read = ReadFileTool::new(ws);
        let out = read.execute(&call("read_file", json!({}))).await;
        assert!(out.is_error);
        assert!(out.content.contains("missing required parameter 'path'"));
    }

    #[tokio::test]
    async fn list_dir_shows_entries() {
        let (_dir, ws) = workspace().await;
        WriteFileTool::new(ws.clone())
            .execute(&call("write_file", json!({"path": "a.txt", "content": ""})))
            .await;
        let out = ListDirTool::new(ws)
            .execute(&call("list_dir", json!({})))
            .await;
        assert!(out.content.contains("file  a.txt"));
    }
}
