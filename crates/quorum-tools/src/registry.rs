// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use quorum_model::ToolSchema;

use crate::mcp::{McpProxy, McpToolAdapter};
use crate::tool::{Tool, ToolCall, ToolOutput};
use crate::workflow;

pub const CUSTOM_PREFIX: &str = "custom_tool__";
pub const MCP_PREFIX: &str = "mcp__";

/// Everything the pipeline needs to know about one registered tool.
///
/// Tool names are data: dispatch is by namespaced name through this map,
/// never by type.  Workflow tools carry no handler; their semantics live in
/// the scheduler and the pipeline only validates shape.
pub struct ToolDescriptor {
    pub schema: ToolSchema,
    pub is_workflow: bool,
    pub side_effecting: bool,
    handler: Option<Arc<dyn Tool>>,
}

/// Central registry keyed by namespaced tool name.
///
/// - workflow tools: bare (`new_answer`, `vote`)
/// - in-process custom tools: `custom_tool__<name>`
/// - MCP proxies: `mcp__<server>__<tool>`
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    /// Create a registry pre-populated with the workflow tools.
    /// `include_vote = false` is the single-agent quick mode.
    pub fn new(include_vote: bool) -> Self {
        let mut tools = HashMap::new();
        for schema in workflow::workflow_schemas(include_vote) {
            tools.insert(
                schema.name.clone(),
                ToolDescriptor {
                    schema,
                    is_workflow: true,
                    side_effecting: false,
                    handler: None,
                },
            );
        }
        Self { tools }
    }

    /// Register an in-process tool under the `custom_tool__` namespace.
    pub fn register_custom(&mut self, tool: impl Tool + 'static) {
        let name = format!("{CUSTOM_PREFIX}{}", tool.name());
        let schema = ToolSchema {
            name: name.clone(),
            description: tool.description().to_string(),
            parameters: tool.parameters_schema(),
        };
        self.tools.insert(
            name,
            ToolDescriptor {
                schema,
                is_workflow: false,
                side_effecting: tool.side_effecting(),
                handler: Some(Arc::new(tool)),
            },
        );
    }

    /// Register every discovered tool of an MCP server under
    /// `mcp__<server>__<tool>`, filtered through the allow/deny lists
    /// (bare tool names; `allow = None` admits all).
    pub fn register_mcp_server(
        &mut self,
        proxy: Arc<dyn McpProxy>,
        allow: Option<&[String]>,
        deny: &[String],
    ) {
        let server = proxy.server_name().to_string();
        for mut schema in proxy.tools() {
            let bare = schema.name.clone();
            if deny.contains(&bare) {
                continue;
            }
            if let Some(allowed) = allow {
                if !allowed.contains(&bare) {
                    continue;
                }
            }
            let adapter = McpToolAdapter::new(proxy.clone(), schema.clone());
            schema.name = format!("{MCP_PREFIX}{server}__{bare}");
            self.tools.insert(
                schema.name.clone(),
                ToolDescriptor {
                    schema,
                    is_workflow: false,
                    side_effecting: true,
                    handler: Some(Arc::new(adapter)),
                },
            );
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn is_workflow(&self, name: &str) -> bool {
        self.tools.get(name).map(|d| d.is_workflow).unwrap_or(false)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Schemas for the backend, sorted by name for a stable prompt prefix.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> =
            self.tools.values().map(|d| d.schema.clone()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Execute a non-workflow tool by name.  Unknown names and workflow
    /// names (which have no handler) produce error outputs.
    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.tools.get(&call.name).and_then(|d| d.handler.as_ref()) {
            Some(tool) => tool.execute(call).await,
            None => ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Split an `mcp__<server>__<tool>` name into `(server, tool)`.
pub fn split_mcp_name(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix(MCP_PREFIX)?;
    rest.split_once("__")
}

/// Strip the `custom_tool__` prefix.
pub fn strip_custom_prefix(name: &str) -> Option<&str> {
    name.strip_prefix(CUSTOM_PREFIX)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
