// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use quorum_model::ToolSchema;

use crate::tool::{Tool, ToolCall, ToolOutput};

/// Wire shape of an MCP `CallToolResult`.
///
/// Servers typically return the same payload twice (a `content` array and a
/// `structuredContent` mirror) plus wrapper metadata.  Only the text
/// content ever reaches the model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpCallResult {
    #[serde(default)]
    pub content: Vec<McpContent>,
    #[serde(default)]
    pub structured_content: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, rename = "_meta")]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpContent {
    Text { text: String },
    Image { data: String, mime_type: String },
    Resource { uri: String },
}

/// Extract only the text content from an MCP result, dropping the duplicate
/// `structuredContent` and wrapper metadata.  Typical size reduction on
/// verbose servers is 4–10×.
pub fn normalize_mcp_result(result: &McpCallResult) -> String {
    result
        .content
        .iter()
        .filter_map(|c| match c {
            McpContent::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Handle to one configured MCP server.
///
/// Server process management (stdio or streamable HTTP) lives with the
/// embedder; discovery happens once at session start and yields the tool
/// schemas passed to [`crate::ToolRegistry::register_mcp_server`].
#[async_trait]
pub trait McpProxy: Send + Sync {
    fn server_name(&self) -> &str;
    /// Tool schemas discovered at session start (bare names).
    fn tools(&self) -> Vec<ToolSchema>;
    async fn call(&self, tool: &str, args: &Value) -> anyhow::Result<McpCallResult>;
}

/// Adapts one MCP server tool to the [`Tool`] trait.  Registered under
/// `mcp__<server>__<tool>`.
pub struct McpToolAdapter {
    proxy: Arc<dyn McpProxy>,
    tool: String,
    schema: ToolSchema,
}

impl McpToolAdapter {
    pub fn new(proxy: Arc<dyn McpProxy>, schema: ToolSchema) -> Self {
        Self {
            tool: schema.name.clone(),
            proxy,
            schema,
        }
    }
}

#[async_trait]
impl Tool for McpToolAdapter {
    fn name(&self) -> &str {
        &self.tool
    }

    fn description(&self) -> &str {
        &self.schema.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.parameters.clone()
    }

    fn side_effecting(&self) -> bool {
        // Unknown server tools are assumed to have side effects; planning
        // mode must not run them speculatively.
        true
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.proxy.call(&self.tool, &call.args).await {
            Ok(result) => {
                let text = normalize_mcp_result(&result);
                if result.is_error {
                    ToolOutput::err(&call.id, text)
                } else {
                    ToolOutput::ok(&call.id, text)
                }
            }
            Err(e) => ToolOutput::err(&call.id, format!("mcp call failed: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn normalize_keeps_text_only() {
        let result = McpCallResult {
            content: vec![
                McpContent::Text {
                    text: "first".into(),
                },
                McpContent::Image {
                    data: "AAAA".into(),
                    mime_type: "image/png".into(),
                },
                McpContent::Text {
                    text: "second".into(),
                },
            ],
            structured_content: Some(json!({"first": true, "second": true})),
            is_error: false,
            meta: Some(json!({"elapsed_ms": 12})),
        };
        assert_eq!(normalize_mcp_result(&result), "first\nsecond");
    }

    #[test]
    fn wire_format_parses_camel_case() {
        let raw = r#"{
            "content": [{"type": "text", "text": "hi"}],
            "structuredContent": {"x": 1},
            "isError": false
        }"#;
        let parsed: McpCallResult = serde_json::from_str(raw).unwrap();
        assert_eq!(normalize_mcp_result(&parsed), "hi");
        assert!(parsed.structured_content.is_some());
    }

    #[test]
    fn normalization_shrinks_duplicated_payloads() {
        let body = "x".repeat(1000);
        let result = McpCallResult {
            content: vec![McpContent::Text { text: body.clone() }],
            structured_content: Some(json!({ "body": body, "mirror": body })),
            is_error: false,
            meta: None,
        };
        let full = serde_json::to_string(&result).unwrap().len();
        let normalized = normalize_mcp_result(&result).len();
        assert!(full > normalized * 3, "{full} vs {normalized}");
    }

    struct FakeProxy;

    #[async_trait]
    impl McpProxy for FakeProxy {
        fn server_name(&self) -> &str {
            "files"
        }
        fn tools(&self) -> Vec<ToolSchema> {
            vec![ToolSchema {
                name: "read".into(),
                description: "read a file".into(),
                parameters: json!({"type": "object"}),
            }]
        }
        async fn call(&self, tool: &str, _args: &Value) -> anyhow::Result<McpCallResult> {
            Ok(McpCallResult {
                content: vec![McpContent::Text {
                    text: format!("called {tool}"),
                }],
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn adapter_calls_proxy_and_normalizes() {
        let proxy = Arc::new(FakeProxy);
        let schema = proxy.tools().remove(0);
        let adapter = McpToolAdapter::new(proxy, schema);
        let out = adapter
            .execute(&ToolCall {
                id: "1".into(),
                name: "mcp__files__read".into(),
                args: json!({}),
            })
            .await;
        assert_eq!(out.content, "called read");
    }
}
