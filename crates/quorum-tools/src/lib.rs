// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The tool-execution pipeline: one chokepoint for every tool call a
//! backend emits.
//!
//! Custom in-process tools, MCP proxies, and the two terminal workflow
//! tools (`new_answer`, `vote`) all dispatch through the same namespaced
//! registry; the pipeline wraps execution with the hook chain, per-tool
//! timeouts, MCP result normalization, and large-result eviction.

pub mod builtin;
mod evict;
mod mcp;
mod pipeline;
mod registry;
mod tool;
pub mod workflow;

pub use evict::{estimate_tokens, evict_if_large, read_range, EvictedResult, EVICTION_THRESHOLD_TOKENS};
pub use mcp::{normalize_mcp_result, McpCallResult, McpContent, McpProxy, McpToolAdapter};
pub use pipeline::{PipelineResult, ToolPipeline};
pub use registry::{split_mcp_name, strip_custom_prefix, ToolDescriptor, ToolRegistry, CUSTOM_PREFIX, MCP_PREFIX};
pub use tool::{Tool, ToolCall, ToolOutput};
pub use workflow::{is_workflow_tool, parse_workflow_call, workflow_schemas, WorkflowCall, NEW_ANSWER, VOTE};
