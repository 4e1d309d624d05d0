// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::json;

use quorum_model::ToolSchema;

use crate::tool::ToolCall;

/// Workflow tool names.  These are the only tools exposed without a
/// namespace prefix, and calling either one terminates the streamed turn.
pub const NEW_ANSWER: &str = "new_answer";
pub const VOTE: &str = "vote";

pub fn is_workflow_tool(name: &str) -> bool {
    name == NEW_ANSWER || name == VOTE
}

/// A parsed, shape-validated workflow call.  Label liveness (does the voted
/// answer exist?) is validated by the scheduler, which owns the answer set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowCall {
    NewAnswer { content: String },
    Vote { target: String, reason: String },
}

/// Validate argument shape for a workflow tool call.
///
/// Returns a human-readable error (surfaced as an error tool result and an
/// enforcement event) when required fields are missing or empty.
pub fn parse_workflow_call(call: &ToolCall) -> Result<WorkflowCall, String> {
    match call.name.as_str() {
        NEW_ANSWER => {
            let content = call
                .args
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            if content.trim().is_empty() {
                return Err("new_answer requires a non-empty 'content' field".into());
            }
            Ok(WorkflowCall::NewAnswer { content })
        }
        VOTE => {
            let target = call
                .args
                .get("target")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            if target.is_empty() {
                return Err("vote requires a 'target' answer label".into());
            }
            let reason = call
                .args
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            Ok(WorkflowCall::Vote { target, reason })
        }
        other => Err(format!("{other} is not a workflow tool")),
    }
}

/// Schemas for the workflow tools as exposed to backends.
///
/// `include_vote = false` covers the single-agent quick mode
/// (`skip_voting`), where the vote tool is never injected.
pub fn workflow_schemas(include_vote: bool) -> Vec<ToolSchema> {
    let mut schemas = vec![ToolSchema {
        name: NEW_ANSWER.into(),
        description: "Submit a new answer to the task, or refine your previous one. \
                      Calling this ends your current turn. Your workspace is \
                      snapshotted so other agents can review your artifacts."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The complete answer, as markdown"
                }
            },
            "required": ["content"],
            "additionalProperties": false
        }),
    }];
    if include_vote {
        schemas.push(ToolSchema {
            name: VOTE.into(),
            description: "Endorse an existing answer by its label (e.g. agent1.2). \
                          Calling this ends your current turn."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "target": {
                        "type": "string",
                        "description": "Label of the answer you endorse"
                    },
                    "reason": {
                        "type": "string",
                        "description": "Why this answer should win"
                    }
                },
                "required": ["target", "reason"],
                "additionalProperties": false
            }),
        });
    }
    schemas
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn call(name: &str, args: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: name.into(),
            args,
        }
    }

    #[test]
    fn new_answer_parses_content() {
        let c = call(NEW_ANSWER, json!({"content": "42"}));
        assert_eq!(
            parse_workflow_call(&c).unwrap(),
            WorkflowCall::NewAnswer {
                content: "42".into()
            }
        );
    }

    #[test]
    fn empty_content_is_rejected() {
        let c = call(NEW_ANSWER, json!({"content": "  "}));
        assert!(parse_workflow_call(&c).is_err());
    }

    #[test]
    fn vote_parses_target_and_reason() {
        let c = call(VOTE, json!({"target": "agent1.1", "reason": "correct"}));
        assert_eq!(
            parse_workflow_call(&c).unwrap(),
            WorkflowCall::Vote {
                target: "agent1.1".into(),
                reason: "correct".into()
            }
        );
    }

    #[test]
    fn vote_without_target_is_rejected() {
        let c = call(VOTE, json!({"reason": "correct"}));
        assert!(parse_workflow_call(&c).is_err());
    }

    #[test]
    fn schema_set_respects_skip_voting() {
        assert_eq!(workflow_schemas(true).len(), 2);
        let quick = workflow_schemas(false);
        assert_eq!(quick.len(), 1);
        assert_eq!(quick[0].name, NEW_ANSWER);
    }

    #[test]
    fn workflow_names_are_bare() {
        assert!(is_workflow_tool("new_answer"));
        assert!(is_workflow_tool("vote"));
        assert!(!is_workflow_tool("custom_tool__vote"));
    }
}
