// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Messages ─────────────────────────────────────────────────────────────────

/// A single message in a chat session, tagged by role.
///
/// `User`/`System`/`Error` carry plain text. `Assistant` carries the full
/// [`ModelReply`] produced by one engine invocation. `Approval` carries the
/// user's decisions for a pending tool-call set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    User { content: String },
    System { content: String },
    Error { content: String },
    Assistant { reply: ModelReply },
    Approval { decisions: Vec<ToolCallApproval> },
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
        }
    }

    pub fn assistant(reply: ModelReply) -> Self {
        Self::Assistant { reply }
    }

    pub fn approval(decisions: Vec<ToolCallApproval>) -> Self {
        Self::Approval { decisions }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Self::System { .. })
    }

    /// Plain text of a `User`/`System`/`Error` message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::User { content } | Self::System { content } | Self::Error { content } => {
                Some(content)
            }
            _ => None,
        }
    }
}

// ─── Model replies ────────────────────────────────────────────────────────────

/// Everything one engine invocation produced: the ordered turns plus any
/// tool calls still waiting for user approval.
///
/// A non-empty `pending_tool_calls` means the reply loop stopped early; the
/// next session input must be an approval message covering exactly those
/// call ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelReply {
    pub timestamp: DateTime<Utc>,
    pub turns: Vec<Turn>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_tool_calls: Vec<PendingCall>,
}

impl ModelReply {
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            turns: Vec::new(),
            pending_tool_calls: Vec::new(),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_tool_calls.is_empty()
    }

    /// Concatenated text of all turns, for display shortcuts.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for turn in &self.turns {
            for result in &turn.results {
                if let TurnResult::Text { text } = result {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(text);
                }
            }
        }
        out
    }
}

impl Default for ModelReply {
    fn default() -> Self {
        Self::new()
    }
}

/// One provider invocation's output (or a terminal error marker).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<TurnResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

impl Turn {
    /// A terminal turn carrying only an error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TurnResult {
    Text {
        text: String,
    },
    ToolCall {
        #[serde(rename = "toolCall")]
        tool_call: ExecutedCall,
    },
}

// ─── Tool calls ───────────────────────────────────────────────────────────────

/// A tool call that was dispatched (or synthetically resolved, e.g. denied).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutedCall {
    pub server_name: String,
    pub tool_name: String,
    pub args: Value,
    pub tool_call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ExecutedCall {
    /// The text fed back to the model for this call: the error when the
    /// call failed, the output otherwise.
    pub fn result_text(&self) -> &str {
        self.error
            .as_deref()
            .or(self.output.as_deref())
            .unwrap_or("")
    }
}

/// A tool call waiting for a user decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCall {
    pub server_name: String,
    pub tool_name: String,
    pub args: Value,
    pub tool_call_id: String,
}

/// User decision for one pending call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalDecision {
    /// Run it, and auto-approve this (server, tool) for the session
    AllowSession,
    /// Run it this once
    AllowOnce,
    /// Refuse it
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallApproval {
    pub server_name: String,
    pub tool_name: String,
    pub tool_call_id: String,
    pub args: Value,
    pub decision: ApprovalDecision,
}

// ─── Session-facing snapshots ─────────────────────────────────────────────────

/// The delta a front-end receives after one engine operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageUpdate {
    pub updates: Vec<ChatMessage>,
    pub last_sync_id: u64,
    pub references_in_scope: Vec<String>,
    pub rules_in_scope: Vec<String>,
}

/// One model offered by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub provider_id: String,
    pub id: String,
    pub name: String,
    pub source: ModelSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Where a model id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    /// The provider's well-known static list
    Static,
    /// A live listing call against the provider
    Dynamic,
}

// ─── Adapter-facing tool views ────────────────────────────────────────────────

/// One tool in a session's active toolset, as adapters see it.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveTool {
    pub server_name: String,
    pub tool_name: String,
    pub description: String,
    /// JSON Schema of the tool's arguments object
    pub parameters: Value,
}

impl ActiveTool {
    /// Tool identity flattened for the provider wire:
    /// `serverName + "_" + toolName`.
    pub fn wire_name(&self) -> String {
        format!("{}_{}", self.server_name, self.tool_name)
    }
}

/// Outcome of dispatching one tool call through the tool-server manager.
#[derive(Debug, Clone, Default)]
pub struct ToolDispatch {
    pub output: Option<String>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_message_serializes_role_tag() {
        let v = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert_eq!(v, json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn approval_decision_uses_kebab_case() {
        assert_eq!(
            serde_json::to_value(ApprovalDecision::AllowSession).unwrap(),
            json!("allow-session")
        );
        assert_eq!(
            serde_json::from_value::<ApprovalDecision>(json!("allow-once")).unwrap(),
            ApprovalDecision::AllowOnce
        );
    }

    #[test]
    fn turn_result_tool_call_uses_camel_case_tag() {
        let call = ExecutedCall {
            server_name: "fs".into(),
            tool_name: "read".into(),
            args: json!({"path": "/a"}),
            tool_call_id: "x".into(),
            output: Some("OK".into()),
            error: None,
            elapsed_ms: 3,
        };
        let v = serde_json::to_value(TurnResult::ToolCall { tool_call: call }).unwrap();
        assert_eq!(v["type"], "toolCall");
        assert_eq!(v["toolCall"]["serverName"], "fs");
        assert_eq!(v["toolCall"]["elapsedMs"], 3);
    }

    #[test]
    fn pending_calls_omitted_when_empty() {
        let reply = ModelReply::new();
        let v = serde_json::to_value(&reply).unwrap();
        assert!(v.get("pendingToolCalls").is_none());
    }

    #[test]
    fn result_text_prefers_error() {
        let call = ExecutedCall {
            server_name: "fs".into(),
            tool_name: "delete".into(),
            args: json!({}),
            tool_call_id: "x".into(),
            output: Some("Tool call denied".into()),
            error: Some("Tool call denied".into()),
            elapsed_ms: 0,
        };
        assert_eq!(call.result_text(), "Tool call denied");
    }

    #[test]
    fn reply_text_concatenates_turn_texts() {
        let mut reply = ModelReply::new();
        reply.turns.push(Turn {
            results: vec![TurnResult::Text { text: "a".into() }],
            ..Turn::default()
        });
        reply.turns.push(Turn {
            results: vec![TurnResult::Text { text: "b".into() }],
            ..Turn::default()
        });
        assert_eq!(reply.text(), "a\nb");
    }

    #[test]
    fn wire_name_flattens_identity() {
        let t = ActiveTool {
            server_name: "fs".into(),
            tool_name: "read_file".into(),
            description: String::new(),
            parameters: json!({"type": "object"}),
        };
        assert_eq!(t.wire_name(), "fs_read_file");
    }
}
