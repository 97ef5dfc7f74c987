// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The provider-neutral reply loop.
//!
//! Every adapter shares this driver and contributes only a [`ProviderWire`]:
//! the translation of history items into its native message shape plus one
//! non-streaming chat call. Loop semantics — approval handling, pending-call
//! cutover, the turn cap, the watchdog, terminal error turns — are therefore
//! identical across providers by construction.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};
use tspark_config::SessionSettings;

use crate::{
    ActiveTool, ApprovalDecision, ChatMessage, ExecutedCall, ModelReply, PendingCall,
    SessionContext, ToolCallApproval, Turn, TurnResult,
};

/// Watchdog on each provider call. On expiry the loop records a
/// `"Request timed out"` turn and returns the partial reply.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// One tool invocation as it appears on the provider wire.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct WireToolUse {
    /// Correlation id; round-trips unchanged between tool-use and tool-result.
    pub id: String,
    /// Mangled tool name (`serverName_toolName`).
    pub name: String,
    pub args: Value,
}

/// What one provider call produced, already normalized.
#[derive(Debug, Clone, Default)]
pub(crate) struct WireTurn {
    /// All text parts concatenated.
    pub text: String,
    pub tool_uses: Vec<WireToolUse>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// The provider signaled output-token truncation.
    pub truncated: bool,
}

/// Per-provider wire state: the native message history plus the HTTP calls.
#[async_trait]
pub(crate) trait ProviderWire: Send {
    fn provider_id(&self) -> &str;

    /// Append a tool result correlated to `tool_use_id` to native history.
    fn push_tool_result(&mut self, tool_use_id: &str, content: &str, is_error: bool);

    /// Perform one chat call with the current history and `tools`, append
    /// the provider's own response to the native history, and return the
    /// normalized turn.
    async fn request(
        &mut self,
        tools: &[ActiveTool],
        settings: &SessionSettings,
    ) -> anyhow::Result<WireTurn>;
}

// ─── History flattening ───────────────────────────────────────────────────────

/// Provider-neutral rendering of the internal message list. Each wire folds
/// these into its native shape (coalescing consecutive same-role messages
/// only if its provider demands strict role alternation).
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HistoryItem {
    System(String),
    User(String),
    /// Assistant output: text and/or the tool uses it requested.
    Assistant {
        text: String,
        tool_uses: Vec<WireToolUse>,
    },
    ToolResult {
        id: String,
        content: String,
        is_error: bool,
    },
}

/// Flatten internal messages into wire-ready items.
///
/// The subtle part is tool-call correlation across the approval boundary:
/// calls that went pending are emitted as tool-uses at the end of the reply
/// that requested them, and the matching results — recorded in the *next*
/// assistant reply after the user's approval — are emitted as bare results.
/// A trailing approval message is skipped here; the reply loop resolves it
/// live.
pub(crate) fn flatten_history(messages: &[ChatMessage]) -> Vec<HistoryItem> {
    let mut items = Vec::new();
    // Ids whose tool-use was already emitted and is still waiting for a result.
    let mut expected_results: HashSet<String> = HashSet::new();

    let last = messages.len().saturating_sub(1);
    for (idx, message) in messages.iter().enumerate() {
        match message {
            ChatMessage::System { content } => {
                if !content.is_empty() {
                    items.push(HistoryItem::System(content.clone()));
                }
            }
            ChatMessage::User { content } => items.push(HistoryItem::User(content.clone())),
            // Error messages document faults for front-ends; the model
            // never sees them.
            ChatMessage::Error { .. } => {}
            ChatMessage::Approval { .. } => {
                // Historical approvals carry no wire content of their own:
                // the resolved calls live in the following assistant reply.
                if idx == last {
                    debug!("trailing approval message left to the reply loop");
                }
            }
            ChatMessage::Assistant { reply } => {
                flatten_reply(reply, &mut items, &mut expected_results);
            }
        }
    }
    items
}

fn flatten_reply(
    reply: &ModelReply,
    items: &mut Vec<HistoryItem>,
    expected_results: &mut HashSet<String>,
) {
    for turn in &reply.turns {
        let mut text = String::new();
        let mut tool_uses = Vec::new();
        let mut results = Vec::new();
        for result in &turn.results {
            match result {
                TurnResult::Text { text: t } => {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(t);
                }
                TurnResult::ToolCall { tool_call } => {
                    if !expected_results.remove(&tool_call.tool_call_id) {
                        tool_uses.push(WireToolUse {
                            id: tool_call.tool_call_id.clone(),
                            name: format!("{}_{}", tool_call.server_name, tool_call.tool_name),
                            args: tool_call.args.clone(),
                        });
                    }
                    results.push(HistoryItem::ToolResult {
                        id: tool_call.tool_call_id.clone(),
                        content: tool_call.result_text().to_string(),
                        is_error: tool_call.error.is_some(),
                    });
                }
            }
        }
        if !text.is_empty() || !tool_uses.is_empty() {
            items.push(HistoryItem::Assistant { text, tool_uses });
        }
        items.extend(results);
    }

    // Calls that went pending were emitted by the model in its final
    // response; replay their tool-uses so the eventual results correlate.
    if !reply.pending_tool_calls.is_empty() {
        let uses: Vec<WireToolUse> = reply
            .pending_tool_calls
            .iter()
            .map(|p| WireToolUse {
                id: p.tool_call_id.clone(),
                name: format!("{}_{}", p.server_name, p.tool_name),
                args: p.args.clone(),
            })
            .collect();
        expected_results.extend(uses.iter().map(|u| u.id.clone()));
        match items.last_mut() {
            Some(HistoryItem::Assistant { tool_uses, .. }) => tool_uses.extend(uses),
            _ => items.push(HistoryItem::Assistant {
                text: String::new(),
                tool_uses: uses,
            }),
        }
    }
}

/// Un-mangle a wire tool name against the active toolset. When several
/// server names could prefix the same wire name, the longest known server
/// name wins.
pub(crate) fn resolve_wire_name(tools: &[ActiveTool], name: &str) -> Option<(String, String)> {
    tools
        .iter()
        .filter(|t| t.wire_name() == name)
        .max_by_key(|t| t.server_name.len())
        .map(|t| (t.server_name.clone(), t.tool_name.clone()))
}

// ─── The reply loop ───────────────────────────────────────────────────────────

/// Drive one full engine invocation: resolve a trailing approval message,
/// then loop provider calls and tool dispatch until a terminal condition.
///
/// Termination: no tool use in the last turn, pending approvals, turn cap,
/// watchdog expiry, provider error, or session cancellation.
pub(crate) async fn run_reply_loop(
    wire: &mut dyn ProviderWire,
    session: &mut dyn SessionContext,
    messages: &[ChatMessage],
) -> ModelReply {
    let mut reply = ModelReply::new();

    if let Some(ChatMessage::Approval { decisions }) = messages.last() {
        let turn = resolve_approvals(wire, session, decisions).await;
        reply.turns.push(turn);
    }

    let max_turns = session.settings().max_chat_turns;
    let mut calls = 0u32;

    loop {
        if calls >= max_turns {
            reply.turns.push(Turn::failed("Maximum number of tool uses reached"));
            break;
        }

        let cancel = session.cancellation();
        let tools = session.active_tools().to_vec();
        let settings = session.settings().clone();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(provider = wire.provider_id(), "reply loop cancelled");
                return reply;
            }
            r = tokio::time::timeout(REQUEST_TIMEOUT, wire.request(&tools, &settings)) => r,
        };

        let wire_turn = match outcome {
            Err(_) => {
                reply.turns.push(Turn::failed("Request timed out"));
                break;
            }
            Ok(Err(e)) => {
                warn!(provider = wire.provider_id(), error = %e, "provider call failed");
                reply.turns.push(Turn::failed(format!(
                    "Error: Failed to generate response from {} - {e}",
                    wire.provider_id()
                )));
                break;
            }
            Ok(Ok(t)) => t,
        };
        calls += 1;

        let mut turn = Turn {
            input_tokens: wire_turn.input_tokens,
            output_tokens: wire_turn.output_tokens,
            ..Turn::default()
        };
        if wire_turn.truncated {
            turn.error = Some("Response truncated: maximum output tokens reached".to_string());
        }
        if !wire_turn.text.is_empty() {
            turn.results.push(TurnResult::Text {
                text: wire_turn.text.clone(),
            });
        }

        let mut has_tool_use = false;
        // Once one call needs approval, every later call in the same
        // response goes pending too: results must eventually pair with
        // every emitted tool-use, and the user may still deny.
        let mut pending_started = false;

        for tool_use in &wire_turn.tool_uses {
            let Some((server, tool)) = resolve_wire_name(&tools, &tool_use.name) else {
                let message = format!("Unknown tool: {}", tool_use.name);
                warn!(tool = %tool_use.name, "model requested a tool outside the active set");
                wire.push_tool_result(&tool_use.id, &message, true);
                turn.results.push(TurnResult::ToolCall {
                    tool_call: ExecutedCall {
                        server_name: String::new(),
                        tool_name: tool_use.name.clone(),
                        args: tool_use.args.clone(),
                        tool_call_id: tool_use.id.clone(),
                        output: None,
                        error: Some(message),
                        elapsed_ms: 0,
                    },
                });
                has_tool_use = true;
                continue;
            };

            if pending_started || session.is_approval_required(&server, &tool) {
                pending_started = true;
                reply.pending_tool_calls.push(PendingCall {
                    server_name: server,
                    tool_name: tool,
                    args: tool_use.args.clone(),
                    tool_call_id: tool_use.id.clone(),
                });
                continue;
            }

            let executed = execute_call(session, &server, &tool, tool_use).await;
            wire.push_tool_result(&tool_use.id, executed.result_text(), executed.error.is_some());
            turn.results.push(TurnResult::ToolCall {
                tool_call: executed,
            });
            has_tool_use = true;
        }

        reply.turns.push(turn);

        if reply.has_pending() || !has_tool_use {
            break;
        }
    }

    reply
}

/// Resolve a trailing approval message: record session approvals, run or
/// deny each call, correlate the results into the wire history, and emit
/// the turn capturing them. No provider call happens here, so the turn
/// carries zero token counts.
async fn resolve_approvals(
    wire: &mut dyn ProviderWire,
    session: &mut dyn SessionContext,
    decisions: &[ToolCallApproval],
) -> Turn {
    let mut turn = Turn::default();
    for decision in decisions {
        let executed = match decision.decision {
            ApprovalDecision::Deny => ExecutedCall {
                server_name: decision.server_name.clone(),
                tool_name: decision.tool_name.clone(),
                args: decision.args.clone(),
                tool_call_id: decision.tool_call_id.clone(),
                output: Some("Tool call denied".to_string()),
                error: Some("Tool call denied".to_string()),
                elapsed_ms: 0,
            },
            ApprovalDecision::AllowSession | ApprovalDecision::AllowOnce => {
                if decision.decision == ApprovalDecision::AllowSession {
                    session.mark_approved(&decision.server_name, &decision.tool_name);
                }
                let dispatch = session
                    .dispatch_tool(&decision.server_name, &decision.tool_name, &decision.args)
                    .await;
                ExecutedCall {
                    server_name: decision.server_name.clone(),
                    tool_name: decision.tool_name.clone(),
                    args: decision.args.clone(),
                    tool_call_id: decision.tool_call_id.clone(),
                    output: dispatch.output,
                    error: dispatch.error,
                    elapsed_ms: dispatch.elapsed_ms,
                }
            }
        };
        wire.push_tool_result(
            &decision.tool_call_id,
            executed.result_text(),
            executed.error.is_some(),
        );
        turn.results.push(TurnResult::ToolCall {
            tool_call: executed,
        });
    }
    turn
}

async fn execute_call(
    session: &mut dyn SessionContext,
    server: &str,
    tool: &str,
    tool_use: &WireToolUse,
) -> ExecutedCall {
    let dispatch = session.dispatch_tool(server, tool, &tool_use.args).await;
    ExecutedCall {
        server_name: server.to_string(),
        tool_name: tool.to_string(),
        args: tool_use.args.clone(),
        tool_call_id: tool_use.id.clone(),
        output: dispatch.output,
        error: dispatch.error,
        elapsed_ms: dispatch.elapsed_ms,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(server: &str, name: &str) -> ActiveTool {
        ActiveTool {
            server_name: server.into(),
            tool_name: name.into(),
            description: String::new(),
            parameters: json!({"type": "object"}),
        }
    }

    // ── Wire-name resolution ──────────────────────────────────────────────────

    #[test]
    fn resolve_simple_wire_name() {
        let tools = vec![tool("fs", "read")];
        assert_eq!(
            resolve_wire_name(&tools, "fs_read"),
            Some(("fs".into(), "read".into()))
        );
    }

    #[test]
    fn resolve_prefers_longest_server_name_on_ambiguity() {
        // "a_b_c" could be server "a" tool "b_c" or server "a_b" tool "c".
        let tools = vec![tool("a", "b_c"), tool("a_b", "c")];
        assert_eq!(
            resolve_wire_name(&tools, "a_b_c"),
            Some(("a_b".into(), "c".into()))
        );
    }

    #[test]
    fn resolve_unknown_name_is_none() {
        let tools = vec![tool("fs", "read")];
        assert_eq!(resolve_wire_name(&tools, "net_fetch"), None);
    }

    #[test]
    fn round_trip_mangled_identity() {
        let tools = vec![tool("fs", "read_file")];
        let mangled = tools[0].wire_name();
        assert_eq!(
            resolve_wire_name(&tools, &mangled),
            Some(("fs".into(), "read_file".into()))
        );
    }

    // ── History flattening ────────────────────────────────────────────────────

    fn executed(id: &str, output: &str) -> ExecutedCall {
        ExecutedCall {
            server_name: "fs".into(),
            tool_name: "read".into(),
            args: json!({"path": "/a"}),
            tool_call_id: id.into(),
            output: Some(output.into()),
            error: None,
            elapsed_ms: 1,
        }
    }

    #[test]
    fn flatten_plain_turn() {
        let mut reply = ModelReply::new();
        reply.turns.push(Turn {
            results: vec![TurnResult::Text { text: "hi".into() }],
            ..Turn::default()
        });
        let items = flatten_history(&[
            ChatMessage::system("prompt"),
            ChatMessage::user("hello"),
            ChatMessage::assistant(reply),
        ]);
        assert_eq!(
            items,
            vec![
                HistoryItem::System("prompt".into()),
                HistoryItem::User("hello".into()),
                HistoryItem::Assistant {
                    text: "hi".into(),
                    tool_uses: vec![]
                },
            ]
        );
    }

    #[test]
    fn flatten_executed_call_emits_use_then_result() {
        let mut reply = ModelReply::new();
        reply.turns.push(Turn {
            results: vec![TurnResult::ToolCall {
                tool_call: executed("c1", "OK"),
            }],
            ..Turn::default()
        });
        let items = flatten_history(&[ChatMessage::assistant(reply)]);
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], HistoryItem::Assistant { tool_uses, .. } if tool_uses.len() == 1));
        assert_eq!(
            items[1],
            HistoryItem::ToolResult {
                id: "c1".into(),
                content: "OK".into(),
                is_error: false
            }
        );
    }

    #[test]
    fn flatten_pending_then_resolution_correlates_once() {
        // Reply 1: pending call c9. Approval. Reply 2: first turn records c9.
        let mut first = ModelReply::new();
        first.turns.push(Turn {
            results: vec![TurnResult::Text {
                text: "need approval".into(),
            }],
            ..Turn::default()
        });
        first.pending_tool_calls.push(PendingCall {
            server_name: "fs".into(),
            tool_name: "delete".into(),
            args: json!({"path": "/b"}),
            tool_call_id: "c9".into(),
        });

        let approval = ChatMessage::approval(vec![ToolCallApproval {
            server_name: "fs".into(),
            tool_name: "delete".into(),
            tool_call_id: "c9".into(),
            args: json!({"path": "/b"}),
            decision: ApprovalDecision::AllowOnce,
        }]);

        let mut second = ModelReply::new();
        second.turns.push(Turn {
            results: vec![TurnResult::ToolCall {
                tool_call: ExecutedCall {
                    server_name: "fs".into(),
                    tool_name: "delete".into(),
                    args: json!({"path": "/b"}),
                    tool_call_id: "c9".into(),
                    output: Some("gone".into()),
                    error: None,
                    elapsed_ms: 2,
                },
            }],
            ..Turn::default()
        });
        second.turns.push(Turn {
            results: vec![TurnResult::Text { text: "done".into() }],
            ..Turn::default()
        });

        let items = flatten_history(&[
            ChatMessage::assistant(first),
            approval,
            ChatMessage::assistant(second),
        ]);

        // Exactly one tool-use for c9 (merged into the pending reply's
        // assistant item), exactly one result, then the follow-up text.
        let uses: usize = items
            .iter()
            .filter_map(|i| match i {
                HistoryItem::Assistant { tool_uses, .. } => Some(tool_uses.len()),
                _ => None,
            })
            .sum();
        assert_eq!(uses, 1);
        let results: Vec<_> = items
            .iter()
            .filter(|i| matches!(i, HistoryItem::ToolResult { .. }))
            .collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            items.last().unwrap(),
            HistoryItem::Assistant { text, .. } if text == "done"
        ));
    }

    #[test]
    fn flatten_skips_error_messages() {
        let items = flatten_history(&[
            ChatMessage::user("hi"),
            ChatMessage::error("the sky fell"),
            ChatMessage::user("again"),
        ]);
        assert_eq!(items.len(), 2);
    }
}
