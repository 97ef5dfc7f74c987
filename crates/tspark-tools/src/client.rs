// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

/// One tool as advertised by a server.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema of the tool's arguments object
    pub input_schema: Value,
}

/// One typed part of a tool result. The core consumes only text; anything
/// else is preserved opaquely so callers can round-trip it.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolContentPart {
    Text { text: String },
    Other(Value),
}

/// Outcome of one tool call.
///
/// Transport faults land in `error` instead of being raised, so the turn
/// engine can record them and keep the conversation moving.
#[derive(Debug, Clone, Default)]
pub struct ToolCallResult {
    pub content: Vec<ToolContentPart>,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

impl ToolCallResult {
    pub fn ok(content: Vec<ToolContentPart>, elapsed_ms: u64) -> Self {
        Self {
            content,
            elapsed_ms,
            error: None,
        }
    }

    /// A plain-text success result.
    pub fn text(text: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::ok(vec![ToolContentPart::Text { text: text.into() }], elapsed_ms)
    }

    pub fn failed(message: impl Into<String>, elapsed_ms: u64) -> Self {
        let message = message.into();
        Self {
            content: vec![ToolContentPart::Text {
                text: message.clone(),
            }],
            elapsed_ms,
            error: Some(message),
        }
    }

    /// All text parts joined with newlines.
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        for part in &self.content {
            if let ToolContentPart::Text { text } = part {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }
}

/// Session-scope view threaded into tool calls so the built-in
/// tool-inclusion tools can read and mutate the calling session's toolset.
/// Implemented by the chat session; all methods use interior mutability so
/// the handle can be shared with a client mid-dispatch.
#[async_trait]
pub trait SessionToolScope: Send + Sync {
    /// `(server, tool)` pairs currently in the session's scope, in order.
    async fn included_tools(&self) -> Vec<(String, String)>;
    async fn include_tool(&self, server: &str, tool: &str) -> Result<(), String>;
    async fn exclude_tool(&self, server: &str, tool: &str) -> Result<(), String>;
    /// Include every tool the server currently advertises.
    async fn include_server(&self, server: &str) -> Result<(), String>;
    async fn exclude_server(&self, server: &str) -> Result<(), String>;
}

/// Transport-neutral contract every tool-server client satisfies.
///
/// Clients are shared across sessions and must tolerate interleaved calls;
/// all state lives behind interior mutability. `connect` is idempotent and
/// may be retried after a disconnect; a failed call marks the client
/// disconnected so the next call reconnects.
#[async_trait]
pub trait ToolServerClient: Send + Sync {
    fn server_name(&self) -> &str;

    /// Establish the connection and populate the cached tool list.
    /// Returns whether the client is connected afterwards.
    async fn connect(&self) -> bool;

    async fn disconnect(&self);

    /// Cached view of the server's tools, populated by `connect`.
    async fn list_tools(&self) -> Vec<ToolDescriptor>;

    async fn call_tool(
        &self,
        tool_name: &str,
        args: Value,
        session: Option<&dyn SessionToolScope>,
    ) -> ToolCallResult;

    /// Round-trip latency probe. `Err` carries the failure message.
    async fn ping(&self) -> Result<u64, String>;

    /// Most recent log lines (stderr for stdio servers, transport faults
    /// otherwise), oldest first, capped at 100 entries.
    fn error_log(&self) -> Vec<String>;

    fn server_version(&self) -> Option<String>;

    fn is_connected(&self) -> bool;
}

/// Bounded log shared by all client variants.
pub(crate) struct ErrorLog {
    entries: Mutex<VecDeque<String>>,
}

impl ErrorLog {
    pub(crate) const CAP: usize = 100;

    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push(&self, line: impl Into<String>) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() == Self::CAP {
            entries.pop_front();
        }
        entries.push_back(line.into());
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
