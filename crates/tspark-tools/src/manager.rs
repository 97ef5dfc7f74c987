// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

use crate::client::{SessionToolScope, ToolCallResult, ToolDescriptor, ToolServerClient};

/// Registry of tool-server clients keyed by server name, shared by every
/// session in a workspace.
///
/// Dispatch accepts the wire-mangled form `serverName_toolName` and
/// un-mangles it against the known server names; when several names could
/// prefix the same mangled string, the longest known server name wins
/// (closed-world assumption on server names).
pub struct McpManager {
    clients: RwLock<HashMap<String, Arc<dyn ToolServerClient>>>,
}

impl McpManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
        })
    }

    pub async fn get_client(&self, name: &str) -> Option<Arc<dyn ToolServerClient>> {
        self.clients.read().await.get(name).cloned()
    }

    pub async fn all_clients(&self) -> Vec<(String, Arc<dyn ToolServerClient>)> {
        let mut clients: Vec<_> = self
            .clients
            .read()
            .await
            .iter()
            .map(|(name, client)| (name.clone(), client.clone()))
            .collect();
        clients.sort_by(|a, b| a.0.cmp(&b.0));
        clients
    }

    /// Install or replace the client for `name`. A replaced client is
    /// disconnected first so its transport does not linger.
    pub async fn update_client(&self, name: &str, client: Arc<dyn ToolServerClient>) {
        let previous = self
            .clients
            .write()
            .await
            .insert(name.to_string(), client);
        if let Some(previous) = previous {
            previous.disconnect().await;
        }
    }

    /// Remove the client for `name`, disconnecting it. Returns whether a
    /// client was registered.
    pub async fn delete_client(&self, name: &str) -> bool {
        let removed = self.clients.write().await.remove(name);
        match removed {
            Some(client) => {
                client.disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Every `(serverName, tool)` across all clients, sorted by server
    /// name then tool name.
    pub async fn get_all_tools(&self) -> Vec<(String, ToolDescriptor)> {
        let mut out = Vec::new();
        for (name, client) in self.all_clients().await {
            for tool in client.list_tools().await {
                out.push((name.clone(), tool));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));
        out
    }

    /// Split a mangled `serverName_toolName` against the known server set.
    pub fn split_tool_name(known: &[String], mangled: &str) -> Option<(String, String)> {
        known
            .iter()
            .filter_map(|server| {
                mangled
                    .strip_prefix(server.as_str())
                    .and_then(|rest| rest.strip_prefix('_'))
                    .filter(|tool| !tool.is_empty())
                    .map(|tool| (server.clone(), tool.to_string()))
            })
            .max_by_key(|(server, _)| server.len())
    }

    /// Dispatch a call addressed by its mangled wire name.
    pub async fn call_tool(
        &self,
        mangled: &str,
        args: Value,
        session: Option<&dyn SessionToolScope>,
    ) -> ToolCallResult {
        let known: Vec<String> = self.clients.read().await.keys().cloned().collect();
        let Some((server, tool)) = Self::split_tool_name(&known, mangled) else {
            warn!(name = mangled, "no known server matches mangled tool name");
            return ToolCallResult::failed(format!("Unknown tool: {mangled}"), 0);
        };
        self.call_on(&server, &tool, args, session).await
    }

    /// Dispatch a call already resolved to `(server, tool)`.
    pub async fn call_on(
        &self,
        server: &str,
        tool: &str,
        args: Value,
        session: Option<&dyn SessionToolScope>,
    ) -> ToolCallResult {
        let Some(client) = self.get_client(server).await else {
            return ToolCallResult::failed(format!("Unknown tool server: {server}"), 0);
        };
        client.call_tool(tool, args, session).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
