// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use crate::builtin::{FragmentTools, ToolInclusionTools};
use crate::client::{SessionToolScope, ToolCallResult, ToolDescriptor, ToolServerClient};

/// Which built-in group an in-process server serves.
pub enum BuiltinGroup {
    Fragments(FragmentTools),
    Inclusion(ToolInclusionTools),
}

/// In-process tool server. No transport, no handshake: `connect` always
/// succeeds and results are deterministic JSON strings in a text part.
pub struct InternalClient {
    name: String,
    group: BuiltinGroup,
    connected: AtomicBool,
}

impl InternalClient {
    pub fn new(name: String, group: BuiltinGroup) -> Self {
        Self {
            name,
            group,
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ToolServerClient for InternalClient {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> bool {
        self.connected.store(true, Ordering::SeqCst);
        true
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        match &self.group {
            BuiltinGroup::Fragments(tools) => tools.descriptors(),
            BuiltinGroup::Inclusion(tools) => tools.descriptors(),
        }
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        args: Value,
        session: Option<&dyn SessionToolScope>,
    ) -> ToolCallResult {
        let started = Instant::now();
        let outcome = match &self.group {
            BuiltinGroup::Fragments(tools) => tools.dispatch(tool_name, &args),
            BuiltinGroup::Inclusion(tools) => tools.dispatch(tool_name, &args, session).await,
        };
        let elapsed = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(text) => ToolCallResult::text(text, elapsed),
            Err(message) => ToolCallResult::failed(message, elapsed),
        }
    }

    async fn ping(&self) -> Result<u64, String> {
        Ok(0)
    }

    fn error_log(&self) -> Vec<String> {
        Vec::new()
    }

    fn server_version(&self) -> Option<String> {
        Some(format!("tspark-internal {}", env!("CARGO_PKG_VERSION")))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use tspark_config::{EventBus, FragmentKind, FragmentStore};

    fn rules_client(tmp: &tempfile::TempDir) -> InternalClient {
        let store = Arc::new(FragmentStore::new(
            tmp.path(),
            FragmentKind::Rule,
            EventBus::new(),
        ));
        InternalClient::new("rules".into(), BuiltinGroup::Fragments(FragmentTools::new(store)))
    }

    #[tokio::test]
    async fn connect_is_trivially_true() {
        let tmp = tempfile::TempDir::new().unwrap();
        let c = rules_client(&tmp);
        assert!(!c.is_connected());
        assert!(c.connect().await);
        assert!(c.is_connected());
    }

    #[tokio::test]
    async fn call_returns_deterministic_json_text() {
        let tmp = tempfile::TempDir::new().unwrap();
        let c = rules_client(&tmp);
        let result = c
            .call_tool(
                "createRule",
                serde_json::json!({"name": "r", "text": "x"}),
                None,
            )
            .await;
        assert!(result.error.is_none());
        assert_eq!(result.text_content(), r#"{"created":true,"name":"r"}"#);
    }

    #[tokio::test]
    async fn unknown_tool_fails_with_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let c = rules_client(&tmp);
        let result = c.call_tool("mysteryTool", serde_json::json!({}), None).await;
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn ping_is_instant() {
        let tmp = tempfile::TempDir::new().unwrap();
        let c = rules_client(&tmp);
        assert_eq!(c.ping().await.unwrap(), 0);
    }
}
