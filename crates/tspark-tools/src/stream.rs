// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::model::CallToolRequestParams;
use rmcp::service::RunningService;
use rmcp::transport::{sse_client::SseClientConfig, SseClientTransport};
use rmcp::{RoleClient, ServiceExt};
use serde_json::Value;
use tracing::{debug, warn};

use crate::bridge;
use crate::client::{ErrorLog, SessionToolScope, ToolCallResult, ToolDescriptor, ToolServerClient};

/// MCP client for a long-lived SSE endpoint.
///
/// Configured headers ride on every request via the underlying HTTP client.
/// Stream sessions are assumed lost on any transport fault — including an
/// observed re-initialize within one session — so a fault marks the client
/// disconnected and the next call rebuilds the stream from scratch.
pub struct StreamClient {
    name: String,
    url: String,
    headers: BTreeMap<String, String>,
    service: tokio::sync::Mutex<Option<RunningService<RoleClient, ()>>>,
    tools: Mutex<Vec<ToolDescriptor>>,
    version: Mutex<Option<String>>,
    connected: AtomicBool,
    errors: ErrorLog,
}

impl StreamClient {
    pub fn new(name: String, url: String, headers: BTreeMap<String, String>) -> Self {
        Self {
            name,
            url,
            headers,
            service: tokio::sync::Mutex::new(None),
            tools: Mutex::new(Vec::new()),
            version: Mutex::new(None),
            connected: AtomicBool::new(false),
            errors: ErrorLog::new(),
        }
    }

    fn header_map(&self) -> anyhow::Result<HeaderMap> {
        let mut map = HeaderMap::new();
        for (key, value) in &self.headers {
            let name: HeaderName = key.parse()?;
            let value: HeaderValue = value.parse()?;
            map.insert(name, value);
        }
        Ok(map)
    }

    async fn establish(&self) -> anyhow::Result<()> {
        let http = reqwest::ClientBuilder::new()
            .default_headers(self.header_map()?)
            .build()?;
        let transport = SseClientTransport::start_with_client(
            http,
            SseClientConfig {
                sse_endpoint: self.url.clone().into(),
                ..Default::default()
            },
        )
        .await?;
        let service = ().serve(transport).await?;

        if let Some(info) = service.peer_info() {
            *self.version.lock().unwrap() = Some(format!(
                "{} {}",
                info.server_info.name, info.server_info.version
            ));
        }
        let tools = service.peer().list_all_tools().await?;
        *self.tools.lock().unwrap() = tools.iter().map(bridge::tool_to_descriptor).collect();

        *self.service.lock().await = Some(service);
        self.connected.store(true, Ordering::SeqCst);
        debug!(server = %self.name, url = %self.url, "sse tool server connected");
        Ok(())
    }

    fn record_fault(&self, context: &str, error: &dyn std::fmt::Display) {
        self.errors.push(format!("{context}: {error}"));
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn ensure_connected(&self) -> bool {
        if self.connected.load(Ordering::SeqCst) {
            return true;
        }
        self.connect().await
    }
}

#[async_trait]
impl ToolServerClient for StreamClient {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> bool {
        if self.connected.load(Ordering::SeqCst) {
            return true;
        }
        // Drop any stale half-open session before rebuilding.
        if let Some(stale) = self.service.lock().await.take() {
            let _ = stale.cancel().await;
        }
        match self.establish().await {
            Ok(()) => true,
            Err(e) => {
                warn!(server = %self.name, error = %e, "sse tool server failed to connect");
                self.record_fault("connect", &e);
                false
            }
        }
    }

    async fn disconnect(&self) {
        if let Some(service) = self.service.lock().await.take() {
            if let Err(e) = service.cancel().await {
                warn!(server = %self.name, error = %e, "error shutting down sse tool server");
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.lock().unwrap().clone()
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        args: Value,
        _session: Option<&dyn SessionToolScope>,
    ) -> ToolCallResult {
        let started = Instant::now();
        if !self.ensure_connected().await {
            return ToolCallResult::failed(
                format!("tool server `{}` is not connected", self.name),
                started.elapsed().as_millis() as u64,
            );
        }

        let request = CallToolRequestParams {
            meta: None,
            name: Cow::Owned(tool_name.to_string()),
            arguments: args.as_object().cloned(),
            task: None,
            ..Default::default()
        };
        let outcome = {
            let guard = self.service.lock().await;
            match guard.as_ref() {
                Some(service) => service.peer().call_tool(request).await,
                None => {
                    return ToolCallResult::failed(
                        format!("tool server `{}` is not connected", self.name),
                        started.elapsed().as_millis() as u64,
                    )
                }
            }
        };
        let elapsed = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => bridge::call_result(result, elapsed),
            Err(e) => {
                // Stream session presumed lost; next call reconnects.
                self.record_fault(&format!("call {tool_name}"), &e);
                ToolCallResult::failed(format!("tool call failed: {e}"), elapsed)
            }
        }
    }

    async fn ping(&self) -> Result<u64, String> {
        let started = Instant::now();
        if !self.ensure_connected().await {
            return Err(format!("tool server `{}` is not connected", self.name));
        }
        let guard = self.service.lock().await;
        let service = guard
            .as_ref()
            .ok_or_else(|| format!("tool server `{}` is not connected", self.name))?;
        match service.peer().list_all_tools().await {
            Ok(_) => Ok(started.elapsed().as_millis() as u64),
            Err(e) => {
                drop(guard);
                self.record_fault("ping", &e);
                Err(e.to_string())
            }
        }
    }

    fn error_log(&self) -> Vec<String> {
        self.errors.snapshot()
    }

    fn server_version(&self) -> Option<String> {
        self.version.lock().unwrap().clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_map_builds_from_config() {
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), "Bearer t".to_string());
        headers.insert("X-Team".to_string(), "core".to_string());
        let c = StreamClient::new("remote".into(), "http://localhost:1/sse".into(), headers);
        let map = c.header_map().unwrap();
        assert_eq!(map.get("authorization").unwrap(), "Bearer t");
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn invalid_header_name_is_an_error() {
        let mut headers = BTreeMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        let c = StreamClient::new("remote".into(), "http://localhost:1/sse".into(), headers);
        assert!(c.header_map().is_err());
    }

    #[tokio::test]
    async fn connect_failure_marks_disconnected_and_logs() {
        // Nothing listens on this port.
        let c = StreamClient::new(
            "remote".into(),
            "http://127.0.0.1:1/sse".into(),
            BTreeMap::new(),
        );
        assert!(!c.connect().await);
        assert!(!c.is_connected());
        assert!(!c.error_log().is_empty());
    }
}
