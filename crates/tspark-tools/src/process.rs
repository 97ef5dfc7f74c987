// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use rmcp::model::CallToolRequestParams;
use rmcp::service::RunningService;
use rmcp::{RoleClient, ServiceExt};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::bridge;
use crate::client::{ErrorLog, SessionToolScope, ToolCallResult, ToolDescriptor, ToolServerClient};

/// MCP client for a child process speaking stdio.
///
/// The child's stderr is redirected into a capture file and folded into the
/// error log on demand. If the configured environment lacks a `PATH` and the
/// workspace recorded one, it is injected so `npx`-style launchers resolve.
pub struct StdioClient {
    name: String,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    system_path: Option<String>,
    service: tokio::sync::Mutex<Option<RunningService<RoleClient, ()>>>,
    tools: Mutex<Vec<ToolDescriptor>>,
    version: Mutex<Option<String>>,
    connected: AtomicBool,
    errors: ErrorLog,
    /// Capture file for the child's stderr plus the read offset already
    /// drained into the error log.
    stderr_capture: Mutex<Option<(tempfile::NamedTempFile, u64)>>,
}

impl StdioClient {
    pub fn new(
        name: String,
        command: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        system_path: Option<String>,
    ) -> Self {
        Self {
            name,
            command,
            args,
            env,
            system_path,
            service: tokio::sync::Mutex::new(None),
            tools: Mutex::new(Vec::new()),
            version: Mutex::new(None),
            connected: AtomicBool::new(false),
            errors: ErrorLog::new(),
            stderr_capture: Mutex::new(None),
        }
    }

    async fn establish(&self) -> anyhow::Result<()> {
        let capture = tempfile::NamedTempFile::new()?;
        let stderr_handle = capture.reopen()?;

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr_handle));
        if !self.env.contains_key("PATH") {
            if let Some(path) = &self.system_path {
                cmd.env("PATH", path);
            }
        }

        let transport = rmcp::transport::TokioChildProcess::new(cmd)?;
        let service = ().serve(transport).await?;

        if let Some(info) = service.peer_info() {
            *self.version.lock().unwrap() = Some(format!(
                "{} {}",
                info.server_info.name, info.server_info.version
            ));
        }
        let tools = service.peer().list_all_tools().await?;
        *self.tools.lock().unwrap() = tools.iter().map(bridge::tool_to_descriptor).collect();

        *self.stderr_capture.lock().unwrap() = Some((capture, 0));
        *self.service.lock().await = Some(service);
        self.connected.store(true, Ordering::SeqCst);
        debug!(server = %self.name, command = %self.command, "stdio tool server connected");
        Ok(())
    }

    /// Fold any stderr output the child produced since the last drain into
    /// the error log.
    fn drain_stderr(&self) {
        let mut guard = self.stderr_capture.lock().unwrap();
        let Some((capture, offset)) = guard.as_mut() else {
            return;
        };
        let Ok(mut file) = std::fs::File::open(capture.path()) else {
            return;
        };
        if file.seek(SeekFrom::Start(*offset)).is_err() {
            return;
        }
        let mut buf = String::new();
        if file.read_to_string(&mut buf).is_err() {
            return;
        }
        *offset += buf.len() as u64;
        for line in buf.lines().filter(|l| !l.trim().is_empty()) {
            self.errors.push(line);
        }
    }

    async fn ensure_connected(&self) -> bool {
        if self.connected.load(Ordering::SeqCst) {
            return true;
        }
        self.connect().await
    }

    fn record_fault(&self, context: &str, error: &dyn std::fmt::Display) {
        self.drain_stderr();
        self.errors.push(format!("{context}: {error}"));
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ToolServerClient for StdioClient {
    fn server_name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> bool {
        if self.connected.load(Ordering::SeqCst) {
            return true;
        }
        match self.establish().await {
            Ok(()) => true,
            Err(e) => {
                warn!(server = %self.name, error = %e, "stdio tool server failed to connect");
                self.record_fault("connect", &e);
                false
            }
        }
    }

    async fn disconnect(&self) {
        if let Some(service) = self.service.lock().await.take() {
            if let Err(e) = service.cancel().await {
                warn!(server = %self.name, error = %e, "error shutting down tool server");
            }
        }
        self.drain_stderr();
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
        self.drain_stderr();
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

    fn client(command: &str) -> StdioClient {
        StdioClient::new(
            "fs".into(),
            command.into(),
            vec![],
            BTreeMap::new(),
            None,
        )
    }

    #[tokio::test]
    async fn connect_failure_is_logged_not_raised() {
        let c = client("/definitely/not/a/real/binary");
        assert!(!c.connect().await);
        assert!(!c.is_connected());
        assert!(!c.error_log().is_empty());
    }

    #[tokio::test]
    async fn call_on_disconnected_client_fails_soft() {
        let c = client("/definitely/not/a/real/binary");
        let result = c
            .call_tool("read", serde_json::json!({"path": "/a"}), None)
            .await;
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn ping_on_disconnected_client_errs() {
        let c = client("/definitely/not/a/real/binary");
        assert!(c.ping().await.is_err());
    }

    #[tokio::test]
    async fn version_and_tools_empty_before_connect() {
        let c = client("true");
        assert!(c.server_version().is_none());
        assert!(c.list_tools().await.is_empty());
    }
}
