// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Weak};

use serde_json::{json, Value};
use tspark_config::{ConfigStore, IncludeMode};

use super::{args_object, required_str, DispatchResult};
use crate::client::SessionToolScope;
use crate::manager::McpManager;
use crate::ToolDescriptor;

/// Tool-inclusion management exposed as tools the model can drive.
///
/// Read-only operations (`listTools`, `getTool`) go against the workspace's
/// tool registry. Context-mutating operations act on the calling session's
/// scope and therefore require the session handle threaded through
/// `call_tool`; without one they fail with "Chat session not found".
/// Mode-setting operations persist into the server config.
pub struct ToolInclusionTools {
    config: Arc<ConfigStore>,
    /// Weak: the manager owns this tool group's client, not the reverse.
    manager: Weak<McpManager>,
}

impl ToolInclusionTools {
    pub fn new(config: Arc<ConfigStore>, manager: Weak<McpManager>) -> Self {
        Self { config, manager }
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let server_prop = json!({"type": "string", "description": "Tool server name"});
        let tool_prop = json!({"type": "string", "description": "Tool name on that server"});
        let mode_prop = json!({"type": "string", "enum": ["always", "manual", "agent"]});
        vec![
            ToolDescriptor {
                name: "listTools".into(),
                description: "List every tool available across all tool servers".into(),
                input_schema: json!({"type": "object", "properties": {}}),
            },
            ToolDescriptor {
                name: "getTool".into(),
                description: "Fetch one tool's description and input schema".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"server": server_prop, "tool": tool_prop},
                    "required": ["server", "tool"],
                }),
            },
            ToolDescriptor {
                name: "listContextTools".into(),
                description: "List the tools currently in this chat's context".into(),
                input_schema: json!({"type": "object", "properties": {}}),
            },
            ToolDescriptor {
                name: "includeTool".into(),
                description: "Add a tool to this chat's context".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"server": server_prop, "tool": tool_prop},
                    "required": ["server", "tool"],
                }),
            },
            ToolDescriptor {
                name: "excludeTool".into(),
                description: "Remove a tool from this chat's context".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"server": server_prop, "tool": tool_prop},
                    "required": ["server", "tool"],
                }),
            },
            ToolDescriptor {
                name: "includeServer".into(),
                description: "Add all of a server's tools to this chat's context".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"server": server_prop},
                    "required": ["server"],
                }),
            },
            ToolDescriptor {
                name: "excludeServer".into(),
                description: "Remove all of a server's tools from this chat's context".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"server": server_prop},
                    "required": ["server"],
                }),
            },
            ToolDescriptor {
                name: "setToolIncludeMode".into(),
                description: "Persist when one tool enters new chats (always/manual/agent)".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"server": server_prop, "tool": tool_prop, "mode": mode_prop},
                    "required": ["server", "tool", "mode"],
                }),
            },
            ToolDescriptor {
                name: "setServerIncludeMode".into(),
                description: "Persist a server's default include mode (always/manual/agent)".into(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"server": server_prop, "mode": mode_prop},
                    "required": ["server", "mode"],
                }),
            },
        ]
    }

    pub async fn dispatch(
        &self,
        tool_name: &str,
        args: &Value,
        session: Option<&dyn SessionToolScope>,
    ) -> DispatchResult {
        match tool_name {
            "listTools" => self.list_tools().await,
            "getTool" => self.get_tool(args).await,
            "listContextTools" => {
                let scope = session.ok_or("Chat session not found")?;
                let items: Vec<Value> = scope
                    .included_tools()
                    .await
                    .into_iter()
                    .map(|(server, tool)| json!({"server": server, "tool": tool}))
                    .collect();
                Ok(Value::Array(items).to_string())
            }
            "includeTool" | "excludeTool" => {
                let scope = session.ok_or("Chat session not found")?;
                let map = args_object(args)?;
                let (server, tool) = match (required_str(map, "server"), required_str(map, "tool"))
                {
                    (Ok(s), Ok(t)) => (s, t),
                    (Err(e), _) | (_, Err(e)) => return Ok(e),
                };
                let (result, included) = if tool_name == "includeTool" {
                    (scope.include_tool(server, tool).await, true)
                } else {
                    (scope.exclude_tool(server, tool).await, false)
                };
                match result {
                    Ok(()) => Ok(json!({"server": server, "tool": tool, "included": included})
                        .to_string()),
                    Err(e) => Ok(format!("Error: {e}")),
                }
            }
            "includeServer" | "excludeServer" => {
                let scope = session.ok_or("Chat session not found")?;
                let map = args_object(args)?;
                let server = match required_str(map, "server") {
                    Ok(s) => s,
                    Err(e) => return Ok(e),
                };
                let (result, included) = if tool_name == "includeServer" {
                    (scope.include_server(server).await, true)
                } else {
                    (scope.exclude_server(server).await, false)
                };
                match result {
                    Ok(()) => Ok(json!({"server": server, "included": included}).to_string()),
                    Err(e) => Ok(format!("Error: {e}")),
                }
            }
            "setToolIncludeMode" => self.set_tool_mode(args),
            "setServerIncludeMode" => self.set_server_mode(args),
            other => Err(format!("Unknown tool `{other}`")),
        }
    }

    async fn list_tools(&self) -> DispatchResult {
        let manager = self.manager.upgrade().ok_or("Tool registry unavailable")?;
        let items: Vec<Value> = manager
            .get_all_tools()
            .await
            .into_iter()
            .map(|(server, tool)| {
                json!({
                    "server": server,
                    "tool": tool.name,
                    "description": tool.description,
                })
            })
            .collect();
        Ok(Value::Array(items).to_string())
    }

    async fn get_tool(&self, args: &Value) -> DispatchResult {
        let manager = self.manager.upgrade().ok_or("Tool registry unavailable")?;
        let map = args_object(args)?;
        let (server, tool) = match (required_str(map, "server"), required_str(map, "tool")) {
            (Ok(s), Ok(t)) => (s, t),
            (Err(e), _) | (_, Err(e)) => return Ok(e),
        };
        let Some(client) = manager.get_client(server).await else {
            return Ok(format!("Error: unknown tool server `{server}`"));
        };
        match client.list_tools().await.into_iter().find(|t| t.name == tool) {
            Some(descriptor) => Ok(json!({
                "server": server,
                "tool": descriptor.name,
                "description": descriptor.description,
                "inputSchema": descriptor.input_schema,
            })
            .to_string()),
            None => Ok(format!("Error: unknown tool `{tool}` on server `{server}`")),
        }
    }

    fn set_tool_mode(&self, args: &Value) -> DispatchResult {
        let map = args_object(args)?;
        let (server, tool) = match (required_str(map, "server"), required_str(map, "tool")) {
            (Ok(s), Ok(t)) => (s, t),
            (Err(e), _) | (_, Err(e)) => return Ok(e),
        };
        let mode = match parse_mode(map) {
            Ok(m) => m,
            Err(e) => return Ok(e),
        };
        let Some(mut cfg) = self.config.get_tool_server(server) else {
            return Ok(format!("Error: unknown tool server `{server}`"));
        };
        cfg.set_tool_include_mode(tool, mode);
        match self.config.save_tool_server(cfg) {
            Ok(()) => Ok(json!({"server": server, "tool": tool, "mode": mode}).to_string()),
            Err(e) => Ok(format!("Error: {e}")),
        }
    }

    fn set_server_mode(&self, args: &Value) -> DispatchResult {
        let map = args_object(args)?;
        let server = match required_str(map, "server") {
            Ok(s) => s,
            Err(e) => return Ok(e),
        };
        let mode = match parse_mode(map) {
            Ok(m) => m,
            Err(e) => return Ok(e),
        };
        let Some(mut cfg) = self.config.get_tool_server(server) else {
            return Ok(format!("Error: unknown tool server `{server}`"));
        };
        cfg.set_server_include_mode(mode);
        match self.config.save_tool_server(cfg) {
            Ok(()) => Ok(json!({"server": server, "mode": mode}).to_string()),
            Err(e) => Ok(format!("Error: {e}")),
        }
    }
}

fn parse_mode(map: &serde_json::Map<String, Value>) -> Result<IncludeMode, String> {
    match required_str(map, "mode")? {
        "always" => Ok(IncludeMode::Always),
        "manual" => Ok(IncludeMode::Manual),
        "agent" => Ok(IncludeMode::Agent),
        _ => Err("Error: argument `mode` must be one of always, manual, agent".to_string()),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use tspark_config::{EventBus, InternalTool, ServerConfig, Transport};

    struct FakeScope {
        tools: Mutex<Vec<(String, String)>>,
    }

    impl FakeScope {
        fn new() -> Self {
            Self {
                tools: Mutex::new(vec![("fs".into(), "read".into())]),
            }
        }
    }

    #[async_trait::async_trait]
    impl SessionToolScope for FakeScope {
        async fn included_tools(&self) -> Vec<(String, String)> {
            self.tools.lock().unwrap().clone()
        }
        async fn include_tool(&self, server: &str, tool: &str) -> Result<(), String> {
            self.tools
                .lock()
                .unwrap()
                .push((server.to_string(), tool.to_string()));
            Ok(())
        }
        async fn exclude_tool(&self, server: &str, tool: &str) -> Result<(), String> {
            self.tools
                .lock()
                .unwrap()
                .retain(|(s, t)| s != server || t != tool);
            Ok(())
        }
        async fn include_server(&self, _server: &str) -> Result<(), String> {
            Ok(())
        }
        async fn exclude_server(&self, server: &str) -> Result<(), String> {
            self.tools.lock().unwrap().retain(|(s, _)| s != server);
            Ok(())
        }
    }

    fn tools_with_config() -> (ToolInclusionTools, Arc<ConfigStore>, tempfile::TempDir) {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Arc::new(ConfigStore::open(tmp.path(), true, EventBus::new()).unwrap());
        config
            .save_tool_server(ServerConfig::new(
                "tools",
                Transport::Internal {
                    tool: InternalTool::Tools,
                },
            ))
            .unwrap();
        let inclusion = ToolInclusionTools::new(config.clone(), Weak::new());
        (inclusion, config, tmp)
    }

    #[tokio::test]
    async fn context_mutations_require_session() {
        let (t, _, _tmp) = tools_with_config();
        for name in ["listContextTools", "includeTool", "excludeTool", "includeServer"] {
            let r = t.dispatch(name, &json!({"server": "fs", "tool": "read"}), None).await;
            assert_eq!(r.unwrap_err(), "Chat session not found", "{name}");
        }
    }

    #[tokio::test]
    async fn include_and_list_context_tools() {
        let (t, _, _tmp) = tools_with_config();
        let scope = FakeScope::new();
        let out = t
            .dispatch(
                "includeTool",
                &json!({"server": "fs", "tool": "write"}),
                Some(&scope),
            )
            .await
            .unwrap();
        assert!(out.contains("\"included\":true"));

        let listed = t
            .dispatch("listContextTools", &json!({}), Some(&scope))
            .await
            .unwrap();
        let items: Value = serde_json::from_str(&listed).unwrap();
        assert_eq!(items.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn exclude_tool_removes_from_scope() {
        let (t, _, _tmp) = tools_with_config();
        let scope = FakeScope::new();
        t.dispatch(
            "excludeTool",
            &json!({"server": "fs", "tool": "read"}),
            Some(&scope),
        )
        .await
        .unwrap();
        assert!(scope.included_tools().await.is_empty());
    }

    #[tokio::test]
    async fn set_tool_include_mode_persists_to_config() {
        let (t, config, _tmp) = tools_with_config();
        t.dispatch(
            "setToolIncludeMode",
            &json!({"server": "tools", "tool": "listTools", "mode": "agent"}),
            None,
        )
        .await
        .unwrap();
        let cfg = config.get_tool_server("tools").unwrap();
        assert_eq!(cfg.include_mode_for("listTools"), IncludeMode::Agent);
    }

    #[tokio::test]
    async fn set_mode_rejects_bad_mode_as_error_text() {
        let (t, _, _tmp) = tools_with_config();
        let out = t
            .dispatch(
                "setServerIncludeMode",
                &json!({"server": "tools", "mode": "sometimes"}),
                None,
            )
            .await
            .unwrap();
        assert!(out.starts_with("Error: "));
    }

    #[tokio::test]
    async fn list_tools_without_manager_is_hard_error() {
        let (t, _, _tmp) = tools_with_config();
        assert!(t.dispatch("listTools", &json!({}), None).await.is_err());
    }
}
