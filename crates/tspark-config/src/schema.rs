// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so a named function is required for enabled-by-default
/// fields.
pub(crate) fn default_true() -> bool {
    true
}

fn default_always() -> IncludeMode {
    IncludeMode::Always
}

fn default_required() -> Permission {
    Permission::Required
}

/// The root document persisted as `tspark.json` in the workspace directory.
///
/// Every section defaults to empty so a partial or corrupt document loads
/// degraded rather than failing the whole workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceDoc {
    pub metadata: Metadata,
    /// Flat settings map. Well-known keys are validated on write; unknown
    /// keys pass through untouched (front-ends may store their own).
    pub settings: serde_json::Map<String, serde_json::Value>,
    /// Installed providers: provider id → credential key/value map.
    pub providers: BTreeMap<String, BTreeMap<String, String>>,
    /// Configured tool servers keyed by server name.
    pub mcp_servers: BTreeMap<String, ServerConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Metadata {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<DateTime<Utc>>,
    pub version: u32,
}

/// One configured tool server.
///
/// In `tspark.json` these live in a map keyed by server name, so the name
/// is not serialized into the body; the store fills it in after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(skip)]
    pub name: String,
    #[serde(flatten)]
    pub transport: Transport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_include: Option<ToolIncludeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<PermissionsConfig>,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, transport: Transport) -> Self {
        Self {
            name: name.into(),
            transport,
            tool_include: None,
            permissions: None,
        }
    }

    /// Effective approval requirement for one tool on this server:
    /// explicit per-tool entry wins, then the server default, then
    /// `Required` (the conservative fallback the approval policy mandates).
    pub fn permission_for(&self, tool: &str) -> Permission {
        match &self.permissions {
            Some(p) => p
                .tool_permissions
                .get(tool)
                .map(|o| o.permission)
                .unwrap_or(p.default_permission),
            None => Permission::Required,
        }
    }

    /// Effective inclusion mode for one tool on this server.
    pub fn include_mode_for(&self, tool: &str) -> IncludeMode {
        match &self.tool_include {
            Some(t) => t
                .tools
                .get(tool)
                .copied()
                .unwrap_or(t.server_default),
            None => IncludeMode::Always,
        }
    }

    /// Record an inclusion-mode override for one tool.
    pub fn set_tool_include_mode(&mut self, tool: &str, mode: IncludeMode) {
        self.tool_include
            .get_or_insert_with(ToolIncludeConfig::default)
            .tools
            .insert(tool.to_string(), mode);
    }

    /// Set the server-wide default inclusion mode.
    pub fn set_server_include_mode(&mut self, mode: IncludeMode) {
        self.tool_include
            .get_or_insert_with(ToolIncludeConfig::default)
            .server_default = mode;
    }
}

/// Transport variant of a tool server, tagged by `type` on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    /// Child process speaking MCP over stdio.
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    /// Long-lived SSE endpoint.
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    /// In-process built-in tool group.
    Internal { tool: InternalTool },
}

/// Which built-in tool group an `internal` server exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InternalTool {
    Rules,
    References,
    Tools,
}

/// When a rule, reference or tool enters a session's scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncludeMode {
    /// Seeded into every new session
    Always,
    /// Added only by an explicit user/front-end action
    Manual,
    /// The model may pull it in through the tool-inclusion tools
    Agent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolIncludeConfig {
    #[serde(default = "default_always")]
    pub server_default: IncludeMode,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tools: BTreeMap<String, IncludeMode>,
}

impl Default for IncludeMode {
    fn default() -> Self {
        IncludeMode::Always
    }
}

/// Whether a tool call needs user approval before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Permission {
    Required,
    NotRequired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsConfig {
    #[serde(default = "default_required")]
    pub default_permission: Permission,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_permissions: BTreeMap<String, ToolPermissionOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPermissionOverride {
    pub permission: Permission,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
