// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use serde_json::{json, Value};
use tspark_config::{Fragment, FragmentStore, IncludeMode};

use super::{args_object, optional_bool, optional_str, required_str, DispatchResult};
use crate::ToolDescriptor;

/// Rule/reference CRUD exposed as tools the model can drive.
///
/// One instance wraps one [`FragmentStore`], so an `internal` server with
/// `tool = "rules"` manages rules and one with `tool = "references"`
/// manages references; the tool names follow the kind
/// (`createRule` ... / `createReference` ...).
pub struct FragmentTools {
    store: Arc<FragmentStore>,
}

impl FragmentTools {
    pub fn new(store: Arc<FragmentStore>) -> Self {
        Self { store }
    }

    /// Kind label used in tool names: "Rule" or "Reference".
    fn kind(&self) -> &'static str {
        self.store.kind().label()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let kind = self.kind();
        let lower = kind.to_lowercase();
        let name_schema = json!({"type": "string", "description": "Unique name ([A-Za-z0-9_-]+)"});
        vec![
            ToolDescriptor {
                name: format!("create{kind}"),
                description: format!("Create a new {lower}"),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "name": name_schema,
                        "description": {"type": "string"},
                        "text": {"type": "string", "description": "Body text"},
                        "priorityLevel": {"type": "integer", "minimum": 0, "maximum": 999},
                        "enabled": {"type": "boolean"},
                        "include": {"type": "string", "enum": ["always", "manual", "agent"]},
                    },
                    "required": ["name", "text"],
                }),
            },
            ToolDescriptor {
                name: format!("get{kind}"),
                description: format!("Fetch one {lower} including its text"),
                input_schema: json!({
                    "type": "object",
                    "properties": {"name": name_schema},
                    "required": ["name"],
                }),
            },
            ToolDescriptor {
                name: format!("update{kind}"),
                description: format!("Update fields of an existing {lower}"),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "name": name_schema,
                        "description": {"type": "string"},
                        "text": {"type": "string"},
                        "priorityLevel": {"type": "integer", "minimum": 0, "maximum": 999},
                        "enabled": {"type": "boolean"},
                        "include": {"type": "string", "enum": ["always", "manual", "agent"]},
                    },
                    "required": ["name"],
                }),
            },
            ToolDescriptor {
                name: format!("delete{kind}"),
                description: format!("Delete one {lower}"),
                input_schema: json!({
                    "type": "object",
                    "properties": {"name": name_schema},
                    "required": ["name"],
                }),
            },
            ToolDescriptor {
                name: format!("list{kind}s"),
                description: format!("List all {lower}s (without body text)"),
                input_schema: json!({"type": "object", "properties": {}}),
            },
        ]
    }

    pub fn dispatch(&self, tool_name: &str, args: &Value) -> DispatchResult {
        let kind = self.kind();
        let op = tool_name
            .strip_suffix(kind)
            .or_else(|| tool_name.strip_suffix(&format!("{kind}s")));
        match (op, tool_name) {
            (Some("create"), _) => self.create(args),
            (Some("get"), _) => self.get(args),
            (Some("update"), _) => self.update(args),
            (Some("delete"), _) => self.delete(args),
            (Some("list"), _) => self.list(),
            _ => Err(format!("Unknown tool `{tool_name}`")),
        }
    }

    fn create(&self, args: &Value) -> DispatchResult {
        let map = args_object(args)?;
        let name = match required_str(map, "name") {
            Ok(n) => n,
            Err(e) => return Ok(e),
        };
        let text = match required_str(map, "text") {
            Ok(t) => t,
            Err(e) => return Ok(e),
        };
        let mut fragment = Fragment::new(name, text);
        match apply_optional_fields(&mut fragment, map) {
            Ok(()) => {}
            Err(e) => return Ok(e),
        }
        match self.store.create(&fragment) {
            Ok(()) => Ok(json!({"name": fragment.name, "created": true}).to_string()),
            Err(e) => Ok(format!("Error: {e}")),
        }
    }

    fn get(&self, args: &Value) -> DispatchResult {
        let map = args_object(args)?;
        let name = match required_str(map, "name") {
            Ok(n) => n,
            Err(e) => return Ok(e),
        };
        match self.store.get(name) {
            Ok(f) => Ok(fragment_json(&f, true).to_string()),
            Err(e) => Ok(format!("Error: {e}")),
        }
    }

    fn update(&self, args: &Value) -> DispatchResult {
        let map = args_object(args)?;
        let name = match required_str(map, "name") {
            Ok(n) => n,
            Err(e) => return Ok(e),
        };
        let mut fragment = match self.store.get(name) {
            Ok(f) => f,
            Err(e) => return Ok(format!("Error: {e}")),
        };
        if let Err(e) = apply_optional_fields(&mut fragment, map) {
            return Ok(e);
        }
        match optional_str(map, "text") {
            Ok(Some(text)) => fragment.text = text.to_string(),
            Ok(None) => {}
            Err(e) => return Ok(e),
        }
        match self.store.update(&fragment) {
            Ok(()) => Ok(json!({"name": fragment.name, "updated": true}).to_string()),
            Err(e) => Ok(format!("Error: {e}")),
        }
    }

    fn delete(&self, args: &Value) -> DispatchResult {
        let map = args_object(args)?;
        let name = match required_str(map, "name") {
            Ok(n) => n,
            Err(e) => return Ok(e),
        };
        match self.store.delete(name) {
            Ok(()) => Ok(json!({"name": name, "deleted": true}).to_string()),
            Err(e) => Ok(format!("Error: {e}")),
        }
    }

    fn list(&self) -> DispatchResult {
        let items: Vec<Value> = self
            .store
            .list()
            .iter()
            .map(|f| fragment_json(f, false))
            .collect();
        Ok(Value::Array(items).to_string())
    }
}

/// Apply description/priorityLevel/enabled/include from the argument map.
/// `text` is handled by the callers because create and update differ on it.
fn apply_optional_fields(
    fragment: &mut Fragment,
    map: &serde_json::Map<String, Value>,
) -> Result<(), String> {
    if let Some(description) = optional_str(map, "description")? {
        fragment.description = description.to_string();
    }
    match map.get("priorityLevel") {
        None => {}
        Some(v) => match v.as_u64() {
            Some(n) if n <= 999 => fragment.priority_level = n as u16,
            _ => {
                return Err(
                    "Error: argument `priorityLevel` must be an integer between 0 and 999"
                        .to_string(),
                )
            }
        },
    }
    if let Some(enabled) = optional_bool(map, "enabled")? {
        fragment.enabled = enabled;
    }
    if let Some(include) = optional_str(map, "include")? {
        fragment.include = match include {
            "always" => IncludeMode::Always,
            "manual" => IncludeMode::Manual,
            "agent" => IncludeMode::Agent,
            _ => {
                return Err(
                    "Error: argument `include` must be one of always, manual, agent".to_string(),
                )
            }
        };
    }
    Ok(())
}

fn fragment_json(fragment: &Fragment, with_text: bool) -> Value {
    let mut v = json!({
        "name": fragment.name,
        "description": fragment.description,
        "priorityLevel": fragment.priority_level,
        "enabled": fragment.enabled,
        "include": fragment.include,
    });
    if with_text {
        v["text"] = json!(fragment.text);
    }
    v
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
