// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ConfigError;

/// Well-known setting keys as they appear in `tspark.json` and in the
/// session-options API.
pub mod keys {
    pub const MAX_CHAT_TURNS: &str = "maxChatTurns";
    pub const MAX_OUTPUT_TOKENS: &str = "maxOutputTokens";
    pub const TEMPERATURE: &str = "temperature";
    pub const TOP_P: &str = "topP";
    pub const TOOL_PERMISSION: &str = "toolPermission";
    pub const CONTEXT_TOP_K: &str = "contextTopK";
    pub const CONTEXT_TOP_N: &str = "contextTopN";
    pub const CONTEXT_INCLUDE_SCORE: &str = "contextIncludeScore";
    pub const MOST_RECENT_MODEL: &str = "mostRecentModel";
    pub const SYSTEM_PATH: &str = "systemPath";
}

/// Global approval policy for tool calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPermission {
    /// Every tool call needs approval
    Always,
    /// No tool call needs approval
    Never,
    /// Defer to the tool server's per-tool permission config
    Tool,
}

impl Default for ToolPermission {
    fn default() -> Self {
        ToolPermission::Tool
    }
}

/// Bounded, validated settings carried by every chat session.
///
/// `contextTopK` / `contextTopN` / `contextIncludeScore` are validated and
/// surfaced to adapters but no adapter in this repo consumes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    pub max_chat_turns: u32,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub tool_permission: ToolPermission,
    pub context_top_k: u32,
    pub context_top_n: u32,
    pub context_include_score: f32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_chat_turns: 20,
            max_output_tokens: 4096,
            temperature: 0.2,
            top_p: 1.0,
            tool_permission: ToolPermission::Tool,
            context_top_k: 10,
            context_top_n: 5,
            context_include_score: 0.5,
        }
    }
}

impl SessionSettings {
    /// Build settings from a raw settings map, starting from the defaults.
    /// Invalid or out-of-bounds values are skipped with a warning so a
    /// hand-edited workspace document degrades instead of failing.
    pub fn from_map(map: &serde_json::Map<String, Value>) -> Self {
        let mut s = Self::default();
        for (key, value) in map {
            if let Err(e) = s.apply(key, value) {
                tracing::warn!(%key, %e, "ignoring invalid workspace setting");
            }
        }
        s
    }

    /// Apply one keyed value. Returns `Ok(true)` when the key is a session
    /// setting, `Ok(false)` when it is not (unknown keys are the workspace
    /// map's business, not an error here).
    pub fn apply(&mut self, key: &str, value: &Value) -> Result<bool, ConfigError> {
        match key {
            keys::MAX_CHAT_TURNS => self.max_chat_turns = int_in(key, value, 1, 500)?,
            keys::MAX_OUTPUT_TOKENS => self.max_output_tokens = int_in(key, value, 1, 100_000)?,
            keys::TEMPERATURE => self.temperature = float_in(key, value, 0.0, 1.0)?,
            keys::TOP_P => self.top_p = float_in(key, value, 0.0, 1.0)?,
            keys::TOOL_PERMISSION => self.tool_permission = permission(key, value)?,
            keys::CONTEXT_TOP_K => self.context_top_k = int_in(key, value, 1, 100)?,
            keys::CONTEXT_TOP_N => self.context_top_n = int_in(key, value, 1, 50)?,
            keys::CONTEXT_INCLUDE_SCORE => {
                self.context_include_score = float_in(key, value, 0.0, 1.0)?
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Validate a value for a well-known setting key without applying it.
/// Keys outside the bounded set (e.g. `mostRecentModel`, `systemPath`,
/// front-end extras) accept any value.
pub fn validate_setting(key: &str, value: &Value) -> Result<(), ConfigError> {
    SessionSettings::default().apply(key, value).map(|_| ())
}

/// The settings map a freshly initialized workspace starts with.
pub fn default_settings_map() -> serde_json::Map<String, Value> {
    let defaults = SessionSettings::default();
    match serde_json::to_value(&defaults) {
        Ok(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    }
}

fn int_in(key: &str, value: &Value, lo: u64, hi: u64) -> Result<u32, ConfigError> {
    let n = value.as_u64().ok_or_else(|| ConfigError::InvalidSetting {
        key: key.to_string(),
        reason: format!("expected an integer, got {value}"),
    })?;
    if n < lo || n > hi {
        return Err(ConfigError::InvalidSetting {
            key: key.to_string(),
            reason: format!("{n} is outside [{lo}, {hi}]"),
        });
    }
    Ok(n as u32)
}

fn float_in(key: &str, value: &Value, lo: f64, hi: f64) -> Result<f32, ConfigError> {
    let n = value.as_f64().ok_or_else(|| ConfigError::InvalidSetting {
        key: key.to_string(),
        reason: format!("expected a number, got {value}"),
    })?;
    if !(lo..=hi).contains(&n) {
        return Err(ConfigError::InvalidSetting {
            key: key.to_string(),
            reason: format!("{n} is outside [{lo}, {hi}]"),
        });
    }
    Ok(n as f32)
}

fn permission(key: &str, value: &Value) -> Result<ToolPermission, ConfigError> {
    serde_json::from_value(value.clone()).map_err(|_| ConfigError::InvalidSetting {
        key: key.to_string(),
        reason: format!("expected \"always\", \"never\" or \"tool\", got {value}"),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_within_their_own_bounds() {
        let mut s = SessionSettings::default();
        let v = serde_json::to_value(&s).unwrap();
        for (key, value) in v.as_object().unwrap() {
            assert!(s.apply(key, value).unwrap(), "{key} should be recognized");
        }
    }

    #[test]
    fn max_chat_turns_bounds() {
        let mut s = SessionSettings::default();
        assert!(s.apply(keys::MAX_CHAT_TURNS, &json!(1)).is_ok());
        assert!(s.apply(keys::MAX_CHAT_TURNS, &json!(500)).is_ok());
        assert!(s.apply(keys::MAX_CHAT_TURNS, &json!(0)).is_err());
        assert!(s.apply(keys::MAX_CHAT_TURNS, &json!(501)).is_err());
        assert!(s.apply(keys::MAX_CHAT_TURNS, &json!("many")).is_err());
    }

    #[test]
    fn temperature_rejects_out_of_range() {
        let mut s = SessionSettings::default();
        assert!(s.apply(keys::TEMPERATURE, &json!(0.0)).is_ok());
        assert!(s.apply(keys::TEMPERATURE, &json!(1.0)).is_ok());
        assert!(s.apply(keys::TEMPERATURE, &json!(1.5)).is_err());
        assert!(s.apply(keys::TEMPERATURE, &json!(-0.1)).is_err());
    }

    #[test]
    fn tool_permission_parses_enum_values() {
        let mut s = SessionSettings::default();
        s.apply(keys::TOOL_PERMISSION, &json!("always")).unwrap();
        assert_eq!(s.tool_permission, ToolPermission::Always);
        s.apply(keys::TOOL_PERMISSION, &json!("never")).unwrap();
        assert_eq!(s.tool_permission, ToolPermission::Never);
        assert!(s.apply(keys::TOOL_PERMISSION, &json!("maybe")).is_err());
    }

    #[test]
    fn unknown_key_is_not_an_error() {
        let mut s = SessionSettings::default();
        assert!(!s.apply("mostRecentModel", &json!("openai:gpt-4o")).unwrap());
    }

    #[test]
    fn from_map_skips_invalid_values() {
        let mut map = serde_json::Map::new();
        map.insert(keys::MAX_CHAT_TURNS.into(), json!(3));
        map.insert(keys::TEMPERATURE.into(), json!(99.0)); // out of bounds
        let s = SessionSettings::from_map(&map);
        assert_eq!(s.max_chat_turns, 3);
        assert_eq!(s.temperature, SessionSettings::default().temperature);
    }

    #[test]
    fn default_settings_map_round_trips() {
        let map = default_settings_map();
        let s = SessionSettings::from_map(&map);
        assert_eq!(s, SessionSettings::default());
    }

    #[test]
    fn validate_setting_accepts_free_form_keys() {
        assert!(validate_setting(keys::SYSTEM_PATH, &json!("/usr/bin:/bin")).is_ok());
        assert!(validate_setting(keys::MAX_OUTPUT_TOKENS, &json!(200_000)).is_err());
    }
}
