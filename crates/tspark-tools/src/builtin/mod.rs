// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Built-in tool groups served by the in-process transport.

mod fragments;
mod inclusion;

pub use fragments::FragmentTools;
pub use inclusion::ToolInclusionTools;

/// Shared result type for built-in dispatch.
///
/// `Ok` carries the deterministic JSON (or an `"Error: ..."` text for
/// argument and store problems the model should see and recover from);
/// `Err` carries hard failures (unknown tool, missing session) that surface
/// as call errors.
pub(crate) type DispatchResult = Result<String, String>;

pub(crate) fn args_object(
    args: &serde_json::Value,
) -> Result<&serde_json::Map<String, serde_json::Value>, String> {
    args.as_object()
        .ok_or_else(|| "Error: arguments must be an object".to_string())
}

pub(crate) fn required_str<'a>(
    map: &'a serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<&'a str, String> {
    map.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("Error: missing or invalid argument `{key}`"))
}

pub(crate) fn optional_str<'a>(
    map: &'a serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<Option<&'a str>, String> {
    match map.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_str()
            .map(Some)
            .ok_or_else(|| format!("Error: argument `{key}` must be a string")),
    }
}

pub(crate) fn optional_bool(
    map: &serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Result<Option<bool>, String> {
    match map.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| format!("Error: argument `{key}` must be a boolean")),
    }
}
