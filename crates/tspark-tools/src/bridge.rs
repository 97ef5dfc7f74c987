// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Type conversions between rmcp's MCP model types and the tspark tool
//! types. Pure, stateless functions: the transports stay free of wire-type
//! details and the rest of the crate never sees rmcp.

use rmcp::model::{CallToolResult, RawContent, Tool as McpTool};
use serde_json::Value;

use crate::{ToolCallResult, ToolContentPart, ToolDescriptor};

/// Convert an rmcp [`McpTool`] into a [`ToolDescriptor`].
pub(crate) fn tool_to_descriptor(tool: &McpTool) -> ToolDescriptor {
    ToolDescriptor {
        name: tool.name.to_string(),
        description: tool
            .description
            .as_deref()
            .unwrap_or_default()
            .to_string(),
        input_schema: Value::Object((*tool.input_schema).clone()),
    }
}

/// Convert an rmcp [`CallToolResult`] into a [`ToolCallResult`].
///
/// Text content becomes [`ToolContentPart::Text`]; everything else is
/// preserved as an opaque value. A server-side `is_error` surfaces as the
/// result error with the text content as the message.
pub(crate) fn call_result(result: CallToolResult, elapsed_ms: u64) -> ToolCallResult {
    let content: Vec<ToolContentPart> = result
        .content
        .iter()
        .map(|item| match &item.raw {
            RawContent::Text(text) => ToolContentPart::Text {
                text: text.text.clone(),
            },
            other => ToolContentPart::Other(
                serde_json::to_value(other).unwrap_or(Value::Null),
            ),
        })
        .collect();

    let mut out = ToolCallResult::ok(content, elapsed_ms);
    if result.is_error.unwrap_or(false) {
        let message = out.text_content();
        out.error = Some(if message.is_empty() {
            "tool reported an error".to_string()
        } else {
            message
        });
    }
    out
}
