// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use tspark_config::SessionSettings;

use crate::driver::{self, HistoryItem, ProviderWire, WireToolUse, WireTurn};
use crate::{ActiveTool, ChatMessage, ModelReply, ProviderAdapter, SessionContext};

/// Adapter for the Anthropic Messages API.
pub struct AnthropicAdapter {
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(model: String, api_key: String, base_url: Option<String>) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".into()),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider_id(&self) -> &str {
        "anthropic"
    }
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate_response(
        &self,
        session: &mut dyn SessionContext,
        messages: &[ChatMessage],
    ) -> ModelReply {
        let mut wire = AnthropicWire::new(self, driver::flatten_history(messages));
        driver::run_reply_loop(&mut wire, session, messages).await
    }
}

/// Native history for one `generate_response` call.
///
/// The Messages API enforces strict user/assistant alternation, so
/// consecutive same-role messages are coalesced into one message with
/// multiple content blocks. Tool results ride in user messages.
struct AnthropicWire<'a> {
    adapter: &'a AnthropicAdapter,
    system: String,
    history: Vec<Value>,
}

impl<'a> AnthropicWire<'a> {
    fn new(adapter: &'a AnthropicAdapter, items: Vec<HistoryItem>) -> Self {
        let mut wire = Self {
            adapter,
            system: String::new(),
            history: Vec::new(),
        };
        for item in items {
            match item {
                HistoryItem::System(text) => {
                    if !wire.system.is_empty() {
                        wire.system.push_str("\n\n");
                    }
                    wire.system.push_str(&text);
                }
                HistoryItem::User(text) => {
                    wire.push_blocks("user", vec![json!({"type": "text", "text": text})])
                }
                HistoryItem::Assistant { text, tool_uses } => {
                    let mut blocks = Vec::new();
                    if !text.is_empty() {
                        blocks.push(json!({"type": "text", "text": text}));
                    }
                    for tool_use in tool_uses {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": tool_use.id,
                            "name": tool_use.name,
                            "input": tool_use.args,
                        }));
                    }
                    if !blocks.is_empty() {
                        wire.push_blocks("assistant", blocks);
                    }
                }
                HistoryItem::ToolResult {
                    id,
                    content,
                    is_error,
                } => wire.push_tool_result(&id, &content, is_error),
            }
        }
        wire
    }

    /// Append content blocks, merging into the previous message when the
    /// role matches (the API rejects consecutive same-role messages).
    fn push_blocks(&mut self, role: &str, blocks: Vec<Value>) {
        if let Some(last) = self.history.last_mut() {
            if last["role"] == role {
                if let Some(content) = last["content"].as_array_mut() {
                    content.extend(blocks);
                    return;
                }
            }
        }
        self.history.push(json!({"role": role, "content": blocks}));
    }
}

#[async_trait]
impl ProviderWire for AnthropicWire<'_> {
    fn provider_id(&self) -> &str {
        "anthropic"
    }

    fn push_tool_result(&mut self, tool_use_id: &str, content: &str, is_error: bool) {
        let mut block = json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
        });
        if is_error {
            block["is_error"] = json!(true);
        }
        self.push_blocks("user", vec![block]);
    }

    async fn request(
        &mut self,
        tools: &[ActiveTool],
        settings: &SessionSettings,
    ) -> anyhow::Result<WireTurn> {
        let mut body = json!({
            "model": self.adapter.model,
            "max_tokens": settings.max_output_tokens,
            "temperature": settings.temperature,
            "top_p": settings.top_p,
            "messages": self.history,
        });
        if !self.system.is_empty() {
            body["system"] = json!(self.system);
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.wire_name(),
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
        }

        debug!(model = %self.adapter.model, messages = self.history.len(), "anthropic request");
        let resp = self
            .adapter
            .client
            .post(format!("{}/v1/messages", self.adapter.base_url))
            .header("x-api-key", &self.adapter.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("anthropic request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("HTTP {status}: {text}");
        }
        let v: Value = resp.json().await.context("invalid anthropic response")?;
        let turn = parse_response(&v);

        // The model's own message joins the history for the next iteration.
        if let Some(content) = v.get("content") {
            self.history
                .push(json!({"role": "assistant", "content": content}));
        }
        Ok(turn)
    }
}

/// Normalize one Messages API response body.
fn parse_response(v: &Value) -> WireTurn {
    let mut turn = WireTurn::default();
    if let Some(blocks) = v["content"].as_array() {
        for block in blocks {
            match block["type"].as_str().unwrap_or("") {
                "text" => {
                    if let Some(t) = block["text"].as_str() {
                        if !turn.text.is_empty() {
                            turn.text.push('\n');
                        }
                        turn.text.push_str(t);
                    }
                }
                "tool_use" => turn.tool_uses.push(WireToolUse {
                    id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    args: block["input"].clone(),
                }),
                _ => {}
            }
        }
    }
    turn.input_tokens = v["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
    turn.output_tokens = v["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;
    turn.truncated = v["stop_reason"].as_str() == Some("max_tokens");
    turn
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
