// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use tspark_config::SessionSettings;

use crate::driver::{self, HistoryItem, ProviderWire, WireToolUse, WireTurn};
use crate::{ActiveTool, ChatMessage, ModelReply, ProviderAdapter, SessionContext};

/// Adapter for the OpenAI Chat Completions API.
pub struct OpenAiAdapter {
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new(model: String, api_key: String, base_url: Option<String>) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".into()),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider_id(&self) -> &str {
        "openai"
    }
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate_response(
        &self,
        session: &mut dyn SessionContext,
        messages: &[ChatMessage],
    ) -> ModelReply {
        let mut wire = OpenAiWire::new(self, driver::flatten_history(messages));
        driver::run_reply_loop(&mut wire, session, messages).await
    }
}

/// Chat Completions does not require role alternation, so history items map
/// one-to-one onto wire messages; tool results are `role: "tool"` messages
/// correlated by `tool_call_id`.
struct OpenAiWire<'a> {
    adapter: &'a OpenAiAdapter,
    history: Vec<Value>,
}

impl<'a> OpenAiWire<'a> {
    fn new(adapter: &'a OpenAiAdapter, items: Vec<HistoryItem>) -> Self {
        let mut history = Vec::new();
        for item in items {
            match item {
                HistoryItem::System(text) => {
                    history.push(json!({"role": "system", "content": text}))
                }
                HistoryItem::User(text) => history.push(json!({"role": "user", "content": text})),
                HistoryItem::Assistant { text, tool_uses } => {
                    history.push(assistant_message(&text, &tool_uses))
                }
                HistoryItem::ToolResult { id, content, .. } => history.push(json!({
                    "role": "tool",
                    "tool_call_id": id,
                    "content": content,
                })),
            }
        }
        Self { adapter, history }
    }
}

fn assistant_message(text: &str, tool_uses: &[WireToolUse]) -> Value {
    let mut msg = json!({
        "role": "assistant",
        "content": if text.is_empty() { Value::Null } else { json!(text) },
    });
    if !tool_uses.is_empty() {
        msg["tool_calls"] = Value::Array(
            tool_uses
                .iter()
                .map(|u| {
                    json!({
                        "id": u.id,
                        "type": "function",
                        "function": {
                            "name": u.name,
                            // Chat Completions carries arguments as a JSON string
                            "arguments": u.args.to_string(),
                        },
                    })
                })
                .collect(),
        );
    }
    msg
}

#[async_trait]
impl ProviderWire for OpenAiWire<'_> {
    fn provider_id(&self) -> &str {
        "openai"
    }

    fn push_tool_result(&mut self, tool_use_id: &str, content: &str, _is_error: bool) {
        // The API has no error flag on tool messages; the text carries it.
        self.history.push(json!({
            "role": "tool",
            "tool_call_id": tool_use_id,
            "content": content,
        }));
    }

    async fn request(
        &mut self,
        tools: &[ActiveTool],
        settings: &SessionSettings,
    ) -> anyhow::Result<WireTurn> {
        let mut body = json!({
            "model": self.adapter.model,
            "messages": self.history,
            "max_tokens": settings.max_output_tokens,
            "temperature": settings.temperature,
            "top_p": settings.top_p,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.wire_name(),
                                "description": t.description,
                                "parameters": t.parameters,
                            },
                        })
                    })
                    .collect(),
            );
        }

        debug!(model = %self.adapter.model, messages = self.history.len(), "openai request");
        let resp = self
            .adapter
            .client
            .post(format!("{}/chat/completions", self.adapter.base_url))
            .bearer_auth(&self.adapter.api_key)
            .json(&body)
            .send()
            .await
            .context("openai request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("HTTP {status}: {text}");
        }
        let v: Value = resp.json().await.context("invalid openai response")?;
        let turn = parse_response(&v);

        if let Some(message) = v["choices"][0].get("message") {
            self.history.push(message.clone());
        }
        Ok(turn)
    }
}

/// Normalize one Chat Completions response body.
fn parse_response(v: &Value) -> WireTurn {
    let mut turn = WireTurn::default();
    let choice = &v["choices"][0];
    if let Some(text) = choice["message"]["content"].as_str() {
        turn.text = text.to_string();
    }
    if let Some(calls) = choice["message"]["tool_calls"].as_array() {
        for call in calls {
            let raw_args = call["function"]["arguments"].as_str().unwrap_or("{}");
            // A model can emit malformed JSON arguments; preserve the raw
            // string so the tool still sees something.
            let args = serde_json::from_str(raw_args)
                .unwrap_or_else(|_| Value::String(raw_args.to_string()));
            turn.tool_uses.push(WireToolUse {
                id: call["id"].as_str().unwrap_or_default().to_string(),
                name: call["function"]["name"].as_str().unwrap_or_default().to_string(),
                args,
            });
        }
    }
    turn.input_tokens = v["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
    turn.output_tokens = v["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;
    turn.truncated = choice["finish_reason"].as_str() == Some("length");
    turn
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
