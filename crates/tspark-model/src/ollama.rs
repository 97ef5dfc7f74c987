// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use anyhow::{bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use tspark_config::SessionSettings;
use uuid::Uuid;

use crate::driver::{self, HistoryItem, ProviderWire, WireToolUse, WireTurn};
use crate::{
    ActiveTool, ChatMessage, Model, ModelReply, ModelSource, ProviderAdapter, SessionContext,
};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Adapter for a local Ollama server (`/api/chat`).
pub struct OllamaAdapter {
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OllamaAdapter {
    pub fn new(model: String, base_url: Option<String>) -> Self {
        Self {
            model,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            client: reqwest::Client::new(),
        }
    }
}

/// Live model listing via `GET /api/tags`.
pub async fn list_models(base_url: Option<String>) -> anyhow::Result<Vec<Model>> {
    let base = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.into());
    let v: Value = reqwest::get(format!("{base}/api/tags"))
        .await
        .context("ollama is not reachable")?
        .json()
        .await
        .context("invalid ollama tags response")?;
    let mut models = Vec::new();
    if let Some(list) = v["models"].as_array() {
        for entry in list {
            if let Some(name) = entry["name"].as_str() {
                models.push(Model {
                    provider_id: "ollama".to_string(),
                    id: name.to_string(),
                    name: name.to_string(),
                    source: ModelSource::Dynamic,
                    description: None,
                });
            }
        }
    }
    models.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(models)
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn provider_id(&self) -> &str {
        "ollama"
    }
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate_response(
        &self,
        session: &mut dyn SessionContext,
        messages: &[ChatMessage],
    ) -> ModelReply {
        let mut wire = OllamaWire::new(self, driver::flatten_history(messages));
        driver::run_reply_loop(&mut wire, session, messages).await
    }
}

/// Ollama's chat shape is OpenAI-like but carries tool arguments as objects
/// and assigns no tool-call ids, so the wire mints its own for correlation.
struct OllamaWire<'a> {
    adapter: &'a OllamaAdapter,
    history: Vec<Value>,
}

impl<'a> OllamaWire<'a> {
    fn new(adapter: &'a OllamaAdapter, items: Vec<HistoryItem>) -> Self {
        let mut history = Vec::new();
        for item in items {
            match item {
                HistoryItem::System(text) => {
                    history.push(json!({"role": "system", "content": text}))
                }
                HistoryItem::User(text) => history.push(json!({"role": "user", "content": text})),
                HistoryItem::Assistant { text, tool_uses } => {
                    let mut msg = json!({"role": "assistant", "content": text});
                    if !tool_uses.is_empty() {
                        msg["tool_calls"] = Value::Array(
                            tool_uses
                                .iter()
                                .map(|u| {
                                    json!({"function": {"name": u.name, "arguments": u.args}})
                                })
                                .collect(),
                        );
                    }
                    history.push(msg);
                }
                HistoryItem::ToolResult { content, .. } => {
                    history.push(json!({"role": "tool", "content": content}))
                }
            }
        }
        Self { adapter, history }
    }
}

#[async_trait]
impl ProviderWire for OllamaWire<'_> {
    fn provider_id(&self) -> &str {
        "ollama"
    }

    fn push_tool_result(&mut self, _tool_use_id: &str, content: &str, _is_error: bool) {
        // Correlation is positional: a tool message answers the preceding
        // assistant tool call.
        self.history.push(json!({"role": "tool", "content": content}));
    }

    async fn request(
        &mut self,
        tools: &[ActiveTool],
        settings: &SessionSettings,
    ) -> anyhow::Result<WireTurn> {
        let mut body = json!({
            "model": self.adapter.model,
            "messages": self.history,
            "stream": false,
            "options": {
                "temperature": settings.temperature,
                "top_p": settings.top_p,
                "num_predict": settings.max_output_tokens,
            },
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

        debug!(model = %self.adapter.model, messages = self.history.len(), "ollama request");
        let resp = self
            .adapter
            .client
            .post(format!("{}/api/chat", self.adapter.base_url))
            .json(&body)
            .send()
            .await
            .context("ollama request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("HTTP {status}: {text}");
        }
        let v: Value = resp.json().await.context("invalid ollama response")?;
        let turn = parse_response(&v);

        if let Some(message) = v.get("message") {
            self.history.push(message.clone());
        }
        Ok(turn)
    }
}

/// Normalize one `/api/chat` response body.
fn parse_response(v: &Value) -> WireTurn {
    let mut turn = WireTurn::default();
    let message = &v["message"];
    if let Some(text) = message["content"].as_str() {
        turn.text = text.to_string();
    }
    if let Some(calls) = message["tool_calls"].as_array() {
        for call in calls {
            turn.tool_uses.push(WireToolUse {
                // Ollama assigns no ids; mint one so the reply loop can
                // correlate results the same way as every other provider.
                id: format!("ollama-{}", Uuid::new_v4()),
                name: call["function"]["name"].as_str().unwrap_or_default().to_string(),
                args: call["function"]["arguments"].clone(),
            });
        }
    }
    turn.input_tokens = v["prompt_eval_count"].as_u64().unwrap_or(0) as u32;
    turn.output_tokens = v["eval_count"].as_u64().unwrap_or(0) as u32;
    turn.truncated = v["done_reason"].as_str() == Some("length");
    turn
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_text_and_token_counts() {
        let turn = parse_response(&json!({
            "message": {"role": "assistant", "content": "hello"},
            "prompt_eval_count": 7,
            "eval_count": 3,
            "done_reason": "stop"
        }));
        assert_eq!(turn.text, "hello");
        assert_eq!(turn.input_tokens, 7);
        assert_eq!(turn.output_tokens, 3);
        assert!(!turn.truncated);
    }

    #[test]
    fn parse_tool_calls_mints_unique_ids() {
        let v = json!({
            "message": {"role": "assistant", "content": "",
                "tool_calls": [
                    {"function": {"name": "fs_read", "arguments": {"path": "/a"}}},
                    {"function": {"name": "fs_read", "arguments": {"path": "/b"}}}
                ]},
        });
        let turn = parse_response(&v);
        assert_eq!(turn.tool_uses.len(), 2);
        assert_ne!(turn.tool_uses[0].id, turn.tool_uses[1].id);
        assert_eq!(turn.tool_uses[0].args["path"], "/a");
    }

    #[test]
    fn parse_length_done_reason_marks_truncated() {
        let turn = parse_response(&json!({
            "message": {"role": "assistant", "content": "cut"},
            "done_reason": "length"
        }));
        assert!(turn.truncated);
    }

    #[test]
    fn history_keeps_tool_arguments_as_objects() {
        let adapter = OllamaAdapter::new("llama3.2".into(), None);
        let wire = OllamaWire::new(
            &adapter,
            vec![HistoryItem::Assistant {
                text: String::new(),
                tool_uses: vec![WireToolUse {
                    id: "x".into(),
                    name: "fs_read".into(),
                    args: json!({"path": "/a"}),
                }],
            }],
        );
        let call = &wire.history[0]["tool_calls"][0];
        assert!(call["function"]["arguments"].is_object());
    }
}
