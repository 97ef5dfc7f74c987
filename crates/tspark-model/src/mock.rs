// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use serde_json::Value;
use tspark_config::SessionSettings;

use crate::driver::{self, ProviderWire, WireToolUse, WireTurn};
use crate::{ActiveTool, ChatMessage, ModelReply, ProviderAdapter, SessionContext};

/// One scripted provider response.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    pub text: String,
    /// (call id, mangled tool name, args)
    pub tool_uses: Vec<(String, String, Value)>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub truncated: bool,
    /// Sleep before answering; combine with `tokio::time::pause` to test
    /// the watchdog without waiting.
    pub delay: Option<Duration>,
    /// Fail the provider call with this message instead of answering.
    pub fail: Option<String>,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            input_tokens: 10,
            output_tokens: 10,
            ..Self::default()
        }
    }

    pub fn tool_use(id: impl Into<String>, wire_name: impl Into<String>, args: Value) -> Self {
        Self {
            tool_uses: vec![(id.into(), wire_name.into(), args)],
            input_tokens: 10,
            output_tokens: 10,
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_tool_use(
        mut self,
        id: impl Into<String>,
        wire_name: impl Into<String>,
        args: Value,
    ) -> Self {
        self.tool_uses.push((id.into(), wire_name.into(), args));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail: Some(message.into()),
            ..Self::default()
        }
    }
}

struct ScriptedState {
    scripts: Mutex<VecDeque<ScriptedTurn>>,
    calls: AtomicU32,
    last_context: Mutex<Vec<ChatMessage>>,
    last_tools: Mutex<Vec<String>>,
}

/// A pre-scripted adapter. Each provider call pops the next [`ScriptedTurn`];
/// an exhausted script answers with an empty text turn so the reply loop
/// terminates.
///
/// Runs through the same reply-loop driver as the real adapters, so engine
/// tests exercise approval handling, pending cutover, the turn cap and the
/// watchdog — everything except a provider's wire format.
#[derive(Clone)]
pub struct ScriptedAdapter {
    inner: Arc<ScriptedState>,
}

impl ScriptedAdapter {
    pub fn new(scripts: Vec<ScriptedTurn>) -> Self {
        Self {
            inner: Arc::new(ScriptedState {
                scripts: Mutex::new(scripts.into()),
                calls: AtomicU32::new(0),
                last_context: Mutex::new(Vec::new()),
                last_tools: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Always answer with the same text, for smoke tests.
    pub fn always_text(text: impl Into<String>) -> Self {
        // An empty queue answers with empty text; seed one real reply.
        Self::new(vec![ScriptedTurn::text(text)])
    }

    /// Number of provider calls made so far across all invocations.
    pub fn calls(&self) -> u32 {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// The message list the engine assembled for the most recent invocation.
    pub fn last_context(&self) -> Vec<ChatMessage> {
        self.inner.last_context.lock().unwrap().clone()
    }

    /// Mangled names of the tools offered on the most recent provider call.
    pub fn last_tools(&self) -> Vec<String> {
        self.inner.last_tools.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider_id(&self) -> &str {
        "mock"
    }
    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn generate_response(
        &self,
        session: &mut dyn SessionContext,
        messages: &[ChatMessage],
    ) -> ModelReply {
        *self.inner.last_context.lock().unwrap() = messages.to_vec();
        let mut wire = ScriptedWire {
            state: self.inner.clone(),
        };
        driver::run_reply_loop(&mut wire, session, messages).await
    }
}

struct ScriptedWire {
    state: Arc<ScriptedState>,
}

#[async_trait]
impl ProviderWire for ScriptedWire {
    fn provider_id(&self) -> &str {
        "mock"
    }

    fn push_tool_result(&mut self, _tool_use_id: &str, _content: &str, _is_error: bool) {}

    async fn request(
        &mut self,
        tools: &[ActiveTool],
        _settings: &SessionSettings,
    ) -> anyhow::Result<WireTurn> {
        let script = self
            .state
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        *self.state.last_tools.lock().unwrap() =
            tools.iter().map(|t| t.wire_name()).collect();
        if let Some(message) = script.fail {
            bail!("{message}");
        }
        Ok(WireTurn {
            text: script.text,
            tool_uses: script
                .tool_uses
                .into_iter()
                .map(|(id, name, args)| WireToolUse { id, name, args })
                .collect(),
            input_tokens: script.input_tokens,
            output_tokens: script.output_tokens,
            truncated: script.truncated,
        })
    }
}

/// Deterministic echo adapter registered under the `mock` provider id:
/// answers every invocation with `MOCK: <last user text>`.
pub struct EchoAdapter {
    model: String,
}

impl EchoAdapter {
    pub fn new(model: String) -> Self {
        Self { model }
    }
}

#[async_trait]
impl ProviderAdapter for EchoAdapter {
    fn provider_id(&self) -> &str {
        "mock"
    }
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate_response(
        &self,
        session: &mut dyn SessionContext,
        messages: &[ChatMessage],
    ) -> ModelReply {
        let echoed = messages
            .iter()
            .rev()
            .find_map(|m| match m {
                ChatMessage::User { content } => Some(content.as_str()),
                _ => None,
            })
            .unwrap_or("[no input]");
        let adapter = ScriptedAdapter::always_text(format!("MOCK: {echoed}"));
        adapter.generate_response(session, messages).await
    }
}

// ─── Reply-loop tests ─────────────────────────────────────────────────────────
//
// The scripted adapter runs through the shared driver, so these tests pin
// the loop semantics every real adapter inherits.

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{ApprovalDecision, ToolCallApproval, ToolDispatch, TurnResult};

    struct StubCtx {
        settings: SessionSettings,
        tools: Vec<ActiveTool>,
        approvals: HashSet<(String, String)>,
        /// When set, every non-approved call requires approval.
        require_approval: bool,
        dispatched: Vec<(String, String)>,
        cancel: CancellationToken,
    }

    impl StubCtx {
        fn new(tools: Vec<ActiveTool>) -> Self {
            Self {
                settings: SessionSettings::default(),
                tools,
                approvals: HashSet::new(),
                require_approval: false,
                dispatched: Vec::new(),
                cancel: CancellationToken::new(),
            }
        }
    }

    #[async_trait]
    impl SessionContext for StubCtx {
        fn settings(&self) -> &SessionSettings {
            &self.settings
        }
        fn active_tools(&self) -> &[ActiveTool] {
            &self.tools
        }
        fn is_approval_required(&self, server: &str, tool: &str) -> bool {
            self.require_approval
                && !self
                    .approvals
                    .contains(&(server.to_string(), tool.to_string()))
        }
        fn mark_approved(&mut self, server: &str, tool: &str) {
            self.approvals.insert((server.to_string(), tool.to_string()));
        }
        async fn dispatch_tool(
            &mut self,
            server: &str,
            tool: &str,
            _args: &serde_json::Value,
        ) -> ToolDispatch {
            self.dispatched.push((server.to_string(), tool.to_string()));
            ToolDispatch {
                output: Some("OK".to_string()),
                error: None,
                elapsed_ms: 1,
            }
        }
        fn cancellation(&self) -> CancellationToken {
            self.cancel.clone()
        }
    }

    fn fs_read() -> ActiveTool {
        ActiveTool {
            server_name: "fs".into(),
            tool_name: "read".into(),
            description: "read a file".into(),
            parameters: json!({"type": "object"}),
        }
    }

    fn executed_calls(reply: &ModelReply) -> Vec<&crate::ExecutedCall> {
        reply
            .turns
            .iter()
            .flat_map(|t| &t.results)
            .filter_map(|r| match r {
                TurnResult::ToolCall { tool_call } => Some(tool_call),
                _ => None,
            })
            .collect()
    }

    // ── Plain turns ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn text_only_reply_is_one_turn() {
        let adapter = ScriptedAdapter::always_text("hi");
        let mut ctx = StubCtx::new(vec![]);
        let reply = adapter
            .generate_response(&mut ctx, &[ChatMessage::user("hello")])
            .await;
        assert_eq!(reply.turns.len(), 1);
        assert_eq!(reply.text(), "hi");
        assert!(!reply.has_pending());
        assert_eq!(adapter.calls(), 1);
    }

    #[tokio::test]
    async fn tool_use_dispatches_then_follows_up() {
        let adapter = ScriptedAdapter::new(vec![
            ScriptedTurn::tool_use("c1", "fs_read", json!({"path": "/a"})),
            ScriptedTurn::text("done"),
        ]);
        let mut ctx = StubCtx::new(vec![fs_read()]);
        let reply = adapter
            .generate_response(&mut ctx, &[ChatMessage::user("read /a")])
            .await;

        assert_eq!(reply.turns.len(), 2);
        let calls = executed_calls(&reply);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].output.as_deref(), Some("OK"));
        assert_eq!(ctx.dispatched, vec![("fs".to_string(), "read".to_string())]);
        assert_eq!(reply.turns[1].results, vec![TurnResult::Text { text: "done".into() }]);
    }

    #[tokio::test]
    async fn unknown_tool_records_error_and_continues() {
        let adapter = ScriptedAdapter::new(vec![
            ScriptedTurn::tool_use("c1", "net_fetch", json!({})),
            ScriptedTurn::text("sorry"),
        ]);
        let mut ctx = StubCtx::new(vec![fs_read()]);
        let reply = adapter
            .generate_response(&mut ctx, &[ChatMessage::user("go")])
            .await;
        let calls = executed_calls(&reply);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].error.as_deref().unwrap().contains("Unknown tool"));
        assert!(ctx.dispatched.is_empty());
        assert_eq!(reply.turns.len(), 2, "model gets a chance to recover");
    }

    // ── Approvals ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn approval_required_yields_pending_and_stops() {
        let adapter = ScriptedAdapter::new(vec![ScriptedTurn::tool_use(
            "c1",
            "fs_read",
            json!({"path": "/a"}),
        )]);
        let mut ctx = StubCtx::new(vec![fs_read()]);
        ctx.require_approval = true;
        let reply = adapter
            .generate_response(&mut ctx, &[ChatMessage::user("read /a")])
            .await;

        assert_eq!(reply.pending_tool_calls.len(), 1);
        assert_eq!(reply.pending_tool_calls[0].tool_call_id, "c1");
        assert_eq!(adapter.calls(), 1, "loop must stop on pending calls");
        assert!(ctx.dispatched.is_empty());
    }

    #[tokio::test]
    async fn later_tool_uses_in_same_response_go_pending_too() {
        let script = ScriptedTurn::tool_use("c1", "fs_read", json!({"path": "/a"}))
            .with_tool_use("c2", "fs_read", json!({"path": "/b"}));
        let adapter = ScriptedAdapter::new(vec![script]);
        let mut ctx = StubCtx::new(vec![fs_read()]);
        ctx.require_approval = true;
        let reply = adapter
            .generate_response(&mut ctx, &[ChatMessage::user("read both")])
            .await;
        assert_eq!(reply.pending_tool_calls.len(), 2);
    }

    #[tokio::test]
    async fn approval_message_allow_once_executes_and_resumes() {
        let adapter = ScriptedAdapter::new(vec![ScriptedTurn::text("thanks")]);
        let mut ctx = StubCtx::new(vec![fs_read()]);
        ctx.require_approval = true;
        let approval = ChatMessage::approval(vec![ToolCallApproval {
            server_name: "fs".into(),
            tool_name: "read".into(),
            tool_call_id: "c1".into(),
            args: json!({"path": "/a"}),
            decision: ApprovalDecision::AllowOnce,
        }]);
        let reply = adapter.generate_response(&mut ctx, &[approval]).await;

        // Turn 0: the resolved approval (no provider call, zero tokens).
        // Turn 1: the follow-up text.
        assert_eq!(reply.turns.len(), 2);
        assert_eq!(reply.turns[0].input_tokens, 0);
        let calls = executed_calls(&reply);
        assert_eq!(calls[0].output.as_deref(), Some("OK"));
        assert_eq!(ctx.dispatched.len(), 1);
        // allow-once must NOT whitelist the pair for the session
        assert!(ctx.approvals.is_empty());
    }

    #[tokio::test]
    async fn approval_allow_session_marks_approved() {
        let adapter = ScriptedAdapter::new(vec![ScriptedTurn::text("ok")]);
        let mut ctx = StubCtx::new(vec![fs_read()]);
        ctx.require_approval = true;
        let approval = ChatMessage::approval(vec![ToolCallApproval {
            server_name: "fs".into(),
            tool_name: "read".into(),
            tool_call_id: "c1".into(),
            args: json!({}),
            decision: ApprovalDecision::AllowSession,
        }]);
        adapter.generate_response(&mut ctx, &[approval]).await;
        assert!(ctx.approvals.contains(&("fs".to_string(), "read".to_string())));
    }

    #[tokio::test]
    async fn approval_deny_records_synthetic_call() {
        let adapter = ScriptedAdapter::new(vec![ScriptedTurn::text("understood")]);
        let mut ctx = StubCtx::new(vec![fs_read()]);
        let approval = ChatMessage::approval(vec![ToolCallApproval {
            server_name: "fs".into(),
            tool_name: "read".into(),
            tool_call_id: "c1".into(),
            args: json!({}),
            decision: ApprovalDecision::Deny,
        }]);
        let reply = adapter.generate_response(&mut ctx, &[approval]).await;
        let calls = executed_calls(&reply);
        assert_eq!(calls[0].output.as_deref(), Some("Tool call denied"));
        assert_eq!(calls[0].error.as_deref(), Some("Tool call denied"));
        assert!(ctx.dispatched.is_empty(), "denied calls never dispatch");
        // The model is still re-invoked for a follow-up turn.
        assert_eq!(adapter.calls(), 1);
    }

    // ── Termination ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn turn_cap_appends_terminal_error() {
        let looping = || ScriptedTurn::tool_use("c", "fs_read", json!({"path": "/a"}));
        let adapter = ScriptedAdapter::new(vec![looping(), looping(), looping()]);
        let mut ctx = StubCtx::new(vec![fs_read()]);
        ctx.settings.max_chat_turns = 2;
        let reply = adapter
            .generate_response(&mut ctx, &[ChatMessage::user("loop")])
            .await;

        assert_eq!(adapter.calls(), 2, "never more than maxChatTurns provider calls");
        let last = reply.turns.last().unwrap();
        assert_eq!(last.error.as_deref(), Some("Maximum number of tool uses reached"));
    }

    #[tokio::test]
    async fn provider_failure_becomes_terminal_turn() {
        let adapter = ScriptedAdapter::new(vec![ScriptedTurn::failing("rate limited")]);
        let mut ctx = StubCtx::new(vec![]);
        let reply = adapter
            .generate_response(&mut ctx, &[ChatMessage::user("hi")])
            .await;
        assert_eq!(reply.turns.len(), 1);
        let err = reply.turns[0].error.as_deref().unwrap();
        assert_eq!(
            err,
            "Error: Failed to generate response from mock - rate limited"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_times_out_slow_provider() {
        let adapter = ScriptedAdapter::new(vec![
            ScriptedTurn::text("too late").with_delay(Duration::from_secs(120)),
        ]);
        let mut ctx = StubCtx::new(vec![]);
        let reply = adapter
            .generate_response(&mut ctx, &[ChatMessage::user("hi")])
            .await;
        assert_eq!(reply.turns.len(), 1);
        assert_eq!(reply.turns[0].error.as_deref(), Some("Request timed out"));
    }

    #[tokio::test]
    async fn cancellation_returns_partial_reply() {
        let adapter = ScriptedAdapter::always_text("never sent");
        let mut ctx = StubCtx::new(vec![]);
        ctx.cancel.cancel();
        let reply = adapter
            .generate_response(&mut ctx, &[ChatMessage::user("hi")])
            .await;
        assert!(reply.turns.is_empty());
        assert_eq!(adapter.calls(), 0);
    }

    #[tokio::test]
    async fn truncation_sets_turn_error_but_keeps_text() {
        let mut script = ScriptedTurn::text("partial answer");
        script.truncated = true;
        let adapter = ScriptedAdapter::new(vec![script]);
        let mut ctx = StubCtx::new(vec![]);
        let reply = adapter
            .generate_response(&mut ctx, &[ChatMessage::user("hi")])
            .await;
        assert_eq!(reply.text(), "partial answer");
        assert!(reply.turns[0].error.as_deref().unwrap().contains("maximum output tokens"));
    }

    #[tokio::test]
    async fn token_usage_recorded_per_turn() {
        let mut script = ScriptedTurn::text("hi");
        script.input_tokens = 42;
        script.output_tokens = 7;
        let adapter = ScriptedAdapter::new(vec![script]);
        let mut ctx = StubCtx::new(vec![]);
        let reply = adapter
            .generate_response(&mut ctx, &[ChatMessage::user("hello")])
            .await;
        assert_eq!(reply.turns[0].input_tokens, 42);
        assert_eq!(reply.turns[0].output_tokens, 7);
    }
}
