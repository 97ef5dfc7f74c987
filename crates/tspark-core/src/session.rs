// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tspark_config::{keys, IncludeMode, SessionSettings, ToolPermission};
use tspark_model::{
    ActiveTool, ChatMessage, MessageUpdate, ProviderAdapter, SessionContext, ToolDispatch,
};
use tspark_tools::SessionToolScope;

use crate::agent::Workspace;
use crate::AgentError;

/// Input accepted by [`Session::handle_message`]: plain user text or an
/// already-shaped message (an approval, typically).
pub enum SessionInput {
    Text(String),
    Message(ChatMessage),
}

impl From<&str> for SessionInput {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for SessionInput {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<ChatMessage> for SessionInput {
    fn from(message: ChatMessage) -> Self {
        Self::Message(message)
    }
}

/// Per-session options; unset fields fall back to workspace settings.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub model_provider: Option<String>,
    pub model_id: Option<String>,
    pub max_chat_turns: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub tool_permission: Option<ToolPermission>,
    pub context_top_k: Option<u32>,
    pub context_top_n: Option<u32>,
    pub context_include_score: Option<f32>,
}

impl SessionOptions {
    /// Fold the set fields into `settings`, re-using the workspace bounds.
    fn apply_to(&self, settings: &mut SessionSettings) -> Result<(), AgentError> {
        let numbered: [(&str, Option<Value>); 7] = [
            (keys::MAX_CHAT_TURNS, self.max_chat_turns.map(|v| json!(v))),
            (keys::MAX_OUTPUT_TOKENS, self.max_output_tokens.map(|v| json!(v))),
            (keys::TEMPERATURE, self.temperature.map(|v| json!(v))),
            (keys::TOP_P, self.top_p.map(|v| json!(v))),
            (keys::CONTEXT_TOP_K, self.context_top_k.map(|v| json!(v))),
            (keys::CONTEXT_TOP_N, self.context_top_n.map(|v| json!(v))),
            (
                keys::CONTEXT_INCLUDE_SCORE,
                self.context_include_score.map(|v| json!(v)),
            ),
        ];
        for (key, value) in numbered {
            if let Some(value) = value {
                settings.apply(key, &value).map_err(AgentError::Config)?;
            }
        }
        if let Some(permission) = self.tool_permission {
            settings.tool_permission = permission;
        }
        Ok(())
    }
}

/// Ordered scope of a session: which rules, references and tools are active
/// at context-build time. Shared with tool dispatch so the built-in
/// tool-inclusion tools can mutate the toolset mid-turn.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScopeState {
    pub rules: Vec<String>,
    pub references: Vec<String>,
    pub tools: Vec<(String, String)>,
}

struct SessionState {
    messages: Vec<ChatMessage>,
    last_sync_id: u64,
    provider_id: Option<String>,
    model_id: Option<String>,
    adapter: Option<Box<dyn ProviderAdapter>>,
    settings: SessionSettings,
    /// Session-lifetime approvals; grows only.
    approvals: HashSet<(String, String)>,
}

/// Front-end-facing snapshot of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub messages: Vec<ChatMessage>,
    pub last_sync_id: u64,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub settings: SessionSettings,
    pub rules_in_scope: Vec<String>,
    pub references_in_scope: Vec<String>,
    pub tools_in_scope: Vec<(String, String)>,
    pub session_approvals: Vec<(String, String)>,
}

/// One chat session: append-only message history plus the scope and
/// approval state the turn engine consults.
///
/// A session is single-threaded with respect to its own turns: a second
/// `handle_message` while one is in flight is [`AgentError::Reentrancy`]
/// (front-ends queue). Distinct sessions run concurrently and share the
/// workspace's tool-server clients.
pub struct Session {
    id: String,
    workspace: Arc<Workspace>,
    state: tokio::sync::Mutex<SessionState>,
    scope: Arc<StdMutex<ScopeState>>,
    cancel: CancellationToken,
}

impl Session {
    pub(crate) async fn create(
        workspace: Arc<Workspace>,
        id: String,
        options: SessionOptions,
    ) -> Result<Self, AgentError> {
        let mut settings = workspace.config.session_defaults();
        options.apply_to(&mut settings)?;

        // Seed scope with everything marked include=always.
        let mut scope = ScopeState::default();
        for rule in workspace.rules.list() {
            if rule.enabled && rule.include == IncludeMode::Always {
                scope.rules.push(rule.name);
            }
        }
        for reference in workspace.references.list() {
            if reference.enabled && reference.include == IncludeMode::Always {
                scope.references.push(reference.name);
            }
        }
        for (server, tool) in workspace.manager.get_all_tools().await {
            let mode = workspace
                .config
                .get_tool_server(&server)
                .map(|cfg| cfg.include_mode_for(&tool.name))
                .unwrap_or(IncludeMode::Manual);
            if mode == IncludeMode::Always {
                scope.tools.push((server, tool.name));
            }
        }

        // Bind a model: explicit options first, then the workspace's
        // most-recent-model setting.
        let explicit = options.model_provider.is_some() || options.model_id.is_some();
        let (mut provider_id, mut model_id) = match (&options.model_provider, &options.model_id) {
            (Some(provider), Some(model)) => (Some(provider.clone()), Some(model.clone())),
            (None, None) => most_recent_model(&workspace),
            _ => (options.model_provider.clone(), options.model_id.clone()),
        };
        let adapter = match (provider_id.clone(), model_id.clone()) {
            (Some(provider), Some(model)) => {
                let credentials = workspace
                    .config
                    .provider_credentials(&provider)
                    .unwrap_or_default();
                match tspark_model::create_adapter(&provider, &model, &credentials) {
                    Ok(adapter) => Some(adapter),
                    // An explicitly requested model must bind; a stale
                    // most-recent-model fallback degrades to an unbound
                    // session instead.
                    Err(e) if explicit => return Err(e.into()),
                    Err(e) => {
                        warn!(%provider, error = %e, "most recent model no longer binds");
                        provider_id = None;
                        model_id = None;
                        None
                    }
                }
            }
            _ => None,
        };

        Ok(Self {
            id,
            workspace,
            state: tokio::sync::Mutex::new(SessionState {
                messages: Vec::new(),
                last_sync_id: 0,
                provider_id,
                model_id,
                adapter,
                settings,
                approvals: HashSet::new(),
            }),
            scope: Arc::new(StdMutex::new(scope)),
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn scope_handle(&self) -> ScopeHandle {
        ScopeHandle {
            state: self.scope.clone(),
            manager: self.workspace.manager.clone(),
        }
    }

    // ─── The turn engine ──────────────────────────────────────────────────────

    /// Drive one user submission (or approval resolution) through the
    /// bound adapter and append the outcome to the session history.
    pub async fn handle_message(
        &self,
        input: impl Into<SessionInput>,
    ) -> Result<MessageUpdate, AgentError> {
        let mut state = self
            .state
            .try_lock()
            .map_err(|_| AgentError::Reentrancy)?;
        if state.adapter.is_none() {
            return Err(AgentError::NoModel);
        }

        let mut input_message = match input.into() {
            SessionInput::Text(text) => ChatMessage::user(text),
            SessionInput::Message(message) => message,
        };
        self.enforce_approval_protocol(&state, &input_message)?;

        // RESOLVE_REFS: pull @ref:/@rule: tokens into scope.
        if let ChatMessage::User { content } = &input_message {
            let stripped = self.resolve_scope_tokens(content);
            input_message = ChatMessage::user(stripped);
        }

        let context = self.build_context(&state, &input_message);
        let active_tools = self.resolve_active_tools().await;

        let adapter = state.adapter.take().expect("checked above");
        let state_ref = &mut *state;
        let mut ctx = TurnContext {
            settings: state_ref.settings.clone(),
            active_tools,
            approvals: &mut state_ref.approvals,
            workspace: &self.workspace,
            scope: self.scope_handle(),
            cancel: self.cancel.clone(),
        };
        let reply = adapter.generate_response(&mut ctx, &context).await;
        state.adapter = Some(adapter);

        if self.cancel.is_cancelled() {
            // Session is being deleted; abandon the turn without mutating
            // the history.
            return Err(AgentError::Cancelled);
        }

        let assistant = ChatMessage::assistant(reply);
        state.messages.push(input_message.clone());
        state.last_sync_id += 1;
        state.messages.push(assistant.clone());
        state.last_sync_id += 1;

        Ok(self.update_with(&state, vec![input_message, assistant]))
    }

    /// Reject inputs that violate the pending-approval protocol.
    fn enforce_approval_protocol(
        &self,
        state: &SessionState,
        input: &ChatMessage,
    ) -> Result<(), AgentError> {
        let pending: HashSet<String> = match state.messages.last() {
            Some(ChatMessage::Assistant { reply }) => reply
                .pending_tool_calls
                .iter()
                .map(|p| p.tool_call_id.clone())
                .collect(),
            _ => HashSet::new(),
        };
        match input {
            ChatMessage::Approval { decisions } => {
                if pending.is_empty() {
                    return Err(AgentError::ApprovalProtocol(
                        "no tool calls are awaiting approval".to_string(),
                    ));
                }
                let answered: HashSet<String> =
                    decisions.iter().map(|d| d.tool_call_id.clone()).collect();
                if answered != pending {
                    return Err(AgentError::ApprovalProtocol(format!(
                        "approval decisions do not cover the pending set (expected {} calls, got {})",
                        pending.len(),
                        answered.len()
                    )));
                }
            }
            _ if !pending.is_empty() => {
                return Err(AgentError::ApprovalProtocol(
                    "pending tool calls must be approved or denied first".to_string(),
                ));
            }
            _ => {}
        }
        Ok(())
    }

    /// Scan user text for `@ref:<name>` / `@rule:<name>` tokens, pull the
    /// referents into scope, and return the text with tokens stripped.
    fn resolve_scope_tokens(&self, text: &str) -> String {
        let token = Regex::new(r"@(ref|rule):([A-Za-z0-9_-]+)").unwrap();
        for capture in token.captures_iter(text) {
            let name = capture[2].to_string();
            let mut scope = self.scope.lock().unwrap();
            match &capture[1] {
                "ref" => {
                    if self.workspace.references.exists(&name) {
                        if !scope.references.contains(&name) {
                            scope.references.push(name);
                        }
                    } else {
                        warn!(%name, "referenced @ref does not exist");
                    }
                }
                _ => {
                    if self.workspace.rules.exists(&name) {
                        if !scope.rules.contains(&name) {
                            scope.rules.push(name);
                        }
                    } else {
                        warn!(%name, "referenced @rule does not exist");
                    }
                }
            }
        }
        let stripped = token.replace_all(text, "");
        let collapsed = Regex::new(r"[ \t]{2,}").unwrap().replace_all(&stripped, " ");
        collapsed.trim().to_string()
    }

    /// BUILD_CONTEXT: system prompt, history, references, rules, then the
    /// new input. Scope names that no longer resolve are dropped with a
    /// warning (the entity may have been deleted since it was added).
    fn build_context(&self, state: &SessionState, input: &ChatMessage) -> Vec<ChatMessage> {
        let mut context = Vec::with_capacity(state.messages.len() + 4);
        context.push(ChatMessage::system(self.workspace.config.get_system_prompt()));
        context.extend(
            state
                .messages
                .iter()
                .filter(|m| !m.is_system())
                .cloned(),
        );

        let scope = self.scope.lock().unwrap().clone();
        for name in &scope.references {
            match self.workspace.references.get(name) {
                Ok(reference) if reference.enabled => {
                    context.push(ChatMessage::user(format!("Reference: {}", reference.text)))
                }
                Ok(_) => debug!(%name, "reference in scope is disabled"),
                Err(e) => warn!(%name, error = %e, "dropping unresolvable reference from context"),
            }
        }
        for name in &scope.rules {
            match self.workspace.rules.get(name) {
                Ok(rule) if rule.enabled => {
                    context.push(ChatMessage::user(format!("Rule: {}", rule.text)))
                }
                Ok(_) => debug!(%name, "rule in scope is disabled"),
                Err(e) => warn!(%name, error = %e, "dropping unresolvable rule from context"),
            }
        }

        context.push(input.clone());
        context
    }

    /// Resolve the scope's `(server, tool)` pairs against the live tool
    /// registry into the adapter-facing toolset.
    async fn resolve_active_tools(&self) -> Vec<ActiveTool> {
        let pairs = self.scope.lock().unwrap().tools.clone();
        let mut active = Vec::with_capacity(pairs.len());
        for (server, tool) in pairs {
            let Some(client) = self.workspace.manager.get_client(&server).await else {
                warn!(%server, %tool, "tool in scope has no registered server");
                continue;
            };
            match client.list_tools().await.into_iter().find(|d| d.name == tool) {
                Some(descriptor) => active.push(ActiveTool {
                    server_name: server,
                    tool_name: descriptor.name,
                    description: descriptor.description,
                    parameters: descriptor.input_schema,
                }),
                None => warn!(%server, %tool, "tool in scope is no longer advertised"),
            }
        }
        active
    }

    fn update_with(&self, state: &SessionState, updates: Vec<ChatMessage>) -> MessageUpdate {
        let scope = self.scope.lock().unwrap();
        MessageUpdate {
            updates,
            last_sync_id: state.last_sync_id,
            references_in_scope: scope.references.clone(),
            rules_in_scope: scope.rules.clone(),
        }
    }

    // ─── Model binding & settings ─────────────────────────────────────────────

    /// Bind the session to `(provider, model)` and record it as the
    /// workspace's most recent model.
    pub async fn switch_model(
        &self,
        provider_id: &str,
        model_id: &str,
    ) -> Result<MessageUpdate, AgentError> {
        let mut state = self
            .state
            .try_lock()
            .map_err(|_| AgentError::Reentrancy)?;
        let credentials = self
            .workspace
            .config
            .provider_credentials(provider_id)
            .unwrap_or_default();
        let adapter = tspark_model::create_adapter(provider_id, model_id, &credentials)?;

        state.adapter = Some(adapter);
        state.provider_id = Some(provider_id.to_string());
        state.model_id = Some(model_id.to_string());
        state
            .messages
            .push(ChatMessage::system(format!("Model changed to {provider_id}:{model_id}")));
        state.last_sync_id += 1;

        self.workspace
            .config
            .set_setting(keys::MOST_RECENT_MODEL, json!(format!("{provider_id}:{model_id}")))?;
        Ok(self.update_with(&state, Vec::new()))
    }

    /// Unbind the model; the next `handle_message` fails with `NoModel`.
    pub async fn clear_model(&self) -> Result<MessageUpdate, AgentError> {
        let mut state = self
            .state
            .try_lock()
            .map_err(|_| AgentError::Reentrancy)?;
        state.adapter = None;
        state.provider_id = None;
        state.model_id = None;
        state.messages.push(ChatMessage::system("Model cleared"));
        state.last_sync_id += 1;
        Ok(self.update_with(&state, Vec::new()))
    }

    /// Plug in a caller-constructed adapter (custom providers, tests).
    pub async fn attach_adapter(&self, adapter: Box<dyn ProviderAdapter>) {
        let mut state = self.state.lock().await;
        state.provider_id = Some(adapter.provider_id().to_string());
        state.model_id = Some(adapter.model_id().to_string());
        state.adapter = Some(adapter);
    }

    /// Apply a partial settings update. All values are validated against
    /// the workspace bounds before any of them is applied.
    pub async fn update_settings(
        &self,
        updates: serde_json::Map<String, Value>,
    ) -> Result<MessageUpdate, AgentError> {
        let mut state = self
            .state
            .try_lock()
            .map_err(|_| AgentError::Reentrancy)?;

        let mut staged = state.settings.clone();
        let mut described = Vec::with_capacity(updates.len());
        for (key, value) in &updates {
            let recognized = staged.apply(key, value).map_err(AgentError::Config)?;
            if !recognized {
                return Err(AgentError::Config(
                    tspark_config::ConfigError::InvalidSetting {
                        key: key.clone(),
                        reason: "not a session setting".to_string(),
                    },
                ));
            }
            described.push(format!("{key}={value}"));
        }
        state.settings = staged;
        state
            .messages
            .push(ChatMessage::system(format!("Settings updated: {}", described.join(", "))));
        state.last_sync_id += 1;
        Ok(self.update_with(&state, Vec::new()))
    }

    // ─── Scope management ─────────────────────────────────────────────────────

    pub async fn add_rule(&self, name: &str) -> Result<(), AgentError> {
        if !self.workspace.rules.exists(name) {
            return Err(AgentError::Config(tspark_config::ConfigError::NotFound(
                name.to_string(),
            )));
        }
        let mut scope = self.scope.lock().unwrap();
        if !scope.rules.iter().any(|n| n == name) {
            scope.rules.push(name.to_string());
        }
        Ok(())
    }

    pub async fn remove_rule(&self, name: &str) {
        self.scope.lock().unwrap().rules.retain(|n| n != name);
    }

    pub async fn add_reference(&self, name: &str) -> Result<(), AgentError> {
        if !self.workspace.references.exists(name) {
            return Err(AgentError::Config(tspark_config::ConfigError::NotFound(
                name.to_string(),
            )));
        }
        let mut scope = self.scope.lock().unwrap();
        if !scope.references.iter().any(|n| n == name) {
            scope.references.push(name.to_string());
        }
        Ok(())
    }

    pub async fn remove_reference(&self, name: &str) {
        self.scope.lock().unwrap().references.retain(|n| n != name);
    }

    pub async fn add_tool(&self, server: &str, tool: &str) -> Result<(), AgentError> {
        self.scope_handle()
            .include_tool(server, tool)
            .await
            .map_err(AgentError::Tool)
    }

    pub async fn remove_tool(&self, server: &str, tool: &str) {
        let _ = self.scope_handle().exclude_tool(server, tool).await;
    }

    pub async fn get_included_tools(&self) -> Vec<(String, String)> {
        self.scope.lock().unwrap().tools.clone()
    }

    /// Full state snapshot for front-end rendering.
    pub async fn get_state(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        let scope = self.scope.lock().unwrap().clone();
        let mut session_approvals: Vec<(String, String)> =
            state.approvals.iter().cloned().collect();
        session_approvals.sort();
        SessionSnapshot {
            id: self.id.clone(),
            messages: state.messages.clone(),
            last_sync_id: state.last_sync_id,
            provider_id: state.provider_id.clone(),
            model_id: state.model_id.clone(),
            settings: state.settings.clone(),
            rules_in_scope: scope.rules,
            references_in_scope: scope.references,
            tools_in_scope: scope.tools,
            session_approvals,
        }
    }
}

/// Parse the workspace's `mostRecentModel` setting (`"pid:modelId"`).
fn most_recent_model(workspace: &Workspace) -> (Option<String>, Option<String>) {
    let Some(value) = workspace.config.get_setting(keys::MOST_RECENT_MODEL) else {
        return (None, None);
    };
    match value.as_str().and_then(|s| s.split_once(':')) {
        Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
            (Some(provider.to_string()), Some(model.to_string()))
        }
        _ => (None, None),
    }
}

// ─── Adapter-facing context ───────────────────────────────────────────────────

/// The borrowed view handed to `ProviderAdapter::generate_response` for the
/// duration of one turn cycle.
struct TurnContext<'a> {
    settings: SessionSettings,
    active_tools: Vec<ActiveTool>,
    approvals: &'a mut HashSet<(String, String)>,
    workspace: &'a Workspace,
    scope: ScopeHandle,
    cancel: CancellationToken,
}

#[async_trait]
impl SessionContext for TurnContext<'_> {
    fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    fn active_tools(&self) -> &[ActiveTool] {
        &self.active_tools
    }

    fn is_approval_required(&self, server_name: &str, tool_name: &str) -> bool {
        if self
            .approvals
            .contains(&(server_name.to_string(), tool_name.to_string()))
        {
            return false;
        }
        match self.settings.tool_permission {
            ToolPermission::Always => true,
            ToolPermission::Never => false,
            ToolPermission::Tool => self
                .workspace
                .config
                .get_tool_server(server_name)
                .map(|cfg| cfg.permission_for(tool_name) == tspark_config::Permission::Required)
                // Unknown server: no determination, require approval.
                .unwrap_or(true),
        }
    }

    fn mark_approved(&mut self, server_name: &str, tool_name: &str) {
        self.approvals
            .insert((server_name.to_string(), tool_name.to_string()));
    }

    async fn dispatch_tool(
        &mut self,
        server_name: &str,
        tool_name: &str,
        args: &Value,
    ) -> ToolDispatch {
        let result = self
            .workspace
            .manager
            .call_on(server_name, tool_name, args.clone(), Some(&self.scope))
            .await;
        let text = result.text_content();
        ToolDispatch {
            output: if text.is_empty() { None } else { Some(text) },
            error: result.error,
            elapsed_ms: result.elapsed_ms,
        }
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

// ─── Session scope handle ─────────────────────────────────────────────────────

/// Cloneable [`SessionToolScope`] implementation over the shared scope
/// state; handed into tool dispatch so the built-in tool-inclusion tools
/// can act on the calling session.
#[derive(Clone)]
pub(crate) struct ScopeHandle {
    state: Arc<StdMutex<ScopeState>>,
    manager: Arc<tspark_tools::McpManager>,
}

#[async_trait]
impl SessionToolScope for ScopeHandle {
    async fn included_tools(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().tools.clone()
    }

    async fn include_tool(&self, server: &str, tool: &str) -> Result<(), String> {
        let Some(client) = self.manager.get_client(server).await else {
            return Err(format!("unknown tool server `{server}`"));
        };
        if !client.list_tools().await.iter().any(|d| d.name == tool) {
            return Err(format!("unknown tool `{tool}` on server `{server}`"));
        }
        let mut scope = self.state.lock().unwrap();
        let pair = (server.to_string(), tool.to_string());
        if !scope.tools.contains(&pair) {
            scope.tools.push(pair);
        }
        Ok(())
    }

    async fn exclude_tool(&self, server: &str, tool: &str) -> Result<(), String> {
        self.state
            .lock()
            .unwrap()
            .tools
            .retain(|(s, t)| s != server || t != tool);
        Ok(())
    }

    async fn include_server(&self, server: &str) -> Result<(), String> {
        let Some(client) = self.manager.get_client(server).await else {
            return Err(format!("unknown tool server `{server}`"));
        };
        let descriptors = client.list_tools().await;
        let mut scope = self.state.lock().unwrap();
        for descriptor in descriptors {
            let pair = (server.to_string(), descriptor.name);
            if !scope.tools.contains(&pair) {
                scope.tools.push(pair);
            }
        }
        Ok(())
    }

    async fn exclude_server(&self, server: &str) -> Result<(), String> {
        self.state
            .lock()
            .unwrap()
            .tools
            .retain(|(s, _)| s != server);
        Ok(())
    }
}
