// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tspark_config::SessionSettings;

use crate::{ActiveTool, ChatMessage, ModelReply, ToolDispatch};

/// The engine-side view an adapter gets of the session it is serving.
///
/// Adapters never own a session; they borrow this handle for the duration
/// of one `generate_response` call. It exposes exactly what the reply loop
/// needs: settings, the active toolset, the approval policy, and tool
/// dispatch through the workspace's tool-server manager.
#[async_trait]
pub trait SessionContext: Send {
    fn settings(&self) -> &SessionSettings;

    /// Snapshot of the tools in the session's scope for this turn cycle.
    fn active_tools(&self) -> &[ActiveTool];

    /// Whether a call to `(server, tool)` must be approved by the user
    /// before it runs.
    fn is_approval_required(&self, server_name: &str, tool_name: &str) -> bool;

    /// Record a session-lifetime approval for `(server, tool)`.
    fn mark_approved(&mut self, server_name: &str, tool_name: &str);

    /// Dispatch one tool call. Transport and tool errors come back inside
    /// the [`ToolDispatch`], never as a panic or early return, so the loop
    /// can record them and keep going.
    async fn dispatch_tool(
        &mut self,
        server_name: &str,
        tool_name: &str,
        args: &Value,
    ) -> ToolDispatch;

    /// Token fired when the session is being torn down mid-flight.
    fn cancellation(&self) -> CancellationToken;
}

/// A provider adapter: translates the internal message list into the
/// provider's wire shape, drives the bounded tool loop, and returns a
/// normalized [`ModelReply`].
///
/// `generate_response` is infallible by contract: provider faults,
/// timeouts and tool errors are recorded *inside* the reply (as turn or
/// call errors) so the conversation keeps making progress.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> &str;
    fn model_id(&self) -> &str;

    /// `messages` is the in-order context the engine assembled: system
    /// prompt first, history, rules/references as user messages, and the
    /// latest user or approval message last.
    async fn generate_response(
        &self,
        session: &mut dyn SessionContext,
        messages: &[ChatMessage],
    ) -> ModelReply;
}

// ─── Provider metadata ────────────────────────────────────────────────────────

/// One credential/config value a provider accepts at install time.
#[derive(Debug, Clone, Copy)]
pub struct ConfigField {
    /// Key in the workspace's provider credential map (e.g. `"apiKey"`).
    pub key: &'static str,
    /// Human-readable caption for install UIs.
    pub caption: &'static str,
    pub required: bool,
    /// Secret values must never be echoed back by front-ends.
    pub secret: bool,
    pub default: Option<&'static str>,
}

/// How a provider's model list is obtained.
#[derive(Debug, Clone, Copy)]
pub enum ModelListing {
    /// A fixed list of well-known model ids.
    Static(&'static [&'static str]),
    /// A live listing call against the provider's API.
    Dynamic,
}

/// Static metadata describing one supported provider.
#[derive(Debug, Clone, Copy)]
pub struct ProviderDescriptor {
    /// Unique provider id used in config and session options (e.g. `"anthropic"`).
    pub id: &'static str,
    /// Human-readable display name.
    pub name: &'static str,
    /// One-line description for provider pickers.
    pub description: &'static str,
    /// Provider home page.
    pub url: &'static str,
    pub config_fields: &'static [ConfigField],
    pub models: ModelListing,
}

impl ProviderDescriptor {
    /// Keys of credentials that must be present at install time.
    pub fn required_keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.config_fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.key)
    }
}
