// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! tspark: a provider-agnostic conversational agent runtime.
//!
//! The crate mediates between a user-facing chat surface and two kinds of
//! external collaborators: pluggable LLM providers and MCP tool servers.
//! It owns per-session conversation state, assembles the model-facing
//! context from the workspace's rules, references and tools, drives the
//! multi-turn tool loop with per-call approval policy, and exposes a
//! uniform agent API for any front-end.
//!
//! Front-ends depend on this root crate; the member crates are
//! implementation layers:
//!
//! - [`tspark_config`] – the workspace document, settings, rules/references
//! - [`tspark_model`] – conversation model, provider adapters, reply loop
//! - [`tspark_tools`] – tool-server clients and the tool-server manager
//! - [`tspark_core`] – the session turn engine and the [`Agent`] façade

pub use tspark_config::{
    ConfigError, EventBus, Fragment, FragmentKind, IncludeMode, Permission, ServerConfig,
    SessionSettings, ToolPermission, Transport, WorkspaceEvent,
};
pub use tspark_core::{Agent, AgentError, Session, SessionInput, SessionOptions, SessionSnapshot};
pub use tspark_model::{
    ApprovalDecision, ChatMessage, ExecutedCall, MessageUpdate, Model, ModelReply, PendingCall,
    ProviderAdapter, ProviderDescriptor, ToolCallApproval, Turn, TurnResult,
};
pub use tspark_tools::{McpManager, ToolCallResult, ToolDescriptor, ToolServerClient};
