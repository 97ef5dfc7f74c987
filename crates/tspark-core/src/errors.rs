// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;
use tspark_config::ConfigError;
use tspark_model::AdapterInitError;

/// Errors surfaced synchronously through the agent API.
///
/// Provider faults, timeouts and tool failures during a turn are *not*
/// here: they are recorded inside the [`tspark_model::ModelReply`] so the
/// conversation keeps making progress.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Adapter(#[from] AdapterInitError),

    #[error("unknown provider `{0}`")]
    UnknownProvider(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("session `{0}` already exists")]
    SessionExists(String),

    #[error("unknown session `{0}`")]
    UnknownSession(String),

    #[error("no model is bound to this session; call switch_model first")]
    NoModel,

    #[error("a message is already being handled for this session")]
    Reentrancy,

    #[error("approval mismatch: {0}")]
    ApprovalProtocol(String),

    #[error("session is shutting down")]
    Cancelled,
}
