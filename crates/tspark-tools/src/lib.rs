// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod bridge;
mod builtin;
mod client;
mod internal;
mod manager;
mod process;
mod stream;

pub use builtin::{FragmentTools, ToolInclusionTools};
pub use client::{
    SessionToolScope, ToolCallResult, ToolContentPart, ToolDescriptor, ToolServerClient,
};
pub use internal::{BuiltinGroup, InternalClient};
pub use manager::McpManager;
pub use process::StdioClient;
pub use stream::StreamClient;

use std::sync::{Arc, Weak};

use tspark_config::{ConfigStore, FragmentStore, InternalTool, ServerConfig, Transport};

/// Everything a client variant may need at construction time.
pub struct ClientDeps {
    /// Recorded `systemPath` workspace setting, injected as `PATH` for
    /// stdio servers whose configured environment lacks one.
    pub system_path: Option<String>,
    pub rules: Arc<FragmentStore>,
    pub references: Arc<FragmentStore>,
    pub config: Arc<ConfigStore>,
    /// Weak backref: the manager owns the clients, not the reverse.
    pub manager: Weak<McpManager>,
}

/// Construct the client for a tool-server config.
///
/// Selects the transport implementation based on the config's `type`.
pub fn build_client(cfg: &ServerConfig, deps: &ClientDeps) -> Arc<dyn ToolServerClient> {
    match &cfg.transport {
        Transport::Stdio { command, args, env } => Arc::new(StdioClient::new(
            cfg.name.clone(),
            command.clone(),
            args.clone(),
            env.clone(),
            deps.system_path.clone(),
        )),
        Transport::Sse { url, headers } => Arc::new(StreamClient::new(
            cfg.name.clone(),
            url.clone(),
            headers.clone(),
        )),
        Transport::Internal { tool } => {
            let group = match tool {
                InternalTool::Rules => {
                    BuiltinGroup::Fragments(FragmentTools::new(deps.rules.clone()))
                }
                InternalTool::References => {
                    BuiltinGroup::Fragments(FragmentTools::new(deps.references.clone()))
                }
                InternalTool::Tools => BuiltinGroup::Inclusion(ToolInclusionTools::new(
                    deps.config.clone(),
                    deps.manager.clone(),
                )),
            };
            Arc::new(InternalClient::new(cfg.name.clone(), group))
        }
    }
}
