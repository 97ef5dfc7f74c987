// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod error;
mod events;
mod fragments;
mod schema;
mod settings;
mod store;

pub use error::ConfigError;
pub use events::{EventBus, WorkspaceEvent};
pub use fragments::{is_valid_name, Fragment, FragmentKind, FragmentStore};
pub use schema::{
    IncludeMode, InternalTool, Metadata, Permission, PermissionsConfig, ServerConfig,
    ToolIncludeConfig, Transport, WorkspaceDoc,
};
pub use settings::{default_settings_map, keys, validate_setting, SessionSettings, ToolPermission};
pub use store::{ConfigStore, WORKSPACE_FILE};
