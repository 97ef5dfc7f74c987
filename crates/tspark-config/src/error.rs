// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the configuration layer.
///
/// These are API errors: callers can match on them. Faults that must
/// degrade instead of fail (a corrupt `tspark.json`, a malformed fragment
/// in a directory listing) are logged and absorbed, not returned.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("`{0}` is not a tspark workspace (no tspark.json; open with create to initialize)")]
    NotAWorkspace(PathBuf),

    #[error("invalid name `{0}`: only letters, digits, `_` and `-` are allowed")]
    InvalidName(String),

    #[error("`{0}` already exists")]
    DuplicateName(String),

    #[error("`{0}` does not exist")]
    NotFound(String),

    #[error("invalid value for setting `{key}`: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("malformed file `{path}`: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
