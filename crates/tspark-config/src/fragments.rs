// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::schema::{default_true, IncludeMode};
use crate::store::atomic_write;
use crate::{ConfigError, EventBus, WorkspaceEvent};

/// File extension for persisted rules and references.
const FRAGMENT_EXT: &str = "mdt";

fn default_priority() -> u16 {
    500
}

fn default_include() -> IncludeMode {
    IncludeMode::Manual
}

/// Names must be usable as file stems and as wire-safe identifiers.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Which kind of text fragment a store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    Rule,
    Reference,
}

impl FragmentKind {
    /// Directory under the workspace root holding this kind.
    pub fn dir_name(self) -> &'static str {
        match self {
            FragmentKind::Rule => "rules",
            FragmentKind::Reference => "references",
        }
    }

    /// Display label, also the prefix used when a fragment is injected
    /// into the model context ("Rule: ..." / "Reference: ...").
    pub fn label(self) -> &'static str {
        match self {
            FragmentKind::Rule => "Rule",
            FragmentKind::Reference => "Reference",
        }
    }

    fn event(self) -> WorkspaceEvent {
        match self {
            FragmentKind::Rule => WorkspaceEvent::RulesChanged,
            FragmentKind::Reference => WorkspaceEvent::ReferencesChanged,
        }
    }
}

/// A named text fragment: a rule or a reference.
///
/// On disk each fragment is `<name>.mdt`: a YAML front-matter block between
/// `---` fences (everything except `text`) followed by the body text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Lower sorts earlier in the context; ties break on name.
    #[serde(default = "default_priority")]
    pub priority_level: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_include")]
    pub include: IncludeMode,
    /// Body text; never serialized into the front matter.
    #[serde(skip)]
    pub text: String,
}

impl Fragment {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            priority_level: default_priority(),
            enabled: true,
            include: default_include(),
            text: text.into(),
        }
    }
}

/// One-file-per-entity store under `rules/` or `references/`.
///
/// The directory is the store; every operation reads or writes the files
/// directly so concurrent stores over the same workspace stay coherent.
pub struct FragmentStore {
    dir: PathBuf,
    kind: FragmentKind,
    events: EventBus,
}

impl FragmentStore {
    pub fn new(workspace_dir: &Path, kind: FragmentKind, events: EventBus) -> Self {
        Self {
            dir: workspace_dir.join(kind.dir_name()),
            kind,
            events,
        }
    }

    pub fn kind(&self) -> FragmentKind {
        self.kind
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{FRAGMENT_EXT}"))
    }

    pub fn exists(&self, name: &str) -> bool {
        is_valid_name(name) && self.path(name).is_file()
    }

    /// Create a new fragment. Fails with [`ConfigError::DuplicateName`] if
    /// one with the same name already exists.
    pub fn create(&self, fragment: &Fragment) -> Result<(), ConfigError> {
        if !is_valid_name(&fragment.name) {
            return Err(ConfigError::InvalidName(fragment.name.clone()));
        }
        if self.path(&fragment.name).exists() {
            return Err(ConfigError::DuplicateName(fragment.name.clone()));
        }
        self.write(fragment)
    }

    /// Overwrite an existing fragment.
    pub fn update(&self, fragment: &Fragment) -> Result<(), ConfigError> {
        if !is_valid_name(&fragment.name) {
            return Err(ConfigError::InvalidName(fragment.name.clone()));
        }
        if !self.path(&fragment.name).exists() {
            return Err(ConfigError::NotFound(fragment.name.clone()));
        }
        self.write(fragment)
    }

    fn write(&self, fragment: &Fragment) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.dir)?;
        let front = serde_yaml::to_string(fragment).map_err(|e| ConfigError::Malformed {
            path: self.path(&fragment.name),
            reason: e.to_string(),
        })?;
        let body = format!("---\n{front}---\n{}", fragment.text);
        atomic_write(&self.dir, &self.path(&fragment.name), body.as_bytes())?;
        self.events.emit(self.kind.event());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Fragment, ConfigError> {
        if !is_valid_name(name) {
            return Err(ConfigError::InvalidName(name.to_string()));
        }
        let path = self.path(name);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut fragment = parse_fragment(&text).ok_or_else(|| ConfigError::Malformed {
            path: path.clone(),
            reason: "missing or invalid front matter".to_string(),
        })?;
        // The file stem is the identity, whatever the front matter claims.
        fragment.name = name.to_string();
        Ok(fragment)
    }

    pub fn delete(&self, name: &str) -> Result<(), ConfigError> {
        let path = self.path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                self.events.emit(self.kind.event());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ConfigError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All fragments, sorted by (priorityLevel asc, name asc). Files that
    /// fail to parse are skipped with a warning so one bad file cannot take
    /// the whole listing down.
    pub fn list(&self) -> Vec<Fragment> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FRAGMENT_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.get(stem) {
                Ok(f) => out.push(f),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable fragment"),
            }
        }
        out.sort_by(|a, b| {
            a.priority_level
                .cmp(&b.priority_level)
                .then_with(|| a.name.cmp(&b.name))
        });
        out
    }
}

/// Split a `.mdt` file into front matter and body and parse the former.
fn parse_fragment(content: &str) -> Option<Fragment> {
    let rest = content
        .strip_prefix("---\n")
        .or_else(|| content.strip_prefix("---\r\n"))?;
    let (yaml_src, body) = match rest.find("\n---\n") {
        Some(i) => (&rest[..i], &rest[i + "\n---\n".len()..]),
        None => match rest.find("\n---\r\n") {
            Some(i) => (&rest[..i], &rest[i + "\n---\r\n".len()..]),
            None => return None,
        },
    };
    let mut fragment: Fragment = serde_yaml::from_str(yaml_src).ok()?;
    fragment.text = body.to_string();
    Some(fragment)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
