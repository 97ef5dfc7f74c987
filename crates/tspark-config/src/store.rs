// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::Utc;
use tracing::{debug, warn};

use crate::fragments::is_valid_name;
use crate::schema::{Metadata, ServerConfig, WorkspaceDoc};
use crate::settings::{default_settings_map, validate_setting, SessionSettings};
use crate::{keys, ConfigError, EventBus, WorkspaceEvent};

/// File name of the workspace root document.
pub const WORKSPACE_FILE: &str = "tspark.json";

/// File name of the raw system-prompt text.
const PROMPT_FILE: &str = "prompt.md";

/// Persistent workspace configuration: the `tspark.json` document plus the
/// free-form system prompt file.
///
/// All mutation goes through this store and is serialized behind one lock;
/// readers observe the last committed state. Every save is atomic
/// (write-temp-then-rename in the workspace directory), so an interrupted
/// write never leaves an unreadable document behind.
pub struct ConfigStore {
    dir: PathBuf,
    doc: RwLock<WorkspaceDoc>,
    events: EventBus,
}

impl ConfigStore {
    /// Open the workspace rooted at `dir`.
    ///
    /// With `create` set, a missing workspace is initialized with default
    /// settings. Without it, a missing `tspark.json` is
    /// [`ConfigError::NotAWorkspace`]. A present-but-corrupt document loads
    /// degraded (empty sections) rather than failing.
    pub fn open(dir: &Path, create: bool, events: EventBus) -> Result<Self, ConfigError> {
        let file = dir.join(WORKSPACE_FILE);
        let mut degraded = false;
        let mut doc = if file.is_file() {
            let text = std::fs::read_to_string(&file)?;
            match serde_json::from_str::<WorkspaceDoc>(&text) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(path = %file.display(), error = %e, "corrupt workspace document, loading degraded");
                    degraded = true;
                    WorkspaceDoc::default()
                }
            }
        } else if create {
            std::fs::create_dir_all(dir)?;
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            WorkspaceDoc {
                metadata: Metadata {
                    name,
                    created: Some(Utc::now()),
                    last_accessed: None,
                    version: 1,
                },
                settings: default_settings_map(),
                ..WorkspaceDoc::default()
            }
        } else {
            return Err(ConfigError::NotAWorkspace(dir.to_path_buf()));
        };

        // The map key is the identity; bodies on disk do not carry names.
        for (name, cfg) in doc.mcp_servers.iter_mut() {
            cfg.name = name.clone();
        }
        doc.metadata.last_accessed = Some(Utc::now());

        let store = Self {
            dir: dir.to_path_buf(),
            doc: RwLock::new(doc),
            events,
        };
        // A degraded load keeps the corrupt file on disk untouched; the
        // first real mutation rewrites it.
        if !degraded {
            store.save()?;
        }
        debug!(dir = %dir.display(), "workspace opened");
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> Metadata {
        self.doc.read().unwrap().metadata.clone()
    }

    /// Persist the current document atomically.
    fn save(&self) -> Result<(), ConfigError> {
        let text = {
            let doc = self.doc.read().unwrap();
            serde_json::to_string_pretty(&*doc).map_err(|e| ConfigError::Malformed {
                path: self.dir.join(WORKSPACE_FILE),
                reason: e.to_string(),
            })?
        };
        atomic_write(&self.dir, &self.dir.join(WORKSPACE_FILE), text.as_bytes())
    }

    // ─── Settings ─────────────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Option<serde_json::Value> {
        self.doc.read().unwrap().settings.get(key).cloned()
    }

    pub fn set_setting(&self, key: &str, value: serde_json::Value) -> Result<(), ConfigError> {
        validate_setting(key, &value)?;
        self.doc
            .write()
            .unwrap()
            .settings
            .insert(key.to_string(), value);
        self.save()?;
        self.events.emit(WorkspaceEvent::SettingsChanged);
        Ok(())
    }

    /// Session settings derived from the workspace settings map.
    pub fn session_defaults(&self) -> SessionSettings {
        SessionSettings::from_map(&self.doc.read().unwrap().settings)
    }

    /// The recorded system `PATH`, injected into stdio tool-server processes
    /// whose configured environment lacks one.
    pub fn system_path(&self) -> Option<String> {
        self.get_setting(keys::SYSTEM_PATH)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    // ─── Providers ────────────────────────────────────────────────────────────

    /// Ids of installed providers.
    pub fn list_providers(&self) -> Vec<String> {
        self.doc.read().unwrap().providers.keys().cloned().collect()
    }

    pub fn is_installed(&self, provider_id: &str) -> bool {
        self.doc.read().unwrap().providers.contains_key(provider_id)
    }

    pub fn install(
        &self,
        provider_id: &str,
        credentials: BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        self.doc
            .write()
            .unwrap()
            .providers
            .insert(provider_id.to_string(), credentials);
        self.save()?;
        self.events.emit(WorkspaceEvent::ProvidersChanged);
        Ok(())
    }

    pub fn uninstall(&self, provider_id: &str) -> Result<(), ConfigError> {
        let removed = self
            .doc
            .write()
            .unwrap()
            .providers
            .remove(provider_id)
            .is_some();
        if !removed {
            return Err(ConfigError::NotFound(provider_id.to_string()));
        }
        self.save()?;
        self.events.emit(WorkspaceEvent::ProvidersChanged);
        Ok(())
    }

    pub fn get_provider_credential(&self, provider_id: &str, key: &str) -> Option<String> {
        self.doc
            .read()
            .unwrap()
            .providers
            .get(provider_id)
            .and_then(|c| c.get(key).cloned())
    }

    pub fn set_provider_credential(
        &self,
        provider_id: &str,
        key: &str,
        value: String,
    ) -> Result<(), ConfigError> {
        {
            let mut doc = self.doc.write().unwrap();
            let creds = doc
                .providers
                .get_mut(provider_id)
                .ok_or_else(|| ConfigError::NotFound(provider_id.to_string()))?;
            creds.insert(key.to_string(), value);
        }
        self.save()?;
        self.events.emit(WorkspaceEvent::ProvidersChanged);
        Ok(())
    }

    /// Full credential map for one installed provider.
    pub fn provider_credentials(&self, provider_id: &str) -> Option<BTreeMap<String, String>> {
        self.doc.read().unwrap().providers.get(provider_id).cloned()
    }

    // ─── Tool servers ─────────────────────────────────────────────────────────

    pub fn list_tool_servers(&self) -> Vec<ServerConfig> {
        self.doc.read().unwrap().mcp_servers.values().cloned().collect()
    }

    pub fn get_tool_server(&self, name: &str) -> Option<ServerConfig> {
        self.doc.read().unwrap().mcp_servers.get(name).cloned()
    }

    /// Create or replace a tool-server config. Server names share the
    /// rule/reference name alphabet because they prefix mangled tool names.
    pub fn save_tool_server(&self, cfg: ServerConfig) -> Result<(), ConfigError> {
        if !is_valid_name(&cfg.name) {
            return Err(ConfigError::InvalidName(cfg.name));
        }
        self.doc
            .write()
            .unwrap()
            .mcp_servers
            .insert(cfg.name.clone(), cfg);
        self.save()?;
        self.events.emit(WorkspaceEvent::ToolsChanged);
        Ok(())
    }

    pub fn delete_tool_server(&self, name: &str) -> Result<(), ConfigError> {
        let removed = self
            .doc
            .write()
            .unwrap()
            .mcp_servers
            .remove(name)
            .is_some();
        if !removed {
            return Err(ConfigError::NotFound(name.to_string()));
        }
        self.save()?;
        self.events.emit(WorkspaceEvent::ToolsChanged);
        Ok(())
    }

    // ─── System prompt ────────────────────────────────────────────────────────

    /// The raw system-prompt text; a missing file reads as empty.
    pub fn get_system_prompt(&self) -> String {
        match std::fs::read_to_string(self.dir.join(PROMPT_FILE)) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                warn!(error = %e, "failed to read system prompt");
                String::new()
            }
        }
    }

    pub fn save_system_prompt(&self, text: &str) -> Result<(), ConfigError> {
        atomic_write(&self.dir, &self.dir.join(PROMPT_FILE), text.as_bytes())?;
        self.events.emit(WorkspaceEvent::SystemPromptChanged);
        Ok(())
    }
}

/// Write `bytes` to `path` via a temp file in `dir` plus a rename.
pub(crate) fn atomic_write(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), ConfigError> {
    use std::io::Write;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| ConfigError::Io(e.error))?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{InternalTool, Transport};
    use serde_json::json;

    fn open_fresh(dir: &Path) -> ConfigStore {
        ConfigStore::open(dir, true, EventBus::new()).unwrap()
    }

    #[test]
    fn open_without_create_rejects_missing_workspace() {
        let tmp = tempfile::TempDir::new().unwrap();
        let missing = tmp.path().join("nope");
        let r = ConfigStore::open(&missing, false, EventBus::new());
        assert!(matches!(r, Err(ConfigError::NotAWorkspace(_))));
    }

    #[test]
    fn open_with_create_initializes_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open_fresh(tmp.path());
        assert!(tmp.path().join(WORKSPACE_FILE).is_file());
        assert_eq!(store.session_defaults(), SessionSettings::default());
        assert!(store.metadata().created.is_some());
    }

    #[test]
    fn corrupt_document_loads_degraded() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join(WORKSPACE_FILE), "{not json").unwrap();
        let store = ConfigStore::open(tmp.path(), false, EventBus::new()).unwrap();
        assert!(store.list_providers().is_empty());
        assert!(store.list_tool_servers().is_empty());
    }

    #[test]
    fn set_setting_round_trips() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open_fresh(tmp.path());
        store.set_setting(keys::MAX_CHAT_TURNS, json!(7)).unwrap();
        assert_eq!(store.get_setting(keys::MAX_CHAT_TURNS), Some(json!(7)));
        assert_eq!(store.session_defaults().max_chat_turns, 7);
    }

    #[test]
    fn set_setting_rejects_out_of_bounds() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open_fresh(tmp.path());
        let r = store.set_setting(keys::MAX_CHAT_TURNS, json!(0));
        assert!(matches!(r, Err(ConfigError::InvalidSetting { .. })));
    }

    #[test]
    fn setting_survives_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        {
            let store = open_fresh(tmp.path());
            store.set_setting(keys::SYSTEM_PATH, json!("/usr/bin")).unwrap();
        }
        let store = ConfigStore::open(tmp.path(), false, EventBus::new()).unwrap();
        assert_eq!(store.system_path().as_deref(), Some("/usr/bin"));
    }

    #[test]
    fn install_and_credential_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open_fresh(tmp.path());
        let mut creds = BTreeMap::new();
        creds.insert("apiKey".to_string(), "sk-test".to_string());
        store.install("anthropic", creds).unwrap();
        assert!(store.is_installed("anthropic"));
        assert_eq!(
            store.get_provider_credential("anthropic", "apiKey").as_deref(),
            Some("sk-test")
        );
        store
            .set_provider_credential("anthropic", "baseUrl", "http://localhost:1".into())
            .unwrap();
        assert_eq!(store.list_providers(), vec!["anthropic".to_string()]);
        store.uninstall("anthropic").unwrap();
        assert!(!store.is_installed("anthropic"));
    }

    #[test]
    fn uninstall_unknown_provider_is_not_found() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open_fresh(tmp.path());
        assert!(matches!(
            store.uninstall("nobody"),
            Err(ConfigError::NotFound(_))
        ));
    }

    #[test]
    fn tool_server_crud_and_reload() {
        let tmp = tempfile::TempDir::new().unwrap();
        {
            let store = open_fresh(tmp.path());
            store
                .save_tool_server(ServerConfig::new(
                    "rules",
                    Transport::Internal {
                        tool: InternalTool::Rules,
                    },
                ))
                .unwrap();
        }
        let store = ConfigStore::open(tmp.path(), false, EventBus::new()).unwrap();
        let cfg = store.get_tool_server("rules").expect("server persisted");
        assert_eq!(cfg.name, "rules", "name restored from map key");
        store.delete_tool_server("rules").unwrap();
        assert!(store.get_tool_server("rules").is_none());
    }

    #[test]
    fn save_tool_server_rejects_bad_name() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open_fresh(tmp.path());
        let r = store.save_tool_server(ServerConfig::new(
            "bad name!",
            Transport::Internal {
                tool: InternalTool::Rules,
            },
        ));
        assert!(matches!(r, Err(ConfigError::InvalidName(_))));
    }

    #[test]
    fn system_prompt_defaults_empty_and_round_trips() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = open_fresh(tmp.path());
        assert_eq!(store.get_system_prompt(), "");
        store.save_system_prompt("You are terse.").unwrap();
        assert_eq!(store.get_system_prompt(), "You are terse.");
    }

    #[test]
    fn mutations_emit_events() {
        let tmp = tempfile::TempDir::new().unwrap();
        let bus = EventBus::new();
        let store = ConfigStore::open(tmp.path(), true, bus.clone()).unwrap();
        let mut rx = bus.subscribe();
        store.set_setting(keys::TEMPERATURE, json!(0.5)).unwrap();
        assert_eq!(rx.try_recv().unwrap(), WorkspaceEvent::SettingsChanged);
        store.install("openai", BTreeMap::new()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), WorkspaceEvent::ProvidersChanged);
    }
}
