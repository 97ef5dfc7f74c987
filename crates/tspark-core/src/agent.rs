// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use tspark_config::{
    ConfigStore, EventBus, Fragment, FragmentKind, FragmentStore, ServerConfig, WorkspaceEvent,
};
use tspark_model::{Model, ProviderDescriptor};
use tspark_tools::{build_client, ClientDeps, McpManager, ToolServerClient};

use crate::session::{Session, SessionOptions};
use crate::AgentError;

/// Everything a workspace owns: the config store, the rule/reference
/// stores, the tool-server manager and the event bus. Sessions borrow this
/// through an `Arc`; the workspace is the sole owner of clients and stores.
pub struct Workspace {
    pub dir: PathBuf,
    pub config: Arc<ConfigStore>,
    pub rules: Arc<FragmentStore>,
    pub references: Arc<FragmentStore>,
    pub manager: Arc<McpManager>,
    pub events: EventBus,
}

/// The public agent façade front-ends talk to: provider and tool-server
/// management, rule/reference CRUD, the system prompt, and session
/// lifecycle. Per-session operations live on [`Session`].
pub struct Agent {
    workspace: Arc<Workspace>,
    sessions: StdMutex<HashMap<String, Arc<Session>>>,
}

impl Agent {
    /// Open (or with `create`, initialize) the workspace at `dir` and
    /// connect its configured tool servers.
    pub async fn open(dir: &Path, create: bool) -> Result<Self, AgentError> {
        let events = EventBus::new();
        let config = Arc::new(ConfigStore::open(dir, create, events.clone())?);
        let rules = Arc::new(FragmentStore::new(dir, FragmentKind::Rule, events.clone()));
        let references = Arc::new(FragmentStore::new(
            dir,
            FragmentKind::Reference,
            events.clone(),
        ));
        let manager = McpManager::new();
        let workspace = Arc::new(Workspace {
            dir: dir.to_path_buf(),
            config,
            rules,
            references,
            manager,
            events,
        });

        let agent = Self {
            workspace,
            sessions: StdMutex::new(HashMap::new()),
        };
        for cfg in agent.workspace.config.list_tool_servers() {
            agent.install_client(&cfg).await;
        }
        Ok(agent)
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    /// Subscribe to workspace change events. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.workspace.events.subscribe()
    }

    /// Build, connect (best effort) and register the client for a server
    /// config, replacing any previous client for that name.
    async fn install_client(&self, cfg: &ServerConfig) {
        let deps = ClientDeps {
            system_path: self.workspace.config.system_path(),
            rules: self.workspace.rules.clone(),
            references: self.workspace.references.clone(),
            config: self.workspace.config.clone(),
            manager: Arc::downgrade(&self.workspace.manager),
        };
        let client = build_client(cfg, &deps);
        if !client.connect().await {
            warn!(server = %cfg.name, "tool server failed to connect; will retry on first call");
        }
        self.workspace.manager.update_client(&cfg.name, client).await;
        debug!(server = %cfg.name, "tool server client installed");
    }

    // ─── Providers ────────────────────────────────────────────────────────────

    pub fn available_providers() -> &'static [ProviderDescriptor] {
        tspark_model::available_providers()
    }

    pub fn installed_providers(&self) -> Vec<String> {
        self.workspace.config.list_providers()
    }

    pub fn is_provider_installed(&self, provider_id: &str) -> bool {
        self.workspace.config.is_installed(provider_id)
    }

    /// Install a provider with its credentials. All credentials the
    /// descriptor marks required must be present.
    pub fn install_provider(
        &self,
        provider_id: &str,
        credentials: BTreeMap<String, String>,
    ) -> Result<(), AgentError> {
        let descriptor = tspark_model::descriptor(provider_id)
            .ok_or_else(|| AgentError::UnknownProvider(provider_id.to_string()))?;
        for key in descriptor.required_keys() {
            if !credentials.contains_key(key) {
                return Err(AgentError::Provider(format!(
                    "missing required credential `{key}` for provider `{provider_id}`"
                )));
            }
        }
        self.workspace.config.install(provider_id, credentials)?;
        Ok(())
    }

    pub fn uninstall_provider(&self, provider_id: &str) -> Result<(), AgentError> {
        self.workspace.config.uninstall(provider_id)?;
        Ok(())
    }

    pub fn get_provider_credential(&self, provider_id: &str, key: &str) -> Option<String> {
        self.workspace.config.get_provider_credential(provider_id, key)
    }

    pub fn set_provider_credential(
        &self,
        provider_id: &str,
        key: &str,
        value: String,
    ) -> Result<(), AgentError> {
        self.workspace
            .config
            .set_provider_credential(provider_id, key, value)?;
        Ok(())
    }

    /// Models offered by a provider (static list or live listing).
    pub async fn list_models(&self, provider_id: &str) -> Result<Vec<Model>, AgentError> {
        let credentials = self
            .workspace
            .config
            .provider_credentials(provider_id)
            .unwrap_or_default();
        tspark_model::list_models(provider_id, &credentials)
            .await
            .map_err(|e| AgentError::Provider(e.to_string()))
    }

    // ─── Tool servers ─────────────────────────────────────────────────────────

    pub fn get_all_mcp_servers(&self) -> Vec<ServerConfig> {
        self.workspace.config.list_tool_servers()
    }

    pub async fn get_mcp_client(&self, name: &str) -> Option<Arc<dyn ToolServerClient>> {
        self.workspace.manager.get_client(name).await
    }

    /// Create or update a tool-server config; the server's client is
    /// rebuilt and reconnected.
    pub async fn save_tool_server(&self, cfg: ServerConfig) -> Result<(), AgentError> {
        self.workspace.config.save_tool_server(cfg.clone())?;
        self.install_client(&cfg).await;
        Ok(())
    }

    pub async fn delete_tool_server(&self, name: &str) -> Result<(), AgentError> {
        self.workspace.config.delete_tool_server(name)?;
        self.workspace.manager.delete_client(name).await;
        Ok(())
    }

    // ─── Rules & references ───────────────────────────────────────────────────

    pub fn create_rule(&self, rule: &Fragment) -> Result<(), AgentError> {
        self.workspace.rules.create(rule).map_err(Into::into)
    }

    pub fn update_rule(&self, rule: &Fragment) -> Result<(), AgentError> {
        self.workspace.rules.update(rule).map_err(Into::into)
    }

    pub fn get_rule(&self, name: &str) -> Result<Fragment, AgentError> {
        self.workspace.rules.get(name).map_err(Into::into)
    }

    pub fn delete_rule(&self, name: &str) -> Result<(), AgentError> {
        self.workspace.rules.delete(name).map_err(Into::into)
    }

    pub fn list_rules(&self) -> Vec<Fragment> {
        self.workspace.rules.list()
    }

    pub fn create_reference(&self, reference: &Fragment) -> Result<(), AgentError> {
        self.workspace.references.create(reference).map_err(Into::into)
    }

    pub fn update_reference(&self, reference: &Fragment) -> Result<(), AgentError> {
        self.workspace.references.update(reference).map_err(Into::into)
    }

    pub fn get_reference(&self, name: &str) -> Result<Fragment, AgentError> {
        self.workspace.references.get(name).map_err(Into::into)
    }

    pub fn delete_reference(&self, name: &str) -> Result<(), AgentError> {
        self.workspace.references.delete(name).map_err(Into::into)
    }

    pub fn list_references(&self) -> Vec<Fragment> {
        self.workspace.references.list()
    }

    // ─── Settings & system prompt ─────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Option<serde_json::Value> {
        self.workspace.config.get_setting(key)
    }

    pub fn set_setting(&self, key: &str, value: serde_json::Value) -> Result<(), AgentError> {
        self.workspace.config.set_setting(key, value).map_err(Into::into)
    }

    pub fn get_system_prompt(&self) -> String {
        self.workspace.config.get_system_prompt()
    }

    pub fn set_system_prompt(&self, text: &str) -> Result<(), AgentError> {
        self.workspace.config.save_system_prompt(text).map_err(Into::into)
    }

    // ─── Sessions ─────────────────────────────────────────────────────────────

    /// Create a session. Unset options fall back to workspace settings;
    /// the scope is seeded with every rule, reference and tool marked
    /// `include = always`.
    pub async fn create_session(
        &self,
        session_id: &str,
        options: SessionOptions,
    ) -> Result<Arc<Session>, AgentError> {
        if self.sessions.lock().unwrap().contains_key(session_id) {
            return Err(AgentError::SessionExists(session_id.to_string()));
        }
        let session = Arc::new(
            Session::create(self.workspace.clone(), session_id.to_string(), options).await?,
        );
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id.to_string(), session.clone());
        Ok(session)
    }

    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(session_id)
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    /// Remove a session. An in-flight turn observes the cancellation and
    /// aborts without mutating the (now unreachable) history.
    pub fn delete_session(&self, session_id: &str) -> bool {
        match self.sessions.lock().unwrap().remove(session_id) {
            Some(session) => {
                session.cancel_token().cancel();
                true
            }
            None => false,
        }
    }
}
