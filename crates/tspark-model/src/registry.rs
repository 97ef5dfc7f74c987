// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider registry: static metadata for every supported provider plus
//! adapter construction from stored credentials.
//!
//! This module is the single source of truth for which provider ids exist,
//! what credentials they take, and which models they are known to serve.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::{
    AnthropicAdapter, ConfigField, EchoAdapter, Model, ModelListing, ModelSource, OllamaAdapter,
    OpenAiAdapter, ProviderAdapter, ProviderDescriptor,
};

/// Credential key for API-key style providers.
pub const API_KEY: &str = "apiKey";
/// Credential key for endpoint overrides.
pub const BASE_URL: &str = "baseUrl";

/// Complete registry of supported providers.
pub static PROVIDERS: &[ProviderDescriptor] = &[
    ProviderDescriptor {
        id: "anthropic",
        name: "Anthropic",
        description: "Anthropic Claude models via the Messages API",
        url: "https://www.anthropic.com",
        config_fields: &[
            ConfigField {
                key: API_KEY,
                caption: "API key",
                required: true,
                secret: true,
                default: None,
            },
            ConfigField {
                key: BASE_URL,
                caption: "Base URL",
                required: false,
                secret: false,
                default: Some("https://api.anthropic.com"),
            },
        ],
        models: ModelListing::Static(&[
            "claude-opus-4-5",
            "claude-sonnet-4-5",
            "claude-haiku-4-5",
        ]),
    },
    ProviderDescriptor {
        id: "openai",
        name: "OpenAI",
        description: "OpenAI GPT and o-series models via Chat Completions",
        url: "https://openai.com",
        config_fields: &[
            ConfigField {
                key: API_KEY,
                caption: "API key",
                required: true,
                secret: true,
                default: None,
            },
            ConfigField {
                key: BASE_URL,
                caption: "Base URL",
                required: false,
                secret: false,
                default: Some("https://api.openai.com/v1"),
            },
        ],
        models: ModelListing::Static(&["gpt-4o", "gpt-4o-mini", "o3-mini"]),
    },
    ProviderDescriptor {
        id: "ollama",
        name: "Ollama",
        description: "Local models served by Ollama",
        url: "https://ollama.com",
        config_fields: &[ConfigField {
            key: BASE_URL,
            caption: "Server URL",
            required: false,
            secret: false,
            default: Some(crate::ollama::DEFAULT_BASE_URL),
        }],
        models: ModelListing::Dynamic,
    },
    ProviderDescriptor {
        id: "mock",
        name: "Mock",
        description: "Deterministic echo provider for tests and demos",
        url: "https://example.invalid/mock",
        config_fields: &[],
        models: ModelListing::Static(&["mock-model"]),
    },
];

#[derive(Debug, Error)]
pub enum AdapterInitError {
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),

    #[error("provider `{provider}` is missing required credential `{key}`")]
    MissingCredential {
        provider: String,
        key: &'static str,
    },
}

pub fn available_providers() -> &'static [ProviderDescriptor] {
    PROVIDERS
}

pub fn descriptor(provider_id: &str) -> Option<&'static ProviderDescriptor> {
    PROVIDERS.iter().find(|p| p.id == provider_id)
}

/// Instantiate an adapter for `(provider, model)` from a stored credential
/// map. Fails when the provider is unknown or a required credential is
/// absent; everything past construction is reported inside the replies.
pub fn create_adapter(
    provider_id: &str,
    model_id: &str,
    credentials: &BTreeMap<String, String>,
) -> Result<Box<dyn ProviderAdapter>, AdapterInitError> {
    let desc = descriptor(provider_id)
        .ok_or_else(|| AdapterInitError::UnknownProvider(provider_id.to_string()))?;
    for key in desc.required_keys() {
        if !credentials.contains_key(key) {
            return Err(AdapterInitError::MissingCredential {
                provider: provider_id.to_string(),
                key,
            });
        }
    }

    let get = |key: &str| credentials.get(key).cloned();
    let adapter: Box<dyn ProviderAdapter> = match provider_id {
        "anthropic" => Box::new(AnthropicAdapter::new(
            model_id.to_string(),
            get(API_KEY).unwrap_or_default(),
            get(BASE_URL),
        )),
        "openai" => Box::new(OpenAiAdapter::new(
            model_id.to_string(),
            get(API_KEY).unwrap_or_default(),
            get(BASE_URL),
        )),
        "ollama" => Box::new(OllamaAdapter::new(model_id.to_string(), get(BASE_URL))),
        "mock" => Box::new(EchoAdapter::new(model_id.to_string())),
        other => return Err(AdapterInitError::UnknownProvider(other.to_string())),
    };
    Ok(adapter)
}

/// Models offered by a provider: the static well-known list, or a live
/// listing call for dynamic providers.
pub async fn list_models(
    provider_id: &str,
    credentials: &BTreeMap<String, String>,
) -> anyhow::Result<Vec<Model>> {
    let desc = descriptor(provider_id)
        .ok_or_else(|| anyhow::anyhow!("unknown provider `{provider_id}`"))?;
    match desc.models {
        ModelListing::Static(ids) => Ok(ids
            .iter()
            .map(|id| Model {
                provider_id: provider_id.to_string(),
                id: id.to_string(),
                name: id.to_string(),
                source: ModelSource::Static,
                description: None,
            })
            .collect()),
        ModelListing::Dynamic => match provider_id {
            "ollama" => crate::ollama::list_models(credentials.get(BASE_URL).cloned()).await,
            other => anyhow::bail!("provider `{other}` declares dynamic listing but has no lister"),
        },
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_provider_ids_are_unique() {
        let mut ids: Vec<_> = PROVIDERS.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), PROVIDERS.len());
    }

    #[test]
    fn descriptor_lookup() {
        assert!(descriptor("anthropic").is_some());
        assert!(descriptor("teapot").is_none());
    }

    #[test]
    fn create_adapter_requires_credentials() {
        let r = create_adapter("anthropic", "claude-haiku-4-5", &BTreeMap::new());
        assert!(matches!(
            r,
            Err(AdapterInitError::MissingCredential { key: API_KEY, .. })
        ));
    }

    #[test]
    fn create_adapter_unknown_provider() {
        let r = create_adapter("teapot", "m", &BTreeMap::new());
        assert!(matches!(r, Err(AdapterInitError::UnknownProvider(_))));
    }

    #[test]
    fn create_adapter_builds_with_credentials() {
        let mut creds = BTreeMap::new();
        creds.insert(API_KEY.to_string(), "sk-test".to_string());
        let adapter = create_adapter("openai", "gpt-4o-mini", &creds).unwrap();
        assert_eq!(adapter.provider_id(), "openai");
        assert_eq!(adapter.model_id(), "gpt-4o-mini");
    }

    #[test]
    fn mock_provider_needs_no_credentials() {
        let adapter = create_adapter("mock", "mock-model", &BTreeMap::new()).unwrap();
        assert_eq!(adapter.provider_id(), "mock");
    }

    #[tokio::test]
    async fn static_model_listing() {
        let models = list_models("anthropic", &BTreeMap::new()).await.unwrap();
        assert!(models.iter().any(|m| m.id == "claude-opus-4-5"));
        assert!(models.iter().all(|m| m.source == ModelSource::Static));
    }
}
