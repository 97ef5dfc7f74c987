// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod registry;
mod anthropic;
mod driver;
mod mock;
mod ollama;
mod openai;
mod provider;
mod types;

pub use anthropic::AnthropicAdapter;
pub use mock::{EchoAdapter, ScriptedAdapter, ScriptedTurn};
pub use ollama::OllamaAdapter;
pub use openai::OpenAiAdapter;
pub use provider::{
    ConfigField, ModelListing, ProviderAdapter, ProviderDescriptor, SessionContext,
};
pub use registry::{available_providers, create_adapter, descriptor, list_models, AdapterInitError};
pub use types::*;
