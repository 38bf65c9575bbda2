//! Adapter registry — the single extension point for adding providers.
//!
//! Maps each [`ProviderKind`] to its adapter and default model. Adding a
//! provider means adding a `ProviderKind` variant and registering one
//! adapter with one default-model entry here; nothing else changes.

use std::collections::HashMap;
use std::sync::Arc;

use parley_config::{AppConfig, ProviderKind};

use super::adapter::ProviderAdapter;
use super::anthropic::AnthropicAdapter;
use super::openai::OpenAiAdapter;

struct RegistryEntry {
    adapter: Arc<dyn ProviderAdapter>,
    default_model: String,
}

/// Registry of provider adapters keyed by [`ProviderKind`].
#[derive(Default)]
pub struct AdapterRegistry {
    entries: HashMap<ProviderKind, RegistryEntry>,
}

impl AdapterRegistry {
    /// An empty registry. Useful for tests that register scripted adapters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry with all built-in adapters configured from the
    /// `[providers]` config section.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self::new();

        let openai_cfg = config.providers.endpoint(ProviderKind::OpenAi);
        let mut openai = OpenAiAdapter::new().with_model(&openai_cfg.default_model);
        if let Some(ref base_url) = openai_cfg.base_url {
            openai = openai.with_base_url(base_url);
        }
        registry.register(
            ProviderKind::OpenAi,
            Arc::new(openai),
            &openai_cfg.default_model,
        );

        let anthropic_cfg = config.providers.endpoint(ProviderKind::Anthropic);
        let mut anthropic = AnthropicAdapter::new().with_model(&anthropic_cfg.default_model);
        if let Some(ref base_url) = anthropic_cfg.base_url {
            anthropic = anthropic.with_base_url(base_url);
        }
        registry.register(
            ProviderKind::Anthropic,
            Arc::new(anthropic),
            &anthropic_cfg.default_model,
        );

        registry
    }

    /// Register (or replace) the adapter and default model for a provider.
    pub fn register(
        &mut self,
        kind: ProviderKind,
        adapter: Arc<dyn ProviderAdapter>,
        default_model: impl Into<String>,
    ) {
        self.entries.insert(
            kind,
            RegistryEntry {
                adapter,
                default_model: default_model.into(),
            },
        );
    }

    /// Resolve the adapter for a provider, if registered.
    pub fn adapter(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderAdapter>> {
        self.entries.get(&kind).map(|e| Arc::clone(&e.adapter))
    }

    /// Default model for a provider, if registered.
    pub fn default_model(&self, kind: ProviderKind) -> Option<&str> {
        self.entries.get(&kind).map(|e| e.default_model.as_str())
    }

    /// Providers currently registered.
    pub fn providers(&self) -> Vec<ProviderKind> {
        self.entries.keys().copied().collect()
    }
}
