use crate::error::{classify, ErrorClassification};
use gantry_tool_runtime::provider::{ChatProvider, LlmError};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Capability flags a provider advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProviderMetadata {
    pub supports_streaming: bool,
    pub supports_function_calling: bool,
    pub supports_vision: bool,
}

/// Connection settings handed to a provider factory.
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

/// What a registered provider module exposes: a chat-client factory, an
/// error classifier, and capability metadata.
pub trait ProviderFeatures: Send + Sync {
    fn create_chat_client(&self, config: &ProviderConfig) -> Result<Arc<dyn ChatProvider>, LlmError>;

    fn classify(&self, error: &LlmError) -> ErrorClassification {
        classify(error)
    }

    fn metadata(&self) -> ProviderMetadata;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderRegistryError {
    #[error("Provider '{0}' is already registered")]
    Duplicate(String),
}

/// Process-wide map of provider key → features. Registration happens
/// explicitly during application startup, not from unrelated constructors.
pub struct ProviderRegistry {
    providers: RwLock<IndexMap<String, Arc<dyn ProviderFeatures>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(IndexMap::new()),
        }
    }

    pub fn register(
        &self,
        key: impl Into<String>,
        features: Arc<dyn ProviderFeatures>,
    ) -> Result<(), ProviderRegistryError> {
        let key = key.into();
        let mut providers = self.providers.write().expect("provider map poisoned");
        if providers.contains_key(&key) {
            return Err(ProviderRegistryError::Duplicate(key));
        }
        info!(provider = %key, "registered provider");
        providers.insert(key, features);
        Ok(())
    }

    pub fn lookup(&self, key: &str) -> Option<Arc<dyn ProviderFeatures>> {
        self.providers
            .read()
            .expect("provider map poisoned")
            .get(key)
            .cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.providers
            .read()
            .expect("provider map poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: Lazy<ProviderRegistry> = Lazy::new(ProviderRegistry::new);

/// The process-wide registry.
pub fn global() -> &'static ProviderRegistry {
    &GLOBAL
}

/// Register the providers shipped with this crate. Call once at startup;
/// repeat calls are no-ops.
pub fn register_builtin_providers() {
    let _ = global().register(
        "anthropic",
        Arc::new(crate::providers::anthropic::AnthropicFeatures),
    );
}
