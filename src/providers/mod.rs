//! Provider adapters: the boundary between the allocator and the inference servers.
//!
//! Every network call the engine makes goes through a [`ProviderAdapter`]. One adapter exists
//! per configured provider, and the [`ProviderRegistry`] looks them up by provider name.
//!
//! ## Implementations
//!
//! - [`ollama::OllamaAdapter`]: Ollama's native API
//! - [`openai::OpenAiAdapter`]: OpenAI-compatible servers (vLLM sleep mode, LM Studio)
//! - [`memory::InMemoryAdapter`]: in-process adapter for tests and dry runs

pub mod http;
pub mod memory;
pub mod ollama;
pub mod openai;

use crate::catalog::ModelDescriptor;
use crate::errors::AdapterError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub use memory::InMemoryAdapter;
pub use ollama::OllamaAdapter;
pub use openai::{OpenAiAdapter, OpenAiFlavor};

/// Operations the allocator needs from an inference provider.
///
/// # Implementation Notes
///
/// - Calls may be issued concurrently for different models
/// - The engine wraps every call in its own timeout; a timeout counts as failure
/// - `load`/`unload` must only return `Ok` once the provider confirmed the change
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Name of the provider this adapter serves, as used in model keys
    fn name(&self) -> &str;

    /// List the models the provider can serve.
    async fn discover(&self) -> Result<Vec<ModelDescriptor>, AdapterError>;

    /// Check whether a model is loaded and answering. Never errors: any failure is `false`.
    async fn probe(&self, model_id: &str) -> bool;

    /// Bring a model into memory.
    async fn load(&self, model_id: &str) -> Result<(), AdapterError>;

    /// Remove a model from memory.
    async fn unload(&self, model_id: &str) -> Result<(), AdapterError>;
}

/// Which adapter a provider uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ollama,
    Vllm,
    Lmstudio,
    /// In-process adapter; loads and unloads always succeed
    Memory,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Ollama => write!(f, "ollama"),
            ProviderKind::Vllm => write!(f, "vllm"),
            ProviderKind::Lmstudio => write!(f, "lmstudio"),
            ProviderKind::Memory => write!(f, "memory"),
        }
    }
}

fn default_sleep_level() -> u8 {
    1
}

/// Configuration for one provider, as it appears in the engine config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Base URL of the provider (unused for `memory`)
    pub url: Option<Url>,
    /// Footprint assigned to discovered models whose size the provider does not report
    #[serde(default)]
    pub default_footprint_bytes: u64,
    /// vLLM sleep level used on unload (1 or 2)
    #[serde(default = "default_sleep_level")]
    pub sleep_level: u8,
}

/// Adapters keyed by provider name
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own name, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider).cloned()
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.adapters.contains_key(provider)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn ProviderAdapter>> {
        self.adapters.values()
    }

    /// Build adapters for every configured provider using the default HTTP client.
    pub fn from_config(
        providers: &HashMap<String, ProviderConfig>,
        request_timeout: Duration,
    ) -> Result<Self, anyhow::Error> {
        let client = Arc::new(http::HyperProviderClient::new(request_timeout));
        let mut registry = Self::new();
        for (name, config) in providers {
            let url = || {
                config.url.clone().ok_or_else(|| {
                    anyhow::anyhow!("provider '{}' of kind {} needs a url", name, config.kind)
                })
            };
            let adapter: Arc<dyn ProviderAdapter> = match config.kind {
                ProviderKind::Memory => Arc::new(InMemoryAdapter::new(name.clone(), Vec::new())),
                ProviderKind::Ollama => Arc::new(
                    OllamaAdapter::with_client(name.clone(), url()?, Arc::clone(&client))
                        .with_default_footprint(config.default_footprint_bytes),
                ),
                ProviderKind::Vllm => Arc::new(
                    OpenAiAdapter::with_client(
                        name.clone(),
                        url()?,
                        OpenAiFlavor::VllmSleepMode {
                            sleep_level: config.sleep_level,
                        },
                        Arc::clone(&client),
                    )
                    .with_default_footprint(config.default_footprint_bytes),
                ),
                ProviderKind::Lmstudio => Arc::new(
                    OpenAiAdapter::with_client(
                        name.clone(),
                        url()?,
                        OpenAiFlavor::JustInTime,
                        Arc::clone(&client),
                    )
                    .with_default_footprint(config.default_footprint_bytes),
                ),
            };
            registry.register(adapter);
        }
        Ok(registry)
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}
