//! In-process provider for tests and dry runs.
//!
//! Loads and unloads flip a flag in a map and always succeed unless a failure was injected
//! for the model. Every call is counted so tests can assert on adapter traffic.
use super::ProviderAdapter;
use crate::catalog::ModelDescriptor;
use crate::errors::AdapterError;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Which adapter operation a failure is injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Load,
    Unload,
    Probe,
}

#[derive(Debug, Default)]
struct Counters {
    load: AtomicUsize,
    unload: AtomicUsize,
    probe: AtomicUsize,
}

#[derive(Debug)]
pub struct InMemoryAdapter {
    name: String,
    models: Vec<ModelDescriptor>,
    /// Whether the provider itself considers the model loaded
    loaded: DashMap<String, bool>,
    failures: DashSet<(String, Operation)>,
    latency: DashMap<Operation, Duration>,
    counters: Counters,
}

impl InMemoryAdapter {
    pub fn new(name: impl Into<String>, models: Vec<ModelDescriptor>) -> Self {
        Self {
            name: name.into(),
            models,
            loaded: DashMap::new(),
            failures: DashSet::new(),
            latency: DashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Make `operation` fail for `model_id` until cleared
    pub fn fail(&self, model_id: &str, operation: Operation) {
        self.failures.insert((model_id.to_string(), operation));
    }

    pub fn clear_failure(&self, model_id: &str, operation: Operation) {
        self.failures.remove(&(model_id.to_string(), operation));
    }

    /// Delay every call of `operation` by `delay`
    pub fn set_latency(&self, operation: Operation, delay: Duration) {
        self.latency.insert(operation, delay);
    }

    /// Mark a model as loaded on the provider side without going through `load`
    pub fn preload(&self, model_id: &str) {
        self.loaded.insert(model_id.to_string(), true);
    }

    /// Forget a model on the provider side, as if the server restarted
    pub fn drop_model(&self, model_id: &str) {
        self.loaded.remove(model_id);
    }

    pub fn is_loaded(&self, model_id: &str) -> bool {
        self.loaded.get(model_id).is_some_and(|entry| *entry)
    }

    pub fn load_calls(&self) -> usize {
        self.counters.load.load(Ordering::SeqCst)
    }

    pub fn unload_calls(&self) -> usize {
        self.counters.unload.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.counters.probe.load(Ordering::SeqCst)
    }

    fn should_fail(&self, model_id: &str, operation: Operation) -> bool {
        self.failures
            .contains(&(model_id.to_string(), operation))
    }

    async fn delay(&self, operation: Operation) {
        let delay = self.latency.get(&operation).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ProviderAdapter for InMemoryAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn discover(&self) -> Result<Vec<ModelDescriptor>, AdapterError> {
        Ok(self.models.clone())
    }

    async fn probe(&self, model_id: &str) -> bool {
        self.counters.probe.fetch_add(1, Ordering::SeqCst);
        self.delay(Operation::Probe).await;
        !self.should_fail(model_id, Operation::Probe) && self.is_loaded(model_id)
    }

    async fn load(&self, model_id: &str) -> Result<(), AdapterError> {
        self.counters.load.fetch_add(1, Ordering::SeqCst);
        self.delay(Operation::Load).await;
        if self.should_fail(model_id, Operation::Load) {
            return Err(AdapterError::Status {
                url: format!("memory://{}/load", self.name),
                status: 500,
            });
        }
        debug!(provider = %self.name, model = %model_id, "In-memory load");
        self.loaded.insert(model_id.to_string(), true);
        Ok(())
    }

    async fn unload(&self, model_id: &str) -> Result<(), AdapterError> {
        self.counters.unload.fetch_add(1, Ordering::SeqCst);
        self.delay(Operation::Unload).await;
        if self.should_fail(model_id, Operation::Unload) {
            return Err(AdapterError::Status {
                url: format!("memory://{}/unload", self.name),
                status: 500,
            });
        }
        debug!(provider = %self.name, model = %model_id, "In-memory unload");
        self.loaded.insert(model_id.to_string(), false);
        Ok(())
    }
}
