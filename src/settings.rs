//! The engine configuration file and its hot reload.
//!
//! The file is JSON: capacity, janitor and timeout settings, the providers to talk to, and the
//! models declared up front. When watched, modifications re-read the file and merge the model
//! list into the live catalog. Everything else needs a restart.
use crate::allocator::{Allocator, Timeouts};
use crate::catalog::{Catalog, ModelDescriptor};
use crate::janitor::JanitorConfig;
use crate::ledger::CapacityLedger;
use crate::providers::ProviderConfig;
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySettings {
    pub max_bytes: u64,
    #[serde(default)]
    pub safety_margin_bytes: u64,
}

fn default_interval_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_emergency_threshold() -> f64 {
    0.95
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JanitorSettings {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_emergency_threshold")]
    pub emergency_threshold: f64,
}

impl Default for JanitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            emergency_threshold: default_emergency_threshold(),
        }
    }
}

fn default_probe_secs() -> u64 {
    3
}

fn default_load_secs() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_probe_secs")]
    pub probe_secs: u64,
    #[serde(default = "default_load_secs")]
    pub load_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            probe_secs: default_probe_secs(),
            load_secs: default_load_secs(),
        }
    }
}

/// A model declared in the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub footprint_bytes: u64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub pinned: bool,
}

impl From<&ModelEntry> for ModelDescriptor {
    fn from(entry: &ModelEntry) -> Self {
        ModelDescriptor::builder()
            .provider(entry.provider.clone())
            .model_id(entry.model_id.clone())
            .estimated_footprint(entry.footprint_bytes)
            .capability_tags(entry.tags.clone())
            .roles(entry.roles.clone())
            .pinned(entry.pinned)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineFile {
    pub capacity: CapacitySettings,
    #[serde(default)]
    pub janitor: JanitorSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

impl EngineFile {
    pub async fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        let file: EngineFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.capacity.safety_margin_bytes > self.capacity.max_bytes {
            return Err(anyhow!(
                "safety_margin_bytes ({}) exceeds max_bytes ({})",
                self.capacity.safety_margin_bytes,
                self.capacity.max_bytes
            ));
        }
        let threshold = self.janitor.emergency_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(anyhow!(
                "emergency_threshold must be in (0, 1], got {threshold}"
            ));
        }
        if self.janitor.interval_secs == 0 {
            return Err(anyhow!("janitor interval_secs must be positive"));
        }
        if self.timeouts.probe_secs == 0 || self.timeouts.load_secs == 0 {
            return Err(anyhow!("timeouts must be positive"));
        }
        let limit = self.capacity.max_bytes - self.capacity.safety_margin_bytes;
        for model in &self.models {
            if model.footprint_bytes > limit {
                return Err(anyhow!(
                    "model '{}' needs {} bytes, more than the {} bytes capacity allows",
                    model.model_id,
                    model.footprint_bytes,
                    limit
                ));
            }
            if !self.providers.contains_key(&model.provider) {
                return Err(anyhow!(
                    "model '{}' references unknown provider '{}'",
                    model.model_id,
                    model.provider
                ));
            }
        }
        Ok(())
    }

    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        self.models.iter().map(ModelDescriptor::from).collect()
    }

    pub fn ledger(&self) -> Result<CapacityLedger, anyhow::Error> {
        CapacityLedger::new(
            self.capacity.max_bytes,
            self.capacity.safety_margin_bytes,
            Catalog::from_descriptors(self.descriptors()),
        )
        .map_err(|e| anyhow!("Failed to build capacity ledger: {e}"))
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            probe: Duration::from_secs(self.timeouts.probe_secs),
            load: Duration::from_secs(self.timeouts.load_secs),
        }
    }

    pub fn janitor_config(&self, snapshot_path: Option<PathBuf>) -> JanitorConfig {
        JanitorConfig {
            interval: Duration::from_secs(self.janitor.interval_secs),
            idle_timeout: Duration::from_secs(self.janitor.idle_timeout_secs),
            emergency_threshold: self.janitor.emergency_threshold,
            snapshot_path,
        }
    }
}

/// A source of re-read config files
#[async_trait]
pub trait ConfigStream {
    async fn receive(
        &self,
    ) -> Result<mpsc::Receiver<Result<EngineFile, anyhow::Error>>, anyhow::Error>;
}

/// Watches the config file on disk and re-reads it on every modification.
pub struct WatchedFile(pub PathBuf);

#[async_trait]
impl ConfigStream for WatchedFile {
    async fn receive(
        &self,
    ) -> Result<mpsc::Receiver<Result<EngineFile, anyhow::Error>>, anyhow::Error> {
        let (config_tx, config_rx) = mpsc::channel(16);
        let (file_tx, mut file_rx) = mpsc::channel(16);

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = file_tx.blocking_send(res);
            },
            NotifyConfig::default(),
        )?;
        watcher.watch(&self.0, RecursiveMode::NonRecursive)?;

        let config_path = self.0.clone();
        tokio::spawn(async move {
            // Owned by the task so watching stops when the receiver goes away
            let _watcher = watcher;
            while let Some(res) = file_rx.recv().await {
                let update = match res {
                    Ok(event) if event.kind.is_modify() => {
                        info!(path = %config_path.display(), "Config file changed, reloading");
                        EngineFile::from_file(&config_path).await
                    }
                    Ok(_) => continue,
                    Err(e) => Err(anyhow!("Watch error: {e}")),
                };
                if config_tx.send(update).await.is_err() {
                    break;
                }
            }
        });

        Ok(config_rx)
    }
}

/// Merge every re-read model list into the allocator's catalog, in a background task.
/// `current` is the configuration the engine was started with; capacity changes against it
/// are reported but not applied.
pub async fn receive_updates<S: ConfigStream + Send + 'static>(
    allocator: Allocator,
    current: CapacitySettings,
    stream: S,
) -> Result<(), anyhow::Error> {
    let mut rx = stream.receive().await?;
    tokio::spawn(async move {
        while let Some(result) = rx.recv().await {
            match result {
                Ok(file) => {
                    if file.capacity != current {
                        warn!(
                            configured = ?file.capacity,
                            running = ?current,
                            "Capacity changes take effect on restart"
                        );
                    }
                    let update = allocator.merge_catalog(file.descriptors()).await;
                    info!(added = update.added, updated = update.updated, "Reloaded models");
                }
                Err(e) => error!(error = %e, "Failed to reload config"),
            }
        }
    });
    Ok(())
}
