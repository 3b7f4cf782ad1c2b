//! Background maintenance loop.
//!
//! Every tick, in order:
//! 1. End expired allocations
//! 2. Probe resident models and record whether they answered
//! 3. Unload idle or unresponsive models nobody holds
//! 4. Purge everything unpinned if utilization crossed the emergency threshold
//! 5. Check the capacity invariant; a violation also forces a purge
//! 6. Write the warm-start snapshot, if configured
use crate::allocator::{Allocator, PurgeReport};
use crate::catalog::ModelKey;
use crate::snapshot::Snapshot;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    pub interval: Duration,
    pub idle_timeout: Duration,
    /// Fraction of capacity above which every unpinned model is purged
    pub emergency_threshold: f64,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            emergency_threshold: 0.95,
            snapshot_path: None,
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub expired: usize,
    pub unresponsive: usize,
    pub reclaimed: Vec<ModelKey>,
    pub purge: Option<PurgeReport>,
    pub invariant_violated: bool,
}

pub struct Janitor {
    allocator: Allocator,
    config: JanitorConfig,
}

impl Janitor {
    pub fn new(allocator: Allocator, config: JanitorConfig) -> Self {
        Self { allocator, config }
    }

    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport {
            expired: self.allocator.expire_allocations(Instant::now()).await,
            unresponsive: self.allocator.reconcile().await,
            ..TickReport::default()
        };
        report.reclaimed = self
            .allocator
            .reclaim_idle(self.config.idle_timeout, Instant::now())
            .await;

        let utilization = self.allocator.utilization().await;
        if utilization > self.config.emergency_threshold {
            warn!(
                utilization,
                threshold = self.config.emergency_threshold,
                "Utilization above emergency threshold"
            );
            report.purge = Some(self.allocator.emergency_purge().await);
        }

        if let Err(e) = self.allocator.check_invariant().await {
            error!(error = %e, "Purging after invariant violation");
            report.invariant_violated = true;
            if report.purge.is_none() {
                report.purge = Some(self.allocator.emergency_purge().await);
            }
        }

        if let Some(path) = &self.config.snapshot_path {
            let snapshot = Snapshot::new(self.allocator.resident_keys().await);
            if let Err(e) = snapshot.write(path).await {
                warn!(error = %e, "Failed to write snapshot");
            }
        }
        report
    }

    /// Run ticks on a fixed interval until the handle is shut down.
    pub fn spawn(self) -> JanitorHandle {
        let (shutdown, mut stop) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;
            info!(interval = ?self.config.interval, "Janitor started");
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    _ = interval.tick() => {
                        let report = self.tick().await;
                        debug!(?report, "Janitor tick");
                    }
                }
            }
            info!("Janitor stopped");
        });
        JanitorHandle { shutdown, task }
    }
}

pub struct JanitorHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl JanitorHandle {
    /// Stop after the current tick and wait for the loop to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "Janitor task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::AllocationRequest;
    use crate::allocator::Timeouts;
    use crate::catalog::{Catalog, ModelDescriptor};
    use crate::ledger::CapacityLedger;
    use crate::providers::{InMemoryAdapter, ProviderRegistry};
    use std::sync::Arc;

    fn allocator(max: u64, models: &[(&str, u64, bool)]) -> (Allocator, Arc<InMemoryAdapter>) {
        let catalog = Catalog::from_descriptors(models.iter().map(|(id, footprint, pinned)| {
            ModelDescriptor::builder()
                .provider("mem")
                .model_id(*id)
                .estimated_footprint(*footprint)
                .pinned(*pinned)
                .build()
        }));
        let adapter = Arc::new(InMemoryAdapter::new("mem", Vec::new()));
        let ledger = CapacityLedger::new(max, 0, catalog).unwrap();
        (
            Allocator::new(
                ledger,
                ProviderRegistry::new().with(adapter.clone()),
                Timeouts::default(),
            ),
            adapter,
        )
    }

    async fn hold(allocator: &Allocator, requester: &str, model_id: &str, secs: u64) {
        allocator
            .allocate(
                AllocationRequest::builder()
                    .requester_id(requester)
                    .model_id(model_id)
                    .estimated_duration(Duration::from_secs(secs))
                    .build(),
            )
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_expires_then_reclaims() {
        let (allocator, adapter) = allocator(8000, &[("m1", 1000, false)]);
        hold(&allocator, "a", "m1", 60).await;
        let janitor = Janitor::new(
            allocator.clone(),
            JanitorConfig {
                idle_timeout: Duration::from_secs(120),
                ..JanitorConfig::default()
            },
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        let report = janitor.tick().await;
        assert_eq!(report.expired, 1);
        assert!(report.reclaimed.is_empty());

        tokio::time::advance(Duration::from_secs(60)).await;
        let report = janitor.tick().await;
        assert_eq!(report.reclaimed, vec![ModelKey::new("mem", "m1")]);
        assert!(!adapter.is_loaded("m1"));
        assert!(report.purge.is_none());
    }

    #[tokio::test]
    async fn test_tick_purges_above_threshold() {
        let (allocator, _) =
            allocator(8000, &[("p", 1000, true), ("m1", 4500, false), ("m2", 2200, false)]);
        hold(&allocator, "a", "p", 600).await;
        hold(&allocator, "b", "m1", 600).await;
        hold(&allocator, "c", "m2", 600).await;

        let report = Janitor::new(allocator.clone(), JanitorConfig::default())
            .tick()
            .await;
        let purge = report.purge.unwrap();
        assert_eq!(purge.unloaded.len(), 2);
        assert!(!report.invariant_violated);
        assert_eq!(allocator.status().await.used_bytes, 1000);
    }

    #[tokio::test]
    async fn test_tick_writes_snapshot() {
        let (allocator, _) = allocator(8000, &[("m1", 1000, false)]);
        hold(&allocator, "a", "m1", 600).await;
        let path = std::env::temp_dir().join(format!(
            "vramkeeper-{}-janitor-snapshot.json",
            std::process::id()
        ));
        let janitor = Janitor::new(
            allocator,
            JanitorConfig {
                snapshot_path: Some(path.clone()),
                ..JanitorConfig::default()
            },
        );

        janitor.tick().await;
        let snapshot = Snapshot::read(&path).await.unwrap().unwrap();
        assert_eq!(snapshot.resident, vec![ModelKey::new("mem", "m1")]);
        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_janitor_runs_and_stops() {
        let (allocator, _) = allocator(8000, &[("m1", 1000, false)]);
        hold(&allocator, "a", "m1", 5).await;
        let handle = Janitor::new(
            allocator.clone(),
            JanitorConfig {
                interval: Duration::from_secs(10),
                ..JanitorConfig::default()
            },
        )
        .spawn();

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(allocator.allocation("a").await.is_none());
        handle.shutdown().await;
    }
}
