//! Operations run by the janitor and at startup: expiry, reconciliation against provider
//! probes, idle reclamation, emergency purge, catalog merges and warm start.
use super::{Allocator, with_timeout};
use crate::allocation::EndReason;
use crate::catalog::{MergeOutcome, MergeSource, ModelDescriptor, ModelKey};
use crate::errors::AllocationError;
use crate::events::{EngineEvent, UnloadCause};
use crate::ledger::ReserveOutcome;
use futures_util::future::join_all;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Outcome of merging descriptors into the catalog
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogUpdate {
    pub added: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PurgeReport {
    /// `used / max` when the purge started
    pub utilization: f64,
    pub unloaded: Vec<ModelKey>,
    /// Models whose unload failed; they stay resident
    pub failed: Vec<ModelKey>,
}

impl Allocator {
    /// End every allocation past its expiry. Returns how many ended.
    pub async fn expire_allocations(&self, now: Instant) -> usize {
        let mut state = self.inner.state.lock().await;
        let expired = state.table.drain_expired(now);
        for allocation in &expired {
            info!(requester = %allocation.requester_id, model = %allocation.model_key, "Allocation expired");
            self.emit(EngineEvent::Ended {
                requester_id: allocation.requester_id.clone(),
                model: allocation.model_key.clone(),
                reason: EndReason::Expired,
            });
        }
        expired.len()
    }

    pub(crate) async fn probe(&self, key: &ModelKey) -> bool {
        let Some(adapter) = self.inner.registry.get(&key.provider) else {
            return false;
        };
        tokio::time::timeout(self.inner.timeouts.probe, adapter.probe(&key.model_id))
            .await
            .unwrap_or(false)
    }

    /// Probe every resident model and record the result. Returns how many did not answer.
    pub async fn reconcile(&self) -> usize {
        let residents: Vec<ModelKey> = {
            let state = self.inner.state.lock().await;
            state
                .ledger
                .catalog()
                .resident()
                .filter(|m| !m.is_evicting())
                .map(|m| m.key())
                .collect()
        };

        let probes = join_all(residents.into_iter().map(|key| async move {
            let responsive = self.probe(&key).await;
            (key, responsive)
        }))
        .await;

        let mut state = self.inner.state.lock().await;
        let mut unresponsive = 0;
        for (key, responsive) in probes {
            // Unloaded while we were probing
            if !state
                .ledger
                .catalog()
                .get(&key)
                .is_some_and(|m| m.is_resident())
            {
                continue;
            }
            if !responsive {
                unresponsive += 1;
                warn!(model = %key, "Resident model failed its probe");
            } else {
                debug!(model = %key, "Probe ok");
            }
            state.ledger.set_responsive(&key, responsive);
        }
        unresponsive
    }

    /// Unload unreferenced, unpinned models that have been idle for `idle_timeout` or failed
    /// their last probe. Returns the models actually unloaded.
    pub async fn reclaim_idle(&self, idle_timeout: Duration, now: Instant) -> Vec<ModelKey> {
        let victims: Vec<(ModelKey, UnloadCause)> = {
            let mut state = self.inner.state.lock().await;
            let victims: Vec<(ModelKey, UnloadCause)> = state
                .ledger
                .catalog()
                .resident()
                .filter(|m| !m.pinned && !m.is_evicting() && !state.table.is_referenced(&m.key()))
                .filter_map(|m| {
                    if !m.is_responsive() {
                        Some((m.key(), UnloadCause::Unresponsive))
                    } else if m
                        .last_used()
                        .is_none_or(|at| now.saturating_duration_since(at) >= idle_timeout)
                    {
                        Some((m.key(), UnloadCause::Idle))
                    } else {
                        None
                    }
                })
                .collect();
            for (key, _) in &victims {
                state.ledger.begin_eviction(key);
            }
            victims
        };

        let mut unloaded = Vec::new();
        for (key, cause) in victims {
            if self.unload_model(&key, cause).await.is_ok() {
                unloaded.push(key);
            }
        }
        unloaded
    }

    /// Unload every non-pinned resident model, ending the allocations that hold them.
    pub async fn emergency_purge(&self) -> PurgeReport {
        let now = Instant::now();
        let (victims, utilization) = {
            let mut state = self.inner.state.lock().await;
            let utilization = state.ledger.utilization();
            let victims: Vec<ModelKey> = state
                .ledger
                .catalog()
                .resident()
                .filter(|m| !m.pinned && !m.is_evicting())
                .map(|m| m.key())
                .collect();
            for key in &victims {
                state.ledger.begin_eviction(key);
                let holders: Vec<String> = state
                    .table
                    .referencing(key)
                    .map(|a| a.requester_id.clone())
                    .collect();
                for holder in holders {
                    if let Some(ended) = state.table.end(&holder, EndReason::Purged, now) {
                        self.emit(EngineEvent::Ended {
                            requester_id: ended.requester_id,
                            model: ended.model_key,
                            reason: EndReason::Purged,
                        });
                    }
                }
            }
            (victims, utilization)
        };

        warn!(
            utilization,
            models = victims.len(),
            "Emergency purge: unloading every non-pinned model"
        );
        let results = join_all(
            victims
                .iter()
                .map(|key| self.unload_model(key, UnloadCause::Purged)),
        )
        .await;

        let mut report = PurgeReport {
            utilization,
            ..PurgeReport::default()
        };
        for (key, result) in victims.into_iter().zip(results) {
            match result {
                Ok(()) => report.unloaded.push(key),
                Err(_) => report.failed.push(key),
            }
        }
        self.emit(EngineEvent::EmergencyPurge {
            utilization,
            unloaded: report.unloaded.clone(),
        });
        report
    }

    pub async fn utilization(&self) -> f64 {
        self.inner.state.lock().await.ledger.utilization()
    }

    /// Verify the capacity invariant, logging and emitting an event on violation
    pub async fn check_invariant(&self) -> Result<(), AllocationError> {
        let state = self.inner.state.lock().await;
        let result = state.ledger.check_invariant();
        if let Err(AllocationError::InvariantViolation { used, limit }) = &result {
            error!(used, limit, "Capacity invariant violated");
            self.emit(EngineEvent::InvariantViolated {
                used: *used,
                limit: *limit,
            });
        }
        result
    }

    pub async fn resident_keys(&self) -> Vec<ModelKey> {
        let state = self.inner.state.lock().await;
        state.ledger.catalog().resident().map(|m| m.key()).collect()
    }

    /// Merge configured descriptors; configuration overrides static fields.
    pub async fn merge_catalog(&self, descriptors: Vec<ModelDescriptor>) -> CatalogUpdate {
        self.merge_with(descriptors, MergeSource::Declared).await
    }

    async fn merge_with(
        &self,
        descriptors: Vec<ModelDescriptor>,
        source: MergeSource,
    ) -> CatalogUpdate {
        let mut state = self.inner.state.lock().await;
        let mut update = CatalogUpdate::default();
        for descriptor in descriptors {
            match state.ledger.merge(descriptor, source) {
                MergeOutcome::Added => update.added += 1,
                MergeOutcome::Updated => update.updated += 1,
                MergeOutcome::Unchanged => {}
            }
        }
        if update.added + update.updated > 0 {
            info!(added = update.added, updated = update.updated, ?source, "Catalog updated");
            self.emit(EngineEvent::CatalogUpdated {
                added: update.added,
                updated: update.updated,
            });
        }
        update
    }

    /// Ask every provider what it can serve and merge the answers into the catalog.
    /// A provider that fails discovery is skipped.
    pub async fn discover(&self) -> CatalogUpdate {
        let limit = self.inner.timeouts.load;
        let results = join_all(self.inner.registry.adapters().map(|adapter| async move {
            (
                adapter.name().to_string(),
                with_timeout(limit, adapter.discover()).await,
            )
        }))
        .await;

        let mut descriptors = Vec::new();
        for (provider, result) in results {
            match result {
                Ok(found) => {
                    debug!(%provider, count = found.len(), "Discovery finished");
                    descriptors.extend(found);
                }
                Err(e) => warn!(%provider, error = %e, "Discovery failed"),
            }
        }
        self.merge_with(descriptors, MergeSource::Discovered).await
    }

    /// Re-adopt models a previous run left resident. Each one must be in the catalog, answer
    /// its probe, and fit. Returns the models restored.
    pub async fn warm_start(&self, keys: &[ModelKey]) -> Vec<ModelKey> {
        let mut restored = Vec::new();
        for key in keys {
            let known = {
                let state = self.inner.state.lock().await;
                state
                    .ledger
                    .catalog()
                    .get(key)
                    .map(|m| (m.is_resident(), m.estimated_footprint))
            };
            let Some((false, footprint)) = known else {
                debug!(model = %key, "Skipping warm start of unknown or resident model");
                continue;
            };
            if !self.probe(key).await {
                info!(model = %key, "Snapshot model no longer loaded, skipping");
                continue;
            }

            let mut state = self.inner.state.lock().await;
            match state.ledger.try_reserve(key, footprint) {
                ReserveOutcome::Reserved => match state.ledger.commit(key, Instant::now()) {
                    Ok(()) => {
                        info!(model = %key, footprint, "Warm start restored model");
                        self.emit(EngineEvent::Loaded {
                            model: key.clone(),
                            footprint,
                        });
                        restored.push(key.clone());
                    }
                    Err(e) => warn!(model = %key, error = %e, "Warm start commit failed"),
                },
                ReserveOutcome::Insufficient { shortfall } => {
                    warn!(model = %key, shortfall, "No room to restore model from snapshot")
                }
                ReserveOutcome::AlreadyResident | ReserveOutcome::InFlight(_) => {}
            }
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{AllocationRequest, Priority};
    use crate::allocator::Timeouts;
    use crate::catalog::Catalog;
    use crate::ledger::CapacityLedger;
    use crate::providers::memory::Operation;
    use crate::providers::{InMemoryAdapter, ProviderRegistry};
    use std::sync::Arc;

    fn model(id: &str, footprint: u64, pinned: bool) -> ModelDescriptor {
        ModelDescriptor::builder()
            .provider("mem")
            .model_id(id)
            .estimated_footprint(footprint)
            .pinned(pinned)
            .build()
    }

    fn engine(max: u64, models: Vec<ModelDescriptor>) -> (Allocator, Arc<InMemoryAdapter>) {
        let adapter = Arc::new(InMemoryAdapter::new("mem", Vec::new()));
        let ledger = CapacityLedger::new(max, 0, Catalog::from_descriptors(models)).unwrap();
        let registry = ProviderRegistry::new().with(adapter.clone());
        (Allocator::new(ledger, registry, Timeouts::default()), adapter)
    }

    fn request(id: &str, model_id: &str, secs: u64) -> AllocationRequest {
        AllocationRequest::builder()
            .requester_id(id)
            .model_id(model_id)
            .estimated_duration(Duration::from_secs(secs))
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_allocations() {
        let (allocator, _) = engine(8000, vec![model("m1", 1000, false)]);
        allocator.allocate(request("short", "m1", 10)).await.unwrap();
        allocator.allocate(request("long", "m1", 100)).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(allocator.expire_allocations(Instant::now()).await, 1);
        assert!(allocator.allocation("short").await.is_none());
        assert!(allocator.allocation("long").await.is_some());
        // Expiry never unloads
        assert_eq!(allocator.status().await.used_bytes, 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_idle_skips_referenced_and_pinned() {
        let (allocator, adapter) = engine(
            10_000,
            vec![
                model("idle", 1000, false),
                model("held", 1000, false),
                model("pinned", 1000, true),
            ],
        );
        for (requester, id) in [("a", "idle"), ("b", "held"), ("c", "pinned")] {
            allocator.allocate(request(requester, id, 10_000)).await.unwrap();
        }
        allocator.release("a").await;
        allocator.release("c").await;

        tokio::time::advance(Duration::from_secs(601)).await;
        let reclaimed = allocator
            .reclaim_idle(Duration::from_secs(600), Instant::now())
            .await;
        assert_eq!(reclaimed, vec![ModelKey::new("mem", "idle")]);
        assert!(!adapter.is_loaded("idle"));
        assert_eq!(allocator.status().await.used_bytes, 2000);
    }

    #[tokio::test]
    async fn test_unresponsive_model_is_reclaimed() {
        let (allocator, adapter) = engine(8000, vec![model("m1", 1000, false)]);
        allocator.allocate(request("a", "m1", 600)).await.unwrap();
        allocator.release("a").await;
        adapter.fail("m1", Operation::Probe);

        assert_eq!(allocator.reconcile().await, 1);
        let reclaimed = allocator
            .reclaim_idle(Duration::from_secs(3600), Instant::now())
            .await;
        assert_eq!(reclaimed.len(), 1);

        // Once unloaded the model can be loaded again
        adapter.clear_failure("m1", Operation::Probe);
        assert!(allocator.allocate(request("b", "m1", 600)).await.is_ok());
    }

    #[tokio::test]
    async fn test_emergency_purge_ends_allocations() {
        let (allocator, adapter) = engine(
            8000,
            vec![model("p", 1000, true), model("m1", 4500, false), model("m2", 2200, false)],
        );
        for (requester, id) in [("a", "p"), ("b", "m1"), ("c", "m2")] {
            allocator.allocate(request(requester, id, 600)).await.unwrap();
        }

        let report = allocator.emergency_purge().await;
        assert!(report.utilization > 0.95);
        assert_eq!(report.unloaded.len(), 2);
        assert!(report.failed.is_empty());
        assert!(adapter.is_loaded("p"));

        let status = allocator.status().await;
        assert_eq!(status.used_bytes, 1000);
        assert_eq!(status.allocations.len(), 1);
        let purged = allocator
            .recent_endings()
            .await
            .into_iter()
            .filter(|e| e.reason == EndReason::Purged)
            .count();
        assert_eq!(purged, 2);
    }

    #[tokio::test]
    async fn test_discover_merges_without_overriding_config() {
        let adapter = Arc::new(InMemoryAdapter::new(
            "mem",
            vec![model("declared", 9999, false), model("found", 500, false)],
        ));
        let catalog = Catalog::from_descriptors([model("declared", 1000, true)]);
        let ledger = CapacityLedger::new(8000, 0, catalog).unwrap();
        let allocator = Allocator::new(
            ledger,
            ProviderRegistry::new().with(adapter),
            Timeouts::default(),
        );

        let update = allocator.discover().await;
        assert_eq!(update, CatalogUpdate { added: 1, updated: 0 });
        let catalog = allocator.catalog().await;
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].estimated_footprint, 1000);
        assert!(catalog[0].pinned);
    }

    #[tokio::test]
    async fn test_warm_start_respects_probe_and_capacity() {
        let (allocator, adapter) = engine(
            5000,
            vec![model("a", 3000, false), model("b", 3000, false), model("gone", 100, false)],
        );
        adapter.preload("a");
        adapter.preload("b");

        let restored = allocator
            .warm_start(&[
                ModelKey::new("mem", "a"),
                ModelKey::new("mem", "b"),
                ModelKey::new("mem", "gone"),
                ModelKey::new("mem", "unknown"),
            ])
            .await;
        assert_eq!(restored, vec![ModelKey::new("mem", "a")]);
        assert_eq!(allocator.status().await.used_bytes, 3000);
        assert_eq!(adapter.load_calls(), 0);
    }

    #[tokio::test]
    async fn test_check_invariant_holds_after_mixed_operations() {
        let (allocator, _) = engine(
            6000,
            vec![model("a", 3000, false), model("b", 3000, false), model("c", 3000, false)],
        );
        let mut low = request("low", "a", 600);
        low.priority = Priority::Low;
        allocator.allocate(low).await.unwrap();
        allocator.allocate(request("n1", "b", 600)).await.unwrap();
        let mut critical = request("crit", "c", 600);
        critical.priority = Priority::Critical;
        allocator.allocate(critical).await.unwrap();

        assert!(allocator.check_invariant().await.is_ok());
        // One preemption covers the shortfall; the earliest-expiring holder goes
        assert!(allocator.allocation("low").await.is_none());
        assert!(allocator.allocation("n1").await.is_some());
        assert_eq!(allocator.status().await.used_bytes, 6000);
    }
}
