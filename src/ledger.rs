//! Capacity ledger: the record of which models are resident and how much of the card they use.
//!
//! The ledger is plain data. It lives inside the allocator's single engine lock together with
//! the allocation table, so every method here runs inside that critical section. Usage is
//! derived from the resident set plus in-flight reservations rather than kept as a counter.
use crate::catalog::{Catalog, MergeOutcome, MergeSource, ModelDescriptor, ModelKey};
use crate::errors::AllocationError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// A capacity hold for a model whose load is in flight.
#[derive(Debug)]
struct Reservation {
    footprint: u64,
    /// Woken when the reservation is committed or rolled back
    settled: Arc<Notify>,
}

/// Result of [`CapacityLedger::try_reserve`]
#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    /// Capacity is now held for the model; the caller must commit or roll back.
    Reserved,
    /// The model is already resident; nothing to reserve.
    AlreadyResident,
    /// Another caller is loading this model. Wait on the notify and retry.
    InFlight(Arc<Notify>),
    /// Not enough free capacity.
    Insufficient { shortfall: u64 },
}

/// Point-in-time view of the ledger
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    pub used_bytes: u64,
    pub reserved_bytes: u64,
    pub max_bytes: u64,
    pub safety_margin_bytes: u64,
    pub resident: Vec<ModelDescriptor>,
}

#[derive(Debug)]
pub struct CapacityLedger {
    max_bytes: u64,
    safety_margin: u64,
    catalog: Catalog,
    reservations: HashMap<ModelKey, Reservation>,
}

impl CapacityLedger {
    pub fn new(max_bytes: u64, safety_margin: u64, catalog: Catalog) -> Result<Self, AllocationError> {
        if safety_margin > max_bytes {
            return Err(AllocationError::InvalidRequest(format!(
                "safety margin {safety_margin} exceeds capacity {max_bytes}"
            )));
        }
        Ok(Self {
            max_bytes,
            safety_margin,
            catalog,
            reservations: HashMap::new(),
        })
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn safety_margin(&self) -> u64 {
        self.safety_margin
    }

    /// The most the resident set plus reservations may ever occupy
    pub fn limit(&self) -> u64 {
        self.max_bytes - self.safety_margin
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn resident_bytes(&self) -> u64 {
        self.catalog
            .resident()
            .map(|m| m.estimated_footprint)
            .fold(0, u64::saturating_add)
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reservations
            .values()
            .map(|r| r.footprint)
            .fold(0, u64::saturating_add)
    }

    pub fn used_bytes(&self) -> u64 {
        self.resident_bytes().saturating_add(self.reserved_bytes())
    }

    pub fn available(&self) -> u64 {
        self.limit().saturating_sub(self.used_bytes())
    }

    /// Fraction of the physical capacity in use, reservations included
    pub fn utilization(&self) -> f64 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        self.used_bytes() as f64 / self.max_bytes as f64
    }

    pub fn is_reserved(&self, key: &ModelKey) -> bool {
        self.reservations.contains_key(key)
    }

    /// Check `used + footprint <= limit` and, if it holds, record a reservation.
    pub fn try_reserve(&mut self, key: &ModelKey, footprint: u64) -> ReserveOutcome {
        if self.catalog.get(key).is_some_and(|m| m.is_resident()) {
            return ReserveOutcome::AlreadyResident;
        }
        if let Some(existing) = self.reservations.get(key) {
            return ReserveOutcome::InFlight(Arc::clone(&existing.settled));
        }

        let used = self.used_bytes();
        let limit = self.limit();
        if used.checked_add(footprint).is_none_or(|total| total > limit) {
            let shortfall = used.saturating_add(footprint).saturating_sub(limit);
            trace!(model = %key, footprint, used, limit, shortfall, "Reservation refused");
            return ReserveOutcome::Insufficient { shortfall };
        }

        debug!(model = %key, footprint, used, limit, "Capacity reserved");
        self.reservations.insert(
            key.clone(),
            Reservation {
                footprint,
                settled: Arc::new(Notify::new()),
            },
        );
        ReserveOutcome::Reserved
    }

    /// Turn a reservation into residency. The footprint recorded for the model becomes the
    /// reserved amount so the derived usage is unchanged by the commit.
    pub fn commit(&mut self, key: &ModelKey, now: Instant) -> Result<(), AllocationError> {
        let reservation = self.reservations.remove(key).ok_or_else(|| {
            AllocationError::InvalidRequest(format!("no reservation held for {key}"))
        })?;
        let Some(model) = self.catalog.get_mut(key) else {
            reservation.settled.notify_waiters();
            return Err(AllocationError::InvalidRequest(format!("unknown model {key}")));
        };
        model.estimated_footprint = reservation.footprint;
        model.set_resident(true);
        model.set_responsive(true);
        model.set_last_used(now);
        reservation.settled.notify_waiters();
        debug!(model = %key, footprint = reservation.footprint, "Residency committed");
        Ok(())
    }

    /// Drop an uncommitted reservation. Returns false if there was none.
    pub fn rollback(&mut self, key: &ModelKey) -> bool {
        match self.reservations.remove(key) {
            Some(reservation) => {
                reservation.settled.notify_waiters();
                debug!(model = %key, "Reservation rolled back");
                true
            }
            None => false,
        }
    }

    /// Mark a model as no longer resident. Idempotent.
    pub fn release(&mut self, key: &ModelKey) -> bool {
        match self.catalog.get_mut(key) {
            Some(model) if model.is_resident() => {
                model.set_resident(false);
                // The last probe says nothing about the next load
                model.set_responsive(true);
                debug!(model = %key, "Residency released");
                true
            }
            _ => false,
        }
    }

    pub fn touch(&mut self, key: &ModelKey, now: Instant) {
        if let Some(model) = self.catalog.get_mut(key) {
            model.set_last_used(now);
        }
    }

    pub fn set_responsive(&mut self, key: &ModelKey, responsive: bool) {
        if let Some(model) = self.catalog.get_mut(key) {
            model.set_responsive(responsive);
        }
    }

    /// Flag a resident model as having an unload in flight. Returns false if the model is not
    /// resident or is already being evicted.
    pub fn begin_eviction(&mut self, key: &ModelKey) -> bool {
        match self.catalog.get_mut(key) {
            Some(model) if model.is_resident() && !model.is_evicting() => {
                model.set_evicting(true);
                true
            }
            _ => false,
        }
    }

    /// Clear the eviction flag after a failed unload; the model stays resident.
    pub fn abort_eviction(&mut self, key: &ModelKey) {
        if let Some(model) = self.catalog.get_mut(key) {
            model.set_evicting(false);
        }
    }

    pub fn set_pinned(&mut self, key: &ModelKey, pinned: bool) -> bool {
        match self.catalog.get_mut(key) {
            Some(model) => {
                model.pinned = pinned;
                true
            }
            None => false,
        }
    }

    /// Merge a descriptor into the catalog. A footprint that could never fit under the limit
    /// is refused and leaves the catalog unchanged.
    pub fn merge(&mut self, descriptor: ModelDescriptor, source: MergeSource) -> MergeOutcome {
        if descriptor.estimated_footprint > self.limit() {
            warn!(
                model = %descriptor.key(),
                footprint = descriptor.estimated_footprint,
                limit = self.limit(),
                "Ignoring model larger than capacity"
            );
            return MergeOutcome::Unchanged;
        }
        let frozen = self.reservations.contains_key(&descriptor.key());
        self.catalog.merge(descriptor, source, frozen)
    }

    pub fn check_invariant(&self) -> Result<(), AllocationError> {
        let used = self.used_bytes();
        let limit = self.limit();
        if used > limit {
            return Err(AllocationError::InvariantViolation { used, limit });
        }
        Ok(())
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            used_bytes: self.used_bytes(),
            reserved_bytes: self.reserved_bytes(),
            max_bytes: self.max_bytes,
            safety_margin_bytes: self.safety_margin,
            resident: self.catalog.resident().cloned().collect(),
        }
    }
}
