//! The allocator: decides which model a requester gets and what has to leave the card for it.
//!
//! All mutable state (capacity ledger plus allocation table) sits behind one
//! `tokio::sync::Mutex`. Each placement round takes the lock, decides one step, and releases
//! it before talking to a provider, so adapter latency never blocks other requesters.
//! `try_reserve` is the point where concurrent allocators race; whoever reserves first owns
//! the load, and later callers for the same model wait for it to settle.
//!
//! ```text
//! allocate ─► filter + score ─► resident? ─────────────────────► grant
//!                                │ no
//!                                ▼
//!                           try_reserve ─ Reserved ─► load ─► commit + grant
//!                                │                     └ fail ─► rollback, next candidate
//!                                ├ InFlight ─► wait, retry
//!                                └ Insufficient ─► plan victims ─► unload ─► retry
//! ```
mod maintenance;
pub(crate) mod scoring;

pub use maintenance::{CatalogUpdate, PurgeReport};

use crate::allocation::{Allocation, AllocationRequest, AllocationTable, EndReason, EndedAllocation};
use crate::catalog::{ModelDescriptor, ModelKey};
use crate::errors::{AdapterError, AllocationError};
use crate::events::{EVENT_CHANNEL_CAPACITY, EngineEvent, UnloadCause};
use crate::ledger::{CapacityLedger, ReserveOutcome};
use crate::providers::{ProviderAdapter, ProviderRegistry};
use scoring::VictimPlan;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, broadcast, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Upper bound on placement rounds for one request
pub const MAX_PLACEMENT_ROUNDS: usize = 8;

/// Longest duration a single allocation may ask for
pub const MAX_ALLOCATION_DURATION: Duration = Duration::from_secs(30 * 24 * 3600);

/// Timeouts applied to every adapter call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub probe: Duration,
    /// Applies to load, unload and discovery
    pub load: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            probe: Duration::from_secs(3),
            load: Duration::from_secs(30),
        }
    }
}

/// The result of a successful allocation
#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    pub requester_id: String,
    pub model: ModelKey,
    /// Granted through the exhaustion fallback
    pub degraded: bool,
    pub expires_at: Instant,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub safety_margin_bytes: u64,
    pub reserved_bytes: u64,
    pub utilization: f64,
    pub resident: Vec<ModelDescriptor>,
    /// Sorted by requester id
    pub allocations: Vec<Allocation>,
    pub taken_at: Instant,
}

#[derive(Debug)]
pub(crate) struct EngineState {
    pub(crate) ledger: CapacityLedger,
    pub(crate) table: AllocationTable,
}

struct Inner {
    state: Mutex<EngineState>,
    registry: ProviderRegistry,
    timeouts: Timeouts,
    events: broadcast::Sender<EngineEvent>,
}

/// Handle to the allocation engine. Cheap to clone; all clones share state.
pub struct Allocator {
    inner: Arc<Inner>,
}

impl Clone for Allocator {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("registry", &self.inner.registry)
            .field("timeouts", &self.inner.timeouts)
            .finish()
    }
}

/// What one locked placement round decided
enum Step {
    Granted(Grant),
    Load(ModelKey),
    Wait(Arc<Notify>),
    Evict(VictimPlan),
    Exhausted,
}

/// Rolls back a reservation unless disarmed. Dropping an armed guard outside the engine lock
/// schedules the rollback on the runtime.
struct ReservationGuard {
    inner: Arc<Inner>,
    key: ModelKey,
    armed: bool,
}

impl ReservationGuard {
    fn new(inner: Arc<Inner>, key: ModelKey) -> Self {
        Self {
            inner,
            key,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    async fn rollback(mut self) {
        self.armed = false;
        let mut state = self.inner.state.lock().await;
        state.ledger.rollback(&self.key);
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let key = self.key.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let mut state = inner.state.lock().await;
                    if state.ledger.rollback(&key) {
                        debug!(model = %key, "Rolled back reservation of cancelled request");
                    }
                });
            }
            Err(_) => warn!(model = %key, "No runtime to roll back reservation"),
        }
    }
}

/// Run an adapter call under a timeout; a timeout is an error like any other
async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, AdapterError>>,
) -> Result<T, AdapterError> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(AdapterError::Timeout(limit)))
}

fn validate(request: &AllocationRequest) -> Result<(), AllocationError> {
    if request.requester_id.trim().is_empty() {
        return Err(AllocationError::InvalidRequest(
            "requester_id must not be empty".to_string(),
        ));
    }
    if request.estimated_duration.is_zero() {
        return Err(AllocationError::InvalidRequest(
            "estimated_duration must be positive".to_string(),
        ));
    }
    if request.estimated_duration > MAX_ALLOCATION_DURATION {
        return Err(AllocationError::InvalidRequest(format!(
            "estimated_duration may not exceed {} seconds",
            MAX_ALLOCATION_DURATION.as_secs()
        )));
    }
    Ok(())
}

impl Allocator {
    pub fn new(ledger: CapacityLedger, registry: ProviderRegistry, timeouts: Timeouts) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(EngineState {
                    ledger,
                    table: AllocationTable::new(),
                }),
                registry,
                timeouts,
                events,
            }),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.inner.registry
    }

    pub fn timeouts(&self) -> Timeouts {
        self.inner.timeouts
    }

    /// Receive every engine event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    fn adapter(&self, provider: &str) -> Result<Arc<dyn ProviderAdapter>, AllocationError> {
        self.inner
            .registry
            .get(provider)
            .ok_or_else(|| AllocationError::provider(provider, "no adapter registered"))
    }

    /// Grant a model to a requester, loading, evicting or preempting as needed.
    #[instrument(skip(self, request), fields(requester = %request.requester_id, priority = %request.priority))]
    pub async fn allocate(&self, request: AllocationRequest) -> Result<Grant, AllocationError> {
        validate(&request)?;
        self.prepare(&request).await?;

        let mut last_failure: Option<AllocationError> = None;
        let mut failed_loads: HashSet<ModelKey> = HashSet::new();
        let mut failed_unloads: HashSet<ModelKey> = HashSet::new();

        for round in 0..MAX_PLACEMENT_ROUNDS {
            let mut state = self.inner.state.lock().await;
            let step = self.plan_step(
                &mut state,
                &request,
                &failed_loads,
                &failed_unloads,
                &mut last_failure,
            );

            match step {
                Step::Granted(grant) => return Ok(grant),
                Step::Wait(notify) => {
                    // Register before unlocking so the settle notification cannot be missed
                    let settled = notify.notified();
                    tokio::pin!(settled);
                    settled.as_mut().enable();
                    drop(state);
                    debug!(round, "Waiting for in-flight load");
                    let _ = tokio::time::timeout(self.inner.timeouts.load, settled).await;
                }
                Step::Load(key) => {
                    let guard = ReservationGuard::new(Arc::clone(&self.inner), key.clone());
                    drop(state);
                    match self.load_and_grant(guard, &request).await {
                        Ok(grant) => return Ok(grant),
                        Err(e) => {
                            failed_loads.insert(key);
                            last_failure = Some(e);
                        }
                    }
                }
                Step::Evict(plan) => {
                    drop(state);
                    let this = self.clone();
                    // Runs detached so a cancelled caller cannot strand models mid-eviction
                    match tokio::spawn(async move { this.execute_plan(plan).await }).await {
                        Ok(Ok(())) => {}
                        Ok(Err((key, e))) => {
                            failed_unloads.insert(key);
                            last_failure = Some(e);
                        }
                        Err(e) => {
                            warn!(error = %e, "Eviction task failed");
                            last_failure = Some(AllocationError::exhausted(format!(
                                "eviction task failed: {e}"
                            )));
                        }
                    }
                }
                Step::Exhausted => break,
            }
        }

        self.degrade(&request, last_failure).await
    }

    /// Checks that run once per request, before placement: dependencies, the named model, and
    /// replacing the requester's previous allocation.
    async fn prepare(&self, request: &AllocationRequest) -> Result<(), AllocationError> {
        let mut state = self.inner.state.lock().await;

        if let Some(blocking) = request
            .depends_on
            .iter()
            .find(|id| state.table.get(id).is_some())
        {
            return Err(AllocationError::BlockedByDependency {
                requester_id: request.requester_id.clone(),
                blocking: blocking.clone(),
            });
        }

        if let Some(model_id) = &request.model_id {
            if !state
                .ledger
                .catalog()
                .iter()
                .any(|m| &m.model_id == model_id)
            {
                return Err(AllocationError::InvalidRequest(format!(
                    "unknown model '{model_id}'"
                )));
            }
        }

        if let Some(previous) =
            state
                .table
                .end(&request.requester_id, EndReason::Replaced, Instant::now())
        {
            debug!(model = %previous.model_key, "Replacing previous allocation");
            self.emit(EngineEvent::Ended {
                requester_id: previous.requester_id,
                model: previous.model_key,
                reason: EndReason::Replaced,
            });
        }
        Ok(())
    }

    fn plan_step(
        &self,
        state: &mut EngineState,
        request: &AllocationRequest,
        failed_loads: &HashSet<ModelKey>,
        failed_unloads: &HashSet<ModelKey>,
        last_failure: &mut Option<AllocationError>,
    ) -> Step {
        let now = Instant::now();
        let registry = &self.inner.registry;
        let candidates = scoring::rank_candidates(
            state.ledger.catalog(),
            request,
            |p| registry.contains(p),
            now,
        );
        if candidates.is_empty() && last_failure.is_none() {
            *last_failure = Some(AllocationError::exhausted(
                "no known model matches the request",
            ));
        }

        for candidate in candidates
            .into_iter()
            .filter(|c| !failed_loads.contains(&c.key))
        {
            if candidate.resident {
                debug!(model = %candidate.key, score = candidate.score, "Resident candidate");
                return Step::Granted(self.grant(state, request, candidate.key, false, now));
            }

            match state.ledger.try_reserve(&candidate.key, candidate.footprint) {
                ReserveOutcome::AlreadyResident => {
                    return Step::Granted(self.grant(state, request, candidate.key, false, now));
                }
                ReserveOutcome::Reserved => return Step::Load(candidate.key),
                ReserveOutcome::InFlight(notify) => return Step::Wait(notify),
                ReserveOutcome::Insufficient { shortfall } => {
                    match scoring::plan_victims(
                        &state.ledger,
                        &state.table,
                        &candidate.key,
                        request.priority,
                        shortfall,
                        failed_unloads,
                    ) {
                        Some(plan) => {
                            self.claim_victims(state, &plan, request, now);
                            return Step::Evict(plan);
                        }
                        None => {
                            debug!(model = %candidate.key, shortfall, "No eviction plan covers shortfall");
                            // A victim excluded after a failed unload keeps the provider error
                            if !matches!(
                                last_failure,
                                Some(AllocationError::ProviderUnavailable { .. })
                            ) {
                                *last_failure = Some(AllocationError::exhausted(format!(
                                    "{} needs {shortfall} more bytes than eviction can free",
                                    candidate.key
                                )));
                            }
                        }
                    }
                }
            }
        }
        Step::Exhausted
    }

    /// Mark the plan's victims as evicting and end the allocations it preempts
    fn claim_victims(
        &self,
        state: &mut EngineState,
        plan: &VictimPlan,
        request: &AllocationRequest,
        now: Instant,
    ) {
        for victim in &plan.victims {
            state.ledger.begin_eviction(&victim.key);
            for holder in &victim.preempt {
                let reason = EndReason::Preempted {
                    by: request.requester_id.clone(),
                };
                if let Some(ended) = state.table.end(holder, reason.clone(), now) {
                    info!(
                        preempted = %holder,
                        model = %victim.key,
                        held_priority = %ended.priority,
                        "Preempting allocation"
                    );
                    self.emit(EngineEvent::Ended {
                        requester_id: ended.requester_id,
                        model: ended.model_key,
                        reason,
                    });
                }
            }
        }
    }

    /// Unload victims one at a time. On the first failure the remaining victims are handed back.
    async fn execute_plan(&self, plan: VictimPlan) -> Result<(), (ModelKey, AllocationError)> {
        for (i, victim) in plan.victims.iter().enumerate() {
            let cause = if victim.preempt.is_empty() {
                UnloadCause::Evicted
            } else {
                UnloadCause::Preempted
            };
            if let Err(e) = self.unload_model(&victim.key, cause).await {
                let mut state = self.inner.state.lock().await;
                for rest in &plan.victims[i + 1..] {
                    state.ledger.abort_eviction(&rest.key);
                }
                return Err((victim.key.clone(), e));
            }
        }
        Ok(())
    }

    fn grant(
        &self,
        state: &mut EngineState,
        request: &AllocationRequest,
        key: ModelKey,
        degraded: bool,
        now: Instant,
    ) -> Grant {
        state.ledger.touch(&key, now);
        let expires_at = now + request.estimated_duration;
        state.table.insert(
            Allocation {
                requester_id: request.requester_id.clone(),
                model_key: key.clone(),
                priority: request.priority,
                role: request.role.clone(),
                task_type: request.task_type.clone(),
                granted_at: now,
                expires_at,
                degraded,
            },
            now,
        );
        info!(model = %key, degraded, "Allocation granted");
        self.emit(EngineEvent::Granted {
            requester_id: request.requester_id.clone(),
            model: key.clone(),
            degraded,
        });
        Grant {
            requester_id: request.requester_id.clone(),
            model: key,
            degraded,
            expires_at,
        }
    }

    async fn load_and_grant(
        &self,
        mut guard: ReservationGuard,
        request: &AllocationRequest,
    ) -> Result<Grant, AllocationError> {
        let key = guard.key.clone();
        match self.load_model(&key).await {
            Ok(()) => {
                let mut state = self.inner.state.lock().await;
                let now = Instant::now();
                guard.disarm();
                state.ledger.commit(&key, now)?;
                let footprint = state
                    .ledger
                    .catalog()
                    .get(&key)
                    .map(|m| m.estimated_footprint)
                    .unwrap_or_default();
                info!(model = %key, footprint, "Model loaded");
                self.emit(EngineEvent::Loaded {
                    model: key.clone(),
                    footprint,
                });
                Ok(self.grant(&mut state, request, key, false, now))
            }
            Err(e) => {
                warn!(model = %key, error = %e, "Load failed, trying next candidate");
                self.emit(EngineEvent::LoadFailed {
                    model: key,
                    error: e.to_string(),
                });
                guard.rollback().await;
                Err(e)
            }
        }
    }

    /// Call the adapter's load in a detached task. If the caller has gone away by the time the
    /// load succeeds, the model is unloaded again unless someone else now owns it.
    async fn load_model(&self, key: &ModelKey) -> Result<(), AllocationError> {
        let adapter = self.adapter(&key.provider)?;
        let limit = self.inner.timeouts.load;
        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let result = with_timeout(limit, adapter.load(&task_key.model_id)).await;
            if let Err(Ok(())) = tx.send(result) {
                discard_orphaned_load(inner, adapter, task_key, limit).await;
            }
        });

        match rx.await {
            Ok(result) => result.map_err(|e| AllocationError::provider(&key.provider, e)),
            Err(_) => Err(AllocationError::provider(
                &key.provider,
                "load task ended without a result",
            )),
        }
    }

    /// Unload a model already marked as evicting, then release it from the ledger. On failure
    /// the model stays resident.
    pub(crate) async fn unload_model(
        &self,
        key: &ModelKey,
        cause: UnloadCause,
    ) -> Result<(), AllocationError> {
        let result = match self.adapter(&key.provider) {
            Ok(adapter) => with_timeout(self.inner.timeouts.load, adapter.unload(&key.model_id))
                .await
                .map_err(|e| AllocationError::provider(&key.provider, e)),
            Err(e) => Err(e),
        };

        let mut state = self.inner.state.lock().await;
        match result {
            Ok(()) => {
                state.ledger.release(key);
                info!(model = %key, ?cause, "Model unloaded");
                self.emit(EngineEvent::Unloaded {
                    model: key.clone(),
                    cause,
                });
                Ok(())
            }
            Err(e) => {
                state.ledger.abort_eviction(key);
                warn!(model = %key, ?cause, error = %e, "Unload failed, model stays resident");
                self.emit(EngineEvent::UnloadFailed {
                    model: key.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Last resort once placement failed: the smallest resident responsive model the request
    /// accepts, flagged as degraded.
    async fn degrade(
        &self,
        request: &AllocationRequest,
        last_failure: Option<AllocationError>,
    ) -> Result<Grant, AllocationError> {
        let failure = last_failure
            .unwrap_or_else(|| AllocationError::exhausted("placement rounds exhausted"));
        if !request.allow_degraded || request.model_id.is_some() {
            return Err(failure);
        }

        let mut state = self.inner.state.lock().await;
        let registry = &self.inner.registry;
        let fallback = state
            .ledger
            .catalog()
            .resident()
            .filter(|m| {
                m.is_responsive()
                    && !m.is_evicting()
                    && scoring::accepts_provider(request, &m.provider, |p| registry.contains(p))
            })
            .min_by(|a, b| {
                a.estimated_footprint
                    .cmp(&b.estimated_footprint)
                    .then_with(|| a.key().cmp(&b.key()))
            })
            .map(|m| m.key());

        match fallback {
            Some(key) => {
                warn!(model = %key, error = %failure, "Granting degraded fallback");
                Ok(self.grant(&mut state, request, key, true, Instant::now()))
            }
            None => Err(failure),
        }
    }

    /// End a requester's allocation. Unknown ids return false. The model stays resident until
    /// the janitor reclaims it.
    pub async fn release(&self, requester_id: &str) -> bool {
        let mut state = self.inner.state.lock().await;
        match state
            .table
            .end(requester_id, EndReason::Released, Instant::now())
        {
            Some(ended) => {
                info!(requester = %requester_id, model = %ended.model_key, "Allocation released");
                self.emit(EngineEvent::Ended {
                    requester_id: ended.requester_id,
                    model: ended.model_key,
                    reason: EndReason::Released,
                });
                true
            }
            None => {
                debug!(requester = %requester_id, "Release of unknown requester");
                false
            }
        }
    }

    pub async fn status(&self) -> StatusReport {
        let state = self.inner.state.lock().await;
        let snapshot = state.ledger.snapshot();
        let mut allocations: Vec<Allocation> = state.table.iter().cloned().collect();
        allocations.sort_by(|a, b| a.requester_id.cmp(&b.requester_id));
        StatusReport {
            used_bytes: snapshot.used_bytes,
            max_bytes: snapshot.max_bytes,
            safety_margin_bytes: snapshot.safety_margin_bytes,
            reserved_bytes: snapshot.reserved_bytes,
            utilization: state.ledger.utilization(),
            resident: snapshot.resident,
            allocations,
            taken_at: Instant::now(),
        }
    }

    pub async fn allocation(&self, requester_id: &str) -> Option<Allocation> {
        self.inner.state.lock().await.table.get(requester_id).cloned()
    }

    /// Recently ended allocations, oldest first
    pub async fn recent_endings(&self) -> Vec<EndedAllocation> {
        self.inner
            .state
            .lock()
            .await
            .table
            .recent_endings()
            .cloned()
            .collect()
    }

    /// Every catalog entry, in key order
    pub async fn catalog(&self) -> Vec<ModelDescriptor> {
        self.inner
            .state
            .lock()
            .await
            .ledger
            .catalog()
            .iter()
            .cloned()
            .collect()
    }

    /// Pin or unpin a model. Returns false for unknown models.
    pub async fn set_pinned(&self, key: &ModelKey, pinned: bool) -> bool {
        let mut state = self.inner.state.lock().await;
        let found = state.ledger.set_pinned(key, pinned);
        if found {
            info!(model = %key, pinned, "Pin changed");
        }
        found
    }
}

async fn discard_orphaned_load(
    inner: Arc<Inner>,
    adapter: Arc<dyn ProviderAdapter>,
    key: ModelKey,
    limit: Duration,
) {
    {
        let state = inner.state.lock().await;
        let owned = state.ledger.is_reserved(&key)
            || state
                .ledger
                .catalog()
                .get(&key)
                .is_some_and(|m| m.is_resident());
        if owned {
            return;
        }
    }
    warn!(model = %key, "Requester went away during load, unloading");
    if let Err(e) = with_timeout(limit, adapter.unload(&key.model_id)).await {
        warn!(model = %key, error = %e, "Failed to unload orphaned model");
    }
}
