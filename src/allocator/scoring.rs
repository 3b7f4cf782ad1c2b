//! Candidate selection and victim planning.
//!
//! Everything here is a pure function of the engine state, called with the engine lock held.
use crate::allocation::{AllocationRequest, AllocationTable, Priority};
use crate::catalog::{Catalog, ModelDescriptor, ModelKey};
use crate::ledger::CapacityLedger;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

const BASE_SCORE: f64 = 1.0;
const RESIDENT_BONUS: f64 = 30.0;
const PROVIDER_RANK_BONUS: f64 = 10.0;
const RECENT_USE_BONUS: f64 = 20.0;
const RECENT_USE_WINDOW: Duration = Duration::from_secs(3600);

/// A model that passed the request's filters, with its score
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Candidate {
    pub key: ModelKey,
    pub footprint: u64,
    pub resident: bool,
    pub score: f64,
}

/// Whether the request accepts models from `provider`. An empty preference list accepts every
/// registered provider.
pub(crate) fn accepts_provider(
    request: &AllocationRequest,
    provider: &str,
    is_registered: impl Fn(&str) -> bool,
) -> bool {
    is_registered(provider)
        && (request.preferred_providers.is_empty()
            || request.preferred_providers.iter().any(|p| p == provider))
}

fn matches(
    model: &ModelDescriptor,
    request: &AllocationRequest,
    is_registered: &impl Fn(&str) -> bool,
) -> bool {
    if !accepts_provider(request, &model.provider, is_registered) {
        return false;
    }
    if let Some(model_id) = &request.model_id {
        if &model.model_id != model_id {
            return false;
        }
    }
    let tags_ok = if request.required_tags.is_empty() {
        model.is_general_purpose()
    } else {
        !model.capability_tags.is_disjoint(&request.required_tags)
    };
    tags_ok && model.serves_role(&request.role) && model.is_responsive() && !model.is_evicting()
}

pub(crate) fn score(model: &ModelDescriptor, request: &AllocationRequest, now: Instant) -> f64 {
    let mut score = BASE_SCORE;
    if model.is_resident() {
        score += RESIDENT_BONUS;
    }
    let n = request.preferred_providers.len();
    if let Some(rank) = request
        .preferred_providers
        .iter()
        .position(|p| p == &model.provider)
    {
        score += PROVIDER_RANK_BONUS * (n - rank) as f64;
    }
    if model
        .last_used()
        .is_some_and(|at| now.saturating_duration_since(at) <= RECENT_USE_WINDOW)
    {
        score += RECENT_USE_BONUS;
    }
    score * request.priority.multiplier()
}

/// Filter and rank the catalog for a request, best candidate first.
pub(crate) fn rank_candidates(
    catalog: &Catalog,
    request: &AllocationRequest,
    is_registered: impl Fn(&str) -> bool,
    now: Instant,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = catalog
        .iter()
        .filter(|m| matches(m, request, &is_registered))
        .map(|m| Candidate {
            key: m.key(),
            footprint: m.estimated_footprint,
            resident: m.is_resident(),
            score: score(m, request, now),
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.key.model_id.cmp(&b.key.model_id))
            .then_with(|| a.key.provider.cmp(&b.key.provider))
    });
    trace!(requester = %request.requester_id, ?candidates, "Ranked candidates");
    candidates
}

/// One model to unload, and the allocations that must be preempted first
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Victim {
    pub key: ModelKey,
    pub footprint: u64,
    /// Requester ids whose allocations end as preempted
    pub preempt: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct VictimPlan {
    pub victims: Vec<Victim>,
    pub freed: u64,
}

fn cmp_last_used(a: &ModelDescriptor, b: &ModelDescriptor) -> Ordering {
    // Never-used sorts first
    a.last_used()
        .cmp(&b.last_used())
        .then_with(|| a.key().cmp(&b.key()))
}

/// Choose models to unload so that `shortfall` bytes become free for `candidate`.
///
/// Unreferenced models go first, least recently used first. If they are not enough, models
/// whose allocations are all of lower priority than `priority` are added, earliest expiry
/// first. Returns `None` unless the plan covers the whole shortfall.
pub(crate) fn plan_victims(
    ledger: &CapacityLedger,
    table: &AllocationTable,
    candidate: &ModelKey,
    priority: Priority,
    shortfall: u64,
    exclude: &HashSet<ModelKey>,
) -> Option<VictimPlan> {
    let evictable = |m: &&ModelDescriptor| {
        m.is_resident()
            && !m.pinned
            && !m.is_evicting()
            && m.estimated_footprint > 0
            && &m.key() != candidate
            && !exclude.contains(&m.key())
    };

    let mut idle: Vec<&ModelDescriptor> = ledger
        .catalog()
        .iter()
        .filter(evictable)
        .filter(|m| !table.is_referenced(&m.key()))
        .collect();
    idle.sort_by(|a, b| cmp_last_used(a, b));

    let mut plan = VictimPlan {
        victims: Vec::new(),
        freed: 0,
    };
    for model in idle {
        if plan.freed >= shortfall {
            break;
        }
        plan.freed += model.estimated_footprint;
        plan.victims.push(Victim {
            key: model.key(),
            footprint: model.estimated_footprint,
            preempt: Vec::new(),
        });
    }
    if plan.freed >= shortfall {
        return Some(plan);
    }

    let mut preemptable: Vec<(Instant, &ModelDescriptor, Vec<String>)> = ledger
        .catalog()
        .iter()
        .filter(evictable)
        .filter_map(|m| {
            let key = m.key();
            let holders: Vec<_> = table.referencing(&key).collect();
            if holders.is_empty() || holders.iter().any(|a| a.priority >= priority) {
                return None;
            }
            let earliest = holders.iter().map(|a| a.expires_at).min()?;
            let mut ids: Vec<String> = holders.iter().map(|a| a.requester_id.clone()).collect();
            ids.sort();
            Some((earliest, m, ids))
        })
        .collect();
    preemptable.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.key().cmp(&b.1.key())));

    for (_, model, preempt) in preemptable {
        if plan.freed >= shortfall {
            break;
        }
        plan.freed += model.estimated_footprint;
        plan.victims.push(Victim {
            key: model.key(),
            footprint: model.estimated_footprint,
            preempt,
        });
    }

    (plan.freed >= shortfall).then_some(plan)
}
