//! Allocation requests, active grants and the table that holds them
use crate::catalog::ModelKey;
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// How many ended allocations are kept for inspection
pub const ENDED_HISTORY_LEN: usize = 256;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Multiplier applied to a candidate's score
    pub fn multiplier(&self) -> f64 {
        match self {
            Priority::Low => 0.5,
            Priority::Normal => 1.0,
            Priority::High => 1.5,
            Priority::Critical => 2.0,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

fn default_true() -> bool {
    true
}

/// A request for a model, consumed by one call to the allocator.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct AllocationRequest {
    /// Caller-chosen identity; a second request from the same id replaces the first.
    #[builder(into)]
    pub requester_id: String,
    /// Free-form role, matched against a model's role affinity
    #[serde(default)]
    #[builder(into, default)]
    pub role: String,
    #[serde(default)]
    #[builder(into, default)]
    pub task_type: String,
    #[serde(default)]
    #[builder(default)]
    pub priority: Priority,
    #[serde(rename = "estimated_duration_secs", with = "duration_secs")]
    pub estimated_duration: Duration,
    #[serde(default)]
    #[builder(default)]
    pub preferred_providers: Vec<String>,
    #[serde(default)]
    #[builder(default)]
    pub required_tags: BTreeSet<String>,
    /// Restrict the request to one specific model id
    #[serde(default)]
    #[builder(into)]
    pub model_id: Option<String>,
    /// Requesters that must have released their allocations before this one may proceed
    #[serde(default)]
    #[builder(default)]
    pub depends_on: Vec<String>,
    /// Accept the smallest resident model when nothing else can be placed
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub allow_degraded: bool,
}

/// An active grant of a model to a requester
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub requester_id: String,
    pub model_key: ModelKey,
    pub priority: Priority,
    pub role: String,
    pub task_type: String,
    pub granted_at: Instant,
    pub expires_at: Instant,
    /// Granted through the exhaustion fallback rather than the scored candidate
    pub degraded: bool,
}

impl Allocation {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Why an allocation left the table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum EndReason {
    Released,
    Expired,
    /// Forcibly released to make room for a higher-priority request
    Preempted { by: String },
    /// Its model was unloaded by an emergency purge
    Purged,
    /// The same requester asked again
    Replaced,
}

#[derive(Debug, Clone)]
pub struct EndedAllocation {
    pub allocation: Allocation,
    pub reason: EndReason,
    pub ended_at: Instant,
}

/// Active allocations keyed by requester id, plus a bounded history of ended ones.
#[derive(Debug, Default)]
pub struct AllocationTable {
    active: HashMap<String, Allocation>,
    ended: VecDeque<EndedAllocation>,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, requester_id: &str) -> Option<&Allocation> {
        self.active.get(requester_id)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Allocation> {
        self.active.values()
    }

    /// Insert a grant. The caller is expected to have ended any previous grant for the same
    /// requester first; if not, it is recorded as replaced.
    pub fn insert(&mut self, allocation: Allocation, now: Instant) {
        if let Some(previous) = self.active.insert(allocation.requester_id.clone(), allocation) {
            self.record(previous, EndReason::Replaced, now);
        }
    }

    /// Remove a requester's allocation, recording why.
    pub fn end(&mut self, requester_id: &str, reason: EndReason, now: Instant) -> Option<Allocation> {
        let allocation = self.active.remove(requester_id)?;
        self.record(allocation.clone(), reason, now);
        Some(allocation)
    }

    /// Remove every allocation past its expiry.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<Allocation> {
        let expired: Vec<String> = self
            .active
            .values()
            .filter(|a| a.is_expired(now))
            .map(|a| a.requester_id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| self.end(id, EndReason::Expired, now))
            .collect()
    }

    pub fn referencing<'a>(&'a self, key: &'a ModelKey) -> impl Iterator<Item = &'a Allocation> + 'a {
        self.active.values().filter(move |a| &a.model_key == key)
    }

    pub fn is_referenced(&self, key: &ModelKey) -> bool {
        self.referencing(key).next().is_some()
    }

    pub fn recent_endings(&self) -> impl Iterator<Item = &EndedAllocation> {
        self.ended.iter()
    }

    fn record(&mut self, allocation: Allocation, reason: EndReason, now: Instant) {
        if self.ended.len() == ENDED_HISTORY_LEN {
            self.ended.pop_front();
        }
        self.ended.push_back(EndedAllocation {
            allocation,
            reason,
            ended_at: now,
        });
    }
}
