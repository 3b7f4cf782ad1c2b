//! Engine events, broadcast to subscribers such as the `/v1/events` stream
use crate::allocation::EndReason;
use crate::catalog::ModelKey;
use serde::Serialize;

/// Capacity of the broadcast channel. Slow subscribers lose the oldest events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Why a model was unloaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnloadCause {
    /// Made room for another model
    Evicted,
    /// Made room for a higher-priority request, ending its allocations
    Preempted,
    /// Unused for longer than the idle timeout
    Idle,
    /// Failed its responsiveness probe
    Unresponsive,
    /// Emergency purge
    Purged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Granted {
        requester_id: String,
        model: ModelKey,
        degraded: bool,
    },
    Ended {
        requester_id: String,
        model: ModelKey,
        #[serde(flatten)]
        reason: EndReason,
    },
    Loaded {
        model: ModelKey,
        footprint: u64,
    },
    LoadFailed {
        model: ModelKey,
        error: String,
    },
    Unloaded {
        model: ModelKey,
        cause: UnloadCause,
    },
    UnloadFailed {
        model: ModelKey,
        error: String,
    },
    EmergencyPurge {
        utilization: f64,
        unloaded: Vec<ModelKey>,
    },
    InvariantViolated {
        used: u64,
        limit: u64,
    },
    CatalogUpdated {
        added: usize,
        updated: usize,
    },
}
