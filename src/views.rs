//! JSON bodies returned by the control surface.
//!
//! Engine types carry monotonic instants, which mean nothing to a client. These views turn
//! them into durations relative to when the response was built.
use crate::allocation::{Allocation, Priority};
use crate::allocator::{Grant, StatusReport};
use crate::catalog::ModelDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::time::Instant;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GrantResponse {
    pub requester_id: String,
    pub model: String,
    pub provider: String,
    pub degraded: bool,
    pub expires_in_secs: f64,
}

impl GrantResponse {
    pub fn from_grant(grant: Grant, now: Instant) -> Self {
        Self {
            requester_id: grant.requester_id,
            model: grant.model.model_id,
            provider: grant.model.provider,
            degraded: grant.degraded,
            expires_in_secs: grant
                .expires_at
                .saturating_duration_since(now)
                .as_secs_f64(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelView {
    pub provider: String,
    pub model_id: String,
    pub estimated_footprint: u64,
    pub capability_tags: BTreeSet<String>,
    pub roles: BTreeSet<String>,
    pub pinned: bool,
    pub resident: bool,
    pub responsive: bool,
    pub evicting: bool,
    /// Seconds since last use; absent if never used
    pub idle_secs: Option<f64>,
}

impl ModelView {
    pub fn from_descriptor(model: &ModelDescriptor, now: Instant) -> Self {
        Self {
            provider: model.provider.clone(),
            model_id: model.model_id.clone(),
            estimated_footprint: model.estimated_footprint,
            capability_tags: model.capability_tags.clone(),
            roles: model.roles.clone(),
            pinned: model.pinned,
            resident: model.is_resident(),
            responsive: model.is_responsive(),
            evicting: model.is_evicting(),
            idle_secs: model
                .last_used()
                .map(|at| now.saturating_duration_since(at).as_secs_f64()),
        }
    }
}

/// The `/v1/models` body, shaped like an OpenAI model list
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ListModelResponse {
    /// Always "list"
    pub object: String,
    pub data: Vec<ModelView>,
}

impl ListModelResponse {
    pub fn from_catalog(models: &[ModelDescriptor], now: Instant) -> Self {
        Self {
            object: "list".into(),
            data: models
                .iter()
                .map(|m| ModelView::from_descriptor(m, now))
                .collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AllocationView {
    pub requester_id: String,
    pub provider: String,
    pub model_id: String,
    pub priority: Priority,
    pub role: String,
    pub task_type: String,
    pub degraded: bool,
    pub expires_in_secs: f64,
}

impl AllocationView {
    pub fn from_allocation(allocation: &Allocation, now: Instant) -> Self {
        Self {
            requester_id: allocation.requester_id.clone(),
            provider: allocation.model_key.provider.clone(),
            model_id: allocation.model_key.model_id.clone(),
            priority: allocation.priority,
            role: allocation.role.clone(),
            task_type: allocation.task_type.clone(),
            degraded: allocation.degraded,
            expires_in_secs: allocation.remaining(now).as_secs_f64(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusResponse {
    pub used_bytes: u64,
    pub max_bytes: u64,
    pub safety_margin_bytes: u64,
    pub reserved_bytes: u64,
    pub utilization: f64,
    pub resident: Vec<ModelView>,
    pub allocations: Vec<AllocationView>,
}

impl From<StatusReport> for StatusResponse {
    fn from(report: StatusReport) -> Self {
        let now = report.taken_at;
        Self {
            used_bytes: report.used_bytes,
            max_bytes: report.max_bytes,
            safety_margin_bytes: report.safety_margin_bytes,
            reserved_bytes: report.reserved_bytes,
            utilization: report.utilization,
            resident: report
                .resident
                .iter()
                .map(|m| ModelView::from_descriptor(m, now))
                .collect(),
            allocations: report
                .allocations
                .iter()
                .map(|a| AllocationView::from_allocation(a, now))
                .collect(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReleaseResponse {
    pub released: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PinRequest {
    pub provider: String,
    pub model_id: String,
    pub pinned: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelKey;
    use std::time::Duration;

    #[test]
    fn test_grant_response_flattens_key() {
        let now = Instant::now();
        let grant = Grant {
            requester_id: "agent-1".to_string(),
            model: ModelKey::new("ollama", "llama3:8b"),
            degraded: false,
            expires_at: now + Duration::from_secs(90),
        };
        let body = GrantResponse::from_grant(grant, now);
        assert_eq!(body.model, "llama3:8b");
        assert_eq!(body.provider, "ollama");
        assert_eq!(body.expires_in_secs, 90.0);
    }

    #[test]
    fn test_model_view_of_unused_model() {
        let model = ModelDescriptor::builder()
            .provider("vllm")
            .model_id("qwen")
            .estimated_footprint(16)
            .build();
        let view = ModelView::from_descriptor(&model, Instant::now());
        assert!(view.idle_secs.is_none());
        assert!(!view.resident);
        assert!(view.responsive);
    }
}
