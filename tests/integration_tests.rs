//! End-to-end engine scenarios
//!
//! These drive the allocator and janitor together against in-memory providers and check the
//! capacity properties that must hold across whole request sequences.

use std::sync::Arc;
use std::time::Duration;
use vramkeeper::allocation::{AllocationRequest, Priority};
use vramkeeper::allocator::{Allocator, Timeouts};
use vramkeeper::catalog::{Catalog, ModelDescriptor, ModelKey};
use vramkeeper::errors::AllocationError;
use vramkeeper::janitor::{Janitor, JanitorConfig};
use vramkeeper::ledger::CapacityLedger;
use vramkeeper::providers::memory::Operation;
use vramkeeper::providers::{InMemoryAdapter, ProviderRegistry};

fn model(id: &str, footprint: u64) -> ModelDescriptor {
    ModelDescriptor::builder()
        .provider("gpu")
        .model_id(id)
        .estimated_footprint(footprint)
        .build()
}

fn pinned(id: &str, footprint: u64) -> ModelDescriptor {
    ModelDescriptor::builder()
        .provider("gpu")
        .model_id(id)
        .estimated_footprint(footprint)
        .pinned(true)
        .build()
}

fn engine(max: u64, margin: u64, models: Vec<ModelDescriptor>) -> (Allocator, Arc<InMemoryAdapter>) {
    let adapter = Arc::new(InMemoryAdapter::new("gpu", Vec::new()));
    let ledger = CapacityLedger::new(max, margin, Catalog::from_descriptors(models)).unwrap();
    let registry = ProviderRegistry::new().with(adapter.clone());
    (Allocator::new(ledger, registry, Timeouts::default()), adapter)
}

fn wants(requester: &str, model_id: &str) -> AllocationRequest {
    AllocationRequest::builder()
        .requester_id(requester)
        .model_id(model_id)
        .estimated_duration(Duration::from_secs(600))
        .build()
}

fn key(model_id: &str) -> ModelKey {
    ModelKey::new("gpu", model_id)
}

#[tokio::test]
async fn test_pinned_model_blocks_then_unpin_allows_eviction() {
    let (allocator, adapter) = engine(8000, 0, vec![model("m1", 4500), model("m2", 4500)]);

    allocator.allocate(wants("a", "m1")).await.unwrap();
    allocator.release("a").await;
    assert_eq!(allocator.status().await.used_bytes, 4500);
    assert!(allocator.set_pinned(&key("m1"), true).await);

    match allocator.allocate(wants("b", "m2")).await {
        Err(AllocationError::ResourceExhausted { .. }) => {}
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert!(adapter.is_loaded("m1"));

    assert!(allocator.set_pinned(&key("m1"), false).await);
    let grant = allocator.allocate(wants("b", "m2")).await.unwrap();
    assert_eq!(grant.model, key("m2"));

    let status = allocator.status().await;
    assert_eq!(status.used_bytes, 4500);
    let resident: Vec<ModelKey> = status.resident.iter().map(|m| m.key()).collect();
    assert_eq!(resident, vec![key("m2")]);
    assert!(!adapter.is_loaded("m1"));
}

#[tokio::test]
async fn test_janitor_purges_above_threshold_despite_allocations() {
    let (allocator, adapter) = engine(
        10_000,
        0,
        vec![pinned("base", 1000), model("m1", 5000), model("m2", 3600)],
    );
    for (requester, id) in [("a", "base"), ("b", "m1"), ("c", "m2")] {
        allocator.allocate(wants(requester, id)).await.unwrap();
    }
    assert!(allocator.utilization().await > 0.95);

    let janitor = Janitor::new(allocator.clone(), JanitorConfig::default());
    let report = janitor.tick().await;

    let purge = report.purge.expect("purge should have run");
    assert_eq!(purge.unloaded.len(), 2);
    assert!(!purge.unloaded.contains(&key("base")));
    assert!(adapter.is_loaded("base"));

    let status = allocator.status().await;
    assert_eq!(status.used_bytes, 1000);
    assert_eq!(status.allocations.len(), 1);
    assert_eq!(status.allocations[0].requester_id, "a");
}

#[tokio::test]
async fn test_pinned_only_resident_survives_purge() {
    let (allocator, adapter) = engine(1000, 0, vec![pinned("only", 1000)]);
    allocator.allocate(wants("a", "only")).await.unwrap();

    let report = allocator.emergency_purge().await;
    assert!(report.unloaded.is_empty());
    assert!(adapter.is_loaded("only"));
    assert_eq!(allocator.status().await.used_bytes, 1000);
}

#[tokio::test(start_paused = true)]
async fn test_least_recently_used_model_evicted_first() {
    let (allocator, adapter) = engine(
        8000,
        0,
        vec![model("a", 3000), model("b", 3000), model("c", 3000)],
    );

    allocator.allocate(wants("r1", "a")).await.unwrap();
    allocator.release("r1").await;
    tokio::time::advance(Duration::from_secs(9 * 60)).await;

    allocator.allocate(wants("r2", "b")).await.unwrap();
    allocator.release("r2").await;
    tokio::time::advance(Duration::from_secs(60)).await;

    allocator.allocate(wants("r3", "c")).await.unwrap();
    assert!(!adapter.is_loaded("a"));
    assert!(adapter.is_loaded("b"));
    assert_eq!(allocator.status().await.used_bytes, 6000);
}

#[tokio::test]
async fn test_release_unknown_is_idempotent() {
    let (allocator, _) = engine(8000, 0, vec![model("m1", 1000)]);
    assert!(!allocator.release("unknown").await);
    assert!(!allocator.release("unknown").await);

    allocator.allocate(wants("a", "m1")).await.unwrap();
    assert!(allocator.release("a").await);
    assert!(!allocator.release("a").await);
}

#[tokio::test]
async fn test_same_model_twice_counts_once() {
    let (allocator, adapter) = engine(8000, 0, vec![model("m1", 4500)]);
    allocator.allocate(wants("a", "m1")).await.unwrap();
    let before = allocator.status().await.used_bytes;
    allocator.allocate(wants("b", "m1")).await.unwrap();

    assert_eq!(allocator.status().await.used_bytes, before);
    assert_eq!(adapter.load_calls(), 1);
}

#[tokio::test]
async fn test_critical_preempts_low_and_low_cannot_return() {
    let (allocator, _) = engine(8000, 0, vec![model("low", 6000), model("crit", 6000)]);

    let mut low = wants("low-agent", "low");
    low.priority = Priority::Low;
    allocator.allocate(low.clone()).await.unwrap();

    let mut critical = wants("crit-agent", "crit");
    critical.priority = Priority::Critical;
    allocator.allocate(critical).await.unwrap();
    assert!(allocator.allocation("low-agent").await.is_none());

    match allocator.allocate(low).await {
        Err(AllocationError::ResourceExhausted { .. }) => {}
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert!(allocator.allocation("crit-agent").await.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocations_never_exceed_limit() {
    let models: Vec<ModelDescriptor> = (0..6).map(|i| model(&format!("m{i}"), 2500)).collect();
    let (allocator, adapter) = engine(8000, 500, models);
    adapter.set_latency(Operation::Load, Duration::from_millis(5));
    adapter.set_latency(Operation::Unload, Duration::from_millis(5));

    let mut tasks = Vec::new();
    for i in 0..24 {
        let allocator = allocator.clone();
        tasks.push(tokio::spawn(async move {
            let requester = format!("r{i}");
            let result = allocator
                .allocate(wants(&requester, &format!("m{}", i % 6)))
                .await;
            if i % 2 == 0 {
                allocator.release(&requester).await;
            }
            result.is_ok()
        }));
    }

    let observer = {
        let allocator = allocator.clone();
        tokio::spawn(async move {
            for _ in 0..50 {
                let status = allocator.status().await;
                assert!(status.used_bytes <= status.max_bytes - status.safety_margin_bytes);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    let granted = futures_util::future::join_all(tasks)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(true)))
        .count();
    observer.await.unwrap();

    assert!(granted > 0);
    assert!(allocator.check_invariant().await.is_ok());
    let status = allocator.status().await;
    assert!(status.used_bytes <= 7500);
    assert_eq!(status.reserved_bytes, 0);
}

#[tokio::test]
async fn test_http_surface_preempts_and_reports() {
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::{Value, json};
    use vramkeeper::{AppState, build_router};

    let (allocator, _) = engine(8000, 0, vec![model("small", 6000), model("large", 6000)]);
    let server = TestServer::new(build_router(AppState::new(allocator.clone()))).unwrap();

    let response = server
        .post("/v1/allocations")
        .json(&json!({
            "requester_id": "batch",
            "model_id": "small",
            "priority": "low",
            "estimated_duration_secs": 3600
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let response = server
        .post("/v1/allocations")
        .json(&json!({
            "requester_id": "oncall",
            "model_id": "large",
            "priority": "critical",
            "estimated_duration_secs": 60
        }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let status: Value = server.get("/v1/status").await.json();
    assert_eq!(status["used_bytes"], 6000);
    assert_eq!(status["allocations"].as_array().unwrap().len(), 1);
    assert_eq!(status["allocations"][0]["requester_id"], "oncall");
    assert_eq!(status["resident"][0]["model_id"], "large");
}
