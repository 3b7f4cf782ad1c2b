//! vramkeeper - VRAM-constrained model allocation engine
//!
//! Decides which inference models are resident on a GPU with a fixed memory budget, shared by
//! competing requesters across several providers (Ollama, vLLM, LM Studio). The library holds
//! the engine; the binary wraps it in a small HTTP control surface.

use axum::Router;
use axum::routing::{delete, get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use tracing::{info, instrument};

pub mod allocation;
pub mod allocator;
pub mod catalog;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod janitor;
pub mod ledger;
pub mod providers;
pub mod settings;
pub mod snapshot;
pub mod views;

use allocator::Allocator;

/// State shared by every handler
#[derive(Clone, Debug)]
pub struct AppState {
    pub allocator: Allocator,
}

impl AppState {
    pub fn new(allocator: Allocator) -> Self {
        Self { allocator }
    }
}

/// Build the control surface router
/// This creates routes for:
/// - `POST /v1/allocations` - Request a model
/// - `DELETE /v1/allocations/{requester_id}` - Release an allocation
/// - `GET /v1/status` - Ledger usage, resident models and active allocations
/// - `GET /v1/models` - The whole catalog
/// - `POST /v1/pins` - Pin or unpin a model
/// - `GET /v1/events` - Engine events as server-sent events
#[instrument(skip(state))]
pub fn build_router(state: AppState) -> Router {
    info!("Building router");
    Router::new()
        .route("/v1/allocations", post(handlers::allocate))
        .route("/v1/allocations/{requester_id}", delete(handlers::release))
        .route("/v1/status", get(handlers::status))
        .route("/v1/models", get(handlers::models))
        .route("/v1/pins", post(handlers::set_pin))
        .route("/v1/events", get(handlers::events))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// `prefix` is applied to every metric name; it must live for the whole program.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}
