//! HTTP surface served next to the gRPC gateway.
//!
//! Only collaborators talk to this port: the git host delivering policy push
//! webhooks, probes, and operators reading policy status. Dataplane agents use
//! gRPC exclusively.
use crate::api;
use crate::api::openapi::ApiDoc;
use crate::observability;
use crate::policy::PolicyDistributor;
use crate::store::InspektorStore;
use axum::body::Body;
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;
use utoipa::OpenApi;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn InspektorStore>,
    pub distributor: PolicyDistributor,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .nest("/v1/policy", policy_routes())
        .route("/v1/system/health", get(api::system::system_health))
        .route("/v1/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state)
}

fn policy_routes() -> Router<AppState> {
    Router::new()
        .route("/notification", post(api::policy::policy_notification))
        .route("/status", get(api::policy::policy_status))
}

// Webhook deliveries may carry the git host's trace context.
fn request_span(request: &Request<Body>) -> Span {
    let span = tracing::info_span!(
        "http.request",
        method = %request.method(),
        path = %request.uri().path(),
    );
    span.set_parent(observability::trace_context_from_headers(request.headers()));
    span
}
