//! gRPC surface for dataplane agents.
//!
//! # Purpose
//! Serves the `api.Inspektor` service behind [`auth::DataplaneAuth`], so every
//! handler in [`gateway`] runs with an authenticated data source.
pub mod auth;
pub mod gateway;
pub mod proto;

use crate::store::InspektorStore;
use auth::DataplaneAuthLayer;
use gateway::AuthGateway;
use proto::InspektorServer;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tower::Layer;

/// Serve the gateway on `listener` until `shutdown` resolves.
pub async fn serve_grpc<F>(
    listener: TcpListener,
    gateway: AuthGateway,
    store: Arc<dyn InspektorStore>,
    shutdown: F,
) -> Result<(), tonic::transport::Error>
where
    F: Future<Output = ()> + Send,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "gRPC listening");
    }
    let service = DataplaneAuthLayer::new(store).layer(InspektorServer::new(gateway));
    tonic::transport::Server::builder()
        .trace_fn(|request| {
            let parent = crate::observability::trace_context_from_headers(request.headers());
            let span = tracing::info_span!("grpc.request", path = %request.uri().path());
            tracing_opentelemetry::OpenTelemetrySpanExt::set_parent(&span, parent);
            span
        })
        .add_service(service)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
}
