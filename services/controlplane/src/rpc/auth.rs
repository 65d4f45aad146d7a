//! Dataplane authentication for every gRPC call.
//!
//! # Purpose
//! Wraps the generated server so the sidecar token is resolved to a
//! [`DataSource`] before any handler runs. The resolved data source is placed in
//! the request extensions, where handlers read it back through
//! [`caller_data_source`].
//!
//! # Security notes
//! - A missing, malformed, or unknown token is answered with `UNAUTHENTICATED`
//!   and the inner service is never called.
//! - The token value is never logged.
use crate::model::DataSource;
use crate::store::{InspektorStore, StoreError};
use std::sync::Arc;
use std::task::{Context, Poll};
use tonic::body::BoxBody;
use tonic::codegen::{BoxFuture, http};
use tonic::server::NamedService;
use tower::{Layer, Service};

/// Metadata key carrying the sidecar token.
pub const AUTH_TOKEN_HEADER: &str = "auth-token";

#[derive(Clone)]
pub struct DataplaneAuthLayer {
    store: Arc<dyn InspektorStore>,
}

impl DataplaneAuthLayer {
    pub fn new(store: Arc<dyn InspektorStore>) -> Self {
        Self { store }
    }
}

impl<S> Layer<S> for DataplaneAuthLayer {
    type Service = DataplaneAuth<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DataplaneAuth {
            inner,
            store: self.store.clone(),
        }
    }
}

#[derive(Clone)]
pub struct DataplaneAuth<S> {
    inner: S,
    store: Arc<dyn InspektorStore>,
}

impl<S> DataplaneAuth<S> {
    pub fn new(inner: S, store: Arc<dyn InspektorStore>) -> Self {
        Self { inner, store }
    }
}

impl<S: NamedService> NamedService for DataplaneAuth<S> {
    const NAME: &'static str = S::NAME;
}

impl<S, B> Service<http::Request<B>> for DataplaneAuth<S>
where
    S: Service<http::Request<B>, Response = http::Response<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = S::Error;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: http::Request<B>) -> Self::Future {
        // The ready clone stays with this call; `self` keeps a fresh one.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let store = self.store.clone();
        Box::pin(async move {
            let token = request
                .headers()
                .get(AUTH_TOKEN_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            match resolve_data_source(store.as_ref(), token.as_deref()).await {
                Ok(data_source) => {
                    request.extensions_mut().insert(data_source);
                    inner.call(request).await
                }
                Err(status) => Ok(status.into_http()),
            }
        })
    }
}

async fn resolve_data_source(
    store: &dyn InspektorStore,
    token: Option<&str>,
) -> Result<DataSource, tonic::Status> {
    let Some(token) = token.filter(|token| !token.is_empty()) else {
        metrics::counter!("inspektor_auth_requests_total", "kind" => "dataplane", "outcome" => "missing_token")
            .increment(1);
        return Err(tonic::Status::unauthenticated("missing auth-token"));
    };
    match store.get_data_source_by_token(token).await {
        Ok(data_source) => Ok(data_source),
        Err(StoreError::NotFound(_)) => {
            metrics::counter!("inspektor_auth_requests_total", "kind" => "dataplane", "outcome" => "rejected")
                .increment(1);
            tracing::warn!("dataplane presented an unknown sidecar token");
            Err(tonic::Status::unauthenticated("invalid auth-token"))
        }
        Err(err) => {
            tracing::error!(error = ?err, "sidecar token lookup failed");
            Err(tonic::Status::internal("internal error"))
        }
    }
}

/// Data source resolved for this call by [`DataplaneAuth`].
pub fn caller_data_source<T>(request: &tonic::Request<T>) -> Result<DataSource, tonic::Status> {
    request
        .extensions()
        .get::<DataSource>()
        .cloned()
        .ok_or_else(|| tonic::Status::unauthenticated("dataplane not authenticated"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewDataSource;
    use crate::store::memory::InMemoryStore;
    use std::convert::Infallible;
    use tower::ServiceExt;

    async fn store_with_agent() -> Arc<dyn InspektorStore> {
        let store = Arc::new(InMemoryStore::new());
        store
            .create_data_source(
                NewDataSource {
                    name: "db1".to_string(),
                    kind: "postgres".to_string(),
                    sidecar_token: "sidecar-secret".to_string(),
                    hostname: "db1.internal".to_string(),
                },
                &["dev".to_string()],
            )
            .await
            .expect("data source");
        store
    }

    /// Inner service that reports which data source reached it.
    #[derive(Clone)]
    struct EchoDataSource;

    impl Service<http::Request<()>> for EchoDataSource {
        type Response = http::Response<BoxBody>;
        type Error = Infallible;
        type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: http::Request<()>) -> Self::Future {
            let name = request
                .extensions()
                .get::<DataSource>()
                .map(|ds| ds.name.clone())
                .unwrap_or_default();
            let mut response = http::Response::new(tonic::body::empty_body());
            response
                .headers_mut()
                .insert("x-data-source", name.parse().expect("header"));
            std::future::ready(Ok(response))
        }
    }

    fn request_with_token(token: Option<&str>) -> http::Request<()> {
        let mut builder = http::Request::builder().uri("/api.Inspektor/GetDataSource");
        if let Some(token) = token {
            builder = builder.header(AUTH_TOKEN_HEADER, token);
        }
        builder.body(()).expect("request")
    }

    fn status_of(response: &http::Response<BoxBody>) -> Option<tonic::Code> {
        tonic::Status::from_header_map(response.headers()).map(|status| status.code())
    }

    #[tokio::test]
    async fn known_token_reaches_inner_service_with_data_source() {
        let store = store_with_agent().await;
        let service = DataplaneAuthLayer::new(store).layer(EchoDataSource);
        let response = service
            .oneshot(request_with_token(Some("sidecar-secret")))
            .await
            .expect("call");
        assert_eq!(
            response.headers().get("x-data-source").map(|v| v.as_bytes()),
            Some(&b"db1"[..])
        );
    }

    #[tokio::test]
    async fn unknown_or_missing_token_is_rejected() {
        let store = store_with_agent().await;
        for token in [Some("wrong"), Some(""), None] {
            let service = DataplaneAuth::new(EchoDataSource, store.clone());
            let response = service
                .oneshot(request_with_token(token))
                .await
                .expect("call");
            assert_eq!(status_of(&response), Some(tonic::Code::Unauthenticated));
            assert!(response.headers().get("x-data-source").is_none());
        }
    }

    #[test]
    fn handlers_without_extension_are_unauthenticated() {
        let request = tonic::Request::new(());
        let err = caller_data_source(&request).expect_err("no data source");
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }
}
