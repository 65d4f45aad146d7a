//! Logging, tracing, and metrics for the control plane.
//!
//! # Purpose
//! Installs the `tracing` subscriber (env filter, fmt, optional OTLP export),
//! the W3C trace-context propagator, and the Prometheus recorder. Callers reach
//! the control plane two ways, so the caller's trace context is read either
//! from HTTP headers (policy webhook) or from gRPC metadata (dataplane agents).
//!
//! # Notes
//! Everything here is process-global. Setup runs once per process; later calls
//! hand back the same metrics handle so tests can call it freely.
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::propagation::Extractor;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tonic::metadata::{KeyRef, MetadataMap};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Filter used when `RUST_LOG` is unset. sqlx logs every statement at info.
const DEFAULT_LOG_FILTER: &str = "info,sqlx=warn";

/// Env var -> OpenTelemetry resource key, read once at startup.
const RESOURCE_ENV: &[(&str, &str)] = &[
    ("K8S_CLUSTER_NAME", "k8s.cluster.name"),
    ("K8S_NAMESPACE_NAME", "k8s.namespace.name"),
    ("K8S_POD_NAME", "k8s.pod.name"),
    ("CLOUD_REGION", "cloud.region"),
    ("DEPLOYMENT_ENVIRONMENT", "deployment.environment"),
];

enum MetricKind {
    Counter,
    Gauge,
}

/// Every metric the control plane emits.
const METRICS: &[(&str, MetricKind, &str)] = &[
    (
        "inspektor_policy_subscribers",
        MetricKind::Gauge,
        "Dataplane agents currently subscribed to policy updates",
    ),
    (
        "inspektor_policy_notifications_dropped_total",
        MetricKind::Counter,
        "Policy notifications dropped because a subscriber already had one pending",
    ),
    (
        "inspektor_policy_resync_total",
        MetricKind::Counter,
        "Policy repository resyncs by outcome",
    ),
    (
        "inspektor_policy_build_total",
        MetricKind::Counter,
        "Policy artifact builds by outcome",
    ),
    (
        "inspektor_auth_requests_total",
        MetricKind::Counter,
        "Dataplane credential checks by outcome",
    ),
    (
        "inspektor_sessions_created_total",
        MetricKind::Counter,
        "Sessions created by kind",
    ),
    (
        "inspektor_sessions_expired_purged_total",
        MetricKind::Counter,
        "Expired temporary sessions removed by the sweeper",
    ),
];

static TRACING_INIT: OnceLock<()> = OnceLock::new();
static PROPAGATOR_INIT: OnceLock<()> = OnceLock::new();
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install logging, tracing, and the metrics recorder, returning the handle
/// that renders `/metrics`.
pub fn init_observability(service_name: &str) -> PrometheusHandle {
    TRACING_INIT.get_or_init(|| {
        install_propagator();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
        let registry = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer());
        // Without an OTLP endpoint the exporter fails to build and spans stay local.
        match build_tracer_provider(service_name) {
            Some(provider) => {
                let tracer = provider.tracer(service_name.to_string());
                global::set_tracer_provider(provider);
                let _ = registry
                    .with(tracing_opentelemetry::layer().with_tracer(tracer))
                    .try_init();
            }
            None => {
                let _ = registry.try_init();
            }
        }
    });
    metrics_handle()
}

fn install_propagator() {
    PROPAGATOR_INIT.get_or_init(|| {
        global::set_text_map_propagator(TraceContextPropagator::new());
    });
}

fn build_tracer_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()
        .ok()?;
    let resource = Resource::builder_empty()
        .with_attributes(resource_attributes(service_name))
        .build();
    Some(
        SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build(),
    )
}

fn resource_attributes(service_name: &str) -> Vec<KeyValue> {
    let mut attrs = vec![KeyValue::new("service.name", service_name.to_string())];
    let instance = std::env::var("INSPEKTOR_SERVICE_INSTANCE_ID")
        .or_else(|_| std::env::var("HOSTNAME"));
    if let Ok(instance) = instance {
        attrs.push(KeyValue::new("service.instance.id", instance));
    }
    attrs.extend(RESOURCE_ENV.iter().filter_map(|(var, key)| {
        std::env::var(var)
            .ok()
            .map(|value| KeyValue::new(*key, value))
    }));
    attrs
}

/// Trace context sent by a webhook caller.
pub fn trace_context_from_headers(headers: &axum::http::HeaderMap) -> opentelemetry::Context {
    install_propagator();
    global::get_text_map_propagator(|prop| prop.extract(&HeaderCarrier(headers)))
}

/// Trace context sent by a dataplane agent in gRPC metadata.
pub fn trace_context_from_metadata(metadata: &MetadataMap) -> opentelemetry::Context {
    install_propagator();
    global::get_text_map_propagator(|prop| prop.extract(&MetadataCarrier(metadata)))
}

struct HeaderCarrier<'a>(&'a axum::http::HeaderMap);

impl Extractor for HeaderCarrier<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect()
    }
}

struct MetadataCarrier<'a>(&'a MetadataMap);

impl Extractor for MetadataCarrier<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    // Binary (`-bin`) keys never carry trace context.
    fn keys(&self) -> Vec<&str> {
        self.0
            .keys()
            .filter_map(|key| match key {
                KeyRef::Ascii(key) => Some(key.as_str()),
                KeyRef::Binary(_) => None,
            })
            .collect()
    }
}

fn metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let handle = match PrometheusBuilder::new().install_recorder() {
                Ok(handle) => handle,
                Err(err) => {
                    // Some other recorder is global; render from a detached one.
                    tracing::warn!(error = %err, "metrics recorder already installed");
                    PrometheusBuilder::new().build_recorder().handle()
                }
            };
            describe_metrics();
            handle
        })
        .clone()
}

fn describe_metrics() {
    for (name, kind, help) in METRICS {
        match kind {
            MetricKind::Counter => metrics::describe_counter!(*name, *help),
            MetricKind::Gauge => metrics::describe_gauge!(*name, *help),
        }
    }
}

/// Serve `/metrics` on `addr` until the process exits.
pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics listening");
    serve_metrics_on(listener, handle, std::future::pending()).await
}

async fn serve_metrics_on<F>(
    listener: tokio::net::TcpListener,
    handle: PrometheusHandle,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
}
