#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use controlplane::app::AppState;
use controlplane::credentials::{CredentialBroker, ManualClock};
use controlplane::model::{DataSource, NewDataSource};
use controlplane::policy::{
    GitRepository, PolicyCompiler, PolicyDistributor, PolicyError, PolicyRepository,
};
use controlplane::roles::RoleStore;
use controlplane::rpc::gateway::AuthGateway;
use controlplane::rpc::proto::InspektorClient;
use controlplane::store::InspektorStore;
use controlplane::store::memory::InMemoryStore;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const SIDECAR_TOKEN: &str = "db1-sidecar-token";

pub async fn read_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

/// Repository stand-in that never touches git.
#[derive(Default)]
pub struct StaticRepository {
    pub fail_pull: AtomicBool,
    pub pulls: AtomicUsize,
    path: PathBuf,
}

#[async_trait]
impl PolicyRepository for StaticRepository {
    async fn init(&self) -> Result<(), PolicyError> {
        Ok(())
    }

    async fn pull(&self) -> Result<(), PolicyError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(PolicyError::SyncFailure("could not read from remote".into()));
        }
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn local_path(&self) -> &Path {
        &self.path
    }

    fn remote_url(&self) -> Option<&str> {
        Some("https://git.example.com/acme/policies.git")
    }

    async fn head_commit(&self) -> Option<String> {
        Some(format!("{:040x}", self.pulls.load(Ordering::SeqCst)))
    }
}

/// Compiler stand-in producing `wasm-N` for the Nth build.
#[derive(Default)]
pub struct CountingCompiler {
    pub fail: AtomicBool,
    pub builds: AtomicUsize,
}

#[async_trait]
impl PolicyCompiler for CountingCompiler {
    async fn compile(&self, _source: &Path) -> Result<Bytes, PolicyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PolicyError::BuildFailure("1 error occurred: rego_parse_error".into()));
        }
        let n = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Bytes::from(format!("wasm-{n}")))
    }
}

pub struct Harness {
    pub store: Arc<dyn InspektorStore>,
    pub clock: Arc<ManualClock>,
    pub broker: CredentialBroker,
    pub distributor: PolicyDistributor,
    pub gateway: AuthGateway,
    pub data_source: DataSource,
    _policy_dir: tempfile::TempDir,
}

impl Harness {
    /// Harness whose policy sync is disabled (no remote configured).
    pub async fn without_remote() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let repository = GitRepository::new(None, None, dir.path().join("policy"), "git");
        repository.init().await.expect("init");
        let distributor = PolicyDistributor::new(
            Arc::new(repository),
            Arc::new(CountingCompiler::default()),
        );
        Self::build(distributor, dir).await
    }

    pub async fn with_policy(
        repository: Arc<StaticRepository>,
        compiler: Arc<CountingCompiler>,
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        Self::build(PolicyDistributor::new(repository, compiler), dir).await
    }

    async fn build(distributor: PolicyDistributor, policy_dir: tempfile::TempDir) -> Self {
        let store: Arc<dyn InspektorStore> = Arc::new(InMemoryStore::new());
        let data_source = store
            .create_data_source(
                NewDataSource {
                    name: "db1".to_string(),
                    kind: "postgres".to_string(),
                    sidecar_token: SIDECAR_TOKEN.to_string(),
                    hostname: "db1.internal:5432".to_string(),
                },
                &["dev".to_string()],
            )
            .await
            .expect("data source");
        let clock = Arc::new(ManualClock::new(1_700_000_000_000_000_000));
        let roles = RoleStore::new(store.clone());
        let broker = CredentialBroker::new(store.clone(), roles.clone(), clock.clone());
        let gateway = AuthGateway::new(broker.clone(), roles, distributor.clone());
        Self {
            store,
            clock,
            broker,
            distributor,
            gateway,
            data_source,
            _policy_dir: policy_dir,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            store: self.store.clone(),
            distributor: self.distributor.clone(),
        }
    }

    /// Serve the gateway on an ephemeral port.
    pub async fn serve(&self) -> GrpcServer {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(controlplane::rpc::serve_grpc(
            listener,
            self.gateway.clone(),
            self.store.clone(),
            async move {
                let _ = stopped.await;
            },
        ));
        GrpcServer {
            addr,
            stop: Some(stop),
            task,
        }
    }
}

pub struct GrpcServer {
    pub addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl GrpcServer {
    pub async fn client(&self) -> InspektorClient<tonic::transport::Channel> {
        let endpoint = format!("http://{}", self.addr);
        for _ in 0..50 {
            if let Ok(client) = InspektorClient::connect(endpoint.clone()).await {
                return client;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("gRPC server at {endpoint} never accepted connections");
    }

    pub fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.task.abort();
    }
}

/// Attach the sidecar token the way a dataplane agent does.
pub fn with_token<T>(message: T, token: &str) -> tonic::Request<T> {
    let mut request = tonic::Request::new(message);
    request
        .metadata_mut()
        .insert("auth-token", token.parse().expect("metadata"));
    request
}
