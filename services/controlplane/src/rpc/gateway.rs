//! gRPC handlers served to dataplane agents.
//!
//! # Purpose
//! Implements the generated `Inspektor` service: credential checks for relayed
//! database logins, the policy stream, and the caller's data source name.
//!
//! # Policy stream lifecycle
//! A stream subscribes before sending its first artifact, so a resync that
//! lands between the two still wakes it. The task then waits on either a
//! notification or the client going away, and drops its subscription on every
//! exit path.
use super::auth::caller_data_source;
use super::proto::{AuthRequest, AuthResponse, DataSourceResponse, Empty, Inspektor, InspektorPolicy};
use crate::credentials::CredentialBroker;
use crate::error::{ControlPlaneError, ControlPlaneResult};
use crate::model::{DataSource, ObjectRef, SessionKind};
use crate::policy::PolicyDistributor;
use crate::roles::RoleStore;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::Instrument;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Roles and expiry resolved for one database login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAccess {
    pub roles: Vec<String>,
    pub expires_at: i64,
    pub passthrough: bool,
}

#[derive(Clone)]
pub struct AuthGateway {
    broker: CredentialBroker,
    roles: RoleStore,
    distributor: PolicyDistributor,
}

impl AuthGateway {
    pub fn new(broker: CredentialBroker, roles: RoleStore, distributor: PolicyDistributor) -> Self {
        Self {
            broker,
            roles,
            distributor,
        }
    }

    /// Resolve the roles a login against `data_source` is entitled to.
    ///
    /// A temporary grant answers with its own role override and expiry; a
    /// permanent session answers with the owning user's roles and expiry 0.
    ///
    /// # Errors
    /// - `Unauthenticated` if no session matches or the grant has expired.
    pub async fn authenticate(
        &self,
        data_source: &DataSource,
        username: &str,
        password: &str,
    ) -> ControlPlaneResult<ResolvedAccess> {
        let result = self.resolve(data_source, username, password).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(ControlPlaneError::Unauthenticated(_)) => "rejected",
            Err(_) => "error",
        };
        metrics::counter!("inspektor_auth_requests_total", "kind" => "session", "outcome" => outcome)
            .increment(1);
        result
    }

    async fn resolve(
        &self,
        data_source: &DataSource,
        username: &str,
        password: &str,
    ) -> ControlPlaneResult<ResolvedAccess> {
        let session = match self
            .broker
            .resolve_credential(data_source.id, username, password)
            .await
        {
            Ok(session) => session,
            Err(ControlPlaneError::NotFound(_)) => {
                tracing::debug!(data_source = %data_source.name, "no session for credential");
                return Err(ControlPlaneError::Unauthenticated(
                    "invalid credentials".to_string(),
                ));
            }
            Err(err) => return Err(err),
        };

        match session.kind() {
            SessionKind::Temporary => {
                if self.broker.is_expired(&session) {
                    tracing::debug!(session_id = session.id, "temporary grant expired");
                    return Err(ControlPlaneError::Unauthenticated(
                        "session expired".to_string(),
                    ));
                }
                Ok(ResolvedAccess {
                    roles: session.meta.temp_roles,
                    expires_at: session.meta.expires_at,
                    passthrough: session.meta.passthrough,
                })
            }
            SessionKind::Permanent => {
                let Some(user_id) = session.user_id else {
                    tracing::warn!(session_id = session.id, "permanent session has no owner");
                    return Err(ControlPlaneError::Unauthenticated(
                        "invalid credentials".to_string(),
                    ));
                };
                let roles = self.roles.roles_for(ObjectRef::user(user_id)).await?;
                Ok(ResolvedAccess {
                    roles,
                    expires_at: 0,
                    passthrough: session.meta.passthrough,
                })
            }
        }
    }
}

#[tonic::async_trait]
impl Inspektor for AuthGateway {
    async fn auth(&self, request: Request<AuthRequest>) -> Result<Response<AuthResponse>, Status> {
        let data_source = caller_data_source(&request)?;
        let AuthRequest {
            user_name,
            password,
        } = request.into_inner();
        let access = self
            .authenticate(&data_source, &user_name, &password)
            .await?;
        Ok(Response::new(AuthResponse {
            roles: access.roles,
            expires_at: access.expires_at,
            passthrough: access.passthrough,
        }))
    }

    type PolicyStream = ReceiverStream<Result<InspektorPolicy, Status>>;

    async fn policy(&self, request: Request<Empty>) -> Result<Response<Self::PolicyStream>, Status> {
        let data_source = caller_data_source(&request)?;
        let span = tracing::info_span!("policy.stream", data_source = %data_source.name);
        span.set_parent(crate::observability::trace_context_from_metadata(
            request.metadata(),
        ));
        let mut subscription = self.distributor.subscribe();
        let first = self
            .distributor
            .latest_artifact()
            .await
            .map_err(ControlPlaneError::from)?;

        let (tx, rx) = mpsc::channel(1);
        let distributor = self.distributor.clone();
        let stream_task = async move {
            tracing::info!(subscriber_id = %subscription.id(), "policy stream opened");
            let mut next = Some(first);
            loop {
                if let Some(artifact) = next.take() {
                    let message = InspektorPolicy {
                        wasm_byte_code: artifact,
                    };
                    if tx.send(Ok(message)).await.is_err() {
                        break;
                    }
                }
                tokio::select! {
                    _ = tx.closed() => break,
                    notified = subscription.recv() => {
                        if notified.is_none() {
                            break;
                        }
                        match distributor.latest_artifact().await {
                            Ok(artifact) => next = Some(artifact),
                            Err(err) => {
                                tracing::error!(error = %err, "policy artifact unavailable");
                                let _ = tx.send(Err(Status::internal("policy unavailable"))).await;
                                break;
                            }
                        }
                    }
                }
            }
            tracing::info!("policy stream closed");
            drop(subscription);
        };
        tokio::spawn(stream_task.instrument(span));

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_data_source(
        &self,
        request: Request<Empty>,
    ) -> Result<Response<DataSourceResponse>, Status> {
        let data_source = caller_data_source(&request)?;
        Ok(Response::new(DataSourceResponse {
            data_source_name: data_source.name,
        }))
    }
}
