//! JSON bodies of the collaborator HTTP API.
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct HealthStatus {
    pub status: String,
    /// `memory` or `postgres`.
    pub storage: String,
    /// False when sessions and roles are lost on restart.
    pub durable: bool,
    /// Whether a policy repository is configured.
    pub policy_sync: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone, PartialEq, Eq)]
pub struct PolicyStatusResponse {
    pub enabled: bool,
    pub repo_url: Option<String>,
    pub commit: Option<String>,
    /// Number of open policy streams.
    pub subscribers: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, Clone)]
pub struct PolicyNotificationResponse {
    /// False when no repository is configured and nothing was pulled.
    pub synced: bool,
}

/// Error body; `message` never carries upstream or storage detail.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
}
