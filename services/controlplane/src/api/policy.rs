//! Policy webhook and status handlers.
//!
//! # Purpose and responsibility
//! Lets the policy repository host (or an operator) trigger a resync, and
//! reports which commit the control plane is currently distributing.
use crate::api::error::ApiError;
use crate::api::types::{PolicyNotificationResponse, PolicyStatusResponse};
use crate::app::AppState;
use axum::Json;
use axum::extract::State;

#[utoipa::path(
    post,
    path = "/v1/policy/notification",
    tag = "policy",
    responses(
        (status = 200, description = "Policy synced and subscribers notified", body = PolicyNotificationResponse),
        (status = 500, description = "Policy build failed", body = crate::api::types::ErrorResponse),
        (status = 502, description = "Policy repository sync failed", body = crate::api::types::ErrorResponse)
    )
)]
/// Pull the policy repository, rebuild, and fan out to open policy streams.
///
/// # Errors
/// - 502 when the repository pull fails; the previous checkout stays in place.
/// - 500 when compilation fails; subscribers keep the last good artifact.
pub(crate) async fn policy_notification(
    State(state): State<AppState>,
) -> Result<Json<PolicyNotificationResponse>, ApiError> {
    state.distributor.resync().await?;
    Ok(Json(PolicyNotificationResponse {
        synced: state.distributor.is_enabled(),
    }))
}

#[utoipa::path(
    get,
    path = "/v1/policy/status",
    tag = "policy",
    responses(
        (status = 200, description = "Current policy source", body = PolicyStatusResponse)
    )
)]
pub(crate) async fn policy_status(State(state): State<AppState>) -> Json<PolicyStatusResponse> {
    let status = state.distributor.status().await;
    Json(PolicyStatusResponse {
        enabled: status.enabled,
        repo_url: status.repo_url,
        commit: status.commit,
        subscribers: state.distributor.subscriber_count(),
    })
}
