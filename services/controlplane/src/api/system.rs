//! Liveness probe for the control plane.
use crate::api::error::{ApiError, api_internal};
use crate::api::types::HealthStatus;
use crate::app::AppState;
use axum::Json;
use axum::extract::State;

/// Report whether the store answers and how the process is wired.
///
/// Policy sync being disabled is not a failure: agents then receive the empty
/// artifact.
#[utoipa::path(
    get,
    path = "/v1/system/health",
    tag = "system",
    responses(
        (status = 200, description = "Store reachable", body = HealthStatus),
        (status = 500, description = "Store unreachable", body = crate::api::types::ErrorResponse)
    )
)]
pub(crate) async fn system_health(
    State(state): State<AppState>,
) -> Result<Json<HealthStatus>, ApiError> {
    state
        .store
        .health_check()
        .await
        .map_err(|err| api_internal("storage unavailable", &err))?;
    Ok(Json(HealthStatus {
        status: "ok".to_string(),
        storage: state.store.backend_name().to_string(),
        durable: state.store.is_durable(),
        policy_sync: state.distributor.is_enabled(),
    }))
}
