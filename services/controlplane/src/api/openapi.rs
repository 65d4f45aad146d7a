//! OpenAPI schema aggregation for the control-plane API.
//!
//! # Purpose
//! Collects the HTTP routes and schema types into a single OpenAPI document
//! served at `/v1/openapi.json`.
use crate::api::{
    policy, system,
    types::{ErrorResponse, HealthStatus, PolicyNotificationResponse, PolicyStatusResponse},
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "inspektor-controlplane",
        version = "v1",
        description = "Inspektor control plane HTTP API"
    ),
    paths(
        system::system_health,
        policy::policy_notification,
        policy::policy_status
    ),
    components(schemas(
        HealthStatus,
        ErrorResponse,
        PolicyNotificationResponse,
        PolicyStatusResponse
    )),
    tags(
        (name = "system", description = "Health endpoints"),
        (name = "policy", description = "Policy sync and distribution")
    )
)]
pub struct ApiDoc;
