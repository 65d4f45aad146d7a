//! HTTP error bodies for the collaborator API.
//!
//! Handlers return [`ApiError`] and rely on the `From` impls below, so store
//! and policy failures map to one status each. Details go to the log; the
//! response only carries a stable `code` and a generic `message`.
use crate::api::types::ErrorResponse;
use crate::policy::PolicyError;
use crate::store::StoreError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: &str) -> Self {
        Self {
            status,
            body: ErrorResponse {
                code: code.to_string(),
                message: message.to_string(),
                request_id: None,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// 500 for a store failure, logging the cause.
pub fn api_internal(message: &str, err: &StoreError) -> ApiError {
    tracing::error!(error = ?err, "controlplane storage error");
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => {
                ApiError::new(StatusCode::NOT_FOUND, "not_found", &format!("{what} not found"))
            }
            other => api_internal("storage error", &other),
        }
    }
}

impl From<PolicyError> for ApiError {
    fn from(err: PolicyError) -> Self {
        tracing::error!(error = %err, "policy pipeline error");
        match err {
            // The git host or the network is at fault, not us.
            PolicyError::SyncFailure(_) => ApiError::new(
                StatusCode::BAD_GATEWAY,
                "upstream_unavailable",
                "policy repository sync failed",
            ),
            PolicyError::BuildFailure(_) => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "policy build failed",
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_hide_cause() {
        let api: ApiError = StoreError::Unexpected(anyhow::anyhow!("pool timed out")).into();
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api.body.code, "internal");
        assert!(!api.body.message.contains("pool"));

        let missing: ApiError = StoreError::NotFound("data source".into()).into();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        assert_eq!(missing.body.message, "data source not found");
    }

    #[test]
    fn sync_failure_is_bad_gateway_and_build_failure_is_internal() {
        let sync: ApiError =
            PolicyError::SyncFailure("auth required for https://git.example/policy".into()).into();
        assert_eq!(sync.status, StatusCode::BAD_GATEWAY);
        assert_eq!(sync.body.code, "upstream_unavailable");
        assert!(!sync.body.message.contains("git.example"));

        let build: ApiError = PolicyError::BuildFailure("rego_parse_error".into()).into();
        assert_eq!(build.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!build.body.message.contains("rego"));
    }

    #[tokio::test]
    async fn response_body_is_error_json() {
        let response = ApiError::new(StatusCode::BAD_GATEWAY, "upstream_unavailable", "down")
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let body: ErrorResponse = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body.code, "upstream_unavailable");
        assert_eq!(body.message, "down");
    }
}
