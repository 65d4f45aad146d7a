//! Domain errors shared by the role store, credential broker, and RPC gateway.
//!
//! # Purpose
//! Collapses storage and policy failures into the small set of kinds callers act
//! on, and maps them onto `tonic::Status` at the RPC boundary.
//!
//! # Security notes
//! `Internal` and `Policy` carry detail for logs only; the status sent to a
//! dataplane agent has a generic message.
use crate::policy::PolicyError;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Internal(anyhow::Error),
}

pub type ControlPlaneResult<T> = Result<T, ControlPlaneError>;

impl From<StoreError> for ControlPlaneError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ControlPlaneError::NotFound(what),
            StoreError::Conflict(what) => ControlPlaneError::AlreadyExists(what),
            StoreError::Unexpected(err) => ControlPlaneError::Internal(err),
        }
    }
}

impl From<ControlPlaneError> for tonic::Status {
    fn from(err: ControlPlaneError) -> Self {
        match err {
            ControlPlaneError::NotFound(what) => tonic::Status::not_found(what),
            ControlPlaneError::AlreadyExists(what) => tonic::Status::already_exists(what),
            ControlPlaneError::Unauthenticated(what) => tonic::Status::unauthenticated(what),
            ControlPlaneError::PermissionDenied(what) => tonic::Status::permission_denied(what),
            ControlPlaneError::InvalidArgument(what) => tonic::Status::invalid_argument(what),
            ControlPlaneError::Policy(err) => {
                tracing::error!(error = %err, "policy error");
                tonic::Status::internal("policy unavailable")
            }
            ControlPlaneError::Internal(err) => {
                tracing::error!(error = ?err, "internal error");
                tonic::Status::internal("internal error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn store_errors_map_to_domain_kinds() {
        let err: ControlPlaneError = StoreError::Conflict("session exists".into()).into();
        assert!(matches!(err, ControlPlaneError::AlreadyExists(_)));
        let err: ControlPlaneError = StoreError::NotFound("user".into()).into();
        assert!(matches!(err, ControlPlaneError::NotFound(_)));
    }

    #[test]
    fn status_codes_follow_error_kind() {
        let cases = [
            (ControlPlaneError::NotFound("x".into()), Code::NotFound),
            (ControlPlaneError::AlreadyExists("x".into()), Code::AlreadyExists),
            (ControlPlaneError::Unauthenticated("x".into()), Code::Unauthenticated),
            (ControlPlaneError::PermissionDenied("x".into()), Code::PermissionDenied),
            (ControlPlaneError::InvalidArgument("x".into()), Code::InvalidArgument),
        ];
        for (err, code) in cases {
            assert_eq!(tonic::Status::from(err).code(), code);
        }
    }

    #[test]
    fn internal_detail_is_not_sent_to_callers() {
        let err = ControlPlaneError::Internal(anyhow::anyhow!("connection refused to 10.0.0.5"));
        let status = tonic::Status::from(err);
        assert_eq!(status.code(), Code::Internal);
        assert!(!status.message().contains("10.0.0.5"));

        let err = ControlPlaneError::Policy(PolicyError::BuildFailure("opa exited 1".into()));
        let status = tonic::Status::from(err);
        assert_eq!(status.code(), Code::Internal);
        assert!(!status.message().contains("opa"));
    }
}
