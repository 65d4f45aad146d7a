//! Control-plane HTTP API module.
//!
//! # Purpose
//! Exposes the collaborator endpoints served next to the gRPC gateway: the
//! policy webhook, policy status, and health.
pub mod error;
pub mod openapi;
pub mod policy;
pub mod system;
pub mod types;
