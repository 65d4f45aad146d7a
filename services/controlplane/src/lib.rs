//! Inspektor control-plane library crate.
//!
//! # Purpose
//! Exposes the policy pipeline, credential broker, RPC gateway, HTTP surface,
//! configuration, and storage implementations for use by the binary and tests.
//!
//! # Notes
//! Components are plain values wired together by the binary; nothing here
//! relies on process-global state beyond the observability setup.
pub mod api;
pub mod app;
pub mod config;
pub mod credentials;
pub mod error;
pub mod integration;
pub mod model;
pub mod observability;
pub mod policy;
pub mod roles;
pub mod rpc;
pub mod seed;
pub mod store;
