//! Policy pipeline: git sync, compile to wasm, and fan-out to dataplane agents.
//!
//! # Purpose
//! [`repository`] keeps a local checkout of the policy source in step with its
//! remote, [`compiler`] turns that checkout into a single wasm artifact, and
//! [`distributor`] caches the artifact and notifies every open policy stream
//! when it changes.
//!
//! # Error model
//! Clone/pull failures are [`PolicyError::SyncFailure`]; toolchain and bundle
//! failures are [`PolicyError::BuildFailure`]. Neither replaces the cached
//! artifact or notifies subscribers.
use thiserror::Error;

pub mod compiler;
pub mod distributor;
pub mod repository;

pub use compiler::{OpaCompiler, PolicyCompiler};
pub use distributor::{PolicyDistributor, PolicyStatus, PolicySubscription};
pub use repository::{GitRepository, PolicyRepository};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("policy build failed: {0}")]
    BuildFailure(String),
    #[error("policy sync failed: {0}")]
    SyncFailure(String),
}

pub type PolicyResult<T> = Result<T, PolicyError>;
