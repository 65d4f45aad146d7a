//! Storage boundary for the control plane.
//!
//! # Purpose
//! Declares the repository trait used by the role store, credential broker, and
//! RPC gateway, plus the storage error type every backend maps into.
//!
//! # Notes
//! Each access pattern gets its own method with typed arguments; backends never
//! accept free-form filter clauses.
use crate::model::{DataSource, NewDataSource, NewSession, ObjectRef, ObjectType, Session, User, UserMeta};
use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod postgres;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".into()),
            other => StoreError::Unexpected(other.into()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Unexpected(err.into())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Unexpected(err.into())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait InspektorStore: Send + Sync {
    async fn create_user(
        &self,
        name: &str,
        password_hash: &str,
        meta: UserMeta,
    ) -> StoreResult<User>;
    async fn get_user(&self, id: i64) -> StoreResult<User>;
    async fn get_user_by_name(&self, name: &str) -> StoreResult<User>;
    async fn list_users(&self) -> StoreResult<Vec<User>>;

    /// Insert a data source and attach `roles` plus `admin` in one unit of work.
    async fn create_data_source(
        &self,
        data_source: NewDataSource,
        roles: &[String],
    ) -> StoreResult<DataSource>;
    async fn get_data_source(&self, id: i64) -> StoreResult<DataSource>;
    async fn get_data_source_by_name(&self, name: &str) -> StoreResult<DataSource>;
    async fn get_data_source_by_token(&self, sidecar_token: &str) -> StoreResult<DataSource>;
    async fn list_data_sources(&self) -> StoreResult<Vec<DataSource>>;
    /// Delete a data source together with its sessions and role rows.
    async fn delete_data_source(&self, id: i64) -> StoreResult<()>;

    /// Insert role names that are not yet attached; existing names are kept.
    async fn insert_roles(&self, object: ObjectRef, names: &[String]) -> StoreResult<()>;
    async fn roles_for_object(&self, object: ObjectRef) -> StoreResult<Vec<String>>;
    /// Replace the full role set of `object` atomically.
    async fn replace_roles(&self, object: ObjectRef, names: &[String]) -> StoreResult<()>;
    async fn object_ids_for_roles(
        &self,
        object_type: ObjectType,
        names: &[String],
    ) -> StoreResult<Vec<i64>>;
    async fn distinct_role_names(&self) -> StoreResult<Vec<String>>;

    /// Check-then-insert for the (user, data source) pair in one transaction.
    ///
    /// Returns `StoreError::Conflict` when a session already exists for the pair.
    async fn create_permanent_session(&self, session: NewSession) -> StoreResult<Session>;
    async fn insert_session(&self, session: NewSession) -> StoreResult<Session>;
    async fn find_session_by_credential(
        &self,
        data_source_id: i64,
        username: &str,
        password: &str,
    ) -> StoreResult<Session>;
    async fn sessions_for_user(&self, user_id: i64) -> StoreResult<Vec<Session>>;
    async fn delete_session(&self, id: i64) -> StoreResult<()>;
    /// Delete temporary sessions whose deadline is at or before `now_nanos`.
    async fn delete_expired_sessions(&self, now_nanos: i64) -> StoreResult<u64>;

    async fn kv_get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn kv_set(&self, key: &str, value: &str) -> StoreResult<()>;
    /// Write `value` only if the current value equals `expected` (`None` = absent).
    async fn kv_compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> StoreResult<bool>;

    async fn health_check(&self) -> StoreResult<()>;
    fn is_durable(&self) -> bool;
    fn backend_name(&self) -> &'static str;
}

/// Role names with duplicates removed, first occurrence wins.
pub(crate) fn dedup_names(names: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    names
        .iter()
        .filter(|name| seen.insert(name.as_str()))
        .cloned()
        .collect()
}

/// Role names for a new data source: `admin` first, then the requested roles.
pub(crate) fn data_source_roles(roles: &[String]) -> Vec<String> {
    let mut names = Vec::with_capacity(roles.len() + 1);
    names.push("admin".to_string());
    names.extend(roles.iter().cloned());
    dedup_names(&names)
}
