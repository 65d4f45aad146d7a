//! In-memory implementation of the control-plane store.
//!
//! # Purpose
//! This store implements [`InspektorStore`] entirely in memory using `HashMap`s guarded by
//! `tokio::sync::RwLock`. It exists for:
//! - local development and tests (no external dependencies)
//! - single-node deployments where losing credentials on restart is acceptable
//!
//! # Durability and consistency
//! - **Not durable**: all state is lost on process restart.
//! - **Single-process consistency**: each operation holds the lock of every map it reads or writes
//!   for its whole duration, which gives the same atomicity as a storage-level transaction.
//! - Lock order is always users → data sources → roles → sessions → kv to avoid deadlocks.
//!
//! # Session uniqueness
//! `create_permanent_session` checks for an existing (user, data source) pair and inserts the new
//! row under one sessions write lock, so concurrent callers cannot both succeed.
use super::{InspektorStore, StoreError, StoreResult, data_source_roles, dedup_names};
use crate::model::{
    DataSource, NewDataSource, NewSession, ObjectRef, ObjectType, Role, Session, SessionKind, User,
    UserMeta,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;

/// In-memory control-plane store.
///
/// All maps are wrapped in `Arc<RwLock<...>>` so reads can proceed concurrently
/// and writes are serialized. `BTreeMap` keeps listing order stable by id.
#[derive(Default)]
pub struct InMemoryStore {
    next_id: AtomicI64,
    users: Arc<RwLock<BTreeMap<i64, User>>>,
    data_sources: Arc<RwLock<BTreeMap<i64, DataSource>>>,
    roles: Arc<RwLock<Vec<Role>>>,
    sessions: Arc<RwLock<BTreeMap<i64, Session>>>,
    kv: Arc<RwLock<HashMap<String, String>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> i64 {
        // Ids start at 1 to match BIGSERIAL.
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn push_missing_roles(&self, roles: &mut Vec<Role>, object: ObjectRef, names: &[String]) {
        for name in dedup_names(names) {
            let exists = roles.iter().any(|role| {
                role.object_id == object.id && role.object_type == object.kind && role.name == name
            });
            if !exists {
                roles.push(Role {
                    id: self.allocate_id(),
                    object_id: object.id,
                    object_type: object.kind,
                    name,
                });
            }
        }
    }
}

/// Same checks the Postgres foreign keys make on `sessions`.
fn check_session_refs(
    users: &BTreeMap<i64, User>,
    data_sources: &BTreeMap<i64, DataSource>,
    session: &NewSession,
) -> StoreResult<()> {
    if !data_sources.contains_key(&session.object_id) {
        return Err(StoreError::NotFound("data source".into()));
    }
    match session.user_id {
        Some(user_id) if !users.contains_key(&user_id) => Err(StoreError::NotFound("user".into())),
        _ => Ok(()),
    }
}

#[async_trait]
impl InspektorStore for InMemoryStore {
    async fn create_user(
        &self,
        name: &str,
        password_hash: &str,
        meta: UserMeta,
    ) -> StoreResult<User> {
        let mut users = self.users.write().await;
        if users.values().any(|user| user.name == name) {
            return Err(StoreError::Conflict("user exists".into()));
        }
        let user = User {
            id: self.allocate_id(),
            name: name.to_string(),
            password_hash: password_hash.to_string(),
            meta,
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user(&self, id: i64) -> StoreResult<User> {
        self.users
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("user".into()))
    }

    async fn get_user_by_name(&self, name: &str) -> StoreResult<User> {
        self.users
            .read()
            .await
            .values()
            .find(|user| user.name == name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("user".into()))
    }

    async fn list_users(&self) -> StoreResult<Vec<User>> {
        Ok(self.users.read().await.values().cloned().collect())
    }

    async fn create_data_source(
        &self,
        data_source: NewDataSource,
        roles: &[String],
    ) -> StoreResult<DataSource> {
        let mut data_sources = self.data_sources.write().await;
        if data_sources
            .values()
            .any(|existing| existing.name == data_source.name)
        {
            return Err(StoreError::Conflict("data source exists".into()));
        }
        if data_sources
            .values()
            .any(|existing| existing.sidecar_token == data_source.sidecar_token)
        {
            return Err(StoreError::Conflict("sidecar token in use".into()));
        }
        let created = DataSource {
            id: self.allocate_id(),
            name: data_source.name,
            kind: data_source.kind,
            sidecar_token: data_source.sidecar_token,
            hostname: data_source.hostname,
        };
        let mut role_rows = self.roles.write().await;
        self.push_missing_roles(
            &mut role_rows,
            ObjectRef::data_source(created.id),
            &data_source_roles(roles),
        );
        data_sources.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_data_source(&self, id: i64) -> StoreResult<DataSource> {
        self.data_sources
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("data source".into()))
    }

    async fn get_data_source_by_name(&self, name: &str) -> StoreResult<DataSource> {
        self.data_sources
            .read()
            .await
            .values()
            .find(|data_source| data_source.name == name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("data source".into()))
    }

    async fn get_data_source_by_token(&self, sidecar_token: &str) -> StoreResult<DataSource> {
        self.data_sources
            .read()
            .await
            .values()
            .find(|data_source| data_source.sidecar_token == sidecar_token)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("data source".into()))
    }

    async fn list_data_sources(&self) -> StoreResult<Vec<DataSource>> {
        Ok(self.data_sources.read().await.values().cloned().collect())
    }

    async fn delete_data_source(&self, id: i64) -> StoreResult<()> {
        let mut data_sources = self.data_sources.write().await;
        if data_sources.remove(&id).is_none() {
            return Err(StoreError::NotFound("data source".into()));
        }
        // Cascade: role rows and every session granting access to this data source.
        self.roles.write().await.retain(|role| {
            !(role.object_type == ObjectType::DataSource && role.object_id == id)
        });
        self.sessions
            .write()
            .await
            .retain(|_, session| session.object_id != id);
        Ok(())
    }

    async fn insert_roles(&self, object: ObjectRef, names: &[String]) -> StoreResult<()> {
        let mut roles = self.roles.write().await;
        self.push_missing_roles(&mut roles, object, names);
        Ok(())
    }

    async fn roles_for_object(&self, object: ObjectRef) -> StoreResult<Vec<String>> {
        Ok(self
            .roles
            .read()
            .await
            .iter()
            .filter(|role| role.object_id == object.id && role.object_type == object.kind)
            .map(|role| role.name.clone())
            .collect())
    }

    async fn replace_roles(&self, object: ObjectRef, names: &[String]) -> StoreResult<()> {
        let mut roles = self.roles.write().await;
        roles.retain(|role| !(role.object_id == object.id && role.object_type == object.kind));
        self.push_missing_roles(&mut roles, object, names);
        Ok(())
    }

    async fn object_ids_for_roles(
        &self,
        object_type: ObjectType,
        names: &[String],
    ) -> StoreResult<Vec<i64>> {
        let mut ids: Vec<i64> = self
            .roles
            .read()
            .await
            .iter()
            .filter(|role| role.object_type == object_type && names.contains(&role.name))
            .map(|role| role.object_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn distinct_role_names(&self) -> StoreResult<Vec<String>> {
        let mut names: Vec<String> = self
            .roles
            .read()
            .await
            .iter()
            .map(|role| role.name.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn create_permanent_session(&self, session: NewSession) -> StoreResult<Session> {
        let Some(user_id) = session.user_id else {
            return Err(StoreError::Unexpected(anyhow::anyhow!(
                "permanent session requires a user"
            )));
        };
        let users = self.users.read().await;
        let data_sources = self.data_sources.read().await;
        check_session_refs(&users, &data_sources, &session)?;
        // Check and insert under one write lock.
        let mut sessions = self.sessions.write().await;
        let exists = sessions.values().any(|existing| {
            existing.user_id == Some(user_id)
                && existing.object_id == session.object_id
                && existing.kind() == SessionKind::Permanent
        });
        if exists {
            return Err(StoreError::Conflict("session exists".into()));
        }
        let created = Session {
            id: self.allocate_id(),
            object_id: session.object_id,
            user_id: session.user_id,
            meta: session.meta,
        };
        sessions.insert(created.id, created.clone());
        Ok(created)
    }

    async fn insert_session(&self, session: NewSession) -> StoreResult<Session> {
        // Both guards live until the insert so a concurrent delete cannot
        // cascade in between.
        let users = self.users.read().await;
        let data_sources = self.data_sources.read().await;
        check_session_refs(&users, &data_sources, &session)?;
        let created = Session {
            id: self.allocate_id(),
            object_id: session.object_id,
            user_id: session.user_id,
            meta: session.meta,
        };
        self.sessions
            .write()
            .await
            .insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_session_by_credential(
        &self,
        data_source_id: i64,
        username: &str,
        password: &str,
    ) -> StoreResult<Session> {
        self.sessions
            .read()
            .await
            .values()
            .find(|session| {
                session.object_id == data_source_id
                    && session.meta.postgres_username == username
                    && session.meta.postgres_password == password
            })
            .cloned()
            .ok_or_else(|| StoreError::NotFound("session".into()))
    }

    async fn sessions_for_user(&self, user_id: i64) -> StoreResult<Vec<Session>> {
        Ok(self
            .sessions
            .read()
            .await
            .values()
            .filter(|session| session.user_id == Some(user_id))
            .cloned()
            .collect())
    }

    async fn delete_session(&self, id: i64) -> StoreResult<()> {
        match self.sessions.write().await.remove(&id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound("session".into())),
        }
    }

    async fn delete_expired_sessions(&self, now_nanos: i64) -> StoreResult<u64> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| {
            session.meta.expires_at == 0 || session.meta.expires_at > now_nanos
        });
        Ok((before - sessions.len()) as u64)
    }

    async fn kv_get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.kv.read().await.get(key).cloned())
    }

    async fn kv_set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.kv
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn kv_compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> StoreResult<bool> {
        let mut kv = self.kv.write().await;
        if kv.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        kv.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionMeta;

    fn new_data_source(name: &str, token: &str) -> NewDataSource {
        NewDataSource {
            name: name.to_string(),
            kind: "postgres".to_string(),
            sidecar_token: token.to_string(),
            hostname: format!("{name}.internal"),
        }
    }

    fn credential(username: &str, password: &str) -> SessionMeta {
        SessionMeta {
            engine: "postgres".to_string(),
            postgres_username: username.to_string(),
            postgres_password: password.to_string(),
            ..SessionMeta::default()
        }
    }

    #[tokio::test]
    async fn data_source_conflicts_and_default_admin_role() {
        let store = InMemoryStore::new();
        let ds = store
            .create_data_source(new_data_source("db1", "tok-1"), &["dev".to_string()])
            .await
            .expect("data source");
        let err = store
            .create_data_source(new_data_source("db1", "tok-2"), &[])
            .await
            .expect_err("duplicate name");
        assert!(matches!(err, StoreError::Conflict(_)));
        let err = store
            .create_data_source(new_data_source("db2", "tok-1"), &[])
            .await
            .expect_err("duplicate token");
        assert!(matches!(err, StoreError::Conflict(_)));

        let roles = store
            .roles_for_object(ObjectRef::data_source(ds.id))
            .await
            .expect("roles");
        assert_eq!(roles, vec!["admin", "dev"]);
        assert_eq!(
            store.get_data_source_by_token("tok-1").await.expect("by token").id,
            ds.id
        );
    }

    #[tokio::test]
    async fn delete_data_source_cascades_sessions_and_roles() {
        let store = InMemoryStore::new();
        let ds = store
            .create_data_source(new_data_source("db1", "tok-1"), &["dev".to_string()])
            .await
            .expect("data source");
        let user = store
            .create_user("alice", "hash", UserMeta::default())
            .await
            .expect("user");
        store
            .create_permanent_session(NewSession {
                object_id: ds.id,
                user_id: Some(user.id),
                meta: credential("u", "p"),
            })
            .await
            .expect("session");

        store.delete_data_source(ds.id).await.expect("delete");
        assert!(store.sessions_for_user(user.id).await.expect("sessions").is_empty());
        assert!(
            store
                .roles_for_object(ObjectRef::data_source(ds.id))
                .await
                .expect("roles")
                .is_empty()
        );
        let err = store.delete_data_source(ds.id).await.expect_err("gone");
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn roles_are_deduplicated_and_replaced() {
        let store = InMemoryStore::new();
        let object = ObjectRef::user(7);
        let names = vec!["dev".to_string(), "dev".to_string(), "ops".to_string()];
        store.insert_roles(object, &names).await.expect("insert");
        store.insert_roles(object, &names).await.expect("insert again");
        assert_eq!(
            store.roles_for_object(object).await.expect("roles"),
            vec!["dev", "ops"]
        );

        store
            .replace_roles(object, &["qa".to_string()])
            .await
            .expect("replace");
        assert_eq!(store.roles_for_object(object).await.expect("roles"), vec!["qa"]);
        assert_eq!(
            store
                .object_ids_for_roles(ObjectType::User, &["qa".to_string(), "dev".to_string()])
                .await
                .expect("ids"),
            vec![7]
        );
        assert!(
            store
                .object_ids_for_roles(ObjectType::DataSource, &["qa".to_string()])
                .await
                .expect("ids")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn permanent_session_is_unique_per_pair() {
        let store = InMemoryStore::new();
        let ds = store
            .create_data_source(new_data_source("db1", "tok-1"), &[])
            .await
            .expect("data source");
        let session = NewSession {
            object_id: ds.id,
            user_id: Some(1),
            meta: credential("u1", "p1"),
        };
        store
            .create_permanent_session(session.clone())
            .await
            .expect("first");
        let err = store
            .create_permanent_session(session)
            .await
            .expect_err("second");
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn expired_sessions_are_purged_and_permanent_kept() {
        let store = InMemoryStore::new();
        let ds = store
            .create_data_source(new_data_source("db1", "tok-1"), &[])
            .await
            .expect("data source");
        let mut temp = credential("t", "t");
        temp.expires_at = 100;
        store
            .insert_session(NewSession {
                object_id: ds.id,
                user_id: None,
                meta: temp,
            })
            .await
            .expect("temp");
        store
            .insert_session(NewSession {
                object_id: ds.id,
                user_id: None,
                meta: credential("p", "p"),
            })
            .await
            .expect("permanent");

        assert_eq!(store.delete_expired_sessions(99).await.expect("purge"), 0);
        assert_eq!(store.delete_expired_sessions(100).await.expect("purge"), 1);
        assert!(store.find_session_by_credential(ds.id, "t", "t").await.is_err());
        assert!(store.find_session_by_credential(ds.id, "p", "p").await.is_ok());
    }

    #[tokio::test]
    async fn kv_compare_and_swap_requires_expected_value() {
        let store = InMemoryStore::new();
        assert!(store.kv_compare_and_swap("k", None, "v1").await.expect("cas"));
        assert!(!store.kv_compare_and_swap("k", None, "v2").await.expect("cas"));
        assert!(
            store
                .kv_compare_and_swap("k", Some("v1"), "v2")
                .await
                .expect("cas")
        );
        assert_eq!(store.kv_get("k").await.expect("get").as_deref(), Some("v2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn delete_racing_session_insert_leaves_no_orphans() {
        let store = Arc::new(InMemoryStore::new());
        let user_id = store
            .create_user("alice", "hash", UserMeta::default())
            .await
            .expect("user")
            .id;
        for round in 0..50 {
            let ds_id = store
                .create_data_source(
                    new_data_source(&format!("db{round}"), &format!("tok-{round}")),
                    &[],
                )
                .await
                .expect("data source")
                .id;
            let permanent = {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .create_permanent_session(NewSession {
                            object_id: ds_id,
                            user_id: Some(user_id),
                            meta: credential("u", "p"),
                        })
                        .await
                })
            };
            let temporary = {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .insert_session(NewSession {
                            object_id: ds_id,
                            user_id: None,
                            meta: credential("t", "p"),
                        })
                        .await
                })
            };
            let delete = {
                let store = store.clone();
                tokio::spawn(async move { store.delete_data_source(ds_id).await })
            };
            delete.await.expect("join").expect("delete");
            for task in [permanent, temporary] {
                match task.await.expect("join") {
                    Ok(_) | Err(StoreError::NotFound(_)) => {}
                    Err(other) => panic!("unexpected error: {other:?}"),
                }
            }
            let orphans = store
                .sessions
                .read()
                .await
                .values()
                .filter(|session| session.object_id == ds_id)
                .count();
            assert_eq!(orphans, 0, "round {round} left a session for a deleted data source");
        }
    }

    #[tokio::test]
    async fn session_for_unknown_user_is_not_found() {
        let store = InMemoryStore::new();
        let ds = store
            .create_data_source(new_data_source("db1", "tok-1"), &[])
            .await
            .expect("data source");
        let err = store
            .insert_session(NewSession {
                object_id: ds.id,
                user_id: Some(9_999),
                meta: credential("u", "p"),
            })
            .await
            .expect_err("no such user");
        assert!(matches!(err, StoreError::NotFound(what) if what == "user"));
    }
}
