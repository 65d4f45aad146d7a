//! Postgres-backed implementation of the control-plane store.
//!
//! # What this module is
//! This module implements [`InspektorStore`] using Postgres (via `sqlx`) as the durable, shared
//! store for users, data sources, role bindings, sessions, and the small key/value table that holds
//! integration settings.
//!
//! # Key invariants
//! - Role rows are unique per (object_id, object_type, name); inserts use `ON CONFLICT DO NOTHING`.
//! - At most one permanent session exists per (user, data source). The check runs inside a
//!   transaction and a partial unique index backs it up; both surface as `StoreError::Conflict`.
//! - Session metadata is stored as JSONB with the camelCase keys written by earlier releases, so
//!   credential lookups filter on `meta_json->>'postgresUsername'`.
//!
//! # Security model / threat assumptions
//! - Database URLs may contain credentials; avoid logging them.
//! - Every query is static SQL with bound parameters.
//!
//! # Concurrency model
//! - The store is shared across async handlers; `sqlx::PgPool` manages concurrency.
//! - Multi-statement mutations run in a transaction so readers never see half-applied changes.
//!
//! # Operational notes
//! - Migrations are executed at startup via `sqlx::migrate!("./migrations")`.
//! - Pool and connect timeouts are explicit so a dead database fails health checks instead of
//!   hanging request handlers.
use super::{InspektorStore, StoreError, StoreResult, data_source_roles, dedup_names};
use crate::config::PostgresConfig;
use crate::model::{
    DataSource, NewDataSource, NewSession, ObjectRef, ObjectType, Session, SessionMeta, User,
    UserMeta,
};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::str::FromStr;
use std::time::Duration;

/// Postgres-backed control-plane store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

/// Row shape for the `users` table.
#[derive(Debug, Clone, FromRow)]
struct DbUser {
    id: i64,
    name: String,
    password_hash: String,
    meta_json: Value,
}

/// Row shape for the `data_sources` table.
#[derive(Debug, Clone, FromRow)]
struct DbDataSource {
    id: i64,
    name: String,
    #[sqlx(rename = "type")]
    kind: String,
    sidecar_token: String,
    hostname: String,
}

/// Row shape for the `sessions` table.
#[derive(Debug, Clone, FromRow)]
struct DbSession {
    id: i64,
    object_id: i64,
    user_id: Option<i64>,
    meta_json: Value,
}

impl PostgresStore {
    /// Connect to Postgres and apply embedded migrations.
    ///
    /// # Errors
    /// - Connection, migration, or pool setup failures.
    ///
    /// # Security notes
    /// - Avoid logging `pg.url` as it may contain credentials.
    ///
    /// # Example
    /// ```rust,no_run
    /// use controlplane::config::PostgresConfig;
    /// use controlplane::store::postgres::PostgresStore;
    ///
    /// async fn open(pg: PostgresConfig) {
    ///     let _ = PostgresStore::connect(&pg).await;
    /// }
    /// ```
    pub async fn connect(pg: &PostgresConfig) -> StoreResult<Self> {
        // `acquire_timeout` bounds the wait for a pooled connection; `connect_timeout_ms` bounds
        // establishing a new physical one.
        let connect_options = PgConnectOptions::from_str(&pg.url)?;
        let pool = PgPoolOptions::new()
            .max_connections(pg.max_connections)
            .acquire_timeout(Duration::from_millis(pg.acquire_timeout_ms))
            .connect_with(connect_options);
        let pool = tokio::time::timeout(Duration::from_millis(pg.connect_timeout_ms), pool)
            .await
            .map_err(|_| StoreError::Unexpected(anyhow::anyhow!("postgres connect timed out")))??;

        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    async fn insert_roles_tx(
        tx: &mut Transaction<'_, Postgres>,
        object: ObjectRef,
        names: &[String],
    ) -> StoreResult<()> {
        for name in dedup_names(names) {
            sqlx::query(
                r#"INSERT INTO roles (object_id, object_type, name) VALUES ($1, $2, $3)
                   ON CONFLICT (object_id, object_type, name) DO NOTHING"#,
            )
            .bind(object.id)
            .bind(object.kind.as_str())
            .bind(&name)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn insert_session_row(
        executor: &mut sqlx::PgConnection,
        session: NewSession,
    ) -> StoreResult<Session> {
        let meta_json = serde_json::to_value(&session.meta)?;
        let insert = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO sessions (object_id, user_id, meta_json) VALUES ($1, $2, $3)
               RETURNING id"#,
        )
        .bind(session.object_id)
        .bind(session.user_id)
        .bind(&meta_json)
        .fetch_one(executor)
        .await;
        let id = match insert {
            Ok(id) => id,
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::Conflict("session exists".into()));
            }
            Err(err) => match missing_session_reference(&err) {
                Some(what) => return Err(StoreError::NotFound(what.into())),
                None => return Err(StoreError::Unexpected(err.into())),
            },
        };
        Ok(Session {
            id,
            object_id: session.object_id,
            user_id: session.user_id,
            meta: session.meta,
        })
    }
}

#[async_trait]
impl InspektorStore for PostgresStore {
    async fn create_user(
        &self,
        name: &str,
        password_hash: &str,
        meta: UserMeta,
    ) -> StoreResult<User> {
        let meta_json = serde_json::to_value(&meta)?;
        let insert = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO users (name, password_hash, meta_json) VALUES ($1, $2, $3)
               RETURNING id"#,
        )
        .bind(name)
        .bind(password_hash)
        .bind(&meta_json)
        .fetch_one(&self.pool)
        .await;
        match insert {
            Ok(id) => Ok(User {
                id,
                name: name.to_string(),
                password_hash: password_hash.to_string(),
                meta,
            }),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Conflict("user exists".into())),
            Err(err) => Err(StoreError::Unexpected(err.into())),
        }
    }

    async fn get_user(&self, id: i64) -> StoreResult<User> {
        let row = sqlx::query_as::<_, DbUser>(
            "SELECT id, name, password_hash, meta_json FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(user_from_db)
            .transpose()?
            .ok_or_else(|| StoreError::NotFound("user".into()))
    }

    async fn get_user_by_name(&self, name: &str) -> StoreResult<User> {
        let row = sqlx::query_as::<_, DbUser>(
            "SELECT id, name, password_hash, meta_json FROM users WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(user_from_db)
            .transpose()?
            .ok_or_else(|| StoreError::NotFound("user".into()))
    }

    async fn list_users(&self) -> StoreResult<Vec<User>> {
        let rows = sqlx::query_as::<_, DbUser>(
            "SELECT id, name, password_hash, meta_json FROM users ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(user_from_db).collect()
    }

    /// Insert the data source and its role rows in a single transaction so an agent never sees a
    /// data source without its `admin` binding.
    async fn create_data_source(
        &self,
        data_source: NewDataSource,
        roles: &[String],
    ) -> StoreResult<DataSource> {
        let mut tx = self.pool.begin().await?;
        let insert = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO data_sources (name, type, sidecar_token, hostname)
               VALUES ($1, $2, $3, $4) RETURNING id"#,
        )
        .bind(&data_source.name)
        .bind(&data_source.kind)
        .bind(&data_source.sidecar_token)
        .bind(&data_source.hostname)
        .fetch_one(&mut *tx)
        .await;
        let id = match insert {
            Ok(id) => id,
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::Conflict("data source exists".into()));
            }
            Err(err) => return Err(StoreError::Unexpected(err.into())),
        };
        Self::insert_roles_tx(
            &mut tx,
            ObjectRef::data_source(id),
            &data_source_roles(roles),
        )
        .await?;
        tx.commit().await?;
        Ok(DataSource {
            id,
            name: data_source.name,
            kind: data_source.kind,
            sidecar_token: data_source.sidecar_token,
            hostname: data_source.hostname,
        })
    }

    async fn get_data_source(&self, id: i64) -> StoreResult<DataSource> {
        let row = sqlx::query_as::<_, DbDataSource>(
            "SELECT id, name, type, sidecar_token, hostname FROM data_sources WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(data_source_from_db)
            .ok_or_else(|| StoreError::NotFound("data source".into()))
    }

    async fn get_data_source_by_name(&self, name: &str) -> StoreResult<DataSource> {
        let row = sqlx::query_as::<_, DbDataSource>(
            "SELECT id, name, type, sidecar_token, hostname FROM data_sources WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(data_source_from_db)
            .ok_or_else(|| StoreError::NotFound("data source".into()))
    }

    async fn get_data_source_by_token(&self, sidecar_token: &str) -> StoreResult<DataSource> {
        let row = sqlx::query_as::<_, DbDataSource>(
            r#"SELECT id, name, type, sidecar_token, hostname FROM data_sources
               WHERE sidecar_token = $1"#,
        )
        .bind(sidecar_token)
        .fetch_optional(&self.pool)
        .await?;
        row.map(data_source_from_db)
            .ok_or_else(|| StoreError::NotFound("data source".into()))
    }

    async fn list_data_sources(&self) -> StoreResult<Vec<DataSource>> {
        let rows = sqlx::query_as::<_, DbDataSource>(
            "SELECT id, name, type, sidecar_token, hostname FROM data_sources ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(data_source_from_db).collect())
    }

    async fn delete_data_source(&self, id: i64) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        // Sessions go with the row through ON DELETE CASCADE; role rows have no FK.
        sqlx::query("DELETE FROM roles WHERE object_id = $1 AND object_type = $2")
            .bind(id)
            .bind(ObjectType::DataSource.as_str())
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM data_sources WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("data source".into()));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_roles(&self, object: ObjectRef, names: &[String]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_roles_tx(&mut tx, object, names).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn roles_for_object(&self, object: ObjectRef) -> StoreResult<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT name FROM roles WHERE object_id = $1 AND object_type = $2 ORDER BY id",
        )
        .bind(object.id)
        .bind(object.kind.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }

    async fn replace_roles(&self, object: ObjectRef, names: &[String]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM roles WHERE object_id = $1 AND object_type = $2")
            .bind(object.id)
            .bind(object.kind.as_str())
            .execute(&mut *tx)
            .await?;
        Self::insert_roles_tx(&mut tx, object, names).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn object_ids_for_roles(
        &self,
        object_type: ObjectType,
        names: &[String],
    ) -> StoreResult<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            r#"SELECT DISTINCT object_id FROM roles
               WHERE object_type = $1 AND name = ANY($2)
               ORDER BY object_id"#,
        )
        .bind(object_type.as_str())
        .bind(names)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn distinct_role_names(&self) -> StoreResult<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>("SELECT DISTINCT name FROM roles ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }

    async fn create_permanent_session(&self, session: NewSession) -> StoreResult<Session> {
        let Some(user_id) = session.user_id else {
            return Err(StoreError::Unexpected(anyhow::anyhow!(
                "permanent session requires a user"
            )));
        };
        let mut tx = self.pool.begin().await?;
        let existing: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM sessions
               WHERE user_id = $1 AND object_id = $2
                 AND COALESCE((meta_json->>'expiresAt')::BIGINT, 0) = 0"#,
        )
        .bind(user_id)
        .bind(session.object_id)
        .fetch_one(&mut *tx)
        .await?;
        if existing > 0 {
            return Err(StoreError::Conflict("session exists".into()));
        }
        let created = Self::insert_session_row(&mut *tx, session).await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn insert_session(&self, session: NewSession) -> StoreResult<Session> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_session_row(&mut *conn, session).await
    }

    async fn find_session_by_credential(
        &self,
        data_source_id: i64,
        username: &str,
        password: &str,
    ) -> StoreResult<Session> {
        let row = sqlx::query_as::<_, DbSession>(
            r#"SELECT id, object_id, user_id, meta_json FROM sessions
               WHERE object_id = $1
                 AND meta_json->>'postgresUsername' = $2
                 AND meta_json->>'postgresPassword' = $3
               LIMIT 1"#,
        )
        .bind(data_source_id)
        .bind(username)
        .bind(password)
        .fetch_optional(&self.pool)
        .await?;
        row.map(session_from_db)
            .transpose()?
            .ok_or_else(|| StoreError::NotFound("session".into()))
    }

    async fn sessions_for_user(&self, user_id: i64) -> StoreResult<Vec<Session>> {
        let rows = sqlx::query_as::<_, DbSession>(
            "SELECT id, object_id, user_id, meta_json FROM sessions WHERE user_id = $1 ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(session_from_db).collect()
    }

    async fn delete_session(&self, id: i64) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("session".into()));
        }
        Ok(())
    }

    async fn delete_expired_sessions(&self, now_nanos: i64) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"DELETE FROM sessions
               WHERE COALESCE((meta_json->>'expiresAt')::BIGINT, 0) <> 0
                 AND (meta_json->>'expiresAt')::BIGINT <= $1"#,
        )
        .bind(now_nanos)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn kv_get(&self, key: &str) -> StoreResult<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn kv_set(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO kv (key, value) VALUES ($1, $2)
               ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value"#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn kv_compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> StoreResult<bool> {
        let result = match expected {
            None => {
                sqlx::query(
                    r#"INSERT INTO kv (key, value) VALUES ($1, $2)
                       ON CONFLICT (key) DO NOTHING"#,
                )
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query("UPDATE kv SET value = $2 WHERE key = $1 AND value = $3")
                    .bind(key)
                    .bind(value)
                    .bind(expected)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().map(|code| code == "23505").unwrap_or(false);
    }
    false
}

/// Which referenced row a foreign-key violation on `sessions` points at.
///
/// Constraint names are the Postgres defaults for the columns in
/// `0001_init.sql`.
fn missing_session_reference(err: &sqlx::Error) -> Option<&'static str> {
    let sqlx::Error::Database(db_err) = err else {
        return None;
    };
    if db_err.code().as_deref() != Some("23503") {
        return None;
    }
    Some(session_fk_target(db_err.constraint()))
}

fn session_fk_target(constraint: Option<&str>) -> &'static str {
    match constraint {
        Some("sessions_object_id_fkey") => "data source",
        Some("sessions_user_id_fkey") => "user",
        _ => "referenced row",
    }
}

fn user_from_db(row: DbUser) -> StoreResult<User> {
    let meta: UserMeta = serde_json::from_value(row.meta_json)?;
    Ok(User {
        id: row.id,
        name: row.name,
        password_hash: row.password_hash,
        meta,
    })
}

fn data_source_from_db(row: DbDataSource) -> DataSource {
    DataSource {
        id: row.id,
        name: row.name,
        kind: row.kind,
        sidecar_token: row.sidecar_token,
        hostname: row.hostname,
    }
}

fn session_from_db(row: DbSession) -> StoreResult<Session> {
    let meta: SessionMeta = serde_json::from_value(row.meta_json)?;
    Ok(Session {
        id: row.id,
        object_id: row.object_id,
        user_id: row.user_id,
        meta,
    })
}
