//! Database credential lifecycle.
//!
//! # Purpose
//! Issues per-user permanent sessions and time-boxed temporary grants, resolves
//! credentials presented by dataplane agents, and decides expiry.
//!
//! # Key invariants
//! - At most one permanent session per (user, data source); the store enforces
//!   the check-then-insert atomically.
//! - Temporary grants never collide with permanent sessions and may overlap.
//! - Expiry is lazy: a temporary session is invalid once `expires_at <= now`,
//!   whether or not the row has been purged.
use crate::error::{ControlPlaneError, ControlPlaneResult};
use crate::model::{NewSession, ObjectRef, Session, SessionKind, SessionMeta};
use crate::roles::RoleStore;
use crate::store::InspektorStore;
use rand::Rng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

const NANOS_PER_MINUTE: i64 = 60 * 1_000_000_000;

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "calm", "clever", "crimson", "eager", "fancy", "gentle", "golden", "happy",
    "jolly", "kind", "lively", "lucky", "mellow", "nimble", "polite", "proud", "quiet", "rapid",
    "silent", "silver", "steady", "swift", "tidy", "vivid", "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "canyon", "cedar", "comet", "falcon", "ferret", "glacier", "harbor",
    "heron", "island", "lantern", "maple", "meadow", "otter", "panda", "pebble", "quartz", "raven",
    "river", "sparrow", "summit", "tiger", "tulip", "walrus", "willow", "yak", "zebra",
];

/// Source of "now" in nanoseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_nanos(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as i64)
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_nanos: i64) -> Self {
        Self {
            now: AtomicI64::new(now_nanos),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_nanos() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Request for a time-boxed grant, usually produced by an approval workflow.
#[derive(Debug, Clone)]
pub struct TemporaryGrant {
    pub data_source_id: i64,
    pub roles: Vec<String>,
    pub ttl_minutes: i64,
    /// Channel that approved the grant (e.g. `slack`).
    pub created_by: String,
    pub context: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct CredentialBroker {
    store: Arc<dyn InspektorStore>,
    roles: RoleStore,
    clock: Arc<dyn Clock>,
}

impl CredentialBroker {
    pub fn new(store: Arc<dyn InspektorStore>, roles: RoleStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            roles,
            clock,
        }
    }

    pub fn now_nanos(&self) -> i64 {
        self.clock.now_nanos()
    }

    /// Create the one permanent session for (user, data source).
    ///
    /// # Errors
    /// - `AlreadyExists` when the pair already has a permanent session.
    /// - `NotFound` when the user or data source does not exist.
    pub async fn create_permanent_session(
        &self,
        user_id: i64,
        data_source_id: i64,
        passthrough: bool,
    ) -> ControlPlaneResult<Session> {
        self.store.get_user(user_id).await?;
        let data_source = self.store.get_data_source(data_source_id).await?;
        let (username, password) = generate_credential();
        let session = self
            .store
            .create_permanent_session(NewSession {
                object_id: data_source.id,
                user_id: Some(user_id),
                meta: SessionMeta {
                    engine: data_source.kind,
                    postgres_username: username,
                    postgres_password: password,
                    passthrough,
                    ..SessionMeta::default()
                },
            })
            .await?;
        metrics::counter!("inspektor_sessions_created_total", "kind" => "permanent").increment(1);
        tracing::info!(user_id, data_source_id, session_id = session.id, "permanent session created");
        Ok(session)
    }

    /// Create a permanent session only if the user shares a role with the data source.
    pub async fn request_session(
        &self,
        user_id: i64,
        data_source_id: i64,
        passthrough: bool,
    ) -> ControlPlaneResult<Session> {
        let allowed = self
            .roles
            .has_common_role(ObjectRef::user(user_id), ObjectRef::data_source(data_source_id))
            .await?;
        if !allowed {
            return Err(ControlPlaneError::PermissionDenied(
                "user has no role on this data source".into(),
            ));
        }
        self.create_permanent_session(user_id, data_source_id, passthrough)
            .await
    }

    pub async fn create_temporary_grant(
        &self,
        grant: TemporaryGrant,
    ) -> ControlPlaneResult<Session> {
        if grant.roles.is_empty() {
            return Err(ControlPlaneError::InvalidArgument(
                "at least one role is required".into(),
            ));
        }
        if grant.ttl_minutes <= 0 {
            return Err(ControlPlaneError::InvalidArgument(
                "expiry must be a positive number of minutes".into(),
            ));
        }
        let data_source = self.store.get_data_source(grant.data_source_id).await?;
        let expires_at = grant
            .ttl_minutes
            .checked_mul(NANOS_PER_MINUTE)
            .and_then(|ttl| self.clock.now_nanos().checked_add(ttl))
            .ok_or_else(|| ControlPlaneError::InvalidArgument("expiry out of range".into()))?;
        let (username, password) = generate_credential();
        let session = self
            .store
            .insert_session(NewSession {
                object_id: data_source.id,
                user_id: None,
                meta: SessionMeta {
                    engine: data_source.kind,
                    postgres_username: username,
                    postgres_password: password,
                    temp_roles: grant.roles,
                    expires_at,
                    context: grant.context,
                    temp_created_by: grant.created_by,
                    passthrough: false,
                },
            })
            .await?;
        metrics::counter!("inspektor_sessions_created_total", "kind" => "temporary").increment(1);
        tracing::info!(
            data_source_id = data_source.id,
            session_id = session.id,
            expires_at,
            "temporary grant created"
        );
        Ok(session)
    }

    /// Find the session issued with this credential for `data_source_id`.
    ///
    /// Expired sessions are still returned; callers check [`Self::is_expired`].
    pub async fn resolve_credential(
        &self,
        data_source_id: i64,
        username: &str,
        password: &str,
    ) -> ControlPlaneResult<Session> {
        Ok(self
            .store
            .find_session_by_credential(data_source_id, username, password)
            .await?)
    }

    pub fn is_expired(&self, session: &Session) -> bool {
        session.kind() == SessionKind::Temporary
            && session.meta.expires_at <= self.clock.now_nanos()
    }

    pub async fn sessions_for_user(
        &self,
        user_id: i64,
        kind: SessionKind,
    ) -> ControlPlaneResult<Vec<Session>> {
        let sessions = self.store.sessions_for_user(user_id).await?;
        Ok(sessions
            .into_iter()
            .filter(|session| session.kind() == kind)
            .collect())
    }

    pub async fn delete_session(&self, session_id: i64) -> ControlPlaneResult<()> {
        self.store.delete_session(session_id).await?;
        Ok(())
    }

    /// Delete temporary sessions that have already expired.
    pub async fn purge_expired(&self) -> ControlPlaneResult<u64> {
        let purged = self
            .store
            .delete_expired_sessions(self.clock.now_nanos())
            .await?;
        if purged > 0 {
            metrics::counter!("inspektor_sessions_expired_purged_total").increment(purged);
            tracing::debug!(purged, "expired sessions purged");
        }
        Ok(purged)
    }

    pub fn spawn_expiry_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = broker.purge_expired().await {
                    tracing::warn!(error = %err, "expired session purge failed");
                }
            }
        })
    }
}

/// Random `adjective-noun` username and 14 hex char password.
pub fn generate_credential() -> (String, String) {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("otter");
    let bytes: [u8; 7] = rng.r#gen();
    let password = bytes.iter().map(|byte| format!("{byte:02x}")).collect();
    (format!("{adjective}-{noun}"), password)
}
