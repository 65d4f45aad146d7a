//! Policy artifact cache and subscriber fan-out.
//!
//! # Purpose
//! Owns the last good artifact and a registry of open policy streams. A resync
//! pulls the repository, compiles, swaps the cached artifact, then tells every
//! subscriber to fetch it again.
//!
//! # Concurrency model
//! - Each subscriber has a capacity-1 channel. `notify` uses `try_send` under the
//!   registry lock, so it never waits on a consumer and at most one notification
//!   is pending per subscriber. A dropped notification is harmless because the
//!   subscriber re-reads the current artifact rather than a diff.
//! - Pulls and compiles are serialized on one lock, so two webhooks cannot
//!   interleave and a cold-cache build cannot overwrite a newer artifact.
//! - The cached artifact lives in an `ArcSwapOption`, so readers never take a lock.
use super::{PolicyCompiler, PolicyRepository, PolicyResult};
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyStatus {
    pub enabled: bool,
    pub repo_url: Option<String>,
    pub commit: Option<String>,
}

struct Inner {
    repository: Arc<dyn PolicyRepository>,
    compiler: Arc<dyn PolicyCompiler>,
    subscribers: Mutex<HashMap<String, mpsc::Sender<()>>>,
    artifact: ArcSwapOption<Bytes>,
    resync_lock: tokio::sync::Mutex<()>,
}

impl Inner {
    fn remove_subscriber(&self, id: &str) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.remove(id).is_some() {
            metrics::gauge!("inspektor_policy_subscribers").set(subscribers.len() as f64);
            tracing::debug!(subscriber_id = %id, "policy subscriber removed");
        }
    }
}

#[derive(Clone)]
pub struct PolicyDistributor {
    inner: Arc<Inner>,
}

/// RAII handle that unregisters a policy subscriber on drop.
#[derive(Debug)]
pub struct SubscriptionGuard {
    inner: Weak<Inner>,
    id: String,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyDistributor")
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_subscriber(&self.id);
        }
    }
}

/// Change notifications for one policy stream.
#[derive(Debug)]
pub struct PolicySubscription {
    receiver: mpsc::Receiver<()>,
    guard: SubscriptionGuard,
}

impl PolicySubscription {
    pub fn id(&self) -> &str {
        &self.guard.id
    }

    /// Wait for the next change; `None` once the distributor is gone.
    pub async fn recv(&mut self) -> Option<()> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<(), TryRecvError> {
        self.receiver.try_recv()
    }
}

impl PolicyDistributor {
    pub fn new(repository: Arc<dyn PolicyRepository>, compiler: Arc<dyn PolicyCompiler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                repository,
                compiler,
                subscribers: Mutex::new(HashMap::new()),
                artifact: ArcSwapOption::empty(),
                resync_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.repository.is_enabled()
    }

    /// Compile the current checkout; empty when sync is disabled.
    ///
    /// A successful build replaces the cached artifact.
    pub async fn get_artifact(&self) -> PolicyResult<Bytes> {
        if !self.is_enabled() {
            return Ok(Bytes::new());
        }
        let _serialized = self.inner.resync_lock.lock().await;
        self.compile_and_cache().await
    }

    /// Last good artifact, compiling on first use.
    pub async fn latest_artifact(&self) -> PolicyResult<Bytes> {
        if !self.is_enabled() {
            return Ok(Bytes::new());
        }
        if let Some(artifact) = self.inner.artifact.load_full() {
            return Ok(Bytes::clone(&artifact));
        }
        let _serialized = self.inner.resync_lock.lock().await;
        // A resync may have filled the cache while we waited.
        if let Some(artifact) = self.inner.artifact.load_full() {
            return Ok(Bytes::clone(&artifact));
        }
        self.compile_and_cache().await
    }

    /// Pull, rebuild, and notify subscribers.
    ///
    /// # Errors
    /// - `SyncFailure` when the pull fails; nothing is rebuilt or notified.
    /// - `BuildFailure` when the new checkout does not compile; the previous
    ///   artifact stays cached and nobody is notified.
    pub async fn resync(&self) -> PolicyResult<()> {
        if !self.is_enabled() {
            tracing::info!("policy resync requested but sync is disabled");
            metrics::counter!("inspektor_policy_resync_total", "outcome" => "disabled").increment(1);
            return Ok(());
        }
        let _serialized = self.inner.resync_lock.lock().await;
        tracing::info!("syncing policy from git repository");
        if let Err(err) = self.inner.repository.pull().await {
            metrics::counter!("inspektor_policy_resync_total", "outcome" => "sync_failure")
                .increment(1);
            tracing::error!(error = %err, "policy pull failed");
            return Err(err);
        }
        if let Err(err) = self.compile_and_cache().await {
            metrics::counter!("inspektor_policy_resync_total", "outcome" => "build_failure")
                .increment(1);
            return Err(err);
        }
        metrics::counter!("inspektor_policy_resync_total", "outcome" => "ok").increment(1);
        self.notify();
        Ok(())
    }

    // Caller holds `resync_lock`, so the checkout cannot move under the build
    // and no older build can land after a newer one.
    async fn compile_and_cache(&self) -> PolicyResult<Bytes> {
        match self
            .inner
            .compiler
            .compile(self.inner.repository.local_path())
            .await
        {
            Ok(artifact) => {
                metrics::counter!("inspektor_policy_build_total", "outcome" => "ok").increment(1);
                self.inner.artifact.store(Some(Arc::new(artifact.clone())));
                Ok(artifact)
            }
            Err(err) => {
                metrics::counter!("inspektor_policy_build_total", "outcome" => "error").increment(1);
                tracing::error!(error = %err, "policy build failed");
                Err(err)
            }
        }
    }

    pub fn subscribe(&self) -> PolicySubscription {
        let id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::channel(1);
        let count = {
            let mut subscribers = self.inner.subscribers.lock();
            subscribers.insert(id.clone(), sender);
            subscribers.len()
        };
        metrics::gauge!("inspektor_policy_subscribers").set(count as f64);
        tracing::debug!(subscriber_id = %id, "policy subscriber added");
        PolicySubscription {
            receiver,
            guard: SubscriptionGuard {
                inner: Arc::downgrade(&self.inner),
                id,
            },
        }
    }

    /// Remove a subscriber; unknown ids are ignored.
    pub fn unsubscribe(&self, id: &str) {
        self.inner.remove_subscriber(id);
    }

    /// Non-blocking fan-out of a change notification to every subscriber.
    pub fn notify(&self) {
        let subscribers = self.inner.subscribers.lock();
        for (id, sender) in subscribers.iter() {
            match sender.try_send(()) {
                Ok(()) => {}
                Err(TrySendError::Full(())) => {
                    metrics::counter!("inspektor_policy_notifications_dropped_total").increment(1);
                    tracing::warn!(subscriber_id = %id, "policy notification dropped; one already pending");
                }
                Err(TrySendError::Closed(())) => {
                    // Receiver dropped; its guard removes the entry.
                    tracing::debug!(subscriber_id = %id, "policy subscriber already closed");
                }
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    pub async fn status(&self) -> PolicyStatus {
        PolicyStatus {
            enabled: self.is_enabled(),
            repo_url: self.inner.repository.remote_url().map(str::to_string),
            commit: self.inner.repository.head_commit().await,
        }
    }
}
