//! Distributed mutex across control-plane replicas.
//!
//! Built around the same spawned `tokio::task` looping on a fixed interval,
//! logging failures and continuing, generalized into a state machine that
//! also reacts to an immediate CAS failure instead of only a timer.

use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{RwLock, broadcast};
use tracing::instrument;
use uuid::Uuid;

use crate::config::LeaderConfig;
use crate::coordination::CoordinationStore;
use crate::error::LeaderError;
use crate::models::LeaderLockValue;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeadershipEvent {
    Acquired,
    Renewed,
    Lost { reason: String },
    Changed { new_leader: Option<String> },
    Vacant,
    Error { message: String },
}

struct Inner {
    current_leader: RwLock<Option<String>>,
    renewal_count: std::sync::atomic::AtomicI64,
    retry_count: std::sync::atomic::AtomicU32,
}

pub struct LeaderElection {
    node_id: String,
    lock_key: String,
    config: LeaderConfig,
    store: Arc<dyn CoordinationStore>,
    is_leader: Arc<AtomicBool>,
    inner: Arc<Inner>,
    events: broadcast::Sender<LeadershipEvent>,
    shutdown: Arc<AtomicBool>,
}

impl LeaderElection {
    pub fn new(lock_key: impl Into<String>, config: LeaderConfig, store: Arc<dyn CoordinationStore>) -> Self {
        let (tx, _rx) = broadcast::channel(64);
        Self {
            node_id: Uuid::new_v4().to_string(),
            lock_key: lock_key.into(),
            config,
            store,
            is_leader: Arc::new(AtomicBool::new(false)),
            inner: Arc::new(Inner {
                current_leader: RwLock::new(None),
                renewal_count: std::sync::atomic::AtomicI64::new(0),
                retry_count: std::sync::atomic::AtomicU32::new(0),
            }),
            events: tx,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_current_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub async fn current_leader(&self) -> Option<String> {
        self.inner.current_leader.read().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeadershipEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: LeadershipEvent) {
        let _ = self.events.send(event);
    }

    fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.config.lock_ttl_secs)
    }

    fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.config.renewal_interval_secs)
    }

    fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.config.retry_interval_secs)
    }

    fn encode_payload(&self) -> Result<String, LeaderError> {
        let renewal_count = self.inner.renewal_count.load(Ordering::SeqCst);
        let payload = LeaderLockValue {
            node_id: self.node_id.clone(),
            timestamp: Utc::now().timestamp_millis(),
            pid: process::id() as i32,
            renewal_count,
        };
        Ok(serde_json::to_string(&payload)?)
    }

    /// Runs the election loop forever (or until `release()` flips the
    /// shutdown flag). Intended to be spawned as a single background task.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            if !self.is_current_leader() {
                match self.try_acquire().await {
                    Ok(true) => {
                        self.become_leader();
                        self.hold_leadership().await;
                        continue;
                    }
                    Ok(false) => {
                        self.refresh_current_leader().await;
                        self.inner.retry_count.store(0, Ordering::SeqCst);
                    }
                    Err(e) => {
                        self.handle_store_error(&e).await;
                    }
                }
                tokio::time::sleep(self.retry_interval()).await;
            } else {
                // Shouldn't normally reach here; hold_leadership owns the loop
                // while leader. Defensive sleep to avoid a busy loop.
                tokio::time::sleep(self.retry_interval()).await;
            }
        }
    }

    #[instrument(skip(self))]
    async fn try_acquire(&self) -> Result<bool, LeaderError> {
        let payload = self.encode_payload()?;
        let ttl_ms = self.lock_ttl().as_millis() as u64;
        let acquired = self
            .store
            .set_nx(&self.lock_key, &payload, ttl_ms)
            .await
            .map_err(LeaderError::Store)?;
        Ok(acquired)
    }

    fn become_leader(&self) {
        self.is_leader.store(true, Ordering::SeqCst);
        self.inner.renewal_count.store(0, Ordering::SeqCst);
        tracing::info!(node_id = %self.node_id, "acquired leadership");
        self.emit(LeadershipEvent::Acquired);
    }

    /// Owns the loop while this replica believes itself leader: renews on a
    /// fixed interval and transitions to non-leader the instant a renewal's
    /// CAS fails, per §4.1's "immediately transitions" requirement.
    async fn hold_leadership(&self) {
        loop {
            tokio::time::sleep(self.renewal_interval()).await;

            if self.shutdown.load(Ordering::SeqCst) {
                self.release().await;
                return;
            }

            match self.renew().await {
                Ok(true) => {
                    tracing::debug!(node_id = %self.node_id, "renewed leadership");
                    self.emit(LeadershipEvent::Renewed);
                }
                Ok(false) => {
                    self.lose_leadership("renewal_failed").await;
                    return;
                }
                Err(e) => {
                    self.handle_store_error(&e).await;
                    if !self.is_current_leader() {
                        return;
                    }
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn renew(&self) -> Result<bool, LeaderError> {
        self.inner.renewal_count.fetch_add(1, Ordering::SeqCst);
        let payload = self.encode_payload()?;
        let ttl_ms = self.lock_ttl().as_millis() as u64;
        let ok = self
            .store
            .cas_renew(&self.lock_key, &self.node_id, &payload, ttl_ms)
            .await
            .map_err(LeaderError::Store)?;
        Ok(ok)
    }

    async fn lose_leadership(&self, reason: &str) {
        self.is_leader.store(false, Ordering::SeqCst);
        tracing::warn!(node_id = %self.node_id, reason, "lost leadership");
        self.emit(LeadershipEvent::Lost {
            reason: reason.to_string(),
        });
    }

    async fn refresh_current_leader(&self) {
        let raw = match self.store.get(&self.lock_key).await {
            Ok(v) => v,
            Err(_) => return,
        };

        let new_leader = raw.and_then(|raw| {
            serde_json::from_str::<LeaderLockValue>(&raw)
                .ok()
                .map(|v| v.node_id)
        });

        let mut current = self.inner.current_leader.write().await;
        if *current != new_leader {
            *current = new_leader.clone();
            drop(current);
            if new_leader.is_none() {
                self.emit(LeadershipEvent::Vacant);
            } else {
                self.emit(LeadershipEvent::Changed {
                    new_leader,
                });
            }
        }
    }

    async fn handle_store_error(&self, err: &LeaderError) {
        let count = self.inner.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::error!(error = %err, retry_count = count, "coordination store error during election");

        if count >= self.config.max_retries {
            self.inner.retry_count.store(0, Ordering::SeqCst);
            self.emit(LeadershipEvent::Error {
                message: err.to_string(),
            });
            tokio::time::sleep(self.retry_interval() * 3).await;
        } else {
            let backoff = self.retry_interval() * 2u32.pow(count.saturating_sub(1));
            let backoff = backoff.min(Duration::from_secs(30));
            tokio::time::sleep(backoff).await;
        }
    }

    /// Graceful release: only deletes the key if we still own it.
    #[instrument(skip(self))]
    pub async fn release(&self) {
        if !self.is_current_leader() {
            return;
        }
        match self.store.cas_delete(&self.lock_key, &self.node_id).await {
            Ok(true) => tracing::info!(node_id = %self.node_id, "released leadership"),
            Ok(false) => tracing::warn!(node_id = %self.node_id, "release no-op: no longer owner"),
            Err(e) => tracing::error!(error = %e, "failed to release leadership"),
        }
        self.is_leader.store(false, Ordering::SeqCst);
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Test/ops hook: forces this replica to treat itself as non-leader and
    /// immediately retry acquisition, without waiting for a renewal cycle.
    pub async fn force_election(&self) {
        if self.is_current_leader() {
            self.lose_leadership("forced").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::fake::FakeCoordinationStore;

    fn election(store: Arc<FakeCoordinationStore>) -> Arc<LeaderElection> {
        Arc::new(LeaderElection::new(
            "test:leader:lock",
            LeaderConfig {
                lock_ttl_secs: 30,
                renewal_interval_secs: 10,
                retry_interval_secs: 5,
                max_retries: 5,
            },
            store,
        ))
    }

    #[tokio::test]
    async fn acquires_when_key_absent() {
        let store = Arc::new(FakeCoordinationStore::default());
        let node = election(store);
        assert!(node.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn second_node_fails_to_acquire_held_lock() {
        let store = Arc::new(FakeCoordinationStore::default());
        let n1 = election(store.clone());
        let n2 = election(store);

        assert!(n1.try_acquire().await.unwrap());
        assert!(!n2.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn renewal_cas_fails_after_external_delete() {
        let store = Arc::new(FakeCoordinationStore::default());
        let n1 = election(store.clone());

        assert!(n1.try_acquire().await.unwrap());
        n1.become_leader();

        store.delete_unconditionally("test:leader:lock");

        assert!(!n1.renew().await.unwrap());
    }

    #[tokio::test]
    async fn cas_delete_is_noop_for_non_owner() {
        let store = Arc::new(FakeCoordinationStore::default());
        let n1 = election(store.clone());
        let n2 = election(store.clone());

        assert!(n1.try_acquire().await.unwrap());
        // n2 never held the lock; cas_delete under n2's id must not remove it.
        assert!(!store.cas_delete("test:leader:lock", n2.node_id()).await.unwrap());
        assert!(store.get("test:leader:lock").await.unwrap().is_some());
    }
}
