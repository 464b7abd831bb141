//! Short-lived distributed mutual exclusion per task id
//!
//! Every receiver instance on a topic sees every broadcast task. Before any
//! processing happens, a receiver must claim the task by acquiring its lock;
//! losers abandon the task silently. The lock is built from two atomic store
//! primitives: set-if-absent and set-expiry. Its TTL is the safety net against
//! a receiver crashing mid-processing, explicit release is the fast path.

use crate::storage::KeyValueStore;
use crate::BoxedError;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const LOCK_PREFIX: &str = "lock:";
const LOCKABLE_PREFIX: &str = "lab:";
const LOCK_VALUE: &str = "1";

/// Error type for lock acquisition
#[derive(Error, Debug)]
pub enum LockError {
    /// The store failed to perform an operation
    #[error("store operation failed")]
    Store(#[source] BoxedError),
    /// The lock key was created but attaching its TTL failed.
    ///
    /// A lock without an expiry would never self-heal after a receiver crash,
    /// so this acquisition attempt must not be treated as granted.
    #[error("lock was taken but could not be given an expiry")]
    UnexpirableLock(#[source] BoxedError),
}

/// Mutual-exclusion tokens for task ids of one topic, backed by the shared store
pub struct TaskLock<S: KeyValueStore> {
    store: Arc<S>,
    topic: String,
    lock_ttl: Duration,
    lockability_ttl: Duration,
}

impl<S: KeyValueStore> Clone for TaskLock<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            topic: self.topic.clone(),
            lock_ttl: self.lock_ttl,
            lockability_ttl: self.lockability_ttl,
        }
    }
}

impl<S: KeyValueStore> TaskLock<S> {
    /// Creates a new lock handle for the given topic
    pub fn new(store: Arc<S>, topic: String, lock_ttl: Duration, lockability_ttl: Duration) -> Self {
        Self {
            store,
            topic,
            lock_ttl,
            lockability_ttl,
        }
    }

    fn lock_key(&self, id: &str) -> String {
        format!("{}{}:{}", LOCK_PREFIX, self.topic, id)
    }

    fn lockable_key(&self, id: &str) -> String {
        format!("{}{}:{}", LOCKABLE_PREFIX, self.topic, id)
    }

    /// Attempts to claim the task with the given id
    ///
    /// Returns `Ok(false)` when another receiver holds the claim; the caller
    /// must abandon the task, not retry.
    pub async fn try_acquire(&self, id: &str) -> Result<bool, LockError> {
        let key = self.lock_key(id);

        let granted = self
            .store
            .set_if_absent(&key, LOCK_VALUE)
            .await
            .map_err(LockError::Store)?;

        if !granted {
            debug!("lock for task {} is already taken", id);
            return Ok(false);
        }

        self.store
            .set_expiry(&key, self.lock_ttl)
            .await
            .map_err(LockError::UnexpirableLock)?;

        debug!("acquired lock for task {} on topic {}", id, self.topic);
        Ok(true)
    }

    /// Releases a previously acquired claim
    ///
    /// Attempted on every processing exit path so the lock frees up sooner
    /// than its TTL. Releasing a lock that no longer exists (it already
    /// expired) or hitting a store error is only reported, never raised: the
    /// TTL guarantees the lock disappears either way.
    pub async fn release(&self, id: &str) {
        let key = self.lock_key(id);

        match self.store.exists(&key).await {
            Ok(false) => warn!("cannot release non-existing lock for task {}", id),
            Ok(true) => {
                if let Err(e) = self.store.delete(&key).await {
                    warn!("failed to release lock for task {}: {}", id, e);
                }
            }
            Err(e) => warn!("failed to check lock for task {}: {}", id, e),
        }
    }

    /// Returns whether the task id is flagged as eligible for locking
    ///
    /// Optional long-lived guard, independent of the processing lock; the
    /// relay itself never consults it. Store errors read as "not lockable".
    pub async fn is_lockable(&self, id: &str) -> bool {
        matches!(self.store.get(&self.lockable_key(id)).await, Ok(Some(_)))
    }

    /// Flags the task id as eligible for locking
    pub async fn set_lockable(&self, id: &str) -> Result<(), LockError> {
        let key = self.lockable_key(id);

        self.store
            .set(&key, LOCK_VALUE)
            .await
            .map_err(LockError::Store)?;

        self.store
            .set_expiry(&key, self.lockability_ttl)
            .await
            .map_err(LockError::Store)
    }
}
