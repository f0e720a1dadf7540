// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Concurrency control shared by the importer, reconciler and applier.
//!
//! Two independent limits:
//!
//! - [`NamespaceLocks`]: at most one writer per namespace. The importer
//!   holds a namespace for its whole run; the applier takes it per event.
//! - Work slots: a semaphore sized to the target pool capacity, bounding
//!   how many namespaces import in parallel.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> doc_replication_engine::Result<()> {
//! use doc_replication_engine::concurrency::ConcurrencyController;
//!
//! let controller = ConcurrencyController::new(4);
//! let _slot = controller.acquire_slot().await?;
//! let _guard = controller.lock_namespace("app.users").await;
//! // exclusive access to app.users; both released on drop
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Guard held while writing to a namespace.
pub type NamespaceGuard = OwnedMutexGuard<()>;

/// One async mutex per namespace, created on first use.
#[derive(Debug, Default)]
pub struct NamespaceLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl NamespaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex(&self, namespace: &str) -> Arc<Mutex<()>> {
        if let Some(existing) = self.locks.get(namespace) {
            return Arc::clone(&existing);
        }
        // Shard guard dropped at end of statement, before any await.
        Arc::clone(&self.locks.entry(namespace.to_string()).or_default())
    }

    /// Wait for exclusive access to `namespace`. Waiters are served in FIFO order.
    pub async fn lock(&self, namespace: &str) -> NamespaceGuard {
        let mutex = self.mutex(namespace);
        trace!(namespace = %namespace, "Waiting for namespace lock");
        mutex.lock_owned().await
    }

    /// Take the lock only if it is free.
    pub fn try_lock(&self, namespace: &str) -> Option<NamespaceGuard> {
        self.mutex(namespace).try_lock_owned().ok()
    }

    pub fn is_locked(&self, namespace: &str) -> bool {
        self.locks
            .get(namespace)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of namespaces seen so far.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Namespace locks plus work slots sized to the target pool.
#[derive(Debug)]
pub struct ConcurrencyController {
    locks: NamespaceLocks,
    slots: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyController {
    /// Create a controller with `capacity` work slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            locks: NamespaceLocks::new(),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub async fn lock_namespace(&self, namespace: &str) -> NamespaceGuard {
        self.locks.lock(namespace).await
    }

    pub fn locks(&self) -> &NamespaceLocks {
        &self.locks
    }

    /// Wait for a work slot. Released when the permit drops.
    pub async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| ReplicationError::Shutdown)
    }

    pub fn try_acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Refuse further slot requests; waiters get [`ReplicationError::Shutdown`].
    pub fn close(&self) {
        self.slots.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_capacity_is_at_least_one() {
        let controller = ConcurrencyController::new(0);
        assert_eq!(controller.capacity(), 1);
        assert_eq!(controller.available_slots(), 1);
    }

    #[tokio::test]
    async fn test_slots_limit_and_release() {
        let controller = ConcurrencyController::new(2);

        let p1 = controller.acquire_slot().await.unwrap();
        let p2 = controller.acquire_slot().await.unwrap();
        assert_eq!(controller.available_slots(), 0);
        assert!(controller.try_acquire_slot().is_none());

        drop(p1);
        assert_eq!(controller.available_slots(), 1);
        drop(p2);
        assert_eq!(controller.available_slots(), 2);
    }

    #[tokio::test]
    async fn test_closed_controller_rejects_slots() {
        let controller = ConcurrencyController::new(1);
        controller.close();
        let result = controller.acquire_slot().await;
        assert!(matches!(result, Err(ReplicationError::Shutdown)));
    }

    #[tokio::test]
    async fn test_namespace_lock_is_exclusive() {
        let locks = NamespaceLocks::new();
        let guard = locks.lock("app.users").await;

        assert!(locks.is_locked("app.users"));
        assert!(locks.try_lock("app.users").is_none());
        // other namespaces are independent
        assert!(locks.try_lock("app.orders").is_some());

        drop(guard);
        assert!(!locks.is_locked("app.users"));
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_writers_on_one_namespace_never_overlap() {
        let controller = Arc::new(ConcurrencyController::new(8));
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let controller = Arc::clone(&controller);
            let active = Arc::clone(&active);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = controller.lock_namespace("app.users").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
