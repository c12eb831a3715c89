//! Per-subscription async locks.
//!
//! Serializes evaluate-then-write for one subscription inside this process.
//! Replicas do not coordinate. An entry lives only while some caller holds
//! or waits on it.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

type LockMap = DashMap<Uuid, Arc<Mutex<()>>>;

#[derive(Clone, Default)]
pub struct SubscriptionLocks {
    locks: Arc<LockMap>,
}

/// Held for the duration of one subscription's critical section.
pub struct SubscriptionGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
    subscription_id: Uuid,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        // Release the mutex first so its Arc clone is gone before the count check.
        self.guard.take();
        self.locks
            .remove_if(&self.subscription_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl SubscriptionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, subscription_id: Uuid) -> SubscriptionGuard {
        // Clone the Arc out so the shard guard is released before awaiting.
        let lock = self
            .locks
            .entry(subscription_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        SubscriptionGuard {
            guard: Some(guard),
            locks: self.locks.clone(),
            subscription_id,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}
