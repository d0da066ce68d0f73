//! Per-lead lock registry — single-writer-per-key discipline.
//!
//! The lock covers only the snapshot and commit sections of event
//! processing; decision and gateway I/O run outside it so a slow provider
//! never blocks other events for the same lead longer than a state write.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

/// Registry of per-lead async locks, created on first use.
#[derive(Default)]
pub struct LeadLocks {
    inner: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl LeadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for one lead, creating it if needed.
    pub async fn acquire(&self, lead_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.write().await;
            Arc::clone(map.entry(lead_id).or_default())
        };
        lock.lock_owned().await
    }

    /// Number of leads with a registered lock.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_lead_serializes() {
        let locks = Arc::new(LeadLocks::new());
        let lead_id = Uuid::new_v4();
        let in_section = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let in_section = Arc::clone(&in_section);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(lead_id).await;
                let n = in_section.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(n, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_section.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_leads_proceed_in_parallel() {
        let locks = Arc::new(LeadLocks::new());
        let a = locks.acquire(Uuid::new_v4()).await;
        // A second lead's lock must not block behind the first
        let b = tokio::time::timeout(
            Duration::from_millis(50),
            locks.acquire(Uuid::new_v4()),
        )
        .await;
        assert!(b.is_ok());
        drop(a);
        assert_eq!(locks.len().await, 2);
    }
}
