//! Per-wallet mutual exclusion
//!
//! Each wallet id maps to a FIFO async mutex. Operations on the same id
//! queue in arrival order; different ids proceed concurrently. Multi-id
//! acquisition always locks in sorted order so two transfers moving funds
//! in opposite directions cannot deadlock.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lock table keyed by wallet id
#[derive(Default)]
pub struct WalletLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held locks; released on drop
pub struct WalletGuard {
    ids: Vec<String>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl WalletGuard {
    /// Ids held, in acquisition order
    pub fn ids(&self) -> &[String] {
        &self.ids
    }
}

impl WalletLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Lock a single wallet
    pub async fn lock(&self, id: &str) -> WalletGuard {
        let guard = self.mutex(id).lock_owned().await;
        WalletGuard {
            ids: vec![id.to_string()],
            _guards: vec![guard],
        }
    }

    /// Lock several wallets in canonical order, ignoring duplicates
    pub async fn lock_all<I, S>(&self, ids: I) -> WalletGuard
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ids: Vec<String> = ids.into_iter().map(|s| s.as_ref().to_string()).collect();
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            // Clone the Arc first so no map shard is held across the await
            let mutex = self.mutex(id);
            guards.push(mutex.lock_owned().await);
        }

        WalletGuard {
            ids,
            _guards: guards,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_id_is_serialized() {
        let locks = Arc::new(WalletLocks::new());
        let counter = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let guard = locks.lock("alice").await;

        let task = {
            let locks = locks.clone();
            let counter = counter.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("alice").await;
                counter.lock().await.push("second");
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        counter.lock().await.push("first");
        drop(guard);
        task.await.unwrap();

        assert_eq!(*counter.lock().await, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_different_ids_do_not_block() {
        let locks = WalletLocks::new();
        let _alice = locks.lock("alice").await;
        let bob = tokio::time::timeout(Duration::from_millis(100), locks.lock("bob")).await;
        assert!(bob.is_ok());
    }

    #[tokio::test]
    async fn test_lock_all_is_sorted_and_deduplicated() {
        let locks = WalletLocks::new();
        let guard = locks.lock_all(["carol", "alice", "carol", "bob"]).await;
        assert_eq!(guard.ids(), &["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn test_opposite_order_does_not_deadlock() {
        let locks = Arc::new(WalletLocks::new());
        let mut tasks = Vec::new();
        for i in 0..50 {
            let locks = locks.clone();
            tasks.push(tokio::spawn(async move {
                let pair = if i % 2 == 0 { ["a", "b"] } else { ["b", "a"] };
                let _guard = locks.lock_all(pair).await;
                tokio::task::yield_now().await;
            }));
        }

        let all = futures::future::join_all(tasks);
        let finished = tokio::time::timeout(Duration::from_secs(5), all).await;
        assert!(finished.is_ok());
    }
}
