//! Per-key mutual exclusion for user mutations.
//!
//! Two deliveries for the same user must not interleave a token refresh:
//! the loser would persist a stale token over the fresher one. Keys map to
//! lazily created async mutexes that are never removed, so the registry is
//! bounded by the number of distinct users seen by this process.
//!
//! This only protects in-process concurrency.

use std::{collections::HashMap, sync::Arc};

use scrobble_core::{normalize_username, UserId};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Held lock for one key. Dropping the guard releases the key.
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    /// Key this guard holds.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        trace!(key = %self.key, "released user lock");
    }
}

/// Registry of per-key exclusive locks.
#[derive(Debug, Default)]
pub struct MultipleLock {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MultipleLock {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the lock key for a user.
    pub fn lock_key(username: &str, id: &UserId) -> String {
        format!("{}:{id}", normalize_username(username))
    }

    /// Waits for exclusive ownership of `key`.
    ///
    /// The returned guard releases the key when dropped, including on early
    /// returns and when the holding future is cancelled.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(key.to_string()).or_default())
        };

        let guard = mutex.lock_owned().await;
        trace!(key, "acquired user lock");
        KeyGuard { key: key.to_string(), _guard: guard }
    }

    /// Acquires `key` only if no one holds it.
    pub async fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        let mutex = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(key.to_string()).or_default())
        };

        mutex.try_lock_owned().ok().map(|guard| KeyGuard { key: key.to_string(), _guard: guard })
    }

    /// Number of keys ever locked.
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Returns true when no key has been locked yet.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(MultipleLock::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let active = Arc::clone(&active);
                let max_active = Arc::clone(&max_active);
                tokio::spawn(async move {
                    let _guard = locks.lock("neil:1").await;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(locks.len().await, 1);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = MultipleLock::new();

        let _first = locks.lock("neil:1").await;
        let second = locks.try_lock("vincent:2").await;

        assert!(second.is_some());
        assert!(locks.try_lock("neil:1").await.is_none());
    }

    #[tokio::test]
    async fn guard_releases_on_error_path() {
        async fn failing(locks: &MultipleLock) -> Result<(), &'static str> {
            let _guard = locks.lock("neil:1").await;
            Err("upstream failed")
        }

        let locks = MultipleLock::new();
        assert!(failing(&locks).await.is_err());

        let reacquired = tokio::time::timeout(Duration::from_secs(1), locks.lock("neil:1")).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_the_lock() {
        let locks = Arc::new(MultipleLock::new());
        let held = locks.lock("neil:1").await;

        let waiter = tokio::time::timeout(Duration::from_millis(20), locks.lock("neil:1")).await;
        assert!(waiter.is_err());

        drop(held);
        assert!(locks.try_lock("neil:1").await.is_some());
    }

    #[test]
    fn keys_combine_normalized_name_and_id() {
        let id = UserId::new();
        assert_eq!(MultipleLock::lock_key(" Neil ", &id), format!("neil:{id}"));
    }
}
