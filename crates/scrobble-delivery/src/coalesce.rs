//! Collapses concurrent identical requests into one execution.
//!
//! Media servers commonly fire the same webhook several times in a burst.
//! The first caller for a key runs the operation; callers arriving while it
//! is in flight await the same shared future and receive a clone of its
//! result, value or error. The entry is removed once the execution
//! finishes, so later calls run again.

use std::{collections::HashMap, future::Future, sync::Arc};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

type InFlight<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Request coalescer keyed by string.
pub struct Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    inflight: Arc<Mutex<HashMap<String, InFlight<T>>>>,
    enabled: bool,
}

impl<T> std::fmt::Debug for Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coalescer").field("enabled", &self.enabled).finish_non_exhaustive()
    }
}

impl<T> Default for Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(true)
    }
}

impl<T> Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a coalescer. A disabled one runs every call.
    pub fn new(enabled: bool) -> Self {
        Self { inflight: Arc::new(Mutex::new(HashMap::new())), enabled }
    }

    /// Builds a coalescing key from a username and target id.
    pub fn key(username: &str, target_id: &str) -> String {
        format!("{}|{target_id}", scrobble_core::normalize_username(username))
    }

    /// Runs `op` unless an identical call is already in flight.
    pub async fn run<F>(&self, key: &str, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        if !self.enabled {
            return op.await;
        }

        let shared = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(key) {
                Some(existing) => {
                    debug!(key, "joining in-flight request");
                    existing.clone()
                },
                None => {
                    let registry = Arc::clone(&self.inflight);
                    let owned_key = key.to_string();
                    let execution = async move {
                        let result = op.await;
                        registry.lock().await.remove(&owned_key);
                        result
                    }
                    .boxed()
                    .shared();

                    inflight.insert(key.to_string(), execution.clone());
                    execution
                },
            }
        };

        shared.await
    }

    /// Number of keys currently executing.
    pub async fn in_flight(&self) -> usize {
        self.inflight.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::sync::Notify;

    use super::*;
    use crate::error::DeliveryError;

    #[tokio::test]
    async fn concurrent_identical_calls_execute_once() {
        let coalescer = Arc::new(Coalescer::<u64>::default());
        let executions = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let callers: Vec<_> = (0..10)
            .map(|_| {
                let coalescer = Arc::clone(&coalescer);
                let executions = Arc::clone(&executions);
                let release = Arc::clone(&release);
                tokio::spawn(async move {
                    coalescer
                        .run("neil|42", async move {
                            executions.fetch_add(1, Ordering::SeqCst);
                            release.notified().await;
                            Ok(7)
                        })
                        .await
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        release.notify_one();

        for caller in callers {
            assert_eq!(caller.await.unwrap().unwrap(), 7);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.in_flight().await, 0);
    }

    #[tokio::test]
    async fn errors_are_shared_with_all_waiters() {
        let coalescer = Arc::new(Coalescer::<u64>::default());
        let release = Arc::new(Notify::new());

        let callers: Vec<_> = (0..3)
            .map(|_| {
                let coalescer = Arc::clone(&coalescer);
                let release = Arc::clone(&release);
                tokio::spawn(async move {
                    coalescer
                        .run("neil|42", async move {
                            release.notified().await;
                            Err(DeliveryError::upstream(503))
                        })
                        .await
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        release.notify_one();

        for caller in callers {
            assert_eq!(caller.await.unwrap().unwrap_err().status(), Some(503));
        }
    }

    #[tokio::test]
    async fn sequential_calls_run_again() {
        let coalescer = Coalescer::<usize>::default();
        let executions = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let executions = Arc::clone(&executions);
            coalescer
                .run("neil|42", async move { Ok(executions.fetch_add(1, Ordering::SeqCst)) })
                .await
                .unwrap();
        }

        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn disabled_coalescer_runs_every_call() {
        let coalescer = Arc::new(Coalescer::<()>::new(false));
        let executions = Arc::new(AtomicUsize::new(0));

        let callers: Vec<_> = (0..4)
            .map(|_| {
                let coalescer = Arc::clone(&coalescer);
                let executions = Arc::clone(&executions);
                tokio::spawn(async move {
                    coalescer
                        .run("neil|42", async move {
                            executions.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok(())
                        })
                        .await
                })
            })
            .collect();

        for caller in callers {
            caller.await.unwrap().unwrap();
        }
        assert_eq!(executions.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn key_normalizes_username() {
        assert_eq!(Coalescer::<()>::key(" Neil ", "u1:42:start"), "neil|u1:42:start");
    }
}
