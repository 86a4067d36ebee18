//! Distributed per-group lock. Convergence cycles for the same group must
//! never run concurrently (spec.md §5, "per-group serialization"); the lock
//! is the mechanism that enforces it across process boundaries. This crate
//! only defines the contract — a real deployment backs it with whatever
//! coordination service it already runs (etcd, Zookeeper, a database row).

use crate::error::LockError;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait LockProvider: Send + Sync {
    type Guard: LockGuard;

    /// Acquires the lock at `path` (conventionally `/convergence/{group_id}`,
    /// spec.md §5). An already-held lock is queued rather than rejected
    /// outright: the caller polls until either it acquires the lock or
    /// `acquire_timeout` elapses, at which point it gives up with
    /// `LockError::AcquireTimedOut`. `LockError::Contended` is reserved for
    /// a backend that can distinguish "held by someone else, don't bother
    /// waiting" from ordinary queued contention.
    async fn acquire(&self, path: &str, acquire_timeout: Duration) -> Result<Self::Guard, LockError>;
}

/// A held lock. Released by dropping the guard; implementations that need
/// an async release path (a network round-trip) should spawn it from
/// `Drop` rather than block, since `Drop` cannot be async.
pub trait LockGuard: Send {
    fn path(&self) -> &str;
}

/// In-memory `LockProvider` for tests: a single process-wide map of held
/// paths. Mirrors the shape of a real coordination-service lock without any
/// I/O, so unit tests (here and in integration tests) can exercise
/// contention and release without a broker.
pub mod fake {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct FakeLockProvider {
        held: Arc<Mutex<HashSet<String>>>,
    }

    impl FakeLockProvider {
        pub fn new() -> Self {
            FakeLockProvider::default()
        }

        pub fn is_held(&self, path: &str) -> bool {
            self.held.lock().unwrap().contains(path)
        }
    }

    pub struct FakeLockGuard {
        path: String,
        held: Arc<Mutex<HashSet<String>>>,
    }

    impl LockGuard for FakeLockGuard {
        fn path(&self) -> &str {
            &self.path
        }
    }

    impl Drop for FakeLockGuard {
        fn drop(&mut self) {
            self.held.lock().unwrap().remove(&self.path);
        }
    }

    #[async_trait]
    impl LockProvider for FakeLockProvider {
        type Guard = FakeLockGuard;

        async fn acquire(&self, path: &str, acquire_timeout: Duration) -> Result<Self::Guard, LockError> {
            let deadline = tokio::time::Instant::now() + acquire_timeout;
            loop {
                {
                    let mut held = self.held.lock().unwrap();
                    if !held.contains(path) {
                        held.insert(path.to_string());
                        return Ok(FakeLockGuard { path: path.to_string(), held: self.held.clone() });
                    }
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(LockError::AcquireTimedOut {
                        group_id: crate::model::GroupId(path.to_string()),
                        duration: acquire_timeout,
                    });
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeLockProvider;
    use super::*;

    #[tokio::test]
    async fn uncontended_acquire_succeeds() {
        let provider = FakeLockProvider::new();
        let guard = provider.acquire("/convergence/g1", Duration::from_millis(50)).await.unwrap();
        assert_eq!(guard.path(), "/convergence/g1");
    }

    #[tokio::test]
    async fn contended_acquire_times_out() {
        let provider = FakeLockProvider::new();
        let _held = provider.acquire("/convergence/g1", Duration::from_millis(50)).await.unwrap();
        let result = provider.acquire("/convergence/g1", Duration::from_millis(20)).await;
        assert!(matches!(result, Err(LockError::AcquireTimedOut { .. })));
    }

    #[tokio::test]
    async fn dropping_guard_releases_the_lock() {
        let provider = FakeLockProvider::new();
        {
            let _guard = provider.acquire("/convergence/g1", Duration::from_millis(50)).await.unwrap();
            assert!(provider.is_held("/convergence/g1"));
        }
        assert!(!provider.is_held("/convergence/g1"));
        let reacquired = provider.acquire("/convergence/g1", Duration::from_millis(50)).await;
        assert!(reacquired.is_ok());
    }
}
