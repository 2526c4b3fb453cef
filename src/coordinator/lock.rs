//! Run lock -- at most one evaluation run in flight per process.
//!
//! Acquisition never waits: a second caller is told "no" immediately. The
//! guard releases the lock when dropped, so every exit path of the protected
//! section (early return, `?`, panic unwind, timeout) gives it back.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

/// Single-permit semaphore; inspecting it never takes the permit.
#[derive(Clone)]
pub struct RunLock {
    inner: Arc<Semaphore>,
}

impl Default for RunLock {
    fn default() -> Self {
        Self {
            inner: Arc::new(Semaphore::new(1)),
        }
    }
}

/// Proof of exclusive ownership for the duration of one run.
pub struct RunLockGuard {
    _permit: OwnedSemaphorePermit,
    acquired_at: DateTime<Utc>,
}

impl RunLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock if it is free. Returns `None` if another run holds it.
    pub fn try_acquire(&self) -> Option<RunLockGuard> {
        let permit = Arc::clone(&self.inner).try_acquire_owned().ok()?;
        trace!("run lock acquired");
        Some(RunLockGuard {
            _permit: permit,
            acquired_at: Utc::now(),
        })
    }

    pub fn is_held(&self) -> bool {
        self.inner.available_permits() == 0
    }
}

impl RunLockGuard {
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Explicit release; equivalent to dropping the guard.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        trace!("run lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_refused() {
        let lock = RunLock::new();
        let guard = lock.try_acquire().expect("free lock");
        assert!(lock.is_held());
        assert!(lock.try_acquire().is_none());
        assert!(lock.clone().try_acquire().is_none(), "clones share one lock");

        guard.release();
        assert!(!lock.is_held());
        assert!(lock.try_acquire().is_some());
    }

    #[tokio::test]
    async fn test_released_when_holder_panics() {
        let lock = RunLock::new();
        let held = lock.clone();
        let result = tokio::spawn(async move {
            let _guard = held.try_acquire().unwrap();
            panic!("evaluation blew up");
        })
        .await;
        assert!(result.is_err());
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_released_when_holder_is_cancelled() {
        let lock = RunLock::new();
        let held = lock.clone();
        let task = tokio::spawn(async move {
            let _guard = held.try_acquire().unwrap();
            std::future::pending::<()>().await;
        });
        tokio::task::yield_now().await;
        while !lock.is_held() {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;
        assert!(!lock.is_held());
    }
}
