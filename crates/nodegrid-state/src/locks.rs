//! Lock capability guarding mutations of the node repository.
//!
//! Allocation takes the lock of the application it allocates for, then the
//! global unallocated-node lock. Locks are released when their guard drops.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use nodegrid_core::ApplicationId;
use tracing::debug;

use crate::error::{StateError, StateResult};

/// Path of the lock held while taking unallocated nodes.
pub const UNALLOCATED_LOCK: &str = "/provision/v1/locks/unallocated";

pub fn application_lock_path(application: &ApplicationId) -> String {
    format!("/provision/v1/locks/{}", application.serialized_form())
}

/// Held lock. Dropping it releases the lock.
pub struct LockGuard {
    path: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    pub fn new(path: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            path: path.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            debug!(path = %self.path, "lock released");
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("path", &self.path).finish()
    }
}

/// A provider of named exclusive locks.
pub trait Locks: Send + Sync {
    fn lock(&self, path: &str, timeout: Duration) -> StateResult<LockGuard>;
}

/// Process-local locks.
#[derive(Clone, Default)]
pub struct InMemoryLocks {
    held: Arc<(Mutex<HashSet<String>>, Condvar)>,
}

impl InMemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, path: &str) -> bool {
        let (held, _) = &*self.held;
        held.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path)
    }
}

impl Locks for InMemoryLocks {
    fn lock(&self, path: &str, timeout: Duration) -> StateResult<LockGuard> {
        let deadline = Instant::now() + timeout;
        let (held, released) = &*self.held;
        let mut paths = held.lock().unwrap_or_else(PoisonError::into_inner);
        while paths.contains(path) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StateError::LockTimeout {
                    path: path.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }
            let (next, _) = released
                .wait_timeout(paths, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            paths = next;
        }
        paths.insert(path.to_string());
        debug!(%path, "lock acquired");

        let shared = Arc::clone(&self.held);
        let owned_path = path.to_string();
        Ok(LockGuard::new(path, move || {
            let (held, released) = &*shared;
            held.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&owned_path);
            released.notify_all();
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn guard_releases_on_drop() {
        let locks = InMemoryLocks::new();
        {
            let guard = locks.lock(UNALLOCATED_LOCK, Duration::from_secs(1)).unwrap();
            assert_eq!(guard.path(), UNALLOCATED_LOCK);
            assert!(locks.is_held(UNALLOCATED_LOCK));
        }
        assert!(!locks.is_held(UNALLOCATED_LOCK));
    }

    #[test]
    fn contended_lock_times_out() {
        let locks = InMemoryLocks::new();
        let _guard = locks.lock("a", Duration::from_secs(1)).unwrap();
        let err = locks.lock("a", Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, StateError::LockTimeout { .. }));
        assert!(locks.lock("b", Duration::from_millis(20)).is_ok());
    }

    #[test]
    fn waiter_acquires_after_release() {
        let locks = InMemoryLocks::new();
        let guard = locks.lock("a", Duration::from_secs(1)).unwrap();
        let other = locks.clone();
        let waiter = thread::spawn(move || other.lock("a", Duration::from_secs(5)).is_ok());
        thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn application_lock_paths_differ_per_application() {
        let a = application_lock_path(&ApplicationId::new("t", "a", "default"));
        let b = application_lock_path(&ApplicationId::new("t", "b", "default"));
        assert_ne!(a, b);
        assert!(a.ends_with("t:a:default"));
    }
}
