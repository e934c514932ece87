//! A single-value read cache with a time-to-live.
//!
//! Readers that poll the repository share one loaded value until it expires
//! or a write invalidates it.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct TtlCache<T> {
    ttl: Duration,
    slot: Mutex<Option<(Instant, Arc<T>)>>,
}

impl<T> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    /// The cached value, or the result of `load` if the cache is empty or stale.
    pub fn get_or_load<E>(&self, load: impl FnOnce() -> Result<T, E>) -> Result<Arc<T>, E> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((loaded_at, value)) = slot.as_ref() {
            if loaded_at.elapsed() < self.ttl {
                return Ok(Arc::clone(value));
            }
        }
        let value = Arc::new(load()?);
        *slot = Some((Instant::now(), Arc::clone(&value)));
        Ok(value)
    }

    pub fn invalidate(&self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn serves_cached_value_until_invalidated() {
        let cache = TtlCache::new(Duration::from_secs(60));
        let loads = Cell::new(0);
        let load = || -> Result<u32, ()> {
            loads.set(loads.get() + 1);
            Ok(loads.get())
        };

        assert_eq!(*cache.get_or_load(load).unwrap(), 1);
        assert_eq!(*cache.get_or_load(load).unwrap(), 1);
        cache.invalidate();
        assert_eq!(*cache.get_or_load(load).unwrap(), 2);
    }

    #[test]
    fn zero_ttl_always_reloads() {
        let cache = TtlCache::new(Duration::ZERO);
        assert_eq!(*cache.get_or_load(|| Ok::<_, ()>(1)).unwrap(), 1);
        assert_eq!(*cache.get_or_load(|| Ok::<_, ()>(2)).unwrap(), 2);
    }

    #[test]
    fn load_errors_are_not_cached() {
        let cache: TtlCache<u32> = TtlCache::new(Duration::from_secs(60));
        assert!(cache.get_or_load(|| Err("boom")).is_err());
        assert_eq!(*cache.get_or_load(|| Ok::<_, &str>(7)).unwrap(), 7);
    }
}
