//! Keyed async locks
//!
//! Used to serialize transaction submission per chain (so the signer never
//! races itself on nonces) and status settling per configuration. A key's
//! mutex is dropped from the map once nobody holds or waits for it.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap<K> = Arc<DashMap<K, Arc<Mutex<()>>>>;

/// One async mutex per key, created on first use
pub struct KeyedLocks<K> {
    locks: LockMap<K>,
}

/// Exclusive access to one key; releasing it evicts the key when idle
pub struct KeyedGuard<K: Eq + Hash> {
    locks: LockMap<K>,
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's own reference left: no holder, no waiter
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl<K> KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Wait for exclusive access to `key`
    pub async fn acquire(&self, key: &K) -> KeyedGuard<K> {
        // The map guard must be released before awaiting the mutex
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = lock.lock_owned().await;
        KeyedGuard {
            locks: self.locks.clone(),
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently held or awaited
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.len()
    }
}

impl<K> Default for KeyedLocks<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
