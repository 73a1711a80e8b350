//! Per-key async lock. Entries are held weakly and dropped with their last guard.

use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap<K> = Arc<DashMap<K, Weak<Mutex<()>>>>;

/// Held while a key is locked. Waiters are served in the order they called `lock`.
pub struct KeyedLockGuard<K: Hash + Eq + Clone> {
    guard: Option<OwnedMutexGuard<()>>,
    key: K,
    locks: LockMap<K>,
}

impl<K: Hash + Eq + Clone> Drop for KeyedLockGuard<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold a strong reference. Upgrades happen under the shard lock,
        // so the count check cannot race one.
        self.locks.remove_if(&self.key, |_, weak| weak.strong_count() == 0);
    }
}

pub struct KeyedAsyncLock<K: Hash + Eq + Clone> {
    locks: LockMap<K>,
}

impl<K: Hash + Eq + Clone> Default for KeyedAsyncLock<K> {
    fn default() -> Self { Self { locks: Arc::new(DashMap::new()) } }
}

impl<K: Hash + Eq + Clone> KeyedAsyncLock<K> {
    pub fn new() -> Self { Self::default() }

    pub async fn lock(&self, key: &K) -> KeyedLockGuard<K> {
        let lock = self.get_or_create(key);
        let guard = lock.lock_owned().await;
        KeyedLockGuard { guard: Some(guard), key: key.clone(), locks: self.locks.clone() }
    }

    fn get_or_create(&self, key: &K) -> Arc<Mutex<()>> {
        loop {
            match self.locks.entry(key.clone()) {
                Entry::Occupied(o) => {
                    if let Some(strong) = o.get().upgrade() {
                        return strong;
                    }
                    o.remove();
                }
                Entry::Vacant(v) => {
                    let strong = Arc::new(Mutex::new(()));
                    v.insert(Arc::downgrade(&strong));
                    return strong;
                }
            }
        }
    }

    /// Keys with a live lock.
    pub fn len(&self) -> usize { self.locks.iter().filter(|e| e.value().strong_count() > 0).count() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
