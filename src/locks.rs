//! Per-key async locks
//!
//! Serializes work on a single upload id or user id while letting
//! unrelated keys proceed in parallel. Entries are dropped from the map
//! once nobody holds or waits on them.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Entry {
    mutex: Arc<AsyncMutex<()>>,
    /// Holders plus waiters
    users: usize,
}

type LockMap<K> = Arc<Mutex<HashMap<K, Entry>>>;

pub struct KeyedLocks<K> {
    locks: LockMap<K>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &K) -> KeyedGuard<K> {
        let mutex = {
            let mut locks = self.locks.lock();
            let entry = locks.entry(key.clone()).or_insert_with(|| Entry {
                mutex: Arc::new(AsyncMutex::new(())),
                users: 0,
            });
            entry.users += 1;
            entry.mutex.clone()
        };

        // Registered before waiting: a cancelled wait still gives its slot back
        let mut slot = KeyedGuard {
            guard: None,
            key: key.clone(),
            locks: self.locks.clone(),
        };
        slot.guard = Some(mutex.lock_owned().await);
        slot
    }

    /// Number of keys currently held or awaited
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct KeyedGuard<K: Eq + Hash> {
    guard: Option<OwnedMutexGuard<()>>,
    key: K,
    locks: LockMap<K>,
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        self.guard.take();

        let mut locks = self.locks.lock();
        let idle = match locks.get_mut(&self.key) {
            Some(entry) => {
                entry.users = entry.users.saturating_sub(1);
                entry.users == 0
            }
            None => false,
        };
        if idle {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let locks = locks.clone();
            let active = active.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&"upload-1").await;
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _a = locks.lock(&1u32).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock(&2u32)).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_entry() {
        let locks = KeyedLocks::new();
        let held = locks.lock(&"upload-1").await;

        let mut waiter = Box::pin(locks.lock(&"upload-1"));
        assert!(futures::poll!(&mut waiter).is_pending());

        // Holder leaves while the waiter is queued, then the waiter gives up
        drop(held);
        drop(waiter);
        assert!(locks.is_empty());

        let _again = locks.lock(&"upload-1").await;
        assert_eq!(locks.len(), 1);
    }
}
