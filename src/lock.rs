use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;

/// Per-key asynchronous locks, serializing computation creation for a key.
pub(crate) struct KeyedLocks<K: Hash + Eq> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K> KeyedLocks<K>
where
    K: Hash + Eq + Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Wait until the lock for `key` is free and take it.
    ///
    /// If the returned future is dropped while waiting, the key's lock slot is still reclaimed.
    pub(crate) async fn lock(&self, key: K) -> KeyedLockGuard<'_, K> {
        let mut guard = KeyedLockGuard {
            locks: self,
            key,
            permit: None,
        };
        // Declared after the guard, so an abandoned wait releases its lock before the guard drops.
        let lock = Arc::clone(self.locks.entry(guard.key.clone()).or_default().value());
        let acquire = lock.lock_owned();
        tokio::pin!(acquire);
        guard.permit = Some(acquire.as_mut().await);
        guard
    }

    #[cfg(test)]
    fn count(&self) -> usize {
        self.locks.len()
    }
}

/// Releases the key's lock when dropped, and reclaims the lock slot if nobody else wants it.
pub(crate) struct KeyedLockGuard<'a, K: Hash + Eq> {
    locks: &'a KeyedLocks<K>,
    key: K,
    permit: Option<OwnedMutexGuard<()>>,
}

impl<K> Drop for KeyedLockGuard<'_, K>
where
    K: Hash + Eq,
{
    fn drop(&mut self) {
        drop(self.permit.take());
        // Only the map holds the lock now: no waiter, no holder.
        self.locks
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn it_serializes_the_same_key() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("key").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("key").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
        assert_eq!(locks.count(), 0);
    }

    #[tokio::test]
    async fn it_reclaims_the_slot_of_an_abandoned_waiter() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("key").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("key").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The contender is woken by the release but dropped before it runs again.
        drop(guard);
        assert_eq!(locks.count(), 1);
        contender.abort();
        assert!(contender.await.unwrap_err().is_cancelled());
        assert_eq!(locks.count(), 0);
    }

    #[tokio::test]
    async fn it_does_not_serialize_different_keys() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("a").await;
        let b = tokio::time::timeout(Duration::from_secs(1), locks.lock("b")).await;
        assert!(b.is_ok());
        assert_eq!(locks.count(), 2);
    }
}
