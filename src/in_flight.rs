use std::hash::Hash;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::future::Shared;
use futures::future::WeakShared;

use crate::lazymap::LazyMapError;

/// What every caller attached to one computation eventually observes.
pub(crate) type Outcome<V, E> = Result<Arc<V>, LazyMapError<E>>;

/// A single, shareable factory invocation.
pub(crate) type Computation<V, E> = Shared<BoxFuture<'static, Outcome<V, E>>>;

struct InFlight<V, E> {
    id: u64,
    // Weak, so that a computation every caller has abandoned is dropped rather than kept alive
    // by the registry.
    handle: WeakShared<BoxFuture<'static, Outcome<V, E>>>,
}

/// Internal In-Flight Registry
///
/// Computations which have been started but not yet resolved are registered here, so that late
/// callers can attach to them.
pub(crate) struct Registry<K: Hash + Eq, V, E> {
    entries: DashMap<K, InFlight<V, E>>,
    next_id: AtomicU64,
}

impl<K, V, E> Registry<K, V, E>
where
    K: Hash + Eq,
{
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Attach to the live computation for `key`, if there is one.
    pub(crate) fn attach(&self, key: &K) -> Option<Computation<V, E>> {
        // The map guard is released inside the closure, before the caller can drop the handle.
        self.entries.get(key).and_then(|entry| entry.handle.upgrade())
    }

    /// Attach to the live computation for `key`, or register the one built by `start`.
    ///
    /// The boolean is true when `start` was used.
    pub(crate) fn attach_or_register<S>(&self, key: K, start: S) -> (Computation<V, E>, bool)
    where
        S: FnOnce(u64) -> Computation<V, E>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if let Some(live) = occupied.get().handle.upgrade() {
                    return (live, false);
                }
                let computation = start(id);
                if let Some(handle) = computation.downgrade() {
                    occupied.insert(InFlight { id, handle });
                }
                (computation, true)
            }
            Entry::Vacant(vacant) => {
                let computation = start(id);
                if let Some(handle) = computation.downgrade() {
                    vacant.insert(InFlight { id, handle });
                }
                (computation, true)
            }
        }
    }

    /// Remove the entry for `key`, but only if it still belongs to computation `id`.
    pub(crate) fn retire(&self, key: &K, id: u64) {
        self.entries.remove_if(key, |_, in_flight| in_flight.id == id);
    }

    pub(crate) fn remove(&self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }

    pub(crate) fn count(&self) -> usize {
        self.entries.len()
    }
}

/// Retires a computation's registry entry when dropped, whichever way the computation ends.
pub(crate) struct Registration<'a, K: Hash + Eq, V, E> {
    pub(crate) registry: &'a Registry<K, V, E>,
    pub(crate) key: &'a K,
    pub(crate) id: u64,
}

impl<K, V, E> Drop for Registration<'_, K, V, E>
where
    K: Hash + Eq,
{
    fn drop(&mut self) {
        self.registry.retire(self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn ready(value: usize) -> Computation<usize, ()> {
        async move { Ok(Arc::new(value)) }.boxed().shared()
    }

    #[tokio::test]
    async fn it_attaches_to_a_live_computation() {
        let registry: Registry<&str, usize, ()> = Registry::new();
        let (first, started) = registry.attach_or_register("key", |_| ready(1));
        assert!(started);

        let (second, started) = registry.attach_or_register("key", |_| ready(2));
        assert!(!started);
        assert!(registry.attach(&"key").is_some());

        assert_eq!(*first.await.unwrap(), 1);
        assert_eq!(*second.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn it_replaces_an_abandoned_computation() {
        let registry: Registry<&str, usize, ()> = Registry::new();
        let (first, _) = registry.attach_or_register("key", |_| ready(1));
        drop(first);
        assert!(registry.attach(&"key").is_none());

        let (second, started) = registry.attach_or_register("key", |_| ready(2));
        assert!(started);
        assert_eq!(*second.await.unwrap(), 2);
    }

    #[test]
    fn it_only_retires_its_own_generation() {
        let registry: Registry<&str, usize, ()> = Registry::new();
        let (_first, _) = registry.attach_or_register("key", |_| ready(1));
        assert!(registry.remove(&"key"));

        let mut current = None;
        let (_second, _) = registry.attach_or_register("key", |id| {
            current = Some(id);
            ready(2)
        });
        let current = current.unwrap();

        registry.retire(&"key", current + 1);
        assert_eq!(registry.count(), 1);
        registry.retire(&"key", current);
        assert_eq!(registry.count(), 0);
    }
}
