use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

/// Internal Value Store
///
/// Materialized values are stored here. Once sealed, the store rejects all further mutation.
pub(crate) struct Store<K: Hash + Eq, V> {
    entries: DashMap<K, Arc<V>>,
    sealed: RwLock<bool>,
}

impl<K, V> Store<K, V>
where
    K: Hash + Eq,
{
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity),
            sealed: RwLock::new(false),
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Insert a value, unless the store has been sealed. Returns whether the value was retained.
    pub(crate) fn insert(&self, key: K, value: Arc<V>) -> bool {
        let sealed = self.sealed.read();
        if *sealed {
            return false;
        }
        self.entries.insert(key, value);
        true
    }

    pub(crate) fn remove(&self, key: &K) -> Option<Arc<V>> {
        let sealed = self.sealed.read();
        if *sealed {
            return None;
        }
        self.entries.remove(key).map(|(_, value)| value)
    }

    /// Seal the store and hand back everything it held.
    pub(crate) fn seal(&self) -> Vec<Arc<V>> {
        let mut sealed = self.sealed.write();
        *sealed = true;
        let values = self
            .entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.entries.clear();
        values
    }

    pub(crate) fn count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_store_rejects_mutation() {
        let store: Store<&str, usize> = Store::with_capacity(4);
        assert!(store.insert("a", Arc::new(1)));
        assert!(store.insert("b", Arc::new(2)));

        let mut drained: Vec<usize> = store.seal().into_iter().map(|v| *v).collect();
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
        assert_eq!(store.count(), 0);

        assert!(!store.insert("c", Arc::new(3)));
        assert!(store.get(&"c").is_none());
        assert!(store.remove(&"a").is_none());
        assert!(store.seal().is_empty());
    }
}
