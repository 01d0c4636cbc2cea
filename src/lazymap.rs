use crate::cache::Store;
use crate::dispose::teardown;
use crate::dispose::Dispose;
use crate::dispose::Teardown;
use crate::in_flight::Computation;
use crate::in_flight::Outcome;
use crate::in_flight::Registration;
use crate::in_flight::Registry;
use crate::lock::KeyedLocks;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

/// Lazy map errors.
#[derive(Debug, Error)]
pub enum LazyMapError<E> {
    /// The map has been disposed. Not retryable on this instance.
    #[error("Lazy map has been disposed")]
    Disposed,
    /// The caller's cancellation token fired while it was waiting.
    #[error("Operation cancelled")]
    Cancelled,
    /// The factory failed. Every caller attached to the computation sees the same error.
    #[error("Factory failed: {0}")]
    Factory(Arc<E>),
    /// The factory panicked.
    #[error("Factory panicked")]
    Panicked,
}

impl<E> LazyMapError<E> {
    /// Whether a later call on the same map may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Disposed)
    }

    /// The factory's own error, if that is what this is.
    pub fn factory_error(&self) -> Option<&E> {
        match self {
            Self::Factory(error) => Some(error),
            _ => None,
        }
    }
}

// Derived Clone would demand `E: Clone`.
impl<E> Clone for LazyMapError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Disposed => Self::Disposed,
            Self::Cancelled => Self::Cancelled,
            Self::Factory(error) => Self::Factory(Arc::clone(error)),
            Self::Panicked => Self::Panicked,
        }
    }
}

struct Inner<K: Hash + Eq, V, E> {
    store: Store<K, V>,
    in_flight: Registry<K, V, E>,
    creation: KeyedLocks<K>,
    disposed: AtomicBool,
    teardown: Option<Teardown<V>>,
    request_deduplicated_counter: AtomicU64,
    request_total_counter: AtomicU64,
}

/// Lazily computed, concurrently shared values.
///
/// Each key's value is produced by a caller supplied factory the first time it is requested.
/// However many callers ask for a missing key at once, the factory runs only once and every caller
/// receives the same value (or the same failure). Failures are never cached.
///
/// Clones share the same underlying map.
pub struct LazyMap<K: Hash + Eq, V, E> {
    inner: Arc<Inner<K, V, E>>,
}

impl<K, V, E> Clone for LazyMap<K, V, E>
where
    K: Hash + Eq,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, E> fmt::Debug for LazyMap<K, V, E>
where
    K: Hash + Eq,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyMap")
            .field("materialized", &self.inner.store.count())
            .field("in flight", &self.inner.in_flight.count())
            .field("disposed", &self.inner.disposed.load(Ordering::Acquire))
            .finish()
    }
}

impl<K, V, E> Default for LazyMap<K, V, E>
where
    K: Clone + Send + Sync + Eq + Hash + 'static,
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> Inner<K, V, E>
where
    K: Clone + Send + Sync + Eq + Hash + 'static,
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Build the shared computation for `key`. Nothing runs until it is first polled.
    fn compute<F, Fut>(
        self: Arc<Self>,
        key: K,
        id: u64,
        factory: F,
        cancellation: CancellationToken,
    ) -> Computation<V, E>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let fut = async move {
            let _registration = Registration {
                registry: &self.in_flight,
                key: &key,
                id,
            };
            let _creation = self.creation.lock(key.clone()).await;

            if self.is_disposed() {
                return Err(LazyMapError::Disposed);
            }
            // Someone else may have finished this key while we waited for the lock.
            if let Some(value) = self.store.get(&key) {
                trace!(id, "value materialized while waiting for creation lock");
                return Ok(value);
            }

            debug!(id, "invoking factory");
            let produced = AssertUnwindSafe(async move { factory(cancellation).await })
                .catch_unwind()
                .await;
            match produced {
                Ok(Ok(value)) => {
                    let value = Arc::new(value);
                    if self.store.insert(key.clone(), Arc::clone(&value)) {
                        debug!(id, "factory succeeded");
                    } else {
                        debug!(id, "factory succeeded after disposal, value not retained");
                    }
                    Ok(value)
                }
                Ok(Err(error)) => {
                    debug!(id, "factory failed");
                    Err(LazyMapError::Factory(Arc::new(error)))
                }
                Err(_) => {
                    warn!(id, "factory panicked");
                    Err(LazyMapError::Panicked)
                }
            }
        };
        fut.boxed().shared()
    }
}

impl<K, V, E> LazyMap<K, V, E>
where
    K: Clone + Send + Sync + Eq + Hash + 'static,
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Create a new, empty map. Values are left untouched when the map is disposed.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create a new, empty map with room for at least `capacity` values.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(capacity, None)
    }

    fn build(capacity: usize, teardown: Option<Teardown<V>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: Store::with_capacity(capacity),
                in_flight: Registry::new(),
                creation: KeyedLocks::new(),
                disposed: AtomicBool::new(false),
                teardown,
                request_deduplicated_counter: AtomicU64::new(0),
                request_total_counter: AtomicU64::new(0),
            }),
        }
    }

    /// Return the number of materialized values.
    pub fn count(&self) -> usize {
        self.inner.store.count()
    }

    /// Return the number of registered in-flight computations.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.count()
    }

    /// Return whether the map has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Return the deduplicated request count: requests answered from the map or by joining a
    /// computation somebody else started.
    pub fn request_deduplicated_count(&self) -> u64 {
        self.inner
            .request_deduplicated_counter
            .load(Ordering::SeqCst)
    }

    /// Return the total request count.
    pub fn request_count(&self) -> u64 {
        self.inner.request_total_counter.load(Ordering::SeqCst)
    }

    /// Get the value for `key`, using `factory` to produce it if it is missing.
    ///
    /// Many concurrent callers can ask for the same key, but only one factory is invoked. The
    /// others wait for it and receive the same value or the same
    /// [`LazyMapError::Factory`]/[`LazyMapError::Panicked`] failure. A failure leaves the key
    /// absent, so the next call invokes its factory afresh.
    ///
    /// `cancellation` is handed to the factory this call starts. If it fires while this call is
    /// waiting, this call returns [`LazyMapError::Cancelled`]; the computation carries on for any
    /// other callers attached to it.
    pub async fn get<F, Fut>(
        &self,
        key: K,
        factory: F,
        cancellation: &CancellationToken,
    ) -> Result<Arc<V>, LazyMapError<E>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let inner = &self.inner;
        inner.request_total_counter.fetch_add(1, Ordering::SeqCst);
        if inner.is_disposed() {
            return Err(LazyMapError::Disposed);
        }

        if let Some(value) = inner.store.get(&key) {
            inner
                .request_deduplicated_counter
                .fetch_add(1, Ordering::SeqCst);
            trace!("value already materialized");
            return Ok(value);
        }

        if let Some(computation) = inner.in_flight.attach(&key) {
            inner
                .request_deduplicated_counter
                .fetch_add(1, Ordering::SeqCst);
            trace!("attached to in-flight computation");
            return Self::wait(computation, cancellation).await;
        }

        if cancellation.is_cancelled() {
            return Err(LazyMapError::Cancelled);
        }

        let token = cancellation.clone();
        let (computation, started) = inner.in_flight.attach_or_register(key.clone(), |id| {
            Inner::compute(Arc::clone(inner), key, id, factory, token)
        });
        if !started {
            // Lost the registration race to a concurrent caller.
            inner
                .request_deduplicated_counter
                .fetch_add(1, Ordering::SeqCst);
        }
        Self::wait(computation, cancellation).await
    }

    async fn wait(
        computation: Computation<V, E>,
        cancellation: &CancellationToken,
    ) -> Outcome<V, E> {
        tokio::select! {
            biased;
            outcome = computation => outcome,
            () = cancellation.cancelled() => {
                trace!("stopped waiting for computation");
                Err(LazyMapError::Cancelled)
            }
        }
    }

    /// Remove `key`, whether its value is materialized or still being computed.
    ///
    /// An in-flight computation is not cancelled: its callers still receive its result, which is
    /// stored when it lands. A `get` issued after the removal starts a new computation, which runs
    /// its factory only once the earlier one has finished, and only if the key is still absent.
    ///
    /// Removal never waits, so `_cancellation` has nothing to interrupt.
    pub fn remove(&self, key: &K, _cancellation: &CancellationToken) -> Result<(), LazyMapError<E>> {
        if self.inner.is_disposed() {
            return Err(LazyMapError::Disposed);
        }
        let materialized = self.inner.store.remove(key).is_some();
        let in_flight = self.inner.in_flight.remove(key);
        debug!(materialized, in_flight, "removed entry");
        Ok(())
    }

    /// Dispose of the map.
    ///
    /// The first call releases every materialized value (for maps built with
    /// [`LazyMap::disposing`]) and empties the map; every later call returns immediately. Once
    /// disposed, `get` and `remove` fail with [`LazyMapError::Disposed`]. A factory already running
    /// is allowed to finish: its callers still receive its result, but the value is not retained.
    pub async fn dispose_async(&self) {
        if self
            .inner
            .disposed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let values = self.inner.store.seal();
        self.inner.in_flight.clear();
        debug!(count = values.len(), "disposing lazy map");
        if let Some(teardown) = self.inner.teardown {
            for value in values {
                teardown(value).await;
            }
        }
    }

    /// Dispose of the map, blocking the current thread until the release of every value is done.
    ///
    /// See [`LazyMap::dispose_async`]. Must not be called from within an asynchronous context
    /// whose executor the release relies on.
    pub fn dispose(&self) {
        futures::executor::block_on(self.dispose_async());
    }
}

impl<K, V, E> LazyMap<K, V, E>
where
    K: Clone + Send + Sync + Eq + Hash + 'static,
    V: Dispose + 'static,
    E: Send + Sync + 'static,
{
    /// Create a new, empty map whose values are released through [`Dispose`] when the map is
    /// disposed.
    pub fn disposing() -> Self {
        Self::disposing_with_capacity(0)
    }

    /// Create a new, empty, disposing map with room for at least `capacity` values.
    pub fn disposing_with_capacity(capacity: usize) -> Self {
        Self::build(capacity, Some(teardown::<V> as Teardown<V>))
    }
}
