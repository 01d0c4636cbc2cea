use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

/// Resource release for values held by a [`LazyMap`](crate::LazyMap).
///
/// When a map built with [`LazyMap::disposing`](crate::LazyMap::disposing) is disposed, every
/// materialized value is released exactly once through [`Dispose::dispose_async`]. Implement
/// [`Dispose::dispose`] for synchronous release, or override `dispose_async` when the release
/// needs to await.
#[async_trait]
pub trait Dispose: Send + Sync {
    /// Release synchronously.
    fn dispose(&self) {}

    /// Release asynchronously. Defaults to [`Dispose::dispose`].
    async fn dispose_async(&self) {
        self.dispose();
    }
}

/// Releases one value during the disposal sweep.
pub(crate) type Teardown<V> = fn(Arc<V>) -> BoxFuture<'static, ()>;

pub(crate) fn teardown<V>(value: Arc<V>) -> BoxFuture<'static, ()>
where
    V: Dispose + 'static,
{
    Box::pin(async move { value.dispose_async().await })
}
