//! Provides a safe, asynchronous (tokio based), lazily computed concurrent map.
//!
//! If you have a slow or expensive operation producing values by key, [`LazyMap`] will make sure
//! it runs at most once per key, however many callers ask for that key at the same time. The
//! first caller for a missing key starts the computation; everybody else arriving while it is in
//! flight waits for it and receives the same value. Finished values are kept in the map and handed
//! out as [`std::sync::Arc`]s.
//!
//! Failures are never cached: if the factory fails, every waiting caller sees the same
//! [`LazyMapError::Factory`] error and the key is left absent, so the next call tries again.
//!
//! Example
//! ```
//! use lazymap::LazyMap;
//! use lazymap::LazyMapError;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let map: LazyMap<&str, String, std::io::Error> = LazyMap::new();
//! let token = CancellationToken::new();
//!
//! let value = map
//!     .get("greeting", |_cancel| async { Ok("hello".to_string()) }, &token)
//!     .await?;
//! assert_eq!(*value, "hello");
//!
//! // The value is now materialized: this factory never runs.
//! let again = map
//!     .get("greeting", |_cancel| async { Ok("goodbye".to_string()) }, &token)
//!     .await?;
//! assert_eq!(*again, "hello");
//!
//! map.dispose_async().await;
//! assert!(matches!(
//!     map.remove(&"greeting", &token),
//!     Err(LazyMapError::Disposed)
//! ));
//! # Ok::<(), LazyMapError<std::io::Error>>(())
//! # }).unwrap();
//! ```
//!
//! Values which hold resources can implement [`Dispose`]. A map created with
//! [`LazyMap::disposing`] releases each of its values exactly once when it is disposed.
//!
mod cache;
mod dispose;
mod in_flight;
mod lazymap;
mod lock;

pub use crate::dispose::Dispose;
pub use crate::lazymap::LazyMap;
pub use crate::lazymap::LazyMapError;
