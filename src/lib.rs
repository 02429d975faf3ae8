//! Query-Stream: a per-key reactive cache.
//!
//! Given a key space `K` and a value space `T`, this crate fetches, caches,
//! streams and optimistically updates values. Every key gets a live stream
//! plus a synchronous "latest known value" accessor.
//!
//! # Key Features
//!
//! - **Replaying streams**: each key has one broadcast channel that replays its
//!   last item to new subscribers
//! - **Supersede on restart**: starting a fetch (or update) for a key cancels the
//!   previous one; its late result is discarded
//! - **Optimistic updates**: values are written and published before the remote
//!   call, and rolled back if it fails
//! - **Explicit misses**: "no value" is `None` / [`Notification::Miss`], never a
//!   value of `T`
//! - **Observable**: plug in a [`Tracer`], or [`LogTracer`] for `tracing` output
//!
//! # Example
//!
//! ```ignore
//! use query_stream::{FetchFn, QueryCache, UpdateFn};
//!
//! let cache = QueryCache::builder(FetchFn::new(|key: String| async move {
//!     Ok::<_, anyhow::Error>(format!("fetched_{key}"))
//! }))
//! .updater(UpdateFn::new(|_key: String, value: Arc<String>| async move {
//!     Ok::<_, anyhow::Error>((*value).clone())
//! }))
//! .build();
//!
//! let value = cache.get_data("key1".to_string(), false).await?;
//! assert_eq!(*value, "fetched_key1");
//!
//! cache.update_data("key1".to_string(), "new_data".to_string()).await?;
//! assert_eq!(cache.get_current_value(&"key1".to_string()).as_deref().map(String::as_str), Some("new_data"));
//! ```
//!
//! # Concurrency
//!
//! [`QueryCache`] is `Clone + Send + Sync`. Operations only suspend while
//! awaiting a collaborator; cache writes and their publishes happen together
//! under a short lock, so the cached value and the stream never disagree once
//! an operation has settled.

mod channel;
mod error;
mod key;
mod runtime;
mod source;
mod storage;
pub mod tracer;
mod tracker;

pub use channel::Subscription;
pub use error::CacheError;
pub use key::{CacheKey, Notification};
pub use runtime::{QueryCache, QueryCacheBuilder};
pub use source::{FetchFn, Fetcher, Filter, UpdateFn, Updater};
pub use tracer::{LogTracer, NoopTracer, OperationOutcome, Tracer, TracerKey};
pub use tracker::OperationKind;
