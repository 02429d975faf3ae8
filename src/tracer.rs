//! Tracer trait for observing cache activity.
//!
//! This module defines the [`Tracer`] trait and related types. The default
//! [`NoopTracer`] discards everything; [`LogTracer`] forwards every event to
//! the `tracing` crate.
//!
//! # Example
//!
//! ```ignore
//! use query_stream::{OperationOutcome, QueryCache, Tracer, TracerKey};
//!
//! struct MissCounter(AtomicUsize);
//!
//! impl Tracer for MissCounter {
//!     fn on_fetch_start(&self, _key: &TracerKey, _force_refresh: bool) {
//!         self.0.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//!
//! let cache = QueryCache::builder(fetcher).tracer(MissCounter(AtomicUsize::new(0))).build();
//! ```

use std::fmt::Debug;
use std::sync::Arc;

use crate::tracker::OperationKind;

/// A key in a type-erased form for tracing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TracerKey {
    /// The key type name (e.g., "alloc::string::String")
    pub key_type: &'static str,
    /// Debug representation of the key (e.g., "\"user:1\"")
    pub key_debug: String,
}

impl TracerKey {
    /// Create a tracer key from a typed key.
    #[inline]
    pub fn new<K: Debug>(key: &K) -> Self {
        Self {
            key_type: std::any::type_name::<K>(),
            key_debug: format!("{:?}", key),
        }
    }
}

/// How a fetch or update ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// Fetched value was cached and published.
    Stored,
    /// Updater confirmed the optimistic value.
    Confirmed,
    /// No updater configured; the optimistic write stands alone.
    LocalOnly,
    /// The filter rejected the result.
    Filtered,
    /// The collaborator failed.
    Failed {
        /// Display form of the error.
        message: String,
    },
    /// Superseded or disposed; no effects were applied.
    Cancelled,
}

/// Tracer trait for observing cache activity.
///
/// All methods have default empty implementations, so you only need to
/// override the events you're interested in.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` as the tracer may be called from
/// multiple tasks concurrently.
pub trait Tracer: Send + Sync + 'static {
    /// Called when `get_data` is served from the cache.
    #[inline]
    fn on_cache_hit(&self, _key: &TracerKey) {}

    /// Called when a fetch is handed to the fetcher.
    #[inline]
    fn on_fetch_start(&self, _key: &TracerKey, _force_refresh: bool) {}

    /// Called when a fetch ends.
    #[inline]
    fn on_fetch_end(&self, _key: &TracerKey, _outcome: &OperationOutcome) {}

    /// Called after the optimistic write of an update.
    #[inline]
    fn on_update_start(&self, _key: &TracerKey) {}

    /// Called when an update ends.
    #[inline]
    fn on_update_end(&self, _key: &TracerKey, _outcome: &OperationOutcome) {}

    /// Called when a failed update is rolled back.
    ///
    /// `restored` is false when the key had no previous value and was removed.
    #[inline]
    fn on_rollback(&self, _key: &TracerKey, _restored: bool) {}

    /// Called when a new operation cancels an in-flight one of the same kind.
    #[inline]
    fn on_superseded(&self, _key: &TracerKey, _kind: OperationKind) {}

    /// Called when the whole cache is cleared.
    #[inline]
    fn on_cache_cleared(&self, _entries: usize) {}

    /// Called once when the cache is disposed.
    #[inline]
    fn on_disposed(&self, _cancelled: usize) {}
}

impl<T: Tracer + ?Sized> Tracer for Arc<T> {
    fn on_cache_hit(&self, key: &TracerKey) {
        (**self).on_cache_hit(key)
    }

    fn on_fetch_start(&self, key: &TracerKey, force_refresh: bool) {
        (**self).on_fetch_start(key, force_refresh)
    }

    fn on_fetch_end(&self, key: &TracerKey, outcome: &OperationOutcome) {
        (**self).on_fetch_end(key, outcome)
    }

    fn on_update_start(&self, key: &TracerKey) {
        (**self).on_update_start(key)
    }

    fn on_update_end(&self, key: &TracerKey, outcome: &OperationOutcome) {
        (**self).on_update_end(key, outcome)
    }

    fn on_rollback(&self, key: &TracerKey, restored: bool) {
        (**self).on_rollback(key, restored)
    }

    fn on_superseded(&self, key: &TracerKey, kind: OperationKind) {
        (**self).on_superseded(key, kind)
    }

    fn on_cache_cleared(&self, entries: usize) {
        (**self).on_cache_cleared(entries)
    }

    fn on_disposed(&self, cancelled: usize) {
        (**self).on_disposed(cancelled)
    }
}

/// Zero-cost tracer that discards all events.
///
/// This is the default tracer for [`QueryCache`](crate::QueryCache).
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// Tracer that forwards events to the `tracing` crate at debug level.
pub struct LogTracer;

impl Tracer for LogTracer {
    fn on_cache_hit(&self, key: &TracerKey) {
        tracing::debug!(key = %key.key_debug, "cache hit");
    }

    fn on_fetch_start(&self, key: &TracerKey, force_refresh: bool) {
        tracing::debug!(key = %key.key_debug, force_refresh, "fetch started");
    }

    fn on_fetch_end(&self, key: &TracerKey, outcome: &OperationOutcome) {
        tracing::debug!(key = %key.key_debug, ?outcome, "fetch ended");
    }

    fn on_update_start(&self, key: &TracerKey) {
        tracing::debug!(key = %key.key_debug, "update started");
    }

    fn on_update_end(&self, key: &TracerKey, outcome: &OperationOutcome) {
        tracing::debug!(key = %key.key_debug, ?outcome, "update ended");
    }

    fn on_rollback(&self, key: &TracerKey, restored: bool) {
        tracing::debug!(key = %key.key_debug, restored, "update rolled back");
    }

    fn on_superseded(&self, key: &TracerKey, kind: OperationKind) {
        tracing::debug!(key = %key.key_debug, ?kind, "operation superseded");
    }

    fn on_cache_cleared(&self, entries: usize) {
        tracing::debug!(entries, "cache cleared");
    }

    fn on_disposed(&self, cancelled: usize) {
        tracing::debug!(cancelled, "cache disposed");
    }
}
