//! Cache runtime: fetch and update pipelines.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{ChannelRegistry, Subscription};
use crate::key::{CacheKey, Notification};
use crate::source::{Fetcher, Filter, Updater};
use crate::storage::Storage;
use crate::tracer::{NoopTracer, OperationOutcome, Tracer, TracerKey};
use crate::tracker::{OperationKind, OperationTracker};
use crate::CacheError;

/// Cache contents and the channels that mirror them.
///
/// Both live under one lock so a cache write and its publish are observed
/// together.
struct CacheState<K, T> {
    storage: Storage<K, T>,
    channels: ChannelRegistry<K, T>,
}

impl<K: CacheKey, T> CacheState<K, T> {
    /// Write `value` (or remove the key for `None`) and publish the same state.
    fn commit(&mut self, key: &K, value: Option<Arc<T>>) {
        match &value {
            Some(value) => {
                self.storage.set(key.clone(), value.clone());
            }
            None => {
                self.storage.remove(key);
            }
        }
        self.channels.publish(key, Notification::from_option(value));
    }

    fn publish_error(&mut self, key: &K, err: CacheError) {
        self.channels.publish(key, Notification::Error(err));
    }
}

struct Inner<K, T> {
    fetcher: Arc<dyn Fetcher<K, T>>,
    updater: Option<Arc<dyn Updater<K, T>>>,
    fetch_filter: Option<Filter<K, T>>,
    update_filter: Option<Filter<K, T>>,
    tracer: Arc<dyn Tracer>,
    state: Mutex<CacheState<K, T>>,
    fetches: OperationTracker<K>,
    updates: OperationTracker<K>,
}

/// A per-key reactive cache.
///
/// Fetches values through a [`Fetcher`], keeps the last good value per key,
/// streams every change per key, and applies updates optimistically with
/// rollback when the [`Updater`] fails.
///
/// This is cheap to clone - all state is behind one `Arc`.
///
/// # Example
///
/// ```ignore
/// let cache = QueryCache::new(FetchFn::new(|key: String| async move {
///     Ok::<_, anyhow::Error>(format!("fetched_{key}"))
/// }));
///
/// let mut stream = cache.get_stream(&"key1".to_string());
/// let value = cache.get_data("key1".to_string(), false).await?;
/// assert_eq!(*value, "fetched_key1");
/// assert_eq!(cache.get_current_value(&"key1".to_string()), Some(value));
/// ```
pub struct QueryCache<K, T> {
    inner: Arc<Inner<K, T>>,
}

impl<K, T> Clone for QueryCache<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: CacheKey, T: Send + Sync + 'static> QueryCache<K, T> {
    /// Create a cache with only a fetcher.
    pub fn new(fetcher: impl Fetcher<K, T>) -> Self {
        Self::builder(fetcher).build()
    }

    /// Create a builder for configuring updater, filters and tracer.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let cache = QueryCache::builder(FetchFn::new(load_user))
    ///     .updater(UpdateFn::new(save_user))
    ///     .fetch_filter(|_id, user: User| (!user.deleted).then_some(user))
    ///     .tracer(LogTracer)
    ///     .build();
    /// ```
    pub fn builder(fetcher: impl Fetcher<K, T>) -> QueryCacheBuilder<K, T> {
        QueryCacheBuilder::new(fetcher)
    }

    /// Live stream of notifications for `key`.
    ///
    /// The stream first yields the last item published for the key (if any),
    /// then every later item. After [`dispose`](Self::dispose) the returned
    /// stream is already ended.
    pub fn get_stream(&self, key: &K) -> Subscription<T> {
        let channel = self.inner.state.lock().channels.channel_for(key);
        channel.subscribe()
    }

    /// The latest value known for `key`, or `None` for a miss.
    pub fn get_current_value(&self, key: &K) -> Option<Arc<T>> {
        self.inner.state.lock().channels.latest_value(key)
    }

    /// Return the value for `key`, fetching it when not cached or when
    /// `force_refresh` is set.
    ///
    /// Any in-flight fetch for the same key is cancelled first; its caller
    /// receives [`CacheError::Cancelled`] and its result is discarded.
    ///
    /// # Errors
    ///
    /// - `CacheError::Fetch` - the fetcher failed
    /// - `CacheError::DataFiltered` - the fetch filter rejected the result
    /// - `CacheError::Cancelled` - superseded by a newer fetch, or disposed
    /// - `CacheError::Disposed` - called after dispose
    pub async fn get_data(&self, key: K, force_refresh: bool) -> Result<Arc<T>, CacheError> {
        let inner = &*self.inner;
        if self.is_disposed() {
            return Err(CacheError::Disposed);
        }
        let tracer_key = TracerKey::new(&key);

        if inner.fetches.cancel(&key) {
            self.superseded(&key, &tracer_key, OperationKind::Fetch);
        }

        if !force_refresh {
            let mut state = inner.state.lock();
            if let Some(cached) = state.storage.get(&key) {
                // Re-publish so subscribers that joined before the cache was warm see it.
                state
                    .channels
                    .publish(&key, Notification::Value(cached.clone()));
                drop(state);
                inner.tracer.on_cache_hit(&tracer_key);
                return Ok(cached);
            }
        }

        let (mut ticket, ()) = inner.fetches.begin(&key, || ());
        if ticket.superseded_previous() {
            self.superseded(&key, &tracer_key, OperationKind::Fetch);
        }
        inner.tracer.on_fetch_start(&tracer_key, force_refresh);

        let result = tokio::select! {
            biased;
            _ = ticket.cancelled() => None,
            result = inner.fetcher.fetch(&key) => Some(result),
        };
        let Some(result) = result else {
            inner
                .tracer
                .on_fetch_end(&tracer_key, &OperationOutcome::Cancelled);
            return Err(CacheError::Cancelled);
        };

        let outcome = match result {
            Ok(raw) => match apply_filter(inner.fetch_filter.as_ref(), &key, raw) {
                Some(value) => Ok(Arc::new(value)),
                None => Err(CacheError::filtered(&key)),
            },
            Err(cause) => Err(CacheError::Fetch(Arc::new(cause))),
        };

        let settled = inner.fetches.settle(&mut ticket, || {
            let mut state = inner.state.lock();
            match &outcome {
                Ok(value) => state.commit(&key, Some(value.clone())),
                Err(err) => state.publish_error(&key, err.clone()),
            }
        });
        if settled.is_none() {
            inner
                .tracer
                .on_fetch_end(&tracer_key, &OperationOutcome::Cancelled);
            return Err(CacheError::Cancelled);
        }

        if let Err(err) = &outcome {
            tracing::debug!(key = ?key, error = %err, label = err.as_label(), "fetch failed");
        }
        inner
            .tracer
            .on_fetch_end(&tracer_key, &describe(&outcome, OperationOutcome::Stored));
        outcome
    }

    /// Shorthand for `get_data(key, false)`.
    pub async fn get(&self, key: K) -> Result<Arc<T>, CacheError> {
        self.get_data(key, false).await
    }

    /// Shorthand for `get_data(key, true)`.
    pub async fn refresh(&self, key: K) -> Result<Arc<T>, CacheError> {
        self.get_data(key, true).await
    }

    /// Write `value` for `key` immediately, then confirm it with the updater.
    ///
    /// The value is cached and published before the updater is called. If the
    /// updater fails, the previous value (or a miss) is restored and published.
    ///
    /// Returns the updater's (filtered) confirmation, or `None` when no updater
    /// is configured. The confirmation is not written to the cache; read
    /// [`get_current_value`](Self::get_current_value) for the stored value.
    ///
    /// # Errors
    ///
    /// - `CacheError::OptimisticUpdateFailed` - the updater failed; rolled back
    /// - `CacheError::DataFiltered` - the update filter rejected the confirmation;
    ///   the optimistic value stays
    /// - `CacheError::Cancelled` - superseded by a newer update, or disposed
    /// - `CacheError::Disposed` - called after dispose
    pub async fn update_data(&self, key: K, value: T) -> Result<Option<Arc<T>>, CacheError> {
        let inner = &*self.inner;
        if self.is_disposed() {
            return Err(CacheError::Disposed);
        }
        let tracer_key = TracerKey::new(&key);
        let value = Arc::new(value);

        let (mut ticket, previous) = inner.updates.begin(&key, || {
            let mut state = inner.state.lock();
            let previous = state.storage.get(&key);
            state.commit(&key, Some(value.clone()));
            previous
        });
        if ticket.superseded_previous() {
            self.superseded(&key, &tracer_key, OperationKind::Update);
        }
        inner.tracer.on_update_start(&tracer_key);

        let Some(updater) = inner.updater.as_ref() else {
            inner.updates.settle(&mut ticket, || ());
            inner
                .tracer
                .on_update_end(&tracer_key, &OperationOutcome::LocalOnly);
            return Ok(None);
        };

        let result = tokio::select! {
            biased;
            _ = ticket.cancelled() => None,
            result = updater.update(&key, value.clone()) => Some(result),
        };
        let Some(result) = result else {
            inner
                .tracer
                .on_update_end(&tracer_key, &OperationOutcome::Cancelled);
            return Err(CacheError::Cancelled);
        };

        let (outcome, rollback) = match result {
            Ok(raw) => match apply_filter(inner.update_filter.as_ref(), &key, raw) {
                Some(confirmed) => (Ok(Some(Arc::new(confirmed))), false),
                None => (Err(CacheError::filtered(&key)), false),
            },
            Err(cause) => (Err(CacheError::update_failed(&key, cause)), true),
        };

        let settled = inner.updates.settle(&mut ticket, || {
            let mut state = inner.state.lock();
            if rollback {
                state.commit(&key, previous.clone());
            }
            if let Err(err) = &outcome {
                state.publish_error(&key, err.clone());
            }
        });
        if settled.is_none() {
            inner
                .tracer
                .on_update_end(&tracer_key, &OperationOutcome::Cancelled);
            return Err(CacheError::Cancelled);
        }

        if rollback {
            tracing::debug!(key = ?key, restored = previous.is_some(), "optimistic update rolled back");
            inner.tracer.on_rollback(&tracer_key, previous.is_some());
        }
        inner
            .tracer
            .on_update_end(&tracer_key, &describe(&outcome, OperationOutcome::Confirmed));
        outcome
    }

    /// Remove every cached value and publish a miss to every known key.
    ///
    /// In-flight fetches and updates are not cancelled, and streams stay open.
    pub fn clear_cache(&self) {
        let cleared = {
            let mut state = self.inner.state.lock();
            let cleared = state.storage.clear();
            state.channels.publish_miss_to_all();
            cleared
        };
        self.inner.tracer.on_cache_cleared(cleared);
    }

    /// Remove the cached value for one key and publish a miss for it.
    ///
    /// Returns false if the key was not cached.
    pub fn remove(&self, key: &K) -> bool {
        let mut state = self.inner.state.lock();
        if state.storage.remove(key).is_none() {
            return false;
        }
        if let Some(channel) = state.channels.get(key) {
            channel.publish(Notification::Miss);
        }
        true
    }

    /// Cancel every in-flight operation and close every stream.
    ///
    /// Terminal: later calls to `get_data`/`update_data` return
    /// [`CacheError::Disposed`] and `get_stream` returns ended streams.
    /// Calling it again does nothing.
    pub fn dispose(&self) {
        let inner = &*self.inner;
        let cancelled = inner.fetches.cancel_all() + inner.updates.cancel_all();

        let channels = {
            let mut state = inner.state.lock();
            if state.channels.is_closed() {
                None
            } else {
                state.storage.clear();
                Some(state.channels.close_all())
            }
        };

        if let Some(channels) = channels {
            tracing::debug!(cancelled, channels, "query cache disposed");
            inner.tracer.on_disposed(cancelled);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().channels.is_closed()
    }

    /// Keys that currently have a cached value.
    pub fn cached_keys(&self) -> Vec<K> {
        self.inner.state.lock().storage.keys()
    }

    /// Number of cached values.
    pub fn len(&self) -> usize {
        self.inner.state.lock().storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the key has a cached value.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.state.lock().storage.contains(key)
    }

    /// True while a fetch for `key` is in flight.
    pub fn is_fetching(&self, key: &K) -> bool {
        self.inner.fetches.is_active(key)
    }

    /// True while an update for `key` is in flight.
    pub fn is_updating(&self, key: &K) -> bool {
        self.inner.updates.is_active(key)
    }

    /// Number of in-flight operations of `kind` across all keys.
    pub fn in_flight(&self, kind: OperationKind) -> usize {
        match kind {
            OperationKind::Fetch => self.inner.fetches.len(),
            OperationKind::Update => self.inner.updates.len(),
        }
    }

    fn superseded(&self, key: &K, tracer_key: &TracerKey, kind: OperationKind) {
        tracing::trace!(key = ?key, ?kind, "in-flight operation superseded");
        self.inner.tracer.on_superseded(tracer_key, kind);
    }
}

fn apply_filter<K, T>(filter: Option<&Filter<K, T>>, key: &K, raw: T) -> Option<T> {
    match filter {
        Some(filter) => filter(key, raw),
        None => Some(raw),
    }
}

fn describe<V>(outcome: &Result<V, CacheError>, success: OperationOutcome) -> OperationOutcome {
    match outcome {
        Ok(_) => success,
        Err(CacheError::DataFiltered { .. }) => OperationOutcome::Filtered,
        Err(err) => OperationOutcome::Failed {
            message: err.to_string(),
        },
    }
}

/// Builder for [`QueryCache`].
///
/// The fetcher is required; updater, filters and tracer are optional.
pub struct QueryCacheBuilder<K, T> {
    fetcher: Arc<dyn Fetcher<K, T>>,
    updater: Option<Arc<dyn Updater<K, T>>>,
    fetch_filter: Option<Filter<K, T>>,
    update_filter: Option<Filter<K, T>>,
    tracer: Arc<dyn Tracer>,
}

impl<K: CacheKey, T: Send + Sync + 'static> QueryCacheBuilder<K, T> {
    /// Create a new builder around the required fetcher.
    pub fn new(fetcher: impl Fetcher<K, T>) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            updater: None,
            fetch_filter: None,
            update_filter: None,
            tracer: Arc::new(NoopTracer),
        }
    }

    /// Set the updater used to confirm optimistic writes.
    ///
    /// Without one, `update_data` only writes locally and returns `Ok(None)`.
    pub fn updater(mut self, updater: impl Updater<K, T>) -> Self {
        self.updater = Some(Arc::new(updater));
        self
    }

    /// Filter applied to every successful fetch. Returning `None` rejects it.
    pub fn fetch_filter(
        mut self,
        filter: impl Fn(&K, T) -> Option<T> + Send + Sync + 'static,
    ) -> Self {
        self.fetch_filter = Some(Arc::new(filter));
        self
    }

    /// Filter applied to every successful update confirmation. Returning
    /// `None` rejects it.
    pub fn update_filter(
        mut self,
        filter: impl Fn(&K, T) -> Option<T> + Send + Sync + 'static,
    ) -> Self {
        self.update_filter = Some(Arc::new(filter));
        self
    }

    /// Set the tracer receiving cache events.
    pub fn tracer(mut self, tracer: impl Tracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Build the cache.
    pub fn build(self) -> QueryCache<K, T> {
        QueryCache {
            inner: Arc::new(Inner {
                fetcher: self.fetcher,
                updater: self.updater,
                fetch_filter: self.fetch_filter,
                update_filter: self.update_filter,
                tracer: self.tracer,
                state: Mutex::new(CacheState {
                    storage: Storage::new(),
                    channels: ChannelRegistry::new(),
                }),
                fetches: OperationTracker::new(OperationKind::Fetch),
                updates: OperationTracker::new(OperationKind::Update),
            }),
        }
    }
}
