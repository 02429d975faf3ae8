//! Collaborators that supply and confirm data.
//!
//! The cache never talks to a network itself. It is handed a [`Fetcher`]
//! (required) and an [`Updater`] (optional), plus optional filters applied
//! to their successful results.
//!
//! # Example
//!
//! ```ignore
//! use query_stream::{FetchFn, QueryCache, UpdateFn};
//!
//! let cache = QueryCache::builder(FetchFn::new(|id: u64| async move {
//!     api::load_user(id).await
//! }))
//! .updater(UpdateFn::new(|id: u64, user: Arc<User>| async move {
//!     api::save_user(id, &user).await
//! }))
//! .build();
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::key::CacheKey;

/// Post-processes a successful result. Returning `None` rejects it.
///
/// A rejected result fails the operation with
/// [`CacheError::DataFiltered`](crate::CacheError::DataFiltered).
pub type Filter<K, T> = Arc<dyn Fn(&K, T) -> Option<T> + Send + Sync>;

/// Loads the value for a key.
///
/// Retries, timeouts and authentication are the fetcher's business; any
/// error it returns is propagated to the caller and the key's stream.
#[async_trait]
pub trait Fetcher<K, T>: Send + Sync + 'static {
    /// Fetch the current value for `key`.
    async fn fetch(&self, key: &K) -> anyhow::Result<T>;
}

/// Confirms a locally applied value with the remote side.
#[async_trait]
pub trait Updater<K, T>: Send + Sync + 'static {
    /// Push `value` for `key`, returning the remote confirmation.
    ///
    /// An error rolls the optimistic write back.
    async fn update(&self, key: &K, value: Arc<T>) -> anyhow::Result<T>;
}

#[async_trait]
impl<K, T, F> Fetcher<K, T> for Arc<F>
where
    K: Sync + 'static,
    T: 'static,
    F: Fetcher<K, T> + ?Sized,
{
    async fn fetch(&self, key: &K) -> anyhow::Result<T> {
        (**self).fetch(key).await
    }
}

#[async_trait]
impl<K, T, F> Updater<K, T> for Arc<F>
where
    K: Sync + 'static,
    T: Send + Sync + 'static,
    F: Updater<K, T> + ?Sized,
{
    async fn update(&self, key: &K, value: Arc<T>) -> anyhow::Result<T> {
        (**self).update(key, value).await
    }
}

/// Function-backed [`Fetcher`].
///
/// Wraps a closure `Fn(K) -> Fut` that creates a fresh future per fetch.
#[derive(Debug, Clone)]
pub struct FetchFn<F> {
    f: F,
}

impl<F> FetchFn<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<K, T, F, Fut> Fetcher<K, T> for FetchFn<F>
where
    K: CacheKey,
    T: Send + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    async fn fetch(&self, key: &K) -> anyhow::Result<T> {
        (self.f)(key.clone()).await
    }
}

/// Function-backed [`Updater`].
///
/// Wraps a closure `Fn(K, Arc<T>) -> Fut`.
#[derive(Debug, Clone)]
pub struct UpdateFn<F> {
    f: F,
}

impl<F> UpdateFn<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<K, T, F, Fut> Updater<K, T> for UpdateFn<F>
where
    K: CacheKey,
    T: Send + Sync + 'static,
    F: Fn(K, Arc<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    async fn update(&self, key: &K, value: Arc<T>) -> anyhow::Result<T> {
        (self.f)(key.clone(), value).await
    }
}
