//! Key bound and stream item types.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crate::CacheError;

/// Trait for types that can serve as cache keys.
///
/// Automatically implemented for all types that implement
/// `Hash + Eq + Clone + Debug + Send + Sync + 'static`.
pub trait CacheKey: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static> CacheKey for T {}

/// An item delivered on a key's stream.
///
/// `Miss` is the "no value" marker. It is distinct from every value of `T`,
/// so a cache of `Option<U>` can still tell a cached `None` from a miss.
pub enum Notification<T> {
    /// A value was fetched, written or restored.
    Value(Arc<T>),
    /// The key has no cached value (never written, cleared or rolled back).
    Miss,
    /// An operation on the key failed.
    Error(CacheError),
}

impl<T> Notification<T> {
    /// Build a `Value` or `Miss` item from an optional value.
    pub fn from_option(value: Option<Arc<T>>) -> Self {
        match value {
            Some(value) => Notification::Value(value),
            None => Notification::Miss,
        }
    }

    /// Returns the value if this is a `Value` item.
    pub fn value(&self) -> Option<&Arc<T>> {
        match self {
            Notification::Value(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the error if this is an `Error` item.
    pub fn error(&self) -> Option<&CacheError> {
        match self {
            Notification::Error(err) => Some(err),
            _ => None,
        }
    }

    /// Returns true if this is a `Miss` item.
    pub fn is_miss(&self) -> bool {
        matches!(self, Notification::Miss)
    }
}

impl<T> Clone for Notification<T> {
    fn clone(&self) -> Self {
        match self {
            Notification::Value(value) => Notification::Value(value.clone()),
            Notification::Miss => Notification::Miss,
            Notification::Error(err) => Notification::Error(err.clone()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Notification<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Value(value) => write!(f, "Notification::Value({:?})", value),
            Notification::Miss => write!(f, "Notification::Miss"),
            Notification::Error(err) => write!(f, "Notification::Error({})", err),
        }
    }
}
