//! Error types for cache operations.
//!
//! Every failure except [`CacheError::Cancelled`] and [`CacheError::Disposed`]
//! is delivered twice: as the `Err` returned to the caller and as a
//! [`Notification::Error`](crate::Notification::Error) on the key's stream.

use std::sync::Arc;

use thiserror::Error;

/// Errors produced by fetches and updates.
///
/// Cheap to clone: collaborator errors are held behind an `Arc` so the same
/// error can be returned to the caller and broadcast to subscribers.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// A successful fetch or update confirmation was rejected by the filter.
    #[error("data for key {key} was rejected by the filter")]
    DataFiltered {
        /// Debug representation of the key.
        key: String,
    },

    /// The updater failed and the optimistic value was rolled back.
    #[error("optimistic update for key {key} failed: {cause}")]
    OptimisticUpdateFailed {
        /// Debug representation of the key.
        key: String,
        /// The error raised by the updater.
        cause: Arc<anyhow::Error>,
    },

    /// The fetcher failed. Displays as the underlying error.
    #[error("{0}")]
    Fetch(Arc<anyhow::Error>),

    /// The operation was superseded by a newer one for the same key, or the
    /// cache was disposed while it was in flight.
    #[error("operation cancelled")]
    Cancelled,

    /// The cache was disposed before the operation started.
    #[error("cache disposed")]
    Disposed,
}

impl CacheError {
    pub(crate) fn filtered(key: &impl std::fmt::Debug) -> Self {
        CacheError::DataFiltered {
            key: format!("{:?}", key),
        }
    }

    pub(crate) fn update_failed(key: &impl std::fmt::Debug, cause: anyhow::Error) -> Self {
        CacheError::OptimisticUpdateFailed {
            key: format!("{:?}", key),
            cause: Arc::new(cause),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            CacheError::DataFiltered { .. } => "data_filtered",
            CacheError::OptimisticUpdateFailed { .. } => "optimistic_update_failed",
            CacheError::Fetch(_) => "fetch_failed",
            CacheError::Cancelled => "cancelled",
            CacheError::Disposed => "disposed",
        }
    }

    /// Returns the collaborator error behind `Fetch` or `OptimisticUpdateFailed`.
    pub fn cause(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            CacheError::Fetch(cause) | CacheError::OptimisticUpdateFailed { cause, .. } => {
                Some(cause)
            }
            _ => None,
        }
    }

    /// Attempts to downcast the collaborator error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.cause().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns true for `DataFiltered`.
    pub fn is_filtered(&self) -> bool {
        matches!(self, CacheError::DataFiltered { .. })
    }

    /// Returns true for `OptimisticUpdateFailed`.
    pub fn is_update_failed(&self) -> bool {
        matches!(self, CacheError::OptimisticUpdateFailed { .. })
    }

    /// Returns true for `Cancelled`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CacheError::Cancelled)
    }
}
