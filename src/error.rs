//! Error types for the prefix cache.
//!
//! Every builder and cache operation returns [`Result`]. Retries belong to the
//! caller: a capacity failure is retried after eviction, a version conflict
//! after re-reading the published cache. Only corruption is final for the
//! affected cache instance.

use thiserror::Error;

use crate::cache::block::BlockId;
use crate::cache::builder::BuilderState;
use crate::storage::StoreError;

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    /// No cached state for the requested path / next-token pair.
    #[error("no cached KV state for the requested token")]
    KeyNotFound,

    /// A block allocation failed and no new block could be obtained.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// The builder is stale relative to a concurrently committed revision.
    #[error("version conflict: builder derives from {builder}, published is {published}")]
    VersionConflict { builder: u64, published: u64 },

    /// Invariant validation failed.
    #[error("corruption: {0}")]
    Corruption(String),

    #[error("KV state has {actual} bytes, layout expects {expected}")]
    PayloadSize { expected: usize, actual: usize },

    #[error("{0} is not a live block of this cache")]
    UnknownBlock(BlockId),

    #[error("node handle no longer refers to a live node")]
    StaleHandle,

    #[error("builder is {0}, expected open")]
    NotOpen(BuilderState),

    #[error("no version increment to roll back")]
    NothingToRollback,

    #[error("incompatible cache layout: {0}")]
    IncompatibleLayout(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl CacheError {
    /// Whether the caller may retry the failed operation (possibly after
    /// eviction or re-reading the published cache).
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CacheError::Corruption(_) | CacheError::IncompatibleLayout(_) | CacheError::InvalidConfig(_)
        )
    }

    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        CacheError::Corruption(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_corruption_is_final() {
        assert!(CacheError::KeyNotFound.is_retryable());
        assert!(CacheError::CapacityExceeded("full".into()).is_retryable());
        assert!(CacheError::VersionConflict { builder: 1, published: 2 }.is_retryable());
        assert!(!CacheError::corruption("bad edge").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = CacheError::PayloadSize {
            expected: 256,
            actual: 12,
        };
        assert_eq!(err.to_string(), "KV state has 12 bytes, layout expects 256");
    }
}
