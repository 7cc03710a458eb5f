//! Authoritative published version.
//!
//! The authority is the transaction context shared by every builder of one
//! cache lineage. It is passed explicitly to `seal`; there is no global
//! counter. Publishing is a compare-and-swap from the version a builder
//! derives from to the version it commits, so at most one of several builders
//! opened on the same revision can publish.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::cache::sealed::CacheMeta;
use crate::error::{CacheError, Result};

#[derive(Debug, Default)]
pub struct VersionAuthority {
    published: AtomicU64,
    latest: Mutex<Option<CacheMeta>>,
}

impl VersionAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authority whose current revision is `meta` (e.g. after a restart).
    pub fn with_published(meta: CacheMeta) -> Self {
        Self {
            published: AtomicU64::new(meta.version),
            latest: Mutex::new(Some(meta)),
        }
    }

    /// Version of the current published revision, 0 before the first seal.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    /// Metadata of the current published revision.
    pub fn latest(&self) -> Option<CacheMeta> {
        self.latest.lock().clone()
    }

    /// Publish `meta` if the current revision is still `base`.
    pub fn publish(&self, base: u64, meta: &CacheMeta) -> Result<()> {
        let mut latest = self.latest.lock();
        self.published
            .compare_exchange(base, meta.version, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|published| CacheError::VersionConflict {
                builder: base,
                published,
            })?;
        *latest = Some(meta.clone());
        Ok(())
    }
}
