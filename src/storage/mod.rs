//! Backing object store for block and tree objects.
//!
//! The cache core only talks to storage through [`ObjectStore`]:
//! - [`memory`]: in-process store with a byte budget
//! - [`disk`]: sealed objects as files, optionally zstd-compressed
//!
//! A writable buffer is allocated, written at offsets and then sealed into an
//! immutable object. Buffers and objects are released independently.

pub mod disk;
pub mod memory;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{StorageBackend, StorageConfig};

pub use disk::DiskStore;
pub use memory::MemoryStore;

/// Handle to a writable buffer in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BufferId(pub u64);

/// Identifier of a sealed, immutable object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf-{}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj-{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store exhausted: requested {requested} bytes, {available} available")]
    Exhausted { requested: usize, available: usize },

    #[error("unknown buffer {0}")]
    UnknownBuffer(BufferId),

    #[error("unknown object {0}")]
    UnknownObject(ObjectId),

    #[error("range {offset}+{len} outside buffer {id} of {size} bytes")]
    OutOfBounds {
        id: BufferId,
        offset: usize,
        len: usize,
        size: usize,
    },

    #[error("object file {0} is malformed")]
    Malformed(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage collaborator used by Build, Seal and Resolve.
///
/// Implementations must be safe to share between builders; all calls are
/// synchronous.
pub trait ObjectStore: Send + Sync {
    /// Allocate a zeroed writable buffer of `size` bytes.
    fn allocate(&self, size: usize) -> Result<BufferId, StoreError>;

    /// Write `bytes` into a buffer at `offset`.
    fn write(&self, id: BufferId, offset: usize, bytes: &[u8]) -> Result<(), StoreError>;

    /// Read `len` bytes of a buffer starting at `offset`.
    fn read(&self, id: BufferId, offset: usize, len: usize) -> Result<Bytes, StoreError>;

    /// Freeze the current buffer contents into a new immutable object.
    fn seal(&self, id: BufferId) -> Result<ObjectId, StoreError>;

    /// Resolve a sealed object by identifier.
    fn get(&self, object: ObjectId) -> Result<Bytes, StoreError>;

    /// Delete a sealed object.
    fn delete(&self, object: ObjectId) -> Result<(), StoreError>;

    /// Drop a writable buffer.
    fn release(&self, id: BufferId) -> Result<(), StoreError>;
}

/// Check that `offset..offset + len` lies inside a buffer of `size` bytes.
pub(crate) fn check_range(id: BufferId, offset: usize, len: usize, size: usize) -> Result<(), StoreError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(StoreError::OutOfBounds {
            id,
            offset,
            len,
            size,
        }),
    }
}

/// Store one opaque object: allocate, write, seal, release the buffer.
pub fn put_object(store: &dyn ObjectStore, bytes: &[u8]) -> Result<ObjectId, StoreError> {
    let buffer = store.allocate(bytes.len())?;
    let sealed = store
        .write(buffer, 0, bytes)
        .and_then(|_| store.seal(buffer));
    let released = store.release(buffer);
    let object = sealed?;
    released?;
    Ok(object)
}

/// Open the store selected by the configuration.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>, StoreError> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new(config.capacity_bytes))),
        StorageBackend::Disk => {
            let level = config.zstd_compression.then_some(config.zstd_level);
            Ok(Arc::new(DiskStore::open(
                config.path.clone(),
                config.capacity_bytes,
                level,
            )?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_range() {
        let id = BufferId(1);
        assert!(check_range(id, 0, 16, 16).is_ok());
        assert!(check_range(id, 8, 9, 16).is_err());
        assert!(check_range(id, usize::MAX, 2, 16).is_err());
    }

    #[test]
    fn test_put_object_releases_buffer() {
        let store = MemoryStore::new(64);
        let object = put_object(&store, b"tree").unwrap();
        assert_eq!(&store.get(object).unwrap()[..], b"tree");
        assert_eq!(store.usage().buffers, 0);
    }
}
