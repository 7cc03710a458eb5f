//! In-process object store.
//!
//! Buffers and sealed objects both count against a single byte budget.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use super::{check_range, BufferId, ObjectId, ObjectStore, StoreError};

/// Usage snapshot of a [`MemoryStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreUsage {
    pub buffers: usize,
    pub objects: usize,
    pub bytes_used: usize,
    pub capacity: usize,
}

#[derive(Debug, Default)]
struct Inner {
    buffers: HashMap<BufferId, Vec<u8>>,
    objects: HashMap<ObjectId, Bytes>,
    next_id: u64,
    bytes_used: usize,
}

/// Thread-safe in-memory store.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl MemoryStore {
    /// Create a store holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
        }
    }

    pub fn usage(&self) -> StoreUsage {
        let inner = self.inner.lock();
        StoreUsage {
            buffers: inner.buffers.len(),
            objects: inner.objects.len(),
            bytes_used: inner.bytes_used,
            capacity: self.capacity,
        }
    }

    /// Whether a sealed object is present.
    pub fn contains(&self, object: ObjectId) -> bool {
        self.inner.lock().objects.contains_key(&object)
    }

    fn reserve(&self, inner: &mut Inner, size: usize) -> Result<(), StoreError> {
        let available = self.capacity.saturating_sub(inner.bytes_used);
        if size > available {
            return Err(StoreError::Exhausted {
                requested: size,
                available,
            });
        }
        inner.bytes_used += size;
        Ok(())
    }
}

impl ObjectStore for MemoryStore {
    fn allocate(&self, size: usize) -> Result<BufferId, StoreError> {
        let mut inner = self.inner.lock();
        self.reserve(&mut inner, size)?;
        let id = BufferId(inner.next_id);
        inner.next_id += 1;
        inner.buffers.insert(id, vec![0u8; size]);
        trace!(%id, size, "Allocated buffer");
        Ok(id)
    }

    fn write(&self, id: BufferId, offset: usize, bytes: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let buffer = inner
            .buffers
            .get_mut(&id)
            .ok_or(StoreError::UnknownBuffer(id))?;
        check_range(id, offset, bytes.len(), buffer.len())?;
        buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read(&self, id: BufferId, offset: usize, len: usize) -> Result<Bytes, StoreError> {
        let inner = self.inner.lock();
        let buffer = inner.buffers.get(&id).ok_or(StoreError::UnknownBuffer(id))?;
        check_range(id, offset, len, buffer.len())?;
        Ok(Bytes::copy_from_slice(&buffer[offset..offset + len]))
    }

    fn seal(&self, id: BufferId) -> Result<ObjectId, StoreError> {
        let mut inner = self.inner.lock();
        let data = inner
            .buffers
            .get(&id)
            .map(|b| Bytes::copy_from_slice(b))
            .ok_or(StoreError::UnknownBuffer(id))?;
        self.reserve(&mut inner, data.len())?;
        let object = ObjectId(inner.next_id);
        inner.next_id += 1;
        trace!(%id, %object, size = data.len(), "Sealed buffer");
        inner.objects.insert(object, data);
        Ok(object)
    }

    fn get(&self, object: ObjectId) -> Result<Bytes, StoreError> {
        self.inner
            .lock()
            .objects
            .get(&object)
            .cloned()
            .ok_or(StoreError::UnknownObject(object))
    }

    fn delete(&self, object: ObjectId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let data = inner
            .objects
            .remove(&object)
            .ok_or(StoreError::UnknownObject(object))?;
        inner.bytes_used = inner.bytes_used.saturating_sub(data.len());
        Ok(())
    }

    fn release(&self, id: BufferId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let buffer = inner
            .buffers
            .remove(&id)
            .ok_or(StoreError::UnknownBuffer(id))?;
        inner.bytes_used = inner.bytes_used.saturating_sub(buffer.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_seal_get() {
        let store = MemoryStore::new(1024);
        let buf = store.allocate(8).unwrap();
        store.write(buf, 2, &[7, 7]).unwrap();
        assert_eq!(&store.read(buf, 0, 4).unwrap()[..], &[0, 0, 7, 7]);

        let obj = store.seal(buf).unwrap();
        store.write(buf, 0, &[1]).unwrap();
        // Sealed contents are frozen.
        assert_eq!(store.get(obj).unwrap()[0], 0);
    }

    #[test]
    fn test_capacity_exhaustion() {
        let store = MemoryStore::new(100);
        store.allocate(60).unwrap();
        let err = store.allocate(60).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Exhausted {
                requested: 60,
                available: 40
            }
        ));
    }

    #[test]
    fn test_release_and_delete_free_space() {
        let store = MemoryStore::new(100);
        let buf = store.allocate(40).unwrap();
        let obj = store.seal(buf).unwrap();
        assert_eq!(store.usage().bytes_used, 80);

        store.release(buf).unwrap();
        store.delete(obj).unwrap();
        assert_eq!(store.usage().bytes_used, 0);
        assert!(!store.contains(obj));
        assert!(store.get(obj).is_err());
    }

    #[test]
    fn test_out_of_bounds_write() {
        let store = MemoryStore::new(100);
        let buf = store.allocate(4).unwrap();
        assert!(matches!(
            store.write(buf, 3, &[1, 2]),
            Err(StoreError::OutOfBounds { .. })
        ));
    }
}
