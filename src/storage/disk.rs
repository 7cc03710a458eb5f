//! Disk-backed object store.
//!
//! Writable buffers live in memory until sealed. Sealed objects are written to
//! `<root>/<shard>/<id>.kvobj`, optionally zstd-compressed. Object ids survive
//! restarts: opening a store scans existing shards for the highest id.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{check_range, BufferId, ObjectId, ObjectStore, StoreError};

const RAW: u8 = 0;
const ZSTD: u8 = 1;
const EXTENSION: &str = "kvobj";

#[derive(Debug, Default)]
struct Inner {
    buffers: HashMap<BufferId, Vec<u8>>,
    /// On-disk size of each known object.
    objects: HashMap<ObjectId, u64>,
    next_id: u64,
    bytes_used: usize,
}

/// Object store persisting sealed objects as files.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
    capacity: usize,
    zstd_level: Option<i32>,
    inner: Mutex<Inner>,
}

impl DiskStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// `zstd_level` enables compression of sealed objects.
    pub fn open(root: PathBuf, capacity: usize, zstd_level: Option<i32>) -> Result<Self, StoreError> {
        fs::create_dir_all(&root)?;

        let mut inner = Inner::default();
        for shard in fs::read_dir(&root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let path = entry.path();
                let Some(id) = object_id_from_path(&path) else {
                    continue;
                };
                let size = entry.metadata()?.len();
                inner.objects.insert(id, size);
                inner.bytes_used += size as usize;
                inner.next_id = inner.next_id.max(id.0 + 1);
            }
        }

        debug!(
            root = %root.display(),
            objects = inner.objects.len(),
            bytes = inner.bytes_used,
            "Opened disk store"
        );

        Ok(Self {
            root,
            capacity,
            zstd_level,
            inner: Mutex::new(inner),
        })
    }

    /// Bytes held by buffers and object files.
    pub fn bytes_used(&self) -> usize {
        self.inner.lock().bytes_used
    }

    /// Two-level layout keeps shard directories small: 12345 → 12/12345.kvobj
    fn object_path(&self, object: ObjectId) -> PathBuf {
        let shard = object.0 / 1000;
        self.root
            .join(format!("{shard}"))
            .join(format!("{}.{EXTENSION}", object.0))
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

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut out = Vec::with_capacity(data.len() + 1);
        match self.zstd_level {
            Some(level) => {
                out.push(ZSTD);
                out.extend_from_slice(&zstd::encode_all(data, level)?);
            }
            None => {
                out.push(RAW);
                out.extend_from_slice(data);
            }
        }
        Ok(out)
    }

    fn decode(path: &Path, file: Vec<u8>) -> Result<Bytes, StoreError> {
        match file.split_first() {
            Some((&RAW, body)) => Ok(Bytes::copy_from_slice(body)),
            Some((&ZSTD, body)) => Ok(Bytes::from(zstd::decode_all(body)?)),
            _ => Err(StoreError::Malformed(path.to_path_buf())),
        }
    }
}

fn object_id_from_path(path: &Path) -> Option<ObjectId> {
    if path.extension()?.to_str()? != EXTENSION {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok().map(ObjectId)
}

impl ObjectStore for DiskStore {
    fn allocate(&self, size: usize) -> Result<BufferId, StoreError> {
        let mut inner = self.inner.lock();
        self.reserve(&mut inner, size)?;
        let id = BufferId(inner.next_id);
        inner.next_id += 1;
        inner.buffers.insert(id, vec![0u8; size]);
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
        let encoded = {
            let buffer = inner.buffers.get(&id).ok_or(StoreError::UnknownBuffer(id))?;
            self.encode(buffer)?
        };
        self.reserve(&mut inner, encoded.len())?;

        let object = ObjectId(inner.next_id);
        let path = self.object_path(object);
        let written = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::write(&path, &encoded));
        if let Err(e) = written {
            inner.bytes_used = inner.bytes_used.saturating_sub(encoded.len());
            return Err(e.into());
        }

        inner.next_id += 1;
        inner.objects.insert(object, encoded.len() as u64);
        debug!(
            %id,
            %object,
            path = %path.display(),
            size = encoded.len(),
            "Wrote object to disk"
        );
        Ok(object)
    }

    fn get(&self, object: ObjectId) -> Result<Bytes, StoreError> {
        if !self.inner.lock().objects.contains_key(&object) {
            return Err(StoreError::UnknownObject(object));
        }
        let path = self.object_path(object);
        let file = fs::read(&path)?;
        Self::decode(&path, file)
    }

    fn delete(&self, object: ObjectId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let size = inner
            .objects
            .remove(&object)
            .ok_or(StoreError::UnknownObject(object))?;
        inner.bytes_used = inner.bytes_used.saturating_sub(size as usize);

        let path = self.object_path(object);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(%object, path = %path.display(), "Deleted object file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(%object, path = %path.display(), "Object file already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
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
    use tempfile::TempDir;

    #[test]
    fn test_seal_and_get_compressed() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(tmp.path().join("objs"), 1 << 20, Some(3)).unwrap();

        let data = vec![42u8; 4096];
        let buf = store.allocate(data.len()).unwrap();
        store.write(buf, 0, &data).unwrap();
        let obj = store.seal(buf).unwrap();

        let path = store.object_path(obj);
        assert!(path.exists());
        // Repetitive payload compresses well.
        assert!(fs::metadata(&path).unwrap().len() < data.len() as u64);
        assert_eq!(&store.get(obj).unwrap()[..], &data[..]);
    }

    #[test]
    fn test_delete_object() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(tmp.path().to_path_buf(), 1 << 20, None).unwrap();

        let buf = store.allocate(16).unwrap();
        let obj = store.seal(buf).unwrap();
        store.delete(obj).unwrap();

        assert!(!store.object_path(obj).exists());
        assert!(matches!(store.get(obj), Err(StoreError::UnknownObject(_))));
    }

    #[test]
    fn test_reopen_keeps_objects() {
        let tmp = TempDir::new().unwrap();
        let obj = {
            let store = DiskStore::open(tmp.path().to_path_buf(), 1 << 20, None).unwrap();
            let buf = store.allocate(3).unwrap();
            store.write(buf, 0, b"abc").unwrap();
            store.seal(buf).unwrap()
        };

        let store = DiskStore::open(tmp.path().to_path_buf(), 1 << 20, None).unwrap();
        assert_eq!(&store.get(obj).unwrap()[..], b"abc");

        // New ids never collide with existing objects.
        let buf = store.allocate(1).unwrap();
        assert!(buf.0 > obj.0);
    }

    #[test]
    fn test_capacity_counts_files() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(tmp.path().to_path_buf(), 100, None).unwrap();
        let buf = store.allocate(60).unwrap();
        // Sealing needs another 61 bytes (flag byte + payload).
        assert!(matches!(store.seal(buf), Err(StoreError::Exhausted { .. })));
        store.release(buf).unwrap();
        assert_eq!(store.bytes_used(), 0);
    }
}
