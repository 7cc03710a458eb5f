//! Cache builder: the mutable transaction producing a new cache revision.
//!
//! ```text
//!   new / from_cache          seal (publish)
//!  ─────────────────▶ Open ─────────────────▶ Sealed
//!                      │                        │
//!                      │ close (abort)          │ close
//!                      ▼                        ▼
//!                    Closed ◀───────────────────┘
//! ```
//!
//! A builder is single-writer: every mutation takes `&mut self`. Independent
//! builders reconcile through [`CacheBuilder::merge`] and publish through a
//! shared [`VersionAuthority`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info};

use crate::cache::arena::{capacity_error, BlockArena};
use crate::cache::block::{Block, BlockId};
use crate::cache::evictor::Evictor;
use crate::cache::layout::{KvLayout, KvState};
use crate::cache::sealed::{Cache, CacheMeta};
use crate::cache::tree::{child_key, NodeHandle, RadixTree, Resolution, SlotRef, Stamped, Token};
use crate::cache::validate;
use crate::cache::version::VersionAuthority;
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::storage::{put_object, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BuilderState {
    Open,
    Sealed,
    Closed,
}

impl fmt::Display for BuilderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuilderState::Open => write!(f, "open"),
            BuilderState::Sealed => write!(f, "sealed"),
            BuilderState::Closed => write!(f, "closed"),
        }
    }
}

/// Snapshot of builder counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BuilderStats {
    pub state: BuilderState,
    pub version: u64,
    pub base_version: u64,
    pub entries: usize,
    pub nodes: usize,
    pub live_blocks: usize,
    pub max_blocks: usize,
    pub pending_blocks: usize,
    pub splits: u64,
}

/// Outcome of [`CacheBuilder::merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Paths adopted from the other cache that were absent here.
    pub added: usize,
    /// Paths where the other cache's newer state replaced ours.
    pub replaced: usize,
    /// Paths present in both where ours was kept (newer or identical).
    pub kept: usize,
    /// Builder version after the merge.
    pub version: u64,
}

impl MergeReport {
    pub fn adopted(&self) -> usize {
        self.added + self.replaced
    }
}

#[derive(Debug)]
pub struct CacheBuilder {
    layout: KvLayout,
    capacity: usize,
    tree: RadixTree,
    arena: BlockArena,
    version: u64,
    /// Published version this revision derives from.
    base: u64,
    /// Set by `update_version`, cleared by any other commit.
    rollback_armed: bool,
    state: BuilderState,
}

impl CacheBuilder {
    /// Open an empty revision. `capacity` is the token budget.
    pub fn new(layout: KvLayout, capacity: usize, store: Arc<dyn ObjectStore>) -> Result<Self> {
        layout.validate()?;
        if capacity == 0 {
            return Err(CacheError::InvalidConfig(
                "cache_capacity must be non-zero".into(),
            ));
        }
        Ok(Self {
            layout,
            capacity,
            tree: RadixTree::new(),
            arena: BlockArena::new(layout, capacity, store),
            version: 0,
            base: 0,
            rollback_armed: false,
            state: BuilderState::Open,
        })
    }

    pub fn from_config(config: &CacheConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let layout = KvLayout::new(config.tensor_nbytes, config.layer, config.block_size)?;
        Self::new(layout, config.cache_capacity, store)
    }

    /// Open the next revision on top of a sealed cache. Blocks are shared with
    /// the cache until this builder modifies them.
    pub fn from_cache(cache: &Cache, store: Arc<dyn ObjectStore>) -> Self {
        let meta = cache.meta();
        let arena = BlockArena::inherit(
            *cache.layout(),
            meta.cache_capacity,
            store,
            cache.block_ids().to_vec(),
            cache.blocks().clone(),
            meta.root_tree_ref,
        );
        Self {
            layout: *cache.layout(),
            capacity: meta.cache_capacity,
            tree: cache.tree().clone(),
            arena,
            version: meta.version,
            base: meta.version,
            rollback_armed: false,
            state: BuilderState::Open,
        }
    }

    pub fn state(&self) -> BuilderState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn base_version(&self) -> u64 {
        self.base
    }

    pub fn layout(&self) -> &KvLayout {
        &self.layout
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Blocks awaiting physical removal at the next seal.
    pub fn pending_deletion(&self) -> BTreeSet<BlockId> {
        self.arena.pending_deletion()
    }

    /// Live blocks in chain order.
    pub fn block_ids(&self) -> &[BlockId] {
        self.arena.lineage()
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.arena.block(id)
    }

    pub fn stats(&self) -> BuilderStats {
        BuilderStats {
            state: self.state,
            version: self.version,
            base_version: self.base,
            entries: self.tree.len(),
            nodes: self.tree.node_count(),
            live_blocks: self.arena.live_blocks(),
            max_blocks: self.arena.max_blocks(),
            pending_blocks: self.arena.pending_deletion().len(),
            splits: self.arena.splits(),
        }
    }

    /// Whether a newer revision has been published since this one was opened.
    pub fn is_stale(&self, authority: &VersionAuthority) -> bool {
        authority.published() != self.base
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            BuilderState::Open => Ok(()),
            state => Err(CacheError::NotOpen(state)),
        }
    }

    fn ensure_readable(&self) -> Result<()> {
        match self.state {
            BuilderState::Closed => Err(CacheError::NotOpen(BuilderState::Closed)),
            _ => Ok(()),
        }
    }

    fn state_at(&self, slot: SlotRef) -> Result<KvState> {
        let payload = self.arena.read(slot).ok_or_else(|| {
            CacheError::corruption(format!("entry points at empty slot {} of {}", slot.slot, slot.block))
        })?;
        Ok(KvState::new(
            Bytes::copy_from_slice(payload),
            self.layout.tensor_nbytes,
        ))
    }

    /// KV state cached for `path + [next]`, or `KeyNotFound`.
    pub fn query(&self, path: &[Token], next: Token) -> Result<KvState> {
        self.ensure_readable()?;
        let key = child_key(path, next);
        let slot = self
            .tree
            .find(&key)
            .and_then(|id| self.tree.slot(id))
            .ok_or(CacheError::KeyNotFound)?;
        self.state_at(slot)
    }

    /// Handle of the entry for `path + [next]`.
    pub fn lookup(&self, path: &[Token], next: Token) -> Option<NodeHandle> {
        let id = self.tree.find(&child_key(path, next))?;
        self.tree.slot(id).map(|_| self.tree.handle(id))
    }

    /// KV state of the entry behind a handle.
    pub fn read(&self, handle: NodeHandle) -> Result<KvState> {
        self.ensure_readable()?;
        let id = self.tree.resolve(handle).ok_or(CacheError::StaleHandle)?;
        let slot = self.tree.slot(id).ok_or(CacheError::KeyNotFound)?;
        self.state_at(slot)
    }

    /// Length of the longest prefix of `tokens` whose KV state is cached:
    /// the point from which computation has to resume.
    pub fn match_prefix(&self, tokens: &[Token]) -> usize {
        self.tree.longest_cached_prefix(tokens).0
    }

    /// Store KV state for `path + [next]`, replacing any previous state.
    ///
    /// Either fully applied or not at all: a failed allocation leaves the
    /// builder untouched.
    pub fn update(&mut self, path: &[Token], next: Token, kv: &[u8]) -> Result<NodeHandle> {
        self.ensure_open()?;
        self.layout.check_payload(kv)?;

        let key = child_key(path, next);
        let stamp = self.version + 1;
        let slot = match self.tree.find(&key).and_then(|id| self.tree.slot(id)) {
            Some(slot) => slot,
            None => self.arena.allocate(&mut self.tree, &key)?,
        };
        self.arena.write(slot, kv)?;
        let (id, _) = self.tree.insert(&key, slot, stamp);

        self.version = stamp;
        self.rollback_armed = false;
        Ok(self.tree.handle(id))
    }

    /// Chain a new block behind `full` and relocate the given entries into it.
    pub fn split(&mut self, full: BlockId, nodes: &[NodeHandle]) -> Result<BlockId> {
        self.ensure_open()?;
        let ids = nodes
            .iter()
            .map(|&handle| self.tree.resolve(handle).ok_or(CacheError::StaleHandle))
            .collect::<Result<Vec<_>>>()?;
        self.arena.split(&mut self.tree, full, &ids)
    }

    /// Delete: drop the entry behind `handle` and compact the tree. A block
    /// left without entries joins the pending-deletion set.
    pub fn delete(&mut self, handle: NodeHandle) -> Result<()> {
        self.ensure_open()?;
        let id = self.tree.resolve(handle).ok_or(CacheError::StaleHandle)?;
        let slot = self.tree.remove(id).ok_or(CacheError::KeyNotFound)?;
        self.arena.free(slot);
        self.version += 1;
        self.rollback_armed = false;
        debug!(block = %slot.block, slot = slot.slot, version = self.version, "Deleted entry");
        Ok(())
    }

    /// Delete addressed by token path.
    pub fn remove(&mut self, path: &[Token], next: Token) -> Result<()> {
        let handle = self.lookup(path, next).ok_or(CacheError::KeyNotFound)?;
        self.delete(handle)
    }

    /// Evict up to `count` entries chosen by `evictor`. Returns their paths.
    pub fn evict(&mut self, evictor: &Evictor, count: usize) -> Result<Vec<Vec<Token>>> {
        self.ensure_open()?;
        let arena = &mut self.arena;
        let evicted = evictor.evict(&mut self.tree, count, |slot| {
            arena.free(slot);
        });
        if !evicted.is_empty() {
            self.version += 1;
            self.rollback_armed = false;
            debug!(
                evicted = evicted.len(),
                pending = self.arena.pending_deletion().len(),
                "Evicted entries"
            );
        }
        Ok(evicted)
    }

    /// Open a multi-step transaction: bump the version so it can be undone
    /// with a single [`rollback_version`](Self::rollback_version).
    pub fn update_version(&mut self) -> Result<u64> {
        self.ensure_open()?;
        self.version += 1;
        self.rollback_armed = true;
        Ok(self.version)
    }

    /// Undo the most recent `update_version`. Only valid directly after it.
    pub fn rollback_version(&mut self) -> Result<u64> {
        self.ensure_open()?;
        if !self.rollback_armed || self.version == 0 {
            return Err(CacheError::NothingToRollback);
        }
        self.version -= 1;
        self.rollback_armed = false;
        Ok(self.version)
    }

    /// Validate the invariants and write every modified block to the store.
    /// Returns the number of blocks written.
    pub fn build(&mut self) -> Result<usize> {
        self.ensure_open()?;
        validate::check(
            &self.tree,
            self.arena.lineage(),
            self.arena.blocks(),
            &self.arena.pending_deletion(),
            self.layout.block_size,
        )?;
        self.arena.flush()
    }

    /// Build, persist and publish this revision, then remove pending blocks
    /// and superseded objects from the store.
    ///
    /// Fails with `VersionConflict` (leaving the builder open) when another
    /// revision was published since this one was opened; merge that cache and
    /// seal again.
    pub fn seal(&mut self, authority: &VersionAuthority) -> Result<Cache> {
        let cache = self.publish(authority)?;
        let collected = self.collect_garbage();
        info!(
            version = cache.version(),
            entries = cache.len(),
            blocks = cache.block_ids().len(),
            collected,
            "Sealed cache revision"
        );
        Ok(cache)
    }

    /// The publishing half of [`seal`](Self::seal). Superseded objects stay
    /// in the store until [`collect_garbage`](Self::collect_garbage) runs, so
    /// a caller recording the published metadata elsewhere can do that first.
    pub fn publish(&mut self, authority: &VersionAuthority) -> Result<Cache> {
        self.ensure_open()?;
        let published = authority.published();
        if published != self.base {
            return Err(CacheError::VersionConflict {
                builder: self.base,
                published,
            });
        }

        let flushed = self.build()?;
        let block_id_list = self.arena.objects()?;
        let tree = serde_json::to_vec(&self.tree)
            .map_err(|e| CacheError::corruption(format!("cannot encode tree: {e}")))?;
        let root_tree_ref = put_object(&**self.arena.store(), &tree).map_err(capacity_error)?;

        let version = self.version.max(self.base + 1);
        let meta = CacheMeta {
            tensor_nbytes: self.layout.tensor_nbytes,
            layer: self.layout.layer,
            cache_capacity: self.capacity,
            block_size: self.layout.block_size,
            version,
            root_tree_ref,
            block_id_list,
        };
        if let Err(e) = authority.publish(self.base, &meta) {
            self.arena.discard_object(root_tree_ref);
            return Err(e);
        }

        self.version = version;
        self.base = version;
        self.rollback_armed = false;
        self.state = BuilderState::Sealed;
        debug!(version, flushed, "Published cache revision");

        Ok(Cache::new(
            meta,
            self.layout,
            self.tree.clone(),
            self.arena.lineage().to_vec(),
            self.arena.blocks().clone(),
        ))
    }

    /// Delete the blocks and objects this published revision superseded.
    /// Returns the number of objects deleted; does nothing unless sealed.
    pub fn collect_garbage(&mut self) -> usize {
        if self.state != BuilderState::Sealed {
            return 0;
        }
        self.arena.collect_garbage()
    }

    /// Fold a sealed cache into this revision.
    ///
    /// Per path, the entry committed at the higher version wins; entries at
    /// equal versions must carry identical state and are deduplicated, while
    /// divergent ones are `Corruption` (detected before anything changes).
    /// Adopted state is copied into this builder's own blocks. Merging the
    /// same cache again is a no-op, and a failed merge changes nothing.
    pub fn merge(&mut self, other: &Cache) -> Result<MergeReport> {
        self.ensure_open()?;
        if other.layout() != &self.layout {
            return Err(CacheError::IncompatibleLayout(format!(
                "builder {:?}, cache {:?}",
                self.layout,
                other.layout()
            )));
        }
        if other.version() < self.base {
            return Err(CacheError::VersionConflict {
                builder: self.base,
                published: other.version(),
            });
        }

        for entry in other.tree().entries() {
            let Some(ours) = self.tree.find(&entry.path).and_then(|id| self.tree.stamped(id)) else {
                continue;
            };
            if ours.stamp == entry.stamp && self.arena.read(ours.slot) != other.read(entry.slot) {
                return Err(CacheError::corruption(format!(
                    "path {:?} committed at version {} with divergent KV state",
                    entry.path, entry.stamp
                )));
            }
        }

        // Staged on copies so a failed import leaves this revision untouched.
        let mut tree = self.tree.clone();
        let mut arena = self.arena.clone();
        let merged = tree.merge(other.tree(), |path, ours, theirs| {
            if ours.is_some_and(|ours| ours.stamp >= theirs.stamp) {
                return Ok(Resolution::Keep);
            }
            let payload = other.read(theirs.slot).ok_or_else(|| {
                CacheError::corruption(format!("merged cache has no state for {path:?}"))
            })?;
            let slot = arena.import(payload)?;
            if let Some(ours) = ours {
                arena.free(ours.slot);
            }
            Ok::<_, CacheError>(Resolution::Install(Stamped {
                slot,
                stamp: theirs.stamp,
            }))
        });
        let stats = match merged {
            Ok(stats) => stats,
            Err(e) => {
                self.arena.discard_staged(arena);
                return Err(e);
            }
        };
        self.tree = tree;
        self.arena = arena;

        let report = MergeReport {
            added: stats.added,
            replaced: stats.replaced,
            kept: stats.kept,
            version: self.version.max(other.version()) + u64::from(stats.added + stats.replaced > 0),
        };
        self.base = self.base.max(other.version());
        self.version = report.version;
        self.rollback_armed = false;
        self.arena.reconcile(&other.objects());

        debug!(
            other = other.version(),
            added = report.added,
            replaced = report.replaced,
            kept = report.kept,
            version = report.version,
            "Merged cache"
        );
        Ok(report)
    }

    /// Release the builder. Closing an open builder aborts its revision and
    /// frees every store resource it allocated.
    pub fn close(&mut self) {
        if self.state == BuilderState::Open {
            self.arena.abort();
            debug!(version = self.version, "Aborted open revision");
        }
        self.state = BuilderState::Closed;
    }
}

impl Drop for CacheBuilder {
    fn drop(&mut self) {
        if self.state == BuilderState::Open {
            self.arena.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn builder() -> (CacheBuilder, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(1 << 20));
        let layout = KvLayout::new(2, 2, 4).unwrap();
        (CacheBuilder::new(layout, 64, store.clone()).unwrap(), store)
    }

    #[test]
    fn test_update_then_query() {
        let (mut b, _) = builder();
        b.update(&[1, 2, 3], 4, &[1, 2, 3, 4]).unwrap();
        let state = b.query(&[1, 2, 3], 4).unwrap();
        assert_eq!(state.as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(state.layer(1), Some(&[3u8, 4][..]));
        assert!(matches!(b.query(&[1, 2, 3], 5), Err(CacheError::KeyNotFound)));
        assert!(matches!(b.query(&[1, 2], 3), Err(CacheError::KeyNotFound)));
    }

    #[test]
    fn test_update_rejects_wrong_size() {
        let (mut b, _) = builder();
        assert!(matches!(
            b.update(&[1], 2, &[0; 3]),
            Err(CacheError::PayloadSize { expected: 4, actual: 3 })
        ));
        assert_eq!(b.version(), 0);
    }

    #[test]
    fn test_overwrite_keeps_slot() {
        let (mut b, _) = builder();
        let first = b.update(&[1], 2, &[0; 4]).unwrap();
        let second = b.update(&[1], 2, &[9; 4]).unwrap();
        assert_eq!(first, second);
        assert_eq!(b.len(), 1);
        assert_eq!(b.read(second).unwrap().as_bytes(), &[9; 4]);
    }

    #[test]
    fn test_version_rollback_is_single_step() {
        let (mut b, _) = builder();
        assert!(matches!(b.rollback_version(), Err(CacheError::NothingToRollback)));

        b.update(&[1], 2, &[0; 4]).unwrap();
        assert_eq!(b.update_version().unwrap(), 2);
        assert_eq!(b.rollback_version().unwrap(), 1);
        assert!(matches!(b.rollback_version(), Err(CacheError::NothingToRollback)));
        assert_eq!(b.version(), 1);
    }

    #[test]
    fn test_stale_handle() {
        let (mut b, _) = builder();
        let handle = b.update(&[5], 6, &[0; 4]).unwrap();
        b.delete(handle).unwrap();
        assert!(matches!(b.delete(handle), Err(CacheError::StaleHandle)));
        assert!(matches!(b.read(handle), Err(CacheError::StaleHandle)));
    }

    #[test]
    fn test_sealed_builder_rejects_mutation() {
        let (mut b, _) = builder();
        b.update(&[1], 2, &[0; 4]).unwrap();
        let authority = VersionAuthority::new();
        b.seal(&authority).unwrap();

        assert_eq!(b.state(), BuilderState::Sealed);
        assert!(matches!(
            b.update(&[1], 3, &[0; 4]),
            Err(CacheError::NotOpen(BuilderState::Sealed))
        ));
        // Reads stay available until the builder is closed.
        assert!(b.query(&[1], 2).is_ok());
        b.close();
        assert!(b.query(&[1], 2).is_err());
    }

    #[test]
    fn test_publish_defers_collection() {
        let (mut b, store) = builder();
        b.update(&[1], 2, &[1; 4]).unwrap();
        let authority = VersionAuthority::new();
        let first = b.seal(&authority).unwrap();
        let old_tree = first.meta().root_tree_ref;

        let mut next = CacheBuilder::from_cache(&first, store.clone());
        next.update(&[1], 2, &[2; 4]).unwrap();
        assert_eq!(next.collect_garbage(), 0);
        let second = next.publish(&authority).unwrap();
        assert_eq!(authority.published(), second.version());
        assert!(store.contains(old_tree));

        assert!(next.collect_garbage() > 0);
        assert!(!store.contains(old_tree));
        assert_eq!(next.collect_garbage(), 0);
    }

    #[test]
    fn test_close_open_builder_releases_store() {
        let (mut b, store) = builder();
        for t in 0..6 {
            b.update(&[t], t + 1, &[1; 4]).unwrap();
        }
        b.build().unwrap();
        b.update(&[100], 1, &[2; 4]).unwrap();
        assert!(store.usage().bytes_used > 0);

        b.close();
        assert_eq!(b.state(), BuilderState::Closed);
        assert_eq!(store.usage().bytes_used, 0);
    }

    #[test]
    fn test_stats() {
        let (mut b, _) = builder();
        for t in 0..5 {
            b.update(&[t], 0, &[1; 4]).unwrap();
        }
        let stats = b.stats();
        assert_eq!(stats.entries, 5);
        assert_eq!(stats.live_blocks, 2);
        assert_eq!(stats.splits, 1);
        assert_eq!(stats.max_blocks, 16);
        assert_eq!(stats.version, 5);
    }

    #[test]
    fn test_match_prefix() {
        let (mut b, _) = builder();
        b.update(&[1], 2, &[0; 4]).unwrap();
        b.update(&[1, 2], 3, &[0; 4]).unwrap();
        b.update(&[1, 2, 3, 4], 5, &[0; 4]).unwrap();

        assert_eq!(b.match_prefix(&[1, 2, 3, 9]), 3);
        assert_eq!(b.match_prefix(&[1, 2, 3, 4, 5, 6]), 5);
        assert_eq!(b.match_prefix(&[1, 2, 3, 4]), 3);
        assert_eq!(b.match_prefix(&[2]), 0);
    }
}
