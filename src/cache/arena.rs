//! Block arena: the live block lineage of one cache revision.
//!
//! Blocks are shared copy-on-write with the sealed caches they came from
//! (`Arc::make_mut` clones a block the first time a builder touches it), so a
//! sealed snapshot never observes builder mutations.
//!
//! Allocation policy:
//! 1. a free slot in the tail block, then in any other live block
//! 2. otherwise Split the tail: chain a new block behind it and move the
//!    entries sharing the longest prefix with the new key into it
//!
//! Blocks emptied by Delete, Merge or relocation leave the lineage and wait in
//! the pending-deletion set until the next successful Seal.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::block::{Block, BlockId};
use crate::cache::layout::KvLayout;
use crate::cache::tree::{common_prefix_len, NodeId, RadixTree, SlotRef, Token};
use crate::error::{CacheError, Result};
use crate::storage::{BufferId, ObjectId, ObjectStore, StoreError};

/// Map store exhaustion to `CapacityExceeded`; other store failures pass through.
pub(crate) fn capacity_error(err: StoreError) -> CacheError {
    match err {
        StoreError::Exhausted { .. } => CacheError::CapacityExceeded(err.to_string()),
        other => CacheError::Storage(other),
    }
}

/// Cloning shares every block with the original until one side writes it.
#[derive(Clone)]
pub struct BlockArena {
    layout: KvLayout,
    max_blocks: usize,
    blocks: BTreeMap<BlockId, Arc<Block>>,
    /// Live blocks in chain order, tail last.
    lineage: Vec<BlockId>,
    pending: BTreeMap<BlockId, Arc<Block>>,
    next_id: u64,
    /// Objects superseded by this revision, deleted after it is published.
    retired: BTreeSet<ObjectId>,
    /// Objects sealed by this builder that no published cache references yet.
    minted: BTreeSet<ObjectId>,
    splits: u64,
    store: Arc<dyn ObjectStore>,
}

impl fmt::Debug for BlockArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockArena")
            .field("layout", &self.layout)
            .field("max_blocks", &self.max_blocks)
            .field("lineage", &self.lineage)
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .field("splits", &self.splits)
            .finish_non_exhaustive()
    }
}

impl BlockArena {
    /// Empty arena holding at most `ceil(capacity / block_size)` live blocks.
    pub fn new(layout: KvLayout, capacity: usize, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            layout,
            max_blocks: capacity.div_ceil(layout.block_size),
            blocks: BTreeMap::new(),
            lineage: Vec::new(),
            pending: BTreeMap::new(),
            next_id: 0,
            retired: BTreeSet::new(),
            minted: BTreeSet::new(),
            splits: 0,
            store,
        }
    }

    /// Arena continuing an existing lineage.
    pub(crate) fn inherit(
        layout: KvLayout,
        capacity: usize,
        store: Arc<dyn ObjectStore>,
        lineage: Vec<BlockId>,
        blocks: BTreeMap<BlockId, Arc<Block>>,
        superseded: ObjectId,
    ) -> Self {
        let mut arena = Self::new(layout, capacity, store);
        arena.next_id = blocks.keys().next_back().map_or(0, |id| id.0 + 1);
        arena.lineage = lineage;
        arena.blocks = blocks;
        arena.retired.insert(superseded);
        arena
    }

    pub fn layout(&self) -> &KvLayout {
        &self.layout
    }

    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(&id).map(|b| b.as_ref())
    }

    /// Live blocks in chain order.
    pub fn lineage(&self) -> &[BlockId] {
        &self.lineage
    }

    pub(crate) fn blocks(&self) -> &BTreeMap<BlockId, Arc<Block>> {
        &self.blocks
    }

    pub fn live_blocks(&self) -> usize {
        self.lineage.len()
    }

    /// Blocks marked for deletion at the next Seal.
    pub fn pending_deletion(&self) -> BTreeSet<BlockId> {
        self.pending.keys().copied().collect()
    }

    pub fn splits(&self) -> u64 {
        self.splits
    }

    fn block_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.get_mut(&id).map(Arc::make_mut)
    }

    /// Payload of an occupied slot.
    pub fn read(&self, slot: SlotRef) -> Option<&[u8]> {
        self.blocks.get(&slot.block)?.read(slot.index())
    }

    pub fn write(&mut self, slot: SlotRef, payload: &[u8]) -> Result<()> {
        let block = self
            .block_mut(slot.block)
            .ok_or(CacheError::UnknownBlock(slot.block))?;
        block.write(slot.index(), payload);
        Ok(())
    }

    /// Create a block with a fresh store buffer. The caller links it.
    fn mint_block(&mut self) -> Result<BlockId> {
        if self.lineage.len() >= self.max_blocks {
            return Err(CacheError::CapacityExceeded(format!(
                "{} live blocks, cache capacity allows {}",
                self.lineage.len(),
                self.max_blocks
            )));
        }
        let buffer = self
            .store
            .allocate(Block::image_bytes(&self.layout))
            .map_err(capacity_error)?;

        let id = BlockId(self.next_id);
        self.next_id += 1;
        let mut block = Block::new(id, self.layout);
        block.set_buffer(Some(buffer));
        self.blocks.insert(id, Arc::new(block));
        Ok(id)
    }

    fn try_allocate(&mut self) -> Option<SlotRef> {
        let id = self
            .lineage
            .iter()
            .rev()
            .copied()
            .find(|id| self.blocks.get(id).is_some_and(|b| !b.is_full()))?;
        let slot = self.block_mut(id)?.allocate()?;
        Some(SlotRef::new(id, slot))
    }

    fn claim(&mut self, id: BlockId) -> Result<SlotRef> {
        self.block_mut(id)
            .and_then(Block::allocate)
            .map(|slot| SlotRef::new(id, slot))
            .ok_or_else(|| CacheError::corruption(format!("{id} has no free slot after split")))
    }

    fn first_block(&mut self) -> Result<BlockId> {
        let id = self.mint_block()?;
        self.lineage.push(id);
        debug!(block = %id, "Created first block");
        Ok(id)
    }

    /// Allocate a slot for `key`, splitting the tail block when every live
    /// block is full. Relocated entries are relinked in `tree`.
    pub fn allocate(&mut self, tree: &mut RadixTree, key: &[Token]) -> Result<SlotRef> {
        if let Some(slot) = self.try_allocate() {
            return Ok(slot);
        }
        let Some(&tail) = self.lineage.last() else {
            let id = self.first_block()?;
            return self.claim(id);
        };

        let movers = self.relocation_candidates(tree, tail, key);
        let fresh = self.split(tree, tail, &movers)?;
        self.claim(fresh)
    }

    /// Allocate a slot and store `payload` without relocating anything.
    pub fn import(&mut self, payload: &[u8]) -> Result<SlotRef> {
        let slot = match self.try_allocate() {
            Some(slot) => slot,
            None => {
                let fresh = match self.lineage.last() {
                    Some(&tail) => self.split_block(tail, &[])?.0,
                    None => self.first_block()?,
                };
                self.claim(fresh)?
            }
        };
        self.write(slot, payload)?;
        Ok(slot)
    }

    /// Entries of `full` sharing the longest prefix with `key`; at most half a
    /// block so the new key lands next to them.
    fn relocation_candidates(&self, tree: &RadixTree, full: BlockId, key: &[Token]) -> Vec<NodeId> {
        let mut scored: Vec<(usize, NodeId)> = tree
            .slotted()
            .filter(|(_, slot)| slot.block == full)
            .filter_map(|(id, _)| {
                let shared = common_prefix_len(&tree.path_of(id), key);
                (shared > 0).then_some((shared, id))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.truncate(self.layout.block_size / 2);
        scored.into_iter().map(|(_, id)| id).collect()
    }

    /// Split: chain a new block behind `full` and move the given entries into
    /// it, relinking them in `tree`. Returns the new block.
    pub fn split(&mut self, tree: &mut RadixTree, full: BlockId, nodes: &[NodeId]) -> Result<BlockId> {
        let movers: Vec<(NodeId, SlotRef)> = nodes
            .iter()
            .filter_map(|&id| tree.slot(id).map(|slot| (id, slot)))
            .collect();
        let (fresh, moved) = self.split_block(full, &movers)?;
        for (id, slot) in moved {
            tree.relink(id, slot);
        }
        Ok(fresh)
    }

    fn split_block(
        &mut self,
        full: BlockId,
        movers: &[(NodeId, SlotRef)],
    ) -> Result<(BlockId, Vec<(NodeId, SlotRef)>)> {
        let (position, old_successor) = match self.lineage.iter().position(|&id| id == full) {
            Some(position) => (position, self.blocks.get(&full).and_then(|b| b.successor())),
            None => return Err(CacheError::UnknownBlock(full)),
        };

        let fresh = self.mint_block()?;
        self.lineage.insert(position + 1, fresh);
        if let Some(block) = self.block_mut(fresh) {
            block.set_successor(old_successor);
        }
        if let Some(block) = self.block_mut(full) {
            block.set_successor(Some(fresh));
        }

        let mut moved = Vec::new();
        for &(node, from) in movers.iter().take(self.layout.block_size) {
            if from.block != full {
                continue;
            }
            let Some(payload) = self.read(from).map(<[u8]>::to_vec) else {
                continue;
            };
            let Some(to) = self.block_mut(fresh).and_then(Block::allocate) else {
                break;
            };
            let to = SlotRef::new(fresh, to);
            self.write(to, &payload)?;
            if let Some(block) = self.block_mut(full) {
                block.free(from.index());
            }
            moved.push((node, to));
        }

        if self.blocks.get(&full).is_some_and(|b| b.is_empty()) {
            self.retire(full);
        }
        self.splits += 1;
        debug!(%full, %fresh, moved = moved.len(), "Split block");
        Ok((fresh, moved))
    }

    /// Release a slot. An emptied block moves to the pending-deletion set.
    pub fn free(&mut self, slot: SlotRef) -> bool {
        let freed = self
            .block_mut(slot.block)
            .is_some_and(|block| block.free(slot.index()));
        if freed && self.blocks.get(&slot.block).is_some_and(|b| b.is_empty()) {
            self.retire(slot.block);
        }
        freed
    }

    /// Unlink a block from the lineage and mark it for deletion.
    fn retire(&mut self, id: BlockId) {
        let Some(block) = self.blocks.remove(&id) else {
            return;
        };
        self.lineage.retain(|&b| b != id);
        let predecessor = self
            .blocks
            .iter()
            .find(|(_, b)| b.successor() == Some(id))
            .map(|(&pred, _)| pred);
        if let Some(pred) = predecessor.and_then(|pred| self.block_mut(pred)) {
            pred.set_successor(block.successor());
        }
        debug!(block = %id, "Block unreferenced, pending deletion");
        self.pending.insert(id, block);
    }

    /// Objects of the live blocks in chain order. Every block must be flushed.
    pub fn objects(&self) -> Result<Vec<ObjectId>> {
        self.lineage
            .iter()
            .map(|id| match self.blocks.get(id) {
                Some(block) if !block.is_dirty() => block
                    .object()
                    .ok_or_else(|| CacheError::corruption(format!("{id} has no object"))),
                _ => Err(CacheError::corruption(format!("{id} has not been flushed"))),
            })
            .collect()
    }

    /// Write every dirty live block to the store and seal it. Returns the
    /// number of blocks written.
    pub fn flush(&mut self) -> Result<usize> {
        let dirty: Vec<BlockId> = self
            .lineage
            .iter()
            .copied()
            .filter(|id| self.blocks.get(id).is_some_and(|b| b.is_dirty()))
            .collect();
        for &id in &dirty {
            self.flush_block(id)?;
        }
        Ok(dirty.len())
    }

    fn flush_block(&mut self, id: BlockId) -> Result<()> {
        let buffer = match self.blocks.get(&id).and_then(|b| b.buffer()) {
            Some(buffer) => buffer,
            None => {
                let buffer = self
                    .store
                    .allocate(Block::image_bytes(&self.layout))
                    .map_err(capacity_error)?;
                if let Some(block) = self.block_mut(id) {
                    block.set_buffer(Some(buffer));
                }
                buffer
            }
        };

        let block = self
            .blocks
            .get(&id)
            .cloned()
            .ok_or(CacheError::UnknownBlock(id))?;
        self.store.write(buffer, 0, &block.image())?;
        let object = self.store.seal(buffer).map_err(capacity_error)?;
        self.minted.insert(object);
        if let Some(previous) = block.object() {
            self.retired.insert(previous);
        }
        drop(block);

        if let Some(block) = self.block_mut(id) {
            block.set_object(Some(object));
            block.set_buffer(None);
        }
        if let Err(e) = self.store.release(buffer) {
            warn!(block = %id, %buffer, error = %e, "Failed to release block buffer");
        }
        debug!(block = %id, %object, "Flushed block");
        Ok(())
    }

    /// Throw away a staged copy of this arena, releasing the store buffers it
    /// allocated that this arena does not hold.
    pub(crate) fn discard_staged(&self, staged: BlockArena) {
        let held: BTreeSet<BufferId> = self
            .blocks
            .values()
            .chain(self.pending.values())
            .filter_map(|b| b.buffer())
            .collect();
        for (id, block) in staged.blocks.iter().chain(staged.pending.iter()) {
            let Some(buffer) = block.buffer().filter(|b| !held.contains(b)) else {
                continue;
            };
            if let Err(e) = self.store.release(buffer) {
                warn!(block = %id, %buffer, error = %e, "Failed to release staged block buffer");
            }
        }
    }

    /// Forget an object sealed by this builder that is being dropped again.
    pub(crate) fn discard_object(&mut self, object: ObjectId) {
        self.minted.remove(&object);
        if let Err(e) = self.store.delete(object) {
            warn!(%object, error = %e, "Failed to delete unpublished object");
        }
    }

    /// Align object bookkeeping with a published cache listing `published`.
    ///
    /// Inherited objects the publisher no longer lists have been deleted by
    /// it, so blocks still pointing at them are rewritten at the next flush.
    /// Everything the publisher lists is superseded once this builder seals.
    pub(crate) fn reconcile(&mut self, published: &BTreeSet<ObjectId>) {
        let lost: Vec<BlockId> = self
            .blocks
            .iter()
            .filter(|(_, b)| {
                b.object()
                    .is_some_and(|o| !self.minted.contains(&o) && !published.contains(&o))
            })
            .map(|(&id, _)| id)
            .collect();
        for id in lost {
            if let Some(block) = self.block_mut(id) {
                block.set_object(None);
                block.mark_dirty();
            }
            debug!(block = %id, "Block object deleted by publisher, rewriting");
        }

        let minted = &self.minted;
        self.retired
            .retain(|o| published.contains(o) || minted.contains(o));
        self.retired.extend(published.iter().copied());
    }

    /// Physically remove pending blocks and superseded objects. Runs after a
    /// successful publish; failures are logged, never returned.
    pub fn collect_garbage(&mut self) -> usize {
        for (id, block) in std::mem::take(&mut self.pending) {
            if let Some(buffer) = block.buffer() {
                if let Err(e) = self.store.release(buffer) {
                    warn!(block = %id, %buffer, error = %e, "Failed to release buffer of deleted block");
                }
            }
            if let Some(object) = block.object() {
                self.retired.insert(object);
            }
        }

        let live: BTreeSet<ObjectId> = self.blocks.values().filter_map(|b| b.object()).collect();
        let mut deleted = 0;
        for object in std::mem::take(&mut self.retired) {
            if live.contains(&object) {
                continue;
            }
            match self.store.delete(object) {
                Ok(()) => deleted += 1,
                Err(StoreError::UnknownObject(_)) => {
                    debug!(%object, "Superseded object already deleted");
                }
                Err(e) => warn!(%object, error = %e, "Failed to delete superseded object"),
            }
        }
        self.minted.clear();
        deleted
    }

    /// Drop an unpublished revision: release every held buffer and delete the
    /// objects sealed for it.
    pub fn abort(&mut self) {
        for (id, block) in self.blocks.iter().chain(self.pending.iter()) {
            if let Some(buffer) = block.buffer() {
                if let Err(e) = self.store.release(buffer) {
                    warn!(block = %id, %buffer, error = %e, "Failed to release block buffer");
                }
            }
        }
        for object in std::mem::take(&mut self.minted) {
            if let Err(e) = self.store.delete(object) {
                warn!(%object, error = %e, "Failed to delete unpublished object");
            }
        }
        self.retired.clear();
        self.pending.clear();
        self.blocks.clear();
        self.lineage.clear();
    }
}
