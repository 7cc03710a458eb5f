//! Invariant checks shared by Build and Resolve.
//!
//! - tree structure: unique first tokens per sibling set, back links, compaction
//! - every slot reference points at an occupied slot of a live block, and no
//!   two entries share a slot
//! - every occupied slot is referenced by exactly one entry
//! - no block exceeds `block_size` occupied slots
//! - pending-deletion blocks are unreachable and not live

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::cache::block::{Block, BlockId};
use crate::cache::tree::{RadixTree, SlotRef};
use crate::error::{CacheError, Result};

pub fn check(
    tree: &RadixTree,
    lineage: &[BlockId],
    blocks: &BTreeMap<BlockId, Arc<Block>>,
    pending: &BTreeSet<BlockId>,
    block_size: usize,
) -> Result<()> {
    tree.validate().map_err(CacheError::Corruption)?;

    let listed: BTreeSet<BlockId> = lineage.iter().copied().collect();
    if listed.len() != lineage.len() {
        return Err(CacheError::corruption("block listed twice in lineage"));
    }
    if !listed.iter().eq(blocks.keys()) {
        return Err(CacheError::corruption("lineage and block table disagree"));
    }

    for (id, block) in blocks {
        if block.occupied_count() > block_size {
            return Err(CacheError::corruption(format!(
                "{id} holds {} slots, block size is {block_size}",
                block.occupied_count()
            )));
        }
        if let Some(successor) = block.successor() {
            if !blocks.contains_key(&successor) {
                return Err(CacheError::corruption(format!(
                    "{id} chains to missing {successor}"
                )));
            }
        }
        if pending.contains(id) {
            return Err(CacheError::corruption(format!(
                "{id} is live and pending deletion"
            )));
        }
    }

    let mut referenced: BTreeSet<SlotRef> = BTreeSet::new();
    for (node, slot) in tree.slotted() {
        if pending.contains(&slot.block) {
            return Err(CacheError::corruption(format!(
                "{node:?} references {} which is pending deletion",
                slot.block
            )));
        }
        let occupied = blocks
            .get(&slot.block)
            .is_some_and(|b| b.is_occupied(slot.index()));
        if !occupied {
            return Err(CacheError::corruption(format!(
                "{node:?} references empty slot {} of {}",
                slot.slot, slot.block
            )));
        }
        if !referenced.insert(slot) {
            return Err(CacheError::corruption(format!(
                "slot {} of {} is referenced twice",
                slot.slot, slot.block
            )));
        }
    }

    let occupied: usize = blocks.values().map(|b| b.occupied_count()).sum();
    if occupied != referenced.len() {
        return Err(CacheError::corruption(format!(
            "{occupied} occupied slots but {} referenced",
            referenced.len()
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::layout::KvLayout;

    fn setup() -> (RadixTree, Vec<BlockId>, BTreeMap<BlockId, Arc<Block>>) {
        let layout = KvLayout::new(1, 1, 4).unwrap();
        let mut block = Block::new(BlockId(0), layout);
        let mut tree = RadixTree::new();
        for token in 0..3 {
            let slot = block.allocate().unwrap();
            tree.insert(&[token], SlotRef::new(BlockId(0), slot), 1);
        }
        let blocks = BTreeMap::from([(BlockId(0), Arc::new(block))]);
        (tree, vec![BlockId(0)], blocks)
    }

    #[test]
    fn test_consistent_state_passes() {
        let (tree, lineage, blocks) = setup();
        check(&tree, &lineage, &blocks, &BTreeSet::new(), 4).unwrap();
    }

    #[test]
    fn test_leaked_slot() {
        let (tree, lineage, mut blocks) = setup();
        if let Some(block) = blocks.get_mut(&BlockId(0)) {
            Arc::make_mut(block).allocate();
        }
        let err = check(&tree, &lineage, &blocks, &BTreeSet::new(), 4).unwrap_err();
        assert!(err.to_string().contains("referenced"));
    }

    #[test]
    fn test_aliased_slot() {
        let (mut tree, lineage, blocks) = setup();
        tree.insert(&[9], SlotRef::new(BlockId(0), 0), 1);
        assert!(matches!(
            check(&tree, &lineage, &blocks, &BTreeSet::new(), 4),
            Err(CacheError::Corruption(_))
        ));
    }

    #[test]
    fn test_reachable_pending_block() {
        let (tree, lineage, blocks) = setup();
        let pending = BTreeSet::from([BlockId(0)]);
        assert!(check(&tree, &lineage, &blocks, &pending, 4).is_err());
    }

    #[test]
    fn test_dangling_block() {
        let (mut tree, lineage, blocks) = setup();
        tree.insert(&[7], SlotRef::new(BlockId(3), 0), 1);
        assert!(check(&tree, &lineage, &blocks, &BTreeSet::new(), 4).is_err());
    }
}
