//! Sealed, immutable cache snapshot.
//!
//! A [`Cache`] is produced by `CacheBuilder::seal` or rebuilt from persisted
//! metadata with [`Cache::resolve`]. It is never mutated afterwards, so any
//! number of threads can query it without locking (share it as `Arc<Cache>`).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::block::{Block, BlockId};
use crate::cache::layout::{KvLayout, KvState};
use crate::cache::tree::{child_key, RadixTree, SlotRef, Token};
use crate::cache::validate;
use crate::error::{CacheError, Result};
use crate::storage::{ObjectId, ObjectStore};

/// Persisted description of a sealed cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMeta {
    pub tensor_nbytes: usize,
    pub layer: usize,
    /// Token budget of the cache.
    pub cache_capacity: usize,
    pub block_size: usize,
    pub version: u64,
    /// Object holding the serialized radix tree.
    pub root_tree_ref: ObjectId,
    /// Block objects in chain order.
    pub block_id_list: Vec<ObjectId>,
}

impl CacheMeta {
    pub fn layout(&self) -> Result<KvLayout> {
        KvLayout::new(self.tensor_nbytes, self.layer, self.block_size)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| CacheError::corruption(format!("cannot encode cache metadata: {e}")))
    }

    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data)
            .map_err(|e| CacheError::corruption(format!("malformed cache metadata: {e}")))
    }
}

#[derive(Debug)]
pub struct Cache {
    meta: CacheMeta,
    layout: KvLayout,
    tree: RadixTree,
    lineage: Vec<BlockId>,
    blocks: BTreeMap<BlockId, Arc<Block>>,
}

impl Cache {
    pub(crate) fn new(
        meta: CacheMeta,
        layout: KvLayout,
        tree: RadixTree,
        lineage: Vec<BlockId>,
        blocks: BTreeMap<BlockId, Arc<Block>>,
    ) -> Self {
        Self {
            meta,
            layout,
            tree,
            lineage,
            blocks,
        }
    }

    /// Rebuild a cache from its metadata, validating the result.
    ///
    /// Missing objects surface as storage errors; anything that decodes but
    /// breaks the tree or block invariants is `Corruption`.
    pub fn resolve(meta: &CacheMeta, store: &dyn ObjectStore) -> Result<Self> {
        let layout = meta
            .layout()
            .map_err(|e| CacheError::corruption(format!("cache metadata: {e}")))?;

        let tree_bytes = store.get(meta.root_tree_ref)?;
        let tree: RadixTree = serde_json::from_slice(&tree_bytes).map_err(|e| {
            CacheError::corruption(format!("tree object {}: {e}", meta.root_tree_ref))
        })?;

        let mut lineage = Vec::with_capacity(meta.block_id_list.len());
        let mut blocks = BTreeMap::new();
        for &object in &meta.block_id_list {
            let image = store.get(object)?;
            let block = Block::decode(&image, layout, object).map_err(CacheError::Corruption)?;
            let id = block.id();
            if blocks.insert(id, Arc::new(block)).is_some() {
                return Err(CacheError::corruption(format!(
                    "{id} appears twice in block list"
                )));
            }
            lineage.push(id);
        }

        validate::check(&tree, &lineage, &blocks, &BTreeSet::new(), layout.block_size)?;
        debug!(
            version = meta.version,
            entries = tree.len(),
            blocks = lineage.len(),
            "Resolved cache"
        );

        Ok(Self::new(meta.clone(), layout, tree, lineage, blocks))
    }

    /// KV state cached for `path + [next]`.
    pub fn query(&self, path: &[Token], next: Token) -> Result<KvState> {
        let key = child_key(path, next);
        let slot = self
            .tree
            .find(&key)
            .and_then(|id| self.tree.slot(id))
            .ok_or(CacheError::KeyNotFound)?;
        let payload = self.read(slot).ok_or_else(|| {
            CacheError::corruption(format!("entry points at empty slot {} of {}", slot.slot, slot.block))
        })?;
        Ok(KvState::new(
            Bytes::copy_from_slice(payload),
            self.layout.tensor_nbytes,
        ))
    }

    /// Length of the longest prefix of `tokens` with cached state.
    pub fn match_prefix(&self, tokens: &[Token]) -> usize {
        self.tree.longest_cached_prefix(tokens).0
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.meta.version
    }

    pub fn layout(&self) -> &KvLayout {
        &self.layout
    }

    pub fn meta(&self) -> &CacheMeta {
        &self.meta
    }

    /// Live blocks in chain order.
    pub fn block_ids(&self) -> &[BlockId] {
        &self.lineage
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(&id).map(|b| b.as_ref())
    }

    pub(crate) fn tree(&self) -> &RadixTree {
        &self.tree
    }

    pub(crate) fn blocks(&self) -> &BTreeMap<BlockId, Arc<Block>> {
        &self.blocks
    }

    pub(crate) fn read(&self, slot: SlotRef) -> Option<&[u8]> {
        self.blocks.get(&slot.block)?.read(slot.index())
    }

    /// Objects this cache keeps alive in the store.
    pub(crate) fn objects(&self) -> BTreeSet<ObjectId> {
        let mut objects: BTreeSet<ObjectId> = self.meta.block_id_list.iter().copied().collect();
        objects.insert(self.meta.root_tree_ref);
        objects
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Cache>();
    }

    #[test]
    fn test_meta_json() {
        let meta = CacheMeta {
            tensor_nbytes: 128,
            layer: 2,
            cache_capacity: 64,
            block_size: 4,
            version: 7,
            root_tree_ref: ObjectId(3),
            block_id_list: vec![ObjectId(1), ObjectId(2)],
        };
        let json = meta.to_json().unwrap();
        assert!(json.contains("\"root_tree_ref\":3"));
        assert_eq!(CacheMeta::from_json(&json).unwrap(), meta);
        assert!(matches!(
            CacheMeta::from_json("{\"version\": 1}"),
            Err(CacheError::Corruption(_))
        ));
    }
}
