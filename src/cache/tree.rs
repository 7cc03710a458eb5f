//! Radix tree over token paths.
//!
//! Edges carry token labels; a node's token path is the concatenation of the
//! labels from the root down to it. A node holds a slot reference only when KV
//! state has been committed for exactly that path.
//!
//! Nodes live in a flat arena addressed by [`NodeId`]. Children and parents are
//! stored as ids, never as owning pointers, so splitting and folding edges is a
//! matter of rewriting indices. Freed entries bump a generation counter, which
//! lets [`NodeHandle`]s detect that they outlived their node.
//!
//! Structural invariants (checked by [`RadixTree::validate`]):
//! - sibling edges never start with the same token
//! - every non-root node has a non-empty label
//! - a non-root node without a slot has at least two children
//!
//! ```text
//! insert [1,2,3,4] then [1,2,5]:
//!   root ─[1,2]─┬─[3,4]   (slot)
//!               └─[5]     (slot)
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cache::block::BlockId;

/// A token identifier.
pub type Token = i32;

/// Index of a node in the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    /// The root node. It has an empty label and never holds a slot.
    pub const ROOT: NodeId = NodeId(0);

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Generation-tagged reference to a node, valid until the node is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeHandle {
    id: NodeId,
    generation: u32,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }
}

/// Location of one token's KV state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotRef {
    pub block: BlockId,
    pub slot: u32,
}

impl SlotRef {
    pub fn new(block: BlockId, slot: usize) -> Self {
        Self {
            block,
            slot: slot as u32,
        }
    }

    pub fn index(&self) -> usize {
        self.slot as usize
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Node {
    generation: u32,
    live: bool,
    label: Vec<Token>,
    parent: Option<NodeId>,
    children: BTreeMap<Token, NodeId>,
    slot: Option<SlotRef>,
    /// Builder version at which the slot was committed.
    stamp: u64,
}

/// Result of [`RadixTree::longest_prefix_match`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixMatch {
    /// Deepest node whose whole path is a prefix of the query.
    pub node: NodeId,
    /// Length of that node's path.
    pub matched: usize,
}

/// A committed entry, as reported by [`RadixTree::entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub node: NodeId,
    pub path: Vec<Token>,
    pub slot: SlotRef,
    pub stamp: u64,
}

/// Counters from [`RadixTree::merge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Paths only present in the other tree.
    pub added: usize,
    /// Paths present in both where the other tree's slot won.
    pub replaced: usize,
    /// Paths present in both where this tree's slot was kept.
    pub kept: usize,
}

/// A slot reference together with the version it was committed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamped {
    pub slot: SlotRef,
    pub stamp: u64,
}

/// Decision returned by the merge resolver for one incoming entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Keep this tree's state (or skip the incoming entry).
    Keep,
    /// Install the given slot for the path.
    Install(Stamped),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadixTree {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
    /// Number of nodes holding a slot.
    len: usize,
}

impl Default for RadixTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Length of the shared prefix of two token slices.
pub fn common_prefix_len(a: &[Token], b: &[Token]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Entry key addressed by a query: the path followed by the next token.
pub fn child_key(path: &[Token], next: Token) -> Vec<Token> {
    let mut key = Vec::with_capacity(path.len() + 1);
    key.extend_from_slice(path);
    key.push(next);
    key
}

impl RadixTree {
    pub fn new() -> Self {
        let root = Node {
            live: true,
            ..Default::default()
        };
        Self {
            nodes: vec![root],
            free: Vec::new(),
            len: 0,
        }
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of live nodes, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len().saturating_sub(self.free.len())
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    fn alloc(&mut self, label: Vec<Token>, parent: NodeId) -> NodeId {
        let node = |generation| Node {
            generation,
            live: true,
            label,
            parent: Some(parent),
            ..Default::default()
        };
        match self.free.pop() {
            Some(id) => {
                let generation = self.node(id).generation;
                *self.node_mut(id) = node(generation);
                id
            }
            None => {
                let id = NodeId(self.nodes.len() as u32);
                self.nodes.push(node(0));
                id
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        let node = self.node_mut(id);
        let generation = node.generation.wrapping_add(1);
        *node = Node {
            generation,
            ..Default::default()
        };
        self.free.push(id);
    }

    /// Handle for a live node.
    pub fn handle(&self, id: NodeId) -> NodeHandle {
        NodeHandle {
            id,
            generation: self.node(id).generation,
        }
    }

    /// Resolve a handle, or `None` if its node has been freed since.
    pub fn resolve(&self, handle: NodeHandle) -> Option<NodeId> {
        let node = self.nodes.get(handle.id.index())?;
        (node.live && node.generation == handle.generation).then_some(handle.id)
    }

    pub fn slot(&self, id: NodeId) -> Option<SlotRef> {
        self.node(id).slot
    }

    pub fn stamp(&self, id: NodeId) -> u64 {
        self.node(id).stamp
    }

    /// Slot and commit stamp of a node, if it holds state.
    pub fn stamped(&self, id: NodeId) -> Option<Stamped> {
        let node = self.node(id);
        node.slot.map(|slot| Stamped {
            slot,
            stamp: node.stamp,
        })
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn is_leaf(&self, id: NodeId) -> bool {
        self.node(id).children.is_empty()
    }

    /// Point an existing entry at a different slot (block relocation).
    pub fn relink(&mut self, id: NodeId, slot: SlotRef) {
        let node = self.node_mut(id);
        debug_assert!(node.slot.is_some());
        node.slot = Some(slot);
    }

    /// Child reached from `id` by an edge starting with `token`.
    fn child(&self, id: NodeId, token: Token) -> Option<NodeId> {
        self.node(id).children.get(&token).copied()
    }

    /// Deepest node whose full path is a prefix of `path`.
    pub fn longest_prefix_match(&self, path: &[Token]) -> PrefixMatch {
        let mut current = NodeId::ROOT;
        let mut matched = 0;

        while let Some(&token) = path.get(matched) {
            let Some(child) = self.child(current, token) else {
                break;
            };
            let label = &self.node(child).label;
            if !path[matched..].starts_with(label) {
                break;
            }
            matched += label.len();
            current = child;
        }

        PrefixMatch {
            node: current,
            matched,
        }
    }

    /// Node whose path is exactly `path`.
    pub fn find(&self, path: &[Token]) -> Option<NodeId> {
        let m = self.longest_prefix_match(path);
        (m.matched == path.len()).then_some(m.node)
    }

    /// Length of the longest prefix of `path` ending at a node with a slot,
    /// together with that node.
    pub fn longest_cached_prefix(&self, path: &[Token]) -> (usize, Option<NodeId>) {
        let mut current = NodeId::ROOT;
        let mut matched = 0;
        let mut best = (0, None);

        while let Some(&token) = path.get(matched) {
            let Some(child) = self.child(current, token) else {
                break;
            };
            let node = self.node(child);
            if !path[matched..].starts_with(&node.label) {
                break;
            }
            matched += node.label.len();
            current = child;
            if node.slot.is_some() {
                best = (matched, Some(child));
            }
        }

        best
    }

    /// Split the edge into `child` after `at` tokens, returning the new
    /// intermediate node. `child` keeps its id and its full path.
    fn split_edge(&mut self, parent: NodeId, child: NodeId, at: usize) -> NodeId {
        let label = std::mem::take(&mut self.node_mut(child).label);
        let (upper, lower) = label.split_at(at);
        let (upper, lower) = (upper.to_vec(), lower.to_vec());
        let (first, child_first) = (upper[0], lower[0]);

        let mid = self.alloc(upper, parent);
        self.node_mut(mid).children.insert(child_first, child);
        self.node_mut(parent).children.insert(first, mid);

        let child_node = self.node_mut(child);
        child_node.label = lower;
        child_node.parent = Some(mid);
        mid
    }

    /// Node for `path`, creating it (and splitting edges) as needed.
    fn ensure_path(&mut self, path: &[Token]) -> NodeId {
        let mut current = NodeId::ROOT;
        let mut consumed = 0;

        while let Some(&token) = path.get(consumed) {
            let rest = &path[consumed..];
            match self.child(current, token) {
                None => {
                    let leaf = self.alloc(rest.to_vec(), current);
                    self.node_mut(current).children.insert(token, leaf);
                    return leaf;
                }
                Some(child) => {
                    let common = common_prefix_len(&self.node(child).label, rest);
                    if common < self.node(child).label.len() {
                        current = self.split_edge(current, child, common);
                    } else {
                        current = child;
                    }
                    consumed += common;
                }
            }
        }

        current
    }

    /// Commit a slot for `path`. Returns the node and the slot it replaced.
    ///
    /// `path` must be non-empty; the root never holds state.
    pub fn insert(&mut self, path: &[Token], slot: SlotRef, stamp: u64) -> (NodeId, Option<SlotRef>) {
        debug_assert!(!path.is_empty(), "the root cannot hold a slot");
        let id = self.ensure_path(path);
        let node = self.node_mut(id);
        let previous = node.slot.replace(slot);
        node.stamp = stamp;
        if previous.is_none() {
            self.len += 1;
        }
        (id, previous)
    }

    /// Remove a node's slot, pruning and compacting around it.
    ///
    /// Returns the removed slot, or `None` if the node held none.
    pub fn remove(&mut self, id: NodeId) -> Option<SlotRef> {
        let slot = self.node_mut(id).slot.take()?;
        self.len -= 1;
        self.compact(id);
        Some(slot)
    }

    /// Restore the structural invariants after `id` lost its slot or a child.
    fn compact(&mut self, mut id: NodeId) {
        while id != NodeId::ROOT {
            let node = self.node(id);
            if node.slot.is_some() {
                return;
            }
            let parent = match node.parent {
                Some(parent) => parent,
                None => return,
            };
            match node.children.len() {
                0 => {
                    let first = node.label[0];
                    self.node_mut(parent).children.remove(&first);
                    self.release(id);
                    id = parent;
                }
                1 => {
                    // Fold this node into its only child so the child keeps
                    // its id (handles to it stay valid).
                    let (_, &child) = match node.children.iter().next() {
                        Some(entry) => entry,
                        None => return,
                    };
                    let mut label = node.label.clone();
                    label.extend_from_slice(&self.node(child).label);
                    let first = label[0];

                    let child_node = self.node_mut(child);
                    child_node.label = label;
                    child_node.parent = Some(parent);
                    self.node_mut(parent).children.insert(first, child);
                    self.release(id);
                    return;
                }
                _ => return,
            }
        }
    }

    /// Full token path of a node.
    pub fn path_of(&self, id: NodeId) -> Vec<Token> {
        let mut labels = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.node(node_id);
            labels.push(&node.label[..]);
            current = node.parent;
        }
        labels.into_iter().rev().flatten().copied().collect()
    }

    /// All committed entries in token order.
    pub fn entries(&self) -> Vec<Entry> {
        let mut out = Vec::with_capacity(self.len);
        let mut stack = vec![(NodeId::ROOT, Vec::new())];

        while let Some((id, mut path)) = stack.pop() {
            let node = self.node(id);
            path.extend_from_slice(&node.label);
            if let Some(slot) = node.slot {
                out.push(Entry {
                    node: id,
                    path: path.clone(),
                    slot,
                    stamp: node.stamp,
                });
            }
            for &child in node.children.values().rev() {
                stack.push((child, path.clone()));
            }
        }

        out
    }

    /// Leaf nodes holding a slot: the eviction frontier.
    pub fn leaves(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().enumerate().filter_map(|(i, node)| {
            (node.live && node.slot.is_some() && node.children.is_empty())
                .then_some(NodeId(i as u32))
        })
    }

    /// Nodes holding a slot, in arena order.
    pub fn slotted(&self) -> impl Iterator<Item = (NodeId, SlotRef)> + '_ {
        self.nodes.iter().enumerate().filter_map(|(i, node)| {
            if !node.live {
                return None;
            }
            node.slot.map(|slot| (NodeId(i as u32), slot))
        })
    }

    /// Structurally union `other` into this tree.
    ///
    /// For every committed entry of `other`, `resolve(path, ours, theirs)` picks
    /// the state to keep. Paths only present in `other` are offered with
    /// `ours = None`. Merging the same tree twice changes nothing as long as
    /// the resolver keeps identical state.
    pub fn merge<E, F>(&mut self, other: &RadixTree, mut resolve: F) -> Result<MergeStats, E>
    where
        F: FnMut(&[Token], Option<Stamped>, Stamped) -> Result<Resolution, E>,
    {
        let mut stats = MergeStats::default();

        for entry in other.entries() {
            let ours = self.find(&entry.path).and_then(|id| self.stamped(id));
            let theirs = Stamped {
                slot: entry.slot,
                stamp: entry.stamp,
            };
            match resolve(&entry.path, ours, theirs)? {
                Resolution::Keep => {
                    if ours.is_some() {
                        stats.kept += 1;
                    }
                }
                Resolution::Install(chosen) => {
                    self.insert(&entry.path, chosen.slot, chosen.stamp);
                    if ours.is_some() {
                        stats.replaced += 1;
                    } else {
                        stats.added += 1;
                    }
                }
            }
        }

        Ok(stats)
    }

    /// Check the structural invariants. Returns a description of the first
    /// violation found.
    pub fn validate(&self) -> Result<(), String> {
        let root = self.nodes.first().ok_or("tree has no root")?;
        if !root.live || !root.label.is_empty() || root.parent.is_some() || root.slot.is_some() {
            return Err("root must be live, unlabeled and slot-free".into());
        }

        // The free list must name exactly the dead nodes, each once: `alloc`
        // reuses its entries without looking.
        let mut freed = vec![false; self.nodes.len()];
        for &id in &self.free {
            let node = self
                .nodes
                .get(id.index())
                .ok_or_else(|| format!("free list names unknown node {id:?}"))?;
            if node.live {
                return Err(format!("free list names live node {id:?}"));
            }
            if std::mem::replace(&mut freed[id.index()], true) {
                return Err(format!("node {id:?} is on the free list twice"));
            }
        }
        if let Some(i) = self
            .nodes
            .iter()
            .zip(&freed)
            .position(|(node, &freed)| !node.live && !freed)
        {
            return Err(format!("dead node {i} is missing from the free list"));
        }

        let mut reachable = 0;
        let mut slots = 0;
        let mut stack = vec![NodeId::ROOT];

        while let Some(id) = stack.pop() {
            let node = self
                .nodes
                .get(id.index())
                .filter(|n| n.live)
                .ok_or_else(|| format!("edge to dead node {id:?}"))?;
            reachable += 1;
            if reachable > self.nodes.len() {
                return Err("cycle in tree".into());
            }
            if node.slot.is_some() {
                slots += 1;
            }
            if id != NodeId::ROOT {
                if node.label.is_empty() {
                    return Err(format!("node {id:?} has an empty label"));
                }
                if node.slot.is_none() && node.children.len() < 2 {
                    return Err(format!("node {id:?} is an uncompacted pass-through"));
                }
            }

            for (&token, &child) in &node.children {
                let child_node = self
                    .nodes
                    .get(child.index())
                    .filter(|n| n.live)
                    .ok_or_else(|| format!("edge to dead node {child:?}"))?;
                if child_node.label.first() != Some(&token) {
                    return Err(format!(
                        "edge {token} of node {id:?} leads to a label starting with {:?}",
                        child_node.label.first()
                    ));
                }
                if child_node.parent != Some(id) {
                    return Err(format!("node {child:?} does not point back to {id:?}"));
                }
                stack.push(child);
            }
        }

        if reachable != self.node_count() {
            return Err(format!(
                "{} live nodes but {reachable} reachable",
                self.node_count()
            ));
        }
        if slots != self.len {
            return Err(format!("{slots} slots but length is {}", self.len));
        }
        Ok(())
    }
}
