//! Eviction policy: decides which cached entries to drop.
//!
//! Only leaf entries are candidates, so a prefix is never evicted while a
//! longer cached path still depends on it. Candidates are ordered by commit
//! stamp, oldest first. Evicting a leaf can expose its parent as a new leaf;
//! the parent then joins the candidate heap.
//!
//! Paths registered with [`Evictor::protect`] (e.g. sequences still being
//! decoded) shield every entry along them.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use tracing::debug;

use crate::cache::tree::{NodeHandle, NodeId, RadixTree, SlotRef, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    stamp: u64,
    node: NodeId,
    handle: NodeHandle,
}

// Reversed so the max-heap pops the oldest stamp first.
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .stamp
            .cmp(&self.stamp)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The eviction policy engine.
#[derive(Debug, Clone, Default)]
pub struct Evictor {
    protected: Vec<Vec<Token>>,
}

impl Evictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shield every entry whose path is a prefix of `tokens`.
    pub fn protect(&mut self, tokens: Vec<Token>) {
        self.protected.push(tokens);
    }

    /// Drop one protection registered for exactly `tokens`.
    pub fn unprotect(&mut self, tokens: &[Token]) {
        if let Some(pos) = self.protected.iter().position(|p| p == tokens) {
            self.protected.swap_remove(pos);
        }
    }

    pub fn is_protected(&self, path: &[Token]) -> bool {
        self.protected.iter().any(|p| p.starts_with(path))
    }

    fn candidate(&self, tree: &RadixTree, node: NodeId) -> Option<Candidate> {
        if self.is_protected(&tree.path_of(node)) {
            return None;
        }
        Some(Candidate {
            stamp: tree.stamp(node),
            node,
            handle: tree.handle(node),
        })
    }

    /// Remove up to `count` entries from `tree`, oldest leaf first. Each
    /// removed slot is handed to `release`. Returns the evicted paths.
    pub fn evict(
        &self,
        tree: &mut RadixTree,
        count: usize,
        mut release: impl FnMut(SlotRef),
    ) -> Vec<Vec<Token>> {
        let mut heap: BinaryHeap<Candidate> = tree
            .leaves()
            .collect::<Vec<_>>()
            .into_iter()
            .filter_map(|node| self.candidate(tree, node))
            .collect();
        let mut evicted = Vec::new();

        while evicted.len() < count {
            let Some(victim) = heap.pop() else {
                break;
            };
            if tree.resolve(victim.handle).is_none() {
                continue;
            }

            let parent = tree.parent(victim.node).map(|p| tree.handle(p));
            let path = tree.path_of(victim.node);
            let Some(slot) = tree.remove(victim.node) else {
                continue;
            };
            release(slot);
            debug!(?path, stamp = victim.stamp, "Evicted entry");
            evicted.push(path);

            // A parent holding state that just lost its last child is a leaf now.
            let exposed = parent
                .and_then(|handle| tree.resolve(handle))
                .filter(|&p| p != NodeId::ROOT && tree.slot(p).is_some() && tree.is_leaf(p));
            if let Some(candidate) = exposed.and_then(|p| self.candidate(tree, p)) {
                heap.push(candidate);
            }
        }

        evicted
    }
}
