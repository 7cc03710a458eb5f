//! KV block: a fixed-capacity array of token slots.
//!
//! Each slot holds one token's KV state for all layers. Occupancy is tracked
//! in a bitmap, so a block never holds more than `block_size` occupied slots.
//! Blocks chain through `successor`: when a block overflows, the block that
//! takes its future allocations is recorded there.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::cache::layout::KvLayout;
use crate::storage::{BufferId, ObjectId};

/// Identifier of a block within a cache lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blk-{}", self.0)
    }
}

/// Persisted image header: block id, occupancy bitmap, successor.
pub const HEADER_BYTES: usize = 24;

const NO_SUCCESSOR: u64 = u64::MAX;

/// A single KV block.
#[derive(Debug, Clone)]
pub struct Block {
    id: BlockId,
    layout: KvLayout,
    /// Bit `i` set = slot `i` holds committed state.
    occupied: u64,
    data: Vec<u8>,
    successor: Option<BlockId>,
    /// Writable store buffer, present between allocation and seal.
    buffer: Option<BufferId>,
    /// Last sealed object holding this block's image.
    object: Option<ObjectId>,
    /// Contents changed since the last seal.
    dirty: bool,
}

impl Block {
    pub fn new(id: BlockId, layout: KvLayout) -> Self {
        Self {
            id,
            layout,
            occupied: 0,
            data: vec![0u8; layout.payload_bytes()],
            successor: None,
            buffer: None,
            object: None,
            dirty: true,
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn successor(&self) -> Option<BlockId> {
        self.successor
    }

    pub(crate) fn set_successor(&mut self, successor: Option<BlockId>) {
        if self.successor != successor {
            self.successor = successor;
            self.dirty = true;
        }
    }

    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer
    }

    pub(crate) fn set_buffer(&mut self, buffer: Option<BufferId>) {
        self.buffer = buffer;
    }

    pub fn object(&self) -> Option<ObjectId> {
        self.object
    }

    pub(crate) fn set_object(&mut self, object: Option<ObjectId>) {
        self.object = object;
        self.dirty = false;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Force a rewrite of this block on the next build.
    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    fn mask(&self) -> u64 {
        if self.layout.block_size >= 64 {
            u64::MAX
        } else {
            (1u64 << self.layout.block_size) - 1
        }
    }

    /// Claim the lowest free slot. Returns `None` when the block is full.
    pub fn allocate(&mut self) -> Option<usize> {
        let free = !self.occupied & self.mask();
        if free == 0 {
            return None;
        }
        let slot = free.trailing_zeros() as usize;
        self.occupied |= 1 << slot;
        self.dirty = true;
        Some(slot)
    }

    fn range(&self, slot: usize) -> std::ops::Range<usize> {
        let size = self.layout.slot_bytes();
        slot * size..(slot + 1) * size
    }

    /// Write a payload into an allocated slot.
    pub fn write(&mut self, slot: usize, payload: &[u8]) {
        debug_assert!(self.is_occupied(slot));
        let range = self.range(slot);
        self.data[range].copy_from_slice(payload);
        self.dirty = true;
    }

    /// Payload of an occupied slot.
    pub fn read(&self, slot: usize) -> Option<&[u8]> {
        if !self.is_occupied(slot) {
            return None;
        }
        self.data.get(self.range(slot))
    }

    /// Release a slot. Returns whether it was occupied.
    pub fn free(&mut self, slot: usize) -> bool {
        if !self.is_occupied(slot) {
            return false;
        }
        self.occupied &= !(1 << slot);
        let range = self.range(slot);
        self.data[range].fill(0);
        self.dirty = true;
        true
    }

    pub fn is_occupied(&self, slot: usize) -> bool {
        slot < self.layout.block_size && self.occupied & (1 << slot) != 0
    }

    pub fn occupied_count(&self) -> usize {
        self.occupied.count_ones() as usize
    }

    pub fn is_full(&self) -> bool {
        self.occupied_count() >= self.layout.block_size
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    pub fn occupied_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.layout.block_size).filter(|&slot| self.is_occupied(slot))
    }

    /// Size of the persisted image.
    pub fn image_bytes(layout: &KvLayout) -> usize {
        HEADER_BYTES + layout.payload_bytes()
    }

    /// Header of the persisted image.
    pub fn header(&self) -> [u8; HEADER_BYTES] {
        let mut header = [0u8; HEADER_BYTES];
        let mut out = &mut header[..];
        out.put_u64_le(self.id.0);
        out.put_u64_le(self.occupied);
        out.put_u64_le(self.successor.map_or(NO_SUCCESSOR, |s| s.0));
        header
    }

    /// Full persisted image: header followed by the payload area.
    pub fn image(&self) -> BytesMut {
        let mut image = BytesMut::with_capacity(Self::image_bytes(&self.layout));
        image.put_slice(&self.header());
        image.put_slice(&self.data);
        image
    }

    /// Rebuild a block from its persisted image.
    pub fn decode(mut image: &[u8], layout: KvLayout, object: ObjectId) -> Result<Self, String> {
        let expected = Self::image_bytes(&layout);
        if image.len() != expected {
            return Err(format!(
                "object {object} holds {} bytes, block image needs {expected}",
                image.len()
            ));
        }

        let id = BlockId(image.get_u64_le());
        let occupied = image.get_u64_le();
        let successor = match image.get_u64_le() {
            NO_SUCCESSOR => None,
            raw => Some(BlockId(raw)),
        };

        let mut block = Self::new(id, layout);
        if occupied & !block.mask() != 0 {
            return Err(format!(
                "{id} marks slots beyond block_size {}",
                layout.block_size
            ));
        }
        block.occupied = occupied;
        block.successor = successor;
        block.data.copy_from_slice(image);
        block.set_object(Some(object));
        Ok(block)
    }
}
