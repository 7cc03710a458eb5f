//! KV layout and payload types.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cache::block::HEADER_BYTES as IMAGE_HEADER_BYTES;
use crate::error::{CacheError, Result};

/// Maximum slots per block; slot occupancy is tracked in a 64-bit bitmap.
pub const MAX_BLOCK_SIZE: usize = 64;

/// Shape of the cached KV state.
///
/// One slot holds one token's KV state across all layers:
/// `layer * tensor_nbytes` bytes. A block holds `block_size` slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvLayout {
    /// Bytes of one layer's K and V tensors for a single token.
    pub tensor_nbytes: usize,
    /// Number of layers.
    pub layer: usize,
    /// Slots per block.
    pub block_size: usize,
}

impl KvLayout {
    pub fn new(tensor_nbytes: usize, layer: usize, block_size: usize) -> Result<Self> {
        let layout = Self {
            tensor_nbytes,
            layer,
            block_size,
        };
        layout.validate()?;
        Ok(layout)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tensor_nbytes == 0 || self.layer == 0 {
            return Err(CacheError::InvalidConfig(format!(
                "tensor_nbytes ({}) and layer ({}) must be non-zero",
                self.tensor_nbytes, self.layer
            )));
        }
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(CacheError::InvalidConfig(format!(
                "block_size {} outside 1..={MAX_BLOCK_SIZE}",
                self.block_size
            )));
        }
        let image = self
            .tensor_nbytes
            .checked_mul(self.layer)
            .and_then(|slot| slot.checked_mul(self.block_size))
            .and_then(|payload| payload.checked_add(IMAGE_HEADER_BYTES))
            .filter(|&image| image <= isize::MAX as usize);
        if image.is_none() {
            return Err(CacheError::InvalidConfig(format!(
                "block of {} slots x {} layers x {} bytes does not fit in memory",
                self.block_size, self.layer, self.tensor_nbytes
            )));
        }
        Ok(())
    }

    /// Size of one slot in bytes.
    pub fn slot_bytes(&self) -> usize {
        self.layer * self.tensor_nbytes
    }

    /// Size of a block's payload area in bytes.
    pub fn payload_bytes(&self) -> usize {
        self.block_size * self.slot_bytes()
    }

    /// Check a payload length against the slot size.
    pub fn check_payload(&self, payload: &[u8]) -> Result<()> {
        if payload.len() != self.slot_bytes() {
            return Err(CacheError::PayloadSize {
                expected: self.slot_bytes(),
                actual: payload.len(),
            });
        }
        Ok(())
    }
}

/// One token's cached KV state, all layers concatenated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvState {
    data: Bytes,
    tensor_nbytes: usize,
}

impl KvState {
    pub(crate) fn new(data: Bytes, tensor_nbytes: usize) -> Self {
        Self {
            data,
            tensor_nbytes,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of layers in this state.
    pub fn layers(&self) -> usize {
        self.data.len() / self.tensor_nbytes
    }

    /// The K/V bytes of one layer, or `None` if out of range.
    pub fn layer(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(self.tensor_nbytes)?;
        self.data.get(start..start + self.tensor_nbytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_sizes() {
        let layout = KvLayout::new(128, 2, 4).unwrap();
        assert_eq!(layout.slot_bytes(), 256);
        assert_eq!(layout.payload_bytes(), 1024);
    }

    #[test]
    fn test_block_size_bounds() {
        assert!(KvLayout::new(128, 2, 0).is_err());
        assert!(KvLayout::new(128, 2, 65).is_err());
        assert!(KvLayout::new(128, 2, 64).is_ok());
        assert!(KvLayout::new(0, 2, 4).is_err());
    }

    #[test]
    fn test_oversized_layout_rejected() {
        assert!(matches!(
            KvLayout::new(usize::MAX / 2 + 1, 2, 4),
            Err(CacheError::InvalidConfig(_))
        ));
        assert!(KvLayout::new(usize::MAX / 64, 1, 64).is_err());
    }

    #[test]
    fn test_payload_check() {
        let layout = KvLayout::new(4, 2, 4).unwrap();
        assert!(layout.check_payload(&[0u8; 8]).is_ok());
        assert!(matches!(
            layout.check_payload(&[0u8; 7]),
            Err(CacheError::PayloadSize { expected: 8, actual: 7 })
        ));
    }

    #[test]
    fn test_state_layers() {
        let state = KvState::new(Bytes::from(vec![1, 1, 2, 2, 3, 3]), 2);
        assert_eq!(state.layers(), 3);
        assert_eq!(state.layer(1), Some(&[2u8, 2][..]));
        assert_eq!(state.layer(3), None);
    }
}
