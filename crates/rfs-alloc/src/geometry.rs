//! Filesystem geometry as seen by the allocator.

use rfs_error::{Result, RfsError};
use rfs_types::{BitmapIndex, BlockNumber, BlockSize};
use serde::Serialize;

/// Block number of the first bitmap on a freshly formatted device.
pub const DEFAULT_FIRST_BITMAP_BLOCK: u64 = 1;

/// Immutable geometry fixed at mount.
///
/// Bitmap `i` describes blocks `i * bits_per_bitmap .. (i + 1) * bits_per_bitmap`.
/// Bitmap 0 lives at `first_bitmap_block`; every other bitmap lives at the
/// first block it describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Geometry {
    block_size: BlockSize,
    block_count: u64,
    bitmap_count: u32,
    first_bitmap_block: u64,
}

impl Geometry {
    pub fn new(block_size: BlockSize, block_count: u64) -> Result<Self> {
        let bits = u64::from(block_size.bits_per_bitmap());
        if block_count <= DEFAULT_FIRST_BITMAP_BLOCK {
            return Err(RfsError::InvalidGeometry(format!(
                "block_count={block_count} leaves no room for a bitmap"
            )));
        }
        let bitmap_count = u32::try_from(block_count.div_ceil(bits)).map_err(|_| {
            RfsError::InvalidGeometry(format!(
                "block_count={block_count} needs more than u32::MAX bitmaps"
            ))
        })?;
        Ok(Self {
            block_size,
            block_count,
            bitmap_count,
            first_bitmap_block: DEFAULT_FIRST_BITMAP_BLOCK,
        })
    }

    /// Place bitmap 0 at `block` instead of block 1 (e.g. behind a larger
    /// super block area). Everything below it is reserved.
    pub fn with_first_bitmap_block(mut self, block: u64) -> Result<Self> {
        let bits = u64::from(self.bits_per_bitmap());
        if block == 0 || block >= bits.min(self.block_count) {
            return Err(RfsError::InvalidGeometry(format!(
                "first_bitmap_block={block} must be in 1..{}",
                bits.min(self.block_count)
            )));
        }
        self.first_bitmap_block = block;
        Ok(self)
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    #[must_use]
    pub fn bitmap_count(&self) -> u32 {
        self.bitmap_count
    }

    #[must_use]
    pub fn bits_per_bitmap(&self) -> u32 {
        self.block_size.bits_per_bitmap()
    }

    #[must_use]
    pub fn first_bitmap_block(&self) -> u64 {
        self.first_bitmap_block
    }

    /// On-disk location of bitmap `index`.
    #[must_use]
    pub fn bitmap_location(&self, index: BitmapIndex) -> BlockNumber {
        if index.0 == 0 {
            BlockNumber(self.first_bitmap_block)
        } else {
            BlockNumber(u64::from(index.0) * u64::from(self.bits_per_bitmap()))
        }
    }

    /// Split an absolute block number into (bitmap, bit).
    pub fn locate(&self, block: BlockNumber) -> Result<(BitmapIndex, u32)> {
        if block.0 >= self.block_count {
            return Err(RfsError::OutOfRange {
                what: "block",
                index: block.0,
                limit: self.block_count,
            });
        }
        Ok(self.split(block.0))
    }

    /// Split without the range check; `block` may equal `block_count` when
    /// used as an exclusive bound.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub(crate) fn split(&self, block: u64) -> (BitmapIndex, u32) {
        let bits = u64::from(self.bits_per_bitmap());
        // The remainder is below bits_per_bitmap and the quotient is bounded
        // by bitmap_count for in-range blocks.
        (BitmapIndex((block / bits) as u32), (block % bits) as u32)
    }

    #[must_use]
    pub fn block_at(&self, index: BitmapIndex, bit: u32) -> BlockNumber {
        BlockNumber(u64::from(index.0) * u64::from(self.bits_per_bitmap()) + u64::from(bit))
    }

    /// Number of bits in bitmap `index` that describe real blocks. Only the
    /// last bitmap can be short.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn valid_bits(&self, index: BitmapIndex) -> u32 {
        let bits = u64::from(self.bits_per_bitmap());
        let first = u64::from(index.0) * bits;
        // Bounded by bits_per_bitmap.
        self.block_count.saturating_sub(first).min(bits) as u32
    }

    /// Whether `block` holds a bitmap.
    #[must_use]
    pub fn is_bitmap_block(&self, block: BlockNumber) -> bool {
        if block.0 == self.first_bitmap_block {
            return true;
        }
        let (index, bit) = self.split(block.0);
        index.0 != 0 && index.0 < self.bitmap_count && bit == 0
    }

    /// Bits of bitmap `index` that are permanently in use: block 0 and the
    /// reserved area below bitmap 0, and every bitmap's own block.
    #[must_use]
    pub fn reserved_bits(&self, index: BitmapIndex) -> Vec<u32> {
        if index.0 == 0 {
            let first = u32::try_from(self.first_bitmap_block).unwrap_or(0);
            (0..=first).collect()
        } else {
            vec![0]
        }
    }
}
