//! In-memory bitmap blocks.
//!
//! Bits are stored as atomics so searches never take a lock. All mutation
//! goes through [`BitmapMut`], which holds the block's mutation mutex and
//! brackets the change with the journal: the buffer is prepared when the
//! guard is created and either marked dirty or restored when it drops.

use crate::geometry::Geometry;
use crate::space::FreeSpace;
use parking_lot::{Mutex, MutexGuard};
use rfs_error::{Result, RfsError};
use rfs_journal::{Journal, JournalBuffer, Transaction};
use rfs_types::{BitmapIndex, BlockNumber};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

// ── Bitmap block ────────────────────────────────────────────────────────────

/// Mirror of one on-disk bitmap block.
///
/// Bit `i` (LSB-first within each byte) covers block
/// `index * bits_per_bitmap + i`; a set bit means in use.
#[derive(Debug)]
pub struct BitmapBlock {
    index: BitmapIndex,
    location: BlockNumber,
    bits: Box<[AtomicU8]>,
    free_count: AtomicU32,
    mutation: Mutex<()>,
}

impl BitmapBlock {
    /// Build from an on-disk image, deriving the free count.
    #[must_use]
    pub fn from_image(index: BitmapIndex, location: BlockNumber, image: &[u8]) -> Self {
        let free: u32 = image.iter().map(|byte| byte.count_zeros()).sum();
        Self {
            index,
            location,
            bits: image.iter().map(|&byte| AtomicU8::new(byte)).collect(),
            free_count: AtomicU32::new(free),
            mutation: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn index(&self) -> BitmapIndex {
        self.index
    }

    /// Block number this bitmap is persisted to.
    #[must_use]
    pub fn location(&self) -> BlockNumber {
        self.location
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn bits_per_bitmap(&self) -> u32 {
        // Block sizes are capped at 64 KiB, so this is at most 2^19.
        (self.bits.len() * 8) as u32
    }

    /// Cached number of zero bits.
    #[must_use]
    pub fn free_count(&self) -> u32 {
        self.free_count.load(Ordering::Acquire)
    }

    fn journal_buffer(&self) -> JournalBuffer {
        JournalBuffer::Bitmap {
            index: self.index,
            block: self.location,
        }
    }

    fn check_bit(&self, bit: u32) -> Result<(usize, u8)> {
        if bit >= self.bits_per_bitmap() {
            return Err(RfsError::OutOfRange {
                what: "bit",
                index: u64::from(bit),
                limit: u64::from(self.bits_per_bitmap()),
            });
        }
        Ok(((bit / 8) as usize, 1_u8 << (bit % 8)))
    }

    /// Set `bit` without the mutation window, the way a racing allocator's
    /// claim looks to a scanner that already picked its window.
    #[cfg(test)]
    pub(crate) fn set_racing(&self, bit: u32) {
        if let Ok((byte, mask)) = self.check_bit(bit) {
            if self.bits[byte].fetch_or(mask, Ordering::AcqRel) & mask == 0 {
                self.free_count.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Whether `bit` is in use.
    pub fn test(&self, bit: u32) -> Result<bool> {
        let (byte, mask) = self.check_bit(bit)?;
        Ok(self.bits[byte].load(Ordering::Acquire) & mask != 0)
    }

    /// First zero bit in `from..end`, without locking.
    #[must_use]
    pub fn find_zero(&self, from: u32, end: u32) -> Option<u32> {
        let end = end.min(self.bits_per_bitmap());
        let mut bit = from;
        while bit < end {
            let byte = self.bits[(bit / 8) as usize].load(Ordering::Acquire);
            if byte == 0xFF {
                bit = (bit | 7) + 1;
                continue;
            }
            if byte & (1 << (bit % 8)) == 0 {
                return Some(bit);
            }
            bit += 1;
        }
        None
    }

    /// Count the zero bits by walking the whole block.
    #[must_use]
    pub fn count_zero_bits(&self) -> u32 {
        self.bits
            .iter()
            .map(|byte| byte.load(Ordering::Acquire).count_zeros())
            .sum()
    }

    /// Snapshot of the current on-disk image.
    #[must_use]
    pub fn image(&self) -> Vec<u8> {
        self.bits
            .iter()
            .map(|byte| byte.load(Ordering::Acquire))
            .collect()
    }

    /// Open the mutation window: take the block's mutex and capture the
    /// current image for `txn`.
    pub fn prepare<'a>(
        &'a self,
        journal: &'a dyn Journal,
        txn: &'a Transaction,
    ) -> Result<BitmapMut<'a>> {
        let lock = self.mutation.lock();
        journal.prepare_for_journal(txn, self.journal_buffer(), &self.image())?;
        Ok(BitmapMut {
            block: self,
            journal,
            txn,
            toggled: BTreeSet::new(),
            _lock: lock,
        })
    }
}

// ── Mutation guard ──────────────────────────────────────────────────────────

/// Exclusive mutation window over one bitmap block.
///
/// On drop the new image is handed to the journal if any bit differs from
/// the state at `prepare` time; otherwise the prepared buffer is restored.
pub struct BitmapMut<'a> {
    block: &'a BitmapBlock,
    journal: &'a dyn Journal,
    txn: &'a Transaction,
    /// Bits whose value differs from the prepared image.
    toggled: BTreeSet<u32>,
    _lock: MutexGuard<'a, ()>,
}

impl BitmapMut<'_> {
    pub fn test(&self, bit: u32) -> Result<bool> {
        self.block.test(bit)
    }

    fn toggle(&mut self, bit: u32) {
        if !self.toggled.remove(&bit) {
            self.toggled.insert(bit);
        }
    }

    /// Set `bit`, returning `false` if it was already set.
    pub fn try_set(&mut self, bit: u32) -> Result<bool> {
        let (byte, mask) = self.block.check_bit(bit)?;
        let previous = self.block.bits[byte].fetch_or(mask, Ordering::AcqRel);
        if previous & mask != 0 {
            return Ok(false);
        }
        self.block.free_count.fetch_sub(1, Ordering::AcqRel);
        self.toggle(bit);
        Ok(true)
    }

    /// Set `bit`; `AlreadySet` if it is in use.
    pub fn set(&mut self, bit: u32) -> Result<()> {
        if self.try_set(bit)? {
            Ok(())
        } else {
            Err(RfsError::AlreadySet {
                block: self.block.absolute(bit),
            })
        }
    }

    /// Clear `bit`; `AlreadyClear` if it is free.
    pub fn clear(&mut self, bit: u32) -> Result<()> {
        let (byte, mask) = self.block.check_bit(bit)?;
        let previous = self.block.bits[byte].fetch_and(!mask, Ordering::AcqRel);
        if previous & mask == 0 {
            return Err(RfsError::AlreadyClear {
                block: self.block.absolute(bit),
            });
        }
        self.block.free_count.fetch_add(1, Ordering::AcqRel);
        self.toggle(bit);
        Ok(())
    }

    /// Whether the block differs from its prepared image.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        !self.toggled.is_empty()
    }
}

impl Drop for BitmapMut<'_> {
    fn drop(&mut self) {
        let buffer = self.block.journal_buffer();
        if self.is_modified() {
            self.journal
                .mark_dirty(self.txn, buffer, &self.block.image());
        } else {
            self.journal.restore_prepared(self.txn, buffer);
        }
    }
}

impl BitmapBlock {
    fn absolute(&self, bit: u32) -> u64 {
        u64::from(self.index.0) * u64::from(self.bits_per_bitmap()) + u64::from(bit)
    }
}

// ── Format ──────────────────────────────────────────────────────────────────

/// Images of every bitmap of a freshly formatted device: reserved blocks,
/// bitmap blocks and the bits past the end of the device are set.
#[must_use]
pub fn format_bitmaps(geometry: &Geometry) -> Vec<Vec<u8>> {
    let bytes = geometry.block_size().get() as usize;
    (0..geometry.bitmap_count())
        .map(|i| {
            let index = BitmapIndex(i);
            let mut image = vec![0_u8; bytes];
            let mut mark = |bit: u32| image[(bit / 8) as usize] |= 1 << (bit % 8);
            for bit in geometry.reserved_bits(index) {
                mark(bit);
            }
            for bit in geometry.valid_bits(index)..geometry.bits_per_bitmap() {
                mark(bit);
            }
            image
        })
        .collect()
}

// ── Bitmap array ────────────────────────────────────────────────────────────

/// All bitmaps of a mounted filesystem together with the free counters and
/// the journal every mutation goes through.
pub struct BitmapArray {
    geometry: Geometry,
    blocks: Vec<BitmapBlock>,
    space: FreeSpace,
    journal: Arc<dyn Journal>,
}

impl std::fmt::Debug for BitmapArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitmapArray")
            .field("geometry", &self.geometry)
            .field("bitmaps", &self.blocks.len())
            .field("space", &self.space)
            .finish_non_exhaustive()
    }
}

/// How a released block becomes reusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseMode {
    /// The block may still be referenced by the journal; it stays pending
    /// until the transaction commits.
    Journaled,
    /// The block was never exposed (preallocation, rollback); reusable at once.
    Immediate,
}

impl BitmapArray {
    /// Load bitmaps from their images. The images must match the geometry
    /// and keep the reserved bits of each bitmap set.
    pub fn from_images(
        geometry: Geometry,
        images: &[Vec<u8>],
        journal: Arc<dyn Journal>,
    ) -> Result<Self> {
        if images.len() != geometry.bitmap_count() as usize {
            return Err(RfsError::InvalidGeometry(format!(
                "expected {} bitmaps, got {}",
                geometry.bitmap_count(),
                images.len()
            )));
        }
        let block_size = geometry.block_size().get() as usize;
        let mut blocks = Vec::with_capacity(images.len());
        for (i, image) in (0_u32..).zip(images) {
            let index = BitmapIndex(i);
            let location = geometry.bitmap_location(index);
            if image.len() != block_size {
                return Err(RfsError::Corruption {
                    block: location.0,
                    detail: format!(
                        "bitmap image is {} bytes, block size is {block_size}",
                        image.len()
                    ),
                });
            }
            let block = BitmapBlock::from_image(index, location, image);
            for bit in geometry.reserved_bits(index) {
                if !block.test(bit)? {
                    return Err(RfsError::Corruption {
                        block: location.0,
                        detail: format!("reserved block {} is marked free", block.absolute(bit)),
                    });
                }
            }
            blocks.push(block);
        }
        let free = blocks.iter().map(|b| u64::from(b.free_count())).sum();
        Ok(Self {
            geometry,
            blocks,
            space: FreeSpace::new(free),
            journal,
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn space(&self) -> &FreeSpace {
        &self.space
    }

    #[must_use]
    pub fn journal(&self) -> &dyn Journal {
        self.journal.as_ref()
    }

    pub fn bitmap(&self, index: BitmapIndex) -> Result<&BitmapBlock> {
        self.blocks
            .get(index.as_usize())
            .ok_or(RfsError::OutOfRange {
                what: "bitmap",
                index: u64::from(index.0),
                limit: self.blocks.len() as u64,
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &BitmapBlock> {
        self.blocks.iter()
    }

    /// Whether `block` is currently marked in use.
    pub fn is_in_use(&self, block: BlockNumber) -> Result<bool> {
        let (index, bit) = self.geometry.locate(block)?;
        self.bitmap(index)?.test(bit)
    }

    /// Reject blocks that can never be freed or handed out: block 0, blocks
    /// past the device, the reserved area and bitmap blocks.
    pub fn check_reusable(&self, block: BlockNumber) -> Result<()> {
        if block.0 == 0 || block.0 >= self.geometry.block_count() {
            return Err(RfsError::OutOfRange {
                what: "block",
                index: block.0,
                limit: self.geometry.block_count(),
            });
        }
        if block.0 < self.geometry.first_bitmap_block() || self.geometry.is_bitmap_block(block) {
            return Err(RfsError::Corruption {
                block: block.0,
                detail: "reserved or bitmap block cannot be freed or reused".to_owned(),
            });
        }
        Ok(())
    }

    /// Clear `block`'s bit and credit both free counters inside `txn`.
    ///
    /// A block that is already free fails with `AlreadyClear` and changes
    /// nothing.
    pub fn release(&self, txn: &Transaction, block: BlockNumber, mode: ReleaseMode) -> Result<()> {
        self.check_reusable(block)?;
        let (index, bit) = self.geometry.locate(block)?;
        let bitmap = self.bitmap(index)?;
        let journal = self.journal();
        let mut guard = bitmap.prepare(journal, txn)?;
        if !guard.test(bit)? {
            return Err(RfsError::AlreadyClear { block: block.0 });
        }
        if mode == ReleaseMode::Journaled {
            journal.mark_freed(txn, block);
        }
        guard.clear(bit)?;
        if let Err(err) = self.space.give_back(journal, txn, 1) {
            guard.set(bit)?;
            return Err(err);
        }
        Ok(())
    }

    /// Verify every cached free count against the bits and the filesystem
    /// counter against their sum.
    pub fn check_consistency(&self) -> Result<()> {
        let mut total = 0_u64;
        for block in &self.blocks {
            let counted = block.count_zero_bits();
            if counted != block.free_count() {
                return Err(RfsError::Corruption {
                    block: block.location().0,
                    detail: format!(
                        "bitmap {} caches free_count={} but has {counted} zero bits",
                        block.index(),
                        block.free_count()
                    ),
                });
            }
            total += u64::from(counted);
        }
        let free = self.space.free_blocks();
        if free != total {
            return Err(RfsError::Corruption {
                block: 0,
                detail: format!("free block counter is {free}, bitmaps hold {total} free bits"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfs_journal::MemJournal;
    use rfs_types::BlockSize;

    fn small_geometry() -> Geometry {
        Geometry::new(BlockSize::new(512).unwrap(), 10_000).unwrap()
    }

    fn fresh(journal: Arc<MemJournal>) -> BitmapArray {
        let geometry = small_geometry();
        BitmapArray::from_images(geometry, &format_bitmaps(&geometry), journal).unwrap()
    }

    #[test]
    fn format_sets_reserved_and_tail_bits() {
        let geometry = small_geometry();
        let images = format_bitmaps(&geometry);
        assert_eq!(images.len(), 3);
        // Block 0 and bitmap 0 at block 1.
        assert_eq!(images[0][0], 0b0000_0011);
        // Bitmaps 1 and 2 reserve their own first bit.
        assert_eq!(images[1][0], 0b0000_0001);
        // 10_000 - 8_192 = 1_808 valid bits in the last bitmap.
        let last = BitmapBlock::from_image(BitmapIndex(2), BlockNumber(8192), &images[2]);
        assert!(!last.test(1_807).unwrap());
        assert!(last.test(1_808).unwrap());
        assert!(last.test(4_095).unwrap());
        assert_eq!(last.free_count(), 1_807);
    }

    #[test]
    fn test_out_of_range_is_error() {
        let block = BitmapBlock::from_image(BitmapIndex(0), BlockNumber(1), &[0_u8; 512]);
        assert!(matches!(
            block.test(4096),
            Err(RfsError::OutOfRange { what: "bit", .. })
        ));
    }

    #[test]
    fn find_zero_skips_full_bytes() {
        let mut image = vec![0xFF_u8; 512];
        image[100] = 0b1110_1111;
        let block = BitmapBlock::from_image(BitmapIndex(0), BlockNumber(1), &image);
        assert_eq!(block.find_zero(0, 4096), Some(804));
        assert_eq!(block.find_zero(805, 4096), None);
        assert_eq!(block.find_zero(0, 804), None);
        assert_eq!(block.free_count(), 1);
    }

    #[test]
    fn guard_marks_dirty_only_on_net_change() {
        let journal = Arc::new(MemJournal::new(4096));
        let block = BitmapBlock::from_image(BitmapIndex(0), BlockNumber(1), &[0_u8; 512]);
        let txn = journal.begin().unwrap();
        {
            let mut guard = block.prepare(journal.as_ref(), &txn).unwrap();
            guard.set(10).unwrap();
            guard.clear(10).unwrap();
            assert!(!guard.is_modified());
        }
        assert!(journal.dirty_buffers(&txn).is_empty());
        assert!(journal.prepared_buffers(&txn).is_empty());
        {
            let mut guard = block.prepare(journal.as_ref(), &txn).unwrap();
            guard.set(11).unwrap();
            assert!(matches!(guard.set(11), Err(RfsError::AlreadySet { block: 11 })));
            assert!(matches!(guard.clear(12), Err(RfsError::AlreadyClear { block: 12 })));
        }
        assert_eq!(journal.dirty_buffers(&txn).len(), 1);
        assert_eq!(block.free_count(), 4095);
        assert!(block.test(11).unwrap());
    }

    #[test]
    fn prepare_fails_when_journal_aborted() {
        let journal = Arc::new(MemJournal::new(4096));
        let block = BitmapBlock::from_image(BitmapIndex(0), BlockNumber(1), &[0_u8; 512]);
        let txn = journal.begin().unwrap();
        journal.abort("test");
        assert!(matches!(
            block.prepare(journal.as_ref(), &txn),
            Err(RfsError::JournalUnavailable(_))
        ));
    }

    #[test]
    fn mount_rejects_free_reserved_bit() {
        let geometry = small_geometry();
        let mut images = format_bitmaps(&geometry);
        images[1][0] = 0;
        let err = BitmapArray::from_images(geometry, &images, Arc::new(MemJournal::new(4096)))
            .unwrap_err();
        assert!(matches!(err, RfsError::Corruption { block: 4096, .. }));
    }

    #[test]
    fn mount_rejects_wrong_image_count_and_size() {
        let geometry = small_geometry();
        let journal: Arc<dyn Journal> = Arc::new(MemJournal::new(4096));
        let mut images = format_bitmaps(&geometry);
        images.pop();
        assert!(BitmapArray::from_images(geometry, &images, Arc::clone(&journal)).is_err());
        let mut images = format_bitmaps(&geometry);
        images[0].truncate(100);
        assert!(matches!(
            BitmapArray::from_images(geometry, &images, journal),
            Err(RfsError::Corruption { .. })
        ));
    }

    #[test]
    fn release_rejects_reserved_blocks() {
        let journal = Arc::new(MemJournal::new(4096));
        let array = fresh(Arc::clone(&journal));
        let txn = journal.begin().unwrap();
        assert!(matches!(
            array.release(&txn, BlockNumber(0), ReleaseMode::Journaled),
            Err(RfsError::OutOfRange { .. })
        ));
        assert!(matches!(
            array.release(&txn, BlockNumber(1), ReleaseMode::Journaled),
            Err(RfsError::Corruption { .. })
        ));
        assert!(matches!(
            array.release(&txn, BlockNumber(4096), ReleaseMode::Journaled),
            Err(RfsError::Corruption { .. })
        ));
        assert!(matches!(
            array.release(&txn, BlockNumber(10_000), ReleaseMode::Journaled),
            Err(RfsError::OutOfRange { .. })
        ));
    }

    #[test]
    fn release_of_free_block_changes_nothing() {
        let journal = Arc::new(MemJournal::new(4096));
        let array = fresh(Arc::clone(&journal));
        let before = array.space().free_blocks();
        let txn = journal.begin().unwrap();
        assert!(matches!(
            array.release(&txn, BlockNumber(20), ReleaseMode::Journaled),
            Err(RfsError::AlreadyClear { block: 20 })
        ));
        assert_eq!(array.space().free_blocks(), before);
        assert_eq!(journal.pending_free_count(), 0);
        assert!(journal.prepared_buffers(&txn).is_empty());
        array.check_consistency().unwrap();
    }

    #[test]
    fn consistency_check_detects_counter_drift() {
        let journal = Arc::new(MemJournal::new(4096));
        let array = fresh(Arc::clone(&journal));
        array.check_consistency().unwrap();
        let txn = journal.begin().unwrap();
        array.space().take(journal.as_ref(), &txn, 1).unwrap();
        assert!(matches!(
            array.check_consistency(),
            Err(RfsError::Corruption { .. })
        ));
    }
}
