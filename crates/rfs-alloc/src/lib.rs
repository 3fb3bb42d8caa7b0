#![forbid(unsafe_code)]
//! Journaled bitmap block allocator.
//!
//! Hands out and takes back disk blocks for a journaling filesystem whose
//! free space is tracked by on-disk bitmap blocks, one bit per block. Every
//! change goes through a [`Journal`] transaction so a crash never leaves a
//! bitmap, the free counter and the journal out of step.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap** ([`bitmap`]): lock-free bit reads, a per-block mutation
//!    window bracketed by the journal, and the filesystem free counter.
//! 2. **Policy** ([`policy`]): an ordered list of placement stages that turn
//!    an [`AllocationHint`] into a search window.
//! 3. **Scanner** ([`scan`]): finds and claims one window inside one bitmap,
//!    coping with bits stolen by concurrent allocators.
//! 4. **Region** ([`region`]): multi-pass sweep across bitmaps with quota,
//!    skip-busy filtering, big-allocation mode and rollback.
//! 5. **Allocator** (this module): preallocation reuse, reservations,
//!    frees and mount.
//!
//! There is no global lock. Bitmaps are mutated under their own mutex only;
//! the free and reserved counters each sit behind their own lock.

pub mod bitmap;
pub mod geometry;
pub mod hash;
pub mod options;
pub mod policy;
pub mod prealloc;
pub mod quota;
pub mod region;
pub mod scan;
pub mod space;
pub mod stats;

pub use bitmap::{BitmapArray, BitmapBlock, BitmapMut, ReleaseMode, format_bitmaps};
pub use geometry::{DEFAULT_FIRST_BITMAP_BLOCK, Geometry};
pub use options::AllocOptions;
pub use policy::{
    AllocationHint, IndirectItem, InodeRef, LeftNeighbor, SearchWindow, choose_packing,
    determine_search_start,
};
pub use prealloc::{PreallocationEntry, PreallocationList};
pub use quota::{MemQuota, QuotaService, QuotaUsage};
pub use stats::{AllocatorStats, StatsSnapshot};

use region::RegionScanner;
use rfs_block::BlockDevice;
use rfs_error::{Result, RfsError};
use rfs_journal::{Journal, Transaction};
use rfs_types::{BitmapIndex, BlockNumber, InodeNumber, ObjectKey};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ── Format ──────────────────────────────────────────────────────────────────

/// Write the bitmaps of a freshly formatted filesystem to `device`.
pub fn write_fresh_bitmaps(device: &dyn BlockDevice, geometry: &Geometry) -> Result<()> {
    check_device(device, geometry)?;
    for (i, image) in (0_u32..).zip(format_bitmaps(geometry)) {
        device.write_block(geometry.bitmap_location(BitmapIndex(i)), &image)?;
    }
    device.sync()?;
    info!(
        target: "rfs::alloc",
        event = "format",
        block_count = geometry.block_count(),
        bitmaps = geometry.bitmap_count()
    );
    Ok(())
}

fn check_device(device: &dyn BlockDevice, geometry: &Geometry) -> Result<()> {
    if device.block_size() != geometry.block_size().get() {
        return Err(RfsError::InvalidGeometry(format!(
            "device block size {} does not match geometry block size {}",
            device.block_size(),
            geometry.block_size().get()
        )));
    }
    if device.block_count() < geometry.block_count() {
        return Err(RfsError::InvalidGeometry(format!(
            "device has {} blocks, geometry needs {}",
            device.block_count(),
            geometry.block_count()
        )));
    }
    Ok(())
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Mounted allocator for one filesystem.
pub struct Allocator {
    map: BitmapArray,
    options: AllocOptions,
    prealloc: PreallocationList,
    quota: Arc<dyn QuotaService>,
    stats: AllocatorStats,
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("map", &self.map)
            .field("options", &self.options.to_string())
            .field("preallocations", &self.prealloc.len())
            .finish_non_exhaustive()
    }
}

impl Allocator {
    /// Load every bitmap of `geometry` from `device`.
    pub fn mount(
        device: &dyn BlockDevice,
        geometry: Geometry,
        options: AllocOptions,
        journal: Arc<dyn Journal>,
        quota: Arc<dyn QuotaService>,
    ) -> Result<Self> {
        check_device(device, &geometry)?;
        let images = (0..geometry.bitmap_count())
            .map(|i| {
                device
                    .read_block(geometry.bitmap_location(BitmapIndex(i)))
                    .map(rfs_block::BlockBuf::into_inner)
            })
            .collect::<Result<Vec<_>>>()?;
        let allocator = Self::from_images(geometry, &images, options, journal, quota)?;
        info!(
            target: "rfs::alloc",
            event = "mount",
            block_count = geometry.block_count(),
            bitmaps = geometry.bitmap_count(),
            free = allocator.free_blocks(),
            options = %allocator.options
        );
        Ok(allocator)
    }

    /// Build from bitmap images already in memory.
    pub fn from_images(
        geometry: Geometry,
        images: &[Vec<u8>],
        options: AllocOptions,
        journal: Arc<dyn Journal>,
        quota: Arc<dyn QuotaService>,
    ) -> Result<Self> {
        Ok(Self {
            map: BitmapArray::from_images(geometry, images, journal)?,
            options,
            prealloc: PreallocationList::new(),
            quota,
            stats: AllocatorStats::default(),
        })
    }

    /// Allocator over a freshly formatted, purely in-memory filesystem.
    pub fn new_formatted(
        geometry: Geometry,
        options: AllocOptions,
        journal: Arc<dyn Journal>,
        quota: Arc<dyn QuotaService>,
    ) -> Result<Self> {
        Self::from_images(geometry, &format_bitmaps(&geometry), options, journal, quota)
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Allocate `amount` blocks for `hint` inside `txn`.
    ///
    /// Blocks come back in discovery order: first any left in the inode's
    /// preallocation, then whatever the region scan finds. On error nothing
    /// stays allocated.
    pub fn allocate_blocks(
        &self,
        txn: &Transaction,
        hint: &AllocationHint,
        amount: u32,
    ) -> Result<Vec<BlockNumber>> {
        self.allocate_blocks_with_reservation(txn, hint, amount, 0)
    }

    /// [`Self::allocate_blocks`] for a caller that holds `reserved_by_us`
    /// blocks from [`Self::reserve_blocks_for_later`].
    pub fn allocate_blocks_with_reservation(
        &self,
        txn: &Transaction,
        hint: &AllocationHint,
        amount: u32,
        reserved_by_us: u64,
    ) -> Result<Vec<BlockNumber>> {
        if amount == 0 {
            return Ok(Vec::new());
        }
        self.map
            .space()
            .ensure_available(u64::from(amount), reserved_by_us)?;

        let inode = hint.inode.as_ref().map(|inode| inode.number);
        let mut out = match inode {
            Some(inode) if !hint.formatted_node && hint.preallocate => {
                self.prealloc.try_satisfy(inode, amount)
            }
            _ => Vec::new(),
        };
        let drained = out.len();
        stats::add(&self.stats.prealloc_hits, drained as u64);
        // try_satisfy never returns more than `amount`.
        let rest = amount - u32::try_from(drained).unwrap_or(amount);

        if rest > 0 {
            let cursor = inode
                .and_then(|inode| self.prealloc.cursor(inode))
                .or_else(|| out.last().and_then(|block| block.checked_add(1)));
            let geometry = self.map.geometry();
            let mut window = determine_search_start(hint, geometry, &self.options, cursor);
            let last = geometry.block_count() - 1;
            if window.search_start.0 > last {
                window.search_start = BlockNumber(last);
            }
            let scanner = RegionScanner::new(
                &self.map,
                &self.options,
                &self.prealloc,
                self.quota.as_ref(),
                &self.stats,
            );
            if let Err(err) = scanner.allocate_range(txn, hint, window, &mut out, rest) {
                if let Some(inode) = inode {
                    for &block in &out[..drained] {
                        self.release_unused(txn, inode, block).unwrap_or_else(|release_err| {
                            warn!(
                                target: "rfs::alloc",
                                event = "prealloc_return_failed",
                                block = block.0,
                                error = %release_err
                            );
                        });
                    }
                }
                return Err(err);
            }
        }

        stats::add(&self.stats.allocated, u64::from(amount));
        debug!(
            target: "rfs::alloc",
            event = "allocate",
            txn = %txn.id(),
            amount,
            from_prealloc = drained,
            first = out.first().map_or(0, |block| block.0),
            formatted = hint.formatted_node
        );
        Ok(out)
    }

    // ── Freeing ─────────────────────────────────────────────────────────

    /// Free `block` inside `txn`.
    ///
    /// The block stays unavailable to data allocations until `txn` commits.
    /// Freeing a block that is already free fails with `AlreadyClear` and
    /// changes nothing.
    pub fn free_block(
        &self,
        txn: &Transaction,
        block: BlockNumber,
        inode: Option<InodeNumber>,
        charge_quota: bool,
    ) -> Result<()> {
        if let Err(err) = self.map.release(txn, block, ReleaseMode::Journaled) {
            if matches!(err, RfsError::AlreadyClear { .. }) {
                warn!(
                    target: "rfs::alloc",
                    event = "double_free",
                    txn = %txn.id(),
                    block = block.0
                );
            }
            return Err(err);
        }
        if charge_quota {
            if let Some(inode) = inode {
                self.quota.credit(inode, 1);
            }
        }
        stats::bump(&self.stats.freed);
        debug!(target: "rfs::alloc", event = "free", txn = %txn.id(), block = block.0);
        Ok(())
    }

    /// Return a preallocated block that was never exposed to the file.
    fn release_unused(&self, txn: &Transaction, inode: InodeNumber, block: BlockNumber) -> Result<()> {
        self.map.release(txn, block, ReleaseMode::Immediate)?;
        self.quota.credit(inode, 1);
        Ok(())
    }

    /// Give back the rest of `inode`'s preallocation (file close, truncate).
    pub fn discard_preallocation(&self, txn: &Transaction, inode: InodeNumber) -> Result<u32> {
        let released = self
            .prealloc
            .discard(inode, |inode, block| self.release_unused(txn, inode, block))?;
        stats::add(&self.stats.prealloc_discarded, u64::from(released));
        Ok(released)
    }

    /// Give back every preallocation (unmount, remount read-only).
    pub fn discard_all_preallocations(&self, txn: &Transaction) -> Result<u32> {
        let released = self
            .prealloc
            .discard_all(|inode, block| self.release_unused(txn, inode, block))?;
        stats::add(&self.stats.prealloc_discarded, u64::from(released));
        debug!(target: "rfs::alloc", event = "discard_all", released);
        Ok(released)
    }

    // ── Reservations ────────────────────────────────────────────────────

    /// Set `count` blocks aside for a later allocation.
    pub fn reserve_blocks_for_later(&self, count: u64) -> Result<()> {
        self.map.space().reserve_for_later(count)
    }

    pub fn release_reservation(&self, count: u64) {
        self.map.space().release_reservation(count);
    }

    /// How many pages of `page_size` bytes still fit in free, unreserved
    /// space.
    #[must_use]
    pub fn can_fit_pages(&self, page_size: u32) -> u64 {
        let blocks_per_page = (page_size / self.map.geometry().block_size().get()).max(1);
        self.map.space().available() / u64::from(blocks_per_page)
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Packing locality for a new directory created in `dir`.
    #[must_use]
    pub fn choose_packing(&self, dir: ObjectKey) -> u32 {
        choose_packing(dir, &self.options, self.map.geometry(), |bm| {
            self.map
                .bitmap(BitmapIndex(bm))
                .map_or(0, BitmapBlock::free_count)
        })
    }

    /// Verify cached free counts against the bitmaps.
    pub fn check_consistency(&self) -> Result<()> {
        self.map.check_consistency()
    }

    pub fn is_block_in_use(&self, block: BlockNumber) -> Result<bool> {
        self.map.is_in_use(block)
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.map.space().free_blocks()
    }

    #[must_use]
    pub fn reserved_blocks(&self) -> u64 {
        self.map.space().reserved_blocks()
    }

    #[must_use]
    pub fn bitmap_free_counts(&self) -> Vec<u32> {
        self.map.iter().map(BitmapBlock::free_count).collect()
    }

    #[must_use]
    pub fn preallocation(&self, inode: InodeNumber) -> Option<PreallocationEntry> {
        self.prealloc.entry(inode)
    }

    #[must_use]
    pub fn geometry(&self) -> &Geometry {
        self.map.geometry()
    }

    #[must_use]
    pub fn options(&self) -> &AllocOptions {
        &self.options
    }

    #[must_use]
    pub fn journal(&self) -> &dyn Journal {
        self.map.journal()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfs_block::MemBlockDevice;
    use rfs_journal::MemJournal;
    use rfs_types::BlockSize;

    fn geometry(block_size: u32, block_count: u64) -> Geometry {
        Geometry::new(BlockSize::new(block_size).unwrap(), block_count).unwrap()
    }

    /// Options with every placement heuristic off.
    fn plain() -> AllocOptions {
        AllocOptions::parse("preallocsize=17").unwrap()
    }

    fn allocator_with(
        geometry: Geometry,
        options: AllocOptions,
    ) -> (Arc<MemJournal>, Arc<MemQuota>, Allocator) {
        let journal = Arc::new(MemJournal::new(geometry.bits_per_bitmap()));
        let quota = Arc::new(MemQuota::new());
        let alloc =
            Allocator::new_formatted(geometry, options, journal.clone(), quota.clone()).unwrap();
        (journal, quota, alloc)
    }

    fn allocator(geometry: Geometry) -> (Arc<MemJournal>, Allocator) {
        let (journal, _, alloc) = allocator_with(geometry, plain());
        (journal, alloc)
    }

    fn file(number: u64) -> AllocationHint {
        AllocationHint::unformatted(
            InodeRef::regular(InodeNumber(number), ObjectKey::new(2, 3), 0),
            1,
        )
    }

    #[test]
    fn zero_amount_is_empty() {
        let (journal, alloc) = allocator(geometry(4096, 100));
        let txn = journal.begin().unwrap();
        assert!(alloc.allocate_blocks(&txn, &file(9), 0).unwrap().is_empty());
        assert!(journal.dirty_buffers(&txn).is_empty());
    }

    #[test]
    fn reservations_limit_visible_space() {
        let (journal, alloc) = allocator(geometry(4096, 100));
        // 98 free blocks.
        alloc.reserve_blocks_for_later(95).unwrap();
        let txn = journal.begin().unwrap();
        let hint = AllocationHint::formatted(ObjectKey::new(1, 2));
        assert!(matches!(
            alloc.allocate_blocks(&txn, &hint, 4),
            Err(RfsError::NoSpace)
        ));
        let got = alloc
            .allocate_blocks_with_reservation(&txn, &hint, 4, 95)
            .unwrap();
        assert_eq!(got.len(), 4);
        alloc.release_reservation(95);
        assert_eq!(alloc.reserved_blocks(), 0);
    }

    #[test]
    fn can_fit_pages_divides_by_blocks_per_page() {
        let (_, alloc) = allocator(geometry(1024, 1000));
        // 1000 - block 0 - bitmap block = 998 free.
        assert_eq!(alloc.can_fit_pages(4096), 998 / 4);
        assert_eq!(alloc.can_fit_pages(512), 998);
        alloc.reserve_blocks_for_later(98).unwrap();
        assert_eq!(alloc.can_fit_pages(4096), 225);
    }

    #[test]
    fn preallocation_is_reused_then_discarded() {
        let (journal, alloc) = allocator(geometry(4096, 1000));
        let hint = file(9).with_preallocation();
        let txn = journal.begin().unwrap();
        let first = alloc.allocate_blocks(&txn, &hint, 1).unwrap();
        assert_eq!(first, vec![BlockNumber(2)]);
        let entry = alloc.preallocation(InodeNumber(9)).unwrap();
        assert_eq!((entry.start, entry.count), (BlockNumber(3), 16));

        let next = alloc.allocate_blocks(&txn, &hint, 3).unwrap();
        assert_eq!(next, vec![BlockNumber(3), BlockNumber(4), BlockNumber(5)]);
        assert_eq!(alloc.stats().prealloc_hits, 3);

        let free_before = alloc.free_blocks();
        assert_eq!(alloc.discard_preallocation(&txn, InodeNumber(9)).unwrap(), 13);
        assert_eq!(alloc.free_blocks(), free_before + 13);
        assert!(alloc.preallocation(InodeNumber(9)).is_none());
        // Unexposed blocks are reusable at once.
        assert_eq!(journal.pending_free_count(), 0);
        alloc.check_consistency().unwrap();
    }

    #[test]
    fn failed_request_returns_drained_preallocation() {
        let (journal, quota, alloc) = allocator_with(geometry(4096, 40), plain());
        let hint = file(9).with_preallocation();
        let txn = journal.begin().unwrap();
        assert_eq!(alloc.allocate_blocks(&txn, &hint, 1).unwrap(), vec![BlockNumber(2)]);
        // 38 free - 17 taken, 16 of them parked for inode 9.
        assert_eq!(alloc.free_blocks(), 21);
        assert_eq!(quota.usage(InodeNumber(9)).used, 17);

        assert!(matches!(
            alloc.allocate_blocks(&txn, &hint, 30),
            Err(RfsError::NoSpace)
        ));
        assert_eq!(alloc.preallocation(InodeNumber(9)).map(|e| e.count), Some(16));

        // Draining succeeds but the remaining 4 blocks exceed the quota.
        quota.set_limit(InodeNumber(9), 17);
        assert!(matches!(
            alloc.allocate_blocks(&txn, &hint, 20),
            Err(RfsError::QuotaExceeded { inode: 9 })
        ));
        assert_eq!(alloc.free_blocks(), 37);
        assert!(alloc.preallocation(InodeNumber(9)).is_none());
        let usage = quota.usage(InodeNumber(9));
        assert_eq!((usage.used, usage.reserved), (1, 0));
        alloc.check_consistency().unwrap();
    }

    #[test]
    fn double_free_changes_nothing() {
        let (journal, alloc) = allocator(geometry(4096, 100));
        let txn = journal.begin().unwrap();
        let free = alloc.free_blocks();
        assert!(matches!(
            alloc.free_block(&txn, BlockNumber(50), None, false),
            Err(RfsError::AlreadyClear { block: 50 })
        ));
        assert_eq!(alloc.free_blocks(), free);
        assert_eq!(alloc.stats().freed, 0);
    }

    #[test]
    fn mount_reads_bitmaps_from_device() {
        let g = geometry(512, 10_000);
        let device = MemBlockDevice::new(512, 10_000);
        write_fresh_bitmaps(&device, &g).unwrap();
        let journal = Arc::new(MemJournal::new(g.bits_per_bitmap()));
        let alloc = Allocator::mount(
            &device,
            g,
            AllocOptions::default(),
            journal,
            Arc::new(MemQuota::new()),
        )
        .unwrap();
        // Block 0, bitmap 0 at block 1, and bitmaps at 4096 and 8192.
        assert_eq!(alloc.free_blocks(), 10_000 - 4);
        assert_eq!(alloc.bitmap_free_counts(), vec![4094, 4095, 1807]);
        assert!(alloc.is_block_in_use(BlockNumber(4096)).unwrap());
    }

    #[test]
    fn mount_rejects_mismatched_device() {
        let g = geometry(512, 10_000);
        let quota: Arc<dyn QuotaService> = Arc::new(MemQuota::new());
        let journal: Arc<dyn Journal> = Arc::new(MemJournal::new(4096));
        let small = MemBlockDevice::new(512, 9_000);
        assert!(matches!(
            Allocator::mount(&small, g, AllocOptions::default(), journal.clone(), quota.clone()),
            Err(RfsError::InvalidGeometry(_))
        ));
        let other_size = MemBlockDevice::new(1024, 10_000);
        assert!(matches!(
            Allocator::mount(&other_size, g, AllocOptions::default(), journal, quota),
            Err(RfsError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn packing_follows_parent_while_roomy() {
        let (_, _, alloc) = allocator_with(geometry(4096, 100_000), AllocOptions::default());
        assert_eq!(alloc.choose_packing(ObjectKey::new(5, 9)), 5);
        assert_eq!(alloc.choose_packing(ObjectKey::new(1, 9)), 9);
    }
}
