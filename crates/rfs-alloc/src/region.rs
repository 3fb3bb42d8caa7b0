//! Multi-pass search across the whole device.
//!
//! A request is satisfied from up to three ranges: the block at
//! `search_start` to the end of the device, then `beg` up to `search_start`,
//! then the start of the device up to `beg`. Each range is swept bitmap by
//! bitmap through [`BitmapBlockScanner`]. Quota is reserved before any bit
//! is touched, and a request that cannot be satisfied in full undoes every
//! window it claimed.

use crate::bitmap::{BitmapArray, ReleaseMode};
use crate::options::AllocOptions;
use crate::policy::{AllocationHint, SearchWindow};
use crate::prealloc::{PreallocationList, preallocation_size};
use crate::quota::QuotaService;
use crate::scan::{BitmapBlockScanner, ScanOutcome, ScanRequest};
use crate::stats::{self, AllocatorStats};
use rfs_error::{Result, RfsError};
use rfs_journal::Transaction;
use rfs_types::{BitmapIndex, BlockNumber, InodeNumber};
use tracing::{debug, trace, warn};

pub struct RegionScanner<'a> {
    map: &'a BitmapArray,
    options: &'a AllocOptions,
    prealloc: &'a PreallocationList,
    quota: &'a dyn QuotaService,
    stats: &'a AllocatorStats,
}

/// One accepted window, in absolute block numbers.
#[derive(Debug, Clone, Copy)]
struct Window {
    start: BlockNumber,
    len: u32,
}

/// Mutable state of one `allocate_range` call.
struct Progress<'h> {
    hint: &'h AllocationHint,
    /// Blocks still needed.
    rest: u32,
    /// Extra blocks a window may carry for preallocation.
    prealloc_size: u32,
    /// Surplus blocks parked for the inode by this call.
    surplus: u32,
}

impl Progress<'_> {
    fn unformatted(&self) -> bool {
        !self.hint.formatted_node
    }
}

impl<'a> RegionScanner<'a> {
    #[must_use]
    pub fn new(
        map: &'a BitmapArray,
        options: &'a AllocOptions,
        prealloc: &'a PreallocationList,
        quota: &'a dyn QuotaService,
        stats: &'a AllocatorStats,
    ) -> Self {
        Self {
            map,
            options,
            prealloc,
            quota,
            stats,
        }
    }

    /// Claim `amount_needed` blocks for `hint`, appending them to `out` in
    /// discovery order.
    ///
    /// Either every block is found and `amount_needed` is returned, or the
    /// call fails and `out` is left as it was.
    pub fn allocate_range(
        &self,
        txn: &Transaction,
        hint: &AllocationHint,
        window: SearchWindow,
        out: &mut Vec<BlockNumber>,
        amount_needed: u32,
    ) -> Result<usize> {
        if amount_needed == 0 {
            return Ok(0);
        }
        let charged = hint.charged_inode();
        let mut prealloc_size =
            preallocation_size(hint, self.options, self.map.geometry().block_size().get());
        if let Some(inode) = charged {
            self.quota.reserve(inode, u64::from(amount_needed))?;
            if prealloc_size > 0 && self.quota.reserve(inode, u64::from(prealloc_size)).is_err() {
                trace!(
                    target: "rfs::alloc",
                    event = "prealloc_quota_refused",
                    inode = inode.0,
                    blocks = prealloc_size
                );
                prealloc_size = 0;
            }
        }

        let first_new = out.len();
        let mut progress = Progress {
            hint,
            rest: amount_needed,
            prealloc_size,
            surplus: 0,
        };
        let outcome = self.search(txn, window, out, &mut progress);

        match outcome {
            Ok(()) => {
                if let Some(inode) = charged {
                    self.quota.charge_permanent(
                        inode,
                        u64::from(amount_needed) + u64::from(progress.surplus),
                    );
                    let unused = prealloc_size - progress.surplus;
                    if unused > 0 {
                        self.quota.release(inode, u64::from(unused));
                    }
                }
                debug!(
                    target: "rfs::alloc",
                    event = "range_allocated",
                    amount = amount_needed,
                    first = out.get(first_new).map_or(0, |block| block.0),
                    surplus = progress.surplus
                );
                Ok(amount_needed as usize)
            }
            Err(err) => {
                self.roll_back(txn, out, first_new);
                if let Some(inode) = charged {
                    self.quota
                        .release(inode, u64::from(amount_needed) + u64::from(prealloc_size));
                }
                debug!(
                    target: "rfs::alloc",
                    event = "range_failed",
                    amount = amount_needed,
                    error = %err
                );
                Err(err)
            }
        }
    }

    fn search(
        &self,
        txn: &Transaction,
        window: SearchWindow,
        out: &mut Vec<BlockNumber>,
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        let block_count = self.map.geometry().block_count();
        let start = window.search_start.0.min(block_count);
        let beg = window.beg.0.min(start);
        let passes = [(start, block_count), (beg, start), (0, beg)];

        if progress.unformatted() && progress.rest > 1 {
            for &(from, to) in &passes[..2] {
                self.pass(txn, from, to, true, out, progress)?;
                if progress.rest == 0 {
                    return Ok(());
                }
            }
        }
        for &(from, to) in &passes {
            self.pass(txn, from, to, false, out, progress)?;
            if progress.rest == 0 {
                return Ok(());
            }
        }
        Err(RfsError::NoSpace)
    }

    /// Sweep `[from, to)` until the request is satisfied or nothing fits.
    /// With `whole`, only a window holding every remaining block is accepted.
    fn pass(
        &self,
        txn: &Transaction,
        from: u64,
        to: u64,
        whole: bool,
        out: &mut Vec<BlockNumber>,
        progress: &mut Progress<'_>,
    ) -> Result<()> {
        let mut cursor = from;
        while progress.rest > 0 && cursor < to {
            let min = if whole {
                progress.rest
            } else {
                progress.hint.min_window.clamp(1, progress.rest)
            };
            let max = progress.rest.saturating_add(progress.prealloc_size);
            let Some(found) = self.scan_range(txn, cursor, to, min, max, progress)? else {
                break;
            };
            let take = found.len.min(progress.rest);
            out.extend((0..u64::from(take)).map(|i| BlockNumber(found.start.0 + i)));
            progress.rest -= take;
            if found.len > take {
                self.park_surplus(
                    txn,
                    progress,
                    BlockNumber(found.start.0 + u64::from(take)),
                    found.len - take,
                )?;
                break;
            }
            cursor = found.start.0 + u64::from(found.len);
        }
        Ok(())
    }

    fn park_surplus(
        &self,
        txn: &Transaction,
        progress: &mut Progress<'_>,
        start: BlockNumber,
        count: u32,
    ) -> Result<()> {
        let Some(inode) = progress.hint.inode.as_ref().map(|inode| inode.number) else {
            // Only requests with an owning inode carry a surplus.
            return Err(RfsError::Corruption {
                block: start.0,
                detail: "window surplus without an owning inode".to_owned(),
            });
        };
        progress.surplus = count;
        progress.prealloc_size = 0;
        if let Some(old) = self.prealloc.install(inode, start, count) {
            self.free_replaced(txn, inode, old.start, old.count);
        }
        Ok(())
    }

    /// Hand back an entry displaced by a fresh preallocation.
    fn free_replaced(&self, txn: &Transaction, inode: InodeNumber, start: BlockNumber, count: u32) {
        let mut released = 0_u64;
        for i in 0..u64::from(count) {
            let block = BlockNumber(start.0 + i);
            match self.map.release(txn, block, ReleaseMode::Immediate) {
                Ok(()) => released += 1,
                Err(err) => warn!(
                    target: "rfs::alloc",
                    event = "prealloc_release_failed",
                    inode = inode.0,
                    block = block.0,
                    error = %err
                ),
            }
        }
        self.quota.credit(inode, released);
        stats::add(&self.stats.prealloc_discarded, released);
    }

    /// Sweep the bitmaps covering `[from, to)` for one window.
    fn scan_range(
        &self,
        txn: &Transaction,
        from: u64,
        to: u64,
        min: u32,
        max: u32,
        progress: &Progress<'_>,
    ) -> Result<Option<Window>> {
        stats::bump(&self.stats.scan_calls);
        let space = self.map.space();
        let free = space.free_blocks();
        if free == 0 {
            return Ok(None);
        }
        let geometry = self.map.geometry();
        let (first_bm, first_off) = geometry.split(from);
        let (last_bm, last_off) = geometry.split(to);
        let bits = geometry.bits_per_bitmap();
        let unformatted = progress.unformatted();

        let skip_busy = self.options.skip_busy
            && u128::from(free) * 100
                > u128::from(geometry.block_count())
                    * u128::from(self.options.skip_busy_device_free_percent);
        let sweeps: &[bool] = if skip_busy { &[true, false] } else { &[false] };

        let scanner = BitmapBlockScanner::new(self.map, self.stats, self.options.stolen_retry_budget);
        for &busy_sweep in sweeps {
            for i in first_bm.0..=last_bm.0 {
                let index = BitmapIndex(i);
                let start = if i == first_bm.0 { first_off } else { 0 };
                let region_end = if i == last_bm.0 { last_off } else { bits };
                if start >= region_end {
                    continue;
                }
                if busy_sweep && !self.worth_scanning(index, start, progress)? {
                    trace!(
                        target: "rfs::alloc",
                        event = "busy_bitmap_skipped",
                        bitmap = i
                    );
                    continue;
                }
                let request = ScanRequest {
                    start,
                    region_end,
                    min,
                    max,
                    consult_journal: unformatted,
                };
                if let ScanOutcome::Found { start, len } = scanner.scan(txn, index, request)? {
                    return Ok(Some(Window {
                        start: geometry.block_at(index, start),
                        len,
                    }));
                }
            }
        }
        Ok(None)
    }

    /// First-sweep filter: a bitmap is scanned when the sweep starts inside
    /// it for a tree node or a non-first file block, or when it has more than
    /// `busy_bitmap_free_percent` of its bits free.
    fn worth_scanning(&self, index: BitmapIndex, start: u32, progress: &Progress<'_>) -> Result<bool> {
        if start != 0 && (!progress.unformatted() || progress.hint.file_block != 0) {
            return Ok(true);
        }
        let bitmap = self.map.bitmap(index)?;
        Ok(u64::from(bitmap.free_count()) * 100
            > u64::from(bitmap.bits_per_bitmap()) * self.options.busy_bitmap_free_percent)
    }

    /// Release the blocks this call appended to `out` and truncate it.
    fn roll_back(&self, txn: &Transaction, out: &mut Vec<BlockNumber>, first_new: usize) {
        for &block in &out[first_new..] {
            if let Err(err) = self.map.release(txn, block, ReleaseMode::Immediate) {
                warn!(
                    target: "rfs::alloc",
                    event = "rollback_release_failed",
                    block = block.0,
                    error = %err
                );
            }
        }
        out.truncate(first_new);
    }
}
