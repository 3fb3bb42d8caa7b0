//! Window search inside one bitmap block.
//!
//! The search itself reads bits without a lock. Only once a candidate window
//! is found does the scanner open the block's mutation window and set the
//! bits one by one. Another allocator may have claimed some of them in the
//! meantime (a "stolen" bit); the scanner then either accepts the shorter
//! prefix or undoes its own bits and starts over, within a retry budget.

use crate::bitmap::{BitmapArray, BitmapBlock};
use crate::stats::{self, AllocatorStats};
use rfs_error::{Result, RfsError};
use rfs_journal::{PendingHint, Transaction};
use rfs_types::BitmapIndex;
use tracing::{debug, trace, warn};

/// Result of one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Bits `start .. start + len` were claimed.
    Found { start: u32, len: u32 },
    NotFound,
}

/// Result of trying to set every bit of a candidate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The whole window was claimed.
    Accepted { len: u32 },
    /// A bit was stolen after at least `min` bits were claimed; the window
    /// was cut there.
    ShrunkAccepted { len: u32 },
    /// A bit was stolen too early; nothing was claimed.
    Stolen,
}

/// Search parameters for [`BitmapBlockScanner::scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanRequest {
    pub start: u32,
    /// Exclusive end of the searched bit range.
    pub region_end: u32,
    pub min: u32,
    pub max: u32,
    /// Skip bits the journal still depends on (data allocations only).
    pub consult_journal: bool,
}

pub struct BitmapBlockScanner<'a> {
    map: &'a BitmapArray,
    stats: &'a AllocatorStats,
    retry_budget: u32,
}

impl<'a> BitmapBlockScanner<'a> {
    #[must_use]
    pub fn new(map: &'a BitmapArray, stats: &'a AllocatorStats, retry_budget: u32) -> Self {
        Self {
            map,
            stats,
            retry_budget,
        }
    }

    fn pending(&self, index: BitmapIndex, bit: u32) -> Option<PendingHint> {
        let hint = self.map.journal().is_block_pending(index, bit)?;
        match hint {
            PendingHint::ResumeAt(_) => stats::bump(&self.stats.in_journal_hint),
            PendingHint::AdvanceOne => stats::bump(&self.stats.in_journal_nohint),
        }
        trace!(
            target: "rfs::alloc",
            event = "journal_collision",
            bitmap = index.0,
            bit,
            hint = ?hint
        );
        Some(hint)
    }

    /// Find and claim a window of `min..=max` free bits in bitmap `index`.
    ///
    /// On `Found` the bits are set, the bitmap is dirty in `txn` and the
    /// filesystem free counter has been reduced by the window length.
    pub fn scan(
        &self,
        txn: &Transaction,
        index: BitmapIndex,
        request: ScanRequest,
    ) -> Result<ScanOutcome> {
        let bitmap = self.map.bitmap(index)?;
        let bits = bitmap.bits_per_bitmap();
        if request.region_end > bits {
            return Err(RfsError::OutOfRange {
                what: "bit",
                index: u64::from(request.region_end),
                limit: u64::from(bits),
            });
        }
        let min = request.min.max(1);
        let max = request.max.max(min);
        let region_end = request.region_end;
        stats::bump(&self.stats.bitmaps_scanned);

        let mut beg = request.start;
        let mut retries = 0_u32;
        loop {
            if bitmap.free_count() < min {
                return Ok(ScanOutcome::NotFound);
            }
            let Some(first) = bitmap.find_zero(beg, region_end) else {
                return Ok(ScanOutcome::NotFound);
            };
            beg = first;
            if u64::from(beg) + u64::from(min) > u64::from(region_end) {
                return Ok(ScanOutcome::NotFound);
            }
            if request.consult_journal {
                if let Some(hint) = self.pending(index, beg) {
                    beg = hint.resume_from(beg);
                    continue;
                }
            }

            let limit = beg.saturating_add(max).min(region_end);
            let mut end = beg + 1;
            let next = loop {
                if end >= limit || bitmap.test(end)? {
                    break end;
                }
                if request.consult_journal {
                    if let Some(hint) = self.pending(index, end) {
                        break hint.resume_from(end);
                    }
                }
                end += 1;
            };

            if end - beg < min {
                beg = next;
                continue;
            }

            match self.claim(txn, bitmap, beg, end, min)? {
                ClaimOutcome::Accepted { len } | ClaimOutcome::ShrunkAccepted { len } => {
                    debug!(
                        target: "rfs::alloc",
                        event = "window_claimed",
                        bitmap = index.0,
                        start = beg,
                        len
                    );
                    return Ok(ScanOutcome::Found { start: beg, len });
                }
                ClaimOutcome::Stolen => {
                    retries += 1;
                    stats::bump(&self.stats.retries);
                    if retries > self.retry_budget {
                        warn!(
                            target: "rfs::alloc",
                            event = "stolen_retry_exhausted",
                            bitmap = index.0,
                            retries = self.retry_budget
                        );
                        return Err(RfsError::ResourceExhausted {
                            bitmap: index.0,
                            retries: self.retry_budget,
                        });
                    }
                    beg = request.start;
                }
            }
        }
    }

    /// Set bits `beg..end` under the block's mutation window.
    pub fn claim(
        &self,
        txn: &Transaction,
        bitmap: &BitmapBlock,
        beg: u32,
        end: u32,
        min: u32,
    ) -> Result<ClaimOutcome> {
        let journal = self.map.journal();
        let space = self.map.space();
        let mut guard = bitmap.prepare(journal, txn)?;
        let mut claimed_end = end;
        for bit in beg..end {
            if guard.try_set(bit)? {
                continue;
            }
            stats::bump(&self.stats.stolen);
            trace!(
                target: "rfs::alloc",
                event = "bit_stolen",
                bitmap = bitmap.index().0,
                bit
            );
            if bit - beg >= min {
                claimed_end = bit;
                break;
            }
            for set in (beg..bit).rev() {
                guard.clear(set)?;
            }
            return Ok(ClaimOutcome::Stolen);
        }

        let len = claimed_end - beg;
        if let Err(err) = space.take(journal, txn, u64::from(len)) {
            for set in beg..claimed_end {
                guard.clear(set)?;
            }
            return Err(err);
        }
        drop(guard);

        Ok(if claimed_end == end {
            ClaimOutcome::Accepted { len }
        } else {
            ClaimOutcome::ShrunkAccepted { len }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::format_bitmaps;
    use crate::geometry::Geometry;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use rfs_journal::{Journal, JournalBuffer, MemJournal};
    use rfs_types::{BlockNumber, BlockSize};
    use std::sync::{Arc, OnceLock, Weak};

    struct Fixture {
        journal: Arc<MemJournal>,
        map: BitmapArray,
        stats: AllocatorStats,
    }

    impl Fixture {
        /// One 4096-bit bitmap whose image is `image`.
        fn with_image(image: Vec<u8>) -> Self {
            let geometry = Geometry::new(BlockSize::new(512).unwrap(), 4096).unwrap();
            let journal = Arc::new(MemJournal::new(4096));
            let map = BitmapArray::from_images(geometry, &[image], journal.clone()).unwrap();
            Self {
                journal,
                map,
                stats: AllocatorStats::default(),
            }
        }

        fn fresh() -> Self {
            let geometry = Geometry::new(BlockSize::new(512).unwrap(), 4096).unwrap();
            Self::with_image(format_bitmaps(&geometry).remove(0))
        }

        fn scanner(&self) -> BitmapBlockScanner<'_> {
            BitmapBlockScanner::new(&self.map, &self.stats, 4)
        }
    }

    fn request(start: u32, region_end: u32, min: u32, max: u32) -> ScanRequest {
        ScanRequest {
            start,
            region_end,
            min,
            max,
            consult_journal: true,
        }
    }

    #[test]
    fn finds_first_window_and_updates_counts() {
        let fx = Fixture::fresh();
        let txn = fx.journal.begin().unwrap();
        let before = fx.map.space().free_blocks();
        let outcome = fx
            .scanner()
            .scan(&txn, BitmapIndex(0), request(0, 4096, 1, 5))
            .unwrap();
        assert_eq!(outcome, ScanOutcome::Found { start: 2, len: 5 });
        let bitmap = fx.map.bitmap(BitmapIndex(0)).unwrap();
        assert_eq!(bitmap.free_count(), 4094 - 5);
        assert_eq!(fx.map.space().free_blocks(), before - 5);
        for bit in 2..7 {
            assert!(bitmap.test(bit).unwrap());
        }
        assert!(!bitmap.test(7).unwrap());
        assert_eq!(fx.journal.dirty_buffers(&txn).len(), 2);
        fx.map.check_consistency().unwrap();
    }

    #[test]
    fn window_smaller_than_min_is_skipped() {
        let mut image = vec![0xFF_u8; 512];
        // Free runs: bits 8..10 (2) and 16..24 (8).
        image[1] = 0b1111_1100;
        image[2] = 0x00;
        let fx = Fixture::with_image(image);
        let txn = fx.journal.begin().unwrap();
        let outcome = fx
            .scanner()
            .scan(&txn, BitmapIndex(0), request(0, 4096, 3, 6))
            .unwrap();
        assert_eq!(outcome, ScanOutcome::Found { start: 16, len: 6 });
    }

    #[test]
    fn region_end_bounds_the_window() {
        let fx = Fixture::fresh();
        let txn = fx.journal.begin().unwrap();
        let scanner = fx.scanner();
        assert_eq!(
            scanner.scan(&txn, BitmapIndex(0), request(100, 103, 4, 10)).unwrap(),
            ScanOutcome::NotFound
        );
        assert_eq!(
            scanner.scan(&txn, BitmapIndex(0), request(100, 103, 1, 10)).unwrap(),
            ScanOutcome::Found { start: 100, len: 3 }
        );
        assert!(matches!(
            scanner.scan(&txn, BitmapIndex(0), request(0, 4097, 1, 1)),
            Err(RfsError::OutOfRange { .. })
        ));
        assert!(matches!(
            scanner.scan(&txn, BitmapIndex(1), request(0, 10, 1, 1)),
            Err(RfsError::OutOfRange { what: "bitmap", .. })
        ));
    }

    #[test]
    fn free_count_below_min_short_circuits() {
        let mut image = vec![0xFF_u8; 512];
        image[10] = 0b1111_1000;
        let fx = Fixture::with_image(image);
        let txn = fx.journal.begin().unwrap();
        assert_eq!(
            fx.scanner()
                .scan(&txn, BitmapIndex(0), request(0, 4096, 4, 4))
                .unwrap(),
            ScanOutcome::NotFound
        );
        assert!(fx.journal.dirty_buffers(&txn).is_empty());
    }

    #[test]
    fn pending_blocks_are_skipped_for_data() {
        let fx = Fixture::fresh();
        let txn = fx.journal.begin().unwrap();
        for block in [2, 3, 6] {
            fx.journal.mark_freed(&txn, BlockNumber(block));
        }
        let scanner = fx.scanner();
        // 2 and 3 are pending: resume at 4; 6 is pending: window 4..6.
        assert_eq!(
            scanner.scan(&txn, BitmapIndex(0), request(0, 4096, 1, 8)).unwrap(),
            ScanOutcome::Found { start: 4, len: 2 }
        );
        // Tree nodes ignore the journal.
        let req = ScanRequest {
            consult_journal: false,
            ..request(0, 4096, 1, 2)
        };
        assert_eq!(
            scanner.scan(&txn, BitmapIndex(0), req).unwrap(),
            ScanOutcome::Found { start: 2, len: 2 }
        );
        let snap = fx.stats.snapshot();
        assert_eq!(snap.in_journal_hint, 2);
    }

    #[test]
    fn claim_shrinks_or_reports_stolen() {
        let fx = Fixture::fresh();
        let txn = fx.journal.begin().unwrap();
        let bitmap = fx.map.bitmap(BitmapIndex(0)).unwrap();
        {
            // Another allocator takes bit 13 behind our back.
            let mut guard = bitmap.prepare(fx.journal.as_ref(), &txn).unwrap();
            guard.set(13).unwrap();
        }
        let scanner = fx.scanner();
        assert_eq!(
            scanner.claim(&txn, bitmap, 10, 16, 2).unwrap(),
            ClaimOutcome::ShrunkAccepted { len: 3 }
        );
        {
            let mut guard = bitmap.prepare(fx.journal.as_ref(), &txn).unwrap();
            guard.set(21).unwrap();
        }
        let free_before = bitmap.free_count();
        assert_eq!(
            scanner.claim(&txn, bitmap, 20, 26, 3).unwrap(),
            ClaimOutcome::Stolen
        );
        assert_eq!(bitmap.free_count(), free_before);
        assert!(!bitmap.test(20).unwrap());
        assert_eq!(
            scanner.claim(&txn, bitmap, 30, 33, 3).unwrap(),
            ClaimOutcome::Accepted { len: 3 }
        );
        assert_eq!(fx.stats.snapshot().stolen, 2);
    }

    #[test]
    fn journal_failure_before_claim_leaves_bits_clear() {
        let fx = Fixture::fresh();
        let txn = fx.journal.begin().unwrap();
        fx.journal.abort("test");
        let result = fx
            .scanner()
            .scan(&txn, BitmapIndex(0), request(0, 4096, 1, 4));
        assert!(matches!(result, Err(RfsError::JournalUnavailable(_))));
        let bitmap = fx.map.bitmap(BitmapIndex(0)).unwrap();
        assert!(!bitmap.test(2).unwrap());
        assert_eq!(bitmap.free_count(), 4094);
    }

    /// Journal through which a competing allocator grabs queued bits the
    /// moment a bitmap's mutation window opens, after the lock-free search
    /// has already chosen its window.
    struct RacingJournal {
        inner: MemJournal,
        map: OnceLock<Weak<BitmapArray>>,
        steals: Mutex<Vec<u32>>,
    }

    impl Journal for RacingJournal {
        fn begin(&self) -> Result<Transaction> {
            self.inner.begin()
        }

        fn commit(&self, txn: Transaction) -> Result<()> {
            self.inner.commit(txn)
        }

        fn prepare_for_journal(
            &self,
            txn: &Transaction,
            buffer: JournalBuffer,
            image: &[u8],
        ) -> Result<()> {
            self.inner.prepare_for_journal(txn, buffer, image)?;
            if let JournalBuffer::Bitmap { index, .. } = buffer {
                let bit = self.steals.lock().pop();
                if let (Some(bit), Some(map)) = (bit, self.map.get().and_then(Weak::upgrade)) {
                    map.bitmap(index)?.set_racing(bit);
                }
            }
            Ok(())
        }

        fn restore_prepared(&self, txn: &Transaction, buffer: JournalBuffer) {
            self.inner.restore_prepared(txn, buffer);
        }

        fn mark_dirty(&self, txn: &Transaction, buffer: JournalBuffer, image: &[u8]) {
            self.inner.mark_dirty(txn, buffer, image);
        }

        fn mark_freed(&self, txn: &Transaction, block: BlockNumber) {
            self.inner.mark_freed(txn, block);
        }

        fn is_block_pending(&self, bitmap: BitmapIndex, bit: u32) -> Option<PendingHint> {
            self.inner.is_block_pending(bitmap, bit)
        }
    }

    fn racing(steals: Vec<u32>) -> (Arc<RacingJournal>, Arc<BitmapArray>) {
        let geometry = Geometry::new(BlockSize::new(512).unwrap(), 4096).unwrap();
        let journal = Arc::new(RacingJournal {
            inner: MemJournal::new(4096),
            map: OnceLock::new(),
            steals: Mutex::new(steals),
        });
        let map = Arc::new(
            BitmapArray::from_images(geometry, &format_bitmaps(&geometry), journal.clone())
                .unwrap(),
        );
        journal.map.set(Arc::downgrade(&map)).unwrap();
        (journal, map)
    }

    #[test]
    fn stolen_window_is_retried_further_on() {
        let (journal, map) = racing(vec![3]);
        let stats = AllocatorStats::default();
        let txn = journal.begin().unwrap();
        let outcome = BitmapBlockScanner::new(&map, &stats, 4)
            .scan(&txn, BitmapIndex(0), request(0, 4096, 4, 4))
            .unwrap();
        // 2..6 lost bit 3 before 4 bits were held; 4..8 is the next fit.
        assert_eq!(outcome, ScanOutcome::Found { start: 4, len: 4 });
        let bitmap = map.bitmap(BitmapIndex(0)).unwrap();
        assert!(!bitmap.test(2).unwrap());
        assert!(bitmap.test(3).unwrap());
        assert_eq!(bitmap.free_count(), 4094 - 1 - 4);
        let snap = stats.snapshot();
        assert_eq!((snap.stolen, snap.retries), (1, 1));
    }

    #[test]
    fn late_steal_shrinks_the_window() {
        let (journal, map) = racing(vec![6]);
        let stats = AllocatorStats::default();
        let txn = journal.begin().unwrap();
        let outcome = BitmapBlockScanner::new(&map, &stats, 4)
            .scan(&txn, BitmapIndex(0), request(0, 4096, 2, 6))
            .unwrap();
        assert_eq!(outcome, ScanOutcome::Found { start: 2, len: 4 });
        assert_eq!(stats.snapshot().retries, 0);
    }

    #[test]
    fn exhausted_retry_budget_is_an_error() {
        let (journal, map) = racing(vec![3]);
        let stats = AllocatorStats::default();
        let txn = journal.begin().unwrap();
        let free_before = map.space().free_blocks();
        let result = BitmapBlockScanner::new(&map, &stats, 0).scan(
            &txn,
            BitmapIndex(0),
            request(0, 4096, 4, 4),
        );
        assert!(matches!(
            result,
            Err(RfsError::ResourceExhausted { bitmap: 0, retries: 0 })
        ));
        let bitmap = map.bitmap(BitmapIndex(0)).unwrap();
        assert!(!bitmap.test(2).unwrap());
        assert_eq!(bitmap.free_count(), 4094 - 1);
        assert_eq!(map.space().free_blocks(), free_before);
        assert!(journal.inner.dirty_buffers(&txn).is_empty());
    }

    proptest! {
        #[test]
        fn windows_respect_bounds(
            used in proptest::collection::vec(any::<u8>(), 512),
            start in 0_u32..4096,
            span in 1_u32..4096,
            min in 1_u32..16,
            extra in 0_u32..32,
        ) {
            let mut used = used;
            used[0] |= 0b11;
            let fx = Fixture::with_image(used);
            let txn = fx.journal.begin().unwrap();
            let region_end = start.saturating_add(span).min(4096);
            let max = min + extra;
            let before = fx.map.bitmap(BitmapIndex(0)).unwrap().image();
            let outcome = fx
                .scanner()
                .scan(&txn, BitmapIndex(0), request(start, region_end, min, max))
                .unwrap();
            if let ScanOutcome::Found { start: found, len } = outcome {
                prop_assert!(found >= start);
                prop_assert!(len >= min && len <= max);
                prop_assert!(found + len <= region_end);
                for bit in found..found + len {
                    let byte = before[(bit / 8) as usize];
                    prop_assert_eq!(byte & (1 << (bit % 8)), 0, "bit {} was already in use", bit);
                }
            }
            fx.map.check_consistency().unwrap();
        }
    }
}
