//! Process-wide allocator counters.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters. Initialized at mount and never reset.
#[derive(Debug, Default)]
pub struct AllocatorStats {
    pub(crate) scan_calls: AtomicU64,
    pub(crate) bitmaps_scanned: AtomicU64,
    pub(crate) in_journal_hint: AtomicU64,
    pub(crate) in_journal_nohint: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) stolen: AtomicU64,
    pub(crate) allocated: AtomicU64,
    pub(crate) freed: AtomicU64,
    pub(crate) prealloc_hits: AtomicU64,
    pub(crate) prealloc_discarded: AtomicU64,
}

/// Point-in-time copy of [`AllocatorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub scan_calls: u64,
    pub bitmaps_scanned: u64,
    pub in_journal_hint: u64,
    pub in_journal_nohint: u64,
    pub retries: u64,
    pub stolen: u64,
    pub allocated: u64,
    pub freed: u64,
    pub prealloc_hits: u64,
    pub prealloc_discarded: u64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl AllocatorStats {
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            scan_calls: read(&self.scan_calls),
            bitmaps_scanned: read(&self.bitmaps_scanned),
            in_journal_hint: read(&self.in_journal_hint),
            in_journal_nohint: read(&self.in_journal_nohint),
            retries: read(&self.retries),
            stolen: read(&self.stolen),
            allocated: read(&self.allocated),
            freed: read(&self.freed),
            prealloc_hits: read(&self.prealloc_hits),
            prealloc_discarded: read(&self.prealloc_discarded),
        }
    }
}
