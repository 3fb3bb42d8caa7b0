//! Per-inode preallocation.
//!
//! When a data allocation finds more contiguous free blocks than it needs,
//! the surplus stays marked in use and is parked here, so the next append to
//! the same file continues the run without another bitmap scan. The registry
//! is keyed by inode number; an entry disappears exactly when its count
//! reaches zero.

use crate::options::AllocOptions;
use crate::policy::AllocationHint;
use parking_lot::Mutex;
use rfs_error::Result;
use rfs_types::{BlockNumber, InodeNumber};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Contiguous run `start .. start + count` reserved for one inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PreallocationEntry {
    pub start: BlockNumber,
    pub count: u32,
}

#[derive(Debug, Default)]
pub struct PreallocationList {
    entries: Mutex<BTreeMap<InodeNumber, PreallocationEntry>>,
}

impl PreallocationList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Take up to `amount` blocks from `inode`'s entry, in increasing order.
    pub fn try_satisfy(&self, inode: InodeNumber, amount: u32) -> Vec<BlockNumber> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&inode) else {
            return Vec::new();
        };
        let take = entry.count.min(amount);
        let blocks = (0..u64::from(take))
            .map(|i| BlockNumber(entry.start.0 + i))
            .collect();
        entry.start = BlockNumber(entry.start.0 + u64::from(take));
        entry.count -= take;
        if entry.count == 0 {
            entries.remove(&inode);
        }
        blocks
    }

    /// Park `count` blocks starting at `start` for `inode`, returning any
    /// entry it replaces so the caller can release those blocks.
    pub fn install(
        &self,
        inode: InodeNumber,
        start: BlockNumber,
        count: u32,
    ) -> Option<PreallocationEntry> {
        if count == 0 {
            return None;
        }
        debug!(
            target: "rfs::alloc",
            event = "prealloc_install",
            inode = inode.0,
            start = start.0,
            count
        );
        self.entries
            .lock()
            .insert(inode, PreallocationEntry { start, count })
    }

    #[must_use]
    pub fn entry(&self, inode: InodeNumber) -> Option<PreallocationEntry> {
        self.entries.lock().get(&inode).copied()
    }

    /// Next block the inode's preallocation would hand out.
    #[must_use]
    pub fn cursor(&self, inode: InodeNumber) -> Option<BlockNumber> {
        self.entry(inode).map(|entry| entry.start)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove `inode`'s entry and pass each of its blocks to `release`.
    /// Returns the number of blocks released.
    pub fn discard(
        &self,
        inode: InodeNumber,
        mut release: impl FnMut(InodeNumber, BlockNumber) -> Result<()>,
    ) -> Result<u32> {
        let Some(entry) = self.entries.lock().remove(&inode) else {
            return Ok(0);
        };
        release_entry(inode, entry, &mut release)
    }

    /// Discard every registered entry (unmount, remount read-only).
    pub fn discard_all(
        &self,
        mut release: impl FnMut(InodeNumber, BlockNumber) -> Result<()>,
    ) -> Result<u32> {
        let drained = std::mem::take(&mut *self.entries.lock());
        let mut released = 0;
        let mut first_err = None;
        for (inode, entry) in drained {
            match release_entry(inode, entry, &mut release) {
                Ok(n) => released += n,
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(released),
        }
    }
}

/// Release every block of `entry`, continuing past failures so one bad
/// block does not leak the rest. The first error is returned.
fn release_entry(
    inode: InodeNumber,
    entry: PreallocationEntry,
    release: &mut impl FnMut(InodeNumber, BlockNumber) -> Result<()>,
) -> Result<u32> {
    let mut released = 0;
    let mut first_err = None;
    for i in 0..u64::from(entry.count) {
        let block = BlockNumber(entry.start.0 + i);
        match release(inode, block) {
            Ok(()) => released += 1,
            Err(err) => {
                warn!(
                    target: "rfs::alloc",
                    event = "prealloc_release_failed",
                    inode = inode.0,
                    block = block.0,
                    error = %err
                );
                first_err.get_or_insert(err);
            }
        }
    }
    debug!(
        target: "rfs::alloc",
        event = "prealloc_discard",
        inode = inode.0,
        released
    );
    match first_err {
        Some(err) => Err(err),
        None => Ok(released),
    }
}

/// Surplus blocks a data allocation should try to preallocate.
///
/// Only regular, non-private files that have already reached
/// `preallocation_min_size` blocks get a window.
#[must_use]
pub fn preallocation_size(hint: &AllocationHint, options: &AllocOptions, block_size: u32) -> u32 {
    if hint.formatted_node || !hint.preallocate {
        return 0;
    }
    let Some(inode) = &hint.inode else {
        return 0;
    };
    let threshold = options
        .preallocation_min_size
        .saturating_mul(u64::from(block_size));
    if !inode.is_regular || inode.private || inode.size_bytes < threshold {
        return 0;
    }
    u32::try_from(options.preallocation_surplus()).unwrap_or(u32::MAX)
}
