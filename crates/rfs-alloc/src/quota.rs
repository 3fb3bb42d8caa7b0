//! Quota collaborator.
//!
//! The allocator reserves quota before it touches any bitmap, converts the
//! reservation into a permanent charge once the blocks are in hand, and
//! credits blocks handed back on free.

use parking_lot::Mutex;
use rfs_error::{Result, RfsError};
use rfs_types::InodeNumber;
use serde::Serialize;
use std::collections::HashMap;

pub trait QuotaService: Send + Sync {
    /// Reserve `blocks` for `inode`; `QuotaExceeded` if the limit forbids it.
    fn reserve(&self, inode: InodeNumber, blocks: u64) -> Result<()>;

    /// Return an unused reservation.
    fn release(&self, inode: InodeNumber, blocks: u64);

    /// Convert `blocks` of the reservation into usage.
    fn charge_permanent(&self, inode: InodeNumber, blocks: u64);

    /// Give back usage for freed blocks.
    fn credit(&self, inode: InodeNumber, blocks: u64);
}

/// Per-inode quota state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub limit: Option<u64>,
    pub used: u64,
    pub reserved: u64,
}

/// In-memory quota with optional per-inode block limits.
#[derive(Debug, Default)]
pub struct MemQuota {
    inodes: Mutex<HashMap<InodeNumber, QuotaUsage>>,
}

impl MemQuota {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit `inode` to `blocks` used plus reserved.
    pub fn set_limit(&self, inode: InodeNumber, blocks: u64) {
        self.inodes.lock().entry(inode).or_default().limit = Some(blocks);
    }

    #[must_use]
    pub fn usage(&self, inode: InodeNumber) -> QuotaUsage {
        self.inodes.lock().get(&inode).copied().unwrap_or_default()
    }
}

impl QuotaService for MemQuota {
    fn reserve(&self, inode: InodeNumber, blocks: u64) -> Result<()> {
        let mut inodes = self.inodes.lock();
        let usage = inodes.entry(inode).or_default();
        if let Some(limit) = usage.limit {
            if usage.used + usage.reserved + blocks > limit {
                return Err(RfsError::QuotaExceeded { inode: inode.0 });
            }
        }
        usage.reserved += blocks;
        Ok(())
    }

    fn release(&self, inode: InodeNumber, blocks: u64) {
        let mut inodes = self.inodes.lock();
        let usage = inodes.entry(inode).or_default();
        usage.reserved = usage.reserved.saturating_sub(blocks);
    }

    fn charge_permanent(&self, inode: InodeNumber, blocks: u64) {
        let mut inodes = self.inodes.lock();
        let usage = inodes.entry(inode).or_default();
        usage.reserved = usage.reserved.saturating_sub(blocks);
        usage.used += blocks;
    }

    fn credit(&self, inode: InodeNumber, blocks: u64) {
        let mut inodes = self.inodes.lock();
        let usage = inodes.entry(inode).or_default();
        usage.used = usage.used.saturating_sub(blocks);
    }
}
