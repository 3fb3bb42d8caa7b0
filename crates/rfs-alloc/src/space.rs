//! Filesystem-wide free and reserved block counters.
//!
//! Lock order: `reserved` before `free`. `free` may be taken inside a
//! bitmap's mutation window, never the other way round.

use parking_lot::Mutex;
use rfs_error::{Result, RfsError};
use rfs_journal::{Journal, JournalBuffer, Transaction};
use tracing::warn;

#[derive(Debug)]
pub struct FreeSpace {
    free: Mutex<u64>,
    reserved: Mutex<u64>,
}

impl FreeSpace {
    #[must_use]
    pub fn new(free: u64) -> Self {
        Self {
            free: Mutex::new(free),
            reserved: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        *self.free.lock()
    }

    #[must_use]
    pub fn reserved_blocks(&self) -> u64 {
        *self.reserved.lock()
    }

    /// Free blocks not spoken for by a reservation.
    #[must_use]
    pub fn available(&self) -> u64 {
        let reserved = self.reserved.lock();
        let free = self.free.lock();
        free.saturating_sub(*reserved)
    }

    /// Fail with `NoSpace` unless `amount` blocks fit, counting
    /// `reserved_by_us` of the outstanding reservations as the caller's own.
    pub fn ensure_available(&self, amount: u64, reserved_by_us: u64) -> Result<()> {
        if self.available() < amount.saturating_sub(reserved_by_us) {
            return Err(RfsError::NoSpace);
        }
        Ok(())
    }

    /// Set `count` blocks aside for a later allocation.
    pub fn reserve_for_later(&self, count: u64) -> Result<()> {
        let mut reserved = self.reserved.lock();
        let free = self.free.lock();
        if free.saturating_sub(*reserved) < count {
            return Err(RfsError::NoSpace);
        }
        *reserved += count;
        Ok(())
    }

    pub fn release_reservation(&self, count: u64) {
        let mut reserved = self.reserved.lock();
        if count > *reserved {
            warn!(
                target: "rfs::alloc",
                event = "reservation_underflow",
                count,
                reserved = *reserved
            );
        }
        *reserved = reserved.saturating_sub(count);
    }

    /// Subtract `count` from the free counter inside `txn`.
    pub(crate) fn take(&self, journal: &dyn Journal, txn: &Transaction, count: u64) -> Result<()> {
        self.adjust(journal, txn, |free| free.saturating_sub(count))
    }

    /// Add `count` back to the free counter inside `txn`.
    pub(crate) fn give_back(
        &self,
        journal: &dyn Journal,
        txn: &Transaction,
        count: u64,
    ) -> Result<()> {
        self.adjust(journal, txn, |free| free.saturating_add(count))
    }

    /// The super block is captured and dirtied under the counter's lock, so
    /// its two images differ by this change alone.
    fn adjust(
        &self,
        journal: &dyn Journal,
        txn: &Transaction,
        update: impl FnOnce(u64) -> u64,
    ) -> Result<()> {
        let mut free = self.free.lock();
        journal.prepare_for_journal(txn, JournalBuffer::SuperBlock, &free.to_le_bytes())?;
        *free = update(*free);
        journal.mark_dirty(txn, JournalBuffer::SuperBlock, &free.to_le_bytes());
        Ok(())
    }
}
