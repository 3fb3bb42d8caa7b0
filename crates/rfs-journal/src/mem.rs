//! In-memory journal.
//!
//! Tracks running transactions, the changes each one has made to bitmap and
//! super block buffers, and the blocks each one has freed. Committing a
//! transaction folds its changes into the committed images, writes the
//! touched bitmaps to the attached device (if any) and makes its freed
//! blocks reusable.

use crate::{Journal, JournalBuffer, PendingHint, Transaction};
use parking_lot::Mutex;
use rfs_block::BlockDevice;
use rfs_error::{Result, RfsError};
use rfs_types::{BitmapIndex, BlockNumber, TxnId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// Per-journal counters, exported for tests and `rfs-cli inspect`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JournalStats {
    pub begun: u64,
    pub committed: u64,
    pub prepared: u64,
    pub restored: u64,
    pub dirtied: u64,
    pub freed: u64,
    pub bitmap_writes: u64,
}

/// Net effect of one transaction on one buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Change {
    /// Bits switched on and off, one mask byte per image byte. A bit switched
    /// back within the same transaction appears in neither mask.
    Bits { set: Vec<u8>, clear: Vec<u8> },
    /// Signed change of the super block's free block counter.
    Counter(i128),
}

impl Change {
    fn empty(buffer: JournalBuffer) -> Self {
        match buffer {
            JournalBuffer::Bitmap { .. } => Self::Bits {
                set: Vec::new(),
                clear: Vec::new(),
            },
            JournalBuffer::SuperBlock => Self::Counter(0),
        }
    }

    /// Fold the difference between two images of one mutation window in.
    fn record(&mut self, before: &[u8], after: &[u8]) {
        match self {
            Self::Bits { set, clear } => {
                if set.len() < after.len() {
                    set.resize(after.len(), 0);
                    clear.resize(after.len(), 0);
                }
                for (i, (&old, &new)) in before.iter().zip(after).enumerate() {
                    let on = new & !old;
                    let off = old & !new;
                    let undone_off = on & clear[i];
                    clear[i] &= !on;
                    set[i] |= on & !undone_off;
                    let undone_on = off & set[i];
                    set[i] &= !off;
                    clear[i] |= off & !undone_on;
                }
            }
            Self::Counter(delta) => {
                *delta += i128::from(read_counter(after)) - i128::from(read_counter(before));
            }
        }
    }

    /// Apply the change to the committed image of its buffer.
    fn apply(&self, image: &mut Vec<u8>) {
        match self {
            Self::Bits { set, clear } => {
                for (i, byte) in image.iter_mut().enumerate() {
                    if let (Some(on), Some(off)) = (set.get(i), clear.get(i)) {
                        *byte = (*byte | on) & !off;
                    }
                }
            }
            Self::Counter(delta) => {
                let value = (i128::from(read_counter(image)) + delta).max(0);
                let value = u64::try_from(value).unwrap_or(u64::MAX);
                *image = value.to_le_bytes().to_vec();
            }
        }
    }
}

/// Super block images carry the free block count as a little-endian u64.
fn read_counter(image: &[u8]) -> u64 {
    let mut bytes = [0_u8; 8];
    let len = image.len().min(8);
    bytes[..len].copy_from_slice(&image[..len]);
    u64::from_le_bytes(bytes)
}

#[derive(Debug, Default)]
struct RunningTxn {
    /// Images captured by `prepare_for_journal`, awaiting `mark_dirty`.
    prepared: BTreeMap<JournalBuffer, Vec<u8>>,
    changes: BTreeMap<JournalBuffer, Change>,
}

#[derive(Debug, Default)]
struct JournalState {
    aborted: Option<String>,
    running: BTreeMap<TxnId, RunningTxn>,
    /// Freed-but-uncommitted blocks, with the transaction that freed them.
    freed: BTreeMap<u64, TxnId>,
    /// Metadata blocks logged by a running transaction.
    logged: BTreeMap<u64, TxnId>,
    /// Committed image of every buffer seen so far. The first capture of a
    /// buffer predates any change made through this journal.
    committed: BTreeMap<JournalBuffer, Vec<u8>>,
    stats: JournalStats,
}

/// Journal that keeps everything in memory.
///
/// Each transaction records the bits it switched and its net change to the
/// free counter. `commit` applies them to the committed images, so
/// transactions sharing a bitmap may commit in any order. With a device
/// attached, the resulting bitmap images are written and synced.
pub struct MemJournal {
    bits_per_bitmap: u32,
    device: Option<Arc<dyn BlockDevice>>,
    next_txn: AtomicU64,
    /// Serializes commits so device writes land in commit order.
    commit_order: Mutex<()>,
    state: Mutex<JournalState>,
}

impl std::fmt::Debug for MemJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemJournal")
            .field("bits_per_bitmap", &self.bits_per_bitmap)
            .field("has_device", &self.device.is_some())
            .field("next_txn", &self.next_txn.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MemJournal {
    /// Journal for a filesystem whose bitmaps each describe `bits_per_bitmap`
    /// blocks.
    #[must_use]
    pub fn new(bits_per_bitmap: u32) -> Self {
        Self {
            bits_per_bitmap: bits_per_bitmap.max(1),
            device: None,
            next_txn: AtomicU64::new(1),
            commit_order: Mutex::new(()),
            state: Mutex::new(JournalState::default()),
        }
    }

    /// Persist committed bitmap images to `device`.
    #[must_use]
    pub fn with_device(mut self, device: Arc<dyn BlockDevice>) -> Self {
        self.device = Some(device);
        self
    }

    /// Record that `txn` journaled metadata block `block`. Until `txn`
    /// commits the block is reported as pending without a resume hint.
    pub fn log_block(&self, txn: &Transaction, block: BlockNumber) {
        let mut state = self.state.lock();
        state.logged.insert(block.0, txn.id());
    }

    /// Put the journal into the aborted state. Every later `begin` and
    /// `prepare_for_journal` fails with `JournalUnavailable`.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(target: "rfs::journal", event = "journal_aborted", reason = %reason);
        self.state.lock().aborted = Some(reason);
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted.is_some()
    }

    /// Whether `txn` has been begun and not yet committed.
    #[must_use]
    pub fn is_running(&self, txn: &Transaction) -> bool {
        self.state.lock().running.contains_key(&txn.id())
    }

    /// Buffers `txn` has marked dirty so far, in order.
    #[must_use]
    pub fn dirty_buffers(&self, txn: &Transaction) -> Vec<JournalBuffer> {
        self.state
            .lock()
            .running
            .get(&txn.id())
            .map(|running| running.changes.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Buffers `txn` currently holds prepared (neither dirtied nor restored).
    #[must_use]
    pub fn prepared_buffers(&self, txn: &Transaction) -> Vec<JournalBuffer> {
        self.state
            .lock()
            .running
            .get(&txn.id())
            .map(|running| running.prepared.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Number of freed blocks still waiting for their transaction to commit.
    #[must_use]
    pub fn pending_free_count(&self) -> usize {
        self.state.lock().freed.len()
    }

    /// Free block count held by the committed super block, once any
    /// transaction has captured it.
    #[must_use]
    pub fn committed_free_blocks(&self) -> Option<u64> {
        let state = self.state.lock();
        state
            .committed
            .get(&JournalBuffer::SuperBlock)
            .map(Vec::as_slice)
            .map(read_counter)
    }

    #[must_use]
    pub fn stats(&self) -> JournalStats {
        self.state.lock().stats
    }

    fn unavailable(state: &JournalState) -> Option<RfsError> {
        state
            .aborted
            .as_ref()
            .map(|reason| RfsError::JournalUnavailable(reason.clone()))
    }

    fn next_unpending_bit(&self, state: &JournalState, bitmap: BitmapIndex, bit: u32) -> u32 {
        let bits = u64::from(self.bits_per_bitmap);
        let base = u64::from(bitmap.0) * bits;
        let mut next = base + u64::from(bit) + 1;
        for &block in state.freed.range(next..base + bits).map(|(block, _)| block) {
            if block != next {
                break;
            }
            next += 1;
        }
        // Bounded by `bits_per_bitmap`, which is a u32.
        u32::try_from(next - base).unwrap_or(self.bits_per_bitmap)
    }
}

impl Journal for MemJournal {
    fn begin(&self) -> Result<Transaction> {
        let mut state = self.state.lock();
        if let Some(err) = Self::unavailable(&state) {
            return Err(err);
        }
        let id = TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed));
        state.running.insert(id, RunningTxn::default());
        state.stats.begun += 1;
        debug!(target: "rfs::journal", event = "txn_begin", txn = %id);
        Ok(Transaction::new(id))
    }

    fn commit(&self, txn: Transaction) -> Result<()> {
        let id = txn.id();
        let _order = self.commit_order.lock();
        let (writes, dirty) = {
            let mut state = self.state.lock();
            let Some(running) = state.running.remove(&id) else {
                return Err(RfsError::JournalUnavailable(format!(
                    "{id} is not running"
                )));
            };
            if !running.prepared.is_empty() {
                warn!(
                    target: "rfs::journal",
                    event = "commit_with_prepared_buffers",
                    txn = %id,
                    count = running.prepared.len()
                );
            }
            state.freed.retain(|_, owner| *owner != id);
            state.logged.retain(|_, owner| *owner != id);

            let mut writes = Vec::new();
            for (buffer, change) in &running.changes {
                let Some(image) = state.committed.get_mut(buffer) else {
                    warn!(
                        target: "rfs::journal",
                        event = "change_without_capture",
                        txn = %id,
                        buffer = %buffer
                    );
                    continue;
                };
                change.apply(image);
                if let (JournalBuffer::Bitmap { block, .. }, Some(_)) = (buffer, &self.device) {
                    writes.push((*block, image.clone()));
                }
            }
            state.stats.committed += 1;
            (writes, running.changes.len())
        };

        if let Some(device) = &self.device {
            let mut written = 0_u64;
            for (block, image) in &writes {
                device.write_block(*block, image)?;
                written += 1;
            }
            device.sync()?;
            self.state.lock().stats.bitmap_writes += written;
        }

        info!(target: "rfs::journal", event = "txn_commit", txn = %id, dirty);
        Ok(())
    }

    fn prepare_for_journal(
        &self,
        txn: &Transaction,
        buffer: JournalBuffer,
        image: &[u8],
    ) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(err) = Self::unavailable(&state) {
            return Err(err);
        }
        let JournalState {
            running,
            committed,
            stats,
            ..
        } = &mut *state;
        let Some(running) = running.get_mut(&txn.id()) else {
            return Err(RfsError::JournalUnavailable(format!(
                "{} is not running",
                txn.id()
            )));
        };
        committed.entry(buffer).or_insert_with(|| image.to_vec());
        running.prepared.insert(buffer, image.to_vec());
        stats.prepared += 1;
        Ok(())
    }

    fn restore_prepared(&self, txn: &Transaction, buffer: JournalBuffer) {
        let mut state = self.state.lock();
        if let Some(running) = state.running.get_mut(&txn.id()) {
            running.prepared.remove(&buffer);
            state.stats.restored += 1;
        }
    }

    fn mark_dirty(&self, txn: &Transaction, buffer: JournalBuffer, image: &[u8]) {
        let mut state = self.state.lock();
        let Some(running) = state.running.get_mut(&txn.id()) else {
            warn!(
                target: "rfs::journal",
                event = "dirty_outside_txn",
                txn = %txn.id(),
                buffer = %buffer
            );
            return;
        };
        let Some(before) = running.prepared.remove(&buffer) else {
            warn!(
                target: "rfs::journal",
                event = "dirty_without_prepare",
                txn = %txn.id(),
                buffer = %buffer
            );
            return;
        };
        running
            .changes
            .entry(buffer)
            .or_insert_with(|| Change::empty(buffer))
            .record(&before, image);
        state.stats.dirtied += 1;
    }

    fn mark_freed(&self, txn: &Transaction, block: BlockNumber) {
        let mut state = self.state.lock();
        state.freed.insert(block.0, txn.id());
        state.stats.freed += 1;
    }

    fn is_block_pending(&self, bitmap: BitmapIndex, bit: u32) -> Option<PendingHint> {
        let state = self.state.lock();
        let block = u64::from(bitmap.0) * u64::from(self.bits_per_bitmap) + u64::from(bit);
        if state.freed.contains_key(&block) {
            return Some(PendingHint::ResumeAt(
                self.next_unpending_bit(&state, bitmap, bit),
            ));
        }
        if state.logged.contains_key(&block) {
            return Some(PendingHint::AdvanceOne);
        }
        None
    }
}
