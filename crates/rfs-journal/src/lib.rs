#![forbid(unsafe_code)]
//! Journal collaborator contract for the block allocator.
//!
//! The allocator never writes bitmap blocks itself. Every mutation of an
//! in-memory bitmap (or of the filesystem-wide free counter) is bracketed by
//! the journal:
//!
//! 1. `prepare_for_journal` captures the buffer's current image for the
//!    running transaction before any bit changes;
//! 2. the caller mutates the in-memory copy;
//! 3. `mark_dirty` hands the new image to the transaction, or
//!    `restore_prepared` releases the buffer when nothing changed.
//!
//! The caller holds the buffer's own lock from step 1 to step 3, so the two
//! images differ by exactly this transaction's changes. Other transactions
//! may touch the same buffer between two such windows; a journal must
//! therefore commit a transaction's changes, not its last image.
//!
//! Blocks freed inside a transaction are reported with `mark_freed` and stay
//! "pending" until that transaction commits: `is_block_pending` lets the data
//! block scanner skip them so a block the journal may still need on replay is
//! never handed out as file data.
//!
//! Replay is out of scope; [`mem::MemJournal`] is an in-memory reference
//! implementation used by tests and the CLI.

pub mod mem;

pub use mem::{JournalStats, MemJournal};

use rfs_error::Result;
use rfs_types::{BitmapIndex, BlockNumber, TxnId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Handle for a running transaction.
///
/// Deliberately not `Clone`: exactly one owner threads it through the calls
/// that belong to the transaction and finally hands it to `Journal::commit`.
#[derive(Debug, PartialEq, Eq)]
pub struct Transaction {
    id: TxnId,
}

impl Transaction {
    /// Wrap an id issued by a journal implementation.
    #[must_use]
    pub fn new(id: TxnId) -> Self {
        Self { id }
    }

    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }
}

/// A buffer whose modifications are captured by the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JournalBuffer {
    /// One on-disk bitmap block.
    Bitmap {
        index: BitmapIndex,
        block: BlockNumber,
    },
    /// The super block holding the filesystem-wide free block count.
    SuperBlock,
}

impl fmt::Display for JournalBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bitmap { index, block } => write!(f, "bitmap {index} @ block {block}"),
            Self::SuperBlock => f.write_str("super block"),
        }
    }
}

/// Answer to "is this bit tied up in an uncommitted transaction?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingHint {
    /// Resume the scan at this bit offset within the same bitmap.
    ResumeAt(u32),
    /// No better hint is available; advance by one bit.
    AdvanceOne,
}

impl PendingHint {
    /// Bit offset the scanner should continue from after colliding at `bit`.
    #[must_use]
    pub fn resume_from(self, bit: u32) -> u32 {
        match self {
            Self::ResumeAt(next) if next > bit => next,
            Self::ResumeAt(_) | Self::AdvanceOne => bit.saturating_add(1),
        }
    }
}

/// Journal / transaction collaborator.
pub trait Journal: Send + Sync {
    /// Open a new transaction.
    fn begin(&self) -> Result<Transaction>;

    /// Commit `txn`, making its buffers durable and releasing its freed blocks
    /// for reuse.
    fn commit(&self, txn: Transaction) -> Result<()>;

    /// Capture `buffer`, whose current contents are `image`, for `txn`
    /// before it is modified.
    fn prepare_for_journal(
        &self,
        txn: &Transaction,
        buffer: JournalBuffer,
        image: &[u8],
    ) -> Result<()>;

    /// Release a prepared buffer that ended up unchanged.
    fn restore_prepared(&self, txn: &Transaction, buffer: JournalBuffer);

    /// Record the modified image of a prepared buffer in `txn`.
    fn mark_dirty(&self, txn: &Transaction, buffer: JournalBuffer, image: &[u8]);

    /// Record that `block` was freed by `txn`; it must not be reused as file
    /// data before `txn` commits.
    fn mark_freed(&self, txn: &Transaction, block: BlockNumber);

    /// Whether bit `bit` of bitmap `bitmap` belongs to a block the journal
    /// still depends on.
    fn is_block_pending(&self, bitmap: BitmapIndex, bit: u32) -> Option<PendingHint>;
}
