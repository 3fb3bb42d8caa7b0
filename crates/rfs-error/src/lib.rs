#![forbid(unsafe_code)]
//! Error types for the rfs block allocator.
//!
//! # Error Taxonomy
//!
//! | Class | Variants | Expected in correct operation? |
//! |-------|----------|--------------------------------|
//! | Space | `NoSpace`, `QuotaExceeded` | Yes; surfaced to the writer as ENOSPC / EDQUOT |
//! | Contention | `ResourceExhausted` | Rarely; the whole request may be retried later |
//! | Caller bugs | `OutOfRange`, `AlreadyClear` | No; a block or bit outside geometry, or a double free |
//! | Integrity | `AlreadySet`, `Corruption`, `JournalUnavailable` | No; the operation fails rather than risk a double allocation |
//! | Setup | `InvalidGeometry`, `InvalidOption`, `Format`, `Io` | Only at mount / format time |
//!
//! `NoSpace` and `QuotaExceeded` are deliberately distinct so callers can
//! report the right user-facing error. Neither is ever raised as a panic.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`RfsError::to_errno`].
//! The match is exhaustive, so adding a variant is a compile error until its
//! errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `AlreadySet` | `EIO` |
//! | `AlreadyClear` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `InvalidGeometry` | `EINVAL` |
//! | `InvalidOption` | `EINVAL` |
//! | `OutOfRange` | `EINVAL` |
//! | `NoSpace` | `ENOSPC` |
//! | `QuotaExceeded` | `EDQUOT` |
//! | `ResourceExhausted` | `EAGAIN` |
//! | `JournalUnavailable` | `EROFS` |
//!
//! ## Design Constraints
//!
//! - `rfs-error` MUST NOT depend on `rfs-types` (no cyclic deps); block
//!   numbers are carried as plain `u64`.
//! - Parse-level errors convert into `RfsError` at crate boundaries.

use thiserror::Error;

/// Unified error type for all allocator operations.
#[derive(Debug, Error)]
pub enum RfsError {
    /// Operating system I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk bitmap state contradicts the allocator's invariants.
    #[error("corrupt bitmap state at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// Structurally invalid image or buffer.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Geometry parameters are inconsistent or unsupported.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// Mount-time allocator option could not be parsed.
    #[error("invalid allocator option: {0}")]
    InvalidOption(String),

    /// A bit or block index outside the geometry was addressed.
    #[error("{what} {index} out of range (limit {limit})")]
    OutOfRange {
        what: &'static str,
        index: u64,
        limit: u64,
    },

    /// No window of free blocks satisfies the request.
    #[error("no space left on device")]
    NoSpace,

    /// The owning inode's quota refused the reservation.
    #[error("disk quota exceeded for inode {inode}")]
    QuotaExceeded { inode: u64 },

    /// Stolen-bit retries ran out inside one bitmap block.
    #[error("allocation retry budget exhausted in bitmap {bitmap} after {retries} retries")]
    ResourceExhausted { bitmap: u32, retries: u32 },

    /// The journal refused to capture a buffer (aborted or shut down).
    #[error("journal unavailable: {0}")]
    JournalUnavailable(String),

    /// A bit expected to be free was already set.
    #[error("block {block}: bit already set")]
    AlreadySet { block: u64 },

    /// A bit expected to be in use was already clear (double free).
    #[error("block {block}: bit already cleared")]
    AlreadyClear { block: u64 },
}

impl RfsError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } | Self::AlreadySet { .. } | Self::AlreadyClear { .. } => {
                libc::EIO
            }
            Self::Format(_)
            | Self::InvalidGeometry(_)
            | Self::InvalidOption(_)
            | Self::OutOfRange { .. } => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::QuotaExceeded { .. } => libc::EDQUOT,
            Self::ResourceExhausted { .. } => libc::EAGAIN,
            Self::JournalUnavailable(_) => libc::EROFS,
        }
    }

    /// Whether the same request may succeed if retried later unchanged.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }

    /// Whether this is an ordinary out-of-space condition (device or quota).
    #[must_use]
    pub fn is_space_exhaustion(&self) -> bool {
        matches!(self, Self::NoSpace | Self::QuotaExceeded { .. })
    }
}

/// Result alias using `RfsError`.
pub type Result<T> = std::result::Result<T, RfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(RfsError, libc::c_int)> = vec![
            (RfsError::Io(std::io::Error::other("test")), libc::EIO),
            (
                RfsError::Corruption {
                    block: 0,
                    detail: "test".into(),
                },
                libc::EIO,
            ),
            (RfsError::Format("test".into()), libc::EINVAL),
            (RfsError::InvalidGeometry("test".into()), libc::EINVAL),
            (RfsError::InvalidOption("bogus".into()), libc::EINVAL),
            (
                RfsError::OutOfRange {
                    what: "bit",
                    index: 9,
                    limit: 8,
                },
                libc::EINVAL,
            ),
            (RfsError::NoSpace, libc::ENOSPC),
            (RfsError::QuotaExceeded { inode: 12 }, libc::EDQUOT),
            (
                RfsError::ResourceExhausted {
                    bitmap: 0,
                    retries: 64,
                },
                libc::EAGAIN,
            ),
            (RfsError::JournalUnavailable("aborted".into()), libc::EROFS),
            (RfsError::AlreadySet { block: 5 }, libc::EIO),
            (RfsError::AlreadyClear { block: 5 }, libc::EIO),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EPERM);
        assert_eq!(RfsError::Io(raw).to_errno(), libc::EPERM);
    }

    #[test]
    fn classification() {
        assert!(RfsError::ResourceExhausted { bitmap: 1, retries: 3 }.is_transient());
        assert!(!RfsError::NoSpace.is_transient());
        assert!(RfsError::NoSpace.is_space_exhaustion());
        assert!(RfsError::QuotaExceeded { inode: 1 }.is_space_exhaustion());
        assert!(!RfsError::AlreadyClear { block: 1 }.is_space_exhaustion());
    }

    #[test]
    fn display_formatting() {
        assert_eq!(
            RfsError::AlreadyClear { block: 4080 }.to_string(),
            "block 4080: bit already cleared"
        );
        assert_eq!(
            RfsError::OutOfRange {
                what: "block",
                index: 200,
                limit: 100,
            }
            .to_string(),
            "block 200 out of range (limit 100)"
        );
        assert_eq!(RfsError::NoSpace.to_string(), "no space left on device");
        assert_eq!(
            RfsError::QuotaExceeded { inode: 7 }.to_string(),
            "disk quota exceeded for inode 7"
        );
    }
}
