#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `BlockDevice` trait the allocator loads bitmap blocks through
//! at mount and the journal persists them through at commit, together with an
//! in-memory device for tests and a file-backed device (pread/pwrite) for
//! image files.

use parking_lot::Mutex;
use rfs_error::{Result, RfsError};
use rfs_types::BlockNumber;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn check_block(block: BlockNumber, block_count: u64) -> Result<()> {
    if block.0 >= block_count {
        return Err(RfsError::OutOfRange {
            what: "block",
            index: block.0,
            limit: block_count,
        });
    }
    Ok(())
}

fn check_len(data: &[u8], block_size: u32) -> Result<()> {
    let expected = usize::try_from(block_size)
        .map_err(|_| RfsError::Format("block_size does not fit usize".to_owned()))?;
    if data.len() != expected {
        return Err(RfsError::Format(format!(
            "write_block data size mismatch: got={} expected={expected}",
            data.len()
        )));
    }
    Ok(())
}

/// Sparse in-memory block device. Unwritten blocks read back as zeroes.
#[derive(Debug)]
pub struct MemBlockDevice {
    block_size: u32,
    block_count: u64,
    blocks: Mutex<HashMap<u64, Vec<u8>>>,
    writes: Mutex<u64>,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            block_size,
            block_count,
            blocks: Mutex::new(HashMap::new()),
            writes: Mutex::new(0),
        }
    }

    /// Number of successful `write_block` calls so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        *self.writes.lock()
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        check_block(block, self.block_count)?;
        let blocks = self.blocks.lock();
        Ok(blocks.get(&block.0).map_or_else(
            || BlockBuf::new(vec![0_u8; self.block_size as usize]),
            |data| BlockBuf::new(data.clone()),
        ))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        check_block(block, self.block_count)?;
        check_len(data, self.block_size)?;
        self.blocks.lock().insert(block.0, data.to_vec());
        *self.writes.lock() += 1;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// File-backed block device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not need a shared
/// seek position, so one handle serves concurrent readers and the journal.
#[derive(Debug, Clone)]
pub struct FileBlockDevice {
    file: Arc<File>,
    block_size: u32,
    block_count: u64,
    writable: bool,
}

impl FileBlockDevice {
    /// Open an existing image. Falls back to read-only when the file cannot
    /// be opened for writing.
    pub fn open(path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        Self::from_file(file, block_size, writable)
    }

    /// Create (or truncate) an image of `block_count` zeroed blocks.
    pub fn create(path: impl AsRef<Path>, block_size: u32, block_count: u64) -> Result<Self> {
        let len = block_count
            .checked_mul(u64::from(block_size))
            .ok_or_else(|| RfsError::InvalidGeometry("image length overflows u64".to_owned()))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        debug!(
            target: "rfs::block",
            event = "image_created",
            path = %path.as_ref().display(),
            block_size,
            block_count
        );
        Self::from_file(file, block_size, true)
    }

    fn from_file(file: File, block_size: u32, writable: bool) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(RfsError::InvalidGeometry(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        let len = file.metadata()?.len();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(RfsError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            block_size,
            block_count: len / block_size_u64,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn offset_of(&self, block: BlockNumber) -> Result<u64> {
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| RfsError::Format("block offset overflow".to_owned()))
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        check_block(block, self.block_count)?;
        let mut buf = vec![
            0_u8;
            usize::try_from(self.block_size).map_err(|_| {
                RfsError::Format("block_size does not fit usize".to_owned())
            })?
        ];
        self.file.read_exact_at(&mut buf, self.offset_of(block)?)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(RfsError::Io(std::io::Error::from_raw_os_error(libc::EROFS)));
        }
        check_len(data, self.block_size)?;
        check_block(block, self.block_count)?;
        self.file.write_all_at(data, self.offset_of(block)?)?;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_reads_zeroes_until_written() {
        let dev = MemBlockDevice::new(1024, 16);
        assert_eq!(dev.read_block(BlockNumber(3)).unwrap().as_slice(), &[0_u8; 1024][..]);

        let data = vec![0xA5_u8; 1024];
        dev.write_block(BlockNumber(3), &data).unwrap();
        assert_eq!(dev.read_block(BlockNumber(3)).unwrap().into_inner(), data);
        assert_eq!(dev.write_count(), 1);
    }

    #[test]
    fn mem_device_rejects_out_of_range_and_short_writes() {
        let dev = MemBlockDevice::new(1024, 16);
        assert!(matches!(
            dev.read_block(BlockNumber(16)),
            Err(RfsError::OutOfRange { index: 16, .. })
        ));
        assert!(matches!(
            dev.write_block(BlockNumber(1), &[0_u8; 10]),
            Err(RfsError::Format(_))
        ));
    }

    #[test]
    fn file_device_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bin");
        let dev = FileBlockDevice::create(&path, 4096, 8).unwrap();
        assert_eq!(dev.block_count(), 8);
        assert!(dev.is_writable());

        let mut data = vec![0_u8; 4096];
        data[0] = 0b0000_0011;
        dev.write_block(BlockNumber(1), &data).unwrap();
        dev.sync().unwrap();

        let reopened = FileBlockDevice::open(&path, 4096).unwrap();
        assert_eq!(reopened.read_block(BlockNumber(1)).unwrap().into_inner(), data);
        assert!(reopened.read_block(BlockNumber(8)).is_err());
    }

    #[test]
    fn file_device_rejects_unaligned_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.bin");
        std::fs::write(&path, vec![0_u8; 5000]).unwrap();
        assert!(matches!(
            FileBlockDevice::open(&path, 4096),
            Err(RfsError::Format(_))
        ));
    }
}
