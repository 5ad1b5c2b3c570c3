#![forbid(unsafe_code)]
//! Block device abstraction and host capabilities.
//!
//! Provides the `BlockDevice` trait the storage engine is written against,
//! an in-memory device for deterministic tests, a file-backed device using
//! positional I/O, and the `Clock` capability that lets tests substitute a
//! step counter for wall-clock time.

use halfs_error::{HalfsError, Result};
use halfs_types::{BlockAddr, Timestamp};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::trace;

// ── Block buffer ────────────────────────────────────────────────────────────

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Arc<Vec<u8>>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        match Arc::try_unwrap(self.bytes) {
            Ok(bytes) => bytes,
            Err(shared) => shared.as_ref().clone(),
        }
    }
}

// ── Block device trait ──────────────────────────────────────────────────────

/// Fixed-size block I/O interface.
///
/// Blocks are exactly `block_size()` bytes. Writes are assumed durable on
/// return from `flush`.
pub trait BlockDevice: Send + Sync {
    /// Device block size in bytes.
    fn block_size(&self) -> u64;

    /// Total number of blocks.
    fn num_blocks(&self) -> u64;

    /// Read the block at `addr`.
    fn read_block(&self, addr: BlockAddr) -> Result<BlockBuf>;

    /// Write a block at `addr`. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, addr: BlockAddr, data: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn flush(&self) -> Result<()>;
}

fn out_of_range(addr: BlockAddr, num_blocks: u64) -> HalfsError {
    HalfsError::Device(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("block {addr} out of range (device has {num_blocks} blocks)"),
    ))
}

fn bad_write_len(len: usize, block_size: u64) -> HalfsError {
    HalfsError::Device(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("write of {len} bytes to device with block size {block_size}"),
    ))
}

// ── In-memory device ────────────────────────────────────────────────────────

/// Deterministic in-memory block device.
///
/// Backs the test host: every block starts zeroed, reads and writes are
/// bounds-checked, and nothing survives the process.
pub struct MemBlockDevice {
    block_size: u64,
    blocks: Mutex<Vec<Vec<u8>>>,
}

impl MemBlockDevice {
    /// Create a device of `num_blocks` zeroed blocks of `block_size` bytes.
    #[must_use]
    pub fn new(block_size: u64, num_blocks: u64) -> Self {
        let bs = usize::try_from(block_size).expect("block size fits in usize");
        let nb = usize::try_from(num_blocks).expect("block count fits in usize");
        Self {
            block_size,
            blocks: Mutex::new(vec![vec![0_u8; bs]; nb]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.blocks.lock().len() as u64
    }

    fn read_block(&self, addr: BlockAddr) -> Result<BlockBuf> {
        let blocks = self.blocks.lock();
        let idx = usize::try_from(addr.0).map_err(|_| out_of_range(addr, blocks.len() as u64))?;
        blocks
            .get(idx)
            .map(|data| BlockBuf::new(data.clone()))
            .ok_or_else(|| out_of_range(addr, blocks.len() as u64))
    }

    fn write_block(&self, addr: BlockAddr, data: &[u8]) -> Result<()> {
        if data.len() as u64 != self.block_size {
            return Err(bad_write_len(data.len(), self.block_size));
        }
        let mut blocks = self.blocks.lock();
        let num = blocks.len() as u64;
        let idx = usize::try_from(addr.0).map_err(|_| out_of_range(addr, num))?;
        let slot = blocks.get_mut(idx).ok_or_else(|| out_of_range(addr, num))?;
        slot.copy_from_slice(data);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

// ── File-backed device ──────────────────────────────────────────────────────

/// File-backed block device using positional `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and needs no shared seek
/// position.
#[derive(Debug, Clone)]
pub struct FileBlockDevice {
    file: Arc<File>,
    block_size: u64,
    num_blocks: u64,
    writable: bool,
}

impl FileBlockDevice {
    /// Open an existing image. The trailing partial block, if any, is not
    /// addressable.
    pub fn open(path: impl AsRef<Path>, block_size: u64) -> Result<Self> {
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
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            block_size,
            num_blocks: len / block_size,
            writable,
        })
    }

    /// Create (or truncate) an image of exactly `num_blocks` blocks.
    pub fn create(path: impl AsRef<Path>, block_size: u64, num_blocks: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(block_size * num_blocks)?;
        Ok(Self {
            file: Arc::new(file),
            block_size,
            num_blocks,
            writable: true,
        })
    }

    fn byte_offset(&self, addr: BlockAddr) -> Result<u64> {
        if addr.0 >= self.num_blocks {
            return Err(out_of_range(addr, self.num_blocks));
        }
        addr.0.checked_mul(self.block_size).ok_or_else(|| {
            HalfsError::Device(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block offset overflows u64",
            ))
        })
    }
}

impl BlockDevice for FileBlockDevice {
    fn block_size(&self) -> u64 {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn read_block(&self, addr: BlockAddr) -> Result<BlockBuf> {
        let offset = self.byte_offset(addr)?;
        let mut buf = vec![0_u8; usize::try_from(self.block_size).expect("block size fits")];
        self.file.read_exact_at(&mut buf, offset)?;
        trace!(target: "halfs::block", event = "read", addr = addr.0);
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, addr: BlockAddr, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(HalfsError::Device(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "device opened read-only",
            )));
        }
        if data.len() as u64 != self.block_size {
            return Err(bad_write_len(data.len(), self.block_size));
        }
        let offset = self.byte_offset(addr)?;
        self.file.write_all_at(data, offset)?;
        trace!(target: "halfs::block", event = "write", addr = addr.0);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

// ── Clock capability ────────────────────────────────────────────────────────

/// Source of timestamps for inode metadata.
///
/// Production uses `SystemClock`; deterministic tests substitute
/// `StepClock`, whose reported time advances by one second per call.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp::new(elapsed.as_secs(), elapsed.subsec_nanos())
    }
}

/// Deterministic step-counter clock. Each `now` call returns a strictly
/// later second.
#[derive(Debug, Default)]
pub struct StepClock {
    steps: AtomicU64,
}

impl StepClock {
    #[must_use]
    pub fn starting_at(secs: u64) -> Self {
        Self {
            steps: AtomicU64::new(secs),
        }
    }
}

impl Clock for StepClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.steps.fetch_add(1, Ordering::Relaxed), 0)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
