#![forbid(unsafe_code)]
//! Halfs: a block-structured file system storage engine.
//!
//! The engine owns three subsystems: the block map (free-space
//! allocation), inode/continuation chains (per-file block lists), and the
//! stream layer (byte-granular reads and writes). This crate ties them
//! together behind the `Halfs` handle: one mutex per mounted filesystem,
//! a pluggable clock, and the file-size/mtime policy the stream layer
//! leaves to its caller.
//!
//! There is no global state; every mounted filesystem is an explicit
//! handle.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

pub use halfs_alloc::{BlockGroup, BlockMap, Extent};
pub use halfs_block::{
    BlockBuf, BlockDevice, Clock, FileBlockDevice, MemBlockDevice, StepClock, SystemClock,
};
pub use halfs_error::{HalfsError, RecordKind, Result};
pub use halfs_inode::{
    Carrier, CarrierGeometry, Continuation, Inode, build_empty_inode_enc, dref_cont, dref_inode,
    expand_chain, write_carrier,
};
pub use halfs_stream::{StreamIdx, TRUNC_SENTINEL, decompose, read_stream, write_stream};
pub use halfs_types::{BlockAddr, ContRef, InodeRef, NIL_ADDR, Timestamp};

// ── Engine handle ───────────────────────────────────────────────────────────

/// Read-only allocator snapshot for callers and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub block_size: u64,
    pub num_blocks: u64,
    pub num_free: u64,
    pub reserved_blocks: u64,
}

/// One mounted Halfs filesystem.
///
/// All operations serialize on a single process-wide lock per handle:
/// the engine is single-writer, single-reader by design. Generic over
/// the clock so deterministic hosts can substitute a step counter.
pub struct Halfs<C: Clock = SystemClock> {
    dev: Arc<dyn BlockDevice>,
    geo: CarrierGeometry,
    clock: C,
    map: Mutex<BlockMap>,
}

impl<C: Clock> std::fmt::Debug for Halfs<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Halfs")
            .field("geo", &self.geo)
            .field("map", &self.map)
            .finish_non_exhaustive()
    }
}

impl<C: Clock> Halfs<C> {
    /// Lay a fresh filesystem onto `dev`: a new block map and an empty
    /// root inode. Returns the handle and the root's inode ref.
    pub fn format(dev: Arc<dyn BlockDevice>, clock: C) -> Result<(Self, InodeRef)> {
        let geo = CarrierGeometry::derive(dev.block_size())?;
        let mut map = BlockMap::create(dev.as_ref())?;
        let root_addr = map.alloc1().ok_or(HalfsError::AllocFailed {
            requested: 1,
            free: 0,
        })?;
        map.flush(dev.as_ref())?;

        let root = InodeRef(root_addr.0);
        let bytes = build_empty_inode_enc(&geo, root, InodeRef::NIL, 0, 0, clock.now());
        dev.write_block(root.addr(), &bytes)?;
        info!(
            target: "halfs",
            event = "format",
            num_blocks = dev.num_blocks(),
            block_size = dev.block_size(),
            root = root.0
        );

        Ok((
            Self {
                dev,
                geo,
                clock,
                map: Mutex::new(map),
            },
            root,
        ))
    }

    /// Mount an existing filesystem: load and validate the persisted
    /// block map.
    pub fn open(dev: Arc<dyn BlockDevice>, clock: C) -> Result<Self> {
        let geo = CarrierGeometry::derive(dev.block_size())?;
        let map = BlockMap::load(dev.as_ref())?;
        info!(
            target: "halfs",
            event = "open",
            num_blocks = dev.num_blocks(),
            free = map.num_free()
        );
        Ok(Self {
            dev,
            geo,
            clock,
            map: Mutex::new(map),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &CarrierGeometry {
        &self.geo
    }

    #[must_use]
    pub fn stats(&self) -> FsStats {
        let map = self.map.lock();
        FsStats {
            block_size: self.dev.block_size(),
            num_blocks: map.num_blocks(),
            num_free: map.num_free(),
            reserved_blocks: map.reserved_blocks(),
        }
    }

    /// Allocate and persist an empty inode. `parent` is nil for the root;
    /// the directory layer records the ref.
    pub fn new_file(&self, parent: InodeRef, user: u32, group: u32) -> Result<InodeRef> {
        let mut map = self.map.lock();
        let free = map.num_free();
        let addr = map
            .alloc1()
            .ok_or(HalfsError::AllocFailed { requested: 1, free })?;
        map.flush(self.dev.as_ref())?;

        let iref = InodeRef(addr.0);
        let bytes = build_empty_inode_enc(&self.geo, iref, parent, user, group, self.clock.now());
        self.dev.write_block(iref.addr(), &bytes)?;
        Ok(iref)
    }

    /// The head inode's current metadata.
    pub fn stat(&self, iref: InodeRef) -> Result<Inode> {
        let _map = self.map.lock();
        dref_inode(self.dev.as_ref(), &self.geo, iref)
    }

    /// Read up to `max_len` bytes at `offset`, trimmed to the file size.
    pub fn read(&self, iref: InodeRef, offset: u64, max_len: Option<u64>) -> Result<Vec<u8>> {
        let _map = self.map.lock();
        let inode = dref_inode(self.dev.as_ref(), &self.geo, iref)?;
        let size = inode.size();
        if offset >= size {
            return Ok(Vec::new());
        }
        let limit = size - offset;
        let want = max_len.map_or(limit, |m| m.min(limit));
        read_stream(self.dev.as_ref(), &self.geo, iref, offset, Some(want))
    }

    /// Write `data` at `offset`, then update the head inode's size and
    /// modification time. A truncating write makes `offset + len` the new
    /// end of file.
    pub fn write(&self, iref: InodeRef, offset: u64, truncating: bool, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut map = self.map.lock();
        write_stream(
            self.dev.as_ref(),
            &mut map,
            &self.geo,
            iref,
            offset,
            truncating,
            data,
        )?;

        // The stream layer rewrote the chain; re-read the head before
        // stamping size and mtime.
        let inode = dref_inode(self.dev.as_ref(), &self.geo, iref)?;
        let end = offset + data.len() as u64;
        let new_size = if truncating {
            end
        } else {
            inode.size().max(end)
        };
        let mtime = self.clock.now().max(inode.ctime());
        let updated = inode.with_size(new_size).with_mtime(mtime);
        write_carrier(self.dev.as_ref(), &self.geo, &Carrier::Inode(updated))
    }

    /// Shrink the file to `new_len` bytes, reclaiming the dropped tail.
    /// Growing is not supported; a `new_len` at or past the current size
    /// is a no-op.
    pub fn truncate(&self, iref: InodeRef, new_len: u64) -> Result<()> {
        let mut map = self.map.lock();
        let inode = dref_inode(self.dev.as_ref(), &self.geo, iref)?;
        if new_len >= inode.size() {
            return Ok(());
        }

        if new_len == 0 {
            // Free the whole chain: every data block plus the continuation
            // carrier blocks themselves.
            let chain = expand_chain(self.dev.as_ref(), &self.geo, inode.clone(), None)?;
            let mut freed: Vec<Extent> = Vec::new();
            for carrier in &chain {
                for addr in carrier.blocks() {
                    freed.push(Extent::new(addr.0, 1));
                }
                if carrier.as_inode().is_none() {
                    freed.push(Extent::new(carrier.addr().0, 1));
                }
            }
            let ctime = inode.ctime();
            let reset = inode
                .with_blocks(Vec::new())
                .with_cont(ContRef::NIL)
                .with_size(0)
                .with_mtime(self.clock.now().max(ctime));
            write_carrier(self.dev.as_ref(), &self.geo, &Carrier::Inode(reset))?;
            if !freed.is_empty() {
                map.unalloc_blocks(&BlockGroup::Discontig(freed))?;
                map.flush(self.dev.as_ref())?;
            }
            return Ok(());
        }

        // Rewrite the final surviving byte as a truncating write; the
        // stream layer reclaims everything past it.
        let tail = read_stream(self.dev.as_ref(), &self.geo, iref, new_len - 1, Some(1))?;
        write_stream(
            self.dev.as_ref(),
            &mut map,
            &self.geo,
            iref,
            new_len - 1,
            true,
            &tail,
        )?;
        let inode = dref_inode(self.dev.as_ref(), &self.geo, iref)?;
        let mtime = self.clock.now().max(inode.ctime());
        let updated = inode.with_size(new_len).with_mtime(mtime);
        write_carrier(self.dev.as_ref(), &self.geo, &Carrier::Inode(updated))
    }

    /// Persist the block map and flush the device.
    pub fn flush(&self) -> Result<()> {
        let map = self.map.lock();
        map.flush(self.dev.as_ref())?;
        self.dev.flush()
    }
}
