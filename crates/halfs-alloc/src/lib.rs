#![forbid(unsafe_code)]
//! Free-space tracking: the block map.
//!
//! The map keeps two redundant views of free space:
//!
//! 1. **Bitmap** — one bit per device block, `true` = used.
//! 2. **Free-extent tree** — an ordered set of `(base, len)` extents keyed
//!    by base, with a secondary size index for the "smallest sufficient
//!    extent" query. Release coalesces with base-adjacent neighbors.
//!
//! The map persists as a header plus the raw bit array in the blocks
//! immediately after the superblock; the extent tree is rebuilt from the
//! bit array on load. Blocks holding the map itself (and block 0) are
//! permanently marked used and never returned by allocation.

use halfs_block::BlockDevice;
use halfs_error::{HalfsError, Result};
use halfs_types::{
    BlockAddr, ceil_div, ensure_slice, expect_magic, put_be_u64, read_be_u64, u64_to_usize,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// Magic prefix of the persisted map header.
const MAP_MAGIC: &[u8; 8] = b"HALFSMAP";

/// Serialized header: magic + num_blocks + reserved + num_free.
const MAP_HEADER_LEN: u64 = 32;

// ── Extents and allocation results ──────────────────────────────────────────

/// Contiguous run of blocks `[base, base + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub base: u64,
    pub len: u64,
}

impl Extent {
    #[must_use]
    pub fn new(base: u64, len: u64) -> Self {
        Self { base, len }
    }

    #[must_use]
    pub fn end(self) -> u64 {
        self.base + self.len
    }
}

/// Result of a multi-block allocation: one extent, or a concatenation of
/// extents when no single free run was large enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockGroup {
    Contig(Extent),
    Discontig(Vec<Extent>),
}

impl BlockGroup {
    /// The extents making up this group, in allocation order.
    #[must_use]
    pub fn extents(&self) -> &[Extent] {
        match self {
            Self::Contig(extent) => std::slice::from_ref(extent),
            Self::Discontig(extents) => extents,
        }
    }

    /// Total number of blocks in the group.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.extents().iter().map(|e| e.len).sum()
    }

    /// Enumerate every block address in the group, in order. The stream
    /// layer uses this to distribute allocated blocks across carriers.
    pub fn blocks(&self) -> impl Iterator<Item = BlockAddr> + '_ {
        self.extents()
            .iter()
            .flat_map(|e| (e.base..e.end()).map(BlockAddr))
    }
}

// ── Bitmap ──────────────────────────────────────────────────────────────────

/// Used/free bit array, one bit per block. `true` = used. Bit `i` lives at
/// byte `i / 8`, bit `i % 8` (LSB first), which is also the on-disk layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bytes: Vec<u8>,
    len: u64,
}

impl Bitmap {
    /// All-free bitmap of `len` bits.
    #[must_use]
    pub fn new(len: u64) -> Self {
        let nbytes = u64_to_usize(ceil_div(len, 8), "bitmap length").expect("bitmap fits memory");
        Self {
            bytes: vec![0_u8; nbytes],
            len,
        }
    }

    /// Reconstruct from on-disk bytes. Unused trailing bits must be zero.
    pub fn from_bytes(bytes: &[u8], len: u64) -> Result<Self> {
        let nbytes = u64_to_usize(ceil_div(len, 8), "bitmap length")
            .map_err(|e| HalfsError::CorruptBlockMap(e.to_string()))?;
        if bytes.len() < nbytes {
            return Err(HalfsError::CorruptBlockMap(format!(
                "bit array truncated: need {nbytes} bytes, got {}",
                bytes.len()
            )));
        }
        let bitmap = Self {
            bytes: bytes[..nbytes].to_vec(),
            len,
        };
        let tail_bits = nbytes as u64 * 8 - len;
        if tail_bits > 0 {
            let last = bitmap.bytes[nbytes - 1];
            if last >> (8 - tail_bits) != 0 {
                return Err(HalfsError::CorruptBlockMap(
                    "nonzero bits past end of bit array".into(),
                ));
            }
        }
        Ok(bitmap)
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn get(&self, idx: u64) -> bool {
        debug_assert!(idx < self.len);
        let byte = (idx / 8) as usize;
        (self.bytes[byte] >> (idx % 8)) & 1 == 1
    }

    pub fn set(&mut self, idx: u64) {
        debug_assert!(idx < self.len);
        let byte = (idx / 8) as usize;
        self.bytes[byte] |= 1 << (idx % 8);
    }

    pub fn clear(&mut self, idx: u64) {
        debug_assert!(idx < self.len);
        let byte = (idx / 8) as usize;
        self.bytes[byte] &= !(1 << (idx % 8));
    }

    /// Count free (zero) bits.
    #[must_use]
    pub fn count_zeros(&self) -> u64 {
        let full_bytes = (self.len / 8) as usize;
        let remainder = self.len % 8;
        let mut free: u64 = self
            .bytes
            .iter()
            .take(full_bytes)
            .map(|b| u64::from(b.count_zeros() as u8))
            .sum();
        if remainder > 0 {
            let byte = self.bytes[full_bytes];
            for bit in 0..remainder {
                if (byte >> bit) & 1 == 0 {
                    free += 1;
                }
            }
        }
        free
    }

    /// On-disk representation.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Maximal runs of free bits, in ascending base order.
    #[must_use]
    pub fn free_runs(&self) -> Vec<Extent> {
        let mut runs = Vec::new();
        let mut run_start = None;
        for idx in 0..self.len {
            match (self.get(idx), run_start) {
                (false, None) => run_start = Some(idx),
                (true, Some(start)) => {
                    runs.push(Extent::new(start, idx - start));
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            runs.push(Extent::new(start, self.len - start));
        }
        runs
    }
}

// ── Block map ───────────────────────────────────────────────────────────────

/// Free-space map for one device.
///
/// Invariants:
/// - a bit is set iff no free extent covers that block;
/// - extents are non-empty, disjoint, and never adjacent;
/// - `num_free` equals both the zero-bit count and the extent length sum;
/// - blocks `[0, reserved)` are permanently used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMap {
    num_blocks: u64,
    num_free: u64,
    /// Superblock plus the map's own storage: blocks `[0, reserved)`.
    reserved: u64,
    used: Bitmap,
    by_base: BTreeMap<u64, u64>,
    by_size: BTreeMap<u64, BTreeSet<u64>>,
}

impl BlockMap {
    // ── Construction and persistence ────────────────────────────────────

    /// Build an empty map sized to `dev`, mark its own storage used, and
    /// persist the initial state.
    pub fn create(dev: &dyn BlockDevice) -> Result<Self> {
        let num_blocks = dev.num_blocks();
        let block_size = dev.block_size();
        let reserved = 1 + Self::storage_blocks(num_blocks, block_size);
        if reserved >= num_blocks {
            return Err(HalfsError::Unsupported(format!(
                "device of {num_blocks} blocks cannot hold a {reserved}-block map region"
            )));
        }

        let mut used = Bitmap::new(num_blocks);
        for idx in 0..reserved {
            used.set(idx);
        }

        let mut map = Self {
            num_blocks,
            num_free: num_blocks - reserved,
            reserved,
            used,
            by_base: BTreeMap::new(),
            by_size: BTreeMap::new(),
        };
        map.insert_extent(reserved, num_blocks - reserved);
        map.flush(dev)?;
        debug!(
            target: "halfs::alloc",
            event = "map_created",
            num_blocks,
            reserved,
            free = map.num_free
        );
        Ok(map)
    }

    /// Load a persisted map and verify its invariants.
    pub fn load(dev: &dyn BlockDevice) -> Result<Self> {
        let num_blocks = dev.num_blocks();
        let block_size = dev.block_size();
        let storage_blocks = Self::storage_blocks(num_blocks, block_size);

        let mut raw = Vec::new();
        for idx in 0..storage_blocks {
            raw.extend_from_slice(dev.read_block(BlockAddr(1 + idx))?.as_slice());
        }

        expect_magic(&raw, 0, MAP_MAGIC).map_err(corrupt)?;
        let stored_blocks = read_be_u64(&raw, 8).map_err(corrupt)?;
        let reserved = read_be_u64(&raw, 16).map_err(corrupt)?;
        let num_free = read_be_u64(&raw, 24).map_err(corrupt)?;

        if stored_blocks != num_blocks {
            return Err(HalfsError::CorruptBlockMap(format!(
                "map covers {stored_blocks} blocks but device has {num_blocks}"
            )));
        }
        if reserved != 1 + storage_blocks {
            return Err(HalfsError::CorruptBlockMap(format!(
                "reserved region is {reserved} blocks, expected {}",
                1 + storage_blocks
            )));
        }

        let header_len = u64_to_usize(MAP_HEADER_LEN, "header").expect("small");
        let bits = ensure_slice(&raw, header_len, raw.len() - header_len).map_err(corrupt)?;
        let used = Bitmap::from_bytes(bits, num_blocks)?;

        for idx in 0..reserved {
            if !used.get(idx) {
                return Err(HalfsError::CorruptBlockMap(format!(
                    "reserved block {idx} marked free"
                )));
            }
        }
        let zeros = used.count_zeros();
        if zeros != num_free {
            return Err(HalfsError::CorruptBlockMap(format!(
                "free count {num_free} disagrees with bit array ({zeros} clear bits)"
            )));
        }

        let mut map = Self {
            num_blocks,
            num_free,
            reserved,
            used,
            by_base: BTreeMap::new(),
            by_size: BTreeMap::new(),
        };
        for run in map.used.free_runs() {
            map.insert_extent(run.base, run.len);
        }
        debug!(
            target: "halfs::alloc",
            event = "map_loaded",
            num_blocks,
            free = map.num_free,
            extents = map.by_base.len()
        );
        Ok(map)
    }

    /// Persist the header and bit array to the map's storage blocks.
    ///
    /// Callers must flush before writing any carrier that adopts newly
    /// allocated blocks.
    pub fn flush(&self, dev: &dyn BlockDevice) -> Result<()> {
        let block_size = u64_to_usize(dev.block_size(), "block size").expect("block size fits");
        let mut raw = Vec::with_capacity(
            u64_to_usize(MAP_HEADER_LEN, "header").expect("small") + self.used.as_bytes().len(),
        );
        raw.extend_from_slice(MAP_MAGIC);
        put_be_u64(&mut raw, self.num_blocks);
        put_be_u64(&mut raw, self.reserved);
        put_be_u64(&mut raw, self.num_free);
        raw.extend_from_slice(self.used.as_bytes());
        raw.resize(raw.len().next_multiple_of(block_size), 0);

        for (idx, chunk) in raw.chunks(block_size).enumerate() {
            dev.write_block(BlockAddr(1 + idx as u64), chunk)?;
        }
        Ok(())
    }

    /// Blocks needed to store the serialized map for a device geometry.
    fn storage_blocks(num_blocks: u64, block_size: u64) -> u64 {
        ceil_div(MAP_HEADER_LEN + ceil_div(num_blocks, 8), block_size)
    }

    // ── Allocation ──────────────────────────────────────────────────────

    /// Allocate a single block: the first block of the lowest-based free
    /// extent. Returns `None` when nothing is free.
    pub fn alloc1(&mut self) -> Option<BlockAddr> {
        let (&base, &len) = self.by_base.first_key_value()?;
        self.remove_extent(base, len);
        if len > 1 {
            self.insert_extent(base + 1, len - 1);
        }
        self.mark_used(base, 1);
        self.num_free -= 1;
        trace!(target: "halfs::alloc", event = "alloc1", addr = base);
        Some(BlockAddr(base))
    }

    /// Allocate `n` blocks.
    ///
    /// Prefers the smallest free extent that satisfies `n` contiguously
    /// (lowest base on ties); otherwise concatenates extents from smallest
    /// upward. Returns `None` if fewer than `n` blocks are free, leaving
    /// the map untouched.
    pub fn alloc_blocks(&mut self, n: u64) -> Option<BlockGroup> {
        assert!(n > 0, "alloc_blocks of zero blocks");
        if self.num_free < n {
            return None;
        }

        let sufficient = self
            .by_size
            .range(n..)
            .next()
            .map(|(&size, bases)| (size, smallest_base(bases)));
        if let Some((size, base)) = sufficient {
            self.remove_extent(base, size);
            if size > n {
                self.insert_extent(base + n, size - n);
            }
            self.mark_used(base, n);
            self.num_free -= n;
            trace!(target: "halfs::alloc", event = "alloc_contig", base, len = n);
            return Some(BlockGroup::Contig(Extent::new(base, n)));
        }

        // No single extent suffices: concatenate from smallest upward.
        let mut parts = Vec::new();
        let mut remaining = n;
        while remaining > 0 {
            let (size, base) = {
                let (&size, bases) = self
                    .by_size
                    .first_key_value()
                    .expect("num_free >= n guarantees extents remain");
                (size, smallest_base(bases))
            };
            let take = size.min(remaining);
            self.remove_extent(base, size);
            if size > take {
                self.insert_extent(base + take, size - take);
            }
            self.mark_used(base, take);
            parts.push(Extent::new(base, take));
            remaining -= take;
        }
        self.num_free -= n;
        trace!(
            target: "halfs::alloc",
            event = "alloc_discontig",
            len = n,
            extents = parts.len()
        );
        Some(BlockGroup::Discontig(parts))
    }

    /// Return every extent of `group` to the free set, coalescing with
    /// adjacent free extents.
    ///
    /// Unallocating an already-free block is a programming error and fails
    /// loudly with `DoubleFree`, leaving the map untouched.
    pub fn unalloc_blocks(&mut self, group: &BlockGroup) -> Result<()> {
        // Validate every block before mutating anything.
        for extent in group.extents() {
            assert!(extent.len > 0, "unalloc of empty extent");
            assert!(
                extent.base >= self.reserved && extent.end() <= self.num_blocks,
                "unalloc outside the allocatable region"
            );
            for addr in extent.base..extent.end() {
                if !self.used.get(addr) {
                    return Err(HalfsError::DoubleFree { addr });
                }
            }
        }

        for extent in group.extents() {
            for addr in extent.base..extent.end() {
                assert!(self.used.get(addr), "duplicate extent within block group");
                self.used.clear(addr);
            }
            self.insert_free(extent.base, extent.len);
            self.num_free += extent.len;
        }
        trace!(
            target: "halfs::alloc",
            event = "unalloc",
            len = group.block_count()
        );
        Ok(())
    }

    // ── Stats ───────────────────────────────────────────────────────────

    #[must_use]
    pub fn num_free(&self) -> u64 {
        self.num_free
    }

    #[must_use]
    pub fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    /// Blocks `[0, reserved)`: superblock plus map storage.
    #[must_use]
    pub fn reserved_blocks(&self) -> u64 {
        self.reserved
    }

    #[must_use]
    pub fn free_extent_count(&self) -> usize {
        self.by_base.len()
    }

    /// Snapshot of the free set, ascending by base.
    #[must_use]
    pub fn free_extents(&self) -> Vec<Extent> {
        self.by_base
            .iter()
            .map(|(&base, &len)| Extent::new(base, len))
            .collect()
    }

    // ── Extent-set maintenance ──────────────────────────────────────────

    fn mark_used(&mut self, base: u64, len: u64) {
        for addr in base..base + len {
            debug_assert!(!self.used.get(addr));
            self.used.set(addr);
        }
    }

    /// Insert a freed run, merging with the base-adjacent predecessor and
    /// successor.
    fn insert_free(&mut self, base: u64, len: u64) {
        let mut base = base;
        let mut len = len;
        let pred = self
            .by_base
            .range(..base)
            .next_back()
            .map(|(&b, &l)| (b, l));
        if let Some((prev_base, prev_len)) = pred {
            debug_assert!(prev_base + prev_len <= base);
            if prev_base + prev_len == base {
                self.remove_extent(prev_base, prev_len);
                base = prev_base;
                len += prev_len;
            }
        }
        let succ = self.by_base.get(&(base + len)).copied();
        if let Some(next_len) = succ {
            self.remove_extent(base + len, next_len);
            len += next_len;
        }
        self.insert_extent(base, len);
    }

    fn insert_extent(&mut self, base: u64, len: u64) {
        debug_assert!(len > 0);
        self.by_base.insert(base, len);
        self.by_size.entry(len).or_default().insert(base);
    }

    fn remove_extent(&mut self, base: u64, len: u64) {
        self.by_base.remove(&base);
        let bases = self.by_size.get_mut(&len).expect("size index out of sync");
        bases.remove(&base);
        if bases.is_empty() {
            self.by_size.remove(&len);
        }
    }
}

fn corrupt(err: halfs_types::CodecError) -> HalfsError {
    HalfsError::CorruptBlockMap(err.to_string())
}

fn smallest_base(bases: &BTreeSet<u64>) -> u64 {
    *bases.iter().next().expect("size index entry is non-empty")
}

// ── Tests ───────────────────────────────────────────────────────────────────
