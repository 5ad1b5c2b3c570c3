#![forbid(unsafe_code)]
//! Inode and continuation records.
//!
//! A file is one `Inode` block followed by a singly-linked chain of
//! `Continuation` blocks, each carrying a slice of the file's block
//! address list. Records serialize to exactly one device block: four
//! 8-byte magic segments interspersed with the fields, the address list
//! nil-padded to the record's capacity, then seven `0xAD` padding bytes.
//!
//! Capacity is *transient*: it is derived from the device block size via
//! `CarrierGeometry` and repopulated on every decode, never persisted.

use halfs_block::BlockDevice;
use halfs_error::{HalfsError, RecordKind, Result};
use halfs_types::{
    BlockAddr, CodecError, ContRef, InodeRef, Timestamp, ensure_slice, expect_magic, put_be_u32,
    put_be_u64, read_be_u32, read_be_u64, u64_to_usize,
};
use serde::{Deserialize, Serialize};
use tracing::trace;

// ── Constants ───────────────────────────────────────────────────────────────

/// Fewest block addresses any inode must hold.
pub const MIN_INODE_BLOCKS: u64 = 48;

/// Fewest block addresses any continuation must hold.
pub const MIN_CONT_BLOCKS: u64 = 56;

/// Fill byte of the reserved trailing region of each serialized record.
pub const PAD_SENTINEL: u8 = 0xAD;

const PAD_LEN: usize = 7;

const INODE_MAGIC: &[u8; 32] = b"This is a halfs inode structure!";
const CONT_MAGIC: &[u8; 32] = b"This is a halfs cont structure!!";

const TAG_INODE: u8 = b'I';
const TAG_CONT: u8 = b'C';

fn magic_seg(magic: &[u8; 32], seg: usize) -> &[u8; 8] {
    magic[seg * 8..seg * 8 + 8]
        .try_into()
        .expect("magic segment is 8 bytes")
}

// ── Carrier geometry ────────────────────────────────────────────────────────

/// Per-device record capacities, derived once from the block size.
///
/// The fixed overhead of each record shape is measured by serializing an
/// empty record with the minimum address list; whatever block space
/// remains is handed to the list, eight bytes per address. Continuations
/// carry less metadata, so they always hold strictly more addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarrierGeometry {
    block_size: u64,
    inode_capacity: u64,
    cont_capacity: u64,
}

impl CarrierGeometry {
    pub fn derive(block_size: u64) -> Result<Self> {
        let probe_time = Timestamp::ZERO;
        let probe_inode = Inode {
            addr: InodeRef::NIL,
            parent: InodeRef::NIL,
            cont: ContRef::NIL,
            size: 0,
            ctime: probe_time,
            mtime: probe_time,
            user: 0,
            group: 0,
            blocks: Vec::new(),
            capacity: MIN_INODE_BLOCKS,
        };
        let inode_overhead = probe_inode.encode_body().len() as u64 - 8 * MIN_INODE_BLOCKS;

        let probe_cont = Continuation {
            addr: ContRef::NIL,
            next: ContRef::NIL,
            blocks: Vec::new(),
            capacity: MIN_CONT_BLOCKS,
        };
        let cont_overhead = probe_cont.encode_body().len() as u64 - 8 * MIN_CONT_BLOCKS;

        let inode_capacity = block_size.saturating_sub(inode_overhead) / 8;
        let cont_capacity = block_size.saturating_sub(cont_overhead) / 8;
        if inode_capacity < MIN_INODE_BLOCKS || cont_capacity < MIN_CONT_BLOCKS {
            return Err(HalfsError::Unsupported(format!(
                "block size {block_size} too small for carrier records \
                 (minimum {} bytes)",
                cont_overhead + 8 * MIN_CONT_BLOCKS
            )));
        }
        debug_assert!(cont_capacity > inode_capacity);

        Ok(Self {
            block_size,
            inode_capacity,
            cont_capacity,
        })
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Addresses a primary inode block holds.
    #[must_use]
    pub fn inode_capacity(&self) -> u64 {
        self.inode_capacity
    }

    /// Addresses a continuation block holds.
    #[must_use]
    pub fn cont_capacity(&self) -> u64 {
        self.cont_capacity
    }
}

// ── Inode record ────────────────────────────────────────────────────────────

/// Metadata-bearing head record of a file's block list.
///
/// Records are immutable values; the `with_*` builders produce an edited
/// copy. `capacity` is transient and set by the constructor or decoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    addr: InodeRef,
    parent: InodeRef,
    cont: ContRef,
    size: u64,
    ctime: Timestamp,
    mtime: Timestamp,
    user: u32,
    group: u32,
    blocks: Vec<BlockAddr>,
    #[serde(skip)]
    capacity: u64,
}

impl Inode {
    /// In-memory empty inode. Allocates nothing; `addr` is the block the
    /// caller has set aside for it, `parent` is nil for the root.
    #[must_use]
    pub fn new_empty(
        geo: &CarrierGeometry,
        addr: InodeRef,
        parent: InodeRef,
        user: u32,
        group: u32,
        now: Timestamp,
    ) -> Self {
        Self {
            addr,
            parent,
            cont: ContRef::NIL,
            size: 0,
            ctime: now,
            mtime: now,
            user,
            group,
            blocks: Vec::new(),
            capacity: geo.inode_capacity(),
        }
    }

    #[must_use]
    pub fn addr(&self) -> InodeRef {
        self.addr
    }

    #[must_use]
    pub fn parent(&self) -> InodeRef {
        self.parent
    }

    #[must_use]
    pub fn cont(&self) -> ContRef {
        self.cont
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn ctime(&self) -> Timestamp {
        self.ctime
    }

    #[must_use]
    pub fn mtime(&self) -> Timestamp {
        self.mtime
    }

    #[must_use]
    pub fn user(&self) -> u32 {
        self.user
    }

    #[must_use]
    pub fn group(&self) -> u32 {
        self.group
    }

    #[must_use]
    pub fn blocks(&self) -> &[BlockAddr] {
        &self.blocks
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.blocks.len() as u64
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Set the modification time. The chain invariant `mtime >= ctime`
    /// must hold.
    #[must_use]
    pub fn with_mtime(mut self, mtime: Timestamp) -> Self {
        debug_assert!(mtime >= self.ctime);
        self.mtime = mtime;
        self
    }

    #[must_use]
    pub fn with_cont(mut self, cont: ContRef) -> Self {
        self.cont = cont;
        self
    }

    #[must_use]
    pub fn with_blocks(mut self, blocks: Vec<BlockAddr>) -> Self {
        assert!(blocks.len() as u64 <= self.capacity, "block list overflow");
        self.blocks = blocks;
        self
    }

    /// Serialize to exactly one device block.
    #[must_use]
    pub fn encode(&self, geo: &CarrierGeometry) -> Vec<u8> {
        debug_assert_eq!(self.capacity, geo.inode_capacity());
        let mut buf = self.encode_body();
        let block_size = u64_to_usize(geo.block_size(), "block size").expect("block size fits");
        debug_assert!(buf.len() <= block_size);
        buf.resize(block_size, 0);
        buf
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(TAG_INODE);
        buf.extend_from_slice(magic_seg(INODE_MAGIC, 0));
        put_be_u64(&mut buf, self.addr.0);
        put_be_u64(&mut buf, self.parent.0);
        buf.extend_from_slice(magic_seg(INODE_MAGIC, 1));
        put_be_u64(&mut buf, self.size);
        put_be_u64(&mut buf, self.ctime.secs);
        put_be_u32(&mut buf, self.ctime.nsecs);
        put_be_u64(&mut buf, self.mtime.secs);
        put_be_u32(&mut buf, self.mtime.nsecs);
        put_be_u32(&mut buf, self.user);
        put_be_u32(&mut buf, self.group);
        buf.extend_from_slice(magic_seg(INODE_MAGIC, 2));
        put_be_u64(&mut buf, self.cont.0);
        put_be_u64(&mut buf, self.block_count());
        buf.extend_from_slice(magic_seg(INODE_MAGIC, 3));
        put_block_list(&mut buf, &self.blocks, self.capacity);
        buf.extend_from_slice(&[PAD_SENTINEL; PAD_LEN]);
        buf
    }

    fn decode(bytes: &[u8], geo: &CarrierGeometry, addr: BlockAddr) -> Result<Self> {
        let fail = |source: CodecError| HalfsError::DecodeFail {
            kind: RecordKind::Inode,
            addr: addr.0,
            source,
        };

        expect_magic(bytes, 1, magic_seg(INODE_MAGIC, 0)).map_err(fail)?;
        let self_addr = read_be_u64(bytes, 9).map_err(fail)?;
        let parent = read_be_u64(bytes, 17).map_err(fail)?;
        expect_magic(bytes, 25, magic_seg(INODE_MAGIC, 1)).map_err(fail)?;
        let size = read_be_u64(bytes, 33).map_err(fail)?;
        let ctime = Timestamp::new(
            read_be_u64(bytes, 41).map_err(fail)?,
            read_be_u32(bytes, 49).map_err(fail)?,
        );
        let mtime = Timestamp::new(
            read_be_u64(bytes, 53).map_err(fail)?,
            read_be_u32(bytes, 61).map_err(fail)?,
        );
        let user = read_be_u32(bytes, 65).map_err(fail)?;
        let group = read_be_u32(bytes, 69).map_err(fail)?;
        expect_magic(bytes, 73, magic_seg(INODE_MAGIC, 2)).map_err(fail)?;
        let cont = read_be_u64(bytes, 81).map_err(fail)?;
        let count = read_be_u64(bytes, 89).map_err(fail)?;
        expect_magic(bytes, 97, magic_seg(INODE_MAGIC, 3)).map_err(fail)?;

        if self_addr != addr.0 {
            return Err(fail(CodecError::InvalidField {
                field: "self_address",
                reason: "does not match block location",
            }));
        }
        if mtime < ctime {
            return Err(fail(CodecError::InvalidField {
                field: "mtime",
                reason: "precedes ctime",
            }));
        }

        let capacity = geo.inode_capacity();
        let blocks = read_block_list(bytes, 105, count, capacity).map_err(fail)?;
        check_padding(bytes, 105 + 8 * u64_to_usize(capacity, "capacity").expect("capacity fits"))
            .map_err(fail)?;

        Ok(Self {
            addr: InodeRef(self_addr),
            parent: InodeRef(parent),
            cont: ContRef(cont),
            size,
            ctime,
            mtime,
            user,
            group,
            blocks,
            capacity,
        })
    }
}

// ── Continuation record ─────────────────────────────────────────────────────

/// Metadata-lean successor record extending a file's block list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    addr: ContRef,
    next: ContRef,
    blocks: Vec<BlockAddr>,
    #[serde(skip)]
    capacity: u64,
}

impl Continuation {
    #[must_use]
    pub fn new_empty(geo: &CarrierGeometry, addr: ContRef) -> Self {
        Self {
            addr,
            next: ContRef::NIL,
            blocks: Vec::new(),
            capacity: geo.cont_capacity(),
        }
    }

    #[must_use]
    pub fn addr(&self) -> ContRef {
        self.addr
    }

    #[must_use]
    pub fn next(&self) -> ContRef {
        self.next
    }

    #[must_use]
    pub fn blocks(&self) -> &[BlockAddr] {
        &self.blocks
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.blocks.len() as u64
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn with_next(mut self, next: ContRef) -> Self {
        self.next = next;
        self
    }

    #[must_use]
    pub fn with_blocks(mut self, blocks: Vec<BlockAddr>) -> Self {
        assert!(blocks.len() as u64 <= self.capacity, "block list overflow");
        self.blocks = blocks;
        self
    }

    /// Serialize to exactly one device block.
    #[must_use]
    pub fn encode(&self, geo: &CarrierGeometry) -> Vec<u8> {
        debug_assert_eq!(self.capacity, geo.cont_capacity());
        let mut buf = self.encode_body();
        let block_size = u64_to_usize(geo.block_size(), "block size").expect("block size fits");
        debug_assert!(buf.len() <= block_size);
        buf.resize(block_size, 0);
        buf
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(TAG_CONT);
        buf.extend_from_slice(magic_seg(CONT_MAGIC, 0));
        put_be_u64(&mut buf, self.addr.0);
        buf.extend_from_slice(magic_seg(CONT_MAGIC, 1));
        put_be_u64(&mut buf, self.next.0);
        buf.extend_from_slice(magic_seg(CONT_MAGIC, 2));
        put_be_u64(&mut buf, self.block_count());
        buf.extend_from_slice(magic_seg(CONT_MAGIC, 3));
        put_block_list(&mut buf, &self.blocks, self.capacity);
        buf.extend_from_slice(&[PAD_SENTINEL; PAD_LEN]);
        buf
    }

    fn decode(bytes: &[u8], geo: &CarrierGeometry, addr: BlockAddr) -> Result<Self> {
        let fail = |source: CodecError| HalfsError::DecodeFail {
            kind: RecordKind::Cont,
            addr: addr.0,
            source,
        };

        expect_magic(bytes, 1, magic_seg(CONT_MAGIC, 0)).map_err(fail)?;
        let self_addr = read_be_u64(bytes, 9).map_err(fail)?;
        expect_magic(bytes, 17, magic_seg(CONT_MAGIC, 1)).map_err(fail)?;
        let next = read_be_u64(bytes, 25).map_err(fail)?;
        expect_magic(bytes, 33, magic_seg(CONT_MAGIC, 2)).map_err(fail)?;
        let count = read_be_u64(bytes, 41).map_err(fail)?;
        expect_magic(bytes, 49, magic_seg(CONT_MAGIC, 3)).map_err(fail)?;

        if self_addr != addr.0 {
            return Err(fail(CodecError::InvalidField {
                field: "self_address",
                reason: "does not match block location",
            }));
        }

        let capacity = geo.cont_capacity();
        let blocks = read_block_list(bytes, 57, count, capacity).map_err(fail)?;
        check_padding(bytes, 57 + 8 * u64_to_usize(capacity, "capacity").expect("capacity fits"))
            .map_err(fail)?;

        Ok(Self {
            addr: ContRef(self_addr),
            next: ContRef(next),
            blocks,
            capacity,
        })
    }
}

// ── Shared codec helpers ────────────────────────────────────────────────────

/// Write `blocks` then nil references up to `capacity`.
fn put_block_list(buf: &mut Vec<u8>, blocks: &[BlockAddr], capacity: u64) {
    debug_assert!(blocks.len() as u64 <= capacity);
    for addr in blocks {
        put_be_u64(buf, addr.0);
    }
    for _ in blocks.len() as u64..capacity {
        put_be_u64(buf, halfs_types::NIL_ADDR);
    }
}

fn read_block_list(
    bytes: &[u8],
    offset: usize,
    count: u64,
    capacity: u64,
) -> std::result::Result<Vec<BlockAddr>, CodecError> {
    if count > capacity {
        return Err(CodecError::InvalidField {
            field: "block_count",
            reason: "exceeds capacity",
        });
    }
    let count = u64_to_usize(count, "block_count")?;
    let mut blocks = Vec::with_capacity(count);
    for idx in 0..count {
        let addr = read_be_u64(bytes, offset + 8 * idx)?;
        if addr == halfs_types::NIL_ADDR {
            return Err(CodecError::InvalidField {
                field: "block_list",
                reason: "nil address within counted region",
            });
        }
        blocks.push(BlockAddr(addr));
    }
    Ok(blocks)
}

fn check_padding(bytes: &[u8], offset: usize) -> std::result::Result<(), CodecError> {
    let pad = ensure_slice(bytes, offset, PAD_LEN)?;
    for (idx, &byte) in pad.iter().enumerate() {
        if byte != PAD_SENTINEL {
            return Err(CodecError::BadPadding {
                offset: offset + idx,
            });
        }
    }
    Ok(())
}

// ── Carrier ─────────────────────────────────────────────────────────────────

/// Uniform view over inode and continuation records for the stream layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Carrier {
    Inode(Inode),
    Cont(Continuation),
}

impl Carrier {
    /// Decode one device block into whichever record its tag byte names.
    ///
    /// `addr` is the block the bytes were read from; the record's stored
    /// self-address must agree.
    pub fn decode(bytes: &[u8], geo: &CarrierGeometry, addr: BlockAddr) -> Result<Self> {
        let tag = *bytes.first().ok_or(HalfsError::DecodeFail {
            kind: RecordKind::BlockCarrier,
            addr: addr.0,
            source: CodecError::InsufficientData {
                needed: 1,
                offset: 0,
                actual: 0,
            },
        })?;
        match tag {
            TAG_INODE => Inode::decode(bytes, geo, addr).map(Self::Inode),
            TAG_CONT => Continuation::decode(bytes, geo, addr).map(Self::Cont),
            actual => Err(HalfsError::DecodeFail {
                kind: RecordKind::BlockCarrier,
                addr: addr.0,
                source: CodecError::BadTag { actual },
            }),
        }
    }

    #[must_use]
    pub fn addr(&self) -> BlockAddr {
        match self {
            Self::Inode(inode) => inode.addr().addr(),
            Self::Cont(cont) => cont.addr().addr(),
        }
    }

    /// The continuation link: `cont` for inodes, `next` for continuations.
    #[must_use]
    pub fn next(&self) -> ContRef {
        match self {
            Self::Inode(inode) => inode.cont(),
            Self::Cont(cont) => cont.next(),
        }
    }

    #[must_use]
    pub fn with_next(self, next: ContRef) -> Self {
        match self {
            Self::Inode(inode) => Self::Inode(inode.with_cont(next)),
            Self::Cont(cont) => Self::Cont(cont.with_next(next)),
        }
    }

    #[must_use]
    pub fn blocks(&self) -> &[BlockAddr] {
        match self {
            Self::Inode(inode) => inode.blocks(),
            Self::Cont(cont) => cont.blocks(),
        }
    }

    #[must_use]
    pub fn with_blocks(self, blocks: Vec<BlockAddr>) -> Self {
        match self {
            Self::Inode(inode) => Self::Inode(inode.with_blocks(blocks)),
            Self::Cont(cont) => Self::Cont(cont.with_blocks(blocks)),
        }
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.blocks().len() as u64
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        match self {
            Self::Inode(inode) => inode.capacity(),
            Self::Cont(cont) => cont.capacity(),
        }
    }

    #[must_use]
    pub fn encode(&self, geo: &CarrierGeometry) -> Vec<u8> {
        match self {
            Self::Inode(inode) => inode.encode(geo),
            Self::Cont(cont) => cont.encode(geo),
        }
    }

    #[must_use]
    pub fn as_inode(&self) -> Option<&Inode> {
        match self {
            Self::Inode(inode) => Some(inode),
            Self::Cont(_) => None,
        }
    }
}

// ── Device operations ───────────────────────────────────────────────────────

/// Read and decode the inode block at `iref`.
pub fn dref_inode(dev: &dyn BlockDevice, geo: &CarrierGeometry, iref: InodeRef) -> Result<Inode> {
    assert!(!iref.is_nil(), "dereference of nil inode ref");
    let buf = dev.read_block(iref.addr())?;
    match Carrier::decode(buf.as_slice(), geo, iref.addr())? {
        Carrier::Inode(inode) => Ok(inode),
        Carrier::Cont(_) => Err(HalfsError::DecodeFail {
            kind: RecordKind::Inode,
            addr: iref.0,
            source: CodecError::BadTag { actual: TAG_CONT },
        }),
    }
}

/// Read and decode the continuation block at `cref`.
pub fn dref_cont(
    dev: &dyn BlockDevice,
    geo: &CarrierGeometry,
    cref: ContRef,
) -> Result<Continuation> {
    assert!(!cref.is_nil(), "dereference of nil continuation ref");
    let buf = dev.read_block(cref.addr())?;
    match Carrier::decode(buf.as_slice(), geo, cref.addr())? {
        Carrier::Cont(cont) => Ok(cont),
        Carrier::Inode(_) => Err(HalfsError::DecodeFail {
            kind: RecordKind::Cont,
            addr: cref.0,
            source: CodecError::BadTag { actual: TAG_INODE },
        }),
    }
}

/// Serialize `carrier` and write it at its own address.
pub fn write_carrier(
    dev: &dyn BlockDevice,
    geo: &CarrierGeometry,
    carrier: &Carrier,
) -> Result<()> {
    dev.write_block(carrier.addr(), &carrier.encode(geo))
}

/// Serialize an empty inode straight to one block's worth of bytes.
#[must_use]
pub fn build_empty_inode_enc(
    geo: &CarrierGeometry,
    addr: InodeRef,
    parent: InodeRef,
    user: u32,
    group: u32,
    now: Timestamp,
) -> Vec<u8> {
    Inode::new_empty(geo, addr, parent, user, group, now).encode(geo)
}

/// Follow continuation links from `head`, producing carriers in chain
/// order. `take` bounds how many carriers are materialized (`None` walks
/// to the terminator).
///
/// A chain longer than the device's block count cannot exist without a
/// cycle, so the walk fails with `CorruptChain` at that bound.
pub fn expand_chain(
    dev: &dyn BlockDevice,
    geo: &CarrierGeometry,
    head: Inode,
    take: Option<usize>,
) -> Result<Vec<Carrier>> {
    let max_len = dev.num_blocks();
    let mut carriers = Vec::new();
    let mut next = head.cont();
    carriers.push(Carrier::Inode(head));

    while !next.is_nil() {
        if take.is_some_and(|t| carriers.len() >= t) {
            break;
        }
        if carriers.len() as u64 >= max_len {
            return Err(HalfsError::CorruptChain(format!(
                "chain exceeds device capacity of {max_len} blocks"
            )));
        }
        let cont = dref_cont(dev, geo, next)?;
        next = cont.next();
        carriers.push(Carrier::Cont(cont));
    }
    trace!(
        target: "halfs::inode",
        event = "expand_chain",
        carriers = carriers.len()
    );
    Ok(carriers)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use halfs_block::MemBlockDevice;
    use proptest::prelude::*;

    fn geo512() -> CarrierGeometry {
        CarrierGeometry::derive(512).unwrap()
    }

    fn sample_inode(geo: &CarrierGeometry) -> Inode {
        Inode::new_empty(
            geo,
            InodeRef(5),
            InodeRef::NIL,
            1000,
            100,
            Timestamp::new(1_700_000_000, 250),
        )
        .with_size(3 * 512 + 17)
        .with_cont(ContRef(9))
        .with_blocks(vec![BlockAddr(6), BlockAddr(7), BlockAddr(8), BlockAddr(12)])
    }

    // ── Geometry ────────────────────────────────────────────────────────

    #[test]
    fn capacities_match_layout_for_512() {
        let geo = geo512();
        // Inode fixed overhead is 112 bytes, continuation 64.
        assert_eq!(geo.inode_capacity(), 50);
        assert_eq!(geo.cont_capacity(), 56);
        assert!(geo.cont_capacity() > geo.inode_capacity());
    }

    #[test]
    fn capacities_scale_with_block_size() {
        let geo = CarrierGeometry::derive(4096).unwrap();
        assert_eq!(geo.inode_capacity(), (4096 - 112) / 8);
        assert_eq!(geo.cont_capacity(), (4096 - 64) / 8);
    }

    #[test]
    fn derive_rejects_tiny_blocks() {
        assert!(matches!(
            CarrierGeometry::derive(256),
            Err(HalfsError::Unsupported(_))
        ));
        // 512 is the smallest supported size: the minimum continuation
        // record fills it exactly.
        assert!(CarrierGeometry::derive(512).is_ok());
    }

    // ── Round trips ─────────────────────────────────────────────────────

    #[test]
    fn inode_round_trip() {
        let geo = geo512();
        let inode = sample_inode(&geo);
        let bytes = inode.encode(&geo);
        assert_eq!(bytes.len(), 512);

        let decoded = Carrier::decode(&bytes, &geo, BlockAddr(5)).unwrap();
        assert_eq!(decoded, Carrier::Inode(inode));
        assert_eq!(decoded.capacity(), geo.inode_capacity());
    }

    #[test]
    fn cont_round_trip() {
        let geo = geo512();
        let cont = Continuation::new_empty(&geo, ContRef(9))
            .with_next(ContRef(14))
            .with_blocks((20..30).map(BlockAddr).collect());
        let bytes = cont.encode(&geo);
        assert_eq!(bytes.len(), 512);

        let decoded = Carrier::decode(&bytes, &geo, BlockAddr(9)).unwrap();
        assert_eq!(decoded, Carrier::Cont(cont));
        assert_eq!(decoded.capacity(), geo.cont_capacity());
    }

    #[test]
    fn empty_inode_enc_is_one_decodable_block() {
        let geo = geo512();
        let bytes = build_empty_inode_enc(
            &geo,
            InodeRef(3),
            InodeRef(2),
            0,
            0,
            Timestamp::new(42, 0),
        );
        assert_eq!(bytes.len(), 512);
        let decoded = Carrier::decode(&bytes, &geo, BlockAddr(3)).unwrap();
        assert_eq!(decoded.block_count(), 0);
        assert!(decoded.next().is_nil());
    }

    // ── Corruption detection ────────────────────────────────────────────

    #[test]
    fn zeroed_second_magic_fails_decode() {
        let geo = geo512();
        let mut bytes = sample_inode(&geo).encode(&geo);
        bytes[25..33].fill(0);
        let err = Carrier::decode(&bytes, &geo, BlockAddr(5)).unwrap_err();
        assert!(matches!(
            err,
            HalfsError::DecodeFail {
                kind: RecordKind::Inode,
                ..
            }
        ));
    }

    #[test]
    fn corrupt_padding_fails_decode() {
        let geo = geo512();
        let mut bytes = sample_inode(&geo).encode(&geo);
        // Padding sits right after the 50-address list: 105 + 400.
        bytes[505] = 0x00;
        let err = Carrier::decode(&bytes, &geo, BlockAddr(5)).unwrap_err();
        assert!(matches!(
            err,
            HalfsError::DecodeFail {
                source: CodecError::BadPadding { offset: 505 },
                ..
            }
        ));
    }

    #[test]
    fn unknown_tag_is_a_block_carrier_failure() {
        let geo = geo512();
        let mut bytes = sample_inode(&geo).encode(&geo);
        bytes[0] = 0x7F;
        let err = Carrier::decode(&bytes, &geo, BlockAddr(5)).unwrap_err();
        assert!(matches!(
            err,
            HalfsError::DecodeFail {
                kind: RecordKind::BlockCarrier,
                ..
            }
        ));
    }

    #[test]
    fn count_beyond_capacity_fails_decode() {
        let geo = geo512();
        let mut bytes = sample_inode(&geo).encode(&geo);
        bytes[89..97].copy_from_slice(&51_u64.to_be_bytes());
        assert!(Carrier::decode(&bytes, &geo, BlockAddr(5)).is_err());
    }

    #[test]
    fn self_address_mismatch_fails_decode() {
        let geo = geo512();
        let bytes = sample_inode(&geo).encode(&geo);
        // Claim the bytes came from block 6; the stored self-address says 5.
        assert!(Carrier::decode(&bytes, &geo, BlockAddr(6)).is_err());
    }

    #[test]
    fn nil_address_within_count_fails_decode() {
        let geo = geo512();
        let mut bytes = sample_inode(&geo).encode(&geo);
        // Zero the second list entry while the count still says four.
        bytes[113..121].fill(0);
        assert!(Carrier::decode(&bytes, &geo, BlockAddr(5)).is_err());
    }

    // ── Device operations and chains ────────────────────────────────────

    #[test]
    fn dref_inode_rejects_continuation_block() {
        let geo = geo512();
        let dev = MemBlockDevice::new(512, 64);
        let cont = Continuation::new_empty(&geo, ContRef(9));
        write_carrier(&dev, &geo, &Carrier::Cont(cont)).unwrap();

        let err = dref_inode(&dev, &geo, InodeRef(9)).unwrap_err();
        assert!(matches!(
            err,
            HalfsError::DecodeFail {
                kind: RecordKind::Inode,
                ..
            }
        ));
    }

    #[test]
    fn expand_chain_walks_links_in_order() {
        let geo = geo512();
        let dev = MemBlockDevice::new(512, 64);

        let inode = Inode::new_empty(&geo, InodeRef(5), InodeRef::NIL, 0, 0, Timestamp::ZERO)
            .with_cont(ContRef(9));
        let c1 = Continuation::new_empty(&geo, ContRef(9)).with_next(ContRef(14));
        let c2 = Continuation::new_empty(&geo, ContRef(14));
        write_carrier(&dev, &geo, &Carrier::Inode(inode.clone())).unwrap();
        write_carrier(&dev, &geo, &Carrier::Cont(c1)).unwrap();
        write_carrier(&dev, &geo, &Carrier::Cont(c2)).unwrap();

        let chain = expand_chain(&dev, &geo, inode.clone(), None).unwrap();
        let addrs: Vec<u64> = chain.iter().map(|c| c.addr().0).collect();
        assert_eq!(addrs, vec![5, 9, 14]);

        // Windowed expansion stops early without touching the tail.
        let window = expand_chain(&dev, &geo, inode, Some(2)).unwrap();
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn expand_chain_detects_cycle() {
        let geo = geo512();
        let dev = MemBlockDevice::new(512, 64);

        let inode = Inode::new_empty(&geo, InodeRef(5), InodeRef::NIL, 0, 0, Timestamp::ZERO)
            .with_cont(ContRef(9));
        // A continuation that points back at itself.
        let looped = Continuation::new_empty(&geo, ContRef(9)).with_next(ContRef(9));
        write_carrier(&dev, &geo, &Carrier::Inode(inode.clone())).unwrap();
        write_carrier(&dev, &geo, &Carrier::Cont(looped)).unwrap();

        let err = expand_chain(&dev, &geo, inode, None).unwrap_err();
        assert!(matches!(err, HalfsError::CorruptChain(_)));
    }

    // ── Properties ──────────────────────────────────────────────────────

    proptest! {
        #[test]
        fn inode_round_trips_for_any_fill_level(
            count in 0_u64..=50,
            size_slack in 0_u64..512,
            secs in 0_u64..1 << 40,
        ) {
            let geo = geo512();
            let now = Timestamp::new(secs, 0);
            let blocks: Vec<BlockAddr> = (100..100 + count).map(BlockAddr).collect();
            let size = (count * 512).saturating_sub(size_slack);
            let inode = Inode::new_empty(&geo, InodeRef(5), InodeRef(2), 7, 7, now)
                .with_size(size)
                .with_blocks(blocks);

            let decoded = Carrier::decode(&inode.encode(&geo), &geo, BlockAddr(5)).unwrap();
            prop_assert_eq!(decoded, Carrier::Inode(inode));
        }

        #[test]
        fn cont_round_trips_for_any_fill_level(count in 0_u64..=56) {
            let geo = geo512();
            let blocks: Vec<BlockAddr> = (200..200 + count).map(BlockAddr).collect();
            let cont = Continuation::new_empty(&geo, ContRef(9))
                .with_next(if count % 2 == 0 { ContRef::NIL } else { ContRef(33) })
                .with_blocks(blocks);

            let decoded = Carrier::decode(&cont.encode(&geo), &geo, BlockAddr(9)).unwrap();
            prop_assert_eq!(decoded, Carrier::Cont(cont));
        }
    }
}
