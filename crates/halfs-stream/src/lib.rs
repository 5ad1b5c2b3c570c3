#![forbid(unsafe_code)]
//! Byte-granular streams over inode chains.
//!
//! `read_stream` and `write_stream` walk a file's carrier chain, turning
//! byte offsets into `(carrier, block, byte)` positions and allocating new
//! blocks and continuations as a write grows past the chain. A truncating
//! write reclaims the dropped tail through the block map.
//!
//! Ordering rules the write path upholds:
//! - the block map is persisted before any carrier write that adopts
//!   newly allocated blocks;
//! - carrier writes follow the data writes they reference.

use halfs_alloc::{BlockGroup, BlockMap, Extent};
use halfs_block::BlockDevice;
use halfs_error::{HalfsError, Result};
use halfs_inode::{Carrier, CarrierGeometry, Continuation, dref_inode, expand_chain, write_carrier};
use halfs_types::{BlockAddr, ContRef, InodeRef, ceil_div};
use tracing::{debug, trace};

/// Fill byte for partial blocks and reclaimed space after a truncating
/// write. Readers never interpret it; it makes truncation visible in
/// block dumps.
pub const TRUNC_SENTINEL: u8 = 0xBA;

// ── Stream index decomposition ──────────────────────────────────────────────

/// A byte offset resolved against the chain: which carrier, which block
/// of that carrier, which byte of that block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamIdx {
    pub carrier: u64,
    pub block: u64,
    pub byte: u64,
}

/// Decompose a byte offset using the capacities reported at decode.
#[must_use]
pub fn decompose(geo: &CarrierGeometry, offset: u64) -> StreamIdx {
    let bs = geo.block_size();
    let bytes_per_inode = geo.inode_capacity() * bs;
    let bytes_per_cont = geo.cont_capacity() * bs;

    let (carrier, in_bytes) = if offset < bytes_per_inode {
        (0, offset)
    } else {
        let past = offset - bytes_per_inode;
        (1 + past / bytes_per_cont, past % bytes_per_cont)
    };
    StreamIdx {
        carrier,
        block: in_bytes / bs,
        byte: in_bytes % bs,
    }
}

// ── Read ────────────────────────────────────────────────────────────────────

/// Read up to `max_len` bytes starting at byte `offset` of the file whose
/// inode lives at `start`.
///
/// Without `max_len` the tail of the last allocated block is included
/// verbatim; callers trim against the file size.
pub fn read_stream(
    dev: &dyn BlockDevice,
    geo: &CarrierGeometry,
    start: InodeRef,
    offset: u64,
    max_len: Option<u64>,
) -> Result<Vec<u8>> {
    let inode = dref_inode(dev, geo, start)?;
    if inode.block_count() == 0 {
        return Ok(Vec::new());
    }

    let idx = decompose(geo, offset);
    // Walk only the carriers the read window can touch.
    let take = match max_len {
        Some(0) => Some(idx.carrier as usize + 1),
        Some(len) => Some(decompose(geo, offset + len - 1).carrier as usize + 1),
        None => None,
    };
    let chain = expand_chain(dev, geo, inode, take)?;

    if idx.carrier >= chain.len() as u64 {
        return Err(HalfsError::InvalidStreamIndex { offset });
    }
    let start_carrier = &chain[idx.carrier as usize];
    if idx.block >= start_carrier.block_count() {
        return Err(HalfsError::InvalidStreamIndex { offset });
    }
    if max_len == Some(0) {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    'chain: for (ci, carrier) in chain.iter().enumerate().skip(idx.carrier as usize) {
        let skip = if ci as u64 == idx.carrier {
            idx.block as usize
        } else {
            0
        };
        for (bi, addr) in carrier.blocks().iter().enumerate().skip(skip) {
            let buf = dev.read_block(*addr)?;
            if ci as u64 == idx.carrier && bi as u64 == idx.block {
                out.extend_from_slice(&buf.as_slice()[idx.byte as usize..]);
            } else {
                out.extend_from_slice(buf.as_slice());
            }
            if let Some(len) = max_len {
                if out.len() as u64 >= len {
                    break 'chain;
                }
            }
        }
    }

    if let Some(len) = max_len {
        out.truncate(len as usize);
    }
    trace!(
        target: "halfs::stream",
        event = "read",
        offset,
        bytes = out.len()
    );
    Ok(out)
}

// ── Write ───────────────────────────────────────────────────────────────────

/// Write `data` at byte `offset` of the file whose inode lives at `start`,
/// growing the chain as needed. With `truncating`, the file's allocation
/// ends at the last written byte and the dropped tail is returned to the
/// block map.
///
/// File size and modification time belong to the layer above; this
/// routine only moves bytes and restructures the chain.
pub fn write_stream(
    dev: &dyn BlockDevice,
    map: &mut BlockMap,
    geo: &CarrierGeometry,
    start: InodeRef,
    offset: u64,
    truncating: bool,
    data: &[u8],
) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }

    let bs = geo.block_size();
    let len = data.len() as u64;
    let s = decompose(geo, offset);
    let e = decompose(geo, offset + len - 1);

    let inode = dref_inode(dev, geo, start)?;
    // A truncating write must reach the chain's true end to reclaim it;
    // otherwise the write window ends at the last carrier written.
    let take = if truncating {
        None
    } else {
        Some(e.carrier as usize + 1)
    };
    let chain = expand_chain(dev, geo, inode, take)?;
    let chain_len = chain.len() as u64;

    validate_write_start(&chain, s, offset)?;

    // ── Capacity planning ───────────────────────────────────────────────
    let already_blocks: u64 = chain
        .iter()
        .enumerate()
        .skip(s.carrier as usize)
        .map(|(ci, c)| {
            if ci as u64 == s.carrier {
                c.block_count().saturating_sub(s.block)
            } else {
                c.block_count()
            }
        })
        .sum();
    let available_bytes = (already_blocks * bs).saturating_sub(s.byte);
    let bytes_to_alloc = len.saturating_sub(available_bytes);
    let blks_to_alloc = ceil_div(bytes_to_alloc, bs);

    let last = chain.last().expect("chain has at least the inode");
    let slots_in_last = last.capacity() - last.block_count();
    let conts_to_alloc = if blks_to_alloc <= slots_in_last {
        0
    } else {
        ceil_div(blks_to_alloc - slots_in_last, geo.cont_capacity())
    };

    // ── Allocation (with rollback on partial failure) ───────────────────
    let data_group = if blks_to_alloc > 0 {
        match map.alloc_blocks(blks_to_alloc) {
            Some(group) => Some(group),
            None => {
                return Err(HalfsError::AllocFailed {
                    requested: blks_to_alloc,
                    free: map.num_free(),
                });
            }
        }
    } else {
        None
    };
    let mut cont_addrs: Vec<BlockAddr> = Vec::new();
    for _ in 0..conts_to_alloc {
        match map.alloc1() {
            Some(addr) => cont_addrs.push(addr),
            None => {
                let free = map.num_free();
                if let Some(group) = &data_group {
                    map.unalloc_blocks(group)?;
                }
                if !cont_addrs.is_empty() {
                    let extents = cont_addrs.iter().map(|a| Extent::new(a.0, 1)).collect();
                    map.unalloc_blocks(&BlockGroup::Discontig(extents))?;
                }
                return Err(HalfsError::AllocFailed {
                    requested: blks_to_alloc + conts_to_alloc,
                    free,
                });
            }
        }
    }
    if data_group.is_some() || !cont_addrs.is_empty() {
        // New blocks must be marked used on disk before any carrier
        // adopts them.
        map.flush(dev)?;
    }

    // ── Chain fixup ─────────────────────────────────────────────────────
    // The window starts at the first carrier to rewrite. Appending at an
    // exact carrier boundary also relinks the old terminator, so the
    // window reaches back one carrier in that case.
    let window_start = s.carrier.min(chain_len - 1) as usize;
    let old_last_window_idx = (chain_len - 1) as usize - window_start;
    let mut window: Vec<Carrier> = chain[window_start..].to_vec();

    for addr in &cont_addrs {
        window.push(Carrier::Cont(Continuation::new_empty(geo, ContRef(addr.0))));
    }
    for i in old_last_window_idx..window.len().saturating_sub(1) {
        let next = ContRef(window[i + 1].addr().0);
        window[i] = window[i].clone().with_next(next);
    }

    let mut spill = data_group.iter().flat_map(BlockGroup::blocks);
    'spill: for carrier in window.iter_mut().skip(old_last_window_idx) {
        let mut blocks = carrier.blocks().to_vec();
        while (blocks.len() as u64) < carrier.capacity() {
            match spill.next() {
                Some(addr) => blocks.push(addr),
                None => {
                    *carrier = carrier.clone().with_blocks(blocks);
                    break 'spill;
                }
            }
        }
        *carrier = carrier.clone().with_blocks(blocks);
    }
    debug_assert!(spill.next().is_none(), "undistributed allocation");

    // ── Data chunks ─────────────────────────────────────────────────────
    let bs_usize = bs as usize;
    let targets: Vec<BlockAddr> = window
        .iter()
        .enumerate()
        .flat_map(|(wi, carrier)| {
            let chain_idx = window_start as u64 + wi as u64;
            let skip = if chain_idx < s.carrier {
                carrier.blocks().len()
            } else if chain_idx == s.carrier {
                s.block as usize
            } else {
                0
            };
            carrier.blocks()[skip..].iter().copied()
        })
        .collect();

    let n_chunks = ceil_div(s.byte + len, bs) as usize;
    debug_assert!(targets.len() >= n_chunks, "write targets undersupplied");

    let mut data_pos = 0_usize;
    for (i, &target) in targets.iter().enumerate().take(n_chunks) {
        let mut chunk = Vec::with_capacity(bs_usize);
        if i == 0 && s.byte > 0 {
            let original = dev.read_block(target)?;
            chunk.extend_from_slice(&original.as_slice()[..s.byte as usize]);
        }
        let want = (bs_usize - chunk.len()).min(data.len() - data_pos);
        chunk.extend_from_slice(&data[data_pos..data_pos + want]);
        data_pos += want;
        if chunk.len() < bs_usize {
            if truncating {
                chunk.resize(bs_usize, TRUNC_SENTINEL);
            } else {
                let original = dev.read_block(target)?;
                chunk.extend_from_slice(&original.as_slice()[chunk.len()..]);
            }
        }
        dev.write_block(target, &chunk)?;
    }
    debug_assert_eq!(data_pos, data.len());

    // ── Truncation pass ─────────────────────────────────────────────────
    let mut freed: Vec<Extent> = Vec::new();
    if truncating {
        let term_idx = (e.carrier - window_start as u64) as usize;
        let keep = (e.block + 1) as usize;
        let term_blocks = window[term_idx].blocks().to_vec();
        debug_assert!(keep <= term_blocks.len());
        for addr in &term_blocks[keep..] {
            freed.push(Extent::new(addr.0, 1));
        }
        window[term_idx] = window[term_idx]
            .clone()
            .with_blocks(term_blocks[..keep].to_vec())
            .with_next(ContRef::NIL);

        for carrier in window.drain(term_idx + 1..) {
            for addr in carrier.blocks() {
                freed.push(Extent::new(addr.0, 1));
            }
            freed.push(Extent::new(carrier.addr().0, 1));
        }
    }

    // ── Persist carriers, then reclaim ──────────────────────────────────
    for carrier in &window {
        write_carrier(dev, geo, carrier)?;
    }
    if !freed.is_empty() {
        let count = freed.len();
        map.unalloc_blocks(&BlockGroup::Discontig(freed))?;
        map.flush(dev)?;
        debug!(
            target: "halfs::stream",
            event = "truncate_reclaim",
            blocks = count
        );
    }

    trace!(
        target: "halfs::stream",
        event = "write",
        offset,
        bytes = len,
        allocated = blks_to_alloc,
        continuations = conts_to_alloc,
        truncating
    );
    Ok(())
}

/// The start position must lie within the allocated chain or exactly at
/// its end (an append); anything past that is a gap.
fn validate_write_start(chain: &[Carrier], s: StreamIdx, offset: u64) -> Result<()> {
    let chain_len = chain.len() as u64;
    if s.carrier > chain_len {
        return Err(HalfsError::InvalidStreamIndex { offset });
    }
    if s.carrier == chain_len {
        let last = chain.last().expect("chain has at least the inode");
        if s.block != 0 || s.byte != 0 || last.block_count() < last.capacity() {
            return Err(HalfsError::InvalidStreamIndex { offset });
        }
        return Ok(());
    }
    let carrier = &chain[s.carrier as usize];
    if s.block > carrier.block_count()
        || (s.block == carrier.block_count() && s.byte != 0)
    {
        return Err(HalfsError::InvalidStreamIndex { offset });
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use halfs_block::MemBlockDevice;
    use halfs_inode::Inode;
    use halfs_types::Timestamp;

    const BS: u64 = 512;

    fn setup() -> (MemBlockDevice, BlockMap, CarrierGeometry, InodeRef) {
        let dev = MemBlockDevice::new(BS, 512);
        let mut map = BlockMap::create(&dev).unwrap();
        let geo = CarrierGeometry::derive(BS).unwrap();
        let addr = map.alloc1().unwrap();
        map.flush(&dev).unwrap();
        let iref = InodeRef(addr.0);
        let inode = Inode::new_empty(&geo, iref, InodeRef::NIL, 0, 0, Timestamp::ZERO);
        write_carrier(&dev, &geo, &Carrier::Inode(inode)).unwrap();
        (dev, map, geo, iref)
    }

    /// Deterministic printable bytes, splitmix-style.
    fn pattern(seed: u64, len: usize) -> Vec<u8> {
        let mut state = seed;
        (0..len)
            .map(|_| {
                state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
                let mut mixed = state;
                mixed = (mixed ^ (mixed >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
                mixed = (mixed ^ (mixed >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
                b' ' + ((mixed >> 33) % 95) as u8
            })
            .collect()
    }

    fn chain_of(dev: &MemBlockDevice, geo: &CarrierGeometry, iref: InodeRef) -> Vec<Carrier> {
        let inode = dref_inode(dev, geo, iref).unwrap();
        expand_chain(dev, geo, inode, None).unwrap()
    }

    // ── Decomposition ───────────────────────────────────────────────────

    #[test]
    fn decompose_uses_decoded_capacities() {
        let geo = CarrierGeometry::derive(BS).unwrap();
        // 50 addresses per inode, 56 per continuation at 512-byte blocks.
        let bytes_per_inode = 50 * BS;
        let bytes_per_cont = 56 * BS;

        assert_eq!(
            decompose(&geo, 0),
            StreamIdx {
                carrier: 0,
                block: 0,
                byte: 0
            }
        );
        assert_eq!(
            decompose(&geo, bytes_per_inode - 1),
            StreamIdx {
                carrier: 0,
                block: 49,
                byte: 511
            }
        );
        assert_eq!(
            decompose(&geo, bytes_per_inode),
            StreamIdx {
                carrier: 1,
                block: 0,
                byte: 0
            }
        );
        assert_eq!(
            decompose(&geo, bytes_per_inode + bytes_per_cont),
            StreamIdx {
                carrier: 2,
                block: 0,
                byte: 0
            }
        );
        assert_eq!(
            decompose(&geo, 30_000),
            StreamIdx {
                carrier: 1,
                block: (30_000 - bytes_per_inode) / BS,
                byte: (30_000 - bytes_per_inode) % BS
            }
        );
    }

    // ── Read/write round trips ──────────────────────────────────────────

    #[test]
    fn write_then_read_within_one_block() {
        let (dev, mut map, geo, iref) = setup();
        let data = pattern(1, 100);
        write_stream(&dev, &mut map, &geo, iref, 0, false, &data).unwrap();
        let back = read_stream(&dev, &geo, iref, 0, Some(100)).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn write_then_read_spanning_blocks() {
        let (dev, mut map, geo, iref) = setup();
        let data = pattern(2, 3000);
        write_stream(&dev, &mut map, &geo, iref, 0, false, &data).unwrap();
        assert_eq!(
            read_stream(&dev, &geo, iref, 0, Some(3000)).unwrap(),
            data
        );
        // Unconstrained read returns the tail of the last block verbatim.
        let full = read_stream(&dev, &geo, iref, 0, None).unwrap();
        assert_eq!(full.len(), 3072);
        assert_eq!(&full[..3000], &data[..]);
    }

    #[test]
    fn write_grows_continuation_chain() {
        let (dev, mut map, geo, iref) = setup();
        // 79 blocks: past the 50-address inode into a continuation.
        let data = pattern(3, 40_000);
        write_stream(&dev, &mut map, &geo, iref, 0, false, &data).unwrap();

        let chain = chain_of(&dev, &geo, iref);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].block_count(), chain[0].capacity());
        assert_eq!(chain[1].block_count(), 79 - 50);

        assert_eq!(
            read_stream(&dev, &geo, iref, 0, Some(40_000)).unwrap(),
            data
        );
    }

    #[test]
    fn non_terminal_carriers_stay_full() {
        let (dev, mut map, geo, iref) = setup();
        // Three carriers: 50 + 56 + remainder.
        let data = pattern(4, 120 * 512);
        write_stream(&dev, &mut map, &geo, iref, 0, false, &data).unwrap();

        let chain = chain_of(&dev, &geo, iref);
        assert_eq!(chain.len(), 3);
        for carrier in &chain[..chain.len() - 1] {
            assert_eq!(carrier.block_count(), carrier.capacity());
        }
        assert_eq!(
            read_stream(&dev, &geo, iref, 0, Some(data.len() as u64)).unwrap(),
            data
        );
    }

    #[test]
    fn overwrite_leaves_surrounding_bytes_alone() {
        let (dev, mut map, geo, iref) = setup();
        let base = pattern(5, 5000);
        write_stream(&dev, &mut map, &geo, iref, 0, false, &base).unwrap();

        let patch = pattern(6, 700);
        write_stream(&dev, &mut map, &geo, iref, 300, false, &patch).unwrap();

        let mut expected = base.clone();
        expected[300..1000].copy_from_slice(&patch);
        assert_eq!(
            read_stream(&dev, &geo, iref, 0, Some(5000)).unwrap(),
            expected
        );
    }

    #[test]
    fn append_at_exact_block_boundary() {
        let (dev, mut map, geo, iref) = setup();
        let first = pattern(7, 1536);
        write_stream(&dev, &mut map, &geo, iref, 0, false, &first).unwrap();
        let second = pattern(8, 1000);
        write_stream(&dev, &mut map, &geo, iref, 1536, false, &second).unwrap();

        let mut expected = first;
        expected.extend_from_slice(&second);
        assert_eq!(
            read_stream(&dev, &geo, iref, 0, Some(2536)).unwrap(),
            expected
        );
    }

    #[test]
    fn append_at_exact_carrier_boundary_relinks_old_terminator() {
        let (dev, mut map, geo, iref) = setup();
        // Fill the inode's 50 blocks exactly, then append.
        let first = pattern(9, 50 * 512);
        write_stream(&dev, &mut map, &geo, iref, 0, false, &first).unwrap();
        assert_eq!(chain_of(&dev, &geo, iref).len(), 1);

        let second = pattern(10, 600);
        write_stream(&dev, &mut map, &geo, iref, 50 * 512, false, &second).unwrap();

        let chain = chain_of(&dev, &geo, iref);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].block_count(), 2);

        let mut expected = first;
        expected.extend_from_slice(&second);
        assert_eq!(
            read_stream(&dev, &geo, iref, 0, Some(expected.len() as u64)).unwrap(),
            expected
        );
    }

    // ── Truncating writes ───────────────────────────────────────────────

    #[test]
    fn truncating_write_reclaims_and_fills_with_sentinel() {
        let (dev, mut map, geo, iref) = setup();
        let base = pattern(11, 20_000);
        write_stream(&dev, &mut map, &geo, iref, 0, false, &base).unwrap();
        let free_before = map.num_free();

        let replacement = pattern(12, 1000);
        write_stream(&dev, &mut map, &geo, iref, 1, true, &replacement).unwrap();

        // 40 blocks down to 2.
        assert!(map.num_free() - free_before >= (20_000 - 1001) / 512);

        let full = read_stream(&dev, &geo, iref, 0, None).unwrap();
        assert_eq!(full.len(), 1024);
        assert_eq!(full[0], base[0]);
        assert_eq!(&full[1..1001], &replacement[..]);
        assert!(full[1001..].iter().all(|&b| b == TRUNC_SENTINEL));

        let chain = chain_of(&dev, &geo, iref);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].block_count(), 2);
    }

    #[test]
    fn truncating_write_drops_whole_continuations() {
        let (dev, mut map, geo, iref) = setup();
        let base = pattern(13, 120 * 512);
        write_stream(&dev, &mut map, &geo, iref, 0, false, &base).unwrap();
        assert_eq!(chain_of(&dev, &geo, iref).len(), 3);
        let free_before = map.num_free();

        let replacement = pattern(14, 100);
        write_stream(&dev, &mut map, &geo, iref, 0, true, &replacement).unwrap();

        let chain = chain_of(&dev, &geo, iref);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].block_count(), 1);
        assert!(chain[0].as_inode().unwrap().cont().is_nil());

        // 119 data blocks plus two continuation carrier blocks come back.
        assert_eq!(map.num_free(), free_before + 119 + 2);

        let full = read_stream(&dev, &geo, iref, 0, None).unwrap();
        assert_eq!(&full[..100], &replacement[..]);
        assert!(full[100..].iter().all(|&b| b == TRUNC_SENTINEL));
    }

    #[test]
    fn truncating_write_past_end_only_grows() {
        let (dev, mut map, geo, iref) = setup();
        let base = pattern(15, 700);
        write_stream(&dev, &mut map, &geo, iref, 0, false, &base).unwrap();

        let more = pattern(16, 900);
        write_stream(&dev, &mut map, &geo, iref, 700, true, &more).unwrap();

        let full = read_stream(&dev, &geo, iref, 0, None).unwrap();
        assert_eq!(full.len(), 2048);
        assert_eq!(&full[..700], &base[..]);
        assert_eq!(&full[700..1600], &more[..]);
        assert!(full[1600..].iter().all(|&b| b == TRUNC_SENTINEL));
    }

    // ── Edge cases and failures ─────────────────────────────────────────

    #[test]
    fn zero_length_write_is_a_noop() {
        let (dev, mut map, geo, iref) = setup();
        let before = map.clone();
        write_stream(&dev, &mut map, &geo, iref, 0, false, &[]).unwrap();
        assert_eq!(map, before);
        assert_eq!(read_stream(&dev, &geo, iref, 0, None).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn read_of_empty_file_is_empty() {
        let (dev, _map, geo, iref) = setup();
        assert_eq!(read_stream(&dev, &geo, iref, 0, None).unwrap(), Vec::<u8>::new());
        assert_eq!(
            read_stream(&dev, &geo, iref, 4096, Some(10)).unwrap(),
            Vec::<u8>::new()
        );
    }

    #[test]
    fn read_past_allocation_is_an_invalid_index() {
        let (dev, mut map, geo, iref) = setup();
        write_stream(&dev, &mut map, &geo, iref, 0, false, &pattern(17, 600)).unwrap();
        // Two blocks allocated; block 2 does not exist.
        let err = read_stream(&dev, &geo, iref, 1024, Some(1)).unwrap_err();
        assert!(matches!(err, HalfsError::InvalidStreamIndex { offset: 1024 }));
    }

    #[test]
    fn write_past_allocation_is_an_invalid_index() {
        let (dev, mut map, geo, iref) = setup();
        write_stream(&dev, &mut map, &geo, iref, 0, false, &pattern(18, 600)).unwrap();
        let err = write_stream(&dev, &mut map, &geo, iref, 5000, false, &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, HalfsError::InvalidStreamIndex { offset: 5000 }));
    }

    #[test]
    fn exhaustion_fails_and_leaves_map_unchanged() {
        let (dev, mut map, geo, iref) = setup();
        // Eat everything but 4 blocks.
        map.alloc_blocks(map.num_free() - 4).unwrap();
        map.flush(&dev).unwrap();

        let before = map.clone();
        let err = write_stream(&dev, &mut map, &geo, iref, 0, false, &pattern(19, 8 * 512))
            .unwrap_err();
        assert!(matches!(err, HalfsError::AllocFailed { .. }));
        assert_eq!(map, before);

        // A write that fits the remaining space still succeeds.
        write_stream(&dev, &mut map, &geo, iref, 0, false, &pattern(20, 4 * 512)).unwrap();
        assert_eq!(map.num_free(), 0);
    }

    #[test]
    fn exhaustion_mid_continuation_rolls_back() {
        let (dev, mut map, geo, iref) = setup();
        // Leave exactly 51 free blocks: 51 data blocks would fit, but the
        // 51st spills into a continuation there is no block left for.
        let free = map.num_free();
        map.alloc_blocks(free - 51).unwrap();
        map.flush(&dev).unwrap();

        let before = map.clone();
        let err = write_stream(&dev, &mut map, &geo, iref, 0, false, &pattern(21, 51 * 512))
            .unwrap_err();
        assert!(matches!(err, HalfsError::AllocFailed { .. }));
        assert_eq!(map, before);
    }
}
