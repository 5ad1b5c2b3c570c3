#![forbid(unsafe_code)]
//! Core identifier types and serialization primitives for Halfs.
//!
//! Every multi-byte integer on disk is big-endian. Block address 0 is the
//! superblock and doubles as the nil sentinel for inode and continuation
//! references.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The nil sentinel: block 0 is reserved for the superblock and never
/// referenced by a chain.
pub const NIL_ADDR: u64 = 0;

// ── Identifiers ─────────────────────────────────────────────────────────────

/// 64-bit index into the block device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct BlockAddr(pub u64);

impl BlockAddr {
    pub const NIL: Self = Self(NIL_ADDR);

    #[must_use]
    pub fn is_nil(self) -> bool {
        self.0 == NIL_ADDR
    }
}

/// Block address of a primary inode block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeRef(pub u64);

impl InodeRef {
    pub const NIL: Self = Self(NIL_ADDR);

    #[must_use]
    pub fn is_nil(self) -> bool {
        self.0 == NIL_ADDR
    }

    #[must_use]
    pub fn addr(self) -> BlockAddr {
        BlockAddr(self.0)
    }
}

/// Block address of a continuation block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContRef(pub u64);

impl ContRef {
    pub const NIL: Self = Self(NIL_ADDR);

    #[must_use]
    pub fn is_nil(self) -> bool {
        self.0 == NIL_ADDR
    }

    #[must_use]
    pub fn addr(self) -> BlockAddr {
        BlockAddr(self.0)
    }
}

impl fmt::Display for BlockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ContRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Timestamps ──────────────────────────────────────────────────────────────

/// On-disk timestamp: seconds since the Unix epoch plus a nanosecond part.
///
/// Serialized as 12 bytes (u64 seconds, u32 nanoseconds, big-endian).
/// The derived ordering makes the chain invariant `mtime >= ctime` a plain
/// comparison.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp {
    pub secs: u64,
    pub nsecs: u32,
}

impl Timestamp {
    pub const ZERO: Self = Self { secs: 0, nsecs: 0 };

    #[must_use]
    pub fn new(secs: u64, nsecs: u32) -> Self {
        Self { secs, nsecs }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nsecs)
    }
}

// ── Codec errors ────────────────────────────────────────────────────────────

/// Low-level decode failure. Converted to `HalfsError::DecodeFail` (or
/// `CorruptBlockMap`) at the record layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("bad magic at offset {offset}: expected {expected:#018x}, got {actual:#018x}")]
    BadMagic {
        offset: usize,
        expected: u64,
        actual: u64,
    },
    #[error("unknown record tag {actual:#04x}")]
    BadTag { actual: u8 },
    #[error("bad padding sentinel at offset {offset}")]
    BadPadding { offset: usize },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

// ── Big-endian primitives ───────────────────────────────────────────────────

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], CodecError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(CodecError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(CodecError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, CodecError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_be_u64(data: &[u8], offset: usize) -> Result<u64, CodecError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], CodecError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn put_be_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn put_be_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Verify an 8-byte magic segment at `offset`.
pub fn expect_magic(data: &[u8], offset: usize, expected: &[u8; 8]) -> Result<(), CodecError> {
    let actual: [u8; 8] = read_fixed(data, offset)?;
    if actual == *expected {
        Ok(())
    } else {
        Err(CodecError::BadMagic {
            offset,
            expected: u64::from_be_bytes(*expected),
            actual: u64::from_be_bytes(actual),
        })
    }
}

// ── Arithmetic helpers ──────────────────────────────────────────────────────

/// Ceiling division. `divisor` must be non-zero.
#[must_use]
pub fn ceil_div(value: u64, divisor: u64) -> u64 {
    value.div_ceil(divisor)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, CodecError> {
    usize::try_from(value).map_err(|_| CodecError::InvalidField {
        field,
        reason: "does not fit in usize",
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_sentinels() {
        assert!(BlockAddr::NIL.is_nil());
        assert!(InodeRef::NIL.is_nil());
        assert!(ContRef::NIL.is_nil());
        assert!(!InodeRef(7).is_nil());
        assert_eq!(ContRef(9).addr(), BlockAddr(9));
    }

    #[test]
    fn be_round_trip() {
        let mut buf = Vec::new();
        put_be_u64(&mut buf, 0x0102_0304_0506_0708);
        put_be_u32(&mut buf, 0xAABB_CCDD);
        assert_eq!(buf[0], 0x01);
        assert_eq!(read_be_u64(&buf, 0).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(read_be_u32(&buf, 8).unwrap(), 0xAABB_CCDD);
    }

    #[test]
    fn ensure_slice_bounds() {
        let data = [0u8; 8];
        assert!(ensure_slice(&data, 0, 8).is_ok());
        assert!(matches!(
            ensure_slice(&data, 4, 8),
            Err(CodecError::InsufficientData { needed: 8, .. })
        ));
        assert!(ensure_slice(&data, usize::MAX, 2).is_err());
    }

    #[test]
    fn expect_magic_mismatch() {
        let data = *b"HALFSMAPxxxxxxxx";
        assert!(expect_magic(&data, 0, b"HALFSMAP").is_ok());
        let err = expect_magic(&data, 8, b"HALFSMAP").unwrap_err();
        assert!(matches!(err, CodecError::BadMagic { offset: 8, .. }));
    }

    #[test]
    fn timestamp_ordering() {
        let earlier = Timestamp::new(100, 999_999_999);
        let later = Timestamp::new(101, 0);
        assert!(later > earlier);
        assert!(Timestamp::new(100, 1) > Timestamp::new(100, 0));
    }

    #[test]
    fn ceil_div_edges() {
        assert_eq!(ceil_div(0, 512), 0);
        assert_eq!(ceil_div(1, 512), 1);
        assert_eq!(ceil_div(512, 512), 1);
        assert_eq!(ceil_div(513, 512), 2);
    }
}
