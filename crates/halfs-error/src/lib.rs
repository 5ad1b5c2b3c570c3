#![forbid(unsafe_code)]
//! Error types for Halfs.
//!
//! Defines `HalfsError` and a `Result<T>` alias used throughout the
//! workspace. The engine never panics on recoverable input; every failure
//! below is surfaced as a value. Internal invariant violations (padding
//! sentinels, capacity >= count) assert instead, because they indicate
//! implementation bugs rather than bad input.

use halfs_types::CodecError;
use std::fmt;
use thiserror::Error;

/// Which record shape failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Inode,
    Cont,
    /// The tag byte matched neither record shape.
    BlockCarrier,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inode => write!(f, "inode"),
            Self::Cont => write!(f, "continuation"),
            Self::BlockCarrier => write!(f, "block carrier"),
        }
    }
}

/// Unified error type for all Halfs storage-engine operations.
#[derive(Debug, Error)]
pub enum HalfsError {
    /// The block device reported failure; propagated verbatim.
    #[error("device error: {0}")]
    Device(#[from] std::io::Error),

    /// The allocator could not satisfy a request.
    #[error("allocation failed: {requested} blocks requested, {free} free")]
    AllocFailed { requested: u64, free: u64 },

    /// `unalloc_blocks` was handed a block that is already free.
    #[error("double free of block {addr}")]
    DoubleFree { addr: u64 },

    /// Caller offset past the end of the allocated chain.
    #[error("invalid stream index: byte {offset} past end of allocated chain")]
    InvalidStreamIndex { offset: u64 },

    /// Magic-marker mismatch or structural inconsistency on read.
    #[error("decode failed for {kind} record at block {addr}: {source}")]
    DecodeFail {
        kind: RecordKind,
        addr: u64,
        source: CodecError,
    },

    /// The persisted block map fails its invariants on load.
    #[error("corrupt block map: {0}")]
    CorruptBlockMap(String),

    /// Cycle detected while expanding a continuation chain, or chain length
    /// exceeds device capacity.
    #[error("corrupt chain: {0}")]
    CorruptChain(String),

    /// Device geometry the engine cannot operate on (e.g. a block size too
    /// small to hold the minimum carrier record).
    #[error("unsupported geometry: {0}")]
    Unsupported(String),
}

/// Result alias using `HalfsError`.
pub type Result<T> = std::result::Result<T, HalfsError>;
