#![forbid(unsafe_code)]
//! Shared value types for sqsh.
//!
//! Validated newtypes (`BlockSize`, `InodeNum`, `MetaRef`), POSIX mode
//! constants, and the little-endian byte helpers used by the on-disk
//! encoders.

use serde::{Deserialize, Serialize};
use sqsh_error::{Result, SqshError};
use std::fmt;

/// Smallest permitted data block size (4 KiB).
pub const BLOCK_SIZE_MIN: u32 = 4096;
/// Largest permitted data block size (1 MiB).
pub const BLOCK_SIZE_MAX: u32 = 1_048_576;
/// Default data block size (128 KiB).
pub const BLOCK_SIZE_DEFAULT: u32 = 131_072;

/// Size of one metadata chunk before compression.
pub const METADATA_CHUNK_SIZE: usize = 8192;

/// Sentinel for "this node carries no xattrs".
pub const XATTR_NONE: u32 = 0xFFFF_FFFF;

/// Sentinel for "this file has no tail-end fragment".
pub const FRAGMENT_NONE: u32 = 0xFFFF_FFFF;

/// Validated data block size (power of two in 4096..=1048576).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in the permitted range.
    pub fn new(value: u32) -> Result<Self> {
        if !value.is_power_of_two() || !(BLOCK_SIZE_MIN..=BLOCK_SIZE_MAX).contains(&value) {
            return Err(SqshError::Limit(format!(
                "block size {value} must be a power of two in {BLOCK_SIZE_MIN}..={BLOCK_SIZE_MAX}"
            )));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// log2 of the block size, as stored in the superblock.
    #[must_use]
    pub fn log2(self) -> u16 {
        self.0.trailing_zeros() as u16
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(BLOCK_SIZE_DEFAULT)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inode number, assigned contiguously from 1 during tree post-processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNum(pub u32);

impl InodeNum {
    /// The root directory always receives the first number.
    pub const ROOT: Self = Self(1);
}

impl fmt::Display for InodeNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position inside a metadata stream: `(chunk_disk_offset << 16) | in_chunk_offset`.
///
/// The chunk offset is relative to the start of the owning stream; the low
/// 16 bits address a byte within the uncompressed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetaRef(u64);

impl MetaRef {
    #[must_use]
    pub fn new(chunk_start: u64, offset: u16) -> Self {
        Self((chunk_start << 16) | u64::from(offset))
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Byte offset of the chunk header, relative to the stream start.
    #[must_use]
    pub fn chunk_start(self) -> u64 {
        self.0 >> 16
    }

    /// Offset within the uncompressed chunk.
    #[must_use]
    pub fn offset(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl fmt::Display for MetaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chunk_start(), self.offset())
    }
}

// ── POSIX file mode constants ───────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u16 = 0o010_000;
/// Character device.
pub const S_IFCHR: u16 = 0o020_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Block device.
pub const S_IFBLK: u16 = 0o060_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u16 = 0o140_000;

/// Permission-bit mask (the 12 bits a node may carry).
pub const MODE_MASK: u16 = 0o7777;

// ── Block descriptors ───────────────────────────────────────────────────────

/// How one data block landed on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    /// Stored through the codec.
    Compressed,
    /// Stored verbatim (incompressible or compression disabled).
    Raw,
    /// All-zero block; nothing stored.
    Sparse,
}

/// Descriptor of one packed data block, in file order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDesc {
    /// Bytes of file content this block covers.
    pub uncompressed_size: u32,
    /// Bytes occupying the image (0 for sparse blocks).
    pub disk_size: u32,
    pub kind: BlockKind,
}

/// A file tail's location inside a shared fragment block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentRef {
    pub index: u32,
    pub offset: u32,
}

/// Everything the block processor learned about one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedBlocks {
    /// Absolute image offset of the first data block (0 when there is none).
    pub start_block: u64,
    pub blocks: Vec<BlockDesc>,
    pub fragment: Option<FragmentRef>,
    /// Total file size in bytes, as consumed from the input stream.
    pub size: u64,
    /// Bytes saved by sparse blocks.
    pub sparse_bytes: u64,
}

// ── Little-endian byte helpers ──────────────────────────────────────────────

#[inline]
pub fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset.checked_add(8)?)?;
    Some(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}
