#![forbid(unsafe_code)]
//! SquashFS 4.0 wire structures.
//!
//! Field-by-field little-endian encoders for the superblock, inode
//! records, directory records, fragment entries, and xattr records, plus
//! the constants that tie them together. Everything here is pure: bytes
//! in, bytes out, no I/O.

use bitflags::bitflags;
use sqsh_error::{Result, SqshError};
use sqsh_types::{push_u16, push_u32, push_u64, read_le_u16, read_le_u32, read_le_u64, MetaRef};

/// Magic bytes at offset 0 ("hsqs" read as a little-endian u32).
pub const MAGIC: u32 = 0x7371_7368;
/// Supported major format version.
pub const VERSION_MAJOR: u16 = 4;
/// Supported minor format version.
pub const VERSION_MINOR: u16 = 0;
/// The superblock is always exactly this many bytes.
pub const SUPERBLOCK_SIZE: usize = 96;

/// Bit set in a metadata chunk header when the chunk is stored raw.
pub const META_UNCOMPRESSED: u16 = 0x8000;
/// Bit set in a data-block or fragment size word when the block is stored raw.
pub const DATA_UNCOMPRESSED: u32 = 1 << 24;

/// Sentinel offset for tables that are absent from the image.
pub const TABLE_ABSENT: u64 = !0;

/// Images are padded with zeros to a multiple of this.
pub const DEVICE_BLOCK_SIZE: u64 = 4096;

/// Directory runs never exceed this many entries under one header.
pub const DIR_RUN_MAX_ENTRIES: usize = 256;
/// Longest permitted directory entry name, in bytes.
pub const NAME_MAX: usize = 256;

bitflags! {
    /// Superblock feature flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SuperFlags: u16 {
        const UNCOMPRESSED_INODES    = 1;
        const UNCOMPRESSED_DATA      = 1 << 1;
        const UNCOMPRESSED_FRAGMENTS = 1 << 3;
        const NO_FRAGMENTS           = 1 << 4;
        const ALWAYS_FRAGMENTS       = 1 << 5;
        const DUPLICATES             = 1 << 6;
        const EXPORTABLE             = 1 << 7;
        const UNCOMPRESSED_XATTRS    = 1 << 8;
        const NO_XATTRS              = 1 << 9;
        const COMPRESSOR_OPTIONS     = 1 << 10;
    }
}

/// Inode record type tags. Directory entries always use the basic tag for
/// the node's kind, even when the inode record itself is extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum InodeType {
    BasicDir = 1,
    BasicFile = 2,
    BasicSymlink = 3,
    BasicBlockDev = 4,
    BasicCharDev = 5,
    BasicFifo = 6,
    BasicSocket = 7,
    ExtDir = 8,
    ExtFile = 9,
    ExtSymlink = 10,
    ExtBlockDev = 11,
    ExtCharDev = 12,
    ExtFifo = 13,
    ExtSocket = 14,
}

impl InodeType {
    /// The basic counterpart of this type, as stored in directory entries.
    #[must_use]
    pub fn basic(self) -> InodeType {
        match self {
            InodeType::ExtDir => InodeType::BasicDir,
            InodeType::ExtFile => InodeType::BasicFile,
            InodeType::ExtSymlink => InodeType::BasicSymlink,
            InodeType::ExtBlockDev => InodeType::BasicBlockDev,
            InodeType::ExtCharDev => InodeType::BasicCharDev,
            InodeType::ExtFifo => InodeType::BasicFifo,
            InodeType::ExtSocket => InodeType::BasicSocket,
            other => other,
        }
    }
}

// ── Superblock ──────────────────────────────────────────────────────────────

/// The 96-byte header at offset 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub inode_count: u32,
    pub modification_time: u32,
    pub block_size: u32,
    pub fragment_entry_count: u32,
    pub compression_id: u16,
    pub block_log: u16,
    pub flags: SuperFlags,
    pub id_count: u16,
    pub root_inode_ref: u64,
    pub bytes_used: u64,
    pub id_table_start: u64,
    pub xattr_id_table_start: u64,
    pub inode_table_start: u64,
    pub directory_table_start: u64,
    pub fragment_table_start: u64,
    pub export_table_start: u64,
}

impl Superblock {
    #[must_use]
    pub fn encode(&self) -> [u8; SUPERBLOCK_SIZE] {
        let mut buf = Vec::with_capacity(SUPERBLOCK_SIZE);
        push_u32(&mut buf, MAGIC);
        push_u32(&mut buf, self.inode_count);
        push_u32(&mut buf, self.modification_time);
        push_u32(&mut buf, self.block_size);
        push_u32(&mut buf, self.fragment_entry_count);
        push_u16(&mut buf, self.compression_id);
        push_u16(&mut buf, self.block_log);
        push_u16(&mut buf, self.flags.bits());
        push_u16(&mut buf, self.id_count);
        push_u16(&mut buf, VERSION_MAJOR);
        push_u16(&mut buf, VERSION_MINOR);
        push_u64(&mut buf, self.root_inode_ref);
        push_u64(&mut buf, self.bytes_used);
        push_u64(&mut buf, self.id_table_start);
        push_u64(&mut buf, self.xattr_id_table_start);
        push_u64(&mut buf, self.inode_table_start);
        push_u64(&mut buf, self.directory_table_start);
        push_u64(&mut buf, self.fragment_table_start);
        push_u64(&mut buf, self.export_table_start);

        let mut out = [0_u8; SUPERBLOCK_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Decode a superblock, verifying magic and version.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let field = |msg: &str| SqshError::Internal(format!("superblock: {msg}"));
        if data.len() < SUPERBLOCK_SIZE {
            return Err(field("short read"));
        }
        let magic = read_le_u32(data, 0).ok_or_else(|| field("truncated"))?;
        if magic != MAGIC {
            return Err(field("bad magic"));
        }
        let version_major = read_le_u16(data, 28).ok_or_else(|| field("truncated"))?;
        let version_minor = read_le_u16(data, 30).ok_or_else(|| field("truncated"))?;
        if (version_major, version_minor) != (VERSION_MAJOR, VERSION_MINOR) {
            return Err(field("unsupported version"));
        }
        Ok(Self {
            inode_count: read_le_u32(data, 4).ok_or_else(|| field("truncated"))?,
            modification_time: read_le_u32(data, 8).ok_or_else(|| field("truncated"))?,
            block_size: read_le_u32(data, 12).ok_or_else(|| field("truncated"))?,
            fragment_entry_count: read_le_u32(data, 16).ok_or_else(|| field("truncated"))?,
            compression_id: read_le_u16(data, 20).ok_or_else(|| field("truncated"))?,
            block_log: read_le_u16(data, 22).ok_or_else(|| field("truncated"))?,
            flags: SuperFlags::from_bits_retain(
                read_le_u16(data, 24).ok_or_else(|| field("truncated"))?,
            ),
            id_count: read_le_u16(data, 26).ok_or_else(|| field("truncated"))?,
            root_inode_ref: read_le_u64(data, 32).ok_or_else(|| field("truncated"))?,
            bytes_used: read_le_u64(data, 40).ok_or_else(|| field("truncated"))?,
            id_table_start: read_le_u64(data, 48).ok_or_else(|| field("truncated"))?,
            xattr_id_table_start: read_le_u64(data, 56).ok_or_else(|| field("truncated"))?,
            inode_table_start: read_le_u64(data, 64).ok_or_else(|| field("truncated"))?,
            directory_table_start: read_le_u64(data, 72).ok_or_else(|| field("truncated"))?,
            fragment_table_start: read_le_u64(data, 80).ok_or_else(|| field("truncated"))?,
            export_table_start: read_le_u64(data, 88).ok_or_else(|| field("truncated"))?,
        })
    }
}

// ── Inode records ───────────────────────────────────────────────────────────

/// The 16-byte header shared by every inode record.
#[derive(Debug, Clone, Copy)]
pub struct InodeHeader {
    pub ty: InodeType,
    pub mode: u16,
    pub uid_idx: u16,
    pub gid_idx: u16,
    pub mtime: u32,
    pub inode_number: u32,
}

impl InodeHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        push_u16(out, self.ty as u16);
        push_u16(out, self.mode);
        push_u16(out, self.uid_idx);
        push_u16(out, self.gid_idx);
        push_u32(out, self.mtime);
        push_u32(out, self.inode_number);
    }
}

/// Basic directory body (listing fits one chunk, ≤ u16 sizes, no xattrs).
#[derive(Debug, Clone, Copy)]
pub struct BasicDir {
    pub start_block: u32,
    pub link_count: u32,
    /// Uncompressed listing size + 3 (the implied "." and ".." entries).
    pub file_size: u16,
    pub block_offset: u16,
    pub parent_inode: u32,
}

impl BasicDir {
    pub fn encode(&self, out: &mut Vec<u8>) {
        push_u32(out, self.start_block);
        push_u32(out, self.link_count);
        push_u16(out, self.file_size);
        push_u16(out, self.block_offset);
        push_u32(out, self.parent_inode);
    }
}

/// One entry of the extended directory index: every listing chunk boundary
/// records the first name that starts past it.
#[derive(Debug, Clone)]
pub struct DirIndexEntry {
    /// Byte position of the run header within the uncompressed listing.
    pub index: u32,
    /// Chunk start of the run header, relative to the directory table.
    pub start: u32,
    pub name: Vec<u8>,
}

/// Extended directory body.
#[derive(Debug, Clone)]
pub struct ExtDir {
    pub link_count: u32,
    pub file_size: u32,
    pub start_block: u32,
    pub parent_inode: u32,
    pub block_offset: u16,
    pub xattr_idx: u32,
    pub index: Vec<DirIndexEntry>,
}

impl ExtDir {
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let index_count = u16::try_from(self.index.len())
            .map_err(|_| SqshError::Limit("directory index exceeds 65535 entries".into()))?;
        push_u32(out, self.link_count);
        push_u32(out, self.file_size);
        push_u32(out, self.start_block);
        push_u32(out, self.parent_inode);
        push_u16(out, index_count);
        push_u16(out, self.block_offset);
        push_u32(out, self.xattr_idx);
        for entry in &self.index {
            check_name(&entry.name)?;
            push_u32(out, entry.index);
            push_u32(out, entry.start);
            push_u32(out, (entry.name.len() - 1) as u32);
            out.extend_from_slice(&entry.name);
        }
        Ok(())
    }
}

/// Basic regular file body. `block_sizes` are the on-disk size words in
/// block order; bit 24 marks a raw block, zero marks a sparse hole.
#[derive(Debug, Clone)]
pub struct BasicFile<'a> {
    pub start_block: u32,
    pub frag_index: u32,
    pub frag_offset: u32,
    pub file_size: u32,
    pub block_sizes: &'a [u32],
}

impl BasicFile<'_> {
    pub fn encode(&self, out: &mut Vec<u8>) {
        push_u32(out, self.start_block);
        push_u32(out, self.frag_index);
        push_u32(out, self.frag_offset);
        push_u32(out, self.file_size);
        for word in self.block_sizes {
            push_u32(out, *word);
        }
    }
}

/// Extended regular file body (large, sparse, hard-linked, or xattr-carrying).
#[derive(Debug, Clone)]
pub struct ExtFile<'a> {
    pub start_block: u64,
    pub file_size: u64,
    /// Total bytes saved by sparse blocks.
    pub sparse: u64,
    pub link_count: u32,
    pub frag_index: u32,
    pub frag_offset: u32,
    pub xattr_idx: u32,
    pub block_sizes: &'a [u32],
}

impl ExtFile<'_> {
    pub fn encode(&self, out: &mut Vec<u8>) {
        push_u64(out, self.start_block);
        push_u64(out, self.file_size);
        push_u64(out, self.sparse);
        push_u32(out, self.link_count);
        push_u32(out, self.frag_index);
        push_u32(out, self.frag_offset);
        push_u32(out, self.xattr_idx);
        for word in self.block_sizes {
            push_u32(out, *word);
        }
    }
}

/// Symlink body; extended form appends the xattr index after the target.
#[derive(Debug, Clone)]
pub struct Symlink<'a> {
    pub link_count: u32,
    pub target: &'a [u8],
    pub xattr_idx: Option<u32>,
}

impl Symlink<'_> {
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let size = u32::try_from(self.target.len())
            .map_err(|_| SqshError::Limit("symlink target exceeds u32 bytes".into()))?;
        push_u32(out, self.link_count);
        push_u32(out, size);
        out.extend_from_slice(self.target);
        if let Some(idx) = self.xattr_idx {
            push_u32(out, idx);
        }
        Ok(())
    }
}

/// Device node body; extended form appends the xattr index.
#[derive(Debug, Clone, Copy)]
pub struct Device {
    pub link_count: u32,
    pub rdev: u32,
    pub xattr_idx: Option<u32>,
}

impl Device {
    pub fn encode(&self, out: &mut Vec<u8>) {
        push_u32(out, self.link_count);
        push_u32(out, self.rdev);
        if let Some(idx) = self.xattr_idx {
            push_u32(out, idx);
        }
    }
}

/// Fifo/socket body; extended form appends the xattr index.
#[derive(Debug, Clone, Copy)]
pub struct Ipc {
    pub link_count: u32,
    pub xattr_idx: Option<u32>,
}

impl Ipc {
    pub fn encode(&self, out: &mut Vec<u8>) {
        push_u32(out, self.link_count);
        if let Some(idx) = self.xattr_idx {
            push_u32(out, idx);
        }
    }
}

/// Pack a (major, minor) pair into the on-disk device number word.
pub fn encode_dev(major: u32, minor: u32) -> Result<u32> {
    if major >= 1 << 12 {
        return Err(SqshError::Limit(format!(
            "device major {major} exceeds 12 bits"
        )));
    }
    if minor >= 1 << 20 {
        return Err(SqshError::Limit(format!(
            "device minor {minor} exceeds 20 bits"
        )));
    }
    Ok((major << 8) | (minor & 0xFF) | ((minor & !0xFF) << 12))
}

// ── Directory table records ─────────────────────────────────────────────────

/// Header of one directory run.
#[derive(Debug, Clone, Copy)]
pub struct DirHeader {
    /// Number of entries in the run (stored as count - 1).
    pub count: u32,
    /// Inode-table chunk start shared by every entry of the run.
    pub start: u32,
    /// Base inode number; entries store i16 deltas against it.
    pub inode_number: u32,
}

impl DirHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        push_u32(out, self.count - 1);
        push_u32(out, self.start);
        push_u32(out, self.inode_number);
    }
}

/// One directory entry under a run header.
#[derive(Debug, Clone)]
pub struct DirEntry<'a> {
    /// In-chunk offset of the child's inode record.
    pub offset: u16,
    /// Child inode number minus the run header's base.
    pub inode_delta: i16,
    /// Basic inode type of the child.
    pub ty: InodeType,
    pub name: &'a [u8],
}

impl DirEntry<'_> {
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        check_name(self.name)?;
        push_u16(out, self.offset);
        push_u16(out, self.inode_delta as u16);
        push_u16(out, self.ty as u16);
        push_u16(out, (self.name.len() - 1) as u16);
        out.extend_from_slice(self.name);
        Ok(())
    }

    /// Encoded size of an entry with a name of `name_len` bytes.
    #[must_use]
    pub fn encoded_size(name_len: usize) -> usize {
        8 + name_len
    }
}

fn check_name(name: &[u8]) -> Result<()> {
    if name.is_empty() || name.len() > NAME_MAX {
        return Err(SqshError::Limit(format!(
            "entry name length {} outside 1..={NAME_MAX}",
            name.len()
        )));
    }
    Ok(())
}

// ── Fragment table ──────────────────────────────────────────────────────────

/// One 16-byte fragment table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentEntry {
    /// Absolute byte offset of the fragment block in the image.
    pub start: u64,
    /// On-disk size word (bit 24 = stored raw).
    pub size: u32,
}

impl FragmentEntry {
    pub const ENCODED_SIZE: usize = 16;

    pub fn encode(&self, out: &mut Vec<u8>) {
        push_u64(out, self.start);
        push_u32(out, self.size);
        push_u32(out, 0);
    }
}

// ── Xattr records ───────────────────────────────────────────────────────────

/// Namespace tags; the textual prefix is elided from stored keys.
pub const XATTR_PREFIXES: &[(&str, u16)] = &[("user.", 0), ("trusted.", 1), ("security.", 2)];

/// Append one key entry to the xattr kv stream.
pub fn encode_xattr_key(out: &mut Vec<u8>, ns_tag: u16, key: &[u8]) -> Result<()> {
    let size = u16::try_from(key.len())
        .map_err(|_| SqshError::Limit("xattr key exceeds u16 bytes".into()))?;
    push_u16(out, ns_tag);
    push_u16(out, size);
    out.extend_from_slice(key);
    Ok(())
}

/// Append one value entry to the xattr kv stream.
pub fn encode_xattr_value(out: &mut Vec<u8>, value: &[u8]) -> Result<()> {
    let size = u32::try_from(value.len())
        .map_err(|_| SqshError::Limit("xattr value exceeds u32 bytes".into()))?;
    push_u32(out, size);
    out.extend_from_slice(value);
    Ok(())
}

/// One entry of the xattr id table.
#[derive(Debug, Clone, Copy)]
pub struct XattrIdEntry {
    /// Position of the set's first key in the kv stream.
    pub xattr_ref: MetaRef,
    /// Number of (key, value) pairs.
    pub count: u32,
    /// Total uncompressed bytes the set occupies in the kv stream.
    pub size: u32,
}

impl XattrIdEntry {
    pub const ENCODED_SIZE: usize = 16;

    pub fn encode(&self, out: &mut Vec<u8>) {
        push_u64(out, self.xattr_ref.raw());
        push_u32(out, self.count);
        push_u32(out, self.size);
    }
}
