#![forbid(unsafe_code)]
//! Image writer for sqsh.
//!
//! Serializes the post-processed tree into the on-disk tables: inode
//! table, directory table, fragment table, id table, and xattr tables,
//! each inside compressed metadata streams, then stamps the superblock
//! and pads the image to the device block size.
//!
//! Layout order: superblock placeholder, data blocks and fragment blocks
//! (written earlier by the block processor), inode table, directory
//! table, fragment table, id table, xattr table, superblock rewritten in
//! place.

use sqsh_block::{BlockSink, FragmentBlock};
use sqsh_compress::{create, Codec};
use sqsh_error::{Result, SqshError};
use sqsh_ondisk::{
    encode_dev, BasicDir, BasicFile, Device, DirEntry, DirHeader, DirIndexEntry, ExtDir, ExtFile,
    FragmentEntry, InodeHeader, InodeType, Ipc, SuperFlags, Superblock, Symlink, XattrIdEntry,
    DATA_UNCOMPRESSED, DEVICE_BLOCK_SIZE, DIR_RUN_MAX_ENTRIES, SUPERBLOCK_SIZE, TABLE_ABSENT,
};
use sqsh_tree::{NodeId, Payload, Tree, ROOT};
use sqsh_types::{
    push_u32, push_u64, BlockDesc, BlockKind, BlockSize, MetaRef, FRAGMENT_NONE,
    METADATA_CHUNK_SIZE, XATTR_NONE,
};
use tracing::{debug, info};

mod meta;
mod xattr;

pub use meta::MetaStream;
pub use xattr::{split_key, XattrPair, XattrWriter};

/// Writer configuration; mirrors what ends up in the superblock.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub block_size: BlockSize,
    pub codec: Codec,
    /// Stamped as the image modification time.
    pub mtime: u32,
    pub fragments_enabled: bool,
    pub dedup_enabled: bool,
    /// Data blocks were stored raw (reported in the superblock flags).
    pub uncompressed_data: bool,
}

impl WriterConfig {
    #[must_use]
    pub fn new(block_size: BlockSize, codec: Codec) -> Self {
        Self {
            block_size,
            codec,
            mtime: 0,
            fragments_enabled: true,
            dedup_enabled: true,
            uncompressed_data: false,
        }
    }
}

/// Reserve the superblock region at the start of a fresh image. The block
/// processor appends data blocks directly after it.
pub fn write_placeholder<W: BlockSink>(sink: &mut W) -> Result<()> {
    if sink.len()? != 0 {
        return Err(SqshError::Internal(
            "superblock placeholder must be the first write".into(),
        ));
    }
    sink.append(&[0_u8; SUPERBLOCK_SIZE])?;
    Ok(())
}

/// Serializes tables and stamps the superblock.
pub struct ImageWriter {
    cfg: WriterConfig,
}

/// Where a directory's listing landed in the directory table.
struct DirLoc {
    start: MetaRef,
    size: u64,
    index: Vec<DirIndexEntry>,
}

/// What a directory entry needs to know about a child.
struct ChildEntry {
    name: Vec<u8>,
    inode_num: u32,
    inode_ref: MetaRef,
    ty: InodeType,
}

impl ImageWriter {
    #[must_use]
    pub fn new(cfg: WriterConfig) -> Self {
        Self { cfg }
    }

    /// Write every metadata table and the final superblock. The tree must
    /// be post-processed and its regular files packed.
    pub fn finish<W: BlockSink>(
        &self,
        sink: &mut W,
        tree: &Tree,
        fragments: &[FragmentBlock],
        xattrs: &XattrWriter,
    ) -> Result<Superblock> {
        let mut refs: Vec<Option<MetaRef>> = vec![None; tree.node_count()];
        let mut inode_stream = MetaStream::new(create(self.cfg.codec));
        let mut dir_stream = MetaStream::new(create(self.cfg.codec));

        // Non-directories first, in inode order: every possible hard-link
        // target has a known location before any listing references it.
        let mut plain: Vec<NodeId> = tree
            .ids()
            .filter(|id| {
                !matches!(
                    tree.node(*id).payload,
                    Payload::Dir { .. } | Payload::HardLink { .. }
                )
            })
            .collect();
        plain.sort_by_key(|id| tree.node(*id).inode_num);
        for id in plain {
            refs[id.index()] = Some(inode_stream.position());
            let record = self.encode_plain_inode(tree, id)?;
            inode_stream.append(&record)?;
        }

        // Directories in post-order: children before parents, so each
        // listing can reference its children and each directory inode can
        // reference its listing. The root comes last.
        for id in postorder_dirs(tree) {
            let loc = self.write_directory(&mut dir_stream, tree, id, &refs)?;
            refs[id.index()] = Some(inode_stream.position());
            let record = self.encode_dir_inode(tree, id, &loc)?;
            inode_stream.append(&record)?;
        }

        let root_ref = refs[ROOT.index()]
            .ok_or_else(|| SqshError::Internal("root inode never serialized".into()))?;

        let inode_table_start = sink.len()?;
        sink.append(&inode_stream.finish()?)?;
        let directory_table_start = sink.len()?;
        sink.append(&dir_stream.finish()?)?;

        let fragment_table_start = if fragments.is_empty() {
            TABLE_ABSENT
        } else {
            let mut body = Vec::with_capacity(fragments.len() * FragmentEntry::ENCODED_SIZE);
            for frag in fragments {
                FragmentEntry {
                    start: frag.start,
                    size: if frag.compressed {
                        frag.disk_size
                    } else {
                        frag.disk_size | DATA_UNCOMPRESSED
                    },
                }
                .encode(&mut body);
            }
            write_indexed_table(sink, self.cfg.codec, &body)?
        };
        let fragment_entry_count = u32::try_from(fragments.len())
            .map_err(|_| SqshError::Limit("more than 2^32 fragments".into()))?;

        let mut id_body = Vec::with_capacity(tree.id_table().len() * 4);
        for id in tree.id_table() {
            push_u32(&mut id_body, *id);
        }
        let id_table_start = write_indexed_table(sink, self.cfg.codec, &id_body)?;

        let xattr_id_table_start = if xattrs.is_empty() {
            TABLE_ABSENT
        } else {
            write_xattr_table(sink, self.cfg.codec, xattrs)?
        };

        let bytes_used = sink.len()?;
        let padding = bytes_used.next_multiple_of(DEVICE_BLOCK_SIZE) - bytes_used;
        if padding > 0 {
            sink.append(&vec![0_u8; padding as usize])?;
        }

        let mut flags = SuperFlags::empty();
        if self.cfg.dedup_enabled {
            flags |= SuperFlags::DUPLICATES;
        }
        if !self.cfg.fragments_enabled {
            flags |= SuperFlags::NO_FRAGMENTS;
        }
        if self.cfg.uncompressed_data {
            flags |= SuperFlags::UNCOMPRESSED_DATA;
        }
        if xattrs.is_empty() {
            flags |= SuperFlags::NO_XATTRS;
        }

        let superblock = Superblock {
            inode_count: tree.inode_count(),
            modification_time: self.cfg.mtime,
            block_size: self.cfg.block_size.get(),
            fragment_entry_count,
            compression_id: self.cfg.codec.wire_id(),
            block_log: self.cfg.block_size.log2(),
            flags,
            id_count: tree.id_table().len() as u16,
            root_inode_ref: root_ref.raw(),
            bytes_used,
            id_table_start,
            xattr_id_table_start,
            inode_table_start,
            directory_table_start,
            fragment_table_start,
            export_table_start: TABLE_ABSENT,
        };
        sink.write_at(0, &superblock.encode())?;

        info!(
            inodes = superblock.inode_count,
            fragments = superblock.fragment_entry_count,
            ids = superblock.id_count,
            bytes = superblock.bytes_used,
            "image finished"
        );
        Ok(superblock)
    }

    // ── Inode records ───────────────────────────────────────────────────

    fn encode_plain_inode(&self, tree: &Tree, id: NodeId) -> Result<Vec<u8>> {
        let node = tree.node(id);
        let nlink = tree.link_count(id);
        let xattr_idx = node.xattr_idx;
        let mut out = Vec::new();

        match &node.payload {
            Payload::File(data) => {
                let packed = data.packed.as_ref().ok_or_else(|| {
                    SqshError::Internal(format!("file {} was never packed", tree.path_of(id)))
                })?;
                let words: Vec<u32> = packed.blocks.iter().map(block_word).collect();
                let (frag_index, frag_offset) = match packed.fragment {
                    Some(frag) => (frag.index, frag.offset),
                    None => (FRAGMENT_NONE, 0),
                };

                let basic = nlink == 1
                    && xattr_idx == XATTR_NONE
                    && packed.sparse_bytes == 0
                    && packed.size <= u64::from(u32::MAX)
                    && packed.start_block <= u64::from(u32::MAX);
                if basic {
                    self.header(node, InodeType::BasicFile).encode(&mut out);
                    BasicFile {
                        start_block: packed.start_block as u32,
                        frag_index,
                        frag_offset,
                        file_size: packed.size as u32,
                        block_sizes: &words,
                    }
                    .encode(&mut out);
                } else {
                    self.header(node, InodeType::ExtFile).encode(&mut out);
                    ExtFile {
                        start_block: packed.start_block,
                        file_size: packed.size,
                        sparse: packed.sparse_bytes,
                        link_count: nlink,
                        frag_index,
                        frag_offset,
                        xattr_idx,
                        block_sizes: &words,
                    }
                    .encode(&mut out);
                }
            }
            Payload::Symlink { target } => {
                let ty = if xattr_idx == XATTR_NONE {
                    InodeType::BasicSymlink
                } else {
                    InodeType::ExtSymlink
                };
                self.header(node, ty).encode(&mut out);
                Symlink {
                    link_count: nlink,
                    target: target.as_bytes(),
                    xattr_idx: (xattr_idx != XATTR_NONE).then_some(xattr_idx),
                }
                .encode(&mut out)?;
            }
            Payload::CharDev { major, minor } | Payload::BlockDev { major, minor } => {
                let char_dev = matches!(node.payload, Payload::CharDev { .. });
                let ty = match (char_dev, xattr_idx == XATTR_NONE) {
                    (true, true) => InodeType::BasicCharDev,
                    (true, false) => InodeType::ExtCharDev,
                    (false, true) => InodeType::BasicBlockDev,
                    (false, false) => InodeType::ExtBlockDev,
                };
                self.header(node, ty).encode(&mut out);
                Device {
                    link_count: nlink,
                    rdev: encode_dev(*major, *minor)?,
                    xattr_idx: (xattr_idx != XATTR_NONE).then_some(xattr_idx),
                }
                .encode(&mut out);
            }
            Payload::Fifo | Payload::Socket => {
                let fifo = matches!(node.payload, Payload::Fifo);
                let ty = match (fifo, xattr_idx == XATTR_NONE) {
                    (true, true) => InodeType::BasicFifo,
                    (true, false) => InodeType::ExtFifo,
                    (false, true) => InodeType::BasicSocket,
                    (false, false) => InodeType::ExtSocket,
                };
                self.header(node, ty).encode(&mut out);
                Ipc {
                    link_count: nlink,
                    xattr_idx: (xattr_idx != XATTR_NONE).then_some(xattr_idx),
                }
                .encode(&mut out);
            }
            Payload::Dir { .. } | Payload::HardLink { .. } => {
                return Err(SqshError::Internal(
                    "directory or alias reached the plain-inode encoder".into(),
                ));
            }
        }
        Ok(out)
    }

    fn encode_dir_inode(&self, tree: &Tree, id: NodeId, loc: &DirLoc) -> Result<Vec<u8>> {
        let node = tree.node(id);
        let nlink = tree.link_count(id);
        // The root's parent is the imaginary inode one past the count.
        let parent_inode = match node.parent {
            Some(parent) => tree.node(parent).inode_num,
            None => tree.inode_count() + 1,
        };
        let file_size = loc.size + 3;
        let start_block = u32::try_from(loc.start.chunk_start())
            .map_err(|_| SqshError::Limit("directory table exceeds 4 GiB".into()))?;

        let mut out = Vec::new();
        let basic =
            node.xattr_idx == XATTR_NONE && loc.index.is_empty() && file_size <= u64::from(u16::MAX);
        if basic {
            self.header(node, InodeType::BasicDir).encode(&mut out);
            BasicDir {
                start_block,
                link_count: nlink,
                file_size: file_size as u16,
                block_offset: loc.start.offset(),
                parent_inode,
            }
            .encode(&mut out);
        } else {
            self.header(node, InodeType::ExtDir).encode(&mut out);
            ExtDir {
                link_count: nlink,
                file_size: u32::try_from(file_size)
                    .map_err(|_| SqshError::Limit("directory listing exceeds 4 GiB".into()))?,
                start_block,
                parent_inode,
                block_offset: loc.start.offset(),
                xattr_idx: node.xattr_idx,
                index: loc.index.clone(),
            }
            .encode(&mut out)?;
        }
        Ok(out)
    }

    fn header(&self, node: &sqsh_tree::Node, ty: InodeType) -> InodeHeader {
        InodeHeader {
            ty,
            mode: node.attrs.mode,
            uid_idx: node.uid_idx,
            gid_idx: node.gid_idx,
            mtime: node.attrs.mtime,
            inode_number: node.inode_num,
        }
    }

    // ── Directory table ─────────────────────────────────────────────────

    /// Append one directory's listing: entries grouped into runs of up to
    /// 256 under shared headers, with an index entry for every run header
    /// that starts in a new metadata chunk.
    fn write_directory(
        &self,
        stream: &mut MetaStream,
        tree: &Tree,
        dir: NodeId,
        refs: &[Option<MetaRef>],
    ) -> Result<DirLoc> {
        let Payload::Dir { children } = &tree.node(dir).payload else {
            return Err(SqshError::Internal("non-directory in dir writer".into()));
        };

        let mut entries = Vec::with_capacity(children.len());
        for child_id in children {
            let child = tree.node(*child_id);
            let (concrete, ty) = match &child.payload {
                Payload::HardLink {
                    target: Some(target),
                    ..
                } => (*target, basic_type(tree, *target)?),
                Payload::HardLink { target: None, .. } => {
                    return Err(SqshError::Internal(format!(
                        "unresolved hard link {}",
                        tree.path_of(*child_id)
                    )));
                }
                _ => (*child_id, basic_type(tree, *child_id)?),
            };
            let inode_ref = refs[concrete.index()].ok_or_else(|| {
                SqshError::Internal(format!(
                    "child {} serialized out of order",
                    tree.path_of(concrete)
                ))
            })?;
            entries.push(ChildEntry {
                name: child.name.clone().into_bytes(),
                inode_num: child.inode_num,
                inode_ref,
                ty,
            });
        }

        let start = stream.position();
        let listing_base = stream.uncompressed_position();
        let mut index = Vec::new();
        let mut prev_header_chunk: Option<u64> = None;

        let mut rest = entries.as_slice();
        while !rest.is_empty() {
            let run_len = run_length(rest);
            let (run, tail) = rest.split_at(run_len);
            rest = tail;

            let header_pos = stream.position();
            if let Some(prev) = prev_header_chunk {
                if header_pos.chunk_start() != prev {
                    index.push(DirIndexEntry {
                        index: u32::try_from(stream.uncompressed_position() - listing_base)
                            .map_err(|_| {
                                SqshError::Limit("directory listing exceeds 4 GiB".into())
                            })?,
                        start: u32::try_from(header_pos.chunk_start()).map_err(|_| {
                            SqshError::Limit("directory table exceeds 4 GiB".into())
                        })?,
                        name: run[0].name.clone(),
                    });
                }
            }
            prev_header_chunk = Some(header_pos.chunk_start());

            let base = &run[0];
            let mut buf = Vec::new();
            DirHeader {
                count: run.len() as u32,
                start: u32::try_from(base.inode_ref.chunk_start())
                    .map_err(|_| SqshError::Limit("inode table exceeds 4 GiB".into()))?,
                inode_number: base.inode_num,
            }
            .encode(&mut buf);
            for entry in run {
                DirEntry {
                    offset: entry.inode_ref.offset(),
                    inode_delta: (i64::from(entry.inode_num) - i64::from(base.inode_num)) as i16,
                    ty: entry.ty,
                    name: &entry.name,
                }
                .encode(&mut buf)?;
            }
            stream.append(&buf)?;
        }

        let size = stream.uncompressed_position() - listing_base;
        debug!(
            dir = %tree.path_of(dir),
            entries = children.len(),
            bytes = size,
            index = index.len(),
            "directory listing written"
        );
        Ok(DirLoc { start, size, index })
    }
}

/// How many of the pending entries fit under one run header: capped at
/// 256, sharing the first entry's inode chunk, with inode deltas that fit
/// an i16.
fn run_length(entries: &[ChildEntry]) -> usize {
    let base = &entries[0];
    let mut n = 1;
    while n < entries.len() && n < DIR_RUN_MAX_ENTRIES {
        let entry = &entries[n];
        if entry.inode_ref.chunk_start() != base.inode_ref.chunk_start() {
            break;
        }
        let delta = i64::from(entry.inode_num) - i64::from(base.inode_num);
        if delta < i64::from(i16::MIN) || delta > i64::from(i16::MAX) {
            break;
        }
        n += 1;
    }
    n
}

fn basic_type(tree: &Tree, id: NodeId) -> Result<InodeType> {
    Ok(match &tree.node(id).payload {
        Payload::Dir { .. } => InodeType::BasicDir,
        Payload::File(_) => InodeType::BasicFile,
        Payload::Symlink { .. } => InodeType::BasicSymlink,
        Payload::BlockDev { .. } => InodeType::BasicBlockDev,
        Payload::CharDev { .. } => InodeType::BasicCharDev,
        Payload::Fifo => InodeType::BasicFifo,
        Payload::Socket => InodeType::BasicSocket,
        Payload::HardLink { .. } => {
            return Err(SqshError::Internal(
                "alias chains must resolve before serialization".into(),
            ));
        }
    })
}

/// On-disk size word of a data block.
fn block_word(desc: &BlockDesc) -> u32 {
    match desc.kind {
        BlockKind::Sparse => 0,
        BlockKind::Compressed => desc.disk_size,
        BlockKind::Raw => desc.disk_size | DATA_UNCOMPRESSED,
    }
}

/// Write a table body as metadata chunks followed by an index of absolute
/// chunk offsets; returns the offset of the index, which is what the
/// superblock points at.
fn write_indexed_table<W: BlockSink>(sink: &mut W, codec: Codec, body: &[u8]) -> Result<u64> {
    let mut cmp = create(codec);
    let mut offsets = Vec::new();
    for chunk in body.chunks(METADATA_CHUNK_SIZE) {
        offsets.push(sink.len()?);
        let encoded = meta::encode_chunk(cmp.as_mut(), chunk)?;
        sink.append(&encoded)?;
    }
    let start = sink.len()?;
    let mut index = Vec::with_capacity(offsets.len() * 8);
    for offset in offsets {
        push_u64(&mut index, offset);
    }
    sink.append(&index)?;
    Ok(start)
}

/// Xattr storage: the kv metadata stream, the id-entry metadata chunks,
/// then a header (kv start, set count) followed by the id-chunk index.
fn write_xattr_table<W: BlockSink>(sink: &mut W, codec: Codec, xattrs: &XattrWriter) -> Result<u64> {
    let mut kv = MetaStream::new(create(codec));
    let mut id_body = Vec::new();
    for set in xattrs.sets() {
        let xattr_ref = kv.position();
        let before = kv.uncompressed_position();
        let mut buf = Vec::new();
        for pair in set {
            sqsh_ondisk::encode_xattr_key(&mut buf, pair.ns_tag, &pair.key)?;
            sqsh_ondisk::encode_xattr_value(&mut buf, &pair.value)?;
        }
        kv.append(&buf)?;
        let size = u32::try_from(kv.uncompressed_position() - before)
            .map_err(|_| SqshError::Limit("xattr set exceeds 4 GiB".into()))?;
        XattrIdEntry {
            xattr_ref,
            count: set.len() as u32,
            size,
        }
        .encode(&mut id_body);
    }

    let kv_start = sink.len()?;
    sink.append(&kv.finish()?)?;

    let mut cmp = create(codec);
    let mut offsets = Vec::new();
    for chunk in id_body.chunks(METADATA_CHUNK_SIZE) {
        offsets.push(sink.len()?);
        sink.append(&meta::encode_chunk(cmp.as_mut(), chunk)?)?;
    }

    let table_start = sink.len()?;
    let mut buf = Vec::new();
    push_u64(&mut buf, kv_start);
    push_u32(
        &mut buf,
        u32::try_from(xattrs.sets().len())
            .map_err(|_| SqshError::Limit("more than 2^32 xattr sets".into()))?,
    );
    push_u32(&mut buf, 0);
    for offset in offsets {
        push_u64(&mut buf, offset);
    }
    sink.append(&buf)?;
    Ok(table_start)
}

/// Directories in post-order over sorted children; the root is last.
fn postorder_dirs(tree: &Tree) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut stack = vec![(ROOT, false)];
    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            out.push(id);
            continue;
        }
        stack.push((id, true));
        if let Payload::Dir { children } = &tree.node(id).payload {
            for child in children.iter().rev() {
                if tree.node(*child).is_dir() {
                    stack.push((*child, false));
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_words_encode_kind() {
        let compressed = BlockDesc {
            uncompressed_size: 4096,
            disk_size: 1000,
            kind: BlockKind::Compressed,
        };
        let raw = BlockDesc {
            uncompressed_size: 4096,
            disk_size: 4096,
            kind: BlockKind::Raw,
        };
        let sparse = BlockDesc {
            uncompressed_size: 4096,
            disk_size: 0,
            kind: BlockKind::Sparse,
        };
        assert_eq!(block_word(&compressed), 1000);
        assert_eq!(block_word(&raw), 4096 | DATA_UNCOMPRESSED);
        assert_eq!(block_word(&sparse), 0);
    }

    #[test]
    fn postorder_visits_children_before_parents() {
        let mut tree = Tree::new(sqsh_tree::TreeDefaults::default());
        let attrs = sqsh_tree::NodeAttrs {
            mode: 0o755,
            uid: 0,
            gid: 0,
            mtime: 0,
        };
        tree.add("/a/b", attrs, Payload::empty_dir()).unwrap();
        tree.add("/c", attrs, Payload::empty_dir()).unwrap();
        tree.post_process().unwrap();

        let order = postorder_dirs(&tree);
        let paths: Vec<String> = order.iter().map(|id| tree.path_of(*id)).collect();
        assert_eq!(paths, vec!["/a/b", "/a", "/c", "/"]);
    }

    #[test]
    fn run_length_breaks_on_chunk_change_and_delta() {
        let entry = |num: u32, chunk: u64| ChildEntry {
            name: b"x".to_vec(),
            inode_num: num,
            inode_ref: MetaRef::new(chunk, 0),
            ty: InodeType::BasicFile,
        };
        // Chunk change after two entries.
        let entries = vec![entry(2, 0), entry(3, 0), entry(4, 8192)];
        assert_eq!(run_length(&entries), 2);
        // Delta overflow.
        let entries = vec![entry(2, 0), entry(40_000, 0)];
        assert_eq!(run_length(&entries), 1);
        // A full run caps at 256.
        let entries: Vec<ChildEntry> = (0..300).map(|i| entry(2 + i, 0)).collect();
        assert_eq!(run_length(&entries), DIR_RUN_MAX_ENTRIES);
    }
}
