//! Minimal SquashFS reader used to verify produced images. Test-only:
//! it panics on malformed input instead of reporting errors.

use sqsh_compress::{decompress, Codec};
use sqsh_ondisk::{Superblock, META_UNCOMPRESSED, TABLE_ABSENT};
use sqsh_types::{
    read_le_u16, read_le_u32, read_le_u64, MetaRef, FRAGMENT_NONE, METADATA_CHUNK_SIZE,
};
use std::collections::HashMap;

const WORD_SIZE_MASK: u32 = (1 << 24) - 1;
const WORD_UNCOMPRESSED: u32 = 1 << 24;

fn codec_of(id: u16) -> Codec {
    match id {
        1 => Codec::Gzip,
        6 => Codec::Zstd,
        other => panic!("unsupported compression id {other}"),
    }
}

/// One decoded metadata stream with its chunk-offset map.
struct MetaTable {
    data: Vec<u8>,
    chunks: HashMap<u64, usize>,
}

impl MetaTable {
    fn decode(raw: &[u8], codec: Codec) -> Self {
        let mut data = Vec::new();
        let mut chunks = HashMap::new();
        let mut pos = 0_usize;
        while pos < raw.len() {
            chunks.insert(pos as u64, data.len());
            let header = read_le_u16(raw, pos).unwrap();
            pos += 2;
            let size = usize::from(header & !META_UNCOMPRESSED);
            let body = &raw[pos..pos + size];
            pos += size;
            if header & META_UNCOMPRESSED != 0 {
                data.extend_from_slice(body);
            } else {
                let mut buf = vec![0_u8; METADATA_CHUNK_SIZE];
                let n = decompress(codec, body, &mut buf).unwrap();
                data.extend_from_slice(&buf[..n]);
            }
        }
        Self { data, chunks }
    }

    fn at(&self, reference: MetaRef) -> usize {
        self.chunks[&reference.chunk_start()] + usize::from(reference.offset())
    }
}

struct Cur<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cur<'a> {
    fn u16(&mut self) -> u16 {
        let v = read_le_u16(self.data, self.pos).unwrap();
        self.pos += 2;
        v
    }
    fn u32(&mut self) -> u32 {
        let v = read_le_u32(self.data, self.pos).unwrap();
        self.pos += 4;
        v
    }
    fn u64(&mut self) -> u64 {
        let v = read_le_u64(self.data, self.pos).unwrap();
        self.pos += 8;
        v
    }
    fn bytes(&mut self, n: usize) -> Vec<u8> {
        let v = self.data[self.pos..self.pos + n].to_vec();
        self.pos += n;
        v
    }
}

#[derive(Debug)]
pub struct InodeRecord {
    pub ty: u16,
    pub mode: u16,
    pub uid_idx: u16,
    pub gid_idx: u16,
    pub mtime: u32,
    pub inode_number: u32,
    pub body: InodeBody,
}

#[derive(Debug)]
pub enum InodeBody {
    Dir {
        start_block: u32,
        nlink: u32,
        size: u32,
        offset: u16,
        parent: u32,
        xattr: u32,
    },
    File {
        start_block: u64,
        size: u64,
        sparse: u64,
        nlink: u32,
        frag_index: u32,
        frag_offset: u32,
        xattr: u32,
        words: Vec<u32>,
    },
    Symlink {
        nlink: u32,
        target: Vec<u8>,
        xattr: u32,
    },
    Dev {
        nlink: u32,
        rdev: u32,
        xattr: u32,
    },
    Ipc {
        nlink: u32,
        xattr: u32,
    },
}

pub struct Image {
    pub bytes: Vec<u8>,
    pub sb: Superblock,
    codec: Codec,
    inode: MetaTable,
    dir: MetaTable,
    pub fragments: Vec<(u64, u32)>,
    pub ids: Vec<u32>,
    pub xattrs: Vec<Vec<(u16, Vec<u8>, Vec<u8>)>>,
}

impl Image {
    pub fn parse(bytes: &[u8]) -> Self {
        let sb = Superblock::parse(bytes).unwrap();
        let codec = codec_of(sb.compression_id);

        let inode_raw =
            &bytes[sb.inode_table_start as usize..sb.directory_table_start as usize];
        let inode = MetaTable::decode(inode_raw, codec);

        // The directory table ends where the next table's first metadata
        // chunk begins: the fragment chunks when fragments exist, the id
        // chunks otherwise (the id table is never empty).
        let dir_end = if sb.fragment_entry_count > 0 {
            read_le_u64(bytes, sb.fragment_table_start as usize).unwrap()
        } else {
            read_le_u64(bytes, sb.id_table_start as usize).unwrap()
        };
        let dir_raw = &bytes[sb.directory_table_start as usize..dir_end as usize];
        let dir = MetaTable::decode(dir_raw, codec);

        let mut fragments = Vec::new();
        if sb.fragment_entry_count > 0 {
            let body = read_indexed_table(
                bytes,
                sb.fragment_table_start as usize,
                sb.fragment_entry_count as usize * 16,
                codec,
            );
            let mut cur = Cur {
                data: &body,
                pos: 0,
            };
            for _ in 0..sb.fragment_entry_count {
                let start = cur.u64();
                let word = cur.u32();
                cur.u32(); // unused
                fragments.push((start, word));
            }
        }

        let id_body = read_indexed_table(
            bytes,
            sb.id_table_start as usize,
            sb.id_count as usize * 4,
            codec,
        );
        let ids: Vec<u32> = id_body
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let mut xattrs = Vec::new();
        if sb.xattr_id_table_start != TABLE_ABSENT {
            let base = sb.xattr_id_table_start as usize;
            let kv_start = read_le_u64(bytes, base).unwrap();
            let count = read_le_u32(bytes, base + 8).unwrap() as usize;
            let chunk_count = (count * 16).div_ceil(METADATA_CHUNK_SIZE);
            let mut offsets = Vec::new();
            for i in 0..chunk_count {
                offsets.push(read_le_u64(bytes, base + 16 + i * 8).unwrap());
            }
            let entry_body = decode_chunks(bytes, &offsets, count * 16, codec);
            let mut id_entries = Vec::new();
            {
                let mut cur = Cur {
                    data: &entry_body,
                    pos: 0,
                };
                for _ in 0..count {
                    let reference = cur.u64();
                    let pairs = cur.u32();
                    cur.u32(); // size
                    id_entries.push((reference, pairs));
                }
            }

            let kv_end = offsets[0] as usize;
            let kv = MetaTable::decode(&bytes[kv_start as usize..kv_end], codec);
            for (reference, pairs) in id_entries {
                let mut cur = Cur {
                    data: &kv.data,
                    pos: kv.at(MetaRef::new(reference >> 16, (reference & 0xFFFF) as u16)),
                };
                let mut set = Vec::new();
                for _ in 0..pairs {
                    let tag = cur.u16();
                    let nsize = cur.u16();
                    let name = cur.bytes(usize::from(nsize));
                    let vsize = cur.u32();
                    let value = cur.bytes(vsize as usize);
                    set.push((tag, name, value));
                }
                xattrs.push(set);
            }
        }

        Self {
            bytes: bytes.to_vec(),
            sb,
            codec,
            inode,
            dir,
            fragments,
            ids,
            xattrs,
        }
    }

    pub fn id(&self, idx: u16) -> u32 {
        self.ids[usize::from(idx)]
    }

    pub fn root(&self) -> InodeRecord {
        let reference = MetaRef::new(
            self.sb.root_inode_ref >> 16,
            (self.sb.root_inode_ref & 0xFFFF) as u16,
        );
        self.read_inode(reference)
    }

    pub fn read_inode(&self, reference: MetaRef) -> InodeRecord {
        let mut cur = Cur {
            data: &self.inode.data,
            pos: self.inode.at(reference),
        };
        let ty = cur.u16();
        let mode = cur.u16();
        let uid_idx = cur.u16();
        let gid_idx = cur.u16();
        let mtime = cur.u32();
        let inode_number = cur.u32();
        let bs = u64::from(self.sb.block_size);

        let body = match ty {
            1 => {
                let start_block = cur.u32();
                let nlink = cur.u32();
                let size = u32::from(cur.u16());
                let offset = cur.u16();
                let parent = cur.u32();
                InodeBody::Dir {
                    start_block,
                    nlink,
                    size,
                    offset,
                    parent,
                    xattr: !0,
                }
            }
            8 => {
                let nlink = cur.u32();
                let size = cur.u32();
                let start_block = cur.u32();
                let parent = cur.u32();
                let index_count = cur.u16();
                let offset = cur.u16();
                let xattr = cur.u32();
                for _ in 0..index_count {
                    cur.u32();
                    cur.u32();
                    let name_size = cur.u32() as usize;
                    cur.bytes(name_size + 1);
                }
                InodeBody::Dir {
                    start_block,
                    nlink,
                    size,
                    offset,
                    parent,
                    xattr,
                }
            }
            2 => {
                let start_block = u64::from(cur.u32());
                let frag_index = cur.u32();
                let frag_offset = cur.u32();
                let size = u64::from(cur.u32());
                let words = read_words(&mut cur, size, bs, frag_index);
                InodeBody::File {
                    start_block,
                    size,
                    sparse: 0,
                    nlink: 1,
                    frag_index,
                    frag_offset,
                    xattr: !0,
                    words,
                }
            }
            9 => {
                let start_block = cur.u64();
                let size = cur.u64();
                let sparse = cur.u64();
                let nlink = cur.u32();
                let frag_index = cur.u32();
                let frag_offset = cur.u32();
                let xattr = cur.u32();
                let words = read_words(&mut cur, size, bs, frag_index);
                InodeBody::File {
                    start_block,
                    size,
                    sparse,
                    nlink,
                    frag_index,
                    frag_offset,
                    xattr,
                    words,
                }
            }
            3 | 10 => {
                let nlink = cur.u32();
                let tsize = cur.u32() as usize;
                let target = cur.bytes(tsize);
                let xattr = if ty == 10 { cur.u32() } else { !0 };
                InodeBody::Symlink {
                    nlink,
                    target,
                    xattr,
                }
            }
            4 | 5 | 11 | 12 => {
                let nlink = cur.u32();
                let rdev = cur.u32();
                let xattr = if ty >= 11 { cur.u32() } else { !0 };
                InodeBody::Dev { nlink, rdev, xattr }
            }
            6 | 7 | 13 | 14 => {
                let nlink = cur.u32();
                let xattr = if ty >= 13 { cur.u32() } else { !0 };
                InodeBody::Ipc { nlink, xattr }
            }
            other => panic!("unknown inode type {other}"),
        };

        InodeRecord {
            ty,
            mode,
            uid_idx,
            gid_idx,
            mtime,
            inode_number,
            body,
        }
    }

    /// Entries of a directory: (name, inode number, inode reference).
    pub fn list_dir(&self, record: &InodeRecord) -> Vec<(Vec<u8>, u32, MetaRef)> {
        let InodeBody::Dir {
            start_block,
            size,
            offset,
            ..
        } = record.body
        else {
            panic!("not a directory");
        };
        let listing_len = size as usize - 3;
        if listing_len == 0 {
            return Vec::new();
        }
        let mut cur = Cur {
            data: &self.dir.data,
            pos: self.dir.at(MetaRef::new(u64::from(start_block), offset)),
        };
        let end = cur.pos + listing_len;

        let mut out = Vec::new();
        while cur.pos < end {
            let count = cur.u32() + 1;
            let start = cur.u32();
            let base = cur.u32();
            for _ in 0..count {
                let entry_offset = cur.u16();
                let delta = cur.u16() as i16;
                let _ty = cur.u16();
                let name_size = usize::from(cur.u16()) + 1;
                let name = cur.bytes(name_size);
                let num = (i64::from(base) + i64::from(delta)) as u32;
                out.push((name, num, MetaRef::new(u64::from(start), entry_offset)));
            }
        }
        assert_eq!(cur.pos, end, "directory listing length mismatch");
        out
    }

    pub fn lookup(&self, path: &str) -> Option<InodeRecord> {
        let mut current = self.root();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let entries = self.list_dir(&current);
            let entry = entries
                .iter()
                .find(|(name, _, _)| name.as_slice() == part.as_bytes())?;
            current = self.read_inode(entry.2);
        }
        Some(current)
    }

    /// Reassemble a file's content from its blocks and fragment.
    pub fn read_file(&self, record: &InodeRecord) -> Vec<u8> {
        let InodeBody::File {
            start_block,
            size,
            frag_index,
            frag_offset,
            ref words,
            ..
        } = record.body
        else {
            panic!("not a file");
        };
        let bs = u64::from(self.sb.block_size);
        let mut out = Vec::with_capacity(size as usize);
        let mut disk = start_block;
        for (i, word) in words.iter().enumerate() {
            let expected = if frag_index != FRAGMENT_NONE {
                bs
            } else {
                bs.min(size - i as u64 * bs)
            } as usize;
            if *word == 0 {
                out.extend(std::iter::repeat(0_u8).take(expected));
                continue;
            }
            let block = self.read_data_block(disk, *word, expected);
            disk += u64::from(word & WORD_SIZE_MASK);
            out.extend_from_slice(&block);
        }

        if frag_index != FRAGMENT_NONE {
            let (start, word) = self.fragments[frag_index as usize];
            let tail_len = (size - words.len() as u64 * bs) as usize;
            let block =
                self.read_data_block(start, word, self.sb.block_size as usize);
            let at = frag_offset as usize;
            out.extend_from_slice(&block[at..at + tail_len]);
        }

        assert_eq!(out.len() as u64, size);
        out
    }

    /// Decode one data or fragment block; `max` bounds the decompressed
    /// size (fragment blocks may be shorter).
    fn read_data_block(&self, offset: u64, word: u32, max: usize) -> Vec<u8> {
        let disk_size = (word & WORD_SIZE_MASK) as usize;
        let raw = &self.bytes[offset as usize..offset as usize + disk_size];
        if word & WORD_UNCOMPRESSED != 0 {
            raw.to_vec()
        } else {
            let mut buf = vec![0_u8; max.max(disk_size)];
            let n = decompress(self.codec, raw, &mut buf).unwrap();
            buf.truncate(n);
            buf
        }
    }
}

/// Decode the metadata chunks listed at `index_start` and concatenate
/// them into the table body.
fn read_indexed_table(bytes: &[u8], index_start: usize, body_len: usize, codec: Codec) -> Vec<u8> {
    let chunk_count = body_len.div_ceil(METADATA_CHUNK_SIZE);
    let mut offsets = Vec::new();
    for i in 0..chunk_count {
        offsets.push(read_le_u64(bytes, index_start + i * 8).unwrap());
    }
    decode_chunks(bytes, &offsets, body_len, codec)
}

fn decode_chunks(bytes: &[u8], offsets: &[u64], body_len: usize, codec: Codec) -> Vec<u8> {
    let mut out = Vec::new();
    for off in offsets {
        let off = *off as usize;
        let header = read_le_u16(bytes, off).unwrap();
        let size = usize::from(header & !META_UNCOMPRESSED);
        let body = &bytes[off + 2..off + 2 + size];
        if header & META_UNCOMPRESSED != 0 {
            out.extend_from_slice(body);
        } else {
            let mut buf = vec![0_u8; METADATA_CHUNK_SIZE];
            let n = decompress(codec, body, &mut buf).unwrap();
            out.extend_from_slice(&buf[..n]);
        }
    }
    out.truncate(body_len);
    out
}

fn read_words(cur: &mut Cur<'_>, size: u64, bs: u64, frag_index: u32) -> Vec<u32> {
    let count = if frag_index != FRAGMENT_NONE {
        size / bs
    } else {
        size.div_ceil(bs)
    };
    (0..count).map(|_| cur.u32()).collect()
}
