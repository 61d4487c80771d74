//! Metadata streams.
//!
//! An append-only byte sequence chunked into units of up to 8 KiB. Each
//! chunk is compressed independently and prefixed with a 16-bit header:
//! the low 15 bits carry the on-disk size, the high bit marks a chunk
//! stored raw. Logical positions are `(chunk_disk_offset << 16) |
//! in_chunk_offset`, relative to the stream start.

use sqsh_compress::Compressor;
use sqsh_error::{Result, SqshError};
use sqsh_types::{push_u16, MetaRef, METADATA_CHUNK_SIZE};

/// Encode one chunk: try the codec, fall back to storing it raw.
pub(crate) fn encode_chunk(cmp: &mut dyn Compressor, data: &[u8]) -> Result<Vec<u8>> {
    debug_assert!(!data.is_empty() && data.len() <= METADATA_CHUNK_SIZE);
    let mut scratch = vec![0_u8; data.len()];
    let mut out = Vec::with_capacity(2 + data.len());
    match cmp.compress(data, &mut scratch)? {
        Some(n) => {
            push_u16(&mut out, n as u16);
            out.extend_from_slice(&scratch[..n]);
        }
        None => {
            push_u16(&mut out, data.len() as u16 | sqsh_ondisk::META_UNCOMPRESSED);
            out.extend_from_slice(data);
        }
    }
    Ok(out)
}

/// One metadata stream under construction.
pub struct MetaStream {
    cmp: Box<dyn Compressor>,
    /// Uncompressed bytes of the chunk currently being filled.
    raw: Vec<u8>,
    /// Encoded stream: headers plus chunk bodies.
    out: Vec<u8>,
    /// Uncompressed bytes already sealed into chunks.
    flushed: u64,
}

impl MetaStream {
    #[must_use]
    pub fn new(cmp: Box<dyn Compressor>) -> Self {
        Self {
            cmp,
            raw: Vec::with_capacity(METADATA_CHUNK_SIZE),
            out: Vec::new(),
            flushed: 0,
        }
    }

    /// Position the next appended byte will have.
    #[must_use]
    pub fn position(&self) -> MetaRef {
        MetaRef::new(self.out.len() as u64, self.raw.len() as u16)
    }

    /// Total uncompressed bytes appended so far.
    #[must_use]
    pub fn uncompressed_position(&self) -> u64 {
        self.flushed + self.raw.len() as u64
    }

    pub fn append(&mut self, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            let space = METADATA_CHUNK_SIZE - self.raw.len();
            let take = space.min(bytes.len());
            self.raw.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.raw.len() == METADATA_CHUNK_SIZE {
                self.seal_chunk()?;
            }
        }
        Ok(())
    }

    fn seal_chunk(&mut self) -> Result<()> {
        if self.raw.is_empty() {
            return Ok(());
        }
        let encoded = encode_chunk(self.cmp.as_mut(), &self.raw)?;
        self.out.extend_from_slice(&encoded);
        self.flushed += self.raw.len() as u64;
        self.raw.clear();
        if self.out.len() as u64 >= 1 << 48 {
            return Err(SqshError::Limit("metadata stream exceeds 2^48 bytes".into()));
        }
        Ok(())
    }

    /// Seal the trailing partial chunk and return the encoded stream.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        self.seal_chunk()?;
        Ok(self.out)
    }
}
