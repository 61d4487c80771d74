#![forbid(unsafe_code)]
//! Block compressor abstraction for sqsh.
//!
//! A [`Compressor`] turns a source buffer into a strictly smaller encoded
//! form, or reports the input as incompressible so the caller stores it
//! raw. Implementations must be deterministic: the same input bytes always
//! produce the same output bytes, regardless of worker count or call
//! history. Backends wrap `flate2` (zlib) and `zstd` (bulk API).

use sqsh_error::{Result, SqshError};
use std::fmt;
use std::str::FromStr;

/// zlib level used for gzip images. Fixed for reproducible output.
const GZIP_LEVEL: u32 = 9;
/// zstd level used for zstd images. Fixed for reproducible output.
const ZSTD_LEVEL: i32 = 15;

/// Codec selection. Wire ids follow the SquashFS compression id table
/// (gzip=1, lzma=2, lzo=3, xz=4, lz4=5, zstd=6); only gzip and zstd are
/// implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Gzip,
    Zstd,
}

impl Codec {
    /// Compression id stored in the superblock.
    #[must_use]
    pub fn wire_id(self) -> u16 {
        match self {
            Codec::Gzip => 1,
            Codec::Zstd => 6,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Gzip => write!(f, "gzip"),
            Codec::Zstd => write!(f, "zstd"),
        }
    }
}

impl FromStr for Codec {
    type Err = SqshError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "gzip" => Ok(Codec::Gzip),
            "zstd" => Ok(Codec::Zstd),
            other => Err(SqshError::Compress(format!(
                "unsupported compressor '{other}' (supported: gzip, zstd)"
            ))),
        }
    }
}

/// A deterministic, stateless-per-call block transform.
pub trait Compressor: Send {
    /// The codec this instance implements.
    fn codec(&self) -> Codec;

    /// Try to encode `src` into `dst`.
    ///
    /// Returns `Some(n)` with the encoded size when the result is strictly
    /// smaller than `src`, `None` when the input is incompressible at this
    /// buffer size (the caller stores the raw bytes).
    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<Option<usize>>;

    /// Create an independent instance for another worker thread.
    fn fork(&self) -> Box<dyn Compressor>;
}

/// Instantiate the backend for `codec`.
#[must_use]
pub fn create(codec: Codec) -> Box<dyn Compressor> {
    match codec {
        Codec::Gzip => Box::new(GzipCompressor::new()),
        Codec::Zstd => Box::new(ZstdCompressor::new()),
    }
}

// ── gzip (zlib container) ───────────────────────────────────────────────────

struct GzipCompressor {
    raw: flate2::Compress,
}

impl GzipCompressor {
    fn new() -> Self {
        Self {
            raw: flate2::Compress::new(flate2::Compression::new(GZIP_LEVEL), true),
        }
    }
}

impl Compressor for GzipCompressor {
    fn codec(&self) -> Codec {
        Codec::Gzip
    }

    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<Option<usize>> {
        self.raw.reset();
        let status = self
            .raw
            .compress(src, dst, flate2::FlushCompress::Finish)
            .map_err(|e| SqshError::Compress(format!("zlib: {e}")))?;

        match status {
            flate2::Status::StreamEnd => {
                let written = self.raw.total_out() as usize;
                if written < src.len() {
                    Ok(Some(written))
                } else {
                    Ok(None)
                }
            }
            // Output buffer filled before the stream ended: the encoded
            // form would be at least as large as the input.
            flate2::Status::Ok | flate2::Status::BufError => Ok(None),
        }
    }

    fn fork(&self) -> Box<dyn Compressor> {
        Box::new(GzipCompressor::new())
    }
}

// ── zstd ────────────────────────────────────────────────────────────────────

struct ZstdCompressor {
    raw: Option<zstd::bulk::Compressor<'static>>,
}

impl ZstdCompressor {
    fn new() -> Self {
        Self {
            raw: zstd::bulk::Compressor::new(ZSTD_LEVEL).ok(),
        }
    }
}

impl Compressor for ZstdCompressor {
    fn codec(&self) -> Codec {
        Codec::Zstd
    }

    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<Option<usize>> {
        let Some(ctx) = self.raw.as_mut() else {
            return Err(SqshError::Compress("zstd context creation failed".into()));
        };
        // The bulk API reports a too-small destination as an error; with a
        // destination capped at the source length that means the encoded
        // form would not be smaller, i.e. the block is incompressible.
        match ctx.compress_to_buffer(src, dst) {
            Ok(written) if written < src.len() => Ok(Some(written)),
            Ok(_) | Err(_) => Ok(None),
        }
    }

    fn fork(&self) -> Box<dyn Compressor> {
        Box::new(ZstdCompressor::new())
    }
}

// ── Decompression (verification tooling and tests) ──────────────────────────

/// Decode `src` into `dst`, returning the decoded size.
///
/// Image production never decompresses; this exists for the test-side
/// readers that verify produced images.
pub fn decompress(codec: Codec, src: &[u8], dst: &mut [u8]) -> Result<usize> {
    match codec {
        Codec::Gzip => {
            let mut raw = flate2::Decompress::new(true);
            let status = raw
                .decompress(src, dst, flate2::FlushDecompress::Finish)
                .map_err(|e| SqshError::Compress(format!("zlib: {e}")))?;
            if status != flate2::Status::StreamEnd {
                return Err(SqshError::Compress(
                    "zlib: truncated or oversized stream".into(),
                ));
            }
            Ok(raw.total_out() as usize)
        }
        Codec::Zstd => {
            let mut raw = zstd::bulk::Decompressor::new()
                .map_err(|e| SqshError::Compress(format!("zstd: {e}")))?;
            raw.decompress_to_buffer(src, dst)
                .map_err(|e| SqshError::Compress(format!("zstd: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends() -> Vec<Box<dyn Compressor>> {
        vec![create(Codec::Gzip), create(Codec::Zstd)]
    }

    #[test]
    fn wire_ids_match_format_table() {
        assert_eq!(Codec::Gzip.wire_id(), 1);
        assert_eq!(Codec::Zstd.wire_id(), 6);
    }

    #[test]
    fn parse_codec_names() {
        assert_eq!("gzip".parse::<Codec>().unwrap(), Codec::Gzip);
        assert_eq!("zstd".parse::<Codec>().unwrap(), Codec::Zstd);
        assert!("lzo".parse::<Codec>().is_err());
    }

    #[test]
    fn compressible_data_round_trips() {
        let src = b"aaaaaaaaaabbbbbbbbbbccccccccccaaaaaaaaaabbbbbbbbbb".repeat(64);
        for mut cmp in backends() {
            let mut dst = vec![0_u8; src.len()];
            let n = cmp
                .compress(&src, &mut dst)
                .unwrap()
                .expect("repetitive data must compress");
            assert!(n < src.len());

            let mut back = vec![0_u8; src.len()];
            let m = decompress(cmp.codec(), &dst[..n], &mut back).unwrap();
            assert_eq!(m, src.len());
            assert_eq!(back, src);
        }
    }

    #[test]
    fn incompressible_data_reports_none() {
        // A deterministic pseudo-random buffer; no codec shrinks it.
        let mut state = 0x2545_F491_4F6C_DD1D_u64;
        let src: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state & 0xFF) as u8
            })
            .collect();
        for mut cmp in backends() {
            let mut dst = vec![0_u8; src.len()];
            assert_eq!(cmp.compress(&src, &mut dst).unwrap(), None);
        }
    }

    #[test]
    fn compression_is_deterministic_across_instances_and_calls() {
        let src = b"the quick brown fox jumps over the lazy dog. ".repeat(200);
        for mut cmp in backends() {
            let mut first = vec![0_u8; src.len()];
            let n1 = cmp.compress(&src, &mut first).unwrap().unwrap();

            // Same instance, second call.
            let mut second = vec![0_u8; src.len()];
            let n2 = cmp.compress(&src, &mut second).unwrap().unwrap();

            // Forked instance, as a worker would hold.
            let mut forked = cmp.fork();
            let mut third = vec![0_u8; src.len()];
            let n3 = forked.compress(&src, &mut third).unwrap().unwrap();

            assert_eq!(first[..n1], second[..n2]);
            assert_eq!(first[..n1], third[..n3]);
        }
    }

    #[test]
    fn empty_input_is_incompressible() {
        for mut cmp in backends() {
            let mut dst = [0_u8; 16];
            assert_eq!(cmp.compress(&[], &mut dst).unwrap(), None);
        }
    }
}
