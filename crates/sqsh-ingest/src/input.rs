//! Input sources.
//!
//! Opens a file for packing in one step: the handle, its on-disk size,
//! and transparent decompression when the first bytes carry a gzip or
//! zstd magic. The packer reads the stream to completion either way and
//! sizes the inode from the bytes it consumed.

use sqsh_error::{Result, SqshError};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Open `path` for reading. Returns the byte stream and the on-disk size
/// of the source file (before any transparent decompression).
pub fn open_for_reading(path: &Path) -> Result<(Box<dyn Read>, u64)> {
    let mut file = File::open(path).map_err(|e| SqshError::io_at(path, e))?;
    let size = file
        .metadata()
        .map_err(|e| SqshError::io_at(path, e))?
        .len();

    let mut magic = [0_u8; 4];
    let got = read_magic(&mut file, &mut magic).map_err(|e| SqshError::io_at(path, e))?;
    file.seek(SeekFrom::Start(0))
        .map_err(|e| SqshError::io_at(path, e))?;

    let stream: Box<dyn Read> = if got >= 2 && magic[..2] == GZIP_MAGIC {
        Box::new(flate2::read::MultiGzDecoder::new(BufReader::new(file)))
    } else if got >= 4 && magic == ZSTD_MAGIC {
        let decoder = zstd::stream::read::Decoder::new(file)
            .map_err(|e| SqshError::io_at(path, e))?;
        Box::new(decoder)
    } else {
        Box::new(BufReader::new(file))
    };
    Ok((stream, size))
}

fn read_magic(file: &mut File, buf: &mut [u8; 4]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn read_all(path: &Path) -> Vec<u8> {
        let (mut stream, _) = open_for_reading(path).unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn plain_files_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        std::fs::write(&path, b"plain contents").unwrap();

        let (_, size) = open_for_reading(&path).unwrap();
        assert_eq!(size, 14);
        assert_eq!(read_all(&path), b"plain contents");
    }

    #[test]
    fn gzip_sources_are_transparently_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.gz");
        let file = std::fs::File::create(&path).unwrap();
        let mut enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        enc.write_all(b"decompressed body").unwrap();
        enc.finish().unwrap();

        assert_eq!(read_all(&path), b"decompressed body");
    }

    #[test]
    fn zstd_sources_are_transparently_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.zst");
        let encoded = zstd::bulk::compress(b"zstd body", 3).unwrap();
        std::fs::write(&path, encoded).unwrap();

        assert_eq!(read_all(&path), b"zstd body");
    }

    #[test]
    fn short_files_do_not_confuse_the_sniffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny");
        std::fs::write(&path, b"a").unwrap();
        assert_eq!(read_all(&path), b"a");
    }

    #[test]
    fn missing_files_report_the_path() {
        let err = match open_for_reading(Path::new("/no/such/file")) {
            Ok(_) => panic!("expected an error for a missing file"),
            Err(e) => e,
        };
        assert!(err.to_string().starts_with("/no/such/file"));
    }
}
