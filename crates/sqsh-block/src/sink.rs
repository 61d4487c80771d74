//! Output backends for the block processor.
//!
//! Data blocks are appended by the producer thread only; dedup reads
//! earlier regions back for byte comparison, and whole-file dedup rewinds
//! the end of the sink.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

/// The block processor's view of the output image.
pub trait BlockSink {
    /// Append `data` at the current end, returning the offset it landed at.
    fn append(&mut self, data: &[u8]) -> io::Result<u64>;

    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Drop everything at and beyond `len`.
    fn truncate(&mut self, len: u64) -> io::Result<()>;

    /// Overwrite existing bytes at `offset` without moving the end.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Current end offset.
    fn len(&mut self) -> io::Result<u64>;

    fn is_empty(&mut self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl BlockSink for File {
    fn append(&mut self, data: &[u8]) -> io::Result<u64> {
        let offset = self.seek(SeekFrom::End(0))?;
        self.write_all(data)?;
        Ok(offset)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_exact(buf)
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.seek(SeekFrom::Start(offset))?;
        self.write_all(data)
    }

    fn len(&mut self) -> io::Result<u64> {
        self.seek(SeekFrom::End(0))
    }
}

impl BlockSink for Cursor<Vec<u8>> {
    fn append(&mut self, data: &[u8]) -> io::Result<u64> {
        let offset = self.get_ref().len() as u64;
        self.get_mut().extend_from_slice(data);
        Ok(offset)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::UnexpectedEof, "offset out of range"))?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= self.get_ref().len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "read past end"))?;
        buf.copy_from_slice(&self.get_ref()[start..end]);
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length out of range"))?;
        self.get_mut().truncate(len);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;
        let end = start
            .checked_add(data.len())
            .filter(|end| *end <= self.get_ref().len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "write past end"))?;
        self.get_mut()[start..end].copy_from_slice(data);
        Ok(())
    }

    fn len(&mut self) -> io::Result<u64> {
        Ok(self.get_ref().len() as u64)
    }
}
