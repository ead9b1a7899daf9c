use std::io::{self, Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use parking_lot::Mutex;

use super::metadata::MetadataBlock;

/// The one handle through which every byte of an image is read. Each seek+read sequence runs
/// under a single lock, so readers on different threads never interleave their positioning.
/// Offsets are relative to the start of the image, which may sit at `base` inside a larger
/// file.
#[derive(Debug)]
pub struct SharedSource<R> {
    inner: Mutex<R>,
    base: u64,
    len: u64,
}

impl<R: Read + Seek> SharedSource<R> {
    pub fn new(mut reader: R, base: u64) -> io::Result<Self> {
        let end = reader.seek(SeekFrom::End(0))?;
        if base > end {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("image offset {base} beyond end of source ({end} bytes)"),
            ));
        }
        Ok(Self { inner: Mutex::new(reader), base, len: end - base })
    }

    /// Bytes available from the image start to the end of the source.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Read exactly `len` bytes at `offset`.
    pub fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; len];
        let mut r = self.inner.lock();
        r.seek(SeekFrom::Start(self.base + offset))?;
        r.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read the 16-bit header and the body of the metadata block at `offset` in one locked
    /// sequence. Decompression is left to the caller, outside the lock.
    pub(crate) fn read_metadata_block(&self, offset: u64) -> io::Result<(u16, Vec<u8>)> {
        let mut r = self.inner.lock();
        r.seek(SeekFrom::Start(self.base + offset))?;
        let header = r.read_u16::<LittleEndian>()?;
        let mut body = vec![0; MetadataBlock::body_len(header)];
        r.read_exact(&mut body)?;
        Ok((header, body))
    }

    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}
