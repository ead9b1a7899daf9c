use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use super::image::ImageCore;
use super::inode::BlockDescriptor;
use crate::error::{Error, Result};

// Divide x by y, rounding up any fractional result
macro_rules! div_ceil {
    ($x:expr, $y:expr) => { ($x + $y - 1) / $y }
}
pub(crate) use div_ceil;

// Metadata blocks decompress to at most 8 KiB
pub const METADATA_BLOCK_SIZE: usize = 8192;

const METADATA_UNCOMPRESSED: u16 = 0x8000;

/// Packed location of an inode: the byte offset of its metadata block relative to the inode
/// table, and the offset of the inode inside the uncompressed block. This is the stable key a
/// catalog stores instead of the decoded inode.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InodeAddress {
    val: u64
}

impl InodeAddress {
    pub const MAX_START_BLOCK: u64 = (1 << 48) - 1;

    /// Pack a block start and in-block offset, rejecting components that do not fit.
    pub fn new(start_block: u64, offset: u64) -> Result<Self> {
        if start_block > Self::MAX_START_BLOCK {
            return Err(Error::Format(format!("inode block start {start_block} exceeds 48 bits")));
        }
        if offset > u64::from(u16::MAX) {
            return Err(Error::Format(format!("inode offset {offset} exceeds 16 bits")));
        }
        Ok(Self { val: (start_block << 16) | offset })
    }

    /// Reinterpret a packed value, as found on disk or in a catalog row.
    pub fn from_raw(val: u64) -> Self {
        Self { val }
    }

    pub fn as_u64(self) -> u64 {
        self.val
    }

    pub fn start_block(self) -> u64 {
        self.val >> 16
    }

    pub fn offset(self) -> u16 {
        (self.val & 0xFFFF) as u16
    }
}

impl fmt::Debug for InodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.start_block(), self.offset())
    }
}

/// One decompressed metadata block and the number of bytes it occupies on disk (header
/// included), which locates the block that follows it.
#[derive(Debug)]
pub(crate) struct MetadataBlock {
    pub data: Vec<u8>,
    pub disk_len: u64,
}

impl MetadataBlock {
    /// Decode a block whose 16-bit header and body have already been read.
    pub(crate) fn decode(core: &ImageCore<impl Sized>, header: u16, body: Vec<u8>) -> Result<Self> {
        let disk_len = 2 + body.len() as u64;
        let data = if header & METADATA_UNCOMPRESSED != 0 {
            body
        } else {
            core.decoder()?.decompress(&body, METADATA_BLOCK_SIZE)?
        };
        if data.len() > METADATA_BLOCK_SIZE {
            return Err(Error::CorruptImage(format!(
                "metadata block decodes to {} bytes", data.len()
            )));
        }
        Ok(Self { data, disk_len })
    }

    pub(crate) fn body_len(header: u16) -> usize {
        usize::from(header & !METADATA_UNCOMPRESSED)
    }
}

/// Reader over a run of metadata blocks starting at an [`InodeAddress`]-style location. Reads
/// roll into the next block when the current one is exhausted, so structures that straddle a
/// block boundary parse transparently. Blocks come from the image's metadata cache.
pub(crate) struct MetadataReader<'a, R> {
    core: &'a ImageCore<R>,
    block_addr: u64,
    block: Arc<MetadataBlock>,
    pos: usize,
}

impl<'a, R: Read + io::Seek> MetadataReader<'a, R> {
    /// Position at `addr` inside the table that starts at `table_start`.
    pub fn new(core: &'a ImageCore<R>, table_start: u64, addr: InodeAddress) -> Result<Self> {
        let block_addr = table_start + addr.start_block();
        let block = core.metadata_block(block_addr)?;
        let pos = usize::from(addr.offset());
        if pos > block.data.len() {
            return Err(Error::CorruptImage(format!(
                "offset {} beyond metadata block of {} bytes at {}", pos, block.data.len(), block_addr
            )));
        }
        Ok(Self { core, block_addr, block, pos })
    }

    fn next_block(&mut self) -> Result<()> {
        self.block_addr += self.block.disk_len;
        self.block = self.core.metadata_block(self.block_addr)?;
        self.pos = 0;
        if self.block.data.is_empty() {
            return Err(Error::CorruptImage(format!("empty metadata block at {}", self.block_addr)));
        }
        Ok(())
    }
}

impl<R: Read + io::Seek> Read for MetadataReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.block.data.len() {
            self.next_block()?;
        }
        let n = Read::read(&mut &self.block.data[self.pos..], buf)?;
        self.pos += n;
        Ok(n)
    }
}

pub(crate) trait FromBytes: Sized {
    const BYTE_SIZE: usize;
    fn from_bytes(buf: &[u8]) -> Self;
}

impl FromBytes for u32 {
    const BYTE_SIZE: usize = 4;
    fn from_bytes(buf: &[u8]) -> Self {
        LittleEndian::read_u32(buf)
    }
}

/// Location and size word of a shared fragment block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentEntry {
    pub start: u64,
    pub size: BlockDescriptor,
}

impl FromBytes for FragmentEntry {
    const BYTE_SIZE: usize = 16;
    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            start: LittleEndian::read_u64(&buf[0..8]),
            size: BlockDescriptor::from_raw(LittleEndian::read_u32(&buf[8..12])),
        }
    }
}

/// Read a lookup table: an array of little-endian block pointers at `table_offset`, each
/// pointing at a metadata block packed with fixed-size entries.
pub(crate) fn read_lookup_table<I, R>(core: &ImageCore<R>, table_offset: u64, item_count: u32) -> Result<Vec<I>>
where
    I: FromBytes,
    R: Read + io::Seek,
{
    let per_block = METADATA_BLOCK_SIZE / I::BYTE_SIZE;
    let item_count = item_count as usize;
    let block_count = div_ceil!(item_count, per_block);
    if block_count == 0 {
        return Ok(Vec::new());
    }

    let raw_offsets = core.source().read_at(table_offset, block_count * 8)
        .map_err(Error::parse("lookup table index"))?;

    let mut entries = Vec::with_capacity(item_count);
    for (n, chunk) in raw_offsets.chunks_exact(8).enumerate() {
        let block_addr = LittleEndian::read_u64(chunk);
        let block = core.read_metadata_block(block_addr)?;
        let wanted = (item_count - n * per_block).min(per_block);
        if block.data.len() < wanted * I::BYTE_SIZE {
            return Err(Error::CorruptImage(format!(
                "lookup table block at {} holds {} bytes, expected {}",
                block_addr, block.data.len(), wanted * I::BYTE_SIZE
            )));
        }
        entries.extend(block.data.chunks_exact(I::BYTE_SIZE).take(wanted).map(I::from_bytes));
    }
    Ok(entries)
}
