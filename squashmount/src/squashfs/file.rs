use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use tracing::trace;

use super::image::ImageCore;
use super::inode::{BlockDescriptor, InodeMetadata};
use super::metadata::FragmentEntry;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy)]
enum BlockPlan {
    Data { start: u64, descriptor: BlockDescriptor },
    Sparse,
}

#[derive(Debug, Clone, Copy)]
struct FragmentPlan {
    entry: FragmentEntry,
    offset: u32,
    length: u32,
}

/// Seekable stream over one regular file's data.
///
/// The stream maps an absolute offset to a block index (`offset / block_size`) and keeps the
/// most recently decoded block buffered; reads and seeks inside that block never decode it
/// again. Full blocks are decompressed from disk or synthesized as zeros when sparse, and a
/// tail packed into a fragment block is addressed as the block after the last full one.
///
/// Every stream owns its cursor and buffer. Streams over the same image share only the locked
/// byte source, so they can be used from different threads at once.
pub struct VirtualFile<R> {
    core: Arc<ImageCore<R>>,
    size: u64,
    block_size: u64,
    blocks: Vec<BlockPlan>,
    fragment: Option<FragmentPlan>,
    loaded: Option<usize>,
    buffer: Vec<u8>,
    offset: u64,
}

impl<R: Read + Seek> VirtualFile<R> {
    pub(crate) fn new(core: Arc<ImageCore<R>>, inode: &InodeMetadata) -> Result<Self> {
        let layout = inode.file_layout()
            .ok_or_else(|| Error::NotAFile(format!("inode {}", inode.inode_number)))?;
        let block_size = u64::from(core.block_size());

        let mut start = layout.blocks_start;
        let blocks = layout.blocks.iter().map(|&descriptor| {
            if descriptor.is_sparse() {
                BlockPlan::Sparse
            } else {
                let plan = BlockPlan::Data { start, descriptor };
                start += u64::from(descriptor.compressed_size());
                plan
            }
        }).collect::<Vec<_>>();

        let fragment = match layout.fragment {
            Some(tail) => {
                if u64::from(tail.offset) + u64::from(tail.length) > block_size {
                    return Err(Error::CorruptImage(format!(
                        "fragment tail {}+{} exceeds block size {block_size}", tail.offset, tail.length
                    )));
                }
                Some(FragmentPlan { entry: core.fragment_entry(tail.index)?, offset: tail.offset, length: tail.length })
            },
            None => None,
        };

        let covered = blocks.len() as u64 * block_size + fragment.map_or(0, |f| u64::from(f.length));
        if covered < layout.file_size {
            return Err(Error::CorruptImage(format!(
                "inode {} lists {covered} bytes of blocks for a {} byte file", inode.inode_number, layout.file_size
            )));
        }

        Ok(Self {
            core,
            size: layout.file_size,
            block_size,
            blocks,
            fragment,
            loaded: None,
            buffer: Vec::new(),
            offset: 0,
        })
    }

    /// Bytes a full read produces.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Absolute position of the cursor, including right after a read that hit the end.
    pub fn tell(&self) -> u64 {
        self.offset
    }

    /// There is no OS descriptor behind the stream.
    pub fn fileno(&self) -> Result<libc::c_int> {
        Err(Error::UnsupportedOperation("fileno"))
    }

    /// Logical length of block `index`: a full block, or the remainder for the last one.
    fn block_len(&self, index: usize) -> usize {
        let start = index as u64 * self.block_size;
        self.block_size.min(self.size.saturating_sub(start)) as usize
    }

    fn fill(&mut self, index: usize) -> Result<()> {
        let data = match self.blocks.get(index) {
            Some(BlockPlan::Sparse) => {
                trace!(index, "synthesizing sparse block");
                vec![0; self.block_len(index)]
            },
            Some(&BlockPlan::Data { start, descriptor }) => {
                trace!(index, start, size = descriptor.compressed_size(), "decoding data block");
                let expected = self.block_len(index);
                let data = self.core.read_block(start, descriptor)?;
                if data.len() != expected {
                    return Err(Error::CorruptImage(format!(
                        "block {index} decodes to {} bytes, expected {expected}", data.len()
                    )));
                }
                data
            },
            None => {
                let frag = self.fragment
                    .filter(|_| index == self.blocks.len())
                    .ok_or_else(|| Error::CorruptImage(format!("no block {index} in file")))?;
                trace!(index, start = frag.entry.start, "decoding fragment block");
                let block = self.core.read_block(frag.entry.start, frag.entry.size)?;
                let range = frag.offset as usize..(frag.offset + frag.length) as usize;
                block.get(range).map(<[u8]>::to_vec).ok_or_else(|| {
                    Error::CorruptImage(format!(
                        "fragment block at {} holds {} bytes, tail needs {}..{}",
                        frag.entry.start, block.len(), frag.offset, frag.offset + frag.length
                    ))
                })?
            },
        };
        self.buffer = data;
        self.loaded = Some(index);
        Ok(())
    }
}

impl<R: Read + Seek> Read for VirtualFile<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() && self.offset < self.size {
            let index = (self.offset / self.block_size) as usize;
            if self.loaded != Some(index) {
                self.fill(index)?;
            }
            let pos = (self.offset - index as u64 * self.block_size) as usize;
            let available = self.buffer.get(pos..).unwrap_or_default();
            let n = available.len().min(buf.len() - written);
            if n == 0 {
                break;
            }
            buf[written..written + n].copy_from_slice(&available[..n]);
            written += n;
            self.offset += n as u64;
        }
        Ok(written)
    }
}

impl<R: Read + Seek> Seek for VirtualFile<R> {
    /// Positions outside `[0, size]` are clamped rather than rejected. Moving to another
    /// block only records the offset; the block is decoded by the next read.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => i128::from(p),
            SeekFrom::End(p) => i128::from(self.size) + i128::from(p),
            SeekFrom::Current(p) => i128::from(self.offset) + i128::from(p),
        };
        self.offset = target.clamp(0, i128::from(self.size)) as u64;
        Ok(self.offset)
    }
}

impl<R> Write for VirtualFile<R> {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(Error::UnsupportedOperation("write").into())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<R> fmt::Debug for VirtualFile<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualFile")
            .field("size", &self.size)
            .field("offset", &self.offset)
            .field("blocks", &self.blocks.len())
            .field("fragment", &self.fragment.is_some())
            .field("loaded", &self.loaded)
            .finish()
    }
}
