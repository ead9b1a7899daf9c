use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::metadata::div_ceil;
use crate::error::{Error, Result};

pub const NO_FRAGMENT: u32 = u32::MAX;
pub const NO_XATTR: u32 = u32::MAX;

const S_IFSOCK: u16 = 0o140000;
const S_IFLNK: u16 = 0o120000;
const S_IFREG: u16 = 0o100000;
const S_IFBLK: u16 = 0o060000;
const S_IFDIR: u16 = 0o040000;
const S_IFCHR: u16 = 0o020000;
const S_IFIFO: u16 = 0o010000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub(crate) enum InodeType {
    BasicDir = 1,
    BasicFile = 2,
    BasicSymlink = 3,
    BasicBlockDev = 4,
    BasicCharDev = 5,
    BasicNamedPipe = 6,
    BasicSocket = 7,
    ExtDir = 8,
    ExtFile = 9,
    ExtSymlink = 10,
    ExtBlockDev = 11,
    ExtCharDev = 12,
    ExtNamedPipe = 13,
    ExtSocket = 14,
}

/// The kind of filesystem object an inode or directory entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    Directory,
    File,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl InodeKind {
    /// Map an on-disk type code (basic or extended) to its kind.
    pub(crate) fn from_type_code(code: u16) -> Result<Self> {
        let inode_type = InodeType::try_from(code)
            .map_err(|_| Error::CorruptImage(format!("unknown inode type {code}")))?;
        Ok(match inode_type {
            InodeType::BasicDir | InodeType::ExtDir => InodeKind::Directory,
            InodeType::BasicFile | InodeType::ExtFile => InodeKind::File,
            InodeType::BasicSymlink | InodeType::ExtSymlink => InodeKind::Symlink,
            InodeType::BasicBlockDev | InodeType::ExtBlockDev => InodeKind::BlockDevice,
            InodeType::BasicCharDev | InodeType::ExtCharDev => InodeKind::CharDevice,
            InodeType::BasicNamedPipe | InodeType::ExtNamedPipe => InodeKind::Fifo,
            InodeType::BasicSocket | InodeType::ExtSocket => InodeKind::Socket,
        })
    }

    /// The `S_IFMT` bits for this kind.
    pub fn type_bits(self) -> u16 {
        match self {
            InodeKind::Directory => S_IFDIR,
            InodeKind::File => S_IFREG,
            InodeKind::Symlink => S_IFLNK,
            InodeKind::BlockDevice => S_IFBLK,
            InodeKind::CharDevice => S_IFCHR,
            InodeKind::Fifo => S_IFIFO,
            InodeKind::Socket => S_IFSOCK,
        }
    }
}

const BLOCK_UNCOMPRESSED: u32 = 1 << 24;
const BLOCK_SIZE_MASK: u32 = BLOCK_UNCOMPRESSED - 1;

/// The size word of a data or fragment block. A zero size marks a sparse block: it occupies
/// no bytes on disk and reads as zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDescriptor(u32);

impl BlockDescriptor {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// Bytes the block occupies on disk.
    pub fn compressed_size(self) -> u32 {
        self.0 & BLOCK_SIZE_MASK
    }

    pub fn is_compressed(self) -> bool {
        self.0 & BLOCK_UNCOMPRESSED == 0
    }

    pub fn is_sparse(self) -> bool {
        self.compressed_size() == 0
    }
}

/// A file tail stored inside a shared fragment block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentTail {
    pub index: u32,
    pub offset: u32,
    pub length: u32,
}

/// Where a regular file's data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLayout {
    pub blocks_start: u64,
    pub file_size: u64,
    pub sparse_bytes: u64,
    pub blocks: Vec<BlockDescriptor>,
    pub fragment: Option<FragmentTail>,
}

impl FileLayout {
    pub fn has_sparse_blocks(&self) -> bool {
        self.blocks.iter().any(|b| b.is_sparse())
    }
}

/// Where a directory's listing lives in the directory table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirLayout {
    pub block_index: u32,
    pub block_offset: u16,
    /// Listing size plus 3, as the format stores it.
    pub file_size: u32,
    pub parent_inode: u32,
}

/// Type-specific part of an inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodeDetail {
    Directory(DirLayout),
    File(FileLayout),
    Symlink { target: Vec<u8> },
    Device { device: u32 },
    Ipc,
}

/// A decoded inode. Built on demand from an address and dropped after use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeMetadata {
    pub kind: InodeKind,
    pub permissions: u16,
    pub uid_index: u16,
    pub gid_index: u16,
    pub mtime: u32,
    pub inode_number: u32,
    pub link_count: u32,
    pub block_size: u32,
    pub xattr_index: Option<u32>,
    pub detail: InodeDetail,
}

impl InodeMetadata {
    pub(crate) fn read<R>(r: &mut R, block_size: u32) -> Result<Self>
    where R: Read
    {
        Self::read_inner(r, block_size).map_err(|e| match e {
            Error::Io(io) => Error::parse("inode")(io),
            other => other,
        })
    }

    fn read_inner<R>(r: &mut R, block_size: u32) -> Result<Self>
    where R: Read
    {
        let type_code = r.read_u16::<LittleEndian>()?;
        let inode_type = InodeType::try_from(type_code)
            .map_err(|_| Error::CorruptImage(format!("unknown inode type {type_code}")))?;
        let kind = InodeKind::from_type_code(type_code)?;
        let permissions = r.read_u16::<LittleEndian>()?;
        let uid_index = r.read_u16::<LittleEndian>()?;
        let gid_index = r.read_u16::<LittleEndian>()?;
        let mtime = r.read_u32::<LittleEndian>()?;
        let inode_number = r.read_u32::<LittleEndian>()?;

        let mut xattr = NO_XATTR;
        let (link_count, detail) = match inode_type {
            InodeType::BasicDir => {
                let block_index = r.read_u32::<LittleEndian>()?;
                let link_count = r.read_u32::<LittleEndian>()?;
                let file_size = r.read_u16::<LittleEndian>()?.into();
                let block_offset = r.read_u16::<LittleEndian>()?;
                let parent_inode = r.read_u32::<LittleEndian>()?;
                (link_count, InodeDetail::Directory(DirLayout { block_index, block_offset, file_size, parent_inode }))
            },
            InodeType::ExtDir => {
                let link_count = r.read_u32::<LittleEndian>()?;
                let file_size = r.read_u32::<LittleEndian>()?;
                let block_index = r.read_u32::<LittleEndian>()?;
                let parent_inode = r.read_u32::<LittleEndian>()?;
                let _index_count = r.read_u16::<LittleEndian>()?;
                let block_offset = r.read_u16::<LittleEndian>()?;
                xattr = r.read_u32::<LittleEndian>()?;
                (link_count, InodeDetail::Directory(DirLayout { block_index, block_offset, file_size, parent_inode }))
            },
            InodeType::BasicFile => {
                let blocks_start = r.read_u32::<LittleEndian>()?.into();
                let frag_index = r.read_u32::<LittleEndian>()?;
                let frag_offset = r.read_u32::<LittleEndian>()?;
                let file_size = r.read_u32::<LittleEndian>()?.into();
                let layout = read_file_layout(r, block_size, blocks_start, file_size, 0, frag_index, frag_offset)?;
                (1, InodeDetail::File(layout))
            },
            InodeType::ExtFile => {
                let blocks_start = r.read_u64::<LittleEndian>()?;
                let file_size = r.read_u64::<LittleEndian>()?;
                let sparse_bytes = r.read_u64::<LittleEndian>()?;
                let link_count = r.read_u32::<LittleEndian>()?;
                let frag_index = r.read_u32::<LittleEndian>()?;
                let frag_offset = r.read_u32::<LittleEndian>()?;
                xattr = r.read_u32::<LittleEndian>()?;
                let layout = read_file_layout(r, block_size, blocks_start, file_size, sparse_bytes, frag_index, frag_offset)?;
                (link_count, InodeDetail::File(layout))
            },
            InodeType::BasicSymlink | InodeType::ExtSymlink => {
                let link_count = r.read_u32::<LittleEndian>()?;
                let target_size = r.read_u32::<LittleEndian>()?;
                if target_size as usize > u16::MAX as usize {
                    return Err(Error::CorruptImage(format!("symlink target of {target_size} bytes")));
                }
                let mut target = vec![0; target_size as usize];
                r.read_exact(&mut target)?;
                if inode_type == InodeType::ExtSymlink {
                    xattr = r.read_u32::<LittleEndian>()?;
                }
                (link_count, InodeDetail::Symlink { target })
            },
            InodeType::BasicBlockDev | InodeType::BasicCharDev |
            InodeType::ExtBlockDev | InodeType::ExtCharDev => {
                let link_count = r.read_u32::<LittleEndian>()?;
                let device = r.read_u32::<LittleEndian>()?;
                if matches!(inode_type, InodeType::ExtBlockDev | InodeType::ExtCharDev) {
                    xattr = r.read_u32::<LittleEndian>()?;
                }
                (link_count, InodeDetail::Device { device })
            },
            InodeType::BasicNamedPipe | InodeType::BasicSocket |
            InodeType::ExtNamedPipe | InodeType::ExtSocket => {
                let link_count = r.read_u32::<LittleEndian>()?;
                if matches!(inode_type, InodeType::ExtNamedPipe | InodeType::ExtSocket) {
                    xattr = r.read_u32::<LittleEndian>()?;
                }
                (link_count, InodeDetail::Ipc)
            },
        };

        Ok(Self {
            kind,
            permissions,
            uid_index,
            gid_index,
            mtime,
            inode_number,
            link_count,
            block_size,
            xattr_index: (xattr != NO_XATTR).then_some(xattr),
            detail,
        })
    }

    pub fn is_file(&self) -> bool {
        self.kind == InodeKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == InodeKind::Symlink
    }

    /// Permission bits combined with the file-type bits.
    pub fn mode(&self) -> u16 {
        (self.permissions & 0o7777) | self.kind.type_bits()
    }

    /// Size as a catalog reports it: the data size for regular files, 0 for everything else.
    pub fn file_size(&self) -> u64 {
        match &self.detail {
            InodeDetail::File(layout) => layout.file_size,
            _ => 0,
        }
    }

    pub fn file_layout(&self) -> Option<&FileLayout> {
        match &self.detail {
            InodeDetail::File(layout) => Some(layout),
            _ => None,
        }
    }

    pub fn dir_layout(&self) -> Option<&DirLayout> {
        match &self.detail {
            InodeDetail::Directory(layout) => Some(layout),
            _ => None,
        }
    }

    pub fn symlink_target(&self) -> Option<&[u8]> {
        match &self.detail {
            InodeDetail::Symlink { target } => Some(target),
            _ => None,
        }
    }
}

fn read_file_layout<R: Read>(
    r: &mut R,
    block_size: u32,
    blocks_start: u64,
    file_size: u64,
    sparse_bytes: u64,
    frag_index: u32,
    frag_offset: u32,
) -> Result<FileLayout> {
    let block_size_64 = u64::from(block_size);
    let tail = file_size % block_size_64;
    let fragment = (frag_index != NO_FRAGMENT && tail != 0).then_some(FragmentTail {
        index: frag_index,
        offset: frag_offset,
        length: tail as u32,
    });
    let num_blocks = if frag_index == NO_FRAGMENT {
        div_ceil!(file_size, block_size_64)
    } else {
        file_size / block_size_64
    };

    // The count comes from an untrusted size field; grow the list as entries actually arrive
    // so a corrupt size runs into the end of the metadata instead of a huge allocation.
    let mut blocks = Vec::with_capacity(num_blocks.min(1024) as usize);
    for n in 0..num_blocks {
        let descriptor = BlockDescriptor::from_raw(r.read_u32::<LittleEndian>().map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::CorruptImage(format!(
                "block list ends after {n} of {num_blocks} entries"
            )),
            _ => Error::from(e),
        })?);
        if descriptor.compressed_size() > block_size {
            return Err(Error::CorruptImage(format!(
                "block {n} has on-disk size {} above block size {block_size}", descriptor.compressed_size()
            )));
        }
        blocks.push(descriptor);
    }

    Ok(FileLayout { blocks_start, file_size, sparse_bytes, blocks, fragment })
}
