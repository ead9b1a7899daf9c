use std::fmt;
use std::io::{self, Read};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::metadata::InodeAddress;
use crate::error::{Error, Result};

pub const MAGIC: u32 = 0x73717368;
pub const SUPERBLOCK_SIZE: usize = 96;

/// Marks an absent optional table (xattr, export, fragment).
pub const NO_TABLE: u64 = u64::MAX;

const MIN_BLOCK_LOG: u16 = 12;
const MAX_BLOCK_LOG: u16 = 20;

/// The fixed 96-byte header at the start of every image. All table offsets are absolute
/// positions relative to the start of the image.
#[derive(Debug, Clone)]
pub struct Superblock {
    pub magic: u32,
    /// Inodes in the image, the root included.
    pub inode_count: u32,
    /// Image creation time, seconds since the epoch.
    pub mod_time: u32,
    pub block_size: u32,
    /// Entries in the fragment table.
    pub frag_count: u32,
    pub compression_id: u16,
    /// `log2(block_size)`; must agree with `block_size`.
    pub block_log: u16,
    pub flags: SuperblockFlags,
    /// Entries in the uid/gid table.
    pub id_count: u16,
    pub version_major: u16,
    pub version_minor: u16,
    pub root_inode: InodeAddress,
    /// Bytes the image occupies; trailing padding is not included.
    pub bytes_used: u64,
    pub id_table: u64,
    /// [`NO_TABLE`] when the image carries no extended attributes.
    pub xattr_table: u64,
    pub inode_table: u64,
    pub dir_table: u64,
    pub frag_table: u64,
    pub export_table: u64,
}

bitflags! {
    /// Builder options recorded in the header. Decoding relies on the per-block markers
    /// instead, so these are informational.
    pub struct SuperblockFlags: u16 {
        const UNCOMPRESSED_INODES = 1 << 0;
        const UNCOMPRESSED_DATA = 1 << 1;
        const UNCOMPRESSED_FRAGMENTS = 1 << 3;
        const NO_FRAGMENTS = 1 << 4;
        const ALWAYS_FRAGMENTS = 1 << 5;
        const DEDUPLICATED = 1 << 6;
        const EXPORTABLE = 1 << 7;
        const UNCOMPRESSED_XATTRS = 1 << 8;
        const NO_XATTRS = 1 << 9;
        const COMPRESSOR_OPTIONS = 1 << 10;
        const UNCOMPRESSED_IDS = 1 << 11;
    }
}

/// Compression method ids as stored in the superblock.
#[derive(Debug, IntoPrimitive, TryFromPrimitive, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Compression {
    Gzip = 1,
    Lzo = 2,
    Lzma = 3,
    Xz = 4,
    Lz4 = 5,
    Zstd = 6,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::Gzip => "gzip",
            Compression::Lzo => "lzo",
            Compression::Lzma => "lzma",
            Compression::Xz => "xz",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

impl Superblock {
    /// Decode a header from its on-disk little-endian layout.
    pub fn read<R>(r: &mut R) -> io::Result<Superblock>
    where R: Read
    {
        let magic = r.read_u32::<LittleEndian>()?;
        let inode_count = r.read_u32::<LittleEndian>()?;
        let mod_time = r.read_u32::<LittleEndian>()?;
        let block_size = r.read_u32::<LittleEndian>()?;
        let frag_count = r.read_u32::<LittleEndian>()?;

        let mut half_words = [0u16; 6];
        r.read_u16_into::<LittleEndian>(&mut half_words)?;
        let [compression_id, block_log, flags, id_count, version_major, version_minor] = half_words;

        let mut tables = [0u64; 8];
        r.read_u64_into::<LittleEndian>(&mut tables)?;
        let [root_inode, bytes_used, id_table, xattr_table, inode_table, dir_table, frag_table, export_table] = tables;

        Ok(Superblock {
            magic,
            inode_count,
            mod_time,
            block_size,
            frag_count,
            compression_id,
            block_log,
            flags: SuperblockFlags::from_bits_truncate(flags),
            id_count,
            version_major,
            version_minor,
            root_inode: InodeAddress::from_raw(root_inode),
            bytes_used,
            id_table,
            xattr_table,
            inode_table,
            dir_table,
            frag_table,
            export_table,
        })
    }

    pub fn from_bytes(b: &[u8]) -> io::Result<Superblock> {
        Superblock::read(&mut &b[..])
    }

    /// The compression method, if the id is one the format defines.
    pub fn compression(&self) -> Option<Compression> {
        Compression::try_from(self.compression_id).ok()
    }

    /// Check the header fields that every later table read depends on.
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::Format(format!("bad magic {:#010x}", self.magic)));
        }
        if (self.version_major, self.version_minor) != (4, 0) {
            return Err(Error::Format(format!(
                "unsupported version {}.{}", self.version_major, self.version_minor
            )));
        }
        if !(MIN_BLOCK_LOG..=MAX_BLOCK_LOG).contains(&self.block_log)
            || self.block_size != 1u32 << self.block_log
        {
            return Err(Error::Format(format!(
                "block size {} does not match block log {}", self.block_size, self.block_log
            )));
        }
        for (name, offset) in [
            ("id", self.id_table),
            ("inode", self.inode_table),
            ("directory", self.dir_table),
        ] {
            if offset >= self.bytes_used {
                return Err(Error::Format(format!(
                    "{name} table offset {offset} beyond image end {}", self.bytes_used
                )));
            }
        }
        if self.frag_count > 0 && self.frag_table >= self.bytes_used {
            return Err(Error::Format(format!(
                "fragment table offset {} beyond image end {}", self.frag_table, self.bytes_used
            )));
        }
        Ok(())
    }

    /// Cheap plausibility test used when scanning a larger file for an embedded image.
    pub(crate) fn looks_valid(&self) -> bool {
        self.magic == MAGIC
            && (self.version_major, self.version_minor) == (4, 0)
            && (MIN_BLOCK_LOG..=MAX_BLOCK_LOG).contains(&self.block_log)
            && self.block_size == 1u32 << self.block_log
            && self.bytes_used >= SUPERBLOCK_SIZE as u64
    }
}
