use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};

use super::inode::{DirLayout, InodeKind};
use super::metadata::InodeAddress;
use crate::error::{Error, Result};

// Limits imposed by the image builder; anything beyond is damage.
const MAX_ENTRIES_PER_HEADER: u32 = 256;
const MAX_NAME_LEN: usize = 256;

/// One child of a directory: enough to locate and classify the child without decoding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: Vec<u8>,
    pub kind: InodeKind,
    pub address: InodeAddress,
    pub inode_number: u32,
}

impl DirectoryEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Directory
    }
}

/// Length in bytes of the listing a directory inode describes.
pub(crate) fn listing_len(layout: &DirLayout) -> Result<u64> {
    layout.file_size.checked_sub(3).map(u64::from).ok_or_else(|| {
        Error::CorruptImage(format!("directory listing size {} below minimum 3", layout.file_size))
    })
}

/// Parse a complete directory listing. Entries are grouped under headers that share the
/// metadata block holding their inodes.
pub(crate) fn parse_listing(mut buf: &[u8]) -> Result<Vec<DirectoryEntry>> {
    let mut entries = Vec::new();
    while !buf.is_empty() {
        let count = buf.read_u32::<LittleEndian>().map_err(Error::parse("directory header"))? + 1;
        let start_block = buf.read_u32::<LittleEndian>().map_err(Error::parse("directory header"))?;
        let base_inode = buf.read_u32::<LittleEndian>().map_err(Error::parse("directory header"))?;
        if count > MAX_ENTRIES_PER_HEADER {
            return Err(Error::CorruptImage(format!("directory header claims {count} entries")));
        }
        for _ in 0..count {
            entries.push(read_entry(&mut buf, start_block, base_inode)?);
        }
    }
    Ok(entries)
}

fn read_entry(buf: &mut &[u8], start_block: u32, base_inode: u32) -> Result<DirectoryEntry> {
    let offset = buf.read_u16::<LittleEndian>().map_err(Error::parse("directory entry"))?;
    let inode_delta = buf.read_i16::<LittleEndian>().map_err(Error::parse("directory entry"))?;
    let type_code = buf.read_u16::<LittleEndian>().map_err(Error::parse("directory entry"))?;
    let name_len = usize::from(buf.read_u16::<LittleEndian>().map_err(Error::parse("directory entry"))?) + 1;
    if name_len > MAX_NAME_LEN {
        return Err(Error::CorruptImage(format!("directory entry name of {name_len} bytes")));
    }
    let mut name = vec![0; name_len];
    buf.read_exact(&mut name).map_err(Error::parse("directory entry name"))?;

    if name == b"." || name == b".." || name.contains(&b'/') || name.contains(&0) {
        return Err(Error::CorruptImage(format!(
            "illegal directory entry name {:?}", String::from_utf8_lossy(&name)
        )));
    }

    let inode_number = u32::try_from(i64::from(base_inode) + i64::from(inode_delta))
        .map_err(|_| Error::CorruptImage(format!("inode number {base_inode}{inode_delta:+} out of range")))?;

    Ok(DirectoryEntry {
        name,
        kind: InodeKind::from_type_code(type_code)?,
        address: InodeAddress::new(start_block.into(), offset.into())?,
        inode_number,
    })
}
