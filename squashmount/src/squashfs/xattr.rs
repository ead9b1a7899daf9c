use std::io::{self, Read, Seek};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};

use super::image::ImageCore;
use super::metadata::{read_lookup_table, FromBytes, InodeAddress, MetadataReader};
use crate::error::{Error, Result};

const XATTR_OUT_OF_LINE: u16 = 0x100;
const XATTR_PREFIX_MASK: u16 = 0xFF;
const XATTR_HEADER_SIZE: usize = 16;

/// One extended attribute with its full prefixed name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xattr {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct XattrId {
    reference: u64,
    count: u32,
}

impl FromBytes for XattrId {
    const BYTE_SIZE: usize = 16;
    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            reference: LittleEndian::read_u64(&buf[0..8]),
            count: LittleEndian::read_u32(&buf[8..12]),
        }
    }
}

/// The id table of an image's extended attributes and the start of the key/value region
/// those ids point into.
#[derive(Debug)]
pub(crate) struct XattrTable {
    kv_start: u64,
    ids: Vec<XattrId>,
}

impl XattrTable {
    pub(crate) fn load<R: Read + Seek>(core: &ImageCore<R>, table_offset: u64) -> Result<Self> {
        let header = core.source().read_at(table_offset, XATTR_HEADER_SIZE)
            .map_err(Error::parse("xattr table header"))?;
        let kv_start = LittleEndian::read_u64(&header[0..8]);
        let count = LittleEndian::read_u32(&header[8..12]);
        if kv_start >= table_offset {
            return Err(Error::CorruptImage(format!(
                "xattr key/value region at {kv_start} does not precede its table at {table_offset}"
            )));
        }
        let ids = read_lookup_table(core, table_offset + XATTR_HEADER_SIZE as u64, count)?;
        Ok(Self { kv_start, ids })
    }

    pub(crate) fn read<R: Read + Seek>(&self, core: &ImageCore<R>, index: u32) -> Result<Vec<Xattr>> {
        let id = self.ids.get(index as usize).ok_or_else(|| {
            Error::CorruptImage(format!("xattr index {index} beyond table of {}", self.ids.len()))
        })?;
        let mut r = MetadataReader::new(core, self.kv_start, InodeAddress::from_raw(id.reference))?;
        let mut attrs = Vec::with_capacity(id.count.min(64) as usize);
        for _ in 0..id.count {
            attrs.push(self.read_pair(core, &mut r).map_err(Error::parse("xattr entry"))?);
        }
        Ok(attrs)
    }

    fn read_pair<R: Read + Seek>(&self, core: &ImageCore<R>, r: &mut MetadataReader<'_, R>) -> io::Result<Xattr> {
        let kind = r.read_u16::<LittleEndian>()?;
        let name_len = r.read_u16::<LittleEndian>()?;
        let prefix: &[u8] = match kind & XATTR_PREFIX_MASK {
            0 => b"user.",
            1 => b"trusted.",
            2 => b"security.",
            other => {
                return Err(Error::CorruptImage(format!("unknown xattr prefix {other}")).into());
            },
        };
        let mut name = prefix.to_vec();
        let start = name.len();
        name.resize(start + usize::from(name_len), 0);
        r.read_exact(&mut name[start..])?;

        let value = read_value(r)?;
        let value = if kind & XATTR_OUT_OF_LINE != 0 {
            if value.len() != 8 {
                return Err(Error::CorruptImage("out-of-line xattr reference is not 8 bytes".into()).into());
            }
            let target = InodeAddress::from_raw(LittleEndian::read_u64(&value));
            read_value(&mut MetadataReader::new(core, self.kv_start, target)?)?
        } else {
            value
        };
        Ok(Xattr { name, value })
    }
}

fn read_value<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let size = r.read_u32::<LittleEndian>()?;
    let mut value = Vec::new();
    r.take(u64::from(size)).read_to_end(&mut value)?;
    if value.len() != size as usize {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(value)
}
