//! See https://dr-emann.github.io/squashfs/squashfs.html
//! for details on the SquashFS binary format

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::compressor::{DecoderRegistry, Decompressor, DecompressorFactory};
use super::directory::{self, DirectoryEntry};
use super::file::VirtualFile;
use super::inode::{BlockDescriptor, InodeMetadata};
use super::metadata::{read_lookup_table, FragmentEntry, InodeAddress, MetadataBlock, MetadataReader};
use super::source::SharedSource;
use super::superblock::{Superblock, NO_TABLE, SUPERBLOCK_SIZE};
use super::walk::Walk;
use super::xattr::{Xattr, XattrTable};
use crate::error::{Error, Result};

pub const DEFAULT_METADATA_CACHE_BLOCKS: usize = 128;

/// How an image is opened.
#[derive(Clone)]
pub struct ImageOptions {
    /// Byte offset of the superblock inside the source.
    pub offset: u64,
    /// Strategy that supplies the block decoder for the image's compression id.
    pub factory: Arc<dyn DecompressorFactory>,
    /// Decompressed metadata blocks kept in an LRU; 0 disables caching.
    pub metadata_cache_blocks: usize,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            factory: Arc::new(DecoderRegistry::detect()),
            metadata_cache_blocks: DEFAULT_METADATA_CACHE_BLOCKS,
        }
    }
}

impl fmt::Debug for ImageOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageOptions")
            .field("offset", &self.offset)
            .field("metadata_cache_blocks", &self.metadata_cache_blocks)
            .finish_non_exhaustive()
    }
}

/// Image state shared by the walker and every open [`VirtualFile`]. All of it is immutable
/// after open except the byte source and the metadata cache, which sit behind their own locks.
pub(crate) struct ImageCore<R> {
    source: SharedSource<R>,
    superblock: Superblock,
    decoder: Option<Arc<dyn Decompressor>>,
    ids: Vec<u32>,
    fragments: Vec<FragmentEntry>,
    xattrs: Option<XattrTable>,
    cache: Option<Mutex<LruCache<u64, Arc<MetadataBlock>>>>,
}

impl<R> ImageCore<R> {
    /// The image's decoder. Images whose method has no backend open fine and fail here, on the
    /// first block that actually needs decoding.
    pub(crate) fn decoder(&self) -> Result<&dyn Decompressor> {
        self.decoder.as_deref().ok_or(Error::UnsupportedCompression(self.superblock.compression_id))
    }

    pub(crate) fn source(&self) -> &SharedSource<R> {
        &self.source
    }

    pub(crate) fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub(crate) fn block_size(&self) -> u32 {
        self.superblock.block_size
    }
}

impl<R: Read + Seek> ImageCore<R> {
    pub(crate) fn from_parts(
        source: SharedSource<R>,
        superblock: Superblock,
        decoder: Option<Arc<dyn Decompressor>>,
        metadata_cache_blocks: usize,
    ) -> Self {
        let cache = NonZeroUsize::new(metadata_cache_blocks).map(|n| Mutex::new(LruCache::new(n)));
        Self { source, superblock, decoder, ids: Vec::new(), fragments: Vec::new(), xattrs: None, cache }
    }

    #[cfg(test)]
    pub(crate) fn set_fragments(&mut self, fragments: Vec<FragmentEntry>) {
        self.fragments = fragments;
    }

    /// Read and decode the metadata block at `addr`, bypassing the cache.
    pub(crate) fn read_metadata_block(&self, addr: u64) -> Result<MetadataBlock> {
        let (header, body) = self.source.read_metadata_block(addr)
            .map_err(Error::parse("metadata block"))?;
        MetadataBlock::decode(self, header, body)
    }

    /// The metadata block at `addr`, from the cache when present.
    pub(crate) fn metadata_block(&self, addr: u64) -> Result<Arc<MetadataBlock>> {
        if let Some(cache) = &self.cache {
            if let Some(block) = cache.lock().get(&addr) {
                return Ok(Arc::clone(block));
            }
        }
        let block = Arc::new(self.read_metadata_block(addr)?);
        if let Some(cache) = &self.cache {
            cache.lock().put(addr, Arc::clone(&block));
        }
        Ok(block)
    }

    /// Copy a data or fragment block out of the source under the lock, then decode it
    /// unlocked.
    pub(crate) fn read_block(&self, start: u64, descriptor: BlockDescriptor) -> Result<Vec<u8>> {
        let len = descriptor.compressed_size();
        if len > self.block_size() {
            return Err(Error::CorruptImage(format!("block at {start} has on-disk size {len}")));
        }
        let end = start.checked_add(len.into()).filter(|&end| end <= self.superblock.bytes_used);
        if end.is_none() {
            return Err(Error::CorruptImage(format!(
                "block at {start}+{len} runs past image end {}", self.superblock.bytes_used
            )));
        }
        let raw = self.source.read_at(start, len as usize).map_err(Error::parse("data block"))?;
        if descriptor.is_compressed() {
            self.decoder()?.decompress(&raw, self.block_size() as usize)
        } else {
            Ok(raw)
        }
    }

    pub(crate) fn fragment_entry(&self, index: u32) -> Result<FragmentEntry> {
        self.fragments.get(index as usize).copied().ok_or_else(|| {
            Error::CorruptImage(format!("fragment index {index} beyond table of {}", self.fragments.len()))
        })
    }

    pub(crate) fn resolve_inode(&self, addr: InodeAddress) -> Result<InodeMetadata> {
        let mut r = MetadataReader::new(self, self.superblock.inode_table, addr)?;
        InodeMetadata::read(&mut r, self.block_size())
    }

    pub(crate) fn read_dir(&self, inode: &InodeMetadata) -> Result<Vec<DirectoryEntry>> {
        let layout = inode.dir_layout()
            .ok_or_else(|| Error::NotFound(format!("inode {} is not a directory", inode.inode_number)))?;
        let len = directory::listing_len(layout)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let addr = InodeAddress::new(layout.block_index.into(), layout.block_offset.into())?;
        let r = MetadataReader::new(self, self.superblock.dir_table, addr)?;
        let mut listing = Vec::new();
        r.take(len).read_to_end(&mut listing).map_err(Error::parse("directory listing"))?;
        if listing.len() as u64 != len {
            return Err(Error::CorruptImage(format!(
                "directory listing holds {} of {len} bytes", listing.len()
            )));
        }
        directory::parse_listing(&listing)
    }

    fn lookup_id(&self, index: u16) -> Result<u32> {
        self.ids.get(usize::from(index)).copied().ok_or_else(|| {
            Error::CorruptImage(format!("id index {index} beyond table of {}", self.ids.len()))
        })
    }
}

/// A directory resolved once and shared; used for the memoized root.
#[derive(Debug)]
pub struct Directory {
    pub address: InodeAddress,
    pub inode: InodeMetadata,
    pub entries: Arc<[DirectoryEntry]>,
}

/// The top-level interface to a SquashFS image: resolves inodes and directory listings on
/// demand and opens file streams. Nothing but the root directory is retained between calls.
pub struct Image<R> {
    core: Arc<ImageCore<R>>,
    root: OnceLock<Arc<Directory>>,
}

impl Image<BufReader<File>> {
    /// Open the contents of a filepath as a SquashFS image, using a BufReader
    pub fn open_path<P>(path: P) -> Result<Self>
    where P: AsRef<Path>
    {
        Self::open(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> Image<R> {
    pub fn open(reader: R) -> Result<Self> {
        Self::open_with(reader, ImageOptions::default())
    }

    pub fn open_with(reader: R, options: ImageOptions) -> Result<Self> {
        let source = SharedSource::new(reader, options.offset)?;
        let raw = source.read_at(0, SUPERBLOCK_SIZE).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::Format("source is shorter than a superblock".into()),
            _ => Error::from(e),
        })?;
        let superblock = Superblock::from_bytes(&raw)?;
        superblock.validate()?;
        if superblock.bytes_used > source.len() {
            return Err(Error::Format(format!(
                "image claims {} bytes but the source holds {}", superblock.bytes_used, source.len()
            )));
        }

        let decoder = match options.factory.decoder(superblock.compression_id, superblock.block_size) {
            Ok(decoder) => Some(decoder),
            Err(Error::UnsupportedCompression(id)) => {
                warn!(compression_id = id, "no decoder available for image compression");
                None
            },
            Err(e) => return Err(e),
        };

        let mut core = ImageCore::from_parts(source, superblock, decoder, options.metadata_cache_blocks);
        let sb = &core.superblock;
        let ids = read_lookup_table(&core, sb.id_table, sb.id_count.into())?;
        let fragments = if sb.frag_count > 0 && sb.frag_table != NO_TABLE {
            read_lookup_table(&core, sb.frag_table, sb.frag_count)?
        } else {
            Vec::new()
        };
        let xattrs = if sb.xattr_table != NO_TABLE {
            Some(XattrTable::load(&core, sb.xattr_table)?)
        } else {
            None
        };
        core.ids = ids;
        core.fragments = fragments;
        core.xattrs = xattrs;

        debug!(
            offset = options.offset,
            compression_id = core.superblock.compression_id,
            backend = ?core.decoder.as_ref().map(|d| d.backend()),
            block_size = core.superblock.block_size,
            inodes = core.superblock.inode_count,
            fragments = core.fragments.len(),
            ids = core.ids.len(),
            "opened squashfs image"
        );

        Ok(Self { core: Arc::new(core), root: OnceLock::new() })
    }

    pub fn superblock(&self) -> &Superblock {
        self.core.superblock()
    }

    pub fn block_size(&self) -> u32 {
        self.core.block_size()
    }

    pub fn root_address(&self) -> InodeAddress {
        self.core.superblock.root_inode
    }

    /// Decode the inode at `addr`. The result is not retained.
    pub fn resolve_inode(&self, addr: InodeAddress) -> Result<InodeMetadata> {
        self.core.resolve_inode(addr)
    }

    /// The entries of a directory inode, in on-disk (sorted) order.
    pub fn read_dir(&self, inode: &InodeMetadata) -> Result<Vec<DirectoryEntry>> {
        self.core.read_dir(inode)
    }

    /// The entries of the directory at `addr`, resolved fresh on every call.
    pub fn open_directory(&self, addr: InodeAddress) -> Result<Vec<DirectoryEntry>> {
        let inode = self.resolve_inode(addr)?;
        self.read_dir(&inode)
    }

    /// The root directory, resolved on first use and kept for the lifetime of the image.
    pub fn root(&self) -> Result<Arc<Directory>> {
        if let Some(root) = self.root.get() {
            return Ok(Arc::clone(root));
        }
        let address = self.root_address();
        let inode = self.resolve_inode(address)?;
        if !inode.is_dir() {
            return Err(Error::CorruptImage(format!("root inode {address:?} is not a directory")));
        }
        let entries = self.read_dir(&inode)?.into();
        // A concurrent caller may have won the race; both resolved the same bytes.
        Ok(Arc::clone(self.root.get_or_init(|| Arc::new(Directory { address, inode, entries }))))
    }

    /// Lazy pre-order traversal of the whole tree, root first.
    pub fn walk(&self) -> Walk<'_, R> {
        Walk::new(self)
    }

    /// Open a stream over the regular file at `addr`.
    pub fn open_file(&self, addr: InodeAddress) -> Result<VirtualFile<R>> {
        let inode = self.resolve_inode(addr)?;
        self.open_inode(&inode)
    }

    pub fn open_inode(&self, inode: &InodeMetadata) -> Result<VirtualFile<R>> {
        if !inode.is_file() {
            return Err(Error::NotAFile(format!("inode {}", inode.inode_number)));
        }
        VirtualFile::new(Arc::clone(&self.core), inode)
    }

    pub fn read_link(&self, addr: InodeAddress) -> Result<Vec<u8>> {
        let inode = self.resolve_inode(addr)?;
        inode.symlink_target()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::Format(format!("inode {addr:?} is not a symlink")))
    }

    pub fn uid(&self, inode: &InodeMetadata) -> Result<u32> {
        self.core.lookup_id(inode.uid_index)
    }

    pub fn gid(&self, inode: &InodeMetadata) -> Result<u32> {
        self.core.lookup_id(inode.gid_index)
    }

    /// Extended attributes of an inode; empty when it has none.
    pub fn xattrs(&self, inode: &InodeMetadata) -> Result<Vec<Xattr>> {
        match (inode.xattr_index, &self.core.xattrs) {
            (None, _) => Ok(Vec::new()),
            (Some(index), Some(table)) => table.read(&self.core, index),
            (Some(index), None) => Err(Error::CorruptImage(format!(
                "inode {} references xattr {index} but the image has no xattr table", inode.inode_number
            ))),
        }
    }

    /// Resolve an absolute or root-relative path without following symlinks.
    pub fn resolve_path(&self, path: &str) -> Result<(InodeAddress, InodeMetadata)> {
        let root = self.root()?;
        let mut stack: Vec<(InodeAddress, InodeMetadata)> = Vec::new();
        for component in path.split('/') {
            match component {
                "" | "." => {},
                ".." => {
                    stack.pop();
                },
                name => {
                    let entries: Arc<[DirectoryEntry]> = match stack.last() {
                        None => Arc::clone(&root.entries),
                        Some((_, inode)) if inode.is_dir() => self.read_dir(inode)?.into(),
                        Some(_) => return Err(Error::NotFound(path.to_string())),
                    };
                    let entry = entries.iter()
                        .find(|e| e.name == name.as_bytes())
                        .ok_or_else(|| Error::NotFound(path.to_string()))?;
                    stack.push((entry.address, self.resolve_inode(entry.address)?));
                },
            }
        }
        Ok(stack.pop().unwrap_or_else(|| (root.address, root.inode.clone())))
    }

    /// Release the byte source. Returns `None` while streams opened from this image are alive.
    pub fn into_inner(self) -> Option<R> {
        Arc::try_unwrap(self.core).ok().map(|core| core.source.into_inner())
    }
}

impl<R> fmt::Debug for Image<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("superblock", &self.core.superblock)
            .field("root_loaded", &self.root.get().is_some())
            .finish_non_exhaustive()
    }
}
