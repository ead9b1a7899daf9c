//! Serving a SquashFS image through a path catalog.
//!
//! [`SquashFsMountSource`] walks the image once to fill a [`Catalog`], or validates a catalog
//! that is already loaded, and afterwards answers path lookups and opens file streams for a
//! presentation layer such as a FUSE adapter.

mod metadata;
mod options;

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::catalog::{normpath, split_path, Catalog, CatalogMetadata, CatalogRow, RowFlags};
use crate::error::{Error, Result};
use crate::squashfs::{find_superblock_offset, Image, ImageOptions, VirtualFile, WalkEntry};

pub use metadata::{ArchiveStats, IndexArguments, BACKEND_NAME};
pub use options::{Encoding, MountOptions, TransformPattern};
use options::PathTransform;

const INSERT_BATCH: usize = 1000;
const DEFAULT_HOST_BLOCK_SIZE: u64 = 512;
const MAX_NAME_LENGTH: u64 = 256;

// Arguments compared against a loaded catalog; keys missing from the catalog are not checked.
const CHECKED_ARGUMENTS: [&str; 2] = ["encoding", "transformPattern"];

/// Filesystem statistics for a read-only image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    pub block_size: u64,
    pub fragment_size: u64,
    pub free_blocks: u64,
    pub available_blocks: u64,
    pub free_files: u64,
    pub available_files: u64,
    pub max_name_length: u64,
}

/// A SquashFS image paired with the catalog that indexes it.
///
/// Opening either builds the catalog (walk, convert, batch insert, finalize, store metadata)
/// or, when the catalog is already loaded, checks that it still describes this archive. A
/// stale catalog is reported as [`Error::StaleIndex`]; the caller is expected to reopen with
/// [`MountOptions::clear_index_cache`] set or with a fresh catalog.
#[derive(Debug)]
pub struct SquashFsMountSource<R, C> {
    image: Image<R>,
    catalog: C,
    options: MountOptions,
    transform: PathTransform,
    archive_stats: Option<ArchiveStats>,
    host_block_size: Option<u64>,
}

impl<C: Catalog> SquashFsMountSource<BufReader<File>, C> {
    /// Open the archive at `path`. Its size and modification time feed the staleness checks.
    pub fn from_path<P>(path: P, catalog: C, options: MountOptions) -> Result<Self>
    where P: AsRef<Path>
    {
        let file = File::open(path.as_ref())?;
        let metadata = file.metadata()?;
        let stats = ArchiveStats::from_metadata(&metadata);
        let host_block_size = host_block_size(&metadata);
        Self::init(BufReader::new(file), Some(stats), host_block_size, catalog, options)
    }
}

impl<R: Read + Seek, C: Catalog> SquashFsMountSource<R, C> {
    /// Open an archive from an arbitrary reader. Without `stats` a catalog that recorded
    /// archive stats cannot be validated and is treated as stale.
    pub fn from_reader(reader: R, stats: Option<ArchiveStats>, catalog: C, options: MountOptions) -> Result<Self> {
        Self::init(reader, stats, None, catalog, options)
    }

    fn init(
        mut reader: R,
        archive_stats: Option<ArchiveStats>,
        host_block_size: Option<u64>,
        mut catalog: C,
        options: MountOptions,
    ) -> Result<Self> {
        if options.clear_index_cache && catalog.is_loaded() {
            debug!("discarding loaded catalog");
            catalog.clear()?;
        }

        // A shrunk archive may no longer hold a whole image; decide staleness before parsing it.
        let loaded = catalog.is_loaded();
        if loaded {
            check_archive_stats(&catalog, archive_stats, &options)?;
        }

        let offset = find_superblock_offset(&mut reader)?
            .ok_or_else(|| Error::Format("not a valid SquashFS image".into()))?;
        let image = Image::open_with(reader, ImageOptions {
            offset,
            metadata_cache_blocks: options.metadata_cache_blocks,
            ..ImageOptions::default()
        })?;
        let transform = PathTransform::new(options.transform.as_ref())?;
        let mut source = Self { image, catalog, options, transform, archive_stats, host_block_size };

        if loaded {
            source.check_metadata()?;
        } else {
            source.catalog.ensure_schema()?;
            source.build_index()?;
            source.store_metadata()?;
        }
        source.catalog.reload_read_only()?;
        Ok(source)
    }

    /// Walk the whole image into the catalog. Any entry that cannot be converted aborts the
    /// build; the catalog is then left unfinalized.
    fn build_index(&mut self) -> Result<usize> {
        let Self { image, catalog, options, transform, .. } = self;
        info!(block_size = image.block_size(), inodes = image.superblock().inode_count, "building squashfs index");
        let started = Instant::now();

        let mut count = 0;
        let mut batch = Vec::with_capacity(INSERT_BATCH);
        for entry in image.walk() {
            let entry = entry?;
            batch.push(to_row(image, &entry, options.encoding, transform)?);
            count += 1;
            if batch.len() == INSERT_BATCH {
                catalog.bulk_insert(std::mem::replace(&mut batch, Vec::with_capacity(INSERT_BATCH)))?;
            }
        }
        if !batch.is_empty() {
            catalog.bulk_insert(batch)?;
        }
        catalog.finalize()?;

        info!(entries = count, elapsed_ms = started.elapsed().as_millis() as u64, "built squashfs index");
        Ok(count)
    }

    fn store_metadata(&mut self) -> Result<()> {
        let metadata = CatalogMetadata {
            arguments: Some(serde_json::to_string(&IndexArguments::from(&self.options))?),
            archive_stats: self.archive_stats.as_ref().map(serde_json::to_string).transpose()?,
            backend_name: Some(BACKEND_NAME.to_string()),
        };
        self.catalog.store_metadata(&metadata)
    }

    fn check_metadata(&self) -> Result<()> {
        let stored = self.catalog.metadata()?.unwrap_or_default();

        if let Some(raw) = &stored.arguments {
            let recorded: serde_json::Map<String, Value> = serde_json::from_str(raw)?;
            let current = serde_json::to_value(IndexArguments::from(&self.options))?;
            for key in CHECKED_ARGUMENTS {
                if let Some(value) = recorded.get(key) {
                    if current.get(key) != Some(value) {
                        return Err(Error::StaleIndex(format!(
                            "catalog was built with {key} {value}, requested {}",
                            current.get(key).unwrap_or(&Value::Null)
                        )));
                    }
                }
            }
        }

        match stored.backend_name.as_deref() {
            Some(BACKEND_NAME) => Ok(()),
            Some(other) => Err(Error::StaleIndex(format!("catalog was built by {other}"))),
            None => self.probe_first_file(),
        }
    }

    /// Catalogs from builders that did not record their identity get a best-effort integrity
    /// check: the first regular file in inode order must open and yield a byte.
    fn probe_first_file(&self) -> Result<()> {
        let Some(row) = self.catalog.first_regular_file()? else {
            return Ok(());
        };
        debug!(path = %row.full_path(), "catalog has no backend name, probing first file");
        let probe = || -> Result<()> {
            let mut file = self.open(&row)?;
            let mut byte = [0u8; 1];
            file.read(&mut byte)?;
            Ok(())
        };
        probe().map_err(|e| {
            warn!(path = %row.full_path(), error = %e, "integrity probe of first file failed");
            Error::StaleIndex(format!("opening the first file failed: {e}"))
        })
    }

    /// The catalog row for `path`.
    pub fn lookup(&self, path: &str) -> Result<Option<CatalogRow>> {
        self.catalog.lookup(&normpath(path))
    }

    /// Open a new independent stream over the file a row describes.
    pub fn open(&self, row: &CatalogRow) -> Result<VirtualFile<R>> {
        if !row.is_file() {
            return Err(Error::NotAFile(row.full_path()));
        }
        self.image.open_file(row.address)
    }

    pub fn open_path(&self, path: &str) -> Result<VirtualFile<R>> {
        let row = self.lookup(path)?.ok_or_else(|| Error::NotFound(path.to_string()))?;
        self.open(&row)
    }

    pub fn statfs(&self) -> StatFs {
        let block_size = self.host_block_size
            .unwrap_or(DEFAULT_HOST_BLOCK_SIZE)
            .max(u64::from(self.image.block_size()));
        StatFs {
            block_size,
            fragment_size: block_size,
            free_blocks: 0,
            available_blocks: 0,
            free_files: 0,
            available_files: 0,
            max_name_length: MAX_NAME_LENGTH,
        }
    }

    pub fn image(&self) -> &Image<R> {
        &self.image
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    /// Release the byte source and hand back the catalog.
    pub fn close(self) -> C {
        self.catalog
    }
}

/// Compare the archive stats a loaded catalog recorded against the archive being opened.
fn check_archive_stats<C: Catalog>(
    catalog: &C,
    current: Option<ArchiveStats>,
    options: &MountOptions,
) -> Result<()> {
    let Some(raw) = catalog.metadata()?.and_then(|m| m.archive_stats) else {
        return Ok(());
    };
    let current = current.ok_or_else(|| {
        Error::StaleIndex("catalog records archive stats but the archive cannot be stat'ed".into())
    })?;
    let recorded: ArchiveStats = serde_json::from_str(&raw)?;
    if current.st_size < recorded.st_size {
        return Err(Error::StaleIndex(format!(
            "archive shrank from {} to {} bytes", recorded.st_size, current.st_size
        )));
    }
    if options.verify_modification_time && current.st_mtime != recorded.st_mtime {
        return Err(Error::StaleIndex(format!(
            "archive modification time changed from {} to {}", recorded.st_mtime, current.st_mtime
        )));
    }
    Ok(())
}

/// Convert one walked object into its catalog row.
fn to_row<R: Read + Seek>(
    image: &Image<R>,
    entry: &WalkEntry,
    encoding: Encoding,
    transform: &PathTransform,
) -> Result<CatalogRow> {
    let inode = &entry.inode;
    let path = normpath(&transform.apply(&encoding.decode(&entry.path)?));
    let (parent, name) = split_path(&path);
    let link_target = match inode.symlink_target() {
        Some(target) => encoding.decode(target)?,
        None => String::new(),
    };
    let mut flags = RowFlags::empty();
    if inode.file_layout().is_some_and(|layout| layout.has_sparse_blocks()) {
        flags |= RowFlags::SPARSE;
    }
    Ok(CatalogRow {
        path: parent.to_string(),
        name: name.to_string(),
        address: entry.address,
        data_offset: 0,
        size: inode.file_size(),
        mtime: inode.mtime.into(),
        mode: inode.mode().into(),
        link_target,
        uid: image.uid(inode)?,
        gid: image.gid(inode)?,
        flags,
    })
}

#[cfg(unix)]
fn host_block_size(metadata: &fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.blksize()).filter(|&size| size > 0)
}

#[cfg(not(unix))]
fn host_block_size(_metadata: &fs::Metadata) -> Option<u64> {
    None
}
