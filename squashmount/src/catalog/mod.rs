//! The narrow interface through which the indexer talks to a persisted path→metadata store.
//!
//! Rows are keyed by `(path, name)` where `path` is the normalized parent directory (`""` for
//! entries directly below the root, and for the root itself whose name is also `""`).

mod memory;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::squashfs::InodeAddress;

pub use memory::MemoryCatalog;

const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;

bitflags! {
    #[derive(Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct RowFlags: u8 {
        /// Member of a TAR archive; never set for SquashFS rows.
        const TAR = 0b01;
        /// Regular file with at least one sparse block.
        const SPARSE = 0b10;
    }
}

/// One filesystem object as stored in a catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRow {
    pub path: String,
    pub name: String,
    /// Packed inode address; the key used to reopen the object.
    pub address: InodeAddress,
    /// Unused for SquashFS, whose data is split over many blocks; always 0.
    pub data_offset: u64,
    /// Data size for regular files, 0 for everything else.
    pub size: u64,
    pub mtime: u64,
    pub mode: u32,
    pub link_target: String,
    pub uid: u32,
    pub gid: u32,
    pub flags: RowFlags,
}

impl CatalogRow {
    /// `path` and `name` joined back into an absolute path.
    pub fn full_path(&self) -> String {
        if self.path.is_empty() {
            format!("/{}", self.name)
        } else {
            format!("{}/{}", self.path, self.name)
        }
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

/// Key/value metadata a catalog keeps next to its rows. Values are JSON documents owned by the
/// component that built the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogMetadata {
    /// Options that change the catalog's contents, e.g. encoding and path transform.
    pub arguments: Option<String>,
    /// Size and modification time of the archive when the catalog was built.
    pub archive_stats: Option<String>,
    /// Identity of the builder. Catalogs written by older builders lack it.
    pub backend_name: Option<String>,
}

/// A path→row store. Building runs once, single-threaded, before any lookups; lookups may then
/// come from several threads.
pub trait Catalog {
    /// Whether the catalog already holds a complete, previously built index.
    fn is_loaded(&self) -> bool;

    /// Prepare whatever tables the build needs.
    fn ensure_schema(&mut self) -> Result<()>;

    /// Drop all rows and metadata.
    fn clear(&mut self) -> Result<()>;

    fn bulk_insert(&mut self, rows: Vec<CatalogRow>) -> Result<()>;

    /// Sort and index everything inserted so far. Called once after the last insert.
    fn finalize(&mut self) -> Result<()>;

    /// Switch to read-only access for serving lookups.
    fn reload_read_only(&mut self) -> Result<()>;

    fn metadata(&self) -> Result<Option<CatalogMetadata>>;

    fn store_metadata(&mut self, metadata: &CatalogMetadata) -> Result<()>;

    /// The row for a normalized absolute path.
    fn lookup(&self, path: &str) -> Result<Option<CatalogRow>>;

    /// The regular file with the lowest inode address.
    fn first_regular_file(&self) -> Result<Option<CatalogRow>>;
}

impl<C: Catalog + ?Sized> Catalog for &mut C {
    fn is_loaded(&self) -> bool {
        (**self).is_loaded()
    }

    fn ensure_schema(&mut self) -> Result<()> {
        (**self).ensure_schema()
    }

    fn clear(&mut self) -> Result<()> {
        (**self).clear()
    }

    fn bulk_insert(&mut self, rows: Vec<CatalogRow>) -> Result<()> {
        (**self).bulk_insert(rows)
    }

    fn finalize(&mut self) -> Result<()> {
        (**self).finalize()
    }

    fn reload_read_only(&mut self) -> Result<()> {
        (**self).reload_read_only()
    }

    fn metadata(&self) -> Result<Option<CatalogMetadata>> {
        (**self).metadata()
    }

    fn store_metadata(&mut self, metadata: &CatalogMetadata) -> Result<()> {
        (**self).store_metadata(metadata)
    }

    fn lookup(&self, path: &str) -> Result<Option<CatalogRow>> {
        (**self).lookup(path)
    }

    fn first_regular_file(&self) -> Result<Option<CatalogRow>> {
        (**self).first_regular_file()
    }
}

/// Normalize a path to absolute form: repeated separators and `.` collapse, `..` removes the
/// previous component and never climbs above the root.
pub fn normpath(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {},
            ".." => {
                parts.pop();
            },
            name => parts.push(name),
        }
    }
    let mut out = String::with_capacity(path.len() + 1);
    for part in &parts {
        out.push('/');
        out.push_str(part);
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Split a normalized path into `(parent, name)`. The root splits into `("", "")`.
pub fn split_path(path: &str) -> (&str, &str) {
    if path == "/" {
        return ("", "");
    }
    match path.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_paths() {
        assert_eq!(normpath("/"), "/");
        assert_eq!(normpath(""), "/");
        assert_eq!(normpath("//usr/./lib//"), "/usr/lib");
        assert_eq!(normpath("/usr/lib/../bin"), "/usr/bin");
        assert_eq!(normpath("/../../etc"), "/etc");
        assert_eq!(normpath("relative/x"), "/relative/x");
    }

    #[test]
    fn splits_paths() {
        assert_eq!(split_path("/"), ("", ""));
        assert_eq!(split_path("/a"), ("", "a"));
        assert_eq!(split_path("/a/b/c"), ("/a/b", "c"));
    }

    #[test]
    fn full_path_round_trip() {
        let row = CatalogRow {
            path: "/usr/lib".into(),
            name: "libz.so".into(),
            address: InodeAddress::from_raw(0),
            data_offset: 0,
            size: 0,
            mtime: 0,
            mode: 0o120777,
            link_target: "libz.so.1".into(),
            uid: 0,
            gid: 0,
            flags: RowFlags::empty(),
        };
        assert_eq!(row.full_path(), "/usr/lib/libz.so");
        assert!(row.is_symlink());
        assert!(!row.is_file());
        let root = CatalogRow { path: String::new(), name: String::new(), ..row };
        assert_eq!(root.full_path(), "/");
    }
}
