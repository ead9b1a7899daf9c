use super::{split_path, Catalog, CatalogMetadata, CatalogRow};
use crate::error::{Error, Result};

/// A catalog held entirely in memory. Cloning a finalized catalog yields one that reports
/// itself as loaded, which is how tests model reopening a persisted index.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    rows: Vec<CatalogRow>,
    metadata: Option<CatalogMetadata>,
    schema: bool,
    finalized: bool,
    read_only: bool,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// All rows; sorted by `(path, name)` once finalized.
    pub fn rows(&self) -> &[CatalogRow] {
        &self.rows
    }

    /// Replace the stored metadata regardless of access mode.
    pub fn set_metadata(&mut self, metadata: Option<CatalogMetadata>) {
        self.metadata = metadata;
    }

    fn writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::Catalog("catalog is read-only".into()));
        }
        Ok(())
    }
}

impl Catalog for MemoryCatalog {
    fn is_loaded(&self) -> bool {
        self.finalized
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.writable()?;
        self.schema = true;
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        *self = Self::default();
        Ok(())
    }

    fn bulk_insert(&mut self, rows: Vec<CatalogRow>) -> Result<()> {
        self.writable()?;
        if !self.schema {
            return Err(Error::Catalog("insert before schema was created".into()));
        }
        self.rows.extend(rows);
        self.finalized = false;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.writable()?;
        self.rows.sort_by(|a, b| (&a.path, &a.name).cmp(&(&b.path, &b.name)));
        self.finalized = true;
        Ok(())
    }

    fn reload_read_only(&mut self) -> Result<()> {
        self.read_only = true;
        Ok(())
    }

    fn metadata(&self) -> Result<Option<CatalogMetadata>> {
        Ok(self.metadata.clone())
    }

    fn store_metadata(&mut self, metadata: &CatalogMetadata) -> Result<()> {
        self.writable()?;
        self.metadata = Some(metadata.clone());
        Ok(())
    }

    fn lookup(&self, path: &str) -> Result<Option<CatalogRow>> {
        let (parent, name) = split_path(path);
        let key = (parent, name);
        let found = if self.finalized {
            self.rows
                .binary_search_by(|row| (row.path.as_str(), row.name.as_str()).cmp(&key))
                .ok()
                .map(|i| &self.rows[i])
        } else {
            self.rows.iter().find(|row| row.path == parent && row.name == name)
        };
        Ok(found.cloned())
    }

    fn first_regular_file(&self) -> Result<Option<CatalogRow>> {
        Ok(self.rows.iter().filter(|row| row.is_file()).min_by_key(|row| row.address).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RowFlags;
    use crate::squashfs::InodeAddress;

    fn row(path: &str, name: &str, address: u64, mode: u32) -> CatalogRow {
        CatalogRow {
            path: path.into(),
            name: name.into(),
            address: InodeAddress::from_raw(address),
            data_offset: 0,
            size: 0,
            mtime: 0,
            mode,
            link_target: String::new(),
            uid: 0,
            gid: 0,
            flags: RowFlags::empty(),
        }
    }

    #[test]
    fn lookup_after_finalize() -> Result<()> {
        let mut catalog = MemoryCatalog::new();
        catalog.ensure_schema()?;
        catalog.bulk_insert(vec![row("", "", 0, 0o040755), row("/b", "z", 30, 0o100644)])?;
        catalog.bulk_insert(vec![row("", "b", 20, 0o040755), row("", "a", 10, 0o100644)])?;
        assert!(!catalog.is_loaded());
        assert_eq!(catalog.lookup("/a")?.map(|r| r.address.as_u64()), Some(10));
        catalog.finalize()?;

        assert!(catalog.is_loaded());
        assert_eq!(catalog.lookup("/")?.map(|r| r.address.as_u64()), Some(0));
        assert_eq!(catalog.lookup("/b/z")?.map(|r| r.address.as_u64()), Some(30));
        assert_eq!(catalog.lookup("/missing")?, None);
        assert_eq!(catalog.first_regular_file()?.map(|r| r.name), Some("a".to_string()));
        Ok(())
    }

    #[test]
    fn read_only_rejects_writes() -> Result<()> {
        let mut catalog = MemoryCatalog::new();
        catalog.ensure_schema()?;
        catalog.finalize()?;
        catalog.reload_read_only()?;
        assert!(matches!(catalog.bulk_insert(Vec::new()), Err(Error::Catalog(_))));
        assert!(matches!(catalog.store_metadata(&CatalogMetadata::default()), Err(Error::Catalog(_))));
        catalog.clear()?;
        assert!(!catalog.is_loaded());
        catalog.ensure_schema()?;
        Ok(())
    }
}
