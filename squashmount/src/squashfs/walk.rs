use std::io::{Read, Seek};
use std::iter::FusedIterator;
use std::sync::Arc;

use super::directory::DirectoryEntry;
use super::image::Image;
use super::inode::InodeMetadata;
use super::metadata::InodeAddress;
use crate::error::{Error, Result};

/// One object reached by [`Walk`], with its decoded inode and full path from the root
/// (`/` for the root itself).
#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub address: InodeAddress,
    pub path: Vec<u8>,
    pub inode: InodeMetadata,
}

impl WalkEntry {
    /// The final path component; empty for the root.
    pub fn name(&self) -> &[u8] {
        match self.path.iter().rposition(|&b| b == b'/') {
            Some(pos) => &self.path[pos + 1..],
            None => &self.path,
        }
    }
}

struct Frame {
    address: InodeAddress,
    path: Vec<u8>,
    entries: Arc<[DirectoryEntry]>,
    next: usize,
}

/// Depth-first pre-order traversal. The root comes first; every directory is yielded before
/// its children and its subtree is finished before its next sibling. Only the listings of the
/// directories on the current path are held, one frame each.
///
/// The first error ends the traversal.
pub struct Walk<'a, R> {
    image: &'a Image<R>,
    stack: Vec<Frame>,
    started: bool,
    done: bool,
}

impl<'a, R: Read + Seek> Walk<'a, R> {
    pub(crate) fn new(image: &'a Image<R>) -> Self {
        Self { image, stack: Vec::new(), started: false, done: false }
    }

    /// Directory frames currently held.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    fn start(&mut self) -> Result<WalkEntry> {
        let root = self.image.root()?;
        self.stack.push(Frame {
            address: root.address,
            path: Vec::new(),
            entries: Arc::clone(&root.entries),
            next: 0,
        });
        Ok(WalkEntry { address: root.address, path: b"/".to_vec(), inode: root.inode.clone() })
    }

    fn visit(&mut self, entry: DirectoryEntry, path: Vec<u8>) -> Result<WalkEntry> {
        let inode = self.image.resolve_inode(entry.address)?;
        if inode.is_dir() {
            if self.stack.iter().any(|f| f.address == entry.address) {
                return Err(Error::CorruptImage(format!(
                    "directory {entry_path} at {:?} contains itself",
                    entry.address,
                    entry_path = String::from_utf8_lossy(&path),
                )));
            }
            let entries = self.image.read_dir(&inode)?.into();
            self.stack.push(Frame { address: entry.address, path: path.clone(), entries, next: 0 });
        }
        Ok(WalkEntry { address: entry.address, path, inode })
    }

    fn advance(&mut self) -> Option<Result<WalkEntry>> {
        if !self.started {
            self.started = true;
            return Some(self.start());
        }
        loop {
            let frame = self.stack.last_mut()?;
            let Some(entry) = frame.entries.get(frame.next).cloned() else {
                self.stack.pop();
                continue;
            };
            frame.next += 1;
            let mut path = frame.path.clone();
            path.push(b'/');
            path.extend_from_slice(&entry.name);
            return Some(self.visit(entry, path));
        }
    }
}

impl<R: Read + Seek> Iterator for Walk<'_, R> {
    type Item = Result<WalkEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.advance();
        match &item {
            None | Some(Err(_)) => {
                self.done = true;
                self.stack.clear();
            },
            Some(Ok(_)) => {},
        }
        item
    }
}

impl<R: Read + Seek> FusedIterator for Walk<'_, R> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_names() {
        let inode = InodeMetadata {
            kind: crate::squashfs::InodeKind::Fifo,
            permissions: 0o600,
            uid_index: 0,
            gid_index: 0,
            mtime: 0,
            inode_number: 1,
            link_count: 1,
            block_size: 4096,
            xattr_index: None,
            detail: crate::squashfs::InodeDetail::Ipc,
        };
        let mut entry = WalkEntry { address: InodeAddress::from_raw(0), path: b"/".to_vec(), inode };
        assert_eq!(entry.name(), b"");
        entry.path = b"/usr/lib/pipe".to_vec();
        assert_eq!(entry.name(), b"pipe");
    }
}
