//! A small SquashFS 4.0 writer for tests: zlib data and metadata, fragments, sparse blocks,
//! basic and extended inodes, and xattrs.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::write::ZlibEncoder;
use flate2::Compression;

pub const MTIME: u32 = 1_700_000_000;
pub const UID: u32 = 1000;
pub const GID: u32 = 100;

const MAGIC: u32 = 0x73717368;
const METADATA_BLOCK_SIZE: usize = 8192;
const NO_TABLE: u64 = u64::MAX;
const NO_FRAGMENT: u32 = u32::MAX;
const NO_XATTR: u32 = u32::MAX;
const DATA_UNCOMPRESSED: u32 = 1 << 24;

#[derive(Debug, Clone)]
pub enum Node {
    Dir(BTreeMap<Vec<u8>, Node>),
    File { data: Vec<u8>, extended: bool, xattrs: Vec<(String, Vec<u8>)> },
    Symlink(Vec<u8>),
    Fifo,
    CharDev(u32),
}

#[derive(Debug, Clone)]
pub struct ImageBuilder {
    block_size: u32,
    fragments: bool,
    sparse: bool,
    compress_metadata: bool,
    root: BTreeMap<Vec<u8>, Node>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self { block_size: 4096, fragments: true, sparse: true, compress_metadata: true, root: BTreeMap::new() }
    }

    pub fn block_size(mut self, block_size: u32) -> Self {
        assert!(block_size.is_power_of_two() && (4096..=1 << 20).contains(&block_size));
        self.block_size = block_size;
        self
    }

    /// Pack file tails into fragment blocks (on by default).
    pub fn fragments(mut self, enabled: bool) -> Self {
        self.fragments = enabled;
        self
    }

    /// Store all-zero blocks as sparse (on by default).
    pub fn sparse(mut self, enabled: bool) -> Self {
        self.sparse = enabled;
        self
    }

    pub fn compress_metadata(mut self, enabled: bool) -> Self {
        self.compress_metadata = enabled;
        self
    }

    pub fn dir(mut self, path: &str) -> Self {
        self.insert(path.as_bytes(), Node::Dir(BTreeMap::new()));
        self
    }

    pub fn file(mut self, path: &str, data: impl Into<Vec<u8>>) -> Self {
        self.insert(path.as_bytes(), Node::File { data: data.into(), extended: false, xattrs: Vec::new() });
        self
    }

    /// A file whose path is not valid UTF-8.
    pub fn raw_file(mut self, path: &[u8], data: impl Into<Vec<u8>>) -> Self {
        self.insert(path, Node::File { data: data.into(), extended: false, xattrs: Vec::new() });
        self
    }

    /// A file stored with an extended inode, optionally with xattrs.
    pub fn extended_file(mut self, path: &str, data: impl Into<Vec<u8>>, xattrs: &[(&str, &[u8])]) -> Self {
        let xattrs = xattrs.iter().map(|(k, v)| (k.to_string(), v.to_vec())).collect();
        self.insert(path.as_bytes(), Node::File { data: data.into(), extended: true, xattrs });
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        self.insert(path.as_bytes(), Node::Symlink(target.as_bytes().to_vec()));
        self
    }

    pub fn fifo(mut self, path: &str) -> Self {
        self.insert(path.as_bytes(), Node::Fifo);
        self
    }

    pub fn char_device(mut self, path: &str, device: u32) -> Self {
        self.insert(path.as_bytes(), Node::CharDev(device));
        self
    }

    fn insert(&mut self, path: &[u8], node: Node) {
        let parts: Vec<&[u8]> = path.split(|&b| b == b'/').filter(|p| !p.is_empty()).collect();
        let (last, parents) = parts.split_last().expect("path must name an entry below the root");
        let mut dir = &mut self.root;
        for part in parents {
            dir = match dir.entry(part.to_vec()).or_insert_with(|| Node::Dir(BTreeMap::new())) {
                Node::Dir(children) => children,
                _ => panic!("{} is not a directory", String::from_utf8_lossy(part)),
            };
        }
        dir.insert(last.to_vec(), node);
    }

    /// Serialize the image, padded up to the next 4 KiB boundary. At least one padding byte
    /// always follows `bytes_used`.
    pub fn build(&self) -> Vec<u8> {
        let mut w = Writer::new(self);
        let root_number = 1;
        w.next_number = 2;
        let root = w.write_dir(&self.root, root_number, None);
        w.finish(root)
    }
}

fn zlib(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

struct MetadataWriter {
    compress: bool,
    done: Vec<u8>,
    pending: Vec<u8>,
    block_starts: Vec<u64>,
}

impl MetadataWriter {
    fn new(compress: bool) -> Self {
        Self { compress, done: Vec::new(), pending: Vec::new(), block_starts: Vec::new() }
    }

    /// (metadata block start relative to the table, offset inside the block)
    fn position(&self) -> (u64, u16) {
        (self.done.len() as u64, self.pending.len() as u16)
    }

    fn write(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let n = (METADATA_BLOCK_SIZE - self.pending.len()).min(bytes.len());
            self.pending.extend_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            if self.pending.len() == METADATA_BLOCK_SIZE {
                self.flush();
            }
        }
    }

    fn flush(&mut self) {
        self.block_starts.push(self.done.len() as u64);
        let compressed = zlib(&self.pending);
        if self.compress && compressed.len() < self.pending.len() {
            self.done.write_u16::<LittleEndian>(compressed.len() as u16).unwrap();
            self.done.extend_from_slice(&compressed);
        } else {
            self.done.write_u16::<LittleEndian>(0x8000 | self.pending.len() as u16).unwrap();
            self.done.extend_from_slice(&self.pending);
        }
        self.pending.clear();
    }

    fn finish(mut self) -> (Vec<u8>, Vec<u64>) {
        if !self.pending.is_empty() {
            self.flush();
        }
        (self.done, self.block_starts)
    }
}

struct Child {
    name: Vec<u8>,
    address: (u64, u16),
    type_code: u16,
    number: u32,
}

struct XattrId {
    reference: u64,
    count: u32,
    size: u32,
}

struct Writer<'a> {
    opts: &'a ImageBuilder,
    data: Vec<u8>,
    inodes: MetadataWriter,
    dirs: MetadataWriter,
    frag_pending: Vec<u8>,
    fragments: Vec<(u64, u32)>,
    kv: MetadataWriter,
    kv_values: HashMap<Vec<u8>, u64>,
    xattr_ids: Vec<XattrId>,
    next_number: u32,
}

impl<'a> Writer<'a> {
    fn new(opts: &'a ImageBuilder) -> Self {
        Self {
            opts,
            data: vec![0; 96],
            inodes: MetadataWriter::new(opts.compress_metadata),
            dirs: MetadataWriter::new(opts.compress_metadata),
            frag_pending: Vec::new(),
            fragments: Vec::new(),
            kv: MetadataWriter::new(opts.compress_metadata),
            kv_values: HashMap::new(),
            xattr_ids: Vec::new(),
            next_number: 1,
        }
    }

    fn inode_header(&mut self, type_code: u16, permissions: u16, number: u32) {
        let mut h = Vec::new();
        h.write_u16::<LittleEndian>(type_code).unwrap();
        h.write_u16::<LittleEndian>(permissions).unwrap();
        h.write_u16::<LittleEndian>(0).unwrap();
        h.write_u16::<LittleEndian>(1).unwrap();
        h.write_u32::<LittleEndian>(MTIME).unwrap();
        h.write_u32::<LittleEndian>(number).unwrap();
        self.inodes.write(&h);
    }

    /// Write a data or fragment block, returning its size word.
    fn write_block(&mut self, block: &[u8]) -> u32 {
        let compressed = zlib(block);
        if compressed.len() < block.len() {
            self.data.extend_from_slice(&compressed);
            compressed.len() as u32
        } else {
            self.data.extend_from_slice(block);
            DATA_UNCOMPRESSED | block.len() as u32
        }
    }

    fn flush_fragment(&mut self) {
        if self.frag_pending.is_empty() {
            return;
        }
        let start = self.data.len() as u64;
        let pending = std::mem::take(&mut self.frag_pending);
        let size = self.write_block(&pending);
        self.fragments.push((start, size));
    }

    fn write_xattrs(&mut self, xattrs: &[(String, Vec<u8>)]) -> u32 {
        if xattrs.is_empty() {
            return NO_XATTR;
        }
        let (block, offset) = self.kv.position();
        let mut size = 0;
        for (name, value) in xattrs {
            let (prefix, rest) = [("user.", 0u16), ("trusted.", 1), ("security.", 2)]
                .iter()
                .find_map(|(p, id)| name.strip_prefix(p).map(|rest| (*id, rest)))
                .expect("xattr name needs a user., trusted. or security. prefix");
            let mut pair = Vec::new();
            let out_of_line = self.kv_values.get(value).copied();
            pair.write_u16::<LittleEndian>(prefix | if out_of_line.is_some() { 0x100 } else { 0 }).unwrap();
            pair.write_u16::<LittleEndian>(rest.len() as u16).unwrap();
            pair.extend_from_slice(rest.as_bytes());
            self.kv.write(&pair);
            size += pair.len();

            let mut val = Vec::new();
            match out_of_line {
                Some(reference) => {
                    val.write_u32::<LittleEndian>(8).unwrap();
                    val.write_u64::<LittleEndian>(reference).unwrap();
                },
                None => {
                    let (vb, vo) = self.kv.position();
                    self.kv_values.insert(value.clone(), vb << 16 | u64::from(vo));
                    val.write_u32::<LittleEndian>(value.len() as u32).unwrap();
                    val.extend_from_slice(value);
                },
            }
            self.kv.write(&val);
            size += val.len();
        }
        self.xattr_ids.push(XattrId { reference: block << 16 | u64::from(offset), count: xattrs.len() as u32, size: size as u32 });
        self.xattr_ids.len() as u32 - 1
    }

    fn write_file(&mut self, data: &[u8], extended: bool, xattrs: &[(String, Vec<u8>)], number: u32) -> (u64, u16) {
        let bs = self.opts.block_size as usize;
        let blocks_start = self.data.len() as u64;
        let tail_len = if self.opts.fragments { data.len() % bs } else { 0 };
        let full_len = data.len() - tail_len;

        let mut sizes = Vec::new();
        let mut sparse_bytes = 0u64;
        for chunk in data[..full_len].chunks(bs) {
            if self.opts.sparse && chunk.iter().all(|&b| b == 0) {
                sizes.push(0);
                sparse_bytes += chunk.len() as u64;
            } else {
                sizes.push(self.write_block(chunk));
            }
        }

        let (frag_index, frag_offset) = if tail_len > 0 {
            if self.frag_pending.len() + tail_len > bs {
                self.flush_fragment();
            }
            let offset = self.frag_pending.len() as u32;
            self.frag_pending.extend_from_slice(&data[full_len..]);
            (self.fragments.len() as u32, offset)
        } else {
            (NO_FRAGMENT, 0)
        };

        let xattr = self.write_xattrs(xattrs);
        let extended = extended || xattr != NO_XATTR || blocks_start > u64::from(u32::MAX);
        let address = self.inodes.position();
        let mut body = Vec::new();
        if extended {
            self.inode_header(9, 0o644, number);
            body.write_u64::<LittleEndian>(blocks_start).unwrap();
            body.write_u64::<LittleEndian>(data.len() as u64).unwrap();
            body.write_u64::<LittleEndian>(sparse_bytes).unwrap();
            body.write_u32::<LittleEndian>(1).unwrap();
            body.write_u32::<LittleEndian>(frag_index).unwrap();
            body.write_u32::<LittleEndian>(frag_offset).unwrap();
            body.write_u32::<LittleEndian>(xattr).unwrap();
        } else {
            self.inode_header(2, 0o644, number);
            body.write_u32::<LittleEndian>(blocks_start as u32).unwrap();
            body.write_u32::<LittleEndian>(frag_index).unwrap();
            body.write_u32::<LittleEndian>(frag_offset).unwrap();
            body.write_u32::<LittleEndian>(data.len() as u32).unwrap();
        }
        for size in sizes {
            body.write_u32::<LittleEndian>(size).unwrap();
        }
        self.inodes.write(&body);
        address
    }

    fn write_dir(&mut self, children: &BTreeMap<Vec<u8>, Node>, number: u32, parent: Option<u32>) -> (u64, u16) {
        let mut written = Vec::with_capacity(children.len());
        let mut subdirs = 0;
        for (name, node) in children {
            let child_number = self.next_number;
            self.next_number += 1;
            let (address, type_code) = match node {
                Node::Dir(grandchildren) => {
                    subdirs += 1;
                    (self.write_dir(grandchildren, child_number, Some(number)), 1)
                },
                Node::File { data, extended, xattrs } => (self.write_file(data, *extended, xattrs, child_number), 2),
                Node::Symlink(target) => {
                    let address = self.inodes.position();
                    self.inode_header(3, 0o777, child_number);
                    let mut body = Vec::new();
                    body.write_u32::<LittleEndian>(1).unwrap();
                    body.write_u32::<LittleEndian>(target.len() as u32).unwrap();
                    body.extend_from_slice(target);
                    self.inodes.write(&body);
                    (address, 3)
                },
                Node::CharDev(device) => {
                    let address = self.inodes.position();
                    self.inode_header(5, 0o600, child_number);
                    let mut body = Vec::new();
                    body.write_u32::<LittleEndian>(1).unwrap();
                    body.write_u32::<LittleEndian>(*device).unwrap();
                    self.inodes.write(&body);
                    (address, 5)
                },
                Node::Fifo => {
                    let address = self.inodes.position();
                    self.inode_header(6, 0o600, child_number);
                    self.inodes.write(&1u32.to_le_bytes());
                    (address, 6)
                },
            };
            written.push(Child { name: name.clone(), address, type_code, number: child_number });
        }

        // Listing: entries grouped under headers sharing an inode metadata block.
        let (listing_block, listing_offset) = self.dirs.position();
        let mut listing = Vec::new();
        let mut i = 0;
        while i < written.len() {
            let start = written[i].address.0;
            let base = written[i].number;
            let group: Vec<&Child> = written[i..]
                .iter()
                .take_while(|c| {
                    c.address.0 == start && i64::from(c.number) - i64::from(base) <= i64::from(i16::MAX)
                })
                .take(256)
                .collect();
            listing.write_u32::<LittleEndian>(group.len() as u32 - 1).unwrap();
            listing.write_u32::<LittleEndian>(start as u32).unwrap();
            listing.write_u32::<LittleEndian>(base).unwrap();
            for c in &group {
                listing.write_u16::<LittleEndian>(c.address.1).unwrap();
                listing.write_i16::<LittleEndian>((c.number - base) as i16).unwrap();
                listing.write_u16::<LittleEndian>(c.type_code).unwrap();
                listing.write_u16::<LittleEndian>(c.name.len() as u16 - 1).unwrap();
                listing.extend_from_slice(&c.name);
            }
            i += group.len();
        }
        self.dirs.write(&listing);

        // The root's parent is one past the last inode number.
        let parent = parent.unwrap_or(self.next_number);
        let address = self.inodes.position();
        let file_size = listing.len() + 3;
        let mut body = Vec::new();
        if file_size <= usize::from(u16::MAX) {
            self.inode_header(1, 0o755, number);
            body.write_u32::<LittleEndian>(listing_block as u32).unwrap();
            body.write_u32::<LittleEndian>(2 + subdirs).unwrap();
            body.write_u16::<LittleEndian>(file_size as u16).unwrap();
            body.write_u16::<LittleEndian>(listing_offset).unwrap();
            body.write_u32::<LittleEndian>(parent).unwrap();
        } else {
            self.inode_header(8, 0o755, number);
            body.write_u32::<LittleEndian>(2 + subdirs).unwrap();
            body.write_u32::<LittleEndian>(file_size as u32).unwrap();
            body.write_u32::<LittleEndian>(listing_block as u32).unwrap();
            body.write_u32::<LittleEndian>(parent).unwrap();
            body.write_u16::<LittleEndian>(0).unwrap();
            body.write_u16::<LittleEndian>(listing_offset).unwrap();
            body.write_u32::<LittleEndian>(NO_XATTR).unwrap();
        }
        self.inodes.write(&body);
        address
    }

    /// Append a lookup table (metadata blocks, then the block pointer array) and return the
    /// pointer array's offset.
    fn write_lookup_table(&mut self, entries: &[u8]) -> u64 {
        let mut w = MetadataWriter::new(self.opts.compress_metadata);
        w.write(entries);
        let (bytes, starts) = w.finish();
        let base = self.data.len() as u64;
        self.data.extend_from_slice(&bytes);
        let table = self.data.len() as u64;
        for start in starts {
            self.data.write_u64::<LittleEndian>(base + start).unwrap();
        }
        table
    }

    fn finish(mut self, root: (u64, u16)) -> Vec<u8> {
        self.flush_fragment();
        let inode_count = self.next_number - 1;

        let inode_table = self.data.len() as u64;
        let inodes = std::mem::replace(&mut self.inodes, MetadataWriter::new(false));
        self.data.extend_from_slice(&inodes.finish().0);

        let dir_table = self.data.len() as u64;
        let dirs = std::mem::replace(&mut self.dirs, MetadataWriter::new(false));
        self.data.extend_from_slice(&dirs.finish().0);

        let frag_count = self.fragments.len() as u32;
        let frag_table = if self.fragments.is_empty() {
            NO_TABLE
        } else {
            let mut entries = Vec::new();
            for (start, size) in &self.fragments {
                entries.write_u64::<LittleEndian>(*start).unwrap();
                entries.write_u32::<LittleEndian>(*size).unwrap();
                entries.write_u32::<LittleEndian>(0).unwrap();
            }
            self.write_lookup_table(&entries)
        };

        let mut ids = Vec::new();
        ids.write_u32::<LittleEndian>(UID).unwrap();
        ids.write_u32::<LittleEndian>(GID).unwrap();
        let id_table = self.write_lookup_table(&ids);

        let xattr_table = if self.xattr_ids.is_empty() {
            NO_TABLE
        } else {
            let kv_start = self.data.len() as u64;
            let kv = std::mem::replace(&mut self.kv, MetadataWriter::new(false));
            self.data.extend_from_slice(&kv.finish().0);

            let mut entries = Vec::new();
            for id in &self.xattr_ids {
                entries.write_u64::<LittleEndian>(id.reference).unwrap();
                entries.write_u32::<LittleEndian>(id.count).unwrap();
                entries.write_u32::<LittleEndian>(id.size).unwrap();
            }
            let mut w = MetadataWriter::new(self.opts.compress_metadata);
            w.write(&entries);
            let (bytes, starts) = w.finish();
            let base = self.data.len() as u64;
            self.data.extend_from_slice(&bytes);
            let table = self.data.len() as u64;
            self.data.write_u64::<LittleEndian>(kv_start).unwrap();
            self.data.write_u32::<LittleEndian>(self.xattr_ids.len() as u32).unwrap();
            self.data.write_u32::<LittleEndian>(0).unwrap();
            for start in starts {
                self.data.write_u64::<LittleEndian>(base + start).unwrap();
            }
            table
        };

        let bytes_used = self.data.len() as u64;
        let mut sb = Vec::with_capacity(96);
        sb.write_u32::<LittleEndian>(MAGIC).unwrap();
        sb.write_u32::<LittleEndian>(inode_count).unwrap();
        sb.write_u32::<LittleEndian>(MTIME).unwrap();
        sb.write_u32::<LittleEndian>(self.opts.block_size).unwrap();
        sb.write_u32::<LittleEndian>(frag_count).unwrap();
        sb.write_u16::<LittleEndian>(1).unwrap();
        sb.write_u16::<LittleEndian>(self.opts.block_size.trailing_zeros() as u16).unwrap();
        sb.write_u16::<LittleEndian>(0).unwrap();
        sb.write_u16::<LittleEndian>(2).unwrap();
        sb.write_u16::<LittleEndian>(4).unwrap();
        sb.write_u16::<LittleEndian>(0).unwrap();
        sb.write_u64::<LittleEndian>(root.0 << 16 | u64::from(root.1)).unwrap();
        sb.write_u64::<LittleEndian>(bytes_used).unwrap();
        sb.write_u64::<LittleEndian>(id_table).unwrap();
        sb.write_u64::<LittleEndian>(xattr_table).unwrap();
        sb.write_u64::<LittleEndian>(inode_table).unwrap();
        sb.write_u64::<LittleEndian>(dir_table).unwrap();
        sb.write_u64::<LittleEndian>(frag_table).unwrap();
        sb.write_u64::<LittleEndian>(NO_TABLE).unwrap();
        self.data[..96].copy_from_slice(&sb);

        let padded = (self.data.len() / 4096 + 1) * 4096;
        self.data.resize(padded, 0);
        self.data
    }
}

/// Deterministic, poorly compressible bytes.
pub fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

/// Image with a bit of everything: nested dirs, fragments, a sparse file, stored and
/// compressed multi-block files, a symlink and special files.
pub fn sample_image() -> Vec<u8> {
    let mut sparse = vec![0u8; 4096 * 3];
    sparse.extend_from_slice(b"end of sparse file");
    ImageBuilder::new()
        .file("/hello.txt", "Hello, SquashFS!\n")
        .file("/etc/group", "root:x:0:\nusers:x:100:\n")
        .file("/etc/big.bin", noise(4096 * 2 + 100, 7))
        .file("/var/lib/sparse.img", sparse)
        .file("/usr/share/doc/repeat.txt", "all work and no play ".repeat(600))
        .dir("/var/empty")
        .symlink("/etc/link", "group")
        .fifo("/run/pipe")
        .char_device("/dev/null", 0x0103)
        .build()
}
