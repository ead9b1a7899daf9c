mod directory;
mod file;
mod image;
mod inode;
mod locate;
mod source;
mod walk;
mod xattr;

pub mod compressor;
pub mod metadata;
pub mod superblock;

pub use compressor::{Backend, DecoderRegistry, Decompressor, DecompressorFactory};
pub use directory::DirectoryEntry;
pub use file::VirtualFile;
pub use image::{Directory, Image, ImageOptions, DEFAULT_METADATA_CACHE_BLOCKS};
pub use inode::{BlockDescriptor, DirLayout, FileLayout, FragmentTail, InodeDetail, InodeKind, InodeMetadata};
pub use locate::find_superblock_offset;
pub use metadata::InodeAddress;
pub use source::SharedSource;
pub use superblock::{Compression, Superblock};
pub use walk::{Walk, WalkEntry};
pub use xattr::Xattr;
