//! Squashmount provides read-only random access into SquashFS images without extracting them.
//! Inodes and directory listings are decoded on demand, files are exposed as seekable
//! streams, and a whole image can be indexed into a path catalog for serving a mount.
//!
//! ## Feature Flags
//! Each compression method is behind a feature. `gzip`, `lzma`, `xz`, `lz4` and `zstd` are on
//! by default and use pure-Rust decoders; `libdeflate` adds a native gzip decoder that is
//! preferred over flate2 when compiled in. LZO images open but fail on the first compressed
//! block with [`Error::UnsupportedCompression`].
//!
//! ## Usage Example
//! ```no_run
//! use std::io;
//! use squashmount::catalog::MemoryCatalog;
//! use squashmount::mount::{MountOptions, SquashFsMountSource};
//!
//! fn print_file_from_squashfs() -> squashmount::Result<()> {
//!     // Open the image and index it into an in-memory catalog
//!     let source = SquashFsMountSource::from_path("rootfs.squashfs", MemoryCatalog::new(), MountOptions::default())?;
//!
//!     // Look up a file and copy its contents to stdout
//!     let row = source.lookup("/etc/group")?.ok_or_else(|| squashmount::Error::NotFound("/etc/group".into()))?;
//!     let mut file = source.open(&row)?;
//!     let mut stdout = io::stdout().lock();
//!     io::copy(&mut file, &mut stdout)?;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod error;
pub mod mount;
pub mod squashfs;

pub use error::{Error, Result};
