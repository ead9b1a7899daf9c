//! Error types for squashmount.
//!
//! | Variant | Raised by | Recovery |
//! |---------|-----------|----------|
//! | `Format` | superblock validation, inode address construction | fatal at open |
//! | `CorruptImage` | table, inode, directory and block decoding | fatal for the affected object |
//! | `UnsupportedCompression` | first block decoded with an unknown method | fatal |
//! | `StaleIndex` | catalog metadata checks on reopen | discard and rebuild the catalog |
//! | `UnsupportedOperation` | write / descriptor queries on a [`VirtualFile`] | local to the call |
//! | `Io` | the underlying byte source | propagated, never retried |
//!
//! [`VirtualFile`]: crate::squashfs::VirtualFile

use std::io;

use thiserror::Error;

/// Unified error type for all squashmount operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Operating system I/O error from the byte source.
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// The image is not a SquashFS 4.0 image, or an address is out of range.
    #[error("invalid SquashFS format: {0}")]
    Format(String),

    /// A table, inode, directory listing or data block could not be decoded.
    #[error("corrupt SquashFS image: {0}")]
    CorruptImage(String),

    /// No decoder backend exists for the image's compression method id.
    #[error("unsupported compression method id {0}")]
    UnsupportedCompression(u16),

    /// A persisted catalog no longer matches its archive.
    #[error("stale index: {0}")]
    StaleIndex(String),

    /// The operation is not available on a read-only stream.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a regular file: {0}")]
    NotAFile(String),

    /// Names or link targets could not be decoded with the configured encoding.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failure reported by the catalog collaborator.
    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("invalid transform pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("invalid catalog metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl Error {
    /// Map to the POSIX errno reported by a mount layer.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Format(_) | Self::CorruptImage(_) => libc::EIO,
            Self::UnsupportedCompression(_) | Self::UnsupportedOperation(_) => libc::EOPNOTSUPP,
            Self::StaleIndex(_) | Self::Catalog(_) | Self::Metadata(_) => libc::EIO,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotAFile(_) => libc::EISDIR,
            Self::Encoding(_) | Self::Pattern(_) => libc::EINVAL,
        }
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::Io(err) => err.kind(),
            Self::Format(_) | Self::CorruptImage(_) | Self::Encoding(_) => io::ErrorKind::InvalidData,
            Self::UnsupportedCompression(_) | Self::UnsupportedOperation(_) => io::ErrorKind::Unsupported,
            Self::NotFound(_) => io::ErrorKind::NotFound,
            Self::NotAFile(_) | Self::Pattern(_) => io::ErrorKind::InvalidInput,
            Self::StaleIndex(_) | Self::Catalog(_) | Self::Metadata(_) => io::ErrorKind::Other,
        }
    }

    /// Convert an `io::Error` raised while parsing on-disk structures. Running out of bytes
    /// mid-structure means the structure is damaged, not that the byte source failed.
    pub(crate) fn parse(context: &str) -> impl Fn(io::Error) -> Error + '_ {
        move |err| match err.kind() {
            io::ErrorKind::UnexpectedEof => Error::CorruptImage(format!("truncated {context}")),
            _ => Error::from(err),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        // Errors raised inside Read/Seek impls travel as io::Error; recover the original.
        if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(own) = inner.downcast::<Error>() {
                    return *own;
                }
            }
            return Error::Io(io::Error::other("unrecoverable wrapped error"));
        }
        Error::Io(err)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

/// Result alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
