use std::borrow::Cow;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::squashfs::DEFAULT_METADATA_CACHE_BLOCKS;

/// Character encoding of names and link targets stored in the image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    #[default]
    #[serde(rename = "utf-8")]
    Utf8,
    #[serde(rename = "iso-8859-1")]
    Latin1,
}

impl Encoding {
    pub fn name(self) -> &'static str {
        match self {
            Encoding::Utf8 => "utf-8",
            Encoding::Latin1 => "iso-8859-1",
        }
    }

    /// Decode raw bytes. UTF-8 is strict; every byte string is valid Latin-1.
    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            Encoding::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|e| Error::Encoding(format!("{:?}: {e}", String::from_utf8_lossy(bytes)))),
            Encoding::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A regex rewrite applied to every full path before it is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformPattern {
    pub pattern: String,
    pub replacement: String,
}

impl TransformPattern {
    pub fn new(pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self { pattern: pattern.into(), replacement: replacement.into() }
    }
}

/// Options for opening a [`SquashFsMountSource`](super::SquashFsMountSource).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    pub encoding: Encoding,
    pub transform: Option<TransformPattern>,
    /// Treat a changed archive modification time as a stale catalog.
    pub verify_modification_time: bool,
    /// Rebuild the catalog even if it is already loaded.
    pub clear_index_cache: bool,
    /// Decompressed metadata blocks kept per image; 0 disables the cache.
    pub metadata_cache_blocks: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            encoding: Encoding::Utf8,
            transform: None,
            verify_modification_time: false,
            clear_index_cache: false,
            metadata_cache_blocks: DEFAULT_METADATA_CACHE_BLOCKS,
        }
    }
}

/// Compiled form of an optional [`TransformPattern`].
#[derive(Debug, Clone)]
pub(crate) struct PathTransform {
    rule: Option<(Regex, String)>,
}

impl PathTransform {
    pub(crate) fn new(pattern: Option<&TransformPattern>) -> Result<Self> {
        let rule = match pattern {
            Some(p) => Some((Regex::new(&p.pattern)?, p.replacement.clone())),
            None => None,
        };
        Ok(Self { rule })
    }

    pub(crate) fn apply<'a>(&self, path: &'a str) -> Cow<'a, str> {
        match &self.rule {
            Some((regex, replacement)) => regex.replace_all(path, replacement.as_str()),
            None => Cow::Borrowed(path),
        }
    }
}
