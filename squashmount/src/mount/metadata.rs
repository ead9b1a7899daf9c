use std::fs;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use super::options::{Encoding, MountOptions, TransformPattern};

/// Identity recorded in every catalog this crate builds.
pub const BACKEND_NAME: &str = "SquashFSMountSource";

/// The options that shape catalog contents. A catalog is only reusable when these match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexArguments {
    pub encoding: Encoding,
    pub transform_pattern: Option<TransformPattern>,
}

impl From<&MountOptions> for IndexArguments {
    fn from(options: &MountOptions) -> Self {
        Self { encoding: options.encoding, transform_pattern: options.transform.clone() }
    }
}

/// Size and modification time of an archive file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub st_size: u64,
    /// Seconds since the epoch, with sub-second precision.
    pub st_mtime: f64,
}

impl ArchiveStats {
    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        let st_mtime = metadata.modified().ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0.0, |d| d.as_secs_f64());
        Self { st_size: metadata.len(), st_mtime }
    }
}
