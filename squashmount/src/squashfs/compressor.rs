//! Block decoders selected by the image's compression method id.
//!
//! Every decoder is stateless: it turns one compressed block into bytes and touches no shared
//! state, so callers run it outside the image lock. Which backend serves a method is decided
//! once per process by [`detected_backends`], an ordered preference list in which faster
//! native backends come before the always-available pure-Rust ones.

use std::fmt;
use std::io::Read;
use std::sync::{Arc, OnceLock};

use tracing::debug;

use super::superblock::Compression;
use crate::error::{Error, Result};

/// A stateless block decoder.
pub trait Decompressor: Send + Sync + fmt::Debug {
    fn backend(&self) -> Backend;

    /// Decompress one whole block. `uncompressed_size` is the most bytes the block may expand
    /// to; the result may be shorter.
    fn decompress(&self, compressed: &[u8], uncompressed_size: usize) -> Result<Vec<u8>>;
}

/// Strategy used by an image to obtain its decoder.
pub trait DecompressorFactory: Send + Sync {
    fn decoder(&self, method_id: u16, block_size: u32) -> Result<Arc<dyn Decompressor>>;
}

/// Decoder implementations, in no particular order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// libdeflate via `libdeflater`.
    Libdeflate,
    /// zlib streams via `flate2`.
    Flate2,
    /// SquashFS-flavoured LZMA via the `lzma-rs` raw decoder.
    LzmaRaw,
    /// xz streams via `lzma-rs`.
    Xz,
    /// LZ4 blocks via `lz4_flex`.
    Lz4Flex,
    /// zstd frames via `ruzstd`.
    Ruzstd,
}

impl Backend {
    pub fn method(self) -> Compression {
        match self {
            Backend::Libdeflate | Backend::Flate2 => Compression::Gzip,
            Backend::LzmaRaw => Compression::Lzma,
            Backend::Xz => Compression::Xz,
            Backend::Lz4Flex => Compression::Lz4,
            Backend::Ruzstd => Compression::Zstd,
        }
    }

    /// Whether this backend was compiled in.
    pub fn is_available(self) -> bool {
        match self {
            Backend::Libdeflate => cfg!(feature = "libdeflater"),
            Backend::Flate2 => cfg!(feature = "flate2"),
            Backend::LzmaRaw | Backend::Xz => cfg!(feature = "lzma-rs"),
            Backend::Lz4Flex => cfg!(feature = "lz4_flex"),
            Backend::Ruzstd => cfg!(feature = "ruzstd"),
        }
    }

    #[cfg_attr(not(feature = "lzma-rs"), allow(unused_variables))]
    fn build(self, block_size: u32) -> Option<Arc<dyn Decompressor>> {
        let decoder: Arc<dyn Decompressor> = match self {
            #[cfg(feature = "libdeflater")]
            Backend::Libdeflate => Arc::new(LibdeflateZlib),
            #[cfg(feature = "flate2")]
            Backend::Flate2 => Arc::new(Flate2Zlib),
            #[cfg(feature = "lzma-rs")]
            Backend::LzmaRaw => Arc::new(SquashfsLzma { dict_size: block_size }),
            #[cfg(feature = "lzma-rs")]
            Backend::Xz => Arc::new(XzStream),
            #[cfg(feature = "lz4_flex")]
            Backend::Lz4Flex => Arc::new(Lz4Block),
            #[cfg(feature = "ruzstd")]
            Backend::Ruzstd => Arc::new(ZstdFrame),
            #[allow(unreachable_patterns)]
            _ => return None,
        };
        Some(decoder)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Libdeflate => "libdeflate",
            Backend::Flate2 => "flate2",
            Backend::LzmaRaw => "lzma-raw",
            Backend::Xz => "xz",
            Backend::Lz4Flex => "lz4_flex",
            Backend::Ruzstd => "ruzstd",
        };
        f.write_str(name)
    }
}

// Preference order; earlier entries win when several serve the same method.
const PREFERENCE_ORDER: [Backend; 6] = [
    Backend::Libdeflate,
    Backend::Flate2,
    Backend::LzmaRaw,
    Backend::Xz,
    Backend::Lz4Flex,
    Backend::Ruzstd,
];

/// The available backends in preference order, probed once per process.
pub fn detected_backends() -> &'static [Backend] {
    static DETECTED: OnceLock<Vec<Backend>> = OnceLock::new();
    DETECTED.get_or_init(|| {
        let available: Vec<Backend> = PREFERENCE_ORDER.into_iter().filter(|b| b.is_available()).collect();
        debug!(backends = ?available, "detected decompression backends");
        available
    })
}

/// Maps compression method ids to decoders following a preference list.
#[derive(Debug, Clone)]
pub struct DecoderRegistry {
    preferences: Vec<Backend>,
}

impl DecoderRegistry {
    /// Registry over every compiled-in backend.
    pub fn detect() -> Self {
        Self { preferences: detected_backends().to_vec() }
    }

    /// Registry with an explicit preference list. Unavailable backends are dropped.
    pub fn with_preferences(preferences: impl IntoIterator<Item = Backend>) -> Self {
        Self { preferences: preferences.into_iter().filter(|b| b.is_available()).collect() }
    }

    pub fn preferences(&self) -> &[Backend] {
        &self.preferences
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::detect()
    }
}

impl DecompressorFactory for DecoderRegistry {
    fn decoder(&self, method_id: u16, block_size: u32) -> Result<Arc<dyn Decompressor>> {
        let method = Compression::try_from(method_id)
            .map_err(|_| Error::UnsupportedCompression(method_id))?;
        self.preferences
            .iter()
            .filter(|b| b.method() == method)
            .find_map(|b| b.build(block_size))
            .ok_or(Error::UnsupportedCompression(method_id))
    }
}

fn decode_failure(backend: Backend, err: impl fmt::Display) -> Error {
    Error::CorruptImage(format!("{backend} decompression failed: {err}"))
}

#[cfg(feature = "libdeflater")]
#[derive(Debug)]
struct LibdeflateZlib;

#[cfg(feature = "libdeflater")]
impl Decompressor for LibdeflateZlib {
    fn backend(&self) -> Backend {
        Backend::Libdeflate
    }

    fn decompress(&self, compressed: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
        let mut out = vec![0; uncompressed_size];
        let n = libdeflater::Decompressor::new()
            .zlib_decompress(compressed, &mut out)
            .map_err(|e| decode_failure(self.backend(), e))?;
        out.truncate(n);
        Ok(out)
    }
}

#[cfg(feature = "flate2")]
#[derive(Debug)]
struct Flate2Zlib;

#[cfg(feature = "flate2")]
impl Decompressor for Flate2Zlib {
    fn backend(&self) -> Backend {
        Backend::Flate2
    }

    fn decompress(&self, compressed: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(uncompressed_size);
        flate2::read::ZlibDecoder::new(compressed)
            .take(uncompressed_size as u64)
            .read_to_end(&mut out)
            .map_err(|e| decode_failure(self.backend(), e))?;
        Ok(out)
    }
}

/// LZMA as written by mksquashfs: a 13-byte header (5 property bytes, then the little-endian
/// uncompressed size) in front of a raw LZMA1 stream. The stream is decoded with the fixed
/// parameters the image builder uses (lc=3, lp=0, pb=2) and the image block size as the
/// dictionary size; the property bytes are ignored.
#[cfg(feature = "lzma-rs")]
#[derive(Debug)]
struct SquashfsLzma {
    dict_size: u32,
}

#[cfg(feature = "lzma-rs")]
const LZMA_PROPS_SIZE: usize = 5;
#[cfg(feature = "lzma-rs")]
const LZMA_HEADER_SIZE: usize = LZMA_PROPS_SIZE + 8;

#[cfg(feature = "lzma-rs")]
impl Decompressor for SquashfsLzma {
    fn backend(&self) -> Backend {
        Backend::LzmaRaw
    }

    fn decompress(&self, compressed: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
        use byteorder::{ByteOrder, LittleEndian};
        use lzma_rs::decompress::raw::{LzmaDecoder, LzmaParams, LzmaProperties};

        if compressed.len() < LZMA_HEADER_SIZE {
            return Err(decode_failure(self.backend(), "block shorter than the LZMA header"));
        }
        let declared = LittleEndian::read_u64(&compressed[LZMA_PROPS_SIZE..LZMA_HEADER_SIZE]);
        let unpacked_size = (declared != u64::MAX).then_some(declared);
        if unpacked_size.is_some_and(|n| n > uncompressed_size as u64) {
            return Err(decode_failure(
                self.backend(),
                format!("declared size {declared} exceeds {uncompressed_size}"),
            ));
        }

        let properties = LzmaProperties { lc: 3, lp: 0, pb: 2 };
        let params = LzmaParams::new(properties, self.dict_size, unpacked_size);
        let mut decoder = LzmaDecoder::new(params, None).map_err(|e| decode_failure(self.backend(), e))?;
        let mut out = Vec::with_capacity(uncompressed_size);
        decoder
            .decompress(&mut &compressed[LZMA_HEADER_SIZE..], &mut out)
            .map_err(|e| decode_failure(self.backend(), e))?;
        if out.len() > uncompressed_size {
            return Err(decode_failure(self.backend(), "stream expands beyond block size"));
        }
        Ok(out)
    }
}

#[cfg(feature = "lzma-rs")]
#[derive(Debug)]
struct XzStream;

#[cfg(feature = "lzma-rs")]
impl Decompressor for XzStream {
    fn backend(&self) -> Backend {
        Backend::Xz
    }

    fn decompress(&self, compressed: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
        // The xz decompressor doesn't support incremental reading, so the whole block is
        // expanded into a buffer.
        let mut out = Vec::with_capacity(uncompressed_size);
        lzma_rs::xz_decompress(&mut &compressed[..], &mut out)
            .map_err(|e| decode_failure(self.backend(), e))?;
        if out.len() > uncompressed_size {
            return Err(decode_failure(self.backend(), "stream expands beyond block size"));
        }
        Ok(out)
    }
}

#[cfg(feature = "lz4_flex")]
#[derive(Debug)]
struct Lz4Block;

#[cfg(feature = "lz4_flex")]
impl Decompressor for Lz4Block {
    fn backend(&self) -> Backend {
        Backend::Lz4Flex
    }

    fn decompress(&self, compressed: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
        lz4_flex::block::decompress(compressed, uncompressed_size)
            .map_err(|e| decode_failure(self.backend(), e))
    }
}

#[cfg(feature = "ruzstd")]
#[derive(Debug)]
struct ZstdFrame;

#[cfg(feature = "ruzstd")]
impl Decompressor for ZstdFrame {
    fn backend(&self) -> Backend {
        Backend::Ruzstd
    }

    fn decompress(&self, compressed: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
        use ruzstd::decoding::StreamingDecoder;

        let decoder = StreamingDecoder::new(compressed)
            .map_err(|e| decode_failure(self.backend(), e))?;
        let mut out = Vec::with_capacity(uncompressed_size);
        decoder
            .take(uncompressed_size as u64)
            .read_to_end(&mut out)
            .map_err(|e| decode_failure(self.backend(), e))?;
        Ok(out)
    }
}
