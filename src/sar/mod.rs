//! Seekable archive (SAR) format
//!
//! A SAR blob is a tar stream cut into independently decompressible frames,
//! followed by one frame holding the JSON table of contents and a fixed-size
//! footer pointing back at it. A legacy tar consumer that ignores the TOC
//! entry can still extract the whole stream; an index-aware reader parses the
//! footer first and fetches only the frames it needs.

pub mod builder;
pub mod reader;
pub mod toc;

use crate::digest::Digest;
use crate::error::{Result, SarError};

/// Magic identifier opening the footer
pub const FOOTER_MAGIC: &[u8; 8] = b"SARBALL\0";
/// Current format version
pub const FORMAT_VERSION: u16 = 1;
/// TOC document version
pub const TOC_VERSION: u32 = 1;
/// Length of the fixed-width digest field: `sha256:` plus 64 hex chars
pub const FOOTER_DIGEST_LEN: usize = 71;
/// Exact footer size: magic, version, TOC offset, TOC size, TOC digest
pub const FOOTER_BYTES: usize = 8 + 2 + 8 + 8 + FOOTER_DIGEST_LEN;
/// Reserved name of the tar entry carrying the TOC document
pub const TOC_ENTRY_NAME: &str = ".sarball.toc.json";
/// Default uncompressed chunk size for regular file content
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.sarball.layer.v1.tar+gzip";
pub const MEDIA_TYPE_LAYER_ZSTD: &str = "application/vnd.sarball.layer.v1.tar+zstd";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// Manifest annotation carrying the TOC document digest
pub const ANNOTATION_TOC_DIGEST: &str = "dev.sarball.toc.digest";
/// Manifest annotation carrying the uncompressed tar digest (diff-id)
pub const ANNOTATION_UNCOMPRESSED_DIGEST: &str = "dev.sarball.uncompressed.digest";

/// The fixed trailer of every SAR blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub version: u16,
    /// Byte offset of the TOC frame within the blob
    pub toc_offset: u64,
    /// Compressed size of the TOC frame
    pub toc_size: u64,
    /// Digest of the TOC JSON document
    pub toc_digest: Digest,
}

impl Footer {
    /// Encode to the exact `FOOTER_BYTES` wire form
    pub fn encode(&self) -> [u8; FOOTER_BYTES] {
        let mut out = [0u8; FOOTER_BYTES];
        out[..8].copy_from_slice(FOOTER_MAGIC);
        out[8..10].copy_from_slice(&self.version.to_le_bytes());
        out[10..18].copy_from_slice(&self.toc_offset.to_le_bytes());
        out[18..26].copy_from_slice(&self.toc_size.to_le_bytes());
        let digest = self.toc_digest.as_str().as_bytes();
        out[26..26 + FOOTER_DIGEST_LEN].copy_from_slice(digest);
        out
    }

    /// Decode and validate the last `FOOTER_BYTES` bytes of a blob
    pub fn decode(data: &[u8]) -> Result<Footer> {
        if data.len() != FOOTER_BYTES {
            return Err(SarError::InvalidArchive(format!(
                "footer must be {} bytes, got {}",
                FOOTER_BYTES,
                data.len()
            )));
        }
        if &data[..8] != FOOTER_MAGIC {
            return Err(SarError::InvalidArchive(
                "bad footer magic, not a seekable archive".to_string(),
            ));
        }
        let version = u16::from_le_bytes([data[8], data[9]]);
        if version != FORMAT_VERSION {
            return Err(SarError::InvalidArchive(format!(
                "unsupported archive format version {}",
                version
            )));
        }
        let toc_offset = u64::from_le_bytes(data[10..18].try_into().unwrap());
        let toc_size = u64::from_le_bytes(data[18..26].try_into().unwrap());
        let digest_str = std::str::from_utf8(&data[26..26 + FOOTER_DIGEST_LEN])
            .map_err(|_| SarError::InvalidArchive("footer digest not UTF-8".to_string()))?;
        let toc_digest = Digest::parse(digest_str)
            .map_err(|e| SarError::InvalidArchive(format!("footer digest invalid: {}", e)))?;
        Ok(Footer {
            version,
            toc_offset,
            toc_size,
            toc_digest,
        })
    }
}
