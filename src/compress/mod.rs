//! Frame-oriented compression codecs
//!
//! Archives are sequences of independently decodable compressed frames so
//! chunk-level random access never has to decompress from the start of the
//! blob. Two codecs are supported: gzip (flate2) and zstd. Extraction detects
//! the codec by sniffing the first four bytes of the stream.

use crate::error::{Result, SarError};
use std::io::Read;

pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Supported frame codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Zstd,
}

impl Codec {
    /// Magic byte prefix of a frame produced by this codec
    pub fn magic(&self) -> &'static [u8] {
        match self {
            Codec::Gzip => &GZIP_MAGIC,
            Codec::Zstd => &ZSTD_MAGIC,
        }
    }

    /// Sniff a codec from the first bytes of a stream
    pub fn detect(prefix: &[u8]) -> Result<Codec> {
        if prefix.starts_with(&GZIP_MAGIC) {
            Ok(Codec::Gzip)
        } else if prefix.starts_with(&ZSTD_MAGIC) {
            Ok(Codec::Zstd)
        } else {
            Err(SarError::InvalidArchive(format!(
                "unrecognized compression magic: {:02x?}",
                &prefix[..prefix.len().min(4)]
            )))
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::Gzip => "gzip",
            Codec::Zstd => "zstd",
        }
    }

    /// Parse a codec name from the CLI
    pub fn parse(name: &str) -> Result<Codec> {
        match name {
            "gzip" => Ok(Codec::Gzip),
            "zstd" => Ok(Codec::Zstd),
            other => Err(SarError::InvalidArchive(format!(
                "unknown compression codec: {}",
                other
            ))),
        }
    }

    /// Compress one independently decodable frame
    pub fn compress_frame(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Codec::Gzip => {
                use flate2::Compression;
                use flate2::write::GzEncoder;
                use std::io::Write;
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(data)
                    .map_err(|e| SarError::Io(format!("gzip frame write failed: {}", e)))?;
                encoder
                    .finish()
                    .map_err(|e| SarError::Io(format!("gzip frame finish failed: {}", e)))
            }
            Codec::Zstd => zstd::stream::encode_all(data, 0)
                .map_err(|e| SarError::Io(format!("zstd frame encode failed: {}", e))),
        }
    }

    /// Decompress a single frame from the start of `data`. Trailing bytes
    /// beyond the frame are ignored, so a caller may pass a window that
    /// overlaps the next frame.
    pub fn decompress_frame(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            Codec::Gzip => {
                let mut decoder = flate2::read::GzDecoder::new(data);
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| SarError::InvalidArchive(format!("gzip frame decode failed: {}", e)))?;
            }
            Codec::Zstd => {
                let mut decoder = zstd::stream::read::Decoder::new(data)
                    .map_err(|e| SarError::InvalidArchive(format!("zstd frame decode failed: {}", e)))?
                    .single_frame();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|e| SarError::InvalidArchive(format!("zstd frame decode failed: {}", e)))?;
            }
        }
        Ok(out)
    }

    /// Streaming decoder over a whole multi-frame stream, for extraction
    pub fn stream_decoder<'a, R: Read + 'a>(&self, reader: R) -> Result<Box<dyn Read + 'a>> {
        match self {
            Codec::Gzip => Ok(Box::new(flate2::read::MultiGzDecoder::new(reader))),
            Codec::Zstd => {
                let decoder = zstd::stream::read::Decoder::new(reader)
                    .map_err(|e| SarError::InvalidArchive(format!("zstd stream open failed: {}", e)))?;
                Ok(Box::new(decoder))
            }
        }
    }

    /// OCI layer media type for archives compressed with this codec
    pub fn media_type(&self) -> &'static str {
        match self {
            Codec::Gzip => crate::sar::MEDIA_TYPE_LAYER_GZIP,
            Codec::Zstd => crate::sar::MEDIA_TYPE_LAYER_ZSTD,
        }
    }

    /// Codec for a layer media type, used when a descriptor is all we have
    pub fn from_media_type(media_type: &str) -> Option<Codec> {
        if media_type.ends_with("+gzip") || media_type.ends_with(".gzip") {
            Some(Codec::Gzip)
        } else if media_type.ends_with("+zstd") || media_type.ends_with(".zstd") {
            Some(Codec::Zstd)
        } else {
            None
        }
    }
}
