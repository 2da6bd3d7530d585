//! Index-first reads over a random-access blob
//!
//! The reader parses the footer and TOC up front, then serves per-file
//! sequential readers by decompressing only the chunk frames covering the
//! requested entry. The blob itself is abstracted behind [`BlobSource`] so
//! the same reader works over a local file, an in-memory buffer or a cache
//! handle that fetches byte ranges on demand.

use crate::compress::Codec;
use crate::digest::Digest;
use crate::error::{Result, SarError};
use crate::sar::toc::{Chunk, Toc, TocEntry};
use crate::sar::{FOOTER_BYTES, Footer, TOC_ENTRY_NAME};
use async_trait::async_trait;
use std::io::Read;

/// Random-access byte source of known size
#[async_trait]
pub trait BlobSource: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; returns the count read
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Total size of the blob
    fn size(&self) -> u64;
}

#[async_trait]
impl BlobSource for Box<dyn BlobSource> {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        (**self).read_at(offset, buf).await
    }

    fn size(&self) -> u64 {
        (**self).size()
    }
}

/// A plain local file as a blob source
pub struct FileSource {
    file: std::fs::File,
    size: u64,
}

impl FileSource {
    pub fn new(file: std::fs::File) -> Result<Self> {
        let size = file
            .metadata()
            .map_err(|e| SarError::Io(format!("stat blob file failed: {}", e)))?
            .len();
        Ok(Self { file, size })
    }
}

#[async_trait]
impl BlobSource for FileSource {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file
            .read_at(buf, offset)
            .map_err(|e| SarError::Io(format!("blob read at {} failed: {}", offset, e)))
    }

    fn size(&self) -> u64 {
        self.size
    }
}

/// In-memory blob source, used by tests
#[async_trait]
impl BlobSource for Vec<u8> {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let len = self.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let available = (len - offset) as usize;
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&self[offset as usize..offset as usize + n]);
        Ok(n)
    }

    fn size(&self) -> u64 {
        self.len() as u64
    }
}

/// Parsed archive over a random-access source
pub struct SarReader<S: BlobSource> {
    source: S,
    codec: Codec,
    footer: Footer,
    toc: Toc,
}

impl<S: BlobSource> std::fmt::Debug for SarReader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SarReader")
            .field("codec", &self.codec)
            .field("footer", &self.footer)
            .field("toc", &self.toc)
            .finish()
    }
}

impl<S: BlobSource> SarReader<S> {
    /// Parse footer and TOC; verifies the TOC digest recorded in the footer.
    pub async fn open(source: S) -> Result<Self> {
        let size = source.size();
        if size < (FOOTER_BYTES + 4) as u64 {
            return Err(SarError::InvalidArchive(format!(
                "blob too small for a seekable archive: {} bytes",
                size
            )));
        }

        let mut footer_bytes = vec![0u8; FOOTER_BYTES];
        read_exact_at(&source, size - FOOTER_BYTES as u64, &mut footer_bytes).await?;
        let footer = Footer::decode(&footer_bytes)?;

        let mut magic = [0u8; 4];
        read_exact_at(&source, 0, &mut magic).await?;
        let codec = Codec::detect(&magic)?;

        footer
            .toc_offset
            .checked_add(footer.toc_size)
            .filter(|end| *end <= size - FOOTER_BYTES as u64)
            .ok_or_else(|| {
                SarError::InvalidArchive("footer TOC location out of bounds".to_string())
            })?;

        let mut toc_frame = vec![0u8; footer.toc_size as usize];
        read_exact_at(&source, footer.toc_offset, &mut toc_frame).await?;
        let toc_tar = codec.decompress_frame(&toc_frame)?;

        let mut archive = tar::Archive::new(&toc_tar[..]);
        let mut entries = archive
            .entries()
            .map_err(|e| SarError::InvalidArchive(format!("TOC frame not a tar stream: {}", e)))?;
        let mut toc_entry = entries
            .next()
            .ok_or_else(|| SarError::InvalidArchive("TOC frame is empty".to_string()))?
            .map_err(|e| SarError::InvalidArchive(format!("TOC entry unreadable: {}", e)))?;
        let name = toc_entry
            .path()
            .map_err(|e| SarError::InvalidArchive(format!("TOC entry path unreadable: {}", e)))?;
        if name.to_str() != Some(TOC_ENTRY_NAME) {
            return Err(SarError::InvalidArchive(format!(
                "TOC frame holds {:?}, expected {}",
                name, TOC_ENTRY_NAME
            )));
        }
        let mut toc_json = Vec::new();
        toc_entry
            .read_to_end(&mut toc_json)
            .map_err(|e| SarError::InvalidArchive(format!("TOC document unreadable: {}", e)))?;

        let actual = Digest::from_bytes(&toc_json);
        if actual != footer.toc_digest {
            return Err(SarError::InvalidArchive(format!(
                "TOC digest mismatch: footer says {}, document is {}",
                footer.toc_digest, actual
            )));
        }

        let toc = Toc::from_json(&toc_json)?;
        Ok(Self {
            source,
            codec,
            footer,
            toc,
        })
    }

    pub fn toc(&self) -> &Toc {
        &self.toc
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Open a sequential reader over one regular file. Multiple concurrent
    /// readers over the same archive are fine; nothing is mutated after
    /// `open` finishes.
    pub fn open_file(&self, name: &str) -> Result<EntryReader<'_, S>> {
        let entry = self
            .toc
            .lookup(name)
            .ok_or_else(|| SarError::NotFound(format!("no such entry in archive: {}", name)))?;
        self.open_entry(entry)
    }

    pub fn open_entry(&self, entry: &TocEntry) -> Result<EntryReader<'_, S>> {
        if !entry.is_regular() {
            return Err(SarError::InvalidArchive(format!(
                "{} is not a regular file",
                entry.name
            )));
        }
        Ok(EntryReader {
            reader: self,
            chunks: entry.chunks.clone().unwrap_or_default(),
            next_chunk: 0,
            buffer: Vec::new(),
            buffer_pos: 0,
        })
    }
}

/// Sequential reader over one file, backed by chunk-level random access
pub struct EntryReader<'a, S: BlobSource> {
    reader: &'a SarReader<S>,
    chunks: Vec<Chunk>,
    next_chunk: usize,
    buffer: Vec<u8>,
    buffer_pos: usize,
}

impl<S: BlobSource> std::fmt::Debug for EntryReader<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryReader")
            .field("reader", &self.reader)
            .field("chunks", &self.chunks)
            .field("next_chunk", &self.next_chunk)
            .field("buffer_pos", &self.buffer_pos)
            .finish()
    }
}

impl<S: BlobSource> EntryReader<'_, S> {
    /// Read into `buf`, fetching and decompressing chunk frames on demand
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.buffer_pos >= self.buffer.len() {
            if !self.load_next_chunk().await? {
                return Ok(0);
            }
        }
        let available = self.buffer.len() - self.buffer_pos;
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + n]);
        self.buffer_pos += n;
        Ok(n)
    }

    /// Drain the remaining bytes
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }

    async fn load_next_chunk(&mut self) -> Result<bool> {
        let Some(chunk) = self.chunks.get(self.next_chunk).cloned() else {
            return Ok(false);
        };
        self.next_chunk += 1;

        // The TOC records where a chunk's frame starts but not its compressed
        // size; read a window generous enough for worst-case expansion plus
        // tar padding. Decoders stop at the frame boundary, so overlapping
        // the next frame is harmless.
        let blob_size = self.reader.source.size();
        let remaining = blob_size.saturating_sub(chunk.compressed_offset);
        let bound = chunk.size + chunk.size / 8 + 2048;
        let window_len = bound.min(remaining) as usize;

        let mut window = vec![0u8; window_len];
        let n = read_up_to(&self.reader.source, chunk.compressed_offset, &mut window).await?;
        window.truncate(n);

        let mut decompressed = self.reader.codec.decompress_frame(&window)?;
        if (decompressed.len() as u64) < chunk.size {
            return Err(SarError::InvalidArchive(format!(
                "chunk frame at {} decompressed to {} bytes, expected at least {}",
                chunk.compressed_offset,
                decompressed.len(),
                chunk.size
            )));
        }
        decompressed.truncate(chunk.size as usize);
        self.buffer = decompressed;
        self.buffer_pos = 0;
        Ok(true)
    }
}

async fn read_exact_at<S: BlobSource>(source: &S, offset: u64, buf: &mut [u8]) -> Result<()> {
    let n = read_up_to(source, offset, buf).await?;
    if n != buf.len() {
        return Err(SarError::InvalidArchive(format!(
            "unexpected end of blob at offset {}: wanted {} bytes, got {}",
            offset,
            buf.len(),
            n
        )));
    }
    Ok(())
}

async fn read_up_to<S: BlobSource>(source: &S, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read_at(offset + filled as u64, &mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sar::builder::{BuildOptions, SarBuilder};
    use crate::vfs::MemFs;
    use tokio_util::sync::CancellationToken;

    fn sample_fs() -> MemFs {
        let mut fs = MemFs::new();
        fs.add_file("hello.txt", b"Hello, World!".to_vec(), 0o644)
            .add_dir("subdir", 0o755)
            .add_file("subdir/nested.txt", b"Nested".to_vec(), 0o644)
            .add_symlink("link", "hello.txt");
        fs
    }

    async fn build_blob(fs: &MemFs, codec: Codec) -> Vec<u8> {
        let builder = SarBuilder::new(BuildOptions {
            codec,
            ..Default::default()
        });
        let mut result = builder.build(fs, &CancellationToken::new()).unwrap();
        let mut bytes = Vec::new();
        result.blob.read_to_end(&mut bytes).unwrap();
        bytes
    }

    #[tokio::test]
    async fn test_open_and_list() {
        for codec in [Codec::Gzip, Codec::Zstd] {
            let blob = build_blob(&sample_fs(), codec).await;
            let reader = SarReader::open(blob).await.unwrap();
            assert_eq!(reader.codec(), codec);
            let names: Vec<&str> = reader
                .toc()
                .sorted_entries()
                .iter()
                .map(|e| e.name.as_str())
                .collect();
            assert_eq!(names, vec!["hello.txt", "link", "subdir", "subdir/nested.txt"]);
        }
    }

    #[tokio::test]
    async fn test_selective_open() {
        let blob = build_blob(&sample_fs(), Codec::Gzip).await;
        let reader = SarReader::open(blob).await.unwrap();
        let mut file = reader.open_file("subdir/nested.txt").unwrap();
        assert_eq!(file.read_to_end().await.unwrap(), b"Nested");
        let mut hello = reader.open_file("hello.txt").unwrap();
        assert_eq!(hello.read_to_end().await.unwrap(), b"Hello, World!");
    }

    #[tokio::test]
    async fn test_open_missing_and_non_regular() {
        let blob = build_blob(&sample_fs(), Codec::Gzip).await;
        let reader = SarReader::open(blob).await.unwrap();
        assert!(matches!(
            reader.open_file("nope").unwrap_err(),
            SarError::NotFound(_)
        ));
        assert!(reader.open_file("subdir").is_err());
    }

    #[tokio::test]
    async fn test_chunked_file_reads_back_exactly() {
        let mut fs = MemFs::new();
        let big: Vec<u8> = (0..777_777u32).map(|i| (i % 241) as u8).collect();
        fs.add_file("big.bin", big.clone(), 0o644);
        let builder = SarBuilder::new(BuildOptions {
            codec: Codec::Zstd,
            chunk_size: 64 * 1024,
        });
        let mut result = builder.build(&fs, &CancellationToken::new()).unwrap();
        let mut blob = Vec::new();
        result.blob.read_to_end(&mut blob).unwrap();

        let reader = SarReader::open(blob).await.unwrap();
        let entry = reader.toc().lookup("big.bin").unwrap();
        assert!(entry.chunks.as_ref().unwrap().len() > 1);
        let mut file = reader.open_entry(entry).unwrap();
        assert_eq!(file.read_to_end().await.unwrap(), big);
    }

    #[tokio::test]
    async fn test_corrupt_footer_digest_rejected() {
        let mut blob = build_blob(&sample_fs(), Codec::Gzip).await;
        // Flip one hex char of the footer digest field.
        let off = blob.len() - 1;
        blob[off] = if blob[off] == b'0' { b'1' } else { b'0' };
        assert!(matches!(
            SarReader::open(blob).await.unwrap_err(),
            SarError::InvalidArchive(_)
        ));
    }

    #[tokio::test]
    async fn test_truncated_blob_rejected() {
        let blob = build_blob(&sample_fs(), Codec::Gzip).await;
        let truncated = blob[..FOOTER_BYTES / 2].to_vec();
        assert!(SarReader::open(truncated).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_file_entry() {
        let mut fs = MemFs::new();
        fs.add_file("empty", Vec::new(), 0o644);
        let blob = build_blob(&fs, Codec::Gzip).await;
        let reader = SarReader::open(blob).await.unwrap();
        let mut file = reader.open_file("empty").unwrap();
        assert!(file.read_to_end().await.unwrap().is_empty());
    }
}
