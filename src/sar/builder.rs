//! Streaming construction of seekable archives
//!
//! The builder walks a virtual filesystem, emits a tar stream cut into
//! per-header and per-chunk compressed frames, appends the TOC frame and the
//! footer, and computes the blob digest and the uncompressed (diff-id) digest
//! in the same pass. Output is buffered to an anonymous temp file so the
//! caller knows `blob_size` and `blob_digest` before any upload starts; the
//! file disappears when the last handle closes.

use crate::compress::Codec;
use crate::digest::{Digest, Hasher};
use crate::error::{Result, SarError};
use crate::sar::toc::{Chunk, EntryKind, Toc, TocEntry};
use crate::sar::{DEFAULT_CHUNK_SIZE, FORMAT_VERSION, Footer, TOC_ENTRY_NAME};
use crate::vfs::{FileSystem, VfsEntry};
use std::io::{Read, Seek, SeekFrom, Write};
use tokio_util::sync::CancellationToken;

const COPY_STEP: usize = 128 * 1024;
const TAR_BLOCK: usize = 512;

/// Everything a push needs, available before the upload begins
#[derive(Debug)]
pub struct BuildResult {
    /// Compressed blob bytes, rewound to the start
    pub blob: std::fs::File,
    pub toc_digest: Digest,
    pub uncompressed_digest: Digest,
    pub blob_digest: Digest,
    pub blob_size: u64,
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub codec: Codec,
    pub chunk_size: u64,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            codec: Codec::Gzip,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Builds one seekable archive per call
pub struct SarBuilder {
    options: BuildOptions,
}

impl SarBuilder {
    pub fn new(options: BuildOptions) -> Self {
        Self { options }
    }

    /// Build an archive from `source`, checking `cancel` between entries and
    /// at every 128 KiB of file content.
    pub fn build(&self, source: &dyn FileSystem, cancel: &CancellationToken) -> Result<BuildResult> {
        let file = tempfile::tempfile()
            .map_err(|e| SarError::Io(format!("cannot create build buffer: {}", e)))?;
        let mut out = FrameSink {
            file,
            blob_hasher: Hasher::new(),
            tar_hasher: Hasher::new(),
            codec: self.options.codec,
            compressed_len: 0,
            tar_len: 0,
        };

        let mut toc_entries: Vec<TocEntry> = Vec::new();
        for entry in source.walk()? {
            if cancel.is_cancelled() {
                return Err(SarError::Cancelled("archive build cancelled".to_string()));
            }
            toc_entries.push(self.append_entry(source, &entry, cancel, &mut out)?);
        }

        // TOC frame: a regular tar entry holding the TOC document, followed
        // by the end-of-archive blocks, all in one frame.
        let toc = Toc::new(toc_entries);
        let toc_json = toc.to_json()?;
        let toc_digest = Digest::from_bytes(&toc_json);
        let mut toc_frame = Vec::with_capacity(TAR_BLOCK + toc_json.len() + 2 * TAR_BLOCK);
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Regular);
        header
            .set_path(TOC_ENTRY_NAME)
            .map_err(|e| SarError::Io(format!("TOC header path failed: {}", e)))?;
        header.set_size(toc_json.len() as u64);
        header.set_mode(0o444);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header.set_cksum();
        toc_frame.extend_from_slice(header.as_bytes());
        toc_frame.extend_from_slice(&toc_json);
        toc_frame.resize(next_block(toc_frame.len()), 0);
        toc_frame.resize(toc_frame.len() + 2 * TAR_BLOCK, 0);

        let toc_offset = out.compressed_len;
        out.emit_frame(&toc_frame)?;
        let toc_size = out.compressed_len - toc_offset;

        let footer = Footer {
            version: FORMAT_VERSION,
            toc_offset,
            toc_size,
            toc_digest: toc_digest.clone(),
        };
        out.write_raw(&footer.encode())?;

        let FrameSink {
            mut file,
            blob_hasher,
            tar_hasher,
            compressed_len,
            ..
        } = out;
        file.flush()
            .map_err(|e| SarError::Io(format!("flush build buffer failed: {}", e)))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| SarError::Io(format!("rewind build buffer failed: {}", e)))?;

        Ok(BuildResult {
            blob: file,
            toc_digest,
            uncompressed_digest: tar_hasher.finish(),
            blob_digest: blob_hasher.finish(),
            blob_size: compressed_len,
        })
    }

    fn append_entry(
        &self,
        source: &dyn FileSystem,
        entry: &VfsEntry,
        cancel: &CancellationToken,
        out: &mut FrameSink,
    ) -> Result<TocEntry> {
        let mut header = tar::Header::new_ustar();
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header.set_mode(entry.mode & 0o7777);

        let mut link_target = None;
        match entry.kind {
            EntryKind::Regular => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(entry.size);
                header
                    .set_path(&entry.path)
                    .map_err(|e| SarError::InvalidSource(format!("path {}: {}", entry.path, e)))?;
            }
            EntryKind::Directory => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                header
                    .set_path(format!("{}/", entry.path))
                    .map_err(|e| SarError::InvalidSource(format!("path {}: {}", entry.path, e)))?;
            }
            EntryKind::Symlink => {
                let target = entry.link_target.as_deref().ok_or_else(|| {
                    SarError::InvalidSource(format!(
                        "symlink {} has no target; source lacks readlink",
                        entry.path
                    ))
                })?;
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                header
                    .set_path(&entry.path)
                    .map_err(|e| SarError::InvalidSource(format!("path {}: {}", entry.path, e)))?;
                header
                    .set_link_name(target)
                    .map_err(|e| {
                        SarError::InvalidSource(format!("link target {}: {}", target, e))
                    })?;
                link_target = Some(target.to_string());
            }
            EntryKind::Hardlink => {
                return Err(SarError::InvalidSource(format!(
                    "hardlink not supported on input: {}",
                    entry.path
                )));
            }
            EntryKind::CharDevice | EntryKind::BlockDevice | EntryKind::Fifo => {
                return Err(SarError::InvalidSource(format!(
                    "special file not supported on input: {}",
                    entry.path
                )));
            }
        }
        header.set_cksum();

        let content_offset = out.tar_len + TAR_BLOCK as u64;
        out.emit_frame(header.as_bytes())?;

        let mut toc_entry = TocEntry {
            name: entry.path.clone(),
            kind: entry.kind,
            size: entry.size,
            mode: entry.mode,
            offset: 0,
            linkname: link_target,
            chunks: None,
        };

        if entry.kind == EntryKind::Regular && entry.size > 0 {
            toc_entry.offset = content_offset;
            toc_entry.chunks = Some(self.append_file_content(source, entry, cancel, out)?);
        }
        Ok(toc_entry)
    }

    /// Stream one file's content as chunk frames; the final frame carries the
    /// tar padding to the next 512-byte boundary.
    fn append_file_content(
        &self,
        source: &dyn FileSystem,
        entry: &VfsEntry,
        cancel: &CancellationToken,
        out: &mut FrameSink,
    ) -> Result<Vec<Chunk>> {
        let mut reader = source.open(&entry.path)?;
        let mut chunks = Vec::new();
        let mut file_pos: u64 = 0;

        while file_pos < entry.size {
            let want = (entry.size - file_pos).min(self.options.chunk_size) as usize;
            let mut buf = vec![0u8; want];
            let mut filled = 0;
            while filled < want {
                if cancel.is_cancelled() {
                    return Err(SarError::Cancelled("archive build cancelled".to_string()));
                }
                let step = (want - filled).min(COPY_STEP);
                let n = reader
                    .read(&mut buf[filled..filled + step])
                    .map_err(|e| SarError::Io(format!("read {} failed: {}", entry.path, e)))?;
                if n == 0 {
                    return Err(SarError::InvalidSource(format!(
                        "{} truncated during build: got {} of {} bytes",
                        entry.path,
                        file_pos + filled as u64,
                        entry.size
                    )));
                }
                filled += n;
            }

            let chunk = Chunk {
                uncompressed_offset: file_pos,
                compressed_offset: out.compressed_len,
                size: want as u64,
            };
            file_pos += want as u64;

            if file_pos == entry.size {
                let padded = next_block(buf.len());
                buf.resize(padded, 0);
            }
            out.emit_frame(&buf)?;
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}

/// Compressing sink that tracks both digests and both offsets
struct FrameSink {
    file: std::fs::File,
    blob_hasher: Hasher,
    tar_hasher: Hasher,
    codec: Codec,
    compressed_len: u64,
    tar_len: u64,
}

impl FrameSink {
    /// Compress `tar_bytes` as one independent frame and append it
    fn emit_frame(&mut self, tar_bytes: &[u8]) -> Result<()> {
        let frame = self.codec.compress_frame(tar_bytes)?;
        self.tar_hasher.update(tar_bytes);
        self.tar_len += tar_bytes.len() as u64;
        self.write_raw(&frame)
    }

    /// Append raw, uncompressed bytes (the footer)
    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.file
            .write_all(bytes)
            .map_err(|e| SarError::Io(format!("write build buffer failed: {}", e)))?;
        self.blob_hasher.update(bytes);
        self.compressed_len += bytes.len() as u64;
        Ok(())
    }
}

fn next_block(len: usize) -> usize {
    len.div_ceil(TAR_BLOCK) * TAR_BLOCK
}
