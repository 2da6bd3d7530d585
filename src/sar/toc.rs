//! Table-of-contents document embedded in every archive
//!
//! The TOC is serialized as JSON into the penultimate compressed frame of the
//! blob. Entries appear in archive order; regular-file offsets are strictly
//! increasing and chunk lists cover `[0, size)` contiguously. The
//! serialization round-trips exactly, so the digest recorded in the footer can
//! be recomputed from the decoded document.

use crate::error::{Result, SarError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Entry kinds stored in the TOC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Hardlink,
    #[serde(rename = "chardev")]
    CharDevice,
    #[serde(rename = "blockdev")]
    BlockDevice,
    Fifo,
}

/// A sub-file chunk enabling random access within one regular file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Offset of this chunk within the file, in uncompressed bytes
    pub uncompressed_offset: u64,
    /// Offset of the frame holding this chunk within the compressed blob
    pub compressed_offset: u64,
    /// Uncompressed length of the chunk
    pub size: u64,
}

/// One table-of-contents entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    /// Relative POSIX-style path
    pub name: String,
    pub kind: EntryKind,
    /// Logical size in bytes; zero for non-files
    #[serde(default)]
    pub size: u64,
    /// Permission and type bits
    pub mode: u32,
    /// Byte offset of the file content within the uncompressed tar stream
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: u64,
    /// Target path, for symlinks and hardlinks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linkname: Option<String>,
    /// Chunk list for regular files; covers `[0, size)` when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<Chunk>>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl TocEntry {
    pub fn is_regular(&self) -> bool {
        self.kind == EntryKind::Regular
    }
}

/// The decoded table of contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toc {
    pub version: u32,
    pub entries: Vec<TocEntry>,
}

impl Toc {
    pub fn new(entries: Vec<TocEntry>) -> Self {
        Self {
            version: crate::sar::TOC_VERSION,
            entries,
        }
    }

    /// Serialize to the canonical JSON document the footer digest covers
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| SarError::InvalidArchive(format!("TOC encode failed: {}", e)))
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        let toc: Toc = serde_json::from_slice(data)
            .map_err(|e| SarError::InvalidArchive(format!("TOC decode failed: {}", e)))?;
        toc.check_invariants()?;
        Ok(toc)
    }

    /// Look up an entry by exact name
    pub fn lookup(&self, name: &str) -> Option<&TocEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Entries in stable sorted path order, for listing and walking
    pub fn sorted_entries(&self) -> Vec<&TocEntry> {
        let mut out: Vec<&TocEntry> = self.entries.iter().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Structural invariants: increasing file offsets, contiguous chunk
    /// coverage, no duplicate names.
    fn check_invariants(&self) -> Result<()> {
        let mut last_offset = 0u64;
        let mut seen: HashMap<&str, ()> = HashMap::with_capacity(self.entries.len());
        for entry in &self.entries {
            if seen.insert(entry.name.as_str(), ()).is_some() {
                return Err(SarError::InvalidArchive(format!(
                    "duplicate TOC entry: {}",
                    entry.name
                )));
            }
            if entry.is_regular() && entry.size > 0 {
                if entry.offset <= last_offset {
                    return Err(SarError::InvalidArchive(format!(
                        "TOC offsets not increasing at {}",
                        entry.name
                    )));
                }
                last_offset = entry.offset;
                let chunks = entry.chunks.as_deref().ok_or_else(|| {
                    SarError::InvalidArchive(format!("regular entry {} missing chunks", entry.name))
                })?;
                let mut expect = 0u64;
                for chunk in chunks {
                    if chunk.uncompressed_offset != expect {
                        return Err(SarError::InvalidArchive(format!(
                            "chunk gap in {} at offset {}",
                            entry.name, expect
                        )));
                    }
                    expect = expect
                        .checked_add(chunk.size)
                        .ok_or_else(|| {
                            SarError::InvalidArchive(format!("chunk overflow in {}", entry.name))
                        })?;
                }
                if expect != entry.size {
                    return Err(SarError::InvalidArchive(format!(
                        "chunks of {} cover {} of {} bytes",
                        entry.name, expect, entry.size
                    )));
                }
            }
        }
        Ok(())
    }
}
