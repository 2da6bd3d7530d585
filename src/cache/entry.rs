//! Persisted cache entry metadata
//!
//! One JSON record per cached blob, stored at `entries/<algo>/<hex>.json`
//! next to the data file. Timestamps are RFC-3339 with nanoseconds. Writes go
//! through a temp file and rename so a crashed process never leaves a torn
//! record.

use crate::digest::Digest;
use crate::error::{Result, SarError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub version: u32,
    pub digest: Digest,
    /// Declared blob size from the descriptor
    pub size: u64,
    pub media_type: String,
    /// All bytes present on disk
    pub complete: bool,
    /// Full-file digest checked against the key
    pub verified: bool,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(digest: Digest, size: u64, media_type: String) -> Self {
        let now = Utc::now();
        Self {
            version: ENTRY_VERSION,
            digest,
            size,
            media_type,
            complete: false,
            verified: false,
            created_at: now,
            last_accessed: now,
        }
    }

    pub fn load(path: &Path) -> Result<Option<CacheEntry>> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SarError::Io(format!(
                    "read cache entry {} failed: {}",
                    path.display(),
                    e
                )));
            }
        };
        let entry: CacheEntry = serde_json::from_slice(&data).map_err(|e| {
            SarError::Io(format!("cache entry {} corrupt: {}", path.display(), e))
        })?;
        if entry.version != ENTRY_VERSION {
            return Err(SarError::Io(format!(
                "cache entry {} has unsupported version {}",
                path.display(),
                entry.version
            )));
        }
        Ok(Some(entry))
    }

    /// Atomic write: temp file in the same directory, chmod 0600, rename.
    pub fn store(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| SarError::Io(format!("entry path {} has no parent", path.display())))?;
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| SarError::Io(format!("cache entry encode failed: {}", e)))?;
        write_private_atomic(dir, path, &json)
    }

    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }
}

/// Write `data` to `path` via temp-file rename with mode 0600
pub fn write_private_atomic(dir: &Path, path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| SarError::Io(format!("temp file in {} failed: {}", dir.display(), e)))?;
    tmp.write_all(data)
        .map_err(|e| SarError::Io(format!("write {} failed: {}", path.display(), e)))?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o600))
        .map_err(|e| SarError::Io(format!("chmod {} failed: {}", path.display(), e)))?;
    tmp.persist(path)
        .map_err(|e| SarError::Io(format!("persist {} failed: {}", path.display(), e)))?;
    Ok(())
}
