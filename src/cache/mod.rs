//! Content-addressed local blob cache
//!
//! Layout under the configured root:
//!
//! ```text
//! blobs/sha256/<hex>                 raw blob data, mode 0600
//! blobs/sha256/<hex>.partial[.n]     in-flight partial data
//! entries/sha256/<hex>.json          metadata record, mode 0600
//! entries/sha256/<hex>.ranges.json   free-range map of a partial download
//! entries/sha256/<hex>.lock          per-digest writer/reader lock file
//! refs/<sha256-of-reference>.json    reference -> descriptor index
//! ```
//!
//! Writers hold an exclusive lock on the per-digest lock file; readers hold
//! shared locks while a handle is open, so eviction never races an open
//! handle. Every committed invariant lives on disk, so there is no shutdown
//! step.

pub mod entry;
mod handle;
pub mod ranges;
mod stream;

pub use handle::BlobHandle;

use crate::digest::{Digest, Hasher};
use crate::error::{Result, SarError};
use crate::logging::Logger;
use crate::reference::Reference;
use crate::registry::{LayerDescriptor, Registry};
use chrono::Utc;
use entry::CacheEntry;
use fs2::FileExt;
use ranges::RangeSet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const VERIFY_STEP: usize = 128 * 1024;
const LOCK_RETRY: Duration = Duration::from_millis(50);

/// Options for [`BlobCache::prune`]
#[derive(Debug, Clone, Copy, Default)]
pub struct PruneOptions {
    /// Evict entries whose last access is older than this
    pub max_age: Option<Duration>,
    /// Then evict oldest-accessed entries until total bytes fit
    pub max_size: Option<u64>,
}

/// Outcome of a prune pass
#[derive(Debug, Clone, Copy, Default)]
pub struct PruneReport {
    pub removed: usize,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct RefRecord {
    reference: String,
    descriptor: LayerDescriptor,
    validated_at: chrono::DateTime<Utc>,
}

struct CacheConfig {
    root: PathBuf,
    logger: Logger,
    verify_on_read: bool,
    lock_timeout: Duration,
}

/// Multi-process-safe content-addressed blob store
#[derive(Clone)]
pub struct BlobCache {
    config: Arc<CacheConfig>,
}

impl BlobCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let cache = Self {
            config: Arc::new(CacheConfig {
                root: root.into(),
                logger: Logger::new_quiet(),
                verify_on_read: false,
                lock_timeout: Duration::from_secs(30),
            }),
        };
        cache.ensure_dirs()?;
        Ok(cache)
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        let config = Arc::get_mut(&mut self.config).expect("configure before sharing");
        config.logger = logger;
        self
    }

    pub fn with_verify_on_read(mut self, verify: bool) -> Self {
        let config = Arc::get_mut(&mut self.config).expect("configure before sharing");
        config.verify_on_read = verify;
        self
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.config.logger
    }

    pub(crate) fn verify_on_read(&self) -> bool {
        self.config.verify_on_read
    }

    /// Eager open: ensure a complete, verified local copy and return a
    /// random-access handle over it.
    pub async fn open(
        &self,
        registry: &Arc<dyn Registry>,
        reference: &Reference,
        desc: &LayerDescriptor,
        cancel: &CancellationToken,
    ) -> Result<BlobHandle> {
        for _ in 0..2 {
            if let Some(handle) = self.try_open_complete(desc, cancel).await? {
                return Ok(handle);
            }
            // Miss: drive a pass-through stream to completion, then retry.
            let mut stream = self
                .open_stream_through(registry, reference, desc, cancel)
                .await?;
            tokio::io::copy(&mut stream, &mut tokio::io::sink())
                .await
                .map_err(SarError::from)?;
        }
        Err(SarError::Io(format!(
            "cache entry for {} did not become complete",
            desc.digest
        )))
    }

    /// Lazy open: an immediately usable handle that fetches missing byte
    /// ranges on demand and persists them into the partial file.
    pub async fn open_lazy(
        &self,
        registry: &Arc<dyn Registry>,
        reference: &Reference,
        desc: &LayerDescriptor,
        cancel: &CancellationToken,
    ) -> Result<BlobHandle> {
        if let Some(handle) = self.try_open_complete(desc, cancel).await? {
            return Ok(handle);
        }
        handle::open_lazy(
            self.clone(),
            Arc::clone(registry),
            reference.clone(),
            desc.clone(),
            cancel.clone(),
        )
        .await
    }

    /// Streaming miss: a reader that tees the registry download into the
    /// cache while yielding bytes to the caller. Commits the entry complete
    /// and verified when the digest matches at EOF.
    pub async fn open_stream_through(
        &self,
        registry: &Arc<dyn Registry>,
        reference: &Reference,
        desc: &LayerDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>> {
        stream::open_stream_through(
            self.clone(),
            Arc::clone(registry),
            reference.clone(),
            desc.clone(),
            cancel.clone(),
        )
        .await
    }

    /// Cached descriptor for `reference`, honored only within `ttl`
    pub fn lookup_by_ref(
        &self,
        reference: &Reference,
        ttl: Duration,
    ) -> Result<Option<LayerDescriptor>> {
        let path = self.ref_path(reference);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SarError::Io(format!("read ref index failed: {}", e))),
        };
        let record: RefRecord = match serde_json::from_slice(&data) {
            Ok(record) => record,
            Err(e) => {
                self.logger()
                    .debug(&format!("discarding corrupt ref record {}: {}", path.display(), e));
                return Ok(None);
            }
        };
        if record.reference != reference.to_string() {
            return Ok(None);
        }
        let age = Utc::now().signed_duration_since(record.validated_at);
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| SarError::Io(format!("ref TTL out of range: {}", e)))?;
        if age > ttl {
            return Ok(None);
        }
        Ok(Some(record.descriptor))
    }

    /// Record the resolved descriptor for later TTL'd lookups
    pub fn record_ref(&self, reference: &Reference, desc: &LayerDescriptor) -> Result<()> {
        let record = RefRecord {
            reference: reference.to_string(),
            descriptor: desc.clone(),
            validated_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| SarError::Io(format!("ref record encode failed: {}", e)))?;
        let dir = self.config.root.join("refs");
        entry::write_private_atomic(&dir, &self.ref_path(reference), &json)
    }

    /// All metadata records currently in the cache
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        let dir = self.entries_dir();
        let mut out = Vec::new();
        let iter = match std::fs::read_dir(&dir) {
            Ok(iter) => iter,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(SarError::Io(format!("list cache entries failed: {}", e))),
        };
        for item in iter {
            let item = item.map_err(|e| SarError::Io(format!("list cache entries failed: {}", e)))?;
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json")
                || path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(".ranges.json"))
            {
                continue;
            }
            match CacheEntry::load(&path) {
                Ok(Some(entry)) => out.push(entry),
                Ok(None) => {}
                Err(e) => self
                    .logger()
                    .debug(&format!("skipping unreadable cache entry: {}", e)),
            }
        }
        Ok(out)
    }

    /// Remove everything, including the reference index
    pub fn clear(&self) -> Result<()> {
        for sub in ["blobs", "entries", "refs"] {
            let dir = self.config.root.join(sub);
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(SarError::Io(format!(
                        "clear {} failed: {}",
                        dir.display(),
                        e
                    )));
                }
            }
        }
        self.ensure_dirs()
    }

    /// Age-based eviction first, then oldest-accessed until under `max_size`.
    /// Incomplete entries are always eligible; entries with open handles are
    /// skipped because their locks are held.
    pub async fn prune(&self, options: PruneOptions, cancel: &CancellationToken) -> Result<PruneReport> {
        let mut report = PruneReport::default();
        let mut survivors: Vec<(CacheEntry, u64)> = Vec::new();

        for entry in self.entries()? {
            if cancel.is_cancelled() {
                return Err(SarError::Cancelled("prune cancelled".to_string()));
            }
            let usage = self.disk_usage(&entry.digest);
            let expired = options.max_age.is_some_and(|max_age| {
                let age = Utc::now().signed_duration_since(entry.last_accessed);
                age.to_std().map(|age| age > max_age).unwrap_or(false)
            });
            if expired {
                if self.evict(&entry.digest)? {
                    report.removed += 1;
                    report.freed_bytes += usage;
                    continue;
                }
            }
            survivors.push((entry, usage));
        }

        if let Some(max_size) = options.max_size {
            survivors.sort_by_key(|(entry, _)| entry.last_accessed);
            let mut total: u64 = survivors.iter().map(|(_, usage)| usage).sum();
            let mut kept = Vec::new();
            for (entry, usage) in survivors {
                if cancel.is_cancelled() {
                    return Err(SarError::Cancelled("prune cancelled".to_string()));
                }
                if total > max_size && self.evict(&entry.digest)? {
                    report.removed += 1;
                    report.freed_bytes += usage;
                    total -= usage;
                } else {
                    kept.push((entry, usage));
                }
            }
            survivors = kept;
        }

        report.remaining_bytes = survivors.iter().map(|(_, usage)| usage).sum();
        Ok(report)
    }

    // ----- internals shared with the handle and stream modules -----

    pub(crate) fn ensure_dirs(&self) -> Result<()> {
        use std::os::unix::fs::DirBuilderExt;
        for sub in ["blobs/sha256", "entries/sha256", "refs"] {
            let dir = self.config.root.join(sub);
            if dir.is_dir() {
                continue;
            }
            let mut builder = std::fs::DirBuilder::new();
            builder.recursive(true).mode(0o750);
            builder
                .create(&dir)
                .map_err(|e| SarError::Io(format!("mkdir {} failed: {}", dir.display(), e)))?;
        }
        Ok(())
    }

    pub(crate) fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.config
            .root
            .join("blobs")
            .join(digest.algorithm())
            .join(digest.hex())
    }

    pub(crate) fn partial_path(&self, digest: &Digest) -> PathBuf {
        self.config
            .root
            .join("blobs")
            .join(digest.algorithm())
            .join(format!("{}.partial", digest.hex()))
    }

    pub(crate) fn partial_nonce_path(&self, digest: &Digest) -> PathBuf {
        self.config.root.join("blobs").join(digest.algorithm()).join(format!(
            "{}.partial.{}",
            digest.hex(),
            uuid::Uuid::new_v4().simple()
        ))
    }

    pub(crate) fn entry_path(&self, digest: &Digest) -> PathBuf {
        self.entries_dir().join(format!("{}.json", digest.hex()))
    }

    pub(crate) fn ranges_path(&self, digest: &Digest) -> PathBuf {
        self.entries_dir().join(format!("{}.ranges.json", digest.hex()))
    }

    pub(crate) fn lock_path(&self, digest: &Digest) -> PathBuf {
        self.entries_dir().join(format!("{}.lock", digest.hex()))
    }

    fn entries_dir(&self) -> PathBuf {
        self.config.root.join("entries").join("sha256")
    }

    fn ref_path(&self, reference: &Reference) -> PathBuf {
        let key = Digest::from_bytes(reference.to_string().as_bytes());
        self.config.root.join("refs").join(format!("{}.json", key.hex()))
    }

    /// Shared lock for readers; exclusive for the single writer per digest.
    /// Stale locks from dead processes are tolerated: the kernel drops them
    /// with the owner, and acquisition retries until `lock_timeout`.
    pub(crate) async fn acquire_lock(&self, digest: &Digest, exclusive: bool) -> Result<DigestLock> {
        let path = self.lock_path(digest);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| SarError::Io(format!("open lock {} failed: {}", path.display(), e)))?;

        let deadline = std::time::Instant::now() + self.config.lock_timeout;
        loop {
            let locked = if exclusive {
                FileExt::try_lock_exclusive(&file)
            } else {
                FileExt::try_lock_shared(&file)
            };
            match locked {
                Ok(()) => return Ok(DigestLock { file }),
                Err(_) if std::time::Instant::now() < deadline => {
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => {
                    return Err(SarError::Io(format!(
                        "lock {} busy after {:?}: {}",
                        path.display(),
                        self.config.lock_timeout,
                        e
                    )));
                }
            }
        }
    }

    /// Non-blocking exclusive acquisition, for eviction
    fn try_lock_exclusive(&self, digest: &Digest) -> Result<Option<DigestLock>> {
        let path = self.lock_path(digest);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| SarError::Io(format!("open lock {} failed: {}", path.display(), e)))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(DigestLock { file })),
            Err(_) => Ok(None),
        }
    }

    pub(crate) fn load_entry(&self, digest: &Digest) -> Result<Option<CacheEntry>> {
        CacheEntry::load(&self.entry_path(digest))
    }

    pub(crate) fn store_entry(&self, entry: &CacheEntry) -> Result<()> {
        entry.store(&self.entry_path(&entry.digest))
    }

    /// Update `last_accessed`; failures here never break an open.
    pub(crate) fn touch_entry(&self, digest: &Digest) {
        match self.load_entry(digest) {
            Ok(Some(mut entry)) => {
                entry.touch();
                if let Err(e) = self.store_entry(&entry) {
                    self.logger()
                        .debug(&format!("cache access-time update failed: {}", e));
                }
            }
            Ok(None) => {}
            Err(e) => self
                .logger()
                .debug(&format!("cache access-time update failed: {}", e)),
        }
    }

    pub(crate) fn load_ranges(&self, digest: &Digest) -> Result<Option<RangeSet>> {
        let path = self.ranges_path(digest);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SarError::Io(format!("read range map failed: {}", e))),
        };
        match serde_json::from_slice(&data) {
            Ok(set) => Ok(Some(set)),
            Err(e) => {
                self.logger()
                    .debug(&format!("discarding corrupt range map {}: {}", path.display(), e));
                Ok(None)
            }
        }
    }

    pub(crate) fn store_ranges(&self, digest: &Digest, ranges: &RangeSet) -> Result<()> {
        let json = serde_json::to_vec(ranges)
            .map_err(|e| SarError::Io(format!("range map encode failed: {}", e)))?;
        entry::write_private_atomic(&self.entries_dir(), &self.ranges_path(digest), &json)
    }

    pub(crate) fn remove_ranges(&self, digest: &Digest) {
        let _ = std::fs::remove_file(self.ranges_path(digest));
    }

    /// Full-file hash check against the key digest
    pub(crate) fn verify_file(
        &self,
        path: &Path,
        digest: &Digest,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        use std::io::Read;
        let mut file = std::fs::File::open(path)
            .map_err(|e| SarError::Io(format!("open {} failed: {}", path.display(), e)))?;
        let mut hasher = Hasher::new();
        let mut buf = vec![0u8; VERIFY_STEP];
        loop {
            if cancel.is_cancelled() {
                return Err(SarError::Cancelled("verification cancelled".to_string()));
            }
            let n = file
                .read(&mut buf)
                .map_err(|e| SarError::Io(format!("read {} failed: {}", path.display(), e)))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(&hasher.finish() == digest)
    }

    /// Open a complete, verified blob as an eager handle; `None` on miss.
    async fn try_open_complete(
        &self,
        desc: &LayerDescriptor,
        cancel: &CancellationToken,
    ) -> Result<Option<BlobHandle>> {
        self.ensure_dirs()?;
        let Some(mut entry) = self.load_entry(&desc.digest)? else {
            return Ok(None);
        };
        if !entry.complete {
            return Ok(None);
        }
        let lock = self.acquire_lock(&desc.digest, false).await?;
        let blob_path = self.blob_path(&desc.digest);

        let needs_check = !entry.verified || self.verify_on_read();
        if needs_check {
            if !self.verify_file(&blob_path, &desc.digest, cancel)? {
                // Invariant broken on disk; scrub and treat as a miss.
                drop(lock);
                self.logger().warning(&format!(
                    "cached blob {} failed verification, evicting",
                    desc.digest.short()
                ));
                self.evict(&desc.digest)?;
                return Ok(None);
            }
            if !entry.verified {
                entry.verified = true;
                self.store_entry(&entry)?;
            }
        }
        self.touch_entry(&desc.digest);
        handle::open_eager(blob_path, desc.size, lock).map(Some)
    }

    fn disk_usage(&self, digest: &Digest) -> u64 {
        let mut total = 0;
        for path in [self.blob_path(digest), self.partial_path(digest)] {
            if let Ok(meta) = std::fs::metadata(&path) {
                total += meta.len();
            }
        }
        total
    }

    /// Remove data and metadata for one digest; false when a live handle
    /// holds the lock.
    fn evict(&self, digest: &Digest) -> Result<bool> {
        let Some(lock) = self.try_lock_exclusive(digest)? else {
            self.logger()
                .debug(&format!("skipping eviction of busy blob {}", digest.short()));
            return Ok(false);
        };
        for path in [
            self.blob_path(digest),
            self.partial_path(digest),
            self.ranges_path(digest),
            self.entry_path(digest),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    self.logger()
                        .debug(&format!("evict {} failed: {}", path.display(), e));
                }
            }
        }
        drop(lock);
        Ok(true)
    }
}

/// Held lock on a per-digest lock file; released on drop
pub(crate) struct DigestLock {
    file: std::fs::File,
}

impl Drop for DigestLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}
