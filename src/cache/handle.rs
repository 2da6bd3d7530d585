//! Random-access handles over cached blobs
//!
//! Eager handles wrap a complete local file. Lazy handles serve reads from
//! whatever bytes are present and fetch the missing ranges from the registry
//! on demand, persisting both the bytes and the free-range map so another
//! process (or a later run) can pick up where this one stopped.

use crate::cache::{BlobCache, DigestLock};
use crate::error::{Result, SarError};
use crate::reference::Reference;
use crate::registry::{LayerDescriptor, Registry};
use crate::sar::reader::BlobSource;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const FETCH_STEP: usize = 128 * 1024;

/// Random-access view of a cached blob
pub struct BlobHandle {
    inner: HandleInner,
}

enum HandleInner {
    Eager(EagerHandle),
    Lazy(LazyHandle),
}

struct EagerHandle {
    file: std::fs::File,
    size: u64,
    _lock: DigestLock,
}

struct LazyHandle {
    cache: BlobCache,
    registry: Arc<dyn Registry>,
    reference: Reference,
    desc: LayerDescriptor,
    file: std::fs::File,
    state: Mutex<LazyState>,
    complete: AtomicBool,
    cancel: CancellationToken,
    _lock: DigestLock,
}

struct LazyState {
    /// Byte ranges still missing from the partial file
    free: crate::cache::ranges::RangeSet,
}

impl BlobHandle {
    pub fn size(&self) -> u64 {
        match &self.inner {
            HandleInner::Eager(h) => h.size,
            HandleInner::Lazy(h) => h.desc.size,
        }
    }

    /// All bytes present locally
    pub fn complete(&self) -> bool {
        match &self.inner {
            HandleInner::Eager(_) => true,
            HandleInner::Lazy(h) => h.complete.load(Ordering::Acquire),
        }
    }
}

#[async_trait]
impl BlobSource for BlobHandle {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match &self.inner {
            HandleInner::Eager(h) => {
                use std::os::unix::fs::FileExt;
                h.file
                    .read_at(buf, offset)
                    .map_err(|e| SarError::Io(format!("cache read at {} failed: {}", offset, e)))
            }
            HandleInner::Lazy(h) => h.read_at(offset, buf).await,
        }
    }

    fn size(&self) -> u64 {
        BlobHandle::size(self)
    }
}

pub(crate) fn open_eager(path: PathBuf, size: u64, lock: DigestLock) -> Result<BlobHandle> {
    let file = std::fs::File::open(&path)
        .map_err(|e| SarError::Io(format!("open cached blob {} failed: {}", path.display(), e)))?;
    Ok(BlobHandle {
        inner: HandleInner::Eager(EagerHandle {
            file,
            size,
            _lock: lock,
        }),
    })
}

pub(crate) async fn open_lazy(
    cache: BlobCache,
    registry: Arc<dyn Registry>,
    reference: Reference,
    desc: LayerDescriptor,
    cancel: CancellationToken,
) -> Result<BlobHandle> {
    use std::os::unix::fs::OpenOptionsExt;

    cache.ensure_dirs()?;
    let lock = cache.acquire_lock(&desc.digest, true).await?;
    let partial = cache.partial_path(&desc.digest);

    // Adopt a previous partial download when its range map is intact,
    // otherwise start from an empty sparse file.
    let free = match (partial.is_file(), cache.load_ranges(&desc.digest)?) {
        (true, Some(free)) => free,
        _ => crate::cache::ranges::RangeSet::full(desc.size),
    };

    let file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .mode(0o600)
        .open(&partial)
        .map_err(|e| SarError::Io(format!("open partial {} failed: {}", partial.display(), e)))?;
    file.set_len(desc.size)
        .map_err(|e| SarError::Io(format!("size partial {} failed: {}", partial.display(), e)))?;
    cache.store_ranges(&desc.digest, &free)?;

    let mut entry = cache
        .load_entry(&desc.digest)?
        .unwrap_or_else(|| {
            crate::cache::entry::CacheEntry::new(
                desc.digest.clone(),
                desc.size,
                desc.media_type.clone(),
            )
        });
    entry.touch();
    cache.store_entry(&entry)?;

    Ok(BlobHandle {
        inner: HandleInner::Lazy(LazyHandle {
            cache,
            registry,
            reference,
            desc,
            file,
            state: Mutex::new(LazyState { free }),
            complete: AtomicBool::new(false),
            cancel,
            _lock: lock,
        }),
    })
}

impl LazyHandle {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let size = self.desc.size;
        if offset >= size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(size - offset);

        if !self.complete.load(Ordering::Acquire) {
            let mut state = self.state.lock().await;
            let missing = state.free.overlapping(offset, len);
            if !missing.is_empty() {
                self.fill_ranges(&mut state, &missing).await?;
                self.cache.store_ranges(&self.desc.digest, &state.free)?;
            }
            if state.free.is_empty() {
                self.finalize(&mut state).await?;
            }
        }

        use std::os::unix::fs::FileExt;
        self.file
            .read_at(&mut buf[..len as usize], offset)
            .map_err(|e| SarError::Io(format!("cache read at {} failed: {}", offset, e)))
    }

    async fn fill_ranges(
        &self,
        state: &mut LazyState,
        missing: &[crate::cache::ranges::Range],
    ) -> Result<()> {
        for range in missing {
            if self.cancel.is_cancelled() {
                return Err(SarError::Cancelled("lazy fetch cancelled".to_string()));
            }
            match self
                .registry
                .fetch_blob_range(&self.reference, &self.desc, range.offset, range.length)
                .await
            {
                Ok(stream) => {
                    self.write_stream(state, stream, range.offset, range.length)
                        .await?;
                }
                Err(SarError::RangeNotSupported(_)) => {
                    // Eager fallback for this call: pull the whole blob once.
                    let stream = self.registry.fetch_blob(&self.reference, &self.desc).await?;
                    self.write_stream(state, stream, 0, self.desc.size).await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn write_stream(
        &self,
        state: &mut LazyState,
        mut stream: crate::registry::ByteStream,
        offset: u64,
        length: u64,
    ) -> Result<()> {
        use std::os::unix::fs::FileExt;
        use tokio::io::AsyncReadExt;

        let mut pos = offset;
        let end = offset + length;
        let mut buf = vec![0u8; FETCH_STEP];
        while pos < end {
            if self.cancel.is_cancelled() {
                return Err(SarError::Cancelled("lazy fetch cancelled".to_string()));
            }
            let want = ((end - pos) as usize).min(buf.len());
            let n = stream
                .read(&mut buf[..want])
                .await
                .map_err(|e| SarError::Io(format!("range fetch read failed: {}", e)))?;
            if n == 0 {
                return Err(SarError::Io(format!(
                    "registry range [{}, {}) ended early at {}",
                    offset, end, pos
                )));
            }
            self.file
                .write_at(&buf[..n], pos)
                .map_err(|e| SarError::Io(format!("partial write at {} failed: {}", pos, e)))?;
            state.free.remove(pos, n as u64);
            pos += n as u64;
        }
        Ok(())
    }

    /// All ranges present: verify, promote the partial file to its final
    /// name and mark the entry complete.
    async fn finalize(&self, _state: &mut LazyState) -> Result<()> {
        let partial = self.cache.partial_path(&self.desc.digest);
        let final_path = self.cache.blob_path(&self.desc.digest);
        if !self
            .cache
            .verify_file(&partial, &self.desc.digest, &self.cancel)?
        {
            let _ = std::fs::remove_file(&partial);
            self.cache.remove_ranges(&self.desc.digest);
            let _ = std::fs::remove_file(self.cache.entry_path(&self.desc.digest));
            return Err(SarError::InvalidArchive(format!(
                "lazily fetched blob does not match {}",
                self.desc.digest
            )));
        }
        std::fs::rename(&partial, &final_path)
            .map_err(|e| SarError::Io(format!("promote partial failed: {}", e)))?;
        self.cache.remove_ranges(&self.desc.digest);

        let mut entry = self
            .cache
            .load_entry(&self.desc.digest)?
            .unwrap_or_else(|| {
                crate::cache::entry::CacheEntry::new(
                    self.desc.digest.clone(),
                    self.desc.size,
                    self.desc.media_type.clone(),
                )
            });
        entry.complete = true;
        entry.verified = true;
        entry.touch();
        self.cache.store_entry(&entry)?;
        self.complete.store(true, Ordering::Release);
        Ok(())
    }
}
