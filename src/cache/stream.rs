//! Streaming pass-through for cache misses
//!
//! On a miss the caller gets a reader that yields registry bytes as they
//! arrive while a background feeder tees them into a `.partial.<nonce>` file.
//! At EOF the feeder checks size and digest, promotes the file and marks the
//! entry complete and verified. An interrupted transfer leaves a resumable
//! partial file plus its free-range map; the next stream-through serves the
//! local prefix and fetches only what is missing.

use crate::cache::entry::CacheEntry;
use crate::cache::ranges::RangeSet;
use crate::cache::{BlobCache, DigestLock};
use crate::digest::Hasher;
use crate::error::{Result, SarError};
use crate::reference::Reference;
use crate::registry::{ByteStream, LayerDescriptor, Registry};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio_util::sync::CancellationToken;

const STEP: usize = 128 * 1024;
const PIPE_CAPACITY: usize = 256 * 1024;
/// Persist the free-range map at least this often so an interrupt loses
/// little progress.
const PERSIST_INTERVAL: u64 = 1024 * 1024;

pub(crate) async fn open_stream_through(
    cache: BlobCache,
    registry: Arc<dyn Registry>,
    reference: Reference,
    desc: LayerDescriptor,
    cancel: CancellationToken,
) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
    cache.ensure_dirs()?;

    // Complete hit: stream straight off the local file under a shared lock.
    if let Some(entry) = cache.load_entry(&desc.digest)? {
        if entry.complete {
            let lock = cache.acquire_lock(&desc.digest, false).await?;
            let path = cache.blob_path(&desc.digest);
            if !cache.verify_on_read() || cache.verify_file(&path, &desc.digest, &cancel)? {
                cache.touch_entry(&desc.digest);
                let file = tokio::fs::File::from_std(std::fs::File::open(&path).map_err(|e| {
                    SarError::Io(format!("open cached blob {} failed: {}", path.display(), e))
                })?);
                return Ok(Box::new(LockedFileStream { file, _lock: lock }));
            }
            drop(lock);
            cache.logger().warning(&format!(
                "cached blob {} failed verification, refetching",
                desc.digest.short()
            ));
        }
    }

    let lock = cache.acquire_lock(&desc.digest, true).await?;

    // Another process may have completed the blob while we waited.
    if cache
        .load_entry(&desc.digest)?
        .is_some_and(|entry| entry.complete)
    {
        drop(lock);
        return Box::pin(open_stream_through(cache, registry, reference, desc, cancel)).await;
    }

    let nonce_path = cache.partial_nonce_path(&desc.digest);
    let stable_path = cache.partial_path(&desc.digest);

    // Resume: adopt a previous partial file when its range map survived.
    let free = match (stable_path.is_file(), cache.load_ranges(&desc.digest)?) {
        (true, Some(free)) => {
            std::fs::rename(&stable_path, &nonce_path)
                .map_err(|e| SarError::Io(format!("adopt partial failed: {}", e)))?;
            free
        }
        _ => {
            let _ = std::fs::remove_file(&stable_path);
            RangeSet::full(desc.size)
        }
    };

    let file = open_partial(&nonce_path, desc.size)?;
    let mut entry = cache
        .load_entry(&desc.digest)?
        .unwrap_or_else(|| CacheEntry::new(desc.digest.clone(), desc.size, desc.media_type.clone()));
    entry.complete = false;
    entry.touch();
    cache.store_entry(&entry)?;
    cache.store_ranges(&desc.digest, &free)?;

    let (tx, rx) = tokio::io::duplex(PIPE_CAPACITY);
    let error_slot: Arc<Mutex<Option<SarError>>> = Arc::new(Mutex::new(None));
    let feeder_error = Arc::clone(&error_slot);

    tokio::spawn(async move {
        let mut feeder = Feeder {
            cache,
            registry,
            reference,
            desc,
            cancel,
            file,
            free,
            nonce_path,
            stable_path,
        };
        let mut tx = tx;
        if let Err(e) = feeder.run(&mut tx).await {
            feeder.preserve_or_scrub(&e);
            *feeder_error.lock().expect("error slot poisoned") = Some(e);
        }
        let _ = tx.shutdown().await;
        drop(lock);
    });

    Ok(Box::new(PassThroughReader {
        rx,
        error: error_slot,
    }))
}

fn open_partial(path: &PathBuf, size: u64) -> Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .mode(0o600)
        .open(path)
        .map_err(|e| SarError::Io(format!("open partial {} failed: {}", path.display(), e)))?;
    file.set_len(size)
        .map_err(|e| SarError::Io(format!("size partial {} failed: {}", path.display(), e)))?;
    Ok(file)
}

struct Feeder {
    cache: BlobCache,
    registry: Arc<dyn Registry>,
    reference: Reference,
    desc: LayerDescriptor,
    cancel: CancellationToken,
    file: std::fs::File,
    /// Bytes still missing from the partial file
    free: RangeSet,
    nonce_path: PathBuf,
    stable_path: PathBuf,
}

impl Feeder {
    /// Serve `[0, size)` in order: local runs come off the partial file,
    /// missing runs come from the registry and are teed into it. The running
    /// hash covers exactly the bytes yielded to the consumer.
    async fn run(&mut self, tx: &mut DuplexStream) -> Result<()> {
        use std::os::unix::fs::FileExt;
        use tokio::io::AsyncReadExt;

        let size = self.desc.size;
        let mut hasher = Hasher::new();
        let mut pos: u64 = 0;
        let mut remote: Option<ByteStream> = None;
        let mut last_persist: u64 = 0;
        let mut buf = vec![0u8; STEP];

        while pos < size {
            if self.cancel.is_cancelled() {
                return Err(SarError::Cancelled("blob fetch cancelled".to_string()));
            }
            let missing_run = self.free.covered_at(pos);
            if missing_run == 0 {
                // Local run up to the next missing byte.
                remote = None;
                let next_missing = self.free.next_at_or_after(pos).unwrap_or(size);
                let want = ((next_missing - pos).min(STEP as u64)) as usize;
                self.file
                    .read_exact_at(&mut buf[..want], pos)
                    .map_err(|e| SarError::Io(format!("partial read at {} failed: {}", pos, e)))?;
                hasher.update(&buf[..want]);
                tx.write_all(&buf[..want])
                    .await
                    .map_err(|_| SarError::Cancelled("stream consumer dropped".to_string()))?;
                pos += want as u64;
            } else {
                if remote.is_none() {
                    remote = Some(self.open_remote(pos, missing_run).await?);
                }
                let want = (missing_run.min(STEP as u64)) as usize;
                let n = remote
                    .as_mut()
                    .expect("remote stream just opened")
                    .read(&mut buf[..want])
                    .await
                    .map_err(|e| SarError::Io(format!("registry stream read failed: {}", e)))?;
                if n == 0 {
                    return Err(SarError::Io(format!(
                        "registry stream for {} ended at {} of {} bytes",
                        self.desc.digest, pos, size
                    )));
                }
                self.file
                    .write_at(&buf[..n], pos)
                    .map_err(|e| SarError::Io(format!("partial write at {} failed: {}", pos, e)))?;
                hasher.update(&buf[..n]);
                tx.write_all(&buf[..n])
                    .await
                    .map_err(|_| SarError::Cancelled("stream consumer dropped".to_string()))?;
                self.free.remove(pos, n as u64);
                pos += n as u64;
                if pos - last_persist >= PERSIST_INTERVAL {
                    self.cache.store_ranges(&self.desc.digest, &self.free)?;
                    last_persist = pos;
                }
                if self.free.covered_at(pos) == 0 {
                    remote = None;
                }
            }
        }

        let digest = hasher.finish();
        if digest != self.desc.digest {
            return Err(SarError::InvalidArchive(format!(
                "blob digest mismatch: expected {}, streamed {}",
                self.desc.digest, digest
            )));
        }
        self.commit()
    }

    /// Open the registry stream covering the missing run at `pos`. A full
    /// fetch is used when nothing is cached yet; otherwise a range request,
    /// falling back to full-fetch-and-discard when ranges are unsupported.
    async fn open_remote(&mut self, pos: u64, run: u64) -> Result<ByteStream> {
        use tokio::io::AsyncReadExt;

        if pos == 0 && self.free.total() == self.desc.size {
            return self.registry.fetch_blob(&self.reference, &self.desc).await;
        }
        match self
            .registry
            .fetch_blob_range(&self.reference, &self.desc, pos, run)
            .await
        {
            Ok(stream) => Ok(stream),
            Err(SarError::RangeNotSupported(_)) => {
                // Restart from zero and skip what the consumer already has.
                let mut stream = self.registry.fetch_blob(&self.reference, &self.desc).await?;
                let mut skip = pos;
                let mut waste = vec![0u8; STEP];
                while skip > 0 {
                    if self.cancel.is_cancelled() {
                        return Err(SarError::Cancelled("blob fetch cancelled".to_string()));
                    }
                    let want = (skip.min(STEP as u64)) as usize;
                    let n = stream
                        .read(&mut waste[..want])
                        .await
                        .map_err(|e| SarError::Io(format!("registry stream read failed: {}", e)))?;
                    if n == 0 {
                        return Err(SarError::Io(
                            "registry stream ended during range fallback".to_string(),
                        ));
                    }
                    skip -= n as u64;
                }
                Ok(stream)
            }
            Err(e) => Err(e),
        }
    }

    /// Promote the nonce file and persist the completed entry.
    fn commit(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| SarError::Io(format!("sync partial failed: {}", e)))?;
        let final_path = self.cache.blob_path(&self.desc.digest);
        std::fs::rename(&self.nonce_path, &final_path)
            .map_err(|e| SarError::Io(format!("promote blob failed: {}", e)))?;
        self.cache.remove_ranges(&self.desc.digest);
        let _ = std::fs::remove_file(&self.stable_path);

        let mut entry = self
            .cache
            .load_entry(&self.desc.digest)?
            .unwrap_or_else(|| {
                CacheEntry::new(
                    self.desc.digest.clone(),
                    self.desc.size,
                    self.desc.media_type.clone(),
                )
            });
        entry.complete = true;
        entry.verified = true;
        entry.touch();
        self.cache.store_entry(&entry)
    }

    /// Cancellation keeps a resumable partial; anything else scrubs the
    /// digest's state so no half-written entry survives.
    fn preserve_or_scrub(&mut self, err: &SarError) {
        if err.is_cancelled() {
            if let Err(e) = std::fs::rename(&self.nonce_path, &self.stable_path) {
                self.cache
                    .logger()
                    .debug(&format!("stash partial failed: {}", e));
                let _ = std::fs::remove_file(&self.nonce_path);
                self.cache.remove_ranges(&self.desc.digest);
                return;
            }
            if let Err(e) = self.cache.store_ranges(&self.desc.digest, &self.free) {
                self.cache
                    .logger()
                    .debug(&format!("persist range map failed: {}", e));
            }
        } else {
            let _ = std::fs::remove_file(&self.nonce_path);
            self.cache.remove_ranges(&self.desc.digest);
            let _ = std::fs::remove_file(self.cache.entry_path(&self.desc.digest));
        }
    }
}

/// Reader handed to the consumer; surfaces the feeder's error at EOF
struct PassThroughReader {
    rx: DuplexStream,
    error: Arc<Mutex<Option<SarError>>>,
}

impl AsyncRead for PassThroughReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        match Pin::new(&mut self.rx).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.filled().len() == before {
                    if let Some(err) = self.error.lock().expect("error slot poisoned").take() {
                        return Poll::Ready(Err(std::io::Error::other(err)));
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Complete-hit reader that keeps the shared lock alive while streaming
struct LockedFileStream {
    file: tokio::fs::File,
    _lock: DigestLock,
}

impl AsyncRead for LockedFileStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}
