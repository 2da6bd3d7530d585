//! Open, pull and push orchestration
//!
//! [`Client`] composes the registry collaborator, the local blob cache, the
//! archive builder/reader, the extractor and the optional signer/verifier
//! into the three top-level operations:
//!
//! - `open` — an [`Image`] handle with TOC listing and per-file readers,
//!   backed by an eager or lazy cache handle (or a temp file without cache)
//! - `pull` — stream the blob through the cache tee into the safe extractor,
//!   then check the running digest against the resolved descriptor
//! - `push` — build a seekable archive and hand it to the registry with its
//!   digests precomputed, then optionally sign the resulting manifest

use crate::cache::{BlobCache, BlobHandle};
use crate::compress::Codec;
use crate::digest::{Digest, DigestReader};
use crate::error::{Result, SarError};
use crate::extract::{ExtractStats, Extractor};
use crate::logging::Logger;
use crate::reference::Reference;
use crate::registry::{LayerDescriptor, PushMetadata, Registry};
use crate::sar::builder::{BuildOptions, SarBuilder};
use crate::sar::reader::{BlobSource, EntryReader, FileSource, SarReader};
use crate::sar::toc::TocEntry;
use crate::sign::{Signer, Verifier, is_signature_artifact_type};
use crate::validate::ExtractLimits;
use crate::vfs::FileSystem;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Options for [`Client::pull`]
#[derive(Debug, Clone, Copy, Default)]
pub struct PullOptions {
    pub limits: ExtractLimits,
}

/// Options for [`Client::push`]
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub codec: Option<Codec>,
    pub chunk_size: Option<u64>,
    pub annotations: BTreeMap<String, String>,
}

/// Outcome of a pull
#[derive(Debug, Clone)]
pub struct PullReport {
    pub reference: Reference,
    pub descriptor: LayerDescriptor,
    pub stats: ExtractStats,
}

/// Outcome of a push
#[derive(Debug, Clone)]
pub struct PushReport {
    pub manifest_digest: Digest,
    pub blob_digest: Digest,
    pub blob_size: u64,
    pub toc_digest: Digest,
    pub uncompressed_digest: Digest,
    /// Digest of the signature referrer, when a signer ran
    pub signature_digest: Option<Digest>,
}

pub struct ClientBuilder {
    registry: Option<Arc<dyn Registry>>,
    cache: Option<BlobCache>,
    verifier: Option<Arc<dyn Verifier>>,
    signer: Option<Arc<dyn Signer>>,
    lazy_handles: bool,
    prefetch: bool,
    ref_ttl: Option<Duration>,
    logger: Logger,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            registry: None,
            cache: None,
            verifier: None,
            signer: None,
            lazy_handles: false,
            prefetch: false,
            ref_ttl: None,
            logger: Logger::new_quiet(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_cache(mut self, cache: BlobCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Serve `open` through range-on-demand handles instead of full fetches
    pub fn with_lazy_handles(mut self, lazy: bool) -> Self {
        self.lazy_handles = lazy;
        self
    }

    /// Start a background full fetch when an open handle is incomplete
    pub fn with_prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Skip registry resolution when a cached descriptor is younger than
    /// `ttl`. Digest verification still applies to the blob itself.
    pub fn with_ref_ttl(mut self, ttl: Duration) -> Self {
        self.ref_ttl = Some(ttl);
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn build(self) -> Result<Client> {
        let registry = self
            .registry
            .ok_or_else(|| SarError::Io("client requires a registry".to_string()))?;
        Ok(Client {
            registry,
            cache: self.cache,
            verifier: self.verifier,
            signer: self.signer,
            lazy_handles: self.lazy_handles,
            prefetch: self.prefetch,
            ref_ttl: self.ref_ttl,
            logger: self.logger,
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Orchestrates registry, cache, archive and signature operations
pub struct Client {
    registry: Arc<dyn Registry>,
    cache: Option<BlobCache>,
    verifier: Option<Arc<dyn Verifier>>,
    signer: Option<Arc<dyn Signer>>,
    lazy_handles: bool,
    prefetch: bool,
    ref_ttl: Option<Duration>,
    logger: Logger,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Open an archive for listing and selective reads
    pub async fn open(&self, reference: &Reference, cancel: &CancellationToken) -> Result<Image> {
        let reference = self.maybe_verify(reference).await?;

        if let Some(cache) = &self.cache {
            let desc = self.resolve(&reference, cache).await?;
            let handle = if self.lazy_handles {
                cache
                    .open_lazy(&self.registry, &reference, &desc, cancel)
                    .await?
            } else {
                cache.open(&self.registry, &reference, &desc, cancel).await?
            };
            if self.prefetch && !handle.complete() {
                self.spawn_prefetch(cache.clone(), reference.clone(), desc.clone());
            }
            let reader = SarReader::open(ImageSource::Cache(handle)).await?;
            return Ok(Image::new(reader));
        }

        // No cache: spool the blob to a temp file and read from that.
        let (mut stream, _size) = self.registry.pull(&reference).await?;
        let file = tempfile::tempfile()
            .map_err(|e| SarError::Io(format!("cannot create spool file: {}", e)))?;
        let mut out = tokio::fs::File::from_std(
            file.try_clone()
                .map_err(|e| SarError::Io(format!("spool file clone failed: {}", e)))?,
        );
        let mut buf = vec![0u8; 128 * 1024];
        loop {
            if cancel.is_cancelled() {
                return Err(SarError::Cancelled("open cancelled".to_string()));
            }
            let n = tokio::io::AsyncReadExt::read(&mut stream, &mut buf)
                .await
                .map_err(SarError::from)?;
            if n == 0 {
                break;
            }
            tokio::io::AsyncWriteExt::write_all(&mut out, &buf[..n])
                .await
                .map_err(SarError::from)?;
        }
        tokio::io::AsyncWriteExt::flush(&mut out)
            .await
            .map_err(SarError::from)?;
        let reader = SarReader::open(ImageSource::Spool(FileSource::new(file)?)).await?;
        Ok(Image::new(reader))
    }

    /// Extract the referenced tree into `dest_dir`
    pub async fn pull(
        &self,
        reference: &Reference,
        dest_dir: &Path,
        options: &PullOptions,
        cancel: &CancellationToken,
    ) -> Result<PullReport> {
        let reference = self.maybe_verify(reference).await?;
        let desc = match &self.cache {
            Some(cache) => self.resolve(&reference, cache).await?,
            None => self.registry.resolve_layer(&reference).await?,
        };

        let stream: Box<dyn tokio::io::AsyncRead + Send + Unpin> = match &self.cache {
            Some(cache) => {
                cache
                    .open_stream_through(&self.registry, &reference, &desc, cancel)
                    .await?
            }
            None => self.registry.fetch_blob(&reference, &desc).await?,
        };

        // Extraction is synchronous tar work; bridge the stream onto a
        // blocking thread and keep a running digest under the decompressor.
        let bridge = tokio_util::io::SyncIoBridge::new(stream);
        let dest = dest_dir.to_path_buf();
        let limits = options.limits;
        let extract_cancel = cancel.clone();
        let (stats, streamed_digest) =
            tokio::task::spawn_blocking(move || -> Result<(ExtractStats, Digest)> {
                let mut tee = DigestReader::new(bridge);
                let stats = Extractor::new().extract(&mut tee, &dest, &limits, &extract_cancel)?;
                // Drain the TOC frame and footer so the digest covers the
                // whole blob. Errors keep their kind across the bridge.
                std::io::copy(&mut tee, &mut std::io::sink()).map_err(SarError::from)?;
                Ok((stats, tee.finish()))
            })
            .await
            .map_err(|e| SarError::Io(format!("extraction task failed: {}", e)))??;

        if streamed_digest != desc.digest {
            return Err(SarError::InvalidArchive(format!(
                "pulled blob digest mismatch: descriptor says {}, stream was {}",
                desc.digest, streamed_digest
            )));
        }

        self.logger.detail(&format!(
            "pulled {} files, {} bytes",
            stats.files, stats.bytes
        ));
        Ok(PullReport {
            reference,
            descriptor: desc,
            stats,
        })
    }

    /// Build and upload a seekable archive for `source`
    pub async fn push(
        &self,
        reference: &Reference,
        source: Arc<dyn FileSystem>,
        options: &PushOptions,
        cancel: &CancellationToken,
    ) -> Result<PushReport> {
        let codec = options.codec.unwrap_or(Codec::Gzip);
        let mut build_options = BuildOptions {
            codec,
            ..Default::default()
        };
        if let Some(chunk_size) = options.chunk_size {
            build_options.chunk_size = chunk_size;
        }

        let build_cancel = cancel.clone();
        let result = tokio::task::spawn_blocking(move || {
            SarBuilder::new(build_options).build(source.as_ref(), &build_cancel)
        })
        .await
        .map_err(|e| SarError::Io(format!("build task failed: {}", e)))??;

        let meta = PushMetadata {
            media_type: codec.media_type().to_string(),
            annotations: options.annotations.clone(),
            toc_digest: result.toc_digest.clone(),
            uncompressed_digest: result.uncompressed_digest.clone(),
            blob_digest: result.blob_digest.clone(),
            blob_size: result.blob_size,
        };
        let blob: crate::registry::ByteStream = Box::new(tokio::fs::File::from_std(result.blob));
        let manifest_digest = self.registry.push(reference, blob, &meta).await?;

        let mut signature_digest = None;
        if let Some(signer) = &self.signer {
            let pinned = reference.with_digest(manifest_digest.clone());
            let (manifest_bytes, digest) = self.registry.fetch_manifest(&pinned).await?;
            let signature = signer.sign(&digest, &manifest_bytes)?;
            let referrer = self
                .registry
                .push_referrer(
                    reference,
                    &digest,
                    signature,
                    signer.artifact_type(),
                    BTreeMap::new(),
                )
                .await?;
            self.logger
                .detail(&format!("pushed signature referrer {}", referrer.short()));
            signature_digest = Some(referrer);
        }

        Ok(PushReport {
            manifest_digest,
            blob_digest: meta.blob_digest,
            blob_size: meta.blob_size,
            toc_digest: meta.toc_digest,
            uncompressed_digest: meta.uncompressed_digest,
            signature_digest,
        })
    }

    /// With a verifier configured, only verified digests are consumed:
    /// the returned reference is pinned to the manifest digest the signature
    /// covered (or the top-level index that referenced it).
    async fn maybe_verify(&self, reference: &Reference) -> Result<Reference> {
        let Some(verifier) = &self.verifier else {
            return Ok(reference.clone());
        };
        let digest = self.verify_signature(verifier, reference).await?;
        Ok(reference.with_digest(digest))
    }

    /// Signature verification per the referrers model: prefer referrers of
    /// the platform manifest, fall back to the top-level manifest (multi-arch
    /// images often sign the index), accept the first signature the verifier
    /// likes.
    async fn verify_signature(
        &self,
        verifier: &Arc<dyn Verifier>,
        reference: &Reference,
    ) -> Result<Digest> {
        let (top_bytes, top_digest) = self.registry.fetch_manifest(reference).await?;

        let media_type = serde_json::from_slice::<serde_json::Value>(&top_bytes)
            .ok()
            .and_then(|v| v.get("mediaType").and_then(|m| m.as_str()).map(String::from))
            .unwrap_or_default();
        let is_index = media_type.contains("image.index") || media_type.contains("manifest.list");

        let (plat_bytes, plat_digest) = if is_index {
            let child = select_platform_child(&top_bytes)?;
            let pinned = reference.with_digest(child.clone());
            let (bytes, digest) = self.registry.fetch_manifest(&pinned).await?;
            (bytes, digest)
        } else {
            (top_bytes.clone(), top_digest.clone())
        };

        let mut subject_bytes = plat_bytes;
        let mut subject_digest = plat_digest.clone();
        let mut candidates = self.signature_referrers(reference, &subject_digest).await?;
        if candidates.is_empty() && subject_digest != top_digest {
            subject_bytes = top_bytes;
            subject_digest = top_digest.clone();
            candidates = self.signature_referrers(reference, &subject_digest).await?;
        }
        if candidates.is_empty() {
            return Err(SarError::NoSignature(format!(
                "no signature referrers for {}",
                reference
            )));
        }

        let mut last_failure = String::new();
        for candidate in candidates {
            let signature = self.registry.fetch_referrer(reference, &candidate).await?;
            match verifier.verify(&subject_digest, &subject_bytes, &signature) {
                Ok(()) => return Ok(top_digest),
                Err(e) => last_failure = e.to_string(),
            }
        }
        Err(SarError::SignatureInvalid(format!(
            "no signature referrer verified for {}: {}",
            reference, last_failure
        )))
    }

    async fn signature_referrers(
        &self,
        reference: &Reference,
        subject: &Digest,
    ) -> Result<Vec<Digest>> {
        let referrers = self
            .registry
            .fetch_referrers(reference, subject, None)
            .await?;
        Ok(referrers
            .into_iter()
            .filter(|r| is_signature_artifact_type(&r.artifact_type))
            .map(|r| r.digest)
            .collect())
    }

    async fn resolve(&self, reference: &Reference, cache: &BlobCache) -> Result<LayerDescriptor> {
        if let Some(ttl) = self.ref_ttl {
            if let Some(desc) = cache.lookup_by_ref(reference, ttl)? {
                self.logger
                    .detail(&format!("descriptor for {} served from ref index", reference));
                return Ok(desc);
            }
        }
        let desc = self.registry.resolve_layer(reference).await?;
        if let Err(e) = cache.record_ref(reference, &desc) {
            self.logger
                .debug(&format!("ref index update failed: {}", e));
        }
        Ok(desc)
    }

    fn spawn_prefetch(&self, cache: BlobCache, reference: Reference, desc: LayerDescriptor) {
        let registry = Arc::clone(&self.registry);
        let logger = self.logger.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            if let Err(e) = cache.open(&registry, &reference, &desc, &cancel).await {
                logger.debug(&format!("background prefetch failed: {}", e));
            }
        });
    }
}

fn select_platform_child(index_bytes: &[u8]) -> Result<Digest> {
    #[derive(serde::Deserialize)]
    struct Index {
        #[serde(default)]
        manifests: Vec<Child>,
    }
    #[derive(serde::Deserialize)]
    struct Child {
        digest: String,
        #[serde(default)]
        platform: Option<ChildPlatform>,
    }
    #[derive(serde::Deserialize)]
    struct ChildPlatform {
        os: String,
        architecture: String,
    }

    let index: Index = serde_json::from_slice(index_bytes)
        .map_err(|e| SarError::InvalidArchive(format!("index unreadable: {}", e)))?;
    let child = index
        .manifests
        .iter()
        .find(|c| {
            c.platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == "amd64")
        })
        .or_else(|| index.manifests.first())
        .ok_or_else(|| SarError::NotFound("index has no manifests".to_string()))?;
    Digest::parse(&child.digest)
}

/// Blob source behind an opened image: cache handle or spooled temp file
pub enum ImageSource {
    Cache(BlobHandle),
    Spool(FileSource),
}

#[async_trait]
impl BlobSource for ImageSource {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            ImageSource::Cache(handle) => handle.read_at(offset, buf).await,
            ImageSource::Spool(file) => file.read_at(offset, buf).await,
        }
    }

    fn size(&self) -> u64 {
        match self {
            ImageSource::Cache(handle) => BlobSource::size(handle),
            ImageSource::Spool(file) => file.size(),
        }
    }
}

/// An opened archive: list entries, read single files, walk the TOC.
/// Safe for concurrent use; `close` is idempotent and later operations fail
/// with `Closed`.
#[derive(Debug)]
pub struct Image {
    reader: SarReader<ImageSource>,
    closed: AtomicBool,
}

impl Image {
    fn new(reader: SarReader<ImageSource>) -> Self {
        Self {
            reader,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SarError::Closed("image is closed".to_string()));
        }
        Ok(())
    }

    /// Entries in stable sorted path order
    pub fn list(&self) -> Result<Vec<&TocEntry>> {
        self.ensure_open()?;
        Ok(self.reader.toc().sorted_entries())
    }

    /// Open one regular file for reading
    pub fn open(&self, path: &str) -> Result<EntryReader<'_, ImageSource>> {
        self.ensure_open()?;
        self.reader.open_file(path)
    }

    /// Visit every entry in sorted order
    pub fn walk<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&TocEntry) -> Result<()>,
    {
        self.ensure_open()?;
        for entry in self.reader.toc().sorted_entries() {
            visit(entry)?;
        }
        Ok(())
    }

    /// Idempotent close; operations accepted before the close complete,
    /// operations after it fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
