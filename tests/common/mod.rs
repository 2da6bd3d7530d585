//! Shared test fixtures: an in-memory registry and sample trees

use async_trait::async_trait;
use sarball::digest::Digest;
use sarball::error::{Result, SarError};
use sarball::reference::Reference;
use sarball::registry::{ByteStream, LayerDescriptor, PushMetadata, ReferrerInfo, Registry};
use sarball::vfs::MemFs;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::AsyncReadExt;

const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";

#[derive(Default)]
struct State {
    /// `repo/identifier` -> (manifest bytes, media type)
    manifests: HashMap<String, (Vec<u8>, String)>,
    /// digest -> blob bytes
    blobs: HashMap<String, Vec<u8>>,
    /// subject digest -> referrer manifest digests with artifact types
    referrers: HashMap<String, Vec<(Digest, String)>>,
    /// referrer manifest digest -> payload bytes
    referrer_payloads: HashMap<String, Vec<u8>>,
}

/// In-memory registry with fetch accounting for selective-read assertions
#[derive(Default)]
pub struct MockRegistry {
    state: Mutex<State>,
    pub support_range: AtomicBool,
    pub full_blob_fetches: AtomicU64,
    pub range_bytes_served: AtomicU64,
    pub range_requests: Mutex<Vec<(u64, u64)>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        let registry = Self::default();
        registry.support_range.store(true, Ordering::Relaxed);
        registry
    }

    fn manifest_key(reference: &Reference, identifier: &str) -> String {
        format!("{}/{}", reference.repository(), identifier)
    }

    /// Register a manifest under both its tag (when given) and its digest
    fn record_manifest(
        &self,
        reference: &Reference,
        bytes: Vec<u8>,
        media_type: &str,
    ) -> Digest {
        let digest = Digest::from_bytes(&bytes);
        let mut state = self.state.lock().unwrap();
        state.manifests.insert(
            Self::manifest_key(reference, &digest.to_string()),
            (bytes.clone(), media_type.to_string()),
        );
        state.manifests.insert(
            Self::manifest_key(reference, &reference.identifier()),
            (bytes, media_type.to_string()),
        );
        digest
    }

    /// Install a raw blob and single-layer manifest directly, bypassing the
    /// builder. Lets tests plant hostile archives.
    pub fn insert_layer(
        &self,
        reference: &Reference,
        blob: Vec<u8>,
        media_type: &str,
    ) -> LayerDescriptor {
        let blob_digest = Digest::from_bytes(&blob);
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_MANIFEST,
            "config": {"mediaType": "application/vnd.oci.empty.v1+json", "digest": Digest::from_bytes(b"{}").as_str(), "size": 2},
            "layers": [{
                "mediaType": media_type,
                "digest": blob_digest.as_str(),
                "size": blob.len(),
            }],
        });
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        let size = blob.len() as u64;
        self.state
            .lock()
            .unwrap()
            .blobs
            .insert(blob_digest.to_string(), blob);
        let manifest_digest = self.record_manifest(reference, manifest_bytes, MEDIA_TYPE_MANIFEST);
        LayerDescriptor {
            digest: blob_digest,
            size,
            media_type: media_type.to_string(),
            manifest_digest,
            platform: None,
        }
    }

    /// Wrap an existing manifest in a single-entry index under `reference`,
    /// for multi-arch scenarios.
    pub fn wrap_in_index(&self, reference: &Reference, child: &Digest) -> Digest {
        let index = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_INDEX,
            "manifests": [{
                "mediaType": MEDIA_TYPE_MANIFEST,
                "digest": child.as_str(),
                "size": 0,
                "platform": {"os": "linux", "architecture": "amd64"},
            }],
        });
        self.record_manifest(
            reference,
            serde_json::to_vec(&index).unwrap(),
            MEDIA_TYPE_INDEX,
        )
    }

    pub fn blob_size(&self, digest: &Digest) -> u64 {
        self.state
            .lock()
            .unwrap()
            .blobs
            .get(&digest.to_string())
            .map(|b| b.len() as u64)
            .unwrap_or(0)
    }

    fn manifest_for(&self, reference: &Reference) -> Result<(Vec<u8>, String)> {
        let state = self.state.lock().unwrap();
        state
            .manifests
            .get(&Self::manifest_key(reference, &reference.identifier()))
            .cloned()
            .ok_or_else(|| SarError::NotFound(format!("manifest {}", reference)))
    }

    fn layer_of(&self, manifest_bytes: &[u8]) -> Result<(Digest, u64, String)> {
        let doc: serde_json::Value = serde_json::from_slice(manifest_bytes)
            .map_err(|e| SarError::InvalidArchive(format!("manifest unreadable: {}", e)))?;
        let layers = doc
            .get("layers")
            .and_then(|l| l.as_array())
            .ok_or_else(|| SarError::InvalidArchive("manifest has no layers".to_string()))?;
        if layers.len() != 1 {
            return Err(SarError::InvalidArchive(format!(
                "expected a single layer, found {}",
                layers.len()
            )));
        }
        let layer = &layers[0];
        Ok((
            Digest::parse(layer["digest"].as_str().unwrap_or_default())?,
            layer["size"].as_u64().unwrap_or_default(),
            layer["mediaType"].as_str().unwrap_or_default().to_string(),
        ))
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn push(
        &self,
        reference: &Reference,
        mut blob: ByteStream,
        meta: &PushMetadata,
    ) -> Result<Digest> {
        let mut bytes = Vec::new();
        blob.read_to_end(&mut bytes)
            .await
            .map_err(|e| SarError::Io(format!("push stream failed: {}", e)))?;
        if bytes.len() as u64 != meta.blob_size {
            return Err(SarError::Io(format!(
                "declared blob size {} but streamed {}",
                meta.blob_size,
                bytes.len()
            )));
        }
        let digest = Digest::from_bytes(&bytes);
        if digest != meta.blob_digest {
            return Err(SarError::InvalidArchive(format!(
                "declared blob digest {} but streamed {}",
                meta.blob_digest, digest
            )));
        }
        self.state
            .lock()
            .unwrap()
            .blobs
            .insert(digest.to_string(), bytes);

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_MANIFEST,
            "config": {"mediaType": "application/vnd.oci.empty.v1+json", "digest": Digest::from_bytes(b"{}").as_str(), "size": 2},
            "layers": [{
                "mediaType": meta.media_type,
                "digest": meta.blob_digest.as_str(),
                "size": meta.blob_size,
                "annotations": {
                    "dev.sarball.toc.digest": meta.toc_digest.as_str(),
                    "dev.sarball.uncompressed.digest": meta.uncompressed_digest.as_str(),
                },
            }],
        });
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        Ok(self.record_manifest(reference, manifest_bytes, MEDIA_TYPE_MANIFEST))
    }

    async fn pull(&self, reference: &Reference) -> Result<(ByteStream, u64)> {
        let desc = self.resolve_layer(reference).await?;
        let stream = self.fetch_blob(reference, &desc).await?;
        Ok((stream, desc.size))
    }

    async fn resolve_layer(&self, reference: &Reference) -> Result<LayerDescriptor> {
        let (mut bytes, media_type) = self.manifest_for(reference)?;
        let mut manifest_digest = Digest::from_bytes(&bytes);
        let mut platform = None;
        if media_type == MEDIA_TYPE_INDEX {
            let doc: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            let child = Digest::parse(
                doc["manifests"][0]["digest"].as_str().unwrap_or_default(),
            )?;
            platform = Some("linux/amd64".to_string());
            let pinned = reference.with_digest(child);
            let (child_bytes, _) = self.manifest_for(&pinned)?;
            bytes = child_bytes;
            manifest_digest = Digest::from_bytes(&bytes);
        }
        let (digest, size, layer_type) = self.layer_of(&bytes)?;
        Ok(LayerDescriptor {
            digest,
            size,
            media_type: layer_type,
            manifest_digest,
            platform,
        })
    }

    async fn fetch_blob(
        &self,
        _reference: &Reference,
        desc: &LayerDescriptor,
    ) -> Result<ByteStream> {
        self.full_blob_fetches.fetch_add(1, Ordering::Relaxed);
        let bytes = self
            .state
            .lock()
            .unwrap()
            .blobs
            .get(&desc.digest.to_string())
            .cloned()
            .ok_or_else(|| SarError::NotFound(format!("blob {}", desc.digest)))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn fetch_blob_range(
        &self,
        _reference: &Reference,
        desc: &LayerDescriptor,
        offset: u64,
        length: u64,
    ) -> Result<ByteStream> {
        if !self.support_range.load(Ordering::Relaxed) {
            return Err(SarError::RangeNotSupported(
                "mock registry has ranges disabled".to_string(),
            ));
        }
        let bytes = self
            .state
            .lock()
            .unwrap()
            .blobs
            .get(&desc.digest.to_string())
            .cloned()
            .ok_or_else(|| SarError::NotFound(format!("blob {}", desc.digest)))?;
        let end = (offset + length).min(bytes.len() as u64);
        if offset >= bytes.len() as u64 {
            return Err(SarError::RangeNotSupported(format!(
                "range {}-{} outside blob of {} bytes",
                offset,
                end,
                bytes.len()
            )));
        }
        let slice = bytes[offset as usize..end as usize].to_vec();
        self.range_bytes_served
            .fetch_add(slice.len() as u64, Ordering::Relaxed);
        self.range_requests.lock().unwrap().push((offset, length));
        Ok(Box::new(std::io::Cursor::new(slice)))
    }

    async fn fetch_manifest(&self, reference: &Reference) -> Result<(Vec<u8>, Digest)> {
        let (bytes, _) = self.manifest_for(reference)?;
        let digest = Digest::from_bytes(&bytes);
        Ok((bytes, digest))
    }

    async fn push_referrer(
        &self,
        _reference: &Reference,
        subject: &Digest,
        data: Vec<u8>,
        artifact_type: &str,
        _annotations: BTreeMap<String, String>,
    ) -> Result<Digest> {
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_MANIFEST,
            "artifactType": artifact_type,
            "subject": {"digest": subject.as_str()},
        });
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        let digest = Digest::from_bytes(&manifest_bytes);
        let mut state = self.state.lock().unwrap();
        state
            .referrers
            .entry(subject.to_string())
            .or_default()
            .push((digest.clone(), artifact_type.to_string()));
        state
            .referrer_payloads
            .insert(digest.to_string(), data);
        Ok(digest)
    }

    async fn fetch_referrers(
        &self,
        _reference: &Reference,
        subject: &Digest,
        artifact_type: Option<&str>,
    ) -> Result<Vec<ReferrerInfo>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .referrers
            .get(&subject.to_string())
            .map(|list| {
                list.iter()
                    .filter(|(_, kind)| artifact_type.is_none_or(|want| want == kind))
                    .map(|(digest, kind)| ReferrerInfo {
                        digest: digest.clone(),
                        artifact_type: kind.clone(),
                        annotations: BTreeMap::new(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_referrer(&self, _reference: &Reference, referrer: &Digest) -> Result<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .referrer_payloads
            .get(&referrer.to_string())
            .cloned()
            .ok_or_else(|| SarError::NotFound(format!("referrer {}", referrer)))
    }
}

/// The canonical three-file sample tree used across scenarios
pub fn sample_tree() -> MemFs {
    let mut fs = MemFs::new();
    fs.add_file("hello.txt", b"Hello, World!".to_vec(), 0o644)
        .add_dir("subdir", 0o755)
        .add_file("subdir/nested.txt", b"Nested".to_vec(), 0o644)
        .add_file(
            "binary.bin",
            vec![0x00, 0x01, 0x02, 0x03, 0xFF, 0xFE, 0xFD],
            0o644,
        );
    fs
}

/// A tree big enough to span many chunks and stream steps. The payload is
/// pseudo-random so compression cannot shrink it, keeping byte accounting
/// meaningful.
pub fn large_tree(total: usize) -> MemFs {
    let mut fs = MemFs::new();
    fs.add_file("blob.bin", pseudo_random(total, 0x5eed), 0o644);
    fs
}

/// Deterministic LCG byte stream
pub fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}
