//! Distribution API adapter over reqwest
//!
//! Speaks the `/v2/` protocol directly: token auth, monolithic blob upload
//! (POST then PUT with digest), manifest push/fetch, ranged blob fetch and the
//! OCI 1.1 referrers API. One adapter instance serves one registry scheme and
//! credential set; repository-scoped tokens are fetched on demand and cached
//! for the life of the adapter.

use crate::digest::{Digest, Hasher};
use crate::error::{Result, SarError};
use crate::reference::Reference;
use crate::registry::auth::{Credentials, TokenAuth};
use crate::registry::{ByteStream, LayerDescriptor, PushMetadata, ReferrerInfo, Registry};
use crate::sar::{ANNOTATION_TOC_DIGEST, ANNOTATION_UNCOMPRESSED_DIGEST, MEDIA_TYPE_CONFIG};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::{Client, StatusCode, header};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
const MEDIA_TYPE_DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
const MEDIA_TYPE_EMPTY_CONFIG: &str = "application/vnd.oci.empty.v1+json";

const DEFAULT_PLATFORM: (&str, &str) = ("linux", "amd64");

#[derive(Debug, Clone)]
pub struct HttpRegistryOptions {
    /// Use `http://` instead of `https://`, for local registries
    pub plain_http: bool,
    pub skip_tls_verify: bool,
    pub credentials: Credentials,
}

impl Default for HttpRegistryOptions {
    fn default() -> Self {
        Self {
            plain_http: false,
            skip_tls_verify: false,
            credentials: Credentials::default(),
        }
    }
}

/// Registry adapter over the distribution HTTP API
pub struct HttpRegistry {
    client: Client,
    options: HttpRegistryOptions,
    tokens: Mutex<HashMap<String, String>>,
}

impl HttpRegistry {
    pub fn new(options: HttpRegistryOptions) -> Result<Self> {
        let mut builder = Client::builder();
        if options.skip_tls_verify {
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let client = builder
            .build()
            .map_err(|e| SarError::Io(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            options,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn endpoint(&self, reference: &Reference) -> String {
        let scheme = if self.options.plain_http || reference.registry().starts_with("localhost") {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, reference.registry())
    }

    async fn token(&self, reference: &Reference, push: bool) -> Result<Option<String>> {
        let key = format!("{}/{}/{}", reference.registry(), reference.repository(), push);
        {
            let cached = self.tokens.lock().await;
            if let Some(token) = cached.get(&key) {
                return Ok(Some(token.clone()));
            }
        }
        let auth = TokenAuth::new(
            self.client.clone(),
            self.endpoint(reference),
            self.options.credentials.clone(),
        );
        let token = auth.token_for(reference.repository(), push).await?;
        if let Some(token) = &token {
            self.tokens.lock().await.insert(key, token.clone());
        }
        Ok(token)
    }

    async fn request(
        &self,
        reference: &Reference,
        push: bool,
        build: impl FnOnce(&Client) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let mut request = build(&self.client);
        if let Some(token) = self.token(reference, push).await? {
            request = request.bearer_auth(token);
        } else if let (Some(user), Some(pass)) = (
            &self.options.credentials.username,
            &self.options.credentials.password,
        ) {
            request = request.basic_auth(user, Some(pass));
        }
        let response = request
            .send()
            .await
            .map_err(|e| SarError::Io(format!("registry request failed: {}", e)))?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SarError::Unauthorized(
                format!("registry returned {}", response.status()),
            )),
            _ => Ok(response),
        }
    }

    /// Fetch raw manifest bytes for a tag or digest, with their digest and
    /// media type.
    async fn manifest_raw(&self, reference: &Reference) -> Result<(Vec<u8>, Digest, String)> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.endpoint(reference),
            reference.repository(),
            reference.identifier()
        );
        let accept = format!(
            "{}, {}, {}, {}",
            MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_DOCKER_MANIFEST,
            MEDIA_TYPE_DOCKER_LIST
        );
        let response = self
            .request(reference, false, |c| {
                c.get(&url).header(header::ACCEPT, accept.clone())
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SarError::NotFound(format!("manifest {}", reference)));
        }
        if !response.status().is_success() {
            return Err(SarError::Io(format!(
                "manifest fetch returned {}",
                response.status()
            )));
        }
        let media_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or(MEDIA_TYPE_OCI_MANIFEST)
            .to_string();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SarError::Io(format!("manifest body unreadable: {}", e)))?
            .to_vec();
        let digest = Digest::from_bytes(&bytes);
        if let Some(expected) = reference.digest() {
            if expected != &digest {
                return Err(SarError::InvalidArchive(format!(
                    "manifest digest mismatch: asked {}, got {}",
                    expected, digest
                )));
            }
        }
        Ok((bytes, digest, media_type))
    }

    /// Monolithic blob upload: POST for a session, PUT with the digest.
    async fn upload_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
        size: u64,
        body: reqwest::Body,
    ) -> Result<()> {
        // Existing blobs can be skipped outright.
        let head_url = format!(
            "{}/v2/{}/blobs/{}",
            self.endpoint(reference),
            reference.repository(),
            digest
        );
        let head = self
            .request(reference, true, |c| c.head(&head_url))
            .await?;
        if head.status().is_success() {
            return Ok(());
        }

        let start_url = format!(
            "{}/v2/{}/blobs/uploads/",
            self.endpoint(reference),
            reference.repository()
        );
        let response = self
            .request(reference, true, |c| c.post(&start_url))
            .await?;
        if !response.status().is_success() {
            return Err(SarError::Io(format!(
                "blob upload start returned {}",
                response.status()
            )));
        }
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| SarError::Io("no Location header in upload response".to_string()))?;
        let location = if location.starts_with('/') {
            format!("{}{}", self.endpoint(reference), location)
        } else {
            location.to_string()
        };
        let put_url = if location.contains('?') {
            format!("{}&digest={}", location, digest)
        } else {
            format!("{}?digest={}", location, digest)
        };

        let response = self
            .request(reference, true, move |c| {
                c.put(&put_url)
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .header(header::CONTENT_LENGTH, size)
                    .body(body)
            })
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(SarError::Io(format!(
                "blob upload returned {}: {}",
                status, text
            )));
        }
        Ok(())
    }

    async fn put_manifest(
        &self,
        reference: &Reference,
        identifier: &str,
        media_type: &str,
        bytes: Vec<u8>,
    ) -> Result<Digest> {
        let digest = Digest::from_bytes(&bytes);
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.endpoint(reference),
            reference.repository(),
            identifier
        );
        let media_type = media_type.to_string();
        let response = self
            .request(reference, true, move |c| {
                c.put(&url)
                    .header(header::CONTENT_TYPE, media_type)
                    .body(bytes)
            })
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(SarError::Io(format!(
                "manifest push returned {}: {}",
                status, text
            )));
        }
        Ok(digest)
    }

    /// Walk an index down to the platform manifest when necessary.
    async fn platform_manifest(
        &self,
        reference: &Reference,
    ) -> Result<(Vec<u8>, Digest, Option<String>)> {
        let (bytes, digest, media_type) = self.manifest_raw(reference).await?;
        if media_type != MEDIA_TYPE_OCI_INDEX && media_type != MEDIA_TYPE_DOCKER_LIST {
            return Ok((bytes, digest, None));
        }
        let index: ManifestIndex = serde_json::from_slice(&bytes)
            .map_err(|e| SarError::InvalidArchive(format!("index unreadable: {}", e)))?;
        let child = index
            .manifests
            .iter()
            .find(|m| {
                m.platform.as_ref().is_some_and(|p| {
                    p.os == DEFAULT_PLATFORM.0 && p.architecture == DEFAULT_PLATFORM.1
                })
            })
            .or_else(|| index.manifests.first())
            .ok_or_else(|| SarError::NotFound(format!("empty index for {}", reference)))?;
        let platform = child
            .platform
            .as_ref()
            .map(|p| format!("{}/{}", p.os, p.architecture));
        let child_digest = Digest::parse(&child.digest)?;
        let pinned = reference.with_digest(child_digest.clone());
        let (child_bytes, fetched_digest, _) = self.manifest_raw(&pinned).await?;
        if fetched_digest != child_digest {
            return Err(SarError::InvalidArchive(format!(
                "index child digest mismatch for {}",
                reference
            )));
        }
        Ok((child_bytes, child_digest, platform))
    }
}

#[derive(Debug, Deserialize)]
struct ManifestIndex {
    #[serde(default)]
    manifests: Vec<IndexEntry>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    digest: String,
    #[serde(default, rename = "artifactType")]
    artifact_type: Option<String>,
    #[serde(default)]
    annotations: Option<BTreeMap<String, String>>,
    #[serde(default)]
    platform: Option<PlatformEntry>,
}

#[derive(Debug, Deserialize)]
struct PlatformEntry {
    os: String,
    architecture: String,
}

#[derive(Debug, Deserialize)]
struct ManifestDoc {
    #[serde(default)]
    layers: Vec<DescriptorDoc>,
}

#[derive(Debug, Deserialize)]
struct DescriptorDoc {
    #[serde(rename = "mediaType")]
    media_type: String,
    digest: String,
    size: u64,
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn push(
        &self,
        reference: &Reference,
        blob: ByteStream,
        meta: &PushMetadata,
    ) -> Result<Digest> {
        let body = reqwest::Body::wrap_stream(
            tokio_util::io::ReaderStream::new(blob).map_err(std::io::Error::other),
        );
        self.upload_blob(reference, &meta.blob_digest, meta.blob_size, body)
            .await?;

        let config = serde_json::json!({
            "architecture": DEFAULT_PLATFORM.1,
            "os": DEFAULT_PLATFORM.0,
            "config": {},
            "rootfs": {
                "type": "layers",
                "diff_ids": [meta.uncompressed_digest.as_str()],
            },
        });
        let config_bytes = serde_json::to_vec(&config)?;
        let config_digest = Digest::from_bytes(&config_bytes);
        self.upload_blob(
            reference,
            &config_digest,
            config_bytes.len() as u64,
            config_bytes.clone().into(),
        )
        .await?;

        let mut layer_annotations = meta.annotations.clone();
        layer_annotations.insert(
            ANNOTATION_TOC_DIGEST.to_string(),
            meta.toc_digest.to_string(),
        );
        layer_annotations.insert(
            ANNOTATION_UNCOMPRESSED_DIGEST.to_string(),
            meta.uncompressed_digest.to_string(),
        );
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "config": {
                "mediaType": MEDIA_TYPE_CONFIG,
                "digest": config_digest.as_str(),
                "size": config_bytes.len(),
            },
            "layers": [{
                "mediaType": meta.media_type,
                "digest": meta.blob_digest.as_str(),
                "size": meta.blob_size,
                "annotations": layer_annotations,
            }],
            "annotations": {
                ANNOTATION_TOC_DIGEST: meta.toc_digest.as_str(),
            },
        });
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        self.put_manifest(
            reference,
            &reference.identifier(),
            MEDIA_TYPE_OCI_MANIFEST,
            manifest_bytes,
        )
        .await
    }

    async fn pull(&self, reference: &Reference) -> Result<(ByteStream, u64)> {
        let desc = self.resolve_layer(reference).await?;
        let stream = self.fetch_blob(reference, &desc).await?;
        Ok((stream, desc.size))
    }

    async fn resolve_layer(&self, reference: &Reference) -> Result<LayerDescriptor> {
        let (bytes, manifest_digest, platform) = self.platform_manifest(reference).await?;
        let manifest: ManifestDoc = serde_json::from_slice(&bytes)
            .map_err(|e| SarError::InvalidArchive(format!("manifest unreadable: {}", e)))?;
        if manifest.layers.len() != 1 {
            return Err(SarError::InvalidArchive(format!(
                "expected a single layer, found {} in {}",
                manifest.layers.len(),
                reference
            )));
        }
        let layer = &manifest.layers[0];
        Ok(LayerDescriptor {
            digest: Digest::parse(&layer.digest)?,
            size: layer.size,
            media_type: layer.media_type.clone(),
            manifest_digest,
            platform,
        })
    }

    async fn fetch_blob(
        &self,
        reference: &Reference,
        desc: &LayerDescriptor,
    ) -> Result<ByteStream> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.endpoint(reference),
            reference.repository(),
            desc.digest
        );
        let response = self.request(reference, false, |c| c.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SarError::NotFound(format!("blob {}", desc.digest)));
        }
        if !response.status().is_success() {
            return Err(SarError::Io(format!(
                "blob fetch returned {}",
                response.status()
            )));
        }
        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(tokio_util::io::StreamReader::new(stream)))
    }

    async fn fetch_blob_range(
        &self,
        reference: &Reference,
        desc: &LayerDescriptor,
        offset: u64,
        length: u64,
    ) -> Result<ByteStream> {
        if length == 0 {
            return Ok(Box::new(tokio::io::empty()));
        }
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.endpoint(reference),
            reference.repository(),
            desc.digest
        );
        let end = offset + length - 1;
        let range = format!("bytes={}-{}", offset, end);
        let response = self
            .request(reference, false, |c| c.get(&url).header(header::RANGE, range))
            .await?;
        match response.status() {
            StatusCode::PARTIAL_CONTENT => {
                let content_range = response
                    .headers()
                    .get(header::CONTENT_RANGE)
                    .and_then(|h| h.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let expected = format!("bytes {}-{}/", offset, end);
                if !content_range.starts_with(&expected) {
                    return Err(SarError::RangeNotSupported(format!(
                        "Content-Range {:?} does not match requested {}-{}",
                        content_range, offset, end
                    )));
                }
                let stream = response.bytes_stream().map_err(std::io::Error::other);
                Ok(Box::new(tokio_util::io::StreamReader::new(stream)))
            }
            StatusCode::OK => Err(SarError::RangeNotSupported(
                "registry ignored the Range header".to_string(),
            )),
            StatusCode::NOT_FOUND => Err(SarError::NotFound(format!("blob {}", desc.digest))),
            StatusCode::RANGE_NOT_SATISFIABLE => Err(SarError::RangeNotSupported(format!(
                "range {}-{} not satisfiable",
                offset, end
            ))),
            other => Err(SarError::Io(format!("range fetch returned {}", other))),
        }
    }

    async fn fetch_manifest(&self, reference: &Reference) -> Result<(Vec<u8>, Digest)> {
        let (bytes, digest, _) = self.manifest_raw(reference).await?;
        Ok((bytes, digest))
    }

    async fn push_referrer(
        &self,
        reference: &Reference,
        subject: &Digest,
        data: Vec<u8>,
        artifact_type: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<Digest> {
        // The subject descriptor needs the manifest size.
        let (subject_bytes, _) = self
            .fetch_manifest(&reference.with_digest(subject.clone()))
            .await?;

        let payload_digest = Digest::from_bytes(&data);
        let payload_size = data.len() as u64;
        self.upload_blob(reference, &payload_digest, payload_size, data.into())
            .await?;

        let empty_config = b"{}".to_vec();
        let empty_digest = Digest::from_bytes(&empty_config);
        self.upload_blob(reference, &empty_digest, 2, empty_config.into())
            .await?;

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "artifactType": artifact_type,
            "config": {
                "mediaType": MEDIA_TYPE_EMPTY_CONFIG,
                "digest": empty_digest.as_str(),
                "size": 2,
            },
            "layers": [{
                "mediaType": artifact_type,
                "digest": payload_digest.as_str(),
                "size": payload_size,
            }],
            "subject": {
                "mediaType": MEDIA_TYPE_OCI_MANIFEST,
                "digest": subject.as_str(),
                "size": subject_bytes.len(),
            },
            "annotations": annotations,
        });
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let digest = Digest::from_bytes(&manifest_bytes);
        self.put_manifest(
            reference,
            &digest.to_string(),
            MEDIA_TYPE_OCI_MANIFEST,
            manifest_bytes,
        )
        .await
    }

    async fn fetch_referrers(
        &self,
        reference: &Reference,
        subject: &Digest,
        artifact_type: Option<&str>,
    ) -> Result<Vec<ReferrerInfo>> {
        let mut url = format!(
            "{}/v2/{}/referrers/{}",
            self.endpoint(reference),
            reference.repository(),
            subject
        );
        if let Some(filter) = artifact_type {
            url.push_str(&format!("?artifactType={}", filter));
        }
        let response = self.request(reference, false, |c| c.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(SarError::Io(format!(
                "referrers fetch returned {}",
                response.status()
            )));
        }
        let index: ManifestIndex = response
            .json()
            .await
            .map_err(|e| SarError::Io(format!("referrers response unreadable: {}", e)))?;
        let mut out = Vec::new();
        for entry in index.manifests {
            let Some(artifact_type) = entry.artifact_type else {
                continue;
            };
            out.push(ReferrerInfo {
                digest: Digest::parse(&entry.digest)?,
                artifact_type,
                annotations: entry.annotations.unwrap_or_default(),
            });
        }
        Ok(out)
    }

    async fn fetch_referrer(&self, reference: &Reference, referrer: &Digest) -> Result<Vec<u8>> {
        let (bytes, _) = self
            .fetch_manifest(&reference.with_digest(referrer.clone()))
            .await?;
        let manifest: ManifestDoc = serde_json::from_slice(&bytes)
            .map_err(|e| SarError::InvalidArchive(format!("referrer manifest unreadable: {}", e)))?;
        let layer = manifest
            .layers
            .first()
            .ok_or_else(|| SarError::NotFound(format!("referrer {} has no layers", referrer)))?;
        let desc = LayerDescriptor {
            digest: Digest::parse(&layer.digest)?,
            size: layer.size,
            media_type: layer.media_type.clone(),
            manifest_digest: referrer.clone(),
            platform: None,
        };
        let mut stream = self.fetch_blob(reference, &desc).await?;
        let mut bytes = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut bytes)
            .await
            .map_err(|e| SarError::Io(format!("referrer payload unreadable: {}", e)))?;
        // Keep the payload honest before handing it to a verifier.
        let mut hasher = Hasher::new();
        hasher.update(&bytes);
        if hasher.finish() != desc.digest {
            return Err(SarError::InvalidArchive(format!(
                "referrer payload digest mismatch for {}",
                referrer
            )));
        }
        Ok(bytes)
    }
}
