//! Registry collaborator interface
//!
//! The core never speaks the distribution wire protocol itself; it calls a
//! [`Registry`] implementation. [`http::HttpRegistry`] is the bundled adapter
//! for real registries, and the test suite substitutes an in-memory mock.

pub mod auth;
pub mod http;

use crate::digest::Digest;
use crate::error::Result;
use crate::reference::Reference;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Resolved identity of a single layer blob
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LayerDescriptor {
    pub digest: Digest,
    pub size: u64,
    pub media_type: String,
    /// Digest of the manifest the layer was resolved from
    pub manifest_digest: Digest,
    /// Platform tag, e.g. `linux/amd64`, when resolved through an index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

/// Everything a push needs besides the blob bytes
#[derive(Debug, Clone)]
pub struct PushMetadata {
    pub media_type: String,
    pub annotations: BTreeMap<String, String>,
    pub toc_digest: Digest,
    /// Diff-id of the uncompressed tar stream
    pub uncompressed_digest: Digest,
    pub blob_digest: Digest,
    pub blob_size: u64,
}

/// A referrer manifest attached to a subject digest
#[derive(Debug, Clone)]
pub struct ReferrerInfo {
    pub digest: Digest,
    pub artifact_type: String,
    pub annotations: BTreeMap<String, String>,
}

/// Streamed blob bytes
pub type ByteStream = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Abstract OCI registry operations used by the core
#[async_trait]
pub trait Registry: Send + Sync {
    /// Upload the blob, its config and a single-layer manifest; returns the
    /// manifest digest. The TOC digest lands in a layer annotation and the
    /// uncompressed digest becomes the rootfs diff-id.
    async fn push(
        &self,
        reference: &Reference,
        blob: ByteStream,
        meta: &PushMetadata,
    ) -> Result<Digest>;

    /// Convenience single-layer fetch: stream plus declared size
    async fn pull(&self, reference: &Reference) -> Result<(ByteStream, u64)>;

    /// Resolve the one layer of the referenced image; multi-layer manifests
    /// are an error
    async fn resolve_layer(&self, reference: &Reference) -> Result<LayerDescriptor>;

    async fn fetch_blob(
        &self,
        reference: &Reference,
        desc: &LayerDescriptor,
    ) -> Result<ByteStream>;

    /// Fetch `[offset, offset + length)`; returns `RangeNotSupported` when
    /// the registry ignores range requests
    async fn fetch_blob_range(
        &self,
        reference: &Reference,
        desc: &LayerDescriptor,
        offset: u64,
        length: u64,
    ) -> Result<ByteStream>;

    /// Raw manifest bytes and their digest
    async fn fetch_manifest(&self, reference: &Reference) -> Result<(Vec<u8>, Digest)>;

    /// Attach an artifact to `subject`; returns the referrer manifest digest
    async fn push_referrer(
        &self,
        reference: &Reference,
        subject: &Digest,
        data: Vec<u8>,
        artifact_type: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<Digest>;

    /// List referrers of `subject`, optionally filtered by artifact type
    async fn fetch_referrers(
        &self,
        reference: &Reference,
        subject: &Digest,
        artifact_type: Option<&str>,
    ) -> Result<Vec<ReferrerInfo>>;

    /// First-layer payload of a referrer manifest
    async fn fetch_referrer(&self, reference: &Reference, referrer: &Digest) -> Result<Vec<u8>>;
}
