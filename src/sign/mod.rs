//! Signing and verification interfaces
//!
//! The cryptographic backends are delegated: the orchestration layer only
//! needs [`Signer`] to produce a signature artifact for a manifest and
//! [`Verifier`] to accept or reject one. Signature referrers are recognized
//! by a fixed allow-list of media types; SBOMs and attestations are not
//! signatures.
//!
//! [`SharedKeySigner`] is the built-in keyed-hash backend for development and
//! tests; production deployments plug in a real sigstore or notation
//! implementation behind the same traits.

use crate::digest::Digest;
use crate::error::{Result, SarError};
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};

/// Preferred signature artifact type
pub const SIGSTORE_BUNDLE_MEDIA_TYPE: &str = "application/vnd.dev.sigstore.bundle.v0.3+json";

/// All recognized signature media types
pub const SIGNATURE_MEDIA_TYPES: &[&str] = &[
    SIGSTORE_BUNDLE_MEDIA_TYPE,
    "application/vnd.dev.cosign.simplesigning.v1+json",
    "application/vnd.cncf.notary.signature",
];

/// True only for the fixed allow-list of signature artifact types
pub fn is_signature_artifact_type(media_type: &str) -> bool {
    SIGNATURE_MEDIA_TYPES.contains(&media_type)
}

/// Produces a signature artifact over manifest bytes
pub trait Signer: Send + Sync {
    fn sign(&self, manifest_digest: &Digest, manifest: &[u8]) -> Result<Vec<u8>>;

    /// Artifact type the produced signatures should be pushed under
    fn artifact_type(&self) -> &str {
        SIGSTORE_BUNDLE_MEDIA_TYPE
    }
}

/// Accepts or rejects a signature artifact over manifest bytes
pub trait Verifier: Send + Sync {
    fn verify(&self, manifest_digest: &Digest, manifest: &[u8], signature: &[u8]) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SharedKeyEnvelope {
    manifest_digest: String,
    tag: String,
}

/// Keyed-SHA256 signer for development and tests. Not a substitute for a
/// real signature scheme: anyone holding the key can sign.
#[derive(Clone)]
pub struct SharedKeySigner {
    key: Vec<u8>,
}

impl SharedKeySigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn tag(&self, manifest_digest: &Digest, manifest: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update(manifest_digest.as_str().as_bytes());
        hasher.update(manifest);
        hex::encode(hasher.finalize())
    }
}

impl Signer for SharedKeySigner {
    fn sign(&self, manifest_digest: &Digest, manifest: &[u8]) -> Result<Vec<u8>> {
        let envelope = SharedKeyEnvelope {
            manifest_digest: manifest_digest.to_string(),
            tag: self.tag(manifest_digest, manifest),
        };
        serde_json::to_vec(&envelope)
            .map_err(|e| SarError::Io(format!("signature encode failed: {}", e)))
    }
}

impl Verifier for SharedKeySigner {
    fn verify(&self, manifest_digest: &Digest, manifest: &[u8], signature: &[u8]) -> Result<()> {
        let envelope: SharedKeyEnvelope = serde_json::from_slice(signature)
            .map_err(|e| SarError::SignatureInvalid(format!("signature unreadable: {}", e)))?;
        if envelope.manifest_digest != manifest_digest.as_str() {
            return Err(SarError::SignatureInvalid(format!(
                "signature covers {}, not {}",
                envelope.manifest_digest, manifest_digest
            )));
        }
        if envelope.tag != self.tag(manifest_digest, manifest) {
            return Err(SarError::SignatureInvalid(
                "signature tag does not match key".to_string(),
            ));
        }
        Ok(())
    }
}
