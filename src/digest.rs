//! SHA-256 digest type and streaming hashers
//!
//! Digests are strings of the form `algo:hex`; only `sha256` is supported.
//! All blob, TOC and diff-id identities in the crate flow through [`Digest`],
//! and every bulk copy path keeps a running [`Hasher`] over the same bytes it
//! moves so no second pass is ever needed.

use crate::error::{Result, SarError};
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use std::fmt;
use std::io::Read;

pub const SHA256_ALGO: &str = "sha256";

/// Content identity of the form `sha256:<64 hex chars>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse and validate an `algo:hex` string
    pub fn parse(s: &str) -> Result<Self> {
        let (algo, hex_part) = s
            .split_once(':')
            .ok_or_else(|| SarError::InvalidRef(format!("digest missing algorithm: {}", s)))?;
        if algo != SHA256_ALGO {
            return Err(SarError::InvalidRef(format!(
                "unsupported digest algorithm: {}",
                algo
            )));
        }
        if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SarError::InvalidRef(format!(
                "invalid sha256 hex in digest: {}",
                s
            )));
        }
        Ok(Digest(format!("{}:{}", algo, hex_part.to_ascii_lowercase())))
    }

    /// Compute the digest of a byte slice
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Digest(format!("{}:{}", SHA256_ALGO, hex::encode(hash)))
    }

    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or(SHA256_ALGO)
    }

    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, h)| h).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Truncated form for log lines
    pub fn short(&self) -> &str {
        let s = self.as_str();
        if s.len() > 19 { &s[..19] } else { s }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = SarError;

    fn try_from(s: String) -> Result<Self> {
        Digest::parse(&s)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

/// Streaming SHA-256 accumulator
pub struct Hasher {
    inner: Sha256,
    count: u64,
}

impl Hasher {
    pub fn new() -> Self {
        Self {
            inner: Sha256::new(),
            count: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.count += data.len() as u64;
    }

    /// Total bytes hashed so far
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn finish(self) -> Digest {
        Digest(format!(
            "{}:{}",
            SHA256_ALGO,
            hex::encode(self.inner.finalize())
        ))
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader adapter that hashes every byte passing through it
pub struct DigestReader<R: Read> {
    inner: R,
    hasher: Hasher,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.hasher.count()
    }

    pub fn finish(self) -> Digest {
        self.hasher.finish()
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Verify a full byte slice against an expected digest
pub fn verify_bytes(data: &[u8], expected: &Digest) -> Result<()> {
    let actual = Digest::from_bytes(data);
    if &actual != expected {
        return Err(SarError::InvalidArchive(format!(
            "digest mismatch: expected {}, computed {}",
            expected, actual
        )));
    }
    Ok(())
}
