//! Error types for archive, cache and registry operations
//!
//! Every fallible operation in the crate returns [`Result`]. The variants map
//! one-to-one onto the failure kinds surfaced to users: reference syntax,
//! missing resources, authentication, malformed archives, traversal attempts,
//! extraction limits, range support, signature outcomes, closed handles,
//! cancellation and transient I/O.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SarError>;

#[derive(Debug, Clone, Error)]
pub enum SarError {
    /// Reference syntactically malformed or empty
    #[error("invalid reference: {0}")]
    InvalidRef(String),
    /// Image, manifest, blob, file or referrer absent
    #[error("not found: {0}")]
    NotFound(String),
    /// Credentials missing, rejected or forbidden
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Footer or TOC unreadable, tar stream malformed, digest mismatch
    #[error("invalid archive: {0}")]
    InvalidArchive(String),
    /// Validator rejected an entry name or link target
    #[error("path traversal: {0}")]
    PathTraversal(String),
    /// Extraction limit breached, negative size or overflow
    #[error("extraction limits: {0}")]
    ExtractLimits(String),
    /// Registry ignored or rejected a byte-range request
    #[error("range not supported: {0}")]
    RangeNotSupported(String),
    /// No signature referrer attached to the image
    #[error("no signature: {0}")]
    NoSignature(String),
    /// Signature referrers present but none verified
    #[error("signature invalid: {0}")]
    SignatureInvalid(String),
    /// Operation on a closed image or blob handle
    #[error("closed: {0}")]
    Closed(String),
    /// Caller-cancelled operation
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// Source filesystem unusable for building (e.g. hardlinks, no readlink)
    #[error("invalid source: {0}")]
    InvalidSource(String),
    /// Other I/O, retryable at caller discretion
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for SarError {
    fn from(err: std::io::Error) -> Self {
        // Errors that crossed the sync/async bridge come back wrapped; unwrap
        // them instead of flattening to an I/O string.
        if err.get_ref().is_some_and(|inner| inner.is::<SarError>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(sar) = inner.downcast::<SarError>() {
                    return *sar;
                }
            }
            return SarError::Io("wrapped error lost in transit".to_string());
        }
        match err.kind() {
            std::io::ErrorKind::NotFound => SarError::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => {
                SarError::Unauthorized(format!("permission denied: {}", err))
            }
            _ => SarError::Io(err.to_string()),
        }
    }
}

impl From<SarError> for std::io::Error {
    fn from(err: SarError) -> Self {
        std::io::Error::other(err)
    }
}

impl From<serde_json::Error> for SarError {
    fn from(err: serde_json::Error) -> Self {
        SarError::InvalidArchive(format!("JSON parsing failed: {}", err))
    }
}

impl From<reqwest::Error> for SarError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SarError::Io(format!("network request timed out: {}", err))
        } else if err.is_connect() {
            SarError::Io(format!("connection failed: {}", err))
        } else {
            SarError::Io(err.to_string())
        }
    }
}

impl From<url::ParseError> for SarError {
    fn from(err: url::ParseError) -> Self {
        SarError::InvalidRef(format!("invalid registry URL: {}", err))
    }
}

impl SarError {
    /// Attach context to the message while keeping the error kind
    pub fn context(self, context: &str) -> Self {
        match self {
            SarError::InvalidRef(msg) => SarError::InvalidRef(format!("{}: {}", context, msg)),
            SarError::NotFound(msg) => SarError::NotFound(format!("{}: {}", context, msg)),
            SarError::Unauthorized(msg) => SarError::Unauthorized(format!("{}: {}", context, msg)),
            SarError::InvalidArchive(msg) => {
                SarError::InvalidArchive(format!("{}: {}", context, msg))
            }
            SarError::PathTraversal(msg) => SarError::PathTraversal(format!("{}: {}", context, msg)),
            SarError::ExtractLimits(msg) => SarError::ExtractLimits(format!("{}: {}", context, msg)),
            SarError::RangeNotSupported(msg) => {
                SarError::RangeNotSupported(format!("{}: {}", context, msg))
            }
            SarError::NoSignature(msg) => SarError::NoSignature(format!("{}: {}", context, msg)),
            SarError::SignatureInvalid(msg) => {
                SarError::SignatureInvalid(format!("{}: {}", context, msg))
            }
            SarError::Closed(msg) => SarError::Closed(format!("{}: {}", context, msg)),
            SarError::Cancelled(msg) => SarError::Cancelled(format!("{}: {}", context, msg)),
            SarError::InvalidSource(msg) => SarError::InvalidSource(format!("{}: {}", context, msg)),
            SarError::Io(msg) => SarError::Io(format!("{}: {}", context, msg)),
        }
    }

    /// True for cancellation, which must never be swallowed or retried
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SarError::Cancelled(_))
    }
}
