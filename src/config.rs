//! Application configuration assembled from CLI flags
//!
//! No configuration files are read; everything arrives through arguments and
//! environment variables. [`AppConfig`] validates the combination and builds
//! the client stack (registry adapter, optional cache, optional signer or
//! verifier).

use crate::cache::BlobCache;
use crate::client::{Client, ClientBuilder};
use crate::compress::Codec;
use crate::error::{Result, SarError};
use crate::logging::Logger;
use crate::registry::auth::Credentials;
use crate::registry::http::{HttpRegistry, HttpRegistryOptions};
use crate::sign::SharedKeySigner;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CACHE_DIR: &str = ".cache/sarball";
pub const DEFAULT_REF_TTL_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub cache_dir: Option<PathBuf>,
    pub credentials: Credentials,
    pub plain_http: bool,
    pub skip_tls: bool,
    pub codec: Codec,
    pub lazy_handles: bool,
    pub ref_ttl: Duration,
    pub sign_key: Option<String>,
    pub verify_key: Option<String>,
    pub verify_on_read: bool,
    pub verbose: bool,
    pub quiet: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache_dir: Some(PathBuf::from(DEFAULT_CACHE_DIR)),
            credentials: Credentials::default(),
            plain_http: false,
            skip_tls: false,
            codec: Codec::Gzip,
            lazy_handles: false,
            ref_ttl: Duration::from_secs(DEFAULT_REF_TTL_SECS),
            sign_key: None,
            verify_key: None,
            verify_on_read: false,
            verbose: false,
            quiet: false,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.verbose && self.quiet {
            return Err(SarError::InvalidRef(
                "cannot be both verbose and quiet".to_string(),
            ));
        }
        if let (Some(user), None) = (&self.credentials.username, &self.credentials.password) {
            return Err(SarError::Unauthorized(format!(
                "username {} given without a password",
                user
            )));
        }
        Ok(())
    }

    pub fn logger(&self) -> Logger {
        if self.quiet {
            Logger::new_quiet()
        } else {
            Logger::new(self.verbose)
        }
    }

    /// Assemble the full client stack
    pub fn build_client(&self) -> Result<Client> {
        self.validate()?;
        let logger = self.logger();

        let registry = Arc::new(HttpRegistry::new(HttpRegistryOptions {
            plain_http: self.plain_http,
            skip_tls_verify: self.skip_tls,
            credentials: self.credentials.clone(),
        })?);

        let mut builder: ClientBuilder = Client::builder()
            .with_registry(registry)
            .with_logger(logger.clone())
            .with_lazy_handles(self.lazy_handles)
            .with_ref_ttl(self.ref_ttl);

        if let Some(dir) = &self.cache_dir {
            let cache = BlobCache::new(dir)?
                .with_logger(logger)
                .with_verify_on_read(self.verify_on_read);
            builder = builder.with_cache(cache);
        }
        if let Some(key) = &self.sign_key {
            builder = builder.with_signer(Arc::new(SharedKeySigner::new(key.as_bytes().to_vec())));
        }
        if let Some(key) = &self.verify_key {
            builder = builder.with_verifier(Arc::new(SharedKeySigner::new(key.as_bytes().to_vec())));
        }
        builder.build()
    }
}
