//! Sarball
//!
//! `sarball` stores and retrieves arbitrary file trees as single-layer
//! artifacts in OCI container registries. Trees are packaged as seekable
//! archives: a tar stream cut into independently decompressible compressed
//! frames, indexed by an embedded table of contents and terminated by a fixed
//! footer. Consumers can list contents without downloading the payload,
//! stream single files via byte-range fetches, or extract whole trees with
//! bounded safety.
//!
//! ## Main modules
//! - [`cli`] - Command-line interface and argument parsing.
//! - [`config`] - Flag-driven application configuration.
//! - [`digest`] - SHA-256 digest type and streaming hashers.
//! - [`reference`] - Image reference parsing and validation.
//! - [`validate`] - Lexical path, extraction and symlink validation.
//! - [`compress`] - Frame codecs (gzip, zstd) with magic sniffing.
//! - [`vfs`] - Virtual filesystem sources for the builder.
//! - [`sar`] - Seekable archive format: footer, TOC, builder, reader.
//! - [`extract`] - Safe streaming extraction with limits.
//! - [`cache`] - Content-addressed blob cache with resumable downloads.
//! - [`registry`] - Registry collaborator trait and the HTTP adapter.
//! - [`sign`] - Signer/verifier interfaces and signature media types.
//! - [`client`] - Open/pull/push orchestration.
//! - [`logging`] - Output control.
//!
//! ## Example
//!
//! ```no_run
//! use sarball::client::{Client, PullOptions};
//! use sarball::reference::Reference;
//! use sarball::registry::http::{HttpRegistry, HttpRegistryOptions};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> sarball::error::Result<()> {
//! let registry = Arc::new(HttpRegistry::new(HttpRegistryOptions::default())?);
//! let client = Client::builder().with_registry(registry).build()?;
//! let reference = Reference::parse("registry.example.com/team/tree:v1")?;
//! let cancel = CancellationToken::new();
//! client
//!     .pull(&reference, std::path::Path::new("out"), &PullOptions::default(), &cancel)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod cli;
pub mod client;
pub mod compress;
pub mod config;
pub mod digest;
pub mod error;
pub mod extract;
pub mod logging;
pub mod reference;
pub mod registry;
pub mod sar;
pub mod sign;
pub mod validate;
pub mod vfs;

pub use client::{Client, Image};
pub use digest::Digest;
pub use error::{Result, SarError};
pub use logging::Logger;
pub use reference::Reference;
