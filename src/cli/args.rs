//! Command line argument parsing and validation

use crate::error::{Result, SarError};
use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "sarball",
    version,
    about = "Store and retrieve file trees as seekable archives in OCI registries",
    long_about = "Push directory trees to an OCI registry as single-layer seekable archives, \
                  list and read single files without downloading the whole blob, and pull \
                  complete trees with safe extraction and a resumable local cache."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Build an archive from a directory and push it
    Push(PushArgs),

    /// Pull an image and extract it into a directory
    Pull(PullArgs),

    /// List the contents of an image without pulling it
    List(ListArgs),

    /// Print one file from an image to stdout
    Cat(CatArgs),

    /// Inspect and maintain the local blob cache
    Cache(CacheArgs),
}

impl Args {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn validate(&self) -> Result<()> {
        match &self.command {
            Commands::Push(args) => args.validate(),
            Commands::Pull(args) => args.validate(),
            Commands::List(args) => args.common.validate(),
            Commands::Cat(args) => args.validate(),
            Commands::Cache(args) => args.validate(),
        }
    }
}

/// Flags shared by every registry-facing command
#[derive(ClapArgs, Debug, Clone)]
pub struct CommonArgs {
    /// Registry username
    #[arg(short, long)]
    pub username: Option<String>,

    /// Registry password
    #[arg(short, long)]
    pub password: Option<String>,

    /// Use plain HTTP instead of HTTPS
    #[arg(long, action = ArgAction::SetTrue)]
    pub plain_http: bool,

    /// Skip TLS certificate verification
    #[arg(long, action = ArgAction::SetTrue)]
    pub skip_tls: bool,

    /// Cache directory
    #[arg(long, default_value = crate::config::DEFAULT_CACHE_DIR)]
    pub cache_dir: PathBuf,

    /// Bypass the local blob cache
    #[arg(long, action = ArgAction::SetTrue)]
    pub no_cache: bool,

    /// Seconds a cached descriptor may answer for a tag
    #[arg(long, default_value_t = crate::config::DEFAULT_REF_TTL_SECS)]
    pub ref_ttl: u64,

    /// Fetch blobs by byte range on demand instead of eagerly
    #[arg(long, action = ArgAction::SetTrue)]
    pub lazy: bool,

    /// Re-hash cached blobs on every use
    #[arg(long, action = ArgAction::SetTrue)]
    pub verify_on_read: bool,

    /// Verify images against this shared key before use
    #[arg(long)]
    pub verify_key: Option<String>,

    /// Enable verbose output
    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Only print errors
    #[arg(short, long, action = ArgAction::SetTrue)]
    pub quiet: bool,
}

impl CommonArgs {
    pub fn validate(&self) -> Result<()> {
        if self.verbose && self.quiet {
            return Err(SarError::InvalidRef(
                "cannot combine --verbose and --quiet".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct PushArgs {
    /// Target reference, e.g. localhost:5000/team/tree:v1
    pub reference: String,

    /// Directory to archive
    pub source: PathBuf,

    /// Compression codec: gzip or zstd
    #[arg(long, default_value = "gzip")]
    pub compression: String,

    /// Uncompressed chunk size in bytes for sub-file random access
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Sign the pushed manifest with this shared key
    #[arg(long)]
    pub sign_key: Option<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl PushArgs {
    pub fn validate(&self) -> Result<()> {
        self.common.validate()?;
        crate::compress::Codec::parse(&self.compression)?;
        if !self.source.is_dir() {
            return Err(SarError::InvalidSource(format!(
                "source {} is not a directory",
                self.source.display()
            )));
        }
        if let Some(chunk_size) = self.chunk_size {
            if chunk_size < 4096 {
                return Err(SarError::InvalidSource(format!(
                    "chunk size {} is below the 4 KiB minimum",
                    chunk_size
                )));
            }
        }
        Ok(())
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct PullArgs {
    /// Source reference
    pub reference: String,

    /// Destination directory
    pub dest: PathBuf,

    /// Maximum number of regular files (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_files: u64,

    /// Maximum total extracted bytes (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_total_size: u64,

    /// Maximum size of any single file (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub max_file_size: u64,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl PullArgs {
    pub fn validate(&self) -> Result<()> {
        self.common.validate()
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct ListArgs {
    /// Reference to list
    pub reference: String,

    /// Long listing with sizes and modes
    #[arg(short, long, action = ArgAction::SetTrue)]
    pub long: bool,

    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(ClapArgs, Debug, Clone)]
pub struct CatArgs {
    /// Reference to read from
    pub reference: String,

    /// Path of the file inside the image
    pub path: String,

    #[command(flatten)]
    pub common: CommonArgs,
}

impl CatArgs {
    pub fn validate(&self) -> Result<()> {
        self.common.validate()?;
        if self.path.is_empty() {
            return Err(SarError::NotFound("empty path to cat".to_string()));
        }
        Ok(())
    }
}

#[derive(ClapArgs, Debug, Clone)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: CacheCommands,

    /// Cache directory
    #[arg(long, default_value = crate::config::DEFAULT_CACHE_DIR)]
    pub cache_dir: PathBuf,

    /// Enable verbose output
    #[arg(short, long, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Only print errors
    #[arg(short, long, action = ArgAction::SetTrue)]
    pub quiet: bool,
}

impl CacheArgs {
    pub fn validate(&self) -> Result<()> {
        if self.verbose && self.quiet {
            return Err(SarError::InvalidRef(
                "cannot combine --verbose and --quiet".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum CacheCommands {
    /// Show cached blobs
    List,

    /// Delete the whole cache
    Clear,

    /// Evict by age and size
    Prune(PruneArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct PruneArgs {
    /// Evict entries unused for this many seconds
    #[arg(long)]
    pub max_age: Option<u64>,

    /// Shrink the cache to at most this many bytes
    #[arg(long)]
    pub max_size: Option<u64>,
}
