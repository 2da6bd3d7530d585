//! Command dispatch
//!
//! Turns parsed arguments into an [`AppConfig`], builds the client stack and
//! runs the requested operation. A Ctrl-C handler cancels the shared token so
//! every in-flight copy loop stops within its next check.

use crate::cli::args::{
    Args, CacheArgs, CacheCommands, CatArgs, Commands, CommonArgs, ListArgs, PullArgs, PushArgs,
};
use crate::cache::{BlobCache, PruneOptions};
use crate::client::{PullOptions, PushOptions};
use crate::compress::Codec;
use crate::config::AppConfig;
use crate::error::Result;
use crate::logging::Logger;
use crate::reference::Reference;
use crate::registry::auth::Credentials;
use crate::sar::toc::EntryKind;
use crate::validate::ExtractLimits;
use crate::vfs::DirFs;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct Runner {
    args: Args,
    cancel: CancellationToken,
}

impl Runner {
    pub fn new(args: Args) -> Self {
        Self {
            args,
            cancel: CancellationToken::new(),
        }
    }

    pub async fn run(self) -> Result<()> {
        self.args.validate()?;

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });

        match self.args.command {
            Commands::Push(args) => run_push(args, &self.cancel).await,
            Commands::Pull(args) => run_pull(args, &self.cancel).await,
            Commands::List(args) => run_list(args, &self.cancel).await,
            Commands::Cat(args) => run_cat(args, &self.cancel).await,
            Commands::Cache(args) => run_cache(args, &self.cancel).await,
        }
    }
}

fn config_from_common(common: &CommonArgs) -> AppConfig {
    AppConfig {
        cache_dir: if common.no_cache {
            None
        } else {
            Some(common.cache_dir.clone())
        },
        credentials: Credentials {
            username: common.username.clone(),
            password: common.password.clone(),
        },
        plain_http: common.plain_http,
        skip_tls: common.skip_tls,
        lazy_handles: common.lazy,
        verify_on_read: common.verify_on_read,
        ref_ttl: Duration::from_secs(common.ref_ttl),
        verify_key: common.verify_key.clone(),
        verbose: common.verbose,
        quiet: common.quiet,
        ..Default::default()
    }
}

async fn run_push(args: PushArgs, cancel: &CancellationToken) -> Result<()> {
    let mut config = config_from_common(&args.common);
    config.codec = Codec::parse(&args.compression)?;
    config.sign_key = args.sign_key.clone();
    let logger = config.logger();
    let client = config.build_client()?;

    let reference = Reference::parse(&args.reference)?;
    logger.section("Pushing archive");
    logger.step(&format!("{} -> {}", args.source.display(), reference));

    let options = PushOptions {
        codec: Some(config.codec),
        chunk_size: args.chunk_size,
        annotations: Default::default(),
    };
    let source = Arc::new(DirFs::new(&args.source));
    let report = client.push(&reference, source, &options, cancel).await?;

    logger.summary_kv(
        "Push complete",
        &[
            ("manifest", report.manifest_digest.to_string()),
            ("blob", report.blob_digest.to_string()),
            ("blob size", logger.format_size(report.blob_size)),
            ("toc", report.toc_digest.to_string()),
            ("diff-id", report.uncompressed_digest.to_string()),
        ],
    );
    if let Some(signature) = &report.signature_digest {
        logger.success(&format!("signed: referrer {}", signature.short()));
    }
    Ok(())
}

async fn run_pull(args: PullArgs, cancel: &CancellationToken) -> Result<()> {
    let config = config_from_common(&args.common);
    let logger = config.logger();
    let client = config.build_client()?;

    let reference = Reference::parse(&args.reference)?;
    logger.section("Pulling archive");
    logger.step(&format!("{} -> {}", reference, args.dest.display()));

    let options = PullOptions {
        limits: ExtractLimits {
            max_files: args.max_files,
            max_total_size: args.max_total_size,
            max_file_size: args.max_file_size,
        },
    };
    let report = client.pull(&reference, &args.dest, &options, cancel).await?;

    logger.summary_kv(
        "Pull complete",
        &[
            ("blob", report.descriptor.digest.to_string()),
            ("files", report.stats.files.to_string()),
            ("directories", report.stats.directories.to_string()),
            ("symlinks", report.stats.symlinks.to_string()),
            ("bytes", logger.format_size(report.stats.bytes)),
        ],
    );
    Ok(())
}

async fn run_list(args: ListArgs, cancel: &CancellationToken) -> Result<()> {
    let config = config_from_common(&args.common);
    let client = config.build_client()?;

    let reference = Reference::parse(&args.reference)?;
    let image = client.open(&reference, cancel).await?;
    for entry in image.list()? {
        if args.long {
            let kind = match entry.kind {
                EntryKind::Regular => "-",
                EntryKind::Directory => "d",
                EntryKind::Symlink => "l",
                EntryKind::Hardlink => "h",
                EntryKind::CharDevice => "c",
                EntryKind::BlockDevice => "b",
                EntryKind::Fifo => "p",
            };
            let linkname = entry
                .linkname
                .as_deref()
                .map(|t| format!(" -> {}", t))
                .unwrap_or_default();
            println!(
                "{}{:04o} {:>10} {}{}",
                kind,
                entry.mode & 0o7777,
                entry.size,
                entry.name,
                linkname
            );
        } else {
            println!("{}", entry.name);
        }
    }
    image.close()
}

async fn run_cat(args: CatArgs, cancel: &CancellationToken) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let config = config_from_common(&args.common);
    let client = config.build_client()?;

    let reference = Reference::parse(&args.reference)?;
    let image = client.open(&reference, cancel).await?;
    let mut file = image.open(&args.path)?;
    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        stdout
            .write_all(&buf[..n])
            .await
            .map_err(crate::error::SarError::from)?;
    }
    stdout.flush().await.map_err(crate::error::SarError::from)?;
    drop(file);
    image.close()
}

async fn run_cache(args: CacheArgs, cancel: &CancellationToken) -> Result<()> {
    let logger = if args.quiet {
        Logger::new_quiet()
    } else {
        Logger::new(args.verbose)
    };
    let cache = BlobCache::new(&args.cache_dir)?.with_logger(logger.clone());

    match args.command {
        CacheCommands::List => {
            let mut entries = cache.entries()?;
            entries.sort_by(|a, b| a.last_accessed.cmp(&b.last_accessed));
            for entry in entries {
                println!(
                    "{}  {:>12}  complete={} verified={}  last-accessed={}",
                    entry.digest,
                    logger.format_size(entry.size),
                    entry.complete,
                    entry.verified,
                    entry.last_accessed.to_rfc3339()
                );
            }
            Ok(())
        }
        CacheCommands::Clear => {
            cache.clear()?;
            logger.success("cache cleared");
            Ok(())
        }
        CacheCommands::Prune(prune) => {
            let report = cache
                .prune(
                    PruneOptions {
                        max_age: prune.max_age.map(Duration::from_secs),
                        max_size: prune.max_size,
                    },
                    cancel,
                )
                .await?;
            logger.summary_kv(
                "Prune complete",
                &[
                    ("removed", report.removed.to_string()),
                    ("freed", logger.format_size(report.freed_bytes)),
                    ("remaining", logger.format_size(report.remaining_bytes)),
                ],
            );
            Ok(())
        }
    }
}
