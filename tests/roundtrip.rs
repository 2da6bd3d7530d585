//! End-to-end push/pull round trips against the in-memory registry

mod common;

use common::{MockRegistry, sample_tree};
use sarball::cache::BlobCache;
use sarball::client::{Client, PullOptions, PushOptions};
use sarball::compress::Codec;
use sarball::error::SarError;
use sarball::reference::Reference;
use sarball::validate::ExtractLimits;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn client_with_cache(registry: &Arc<MockRegistry>, cache_root: &std::path::Path) -> Client {
    let registry: Arc<dyn sarball::registry::Registry> = Arc::clone(registry) as Arc<dyn sarball::registry::Registry>;
    Client::builder()
        .with_registry(registry)
        .with_cache(BlobCache::new(cache_root).unwrap())
        .build()
        .unwrap()
}

fn push_options(codec: Codec) -> PushOptions {
    PushOptions {
        codec: Some(codec),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_push_pull_round_trip_gzip() {
    round_trip(Codec::Gzip, "localhost:5000/test/gzip:v1").await;
}

#[tokio::test]
async fn test_push_pull_round_trip_zstd() {
    round_trip(Codec::Zstd, "localhost:5000/test/zstd:v1").await;
}

async fn round_trip(codec: Codec, reference: &str) {
    use std::os::unix::fs::PermissionsExt;

    let registry = Arc::new(MockRegistry::new());
    let cache = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let client = client_with_cache(&registry, cache.path());
    let reference = Reference::parse(reference).unwrap();
    let cancel = CancellationToken::new();

    let report = client
        .push(
            &reference,
            Arc::new(sample_tree()),
            &push_options(codec),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(report.blob_size, registry.blob_size(&report.blob_digest));

    let pull = client
        .pull(&reference, dest.path(), &PullOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(pull.stats.files, 3);
    assert_eq!(pull.descriptor.digest, report.blob_digest);

    assert_eq!(
        std::fs::read(dest.path().join("hello.txt")).unwrap(),
        b"Hello, World!"
    );
    assert_eq!(
        std::fs::read(dest.path().join("subdir/nested.txt")).unwrap(),
        b"Nested"
    );
    assert_eq!(
        std::fs::read(dest.path().join("binary.bin")).unwrap(),
        vec![0x00, 0x01, 0x02, 0x03, 0xFF, 0xFE, 0xFD]
    );
    for file in ["hello.txt", "subdir/nested.txt", "binary.bin"] {
        let mode = std::fs::metadata(dest.path().join(file))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o7777, 0o644, "mode of {}", file);
    }
}

#[tokio::test]
async fn test_uncompressed_digest_stable_across_codecs() {
    let registry = Arc::new(MockRegistry::new());
    let cache = tempfile::tempdir().unwrap();
    let client = client_with_cache(&registry, cache.path());
    let cancel = CancellationToken::new();

    let gzip_ref = Reference::parse("localhost:5000/stability/a:gzip").unwrap();
    let zstd_ref = Reference::parse("localhost:5000/stability/a:zstd").unwrap();
    let gzip = client
        .push(&gzip_ref, Arc::new(sample_tree()), &push_options(Codec::Gzip), &cancel)
        .await
        .unwrap();
    let zstd = client
        .push(&zstd_ref, Arc::new(sample_tree()), &push_options(Codec::Zstd), &cancel)
        .await
        .unwrap();

    assert_eq!(gzip.uncompressed_digest, zstd.uncompressed_digest);
    assert_eq!(gzip.toc_digest, zstd.toc_digest);
    assert_ne!(gzip.blob_digest, zstd.blob_digest);
}

#[tokio::test]
async fn test_pull_without_cache() {
    let registry = Arc::new(MockRegistry::new());
    let dest = tempfile::tempdir().unwrap();
    let registry_dyn: Arc<dyn sarball::registry::Registry> = Arc::clone(&registry) as Arc<dyn sarball::registry::Registry>;
    let client = Client::builder().with_registry(registry_dyn).build().unwrap();
    let reference = Reference::parse("localhost:5000/nocache/tree:v1").unwrap();
    let cancel = CancellationToken::new();

    client
        .push(&reference, Arc::new(sample_tree()), &PushOptions::default(), &cancel)
        .await
        .unwrap();
    let report = client
        .pull(&reference, dest.path(), &PullOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(report.stats.files, 3);
    assert!(dest.path().join("hello.txt").is_file());
}

#[tokio::test]
async fn test_pull_with_max_files_limit() {
    let registry = Arc::new(MockRegistry::new());
    let cache = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let client = client_with_cache(&registry, cache.path());
    let reference = Reference::parse("localhost:5000/limits/tree:v1").unwrap();
    let cancel = CancellationToken::new();

    let mut fs = sarball::vfs::MemFs::new();
    for i in 0..20 {
        fs.add_file(&format!("file{:02}.dat", i), vec![b'x'; 100], 0o644);
    }
    client
        .push(&reference, Arc::new(fs), &PushOptions::default(), &cancel)
        .await
        .unwrap();

    let options = PullOptions {
        limits: ExtractLimits {
            max_files: 5,
            ..Default::default()
        },
    };
    let err = client
        .pull(&reference, dest.path(), &options, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, SarError::ExtractLimits(_)));
    let created = std::fs::read_dir(dest.path()).unwrap().count();
    assert!(created <= 5, "extraction created {} files", created);
}

#[tokio::test]
async fn test_pull_rejects_traversal_archive() {
    let registry = Arc::new(MockRegistry::new());
    let cache = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let client = client_with_cache(&registry, cache.path());
    let reference = Reference::parse("localhost:5000/hostile/tree:v1").unwrap();
    let cancel = CancellationToken::new();

    // Hand-rolled tar entry named "../escape.txt", gzip-framed like a layer.
    let mut header = tar::Header::new_gnu();
    {
        let name = b"../escape.txt";
        let gnu = header.as_gnu_mut().unwrap();
        gnu.name[..name.len()].copy_from_slice(name);
    }
    header.set_size(5);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    let mut tar_bytes = Vec::new();
    tar_bytes.extend_from_slice(header.as_bytes());
    tar_bytes.extend_from_slice(b"pwned");
    tar_bytes.resize(1024, 0);
    tar_bytes.extend_from_slice(&[0u8; 1024]);
    let blob = Codec::Gzip.compress_frame(&tar_bytes).unwrap();
    registry.insert_layer(
        &reference,
        blob,
        "application/vnd.sarball.layer.v1.tar+gzip",
    );

    let err = client
        .pull(&reference, dest.path(), &PullOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, SarError::PathTraversal(_)));
    assert!(std::fs::read_dir(dest.path()).unwrap().next().is_none());
    assert!(!dest.path().parent().unwrap().join("escape.txt").exists());
}

#[tokio::test]
async fn test_pull_detects_corrupted_blob() {
    let registry = Arc::new(MockRegistry::new());
    let cache = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();
    let client = client_with_cache(&registry, cache.path());
    let reference = Reference::parse("localhost:5000/corrupt/tree:v1").unwrap();
    let cancel = CancellationToken::new();

    // Build a valid blob, then corrupt one byte before publishing it.
    let builder = sarball::sar::builder::SarBuilder::new(Default::default());
    let mut result = builder.build(&sample_tree(), &cancel).unwrap();
    let mut blob = Vec::new();
    std::io::Read::read_to_end(&mut result.blob, &mut blob).unwrap();
    let flip = blob.len() / 2;
    blob[flip] ^= 0xff;
    registry.insert_layer(
        &reference,
        blob,
        "application/vnd.sarball.layer.v1.tar+gzip",
    );

    let err = client
        .pull(&reference, dest.path(), &PullOptions::default(), &cancel)
        .await
        .unwrap_err();
    // Either the stream-level digest check or the tar decoder trips; both
    // surface as an invalid archive.
    assert!(
        matches!(err, SarError::InvalidArchive(_) | SarError::Io(_)),
        "unexpected error: {:?}",
        err
    );
}
