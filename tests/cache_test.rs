//! Blob cache behavior: pass-through, resume, idempotence, eviction

mod common;

use common::{MockRegistry, large_tree};
use sarball::cache::{BlobCache, PruneOptions};
use sarball::client::{Client, PushOptions};
use sarball::compress::Codec;
use sarball::digest::Hasher;
use sarball::reference::Reference;
use sarball::registry::{LayerDescriptor, Registry};
use sarball::sar::reader::BlobSource;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

struct Fixture {
    registry: Arc<MockRegistry>,
    registry_dyn: Arc<dyn Registry>,
    cache: BlobCache,
    _cache_dir: tempfile::TempDir,
    reference: Reference,
    desc: LayerDescriptor,
    blob_size: u64,
}

/// Push a pseudo-random tree and resolve its layer descriptor
async fn fixture(reference: &str, payload: usize) -> Fixture {
    let registry = Arc::new(MockRegistry::new());
    let registry_dyn: Arc<dyn Registry> = Arc::clone(&registry) as Arc<dyn sarball::registry::Registry>;
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = BlobCache::new(cache_dir.path()).unwrap();

    let push_cache_dir = tempfile::tempdir().unwrap();
    let client = Client::builder()
        .with_registry(Arc::clone(&registry_dyn))
        .with_cache(BlobCache::new(push_cache_dir.path()).unwrap())
        .build()
        .unwrap();
    let reference = Reference::parse(reference).unwrap();
    let report = client
        .push(
            &reference,
            Arc::new(large_tree(payload)),
            &PushOptions {
                codec: Some(Codec::Gzip),
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let desc = registry_dyn.resolve_layer(&reference).await.unwrap();
    // Reset accounting done during the push itself.
    registry.full_blob_fetches.store(0, Ordering::Relaxed);
    registry.range_bytes_served.store(0, Ordering::Relaxed);
    registry.range_requests.lock().unwrap().clear();

    Fixture {
        registry,
        registry_dyn,
        cache,
        _cache_dir: cache_dir,
        reference,
        desc,
        blob_size: report.blob_size,
    }
}

fn partial_path(fx: &Fixture) -> std::path::PathBuf {
    fx.cache
        .root()
        .join("blobs")
        .join("sha256")
        .join(format!("{}.partial", fx.desc.digest.hex()))
}

#[tokio::test]
async fn test_stream_through_commits_complete_and_verified() {
    let fx = fixture("localhost:5000/cache/stream:v1", 1_500_000).await;
    let cancel = CancellationToken::new();

    let mut stream = fx
        .cache
        .open_stream_through(&fx.registry_dyn, &fx.reference, &fx.desc, &cancel)
        .await
        .unwrap();
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).await.unwrap();
    assert_eq!(bytes.len() as u64, fx.blob_size);
    let mut hasher = Hasher::new();
    hasher.update(&bytes);
    assert_eq!(hasher.finish(), fx.desc.digest);
    drop(stream);

    // The feeder commits before signaling EOF, so the entry is final here.
    let entries = fx.cache.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].complete);
    assert!(entries[0].verified);
    assert_eq!(fx.registry.full_blob_fetches.load(Ordering::Relaxed), 1);

    // A second stream is served locally.
    let mut stream = fx
        .cache
        .open_stream_through(&fx.registry_dyn, &fx.reference, &fx.desc, &cancel)
        .await
        .unwrap();
    let mut again = Vec::new();
    stream.read_to_end(&mut again).await.unwrap();
    assert_eq!(again, bytes);
    assert_eq!(fx.registry.full_blob_fetches.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_interrupted_stream_leaves_resumable_state() {
    let fx = fixture("localhost:5000/cache/resume:v1", 10 * 1024 * 1024).await;
    let cancel = CancellationToken::new();

    let mut stream = fx
        .cache
        .open_stream_through(&fx.registry_dyn, &fx.reference, &fx.desc, &cancel)
        .await
        .unwrap();
    // Consume ~4 MiB, then walk away mid-stream.
    let mut taken = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    while taken < 4 * 1024 * 1024 {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "stream ended early at {}", taken);
        taken += n as u64;
    }
    drop(stream);

    // The feeder stashes the partial file and its free-range map.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !partial_path(&fx).exists() {
        assert!(
            std::time::Instant::now() < deadline,
            "resumable partial never appeared"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let entries = fx.cache.entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].complete);

    // Second pass: completes from the remaining ranges only.
    let mut stream = fx
        .cache
        .open_stream_through(&fx.registry_dyn, &fx.reference, &fx.desc, &cancel)
        .await
        .unwrap();
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).await.unwrap();
    assert_eq!(bytes.len() as u64, fx.blob_size);
    let mut hasher = Hasher::new();
    hasher.update(&bytes);
    assert_eq!(hasher.finish(), fx.desc.digest);

    let entries = fx.cache.entries().unwrap();
    assert!(entries[0].complete && entries[0].verified);

    // Only the resumed tail came over as ranges; nothing restarted at zero.
    let requests = fx.registry.range_requests.lock().unwrap().clone();
    assert!(!requests.is_empty(), "resume did not use range requests");
    for (offset, _) in &requests {
        assert!(*offset > 0, "resume refetched from offset 0");
    }
    assert_eq!(fx.registry.full_blob_fetches.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_interrupted_stream_restarts_without_range_support() {
    let fx = fixture("localhost:5000/cache/norange:v1", 6 * 1024 * 1024).await;
    fx.registry.support_range.store(false, Ordering::Relaxed);
    let cancel = CancellationToken::new();

    let mut stream = fx
        .cache
        .open_stream_through(&fx.registry_dyn, &fx.reference, &fx.desc, &cancel)
        .await
        .unwrap();
    let mut buf = vec![0u8; 64 * 1024];
    let mut taken = 0u64;
    while taken < 2 * 1024 * 1024 {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0);
        taken += n as u64;
    }
    drop(stream);

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !partial_path(&fx).exists() {
        assert!(std::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Resume falls back to a full fetch that discards the prefix.
    let mut stream = fx
        .cache
        .open_stream_through(&fx.registry_dyn, &fx.reference, &fx.desc, &cancel)
        .await
        .unwrap();
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).await.unwrap();
    assert_eq!(bytes.len() as u64, fx.blob_size);
    assert!(fx.cache.entries().unwrap()[0].complete);
    assert_eq!(fx.registry.full_blob_fetches.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn test_eager_open_is_idempotent() {
    let fx = fixture("localhost:5000/cache/idempotent:v1", 600_000).await;
    let cancel = CancellationToken::new();

    for round in 0..3 {
        let handle = fx
            .cache
            .open(&fx.registry_dyn, &fx.reference, &fx.desc, &cancel)
            .await
            .unwrap();
        assert!(handle.complete());
        assert_eq!(BlobSource::size(&handle), fx.blob_size);

        // Hash the full handle contents through read_at.
        let mut hasher = Hasher::new();
        let mut offset = 0u64;
        let mut buf = vec![0u8; 128 * 1024];
        loop {
            let n = handle.read_at(offset, &mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            offset += n as u64;
        }
        assert_eq!(hasher.finish(), fx.desc.digest, "round {}", round);

        let entries = fx.cache.entries().unwrap();
        assert!(entries[0].complete && entries[0].verified);
    }
    // One network fetch total.
    assert_eq!(fx.registry.full_blob_fetches.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_digest_mismatch_scrubs_cache_state() {
    let fx = fixture("localhost:5000/cache/mismatch:v1", 400_000).await;
    let cancel = CancellationToken::new();

    // Descriptor lies about the digest; the tee must refuse to commit.
    let mut lying = fx.desc.clone();
    lying.digest = sarball::digest::Digest::from_bytes(b"not the real bytes");
    let mut stream = fx
        .cache
        .open_stream_through(&fx.registry_dyn, &fx.reference, &lying, &cancel)
        .await
        .unwrap();
    let mut sink = Vec::new();
    let err = stream.read_to_end(&mut sink).await.unwrap_err();
    assert!(err.to_string().contains("mismatch"), "got {}", err);

    // No entry, no partial file for the lying digest.
    assert!(fx.cache.entries().unwrap().is_empty());
    assert!(
        !fx.cache
            .root()
            .join("blobs/sha256")
            .join(lying.digest.hex())
            .exists()
    );
}

#[tokio::test]
async fn test_lazy_handle_falls_back_when_ranges_unsupported() {
    let fx = fixture("localhost:5000/cache/lazyfallback:v1", 300_000).await;
    fx.registry.support_range.store(false, Ordering::Relaxed);
    let cancel = CancellationToken::new();

    let handle = fx
        .cache
        .open_lazy(&fx.registry_dyn, &fx.reference, &fx.desc, &cancel)
        .await
        .unwrap();
    assert!(!handle.complete());
    let mut buf = vec![0u8; 1024];
    let n = handle.read_at(0, &mut buf).await.unwrap();
    assert!(n > 0);
    // The eager fallback pulled the whole blob, completing the entry.
    assert!(handle.complete());
    assert_eq!(fx.registry.full_blob_fetches.load(Ordering::Relaxed), 1);
    assert!(fx.cache.entries().unwrap()[0].verified);
}

#[tokio::test]
async fn test_prune_by_size_keeps_newest() {
    let registry = Arc::new(MockRegistry::new());
    let registry_dyn: Arc<dyn Registry> = Arc::clone(&registry) as Arc<dyn sarball::registry::Registry>;
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = BlobCache::new(cache_dir.path()).unwrap();
    let cancel = CancellationToken::new();

    let mut descriptors = Vec::new();
    for i in 0..3 {
        let reference =
            Reference::parse(&format!("localhost:5000/cache/prune{}:v1", i)).unwrap();
        let blob = common::pseudo_random(200_000, i as u64 + 1);
        let desc = registry.insert_layer(
            &reference,
            blob,
            "application/vnd.sarball.layer.v1.tar+gzip",
        );
        let mut stream = cache
            .open_stream_through(&registry_dyn, &reference, &desc, &cancel)
            .await
            .unwrap();
        tokio::io::copy(&mut stream, &mut tokio::io::sink())
            .await
            .unwrap();
        descriptors.push(desc);
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let report = cache
        .prune(
            PruneOptions {
                max_age: None,
                max_size: Some(250_000),
            },
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(report.removed, 2);
    assert!(report.remaining_bytes <= 250_000);

    // The survivor is the most recently accessed blob.
    let survivors = cache.entries().unwrap();
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].digest, descriptors[2].digest);
}

#[tokio::test]
async fn test_prune_by_age_evicts_everything_stale() {
    let fx = fixture("localhost:5000/cache/age:v1", 100_000).await;
    let cancel = CancellationToken::new();
    let mut stream = fx
        .cache
        .open_stream_through(&fx.registry_dyn, &fx.reference, &fx.desc, &cancel)
        .await
        .unwrap();
    tokio::io::copy(&mut stream, &mut tokio::io::sink())
        .await
        .unwrap();
    drop(stream);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let report = fx
        .cache
        .prune(
            PruneOptions {
                max_age: Some(Duration::from_millis(1)),
                max_size: None,
            },
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(report.removed, 1);
    assert!(fx.cache.entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_ref_index_ttl() {
    let fx = fixture("localhost:5000/cache/refs:v1", 100_000).await;
    fx.cache.record_ref(&fx.reference, &fx.desc).unwrap();

    let hit = fx
        .cache
        .lookup_by_ref(&fx.reference, Duration::from_secs(3600))
        .unwrap();
    assert_eq!(hit.as_ref(), Some(&fx.desc));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let expired = fx
        .cache
        .lookup_by_ref(&fx.reference, Duration::from_millis(1))
        .unwrap();
    assert!(expired.is_none());

    let other = Reference::parse("localhost:5000/cache/other:v1").unwrap();
    assert!(
        fx.cache
            .lookup_by_ref(&other, Duration::from_secs(3600))
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_clear_removes_everything() {
    let fx = fixture("localhost:5000/cache/clear:v1", 100_000).await;
    let cancel = CancellationToken::new();
    let mut stream = fx
        .cache
        .open_stream_through(&fx.registry_dyn, &fx.reference, &fx.desc, &cancel)
        .await
        .unwrap();
    tokio::io::copy(&mut stream, &mut tokio::io::sink())
        .await
        .unwrap();
    drop(stream);
    assert_eq!(fx.cache.entries().unwrap().len(), 1);

    fx.cache.clear().unwrap();
    assert!(fx.cache.entries().unwrap().is_empty());
    assert!(
        fx.cache
            .lookup_by_ref(&fx.reference, Duration::from_secs(3600))
            .unwrap()
            .is_none()
    );
}
