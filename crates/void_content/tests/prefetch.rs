//! Integration tests for dependency prefetching

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use void_content::*;

const WAIT: Duration = Duration::from_secs(5);

type Backend = MemoryBackend<String>;
type Outcome = Result<String, LoadError>;

fn setup() -> (Arc<Backend>, AssetCache<Backend>, Prefetcher<Backend>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = Arc::new(MemoryBackend::new());
    let cache = AssetCache::new(Arc::clone(&backend), RepositoryConfig::default()).unwrap();
    let prefetcher = Prefetcher::new(Arc::clone(&backend), DownloaderConfig::default()).unwrap();
    (backend, cache, prefetcher)
}

fn forwarding(tx: mpsc::UnboundedSender<Outcome>) -> AssetRequest<String> {
    let failed = tx.clone();
    AssetRequest::new()
        .on_loaded(move |_, v| {
            let _ = tx.send(Ok(v));
        })
        .on_failed(move |_, e| {
            let _ = failed.send(Err(e));
        })
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Outcome>) -> Outcome {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for callback")
        .expect("channel closed")
}

#[tokio::test]
async fn test_nothing_to_download_loads_directly() {
    let (backend, cache, prefetcher) = setup();
    backend.insert("pack1/bundle-data.asset", "data".to_string());
    backend.set_download_size("pack1", 0);

    let (tx, mut rx) = mpsc::unbounded_channel();
    prefetcher.fetch_asset(&cache, "pack1", forwarding(tx));

    assert_eq!(next(&mut rx).await, Ok("data".to_string()));
    assert_eq!(backend.download_calls(), 0);
    assert_eq!(backend.journal(), vec!["size:pack1", "load:pack1/bundle-data.asset"]);
    assert_eq!(prefetcher.state(&["pack1"]), PrefetchState::Ready);
}

#[tokio::test]
async fn test_download_runs_before_load() {
    let (backend, cache, prefetcher) = setup();
    backend.insert("pack1/bundle-data.asset", "data".to_string());
    backend.set_download_size("pack1", 1000);

    let (tx, mut rx) = mpsc::unbounded_channel();
    prefetcher.fetch_asset(&cache, "pack1", forwarding(tx));

    assert_eq!(next(&mut rx).await, Ok("data".to_string()));
    assert_eq!(
        backend.journal(),
        vec!["size:pack1", "download:pack1", "load:pack1/bundle-data.asset"]
    );
    assert_eq!(prefetcher.state(&["pack1"]), PrefetchState::Ready);

    // Already cached: no size query, no download
    let (tx, mut rx) = mpsc::unbounded_channel();
    prefetcher.fetch_asset(&cache, "pack1", forwarding(tx));
    assert_eq!(next(&mut rx).await, Ok("data".to_string()));
    assert_eq!(backend.size_queries(), 1);
}

#[tokio::test]
async fn test_failed_size_query_falls_back_to_direct_load() {
    let (backend, cache, prefetcher) = setup();
    backend.insert("pack1/bundle-data.asset", "data".to_string());
    backend.fail_size_query("pack1");

    let (tx, mut rx) = mpsc::unbounded_channel();
    prefetcher.fetch_asset(&cache, "pack1", forwarding(tx));

    assert_eq!(next(&mut rx).await, Ok("data".to_string()));
    assert_eq!(backend.download_calls(), 0);
}

#[tokio::test]
async fn test_failed_download_skips_load() {
    let (backend, cache, prefetcher) = setup();
    backend.insert("pack1/bundle-data.asset", "data".to_string());
    backend.set_download_size("pack1", 1000);
    backend.fail_download("pack1");

    let failures = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen = Arc::clone(&failures);
    let _sub = cache.on_asset_failed(move |e| seen.lock().push(e.clone()));

    let (tx, mut rx) = mpsc::unbounded_channel();
    prefetcher.fetch_asset(&cache, "pack1", forwarding(tx));

    let error = next(&mut rx).await.unwrap_err();
    assert!(matches!(error, LoadError::DownloadFailed { .. }));
    assert_eq!(prefetcher.state(&["pack1"]), PrefetchState::Failed);
    assert_eq!(backend.total_load_calls(), 0);

    let failures = failures.lock().clone();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].reason.contains("pack1"));
}

#[tokio::test]
async fn test_blank_id_is_rejected_by_the_cache() {
    let (backend, cache, prefetcher) = setup();

    let (tx, mut rx) = mpsc::unbounded_channel();
    prefetcher.fetch_asset(&cache, "", forwarding(tx));

    assert_eq!(rx.try_recv().ok(), Some(Err(LoadError::InvalidId)));
    assert_eq!(backend.size_queries(), 0);
    assert_eq!(prefetcher.state(&[""]), PrefetchState::Unrequested);
}

#[tokio::test]
async fn test_dependency_key_follows_config() {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = Arc::new(MemoryBackend::new());
    let config = RepositoryConfig::from_json(
        r#"{ "address_format": "packs/{id}.bin", "dependency_format": "labels/{id}" }"#,
    )
    .unwrap();
    let cache = AssetCache::new(Arc::clone(&backend), config).unwrap();
    let prefetcher = Prefetcher::new(Arc::clone(&backend), DownloaderConfig::default()).unwrap();
    backend.insert("packs/pack1.bin", "data".to_string());
    backend.set_download_size("labels/pack1", 10);

    let (tx, mut rx) = mpsc::unbounded_channel();
    prefetcher.fetch_asset(&cache, "pack1", forwarding(tx));

    assert_eq!(next(&mut rx).await, Ok("data".to_string()));
    assert_eq!(
        backend.journal(),
        vec!["size:labels/pack1", "download:labels/pack1", "load:packs/pack1.bin"]
    );
    assert_eq!(prefetcher.state(&["labels/pack1"]), PrefetchState::Ready);
}

#[tokio::test]
async fn test_concurrent_fetches_share_one_download() {
    let (backend, cache, prefetcher) = setup();
    backend.insert("pack1/bundle-data.asset", "data".to_string());
    backend.set_download_size("pack1", 1000);

    // Neither flow has run yet on this single-threaded runtime
    let (tx, mut rx) = mpsc::unbounded_channel();
    prefetcher.fetch_asset(&cache, "pack1", forwarding(tx.clone()));
    prefetcher.fetch_asset(&cache, "pack1", forwarding(tx));
    assert_eq!(prefetcher.state(&["pack1"]), PrefetchState::SizeQuery);

    assert_eq!(next(&mut rx).await, Ok("data".to_string()));
    assert_eq!(next(&mut rx).await, Ok("data".to_string()));
    assert_eq!(backend.size_queries(), 1);
    assert_eq!(backend.download_calls(), 1);
    assert_eq!(backend.total_load_calls(), 1);
    assert_eq!(prefetcher.state(&["pack1"]), PrefetchState::Ready);
}

#[tokio::test]
async fn test_failed_download_fails_every_waiting_fetch() {
    let (backend, cache, prefetcher) = setup();
    backend.set_download_size("pack1", 1000);
    backend.fail_download("pack1");

    let (tx, mut rx) = mpsc::unbounded_channel();
    prefetcher.fetch_asset(&cache, "pack1", forwarding(tx.clone()));
    prefetcher.fetch_asset(&cache, "pack1", forwarding(tx));

    for _ in 0..2 {
        assert!(matches!(next(&mut rx).await, Err(LoadError::DownloadFailed { .. })));
    }
    assert_eq!(backend.download_calls(), 1);
    assert_eq!(cache.stats().loads_failed, 2);
}

#[tokio::test]
async fn test_clear_finished_forgets_settled_keys() {
    let (backend, cache, prefetcher) = setup();
    backend.insert("pack1/bundle-data.asset", "data".to_string());

    let (tx, mut rx) = mpsc::unbounded_channel();
    prefetcher.fetch_asset(&cache, "pack1", forwarding(tx));
    assert_eq!(next(&mut rx).await, Ok("data".to_string()));
    assert_eq!(prefetcher.state(&["pack1"]), PrefetchState::Ready);

    prefetcher.clear_finished();
    assert_eq!(prefetcher.state(&["pack1"]), PrefetchState::Unrequested);
}
