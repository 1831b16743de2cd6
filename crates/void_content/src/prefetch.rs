//! Dependency prefetching
//!
//! Wraps a `ContentDownloader` with the size-then-download pattern used
//! before data loads. `fetch_asset` derives a dependency key from the asset
//! id (`RepositoryConfig::dependency_format`) and, per key, walks:
//!
//! ```text
//! Unrequested -> SizeQuery -> DirectLoad ---------------> Ready | Failed
//!                          \-> BulkDownload -> Load ---/
//! ```
//!
//! A failed size query (negative size) falls through to a direct load;
//! only a failed bulk download fails the request without loading.
//!
//! Concurrent fetches of the same key share one size query and one
//! download. States are kept per key until `clear_finished`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;

use crate::backend::{ContentDownloader, ResourceBackend};
use crate::config::DownloaderConfig;
use crate::error::{ContentResult, LoadError};
use crate::logging::ScopedLog;
use crate::operation::{OperationHandle, OperationStatus};
use crate::repository::{AssetCache, AssetRequest};
use crate::request::ProgressFn;

/// Where a key group is in the prefetch flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrefetchState {
    /// Never fetched through this prefetcher
    Unrequested,
    /// Waiting for the download size
    SizeQuery,
    /// Nothing to download, loading data
    DirectLoad,
    /// Downloading dependencies
    BulkDownload,
    /// Dependencies downloaded, loading data
    Load,
    /// Data loaded
    Ready,
    /// Download or load failed
    Failed,
}

impl PrefetchState {
    /// Ready or Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }
}

/// Render a download size for logs
pub fn format_bytes(bytes: i64) -> String {
    if bytes <= 0 {
        return "Already available".to_string();
    }

    const SUFFIXES: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < SUFFIXES.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {} to download", size, SUFFIXES[unit])
}

fn group_key<S: AsRef<str>>(keys: &[S]) -> String {
    keys.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(",")
}

/// Keys worth sending to the downloader, or `None` if there are none
fn usable_keys<S: AsRef<str>>(keys: &[S]) -> Option<Vec<String>> {
    let keys: Vec<String> = keys
        .iter()
        .map(AsRef::as_ref)
        .filter(|k| !k.trim().is_empty())
        .map(str::to_string)
        .collect();
    (!keys.is_empty()).then_some(keys)
}

/// Continuation of a queued `fetch_asset`, run once its key's flow settles
type FlowWaiter = Box<dyn FnOnce(Result<(), LoadError>) + Send>;

struct PrefetcherInner<D> {
    downloader: Arc<D>,
    config: DownloaderConfig,
    log: ScopedLog,
    runtime: Handle,
    states: RwLock<HashMap<String, PrefetchState>>,
    flights: Mutex<HashMap<String, Vec<FlowWaiter>>>,
}

/// Size query and bulk download front-end
pub struct Prefetcher<D: ContentDownloader> {
    inner: Arc<PrefetcherInner<D>>,
}

impl<D: ContentDownloader> Clone for Prefetcher<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: ContentDownloader> Prefetcher<D> {
    /// Create a prefetcher on the current tokio runtime
    pub fn new(downloader: Arc<D>, config: DownloaderConfig) -> ContentResult<Self> {
        let runtime = Handle::try_current()?;
        Ok(Self::with_runtime(downloader, config, runtime))
    }

    /// Create a prefetcher that spawns its flows on `runtime`
    pub fn with_runtime(downloader: Arc<D>, config: DownloaderConfig, runtime: Handle) -> Self {
        let log = ScopedLog::new(&config.log_tag, config.log_enabled);
        Self {
            inner: Arc::new(PrefetcherInner {
                downloader,
                config,
                log,
                runtime,
                states: RwLock::new(HashMap::new()),
                flights: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The wrapped downloader
    pub fn downloader(&self) -> &Arc<D> {
        &self.inner.downloader
    }

    /// Bytes still to download for `keys`
    ///
    /// `on_complete` gets 0 if everything is local and -1 if the query
    /// failed or `keys` has no usable key (the latter synchronously).
    pub fn get_download_size<S, F>(&self, keys: &[S], on_complete: F)
    where
        S: AsRef<str>,
        F: FnOnce(i64) + Send + 'static,
    {
        let Some(keys) = usable_keys(keys) else {
            self.inner.log.warn(format_args!("Download size requested for no keys"));
            self.inner.log.guarded("on_complete", || on_complete(-1));
            return;
        };

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let size = inner.query_size(&keys).await;
            inner.log.guarded("on_complete", || on_complete(size));
        });
    }

    /// `get_download_size` for a single key
    pub fn get_download_size_for<F>(&self, key: &str, on_complete: F)
    where
        F: FnOnce(i64) + Send + 'static,
    {
        self.get_download_size(&[key], on_complete);
    }

    /// Download everything `keys` depend on
    ///
    /// `on_complete` gets `(success, bytes)`; `(false, 0)` synchronously if
    /// `keys` has no usable key. Progress is polled while the download
    /// runs and ends with 1.0.
    pub fn download_dependencies<S, F>(&self, keys: &[S], on_progress: Option<ProgressFn>, on_complete: F)
    where
        S: AsRef<str>,
        F: FnOnce(bool, u64) + Send + 'static,
    {
        let Some(keys) = usable_keys(keys) else {
            self.inner.log.warn(format_args!("Dependency download requested for no keys"));
            self.inner.log.guarded("on_complete", || on_complete(false, 0));
            return;
        };

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let outcome = inner.download(&keys, on_progress).await;
            inner.log.guarded("on_complete", || match outcome {
                Ok(bytes) => on_complete(true, bytes),
                Err(_) => on_complete(false, 0),
            });
        });
    }

    /// `download_dependencies` for a single key
    pub fn download_dependencies_for<F>(&self, key: &str, on_progress: Option<ProgressFn>, on_complete: F)
    where
        F: FnOnce(bool, u64) + Send + 'static,
    {
        self.download_dependencies(&[key], on_progress, on_complete);
    }

    /// State of the last `fetch_asset` flow for this key group
    pub fn state<S: AsRef<str>>(&self, keys: &[S]) -> PrefetchState {
        self.inner
            .states
            .read()
            .get(&group_key(keys))
            .copied()
            .unwrap_or(PrefetchState::Unrequested)
    }

    /// Forget Ready and Failed states; they read as Unrequested afterwards
    pub fn clear_finished(&self) {
        self.inner.states.write().retain(|_, state| !state.is_terminal());
    }

    /// Fetch `id` through `cache`, downloading its dependencies first if needed
    ///
    /// Outcomes are delivered exactly like `AssetCache::get_asset`. A failed
    /// download is reported as `LoadError::DownloadFailed`. A fetch whose
    /// dependency key already has a flow running waits for that flow.
    pub fn fetch_asset<B>(&self, cache: &AssetCache<B>, id: &str, request: AssetRequest<B::Resource>)
    where
        B: ResourceBackend,
    {
        if id.trim().is_empty() {
            cache.get_asset(id, request);
            return;
        }

        let key = cache.config().dependency_key_for(id);
        if cache.is_loaded(id) {
            self.inner.set_state(&key, PrefetchState::Ready);
            cache.get_asset(id, request);
            return;
        }

        let waiter: FlowWaiter = {
            let inner = Arc::clone(&self.inner);
            let cache = cache.clone();
            let id = id.to_string();
            let key = key.clone();
            Box::new(move |outcome: Result<(), LoadError>| match outcome {
                Ok(()) => cache.get_asset(&id, inner.track(key, request)),
                Err(error) => cache.report_failure(&id, error, request),
            })
        };

        {
            let mut flights = self.inner.flights.lock();
            if let Some(waiters) = flights.get_mut(&key) {
                self.inner
                    .log
                    .debug(format_args!("Joining running prefetch of {}", key));
                waiters.push(waiter);
                return;
            }
            flights.insert(key.clone(), vec![waiter]);
        }
        self.inner.set_state(&key, PrefetchState::SizeQuery);

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let outcome = inner.prepare(&key).await;
            let waiters = inner.flights.lock().remove(&key).unwrap_or_default();
            for waiter in waiters {
                waiter(outcome.clone());
            }
        });
    }
}

impl<D: ContentDownloader> PrefetcherInner<D> {
    /// Size query, then a bulk download if anything is missing
    async fn prepare(&self, key: &str) -> Result<(), LoadError> {
        let keys = vec![key.to_string()];
        let size = self.query_size(&keys).await;
        if size <= 0 {
            self.set_state(key, PrefetchState::DirectLoad);
            return Ok(());
        }

        self.set_state(key, PrefetchState::BulkDownload);
        match self.download(&keys, None).await {
            Ok(_) => {
                self.set_state(key, PrefetchState::Load);
                Ok(())
            }
            Err(reason) => {
                self.set_state(key, PrefetchState::Failed);
                Err(LoadError::DownloadFailed {
                    key: key.to_string(),
                    reason,
                })
            }
        }
    }

    fn set_state(&self, group: &str, state: PrefetchState) {
        self.states.write().insert(group.to_string(), state);
    }

    /// Wrap `request` so its outcome settles the group state
    fn track<R: Send + 'static>(self: &Arc<Self>, group: String, request: AssetRequest<R>) -> AssetRequest<R> {
        let AssetRequest {
            on_loaded,
            on_progress,
            on_failed,
        } = request;
        let ready = Arc::clone(self);
        let failed = Arc::clone(self);
        let ready_group = group.clone();

        AssetRequest {
            on_loaded: Some(Box::new(move |id: &str, asset: R| {
                ready.set_state(&ready_group, PrefetchState::Ready);
                if let Some(on_loaded) = on_loaded {
                    on_loaded(id, asset);
                }
            })),
            on_progress,
            on_failed: Some(Box::new(move |id: &str, error: LoadError| {
                failed.set_state(&group, PrefetchState::Failed);
                if let Some(on_failed) = on_failed {
                    on_failed(id, error);
                }
            })),
        }
    }

    async fn query_size(&self, keys: &[String]) -> i64 {
        let handle = self.downloader.download_size(keys);
        handle.completed().await;

        let size = match (handle.status(), handle.result()) {
            (OperationStatus::Succeeded, Some(bytes)) => {
                let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
                self.log.info(format_args!(
                    "Required download size for {}: {}",
                    keys.join(", "),
                    format_bytes(bytes)
                ));
                bytes
            }
            _ => {
                self.log.error(format_args!(
                    "Failed to get download size for {}: {}",
                    keys.join(", "),
                    handle.error().unwrap_or_else(|| "released".to_string())
                ));
                -1
            }
        };
        handle.release();
        size
    }

    async fn download(&self, keys: &[String], on_progress: Option<ProgressFn>) -> Result<u64, String> {
        let handle = self.downloader.download_dependencies(keys);
        if let Some(on_progress) = &on_progress {
            self.track_progress(&handle, on_progress).await;
        } else {
            handle.completed().await;
        }

        let outcome = match (handle.status(), handle.result()) {
            (OperationStatus::Succeeded, Some(bytes)) => {
                self.log.info(format_args!(
                    "Download of {} completed ({} bytes)",
                    keys.join(", "),
                    bytes
                ));
                Ok(bytes)
            }
            _ => {
                let reason = handle
                    .error()
                    .unwrap_or_else(|| "operation released".to_string());
                self.log.error(format_args!("Download of {} failed: {}", keys.join(", "), reason));
                Err(reason)
            }
        };
        handle.release();
        outcome
    }

    /// Forward increasing progress until the download settles, then 1.0
    async fn track_progress(&self, handle: &OperationHandle<u64>, on_progress: &ProgressFn) {
        let period = Duration::from_millis(self.config.progress_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        let mut last = 0.0_f32;

        loop {
            tokio::select! {
                _ = handle.completed() => break,
                _ = ticker.tick() => {
                    let percent = handle.percent_complete();
                    if percent > last {
                        last = percent;
                        self.log.guarded("on_progress", || on_progress(percent));
                    }
                }
            }
        }
        if last < 1.0 {
            self.log.guarded("on_progress", || on_progress(1.0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use tokio::sync::oneshot;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "Already available");
        assert_eq!(format_bytes(-1), "Already available");
        assert_eq!(format_bytes(512), "512.0 B to download");
        assert_eq!(format_bytes(1536), "1.5 KB to download");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB to download");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB to download");
        assert_eq!(format_bytes(4096 * 1024 * 1024 * 1024), "4096.0 GB to download");
    }

    #[test]
    fn test_usable_keys() {
        assert_eq!(usable_keys::<&str>(&[]), None);
        assert_eq!(usable_keys(&["", "  "]), None);
        assert_eq!(usable_keys(&["a", " "]), Some(vec!["a".to_string()]));
    }

    #[tokio::test]
    async fn test_download_size() {
        let backend = Arc::new(MemoryBackend::<u32>::new());
        backend.set_download_size("pack1", 1000);
        let prefetcher = Prefetcher::new(Arc::clone(&backend), DownloaderConfig::default()).unwrap();

        let (tx, rx) = oneshot::channel();
        prefetcher.get_download_size_for("pack1", move |size| {
            let _ = tx.send(size);
        });
        assert_eq!(rx.await.unwrap(), 1000);

        backend.fail_size_query("broken");
        let (tx, rx) = oneshot::channel();
        prefetcher.get_download_size(&["broken"], move |size| {
            let _ = tx.send(size);
        });
        assert_eq!(rx.await.unwrap(), -1);
    }

    #[tokio::test]
    async fn test_blank_keys_answer_synchronously() {
        let backend = Arc::new(MemoryBackend::<u32>::new());
        let prefetcher = Prefetcher::new(Arc::clone(&backend), DownloaderConfig::default()).unwrap();

        let size = Arc::new(parking_lot::Mutex::new(None));
        let slot = Arc::clone(&size);
        prefetcher.get_download_size_for(" ", move |s| *slot.lock() = Some(s));
        assert_eq!(*size.lock(), Some(-1));

        let done = Arc::new(parking_lot::Mutex::new(None));
        let slot = Arc::clone(&done);
        prefetcher.download_dependencies::<&str, _>(&[], None, move |ok, bytes| {
            *slot.lock() = Some((ok, bytes))
        });
        assert_eq!(*done.lock(), Some((false, 0)));

        assert_eq!(backend.size_queries(), 0);
        assert_eq!(backend.download_calls(), 0);
    }

    #[tokio::test]
    async fn test_download_reports_final_progress() {
        let backend = Arc::new(MemoryBackend::<u32>::new());
        backend.set_download_size("pack1", 2048);
        let prefetcher = Prefetcher::new(Arc::clone(&backend), DownloaderConfig::default()).unwrap();

        let progress = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = Arc::clone(&progress);
        let (tx, rx) = oneshot::channel();
        prefetcher.download_dependencies_for(
            "pack1",
            Some(Arc::new(move |p: f32| seen.lock().push(p))),
            move |ok, bytes| {
                let _ = tx.send((ok, bytes));
            },
        );

        assert_eq!(rx.await.unwrap(), (true, 2048));
        assert_eq!(progress.lock().last().copied(), Some(1.0));
        assert_eq!(prefetcher.state(&["pack1"]), PrefetchState::Unrequested);
    }
}
