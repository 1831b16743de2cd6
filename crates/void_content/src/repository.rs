//! Asset repository
//!
//! Two-tier cache over a `LoadCoordinator`:
//! - Tier 1: resolved assets by logical id, owned by the repository
//! - Tier 2: backend handles by address, owned by the coordinator
//!
//! Logical ids are mapped to backend addresses through the configured
//! template. Every outcome is reported both to the request's own callbacks
//! and to the `AssetReady` / `AssetProgress` / `AssetFailed` topics.
//!
//! ## Example
//!
//! ```ignore
//! let backend = Arc::new(MemoryBackend::new());
//! let cache = AssetCache::new(backend, RepositoryConfig::default())?;
//!
//! let _ready = cache.on_asset_ready(|e| println!("{} ready", e.id));
//! cache.get_asset("offerpack-bag", AssetRequest::new());
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::backend::ResourceBackend;
use crate::config::{CoordinatorConfig, RepositoryConfig};
use crate::coordinator::LoadCoordinator;
use crate::error::{ContentResult, LoadError};
use crate::events::{AssetFailed, AssetProgress, AssetReady, EventTopic, Subscription};
use crate::logging::ScopedLog;
use crate::request::LoadRequest;
use crate::service::{Service, ServiceError, ServiceHealth, ServiceResult, ServiceState};

/// Success callback, called with the id and the asset
pub type AssetLoadedFn<R> = Box<dyn FnOnce(&str, R) + Send>;
/// Progress callback, called with the id and a value in `[0, 1]`
pub type AssetProgressFn = Arc<dyn Fn(&str, f32) + Send + Sync>;
/// Failure callback
pub type AssetFailedFn = Box<dyn FnOnce(&str, LoadError) + Send>;

/// Optional callbacks for one `get_asset` call
pub struct AssetRequest<R> {
    pub(crate) on_loaded: Option<AssetLoadedFn<R>>,
    pub(crate) on_progress: Option<AssetProgressFn>,
    pub(crate) on_failed: Option<AssetFailedFn>,
}

impl<R> AssetRequest<R> {
    /// Request with no callbacks; outcomes are still published as events
    pub fn new() -> Self {
        Self {
            on_loaded: None,
            on_progress: None,
            on_failed: None,
        }
    }

    /// Called with the id and the asset on success
    pub fn on_loaded<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&str, R) + Send + 'static,
    {
        self.on_loaded = Some(Box::new(f));
        self
    }

    /// Called with strictly increasing progress, ending at 1.0 on success
    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, f32) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(f));
        self
    }

    /// Called once if the request fails
    pub fn on_failed<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&str, LoadError) + Send + 'static,
    {
        self.on_failed = Some(Box::new(f));
        self
    }
}

impl<R> Default for AssetRequest<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Repository statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Served from the repository's own cache
    pub local_hits: u64,
    /// Served from the coordinator's resolved handles
    pub provider_hits: u64,
    /// Delegated to the coordinator
    pub loads_requested: u64,
    /// Delegated loads that succeeded
    pub loads_succeeded: u64,
    /// Requests that ended in failure (including invalid ids)
    pub loads_failed: u64,
}

impl CacheStats {
    /// Fraction of requests served without a coordinator load
    pub fn hit_rate(&self) -> f64 {
        let hits = self.local_hits + self.provider_hits;
        let total = hits + self.loads_requested;
        if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// Snapshot of an id's generation, taken before looking past tier 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Token {
    epoch: u64,
    generation: u64,
}

/// Generation of an id that has outstanding tokens
struct Watch {
    generation: u64,
    holders: usize,
}

/// Tier-1 store
///
/// Anything that may write an id into tier 1 from outside (a tier-2 copy or
/// a delegated load) first takes a token with `watch` and hands it back
/// with `settle`. An unload in between bumps the generation, so the stale
/// writer is refused. Watches are dropped once their last token settles.
struct LocalStore<R> {
    assets: HashMap<String, R>,
    watched: HashMap<String, Watch>,
    epoch: u64,
}

impl<R> LocalStore<R> {
    fn new() -> Self {
        Self {
            assets: HashMap::new(),
            watched: HashMap::new(),
            epoch: 0,
        }
    }

    fn watch(&mut self, id: &str) -> Token {
        let watch = self.watched.entry(id.to_string()).or_insert(Watch {
            generation: 0,
            holders: 0,
        });
        watch.holders += 1;
        Token {
            epoch: self.epoch,
            generation: watch.generation,
        }
    }

    /// Return a token, storing `asset` if nothing was unloaded since it was
    /// taken. Returns whether the token was still current.
    fn settle(&mut self, id: &str, token: Token, asset: Option<R>) -> bool {
        let current = match self.watched.get_mut(id) {
            Some(watch) => {
                let current = token.epoch == self.epoch && token.generation == watch.generation;
                watch.holders = watch.holders.saturating_sub(1);
                if watch.holders == 0 {
                    self.watched.remove(id);
                }
                current
            }
            None => false,
        };
        if current {
            if let Some(asset) = asset {
                self.assets.insert(id.to_string(), asset);
            }
        }
        current
    }

    fn invalidate(&mut self, id: &str) {
        self.assets.remove(id);
        if let Some(watch) = self.watched.get_mut(id) {
            watch.generation += 1;
        }
    }

    fn invalidate_all(&mut self) {
        self.assets.clear();
        self.epoch += 1;
    }

    #[cfg(test)]
    fn watched_count(&self) -> usize {
        self.watched.len()
    }
}

/// Service state; failures before the last start do not degrade it
#[derive(Default)]
struct Lifecycle {
    running: bool,
    failures_at_start: u64,
}

struct RepositoryInner<B: ResourceBackend> {
    config: RepositoryConfig,
    coordinator: LoadCoordinator<B>,
    log: ScopedLog,
    store: RwLock<LocalStore<B::Resource>>,
    stats: Mutex<CacheStats>,
    lifecycle: Mutex<Lifecycle>,
    ready: EventTopic<AssetReady<B::Resource>>,
    progress: EventTopic<AssetProgress>,
    failed: EventTopic<AssetFailed>,
}

/// Two-tier asset repository
///
/// Cheap to clone; clones share caches, events and the coordinator.
pub struct AssetCache<B: ResourceBackend> {
    inner: Arc<RepositoryInner<B>>,
}

impl<B: ResourceBackend> Clone for AssetCache<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn is_blank(id: &str) -> bool {
    id.trim().is_empty()
}

impl<B: ResourceBackend> AssetCache<B> {
    /// Create a repository with its own coordinator on the current runtime
    pub fn new(backend: Arc<B>, config: RepositoryConfig) -> ContentResult<Self> {
        let coordinator_config = CoordinatorConfig {
            log_tag: format!("{}Provider", config.name),
            log_enabled: config.log_enabled,
            ..Default::default()
        };
        let coordinator = LoadCoordinator::new(backend, coordinator_config)?;
        Self::with_coordinator(coordinator, config)
    }

    /// Create a repository on top of an existing coordinator
    ///
    /// `unload_all` clears the whole coordinator, including keys loaded
    /// through other repositories sharing it.
    pub fn with_coordinator(
        coordinator: LoadCoordinator<B>,
        config: RepositoryConfig,
    ) -> ContentResult<Self> {
        config.validate()?;
        let log = ScopedLog::new(&config.name, config.log_enabled);
        Ok(Self {
            inner: Arc::new(RepositoryInner {
                coordinator,
                store: RwLock::new(LocalStore::new()),
                stats: Mutex::new(CacheStats::default()),
                lifecycle: Mutex::new(Lifecycle::default()),
                ready: EventTopic::new("asset_ready", log.clone()),
                progress: EventTopic::new("asset_progress", log.clone()),
                failed: EventTopic::new("asset_failed", log.clone()),
                log,
                config,
            }),
        })
    }

    /// Configuration the repository was created with
    pub fn config(&self) -> &RepositoryConfig {
        &self.inner.config
    }

    /// Coordinator owning the tier-2 handles
    pub fn coordinator(&self) -> &LoadCoordinator<B> {
        &self.inner.coordinator
    }

    /// Backend address for `id`
    pub fn address_for(&self, id: &str) -> String {
        self.inner.config.address_for(id)
    }

    /// Request an asset
    ///
    /// Cache hits and invalid ids are answered before this returns.
    pub fn get_asset(&self, id: &str, request: AssetRequest<B::Resource>) {
        self.inner.get_asset(id, request);
    }

    /// Request an asset and wait for it
    pub async fn get_asset_async(&self, id: &str) -> Result<B::Resource, LoadError> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let tx_failed = Arc::clone(&tx);

        self.get_asset(
            id,
            AssetRequest::new()
                .on_loaded(move |_, asset| {
                    if let Some(tx) = tx.lock().take() {
                        let _ = tx.send(Ok(asset));
                    }
                })
                .on_failed(move |_, error| {
                    if let Some(tx) = tx_failed.lock().take() {
                        let _ = tx.send(Err(error));
                    }
                }),
        );

        rx.await.unwrap_or_else(|_| {
            Err(LoadError::Cancelled {
                key: self.address_for(id),
            })
        })
    }

    /// Start loading every non-blank id; outcomes arrive as events
    pub fn preload_assets<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for id in ids {
            let id = id.as_ref();
            if !is_blank(id) {
                self.get_asset(id, AssetRequest::new());
            }
        }
    }

    /// Preload the ids listed in the configuration
    pub fn preload_configured(&self) {
        self.preload_assets(&self.inner.config.preload_ids);
    }

    /// Whether `id` is in the repository's own cache
    pub fn is_loaded(&self, id: &str) -> bool {
        !is_blank(id) && self.inner.store.read().assets.contains_key(id)
    }

    /// Resolved asset for `id`, without starting a load
    pub fn try_get_cached(&self, id: &str) -> Option<B::Resource> {
        if is_blank(id) {
            return None;
        }
        if let Some(asset) = self.inner.store.read().assets.get(id).cloned() {
            return Some(asset);
        }
        self.inner.provider_copy(id, &self.address_for(id))
    }

    /// Drop `id` from both tiers and release its backend handle
    pub fn unload(&self, id: &str) {
        if is_blank(id) {
            return;
        }
        // Tier 2 goes first: a copy that still sees it holds a token the
        // invalidation below refuses
        self.inner.coordinator.unload(&self.address_for(id));
        self.inner.store.write().invalidate(id);
        self.inner.log.info(format_args!("Unloaded: {}", id));
    }

    /// Drop everything from both tiers
    pub fn unload_all(&self) {
        self.inner.coordinator.unload_all();
        self.inner.store.write().invalidate_all();
        self.inner.log.info(format_args!("Unloaded all assets."));
    }

    /// Number of assets in the repository's own cache
    pub fn loaded_count(&self) -> usize {
        self.inner.store.read().assets.len()
    }

    /// Snapshot of the request counters
    pub fn stats(&self) -> CacheStats {
        self.inner.stats.lock().clone()
    }

    /// Listen for every successful request
    pub fn on_asset_ready<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AssetReady<B::Resource>) + Send + Sync + 'static,
    {
        self.inner.ready.subscribe(listener)
    }

    /// Listen for progress of delegated loads
    pub fn on_asset_progress<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AssetProgress) + Send + Sync + 'static,
    {
        self.inner.progress.subscribe(listener)
    }

    /// Listen for every failed request
    pub fn on_asset_failed<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&AssetFailed) + Send + Sync + 'static,
    {
        self.inner.failed.subscribe(listener)
    }

    /// Fail a request without touching the coordinator
    pub(crate) fn report_failure(&self, id: &str, error: LoadError, request: AssetRequest<B::Resource>) {
        self.inner.fail(id, error, request.on_failed);
    }
}

impl<B: ResourceBackend> RepositoryInner<B> {
    fn get_asset(self: &Arc<Self>, id: &str, request: AssetRequest<B::Resource>) {
        if is_blank(id) {
            self.fail(id, LoadError::InvalidId, request.on_failed);
            return;
        }

        // Tier 1
        let local = self.store.read().assets.get(id).cloned();
        if let Some(asset) = local {
            self.stats.lock().local_hits += 1;
            self.deliver_ready(id, asset, request);
            return;
        }

        // Tier 2
        let address = self.config.address_for(id);
        if let Some(asset) = self.provider_copy(id, &address) {
            self.stats.lock().provider_hits += 1;
            self.deliver_ready(id, asset, request);
            return;
        }

        // Backend
        self.stats.lock().loads_requested += 1;
        self.log.info(format_args!("Loading asset: {} ({})", id, address));

        let token = self.store.write().watch(id);
        let AssetRequest {
            on_loaded,
            on_progress,
            on_failed,
        } = request;

        let weak_loaded: Weak<Self> = Arc::downgrade(self);
        let weak_progress = weak_loaded.clone();
        let weak_failed = weak_loaded.clone();
        let id_loaded = id.to_string();
        let id_progress = id.to_string();
        let id_failed = id.to_string();

        self.coordinator.load(
            &address,
            LoadRequest::new()
                .on_loaded(move |asset| match weak_loaded.upgrade() {
                    Some(inner) => inner.complete(&id_loaded, token, asset, on_loaded),
                    None => {
                        if let Some(on_loaded) = on_loaded {
                            on_loaded(&id_loaded, asset);
                        }
                    }
                })
                .on_progress(move |percent| {
                    let Some(inner) = weak_progress.upgrade() else {
                        return;
                    };
                    if let Some(on_progress) = &on_progress {
                        inner
                            .log
                            .guarded("on_progress", || on_progress(&id_progress, percent));
                    }
                    inner.progress.emit(&AssetProgress {
                        id: id_progress.clone(),
                        percent,
                    });
                })
                .on_failed(move |error| match weak_failed.upgrade() {
                    Some(inner) => {
                        inner.store.write().settle(&id_failed, token, None);
                        inner.fail(&id_failed, error, on_failed);
                    }
                    None => {
                        if let Some(on_failed) = on_failed {
                            on_failed(&id_failed, error);
                        }
                    }
                }),
        );
    }

    /// Copy a resolved tier-2 asset into tier 1, unless `id` is unloaded
    /// meanwhile
    fn provider_copy(&self, id: &str, address: &str) -> Option<B::Resource> {
        let token = self.store.write().watch(id);
        let found = self.coordinator.try_get_cached(address);
        let current = self.store.write().settle(id, token, found.clone());
        if current {
            found
        } else {
            None
        }
    }

    /// Answer a request from cache
    fn deliver_ready(&self, id: &str, asset: B::Resource, request: AssetRequest<B::Resource>) {
        if let Some(on_progress) = request.on_progress {
            self.log.guarded("on_progress", || on_progress(id, 1.0));
        }
        if let Some(on_loaded) = request.on_loaded {
            let asset = asset.clone();
            self.log.guarded("on_loaded", move || on_loaded(id, asset));
        }
        self.ready.emit(&AssetReady {
            id: id.to_string(),
            asset,
        });
    }

    /// A delegated load succeeded
    fn complete(
        &self,
        id: &str,
        token: Token,
        asset: B::Resource,
        on_loaded: Option<AssetLoadedFn<B::Resource>>,
    ) {
        let cached = self.store.write().settle(id, token, Some(asset.clone()));
        if !cached {
            self.log.debug(format_args!(
                "'{}' was unloaded while loading; result not cached",
                id
            ));
        }

        self.stats.lock().loads_succeeded += 1;
        self.log.info(format_args!("Successfully loaded: {}", id));

        if let Some(on_loaded) = on_loaded {
            let asset = asset.clone();
            self.log.guarded("on_loaded", move || on_loaded(id, asset));
        }
        self.ready.emit(&AssetReady {
            id: id.to_string(),
            asset,
        });
    }

    fn fail(&self, id: &str, error: LoadError, on_failed: Option<AssetFailedFn>) {
        self.stats.lock().loads_failed += 1;
        self.log.error(format_args!("Request for '{}' failed: {}", id, error));

        let reason = error.to_string();
        if let Some(on_failed) = on_failed {
            self.log.guarded("on_failed", move || on_failed(id, error));
        }
        self.failed.emit(&AssetFailed {
            id: id.to_string(),
            reason,
        });
    }
}

impl<B: ResourceBackend> AssetCache<B> {
    /// Failed requests since the last start, `None` while stopped
    fn failures_since_start(&self) -> Option<u64> {
        let lifecycle = self.inner.lifecycle.lock();
        if !lifecycle.running {
            return None;
        }
        let failed = self.inner.stats.lock().loads_failed;
        Some(failed.saturating_sub(lifecycle.failures_at_start))
    }
}

impl<B: ResourceBackend> Service for AssetCache<B> {
    fn name(&self) -> &str {
        &self.inner.config.name
    }

    fn state(&self) -> ServiceState {
        match self.failures_since_start() {
            None => ServiceState::Stopped,
            Some(0) => ServiceState::Running,
            Some(_) => ServiceState::Degraded,
        }
    }

    fn health(&self) -> ServiceHealth {
        let health = match self.failures_since_start() {
            None => return ServiceHealth::stopped(),
            Some(0) => ServiceHealth::running(),
            Some(failures) => ServiceHealth::degraded(format!("{} failed loads", failures)),
        };
        health
            .with_metric("cached_assets", self.loaded_count() as f64)
            .with_metric("pending_loads", self.inner.coordinator.pending_count() as f64)
            .with_metric("cache_hit_rate", self.stats().hit_rate())
    }

    fn start(&mut self) -> ServiceResult<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.running {
                return Err(ServiceError::AlreadyRunning(self.inner.config.name.clone()));
            }
            lifecycle.running = true;
            lifecycle.failures_at_start = self.inner.stats.lock().loads_failed;
        }
        self.inner.log.info(format_args!("Started"));
        self.preload_configured();
        Ok(())
    }

    fn stop(&mut self) -> ServiceResult<()> {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if !lifecycle.running {
                return Err(ServiceError::NotRunning(self.inner.config.name.clone()));
            }
            lifecycle.running = false;
        }
        self.unload_all();
        self.inner.log.info(format_args!("Stopped"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    fn cache() -> (Arc<MemoryBackend<String>>, AssetCache<MemoryBackend<String>>) {
        let backend = Arc::new(MemoryBackend::new());
        let cache = AssetCache::new(Arc::clone(&backend), RepositoryConfig::default()).unwrap();
        (backend, cache)
    }

    #[tokio::test]
    async fn test_tiers() {
        let (backend, cache) = cache();
        backend.insert("bag/bundle-data.asset", "bag".to_string());

        assert_eq!(cache.get_asset_async("bag").await, Ok("bag".to_string()));
        assert!(cache.is_loaded("bag"));

        assert_eq!(cache.get_asset_async("bag").await, Ok("bag".to_string()));
        assert_eq!(backend.total_load_calls(), 1);

        let stats = cache.stats();
        assert_eq!(stats.loads_requested, 1);
        assert_eq!(stats.loads_succeeded, 1);
        assert_eq!(stats.local_hits, 1);
    }

    #[tokio::test]
    async fn test_provider_hit_populates_local_cache() {
        let (backend, cache) = cache();
        backend.insert("bag/bundle-data.asset", "bag".to_string());

        // Loaded through the coordinator directly, so only tier 2 has it
        cache
            .coordinator()
            .load_async("bag/bundle-data.asset")
            .await
            .unwrap();
        assert!(!cache.is_loaded("bag"));

        assert_eq!(cache.get_asset_async("bag").await, Ok("bag".to_string()));
        assert!(cache.is_loaded("bag"));
        assert_eq!(cache.stats().provider_hits, 1);
        assert_eq!(backend.total_load_calls(), 1);
    }

    #[tokio::test]
    async fn test_service_lifecycle() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert("a/bundle-data.asset", "a".to_string());
        let config = RepositoryConfig {
            name: "offerpacks".to_string(),
            preload_ids: vec!["a".to_string(), " ".to_string()],
            ..Default::default()
        };
        let mut cache = AssetCache::new(Arc::clone(&backend), config).unwrap();

        assert_eq!(cache.state(), ServiceState::Stopped);
        cache.start().unwrap();
        assert!(cache.start().is_err());
        assert_eq!(cache.state(), ServiceState::Running);
        assert_eq!(cache.name(), "offerpacks");

        // Preload of "a" was started by `start`; the blank id was skipped
        assert_eq!(cache.get_asset_async("a").await, Ok("a".to_string()));
        assert_eq!(backend.total_load_calls(), 1);

        let health = cache.health();
        assert_eq!(health.state, ServiceState::Running);
        assert_eq!(health.metrics.get("cached_assets"), Some(&1.0));

        cache.stop().unwrap();
        assert_eq!(cache.state(), ServiceState::Stopped);
        assert_eq!(cache.loaded_count(), 0);
        assert_eq!(backend.release_calls(), 1);
    }

    #[tokio::test]
    async fn test_failures_degrade_health() {
        let (backend, mut cache) = cache();
        backend.insert_failure("x/bundle-data.asset", "404");
        cache.start().unwrap();

        assert!(cache.get_asset_async("x").await.is_err());
        assert_eq!(cache.state(), ServiceState::Degraded);
        let health = cache.health();
        assert_eq!(health.state, ServiceState::Degraded);
        assert_eq!(health.detail.as_deref(), Some("1 failed loads"));

        // A restart forgets earlier failures
        cache.restart().unwrap();
        assert_eq!(cache.state(), ServiceState::Running);
        assert_eq!(cache.health().detail, None);
        assert_eq!(cache.stats().loads_failed, 1);

        assert!(cache.get_asset_async("x").await.is_err());
        assert_eq!(cache.health().detail.as_deref(), Some("1 failed loads"));
    }

    #[tokio::test]
    async fn test_failures_while_stopped_do_not_degrade() {
        let (backend, mut cache) = cache();
        backend.insert_failure("x/bundle-data.asset", "404");

        assert!(cache.get_asset_async("x").await.is_err());
        assert_eq!(cache.state(), ServiceState::Stopped);
        assert_eq!(cache.health().state, ServiceState::Stopped);

        cache.start().unwrap();
        assert_eq!(cache.state(), ServiceState::Running);
    }

    #[tokio::test]
    async fn test_watches_are_released() {
        let (backend, cache) = cache();
        backend.insert("a/bundle-data.asset", "a".to_string());
        backend.insert_failure("x/bundle-data.asset", "404");

        cache.get_asset_async("a").await.unwrap();
        assert!(cache.get_asset_async("x").await.is_err());
        cache.unload("a");
        cache.unload("never-requested");
        assert!(cache.try_get_cached("missing").is_none());

        assert_eq!(cache.inner.store.read().watched_count(), 0);
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            local_hits: 2,
            provider_hits: 1,
            loads_requested: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.75).abs() < 1e-9);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
