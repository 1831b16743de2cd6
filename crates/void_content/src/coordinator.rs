//! Load coordinator
//!
//! Owns per-key in-flight state on top of a `ResourceBackend`:
//! - At most one outstanding backend load per key
//! - Concurrent requests for a key are queued on the in-flight load
//! - Every queued request gets exactly one terminal callback
//! - One progress poller per in-flight key, only if someone wants progress
//!
//! Completion watchers and pollers run on the tokio runtime captured at
//! construction. They hold weak references, so dropping the last
//! coordinator clone releases every handle and cancels every pending
//! request.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::backend::ResourceBackend;
use crate::config::CoordinatorConfig;
use crate::error::{ContentResult, LoadError};
use crate::logging::ScopedLog;
use crate::operation::{OperationHandle, OperationStatus};
use crate::request::{LoadRequest, RequestSink};

/// One in-flight load episode for a key
struct InFlight<R> {
    episode: u64,
    /// Set once the backend call returned
    handle: Option<OperationHandle<R>>,
    requests: Vec<Arc<RequestSink<R>>>,
    poller: Option<AbortHandle>,
}

impl<R> InFlight<R> {
    fn wants_progress(&self) -> bool {
        self.requests.iter().any(|r| r.wants_progress())
    }

    fn stop_poller(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

struct CoordinatorState<R> {
    /// Backend handles by key, in flight or resolved
    handles: HashMap<String, OperationHandle<R>>,
    /// Pending queues by key
    pending: HashMap<String, InFlight<R>>,
    next_episode: u64,
}

struct CoordinatorInner<B: ResourceBackend> {
    backend: Arc<B>,
    config: CoordinatorConfig,
    log: ScopedLog,
    runtime: Handle,
    state: Mutex<CoordinatorState<B::Resource>>,
}

/// Deduplicating loader in front of a `ResourceBackend`
pub struct LoadCoordinator<B: ResourceBackend> {
    inner: Arc<CoordinatorInner<B>>,
}

impl<B: ResourceBackend> Clone for LoadCoordinator<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A handle is servable from cache if it is valid, done and succeeded
fn cached_value<R: Clone>(handle: &OperationHandle<R>) -> Option<R> {
    if handle.is_valid() && handle.is_done() && handle.status() == OperationStatus::Succeeded {
        handle.result()
    } else {
        None
    }
}

fn is_blank(key: &str) -> bool {
    key.trim().is_empty()
}

impl<B: ResourceBackend> LoadCoordinator<B> {
    /// Create a coordinator on the current tokio runtime
    pub fn new(backend: Arc<B>, config: CoordinatorConfig) -> ContentResult<Self> {
        let runtime = Handle::try_current()?;
        Ok(Self::with_runtime(backend, config, runtime))
    }

    /// Create a coordinator on an explicit runtime
    pub fn with_runtime(backend: Arc<B>, config: CoordinatorConfig, runtime: Handle) -> Self {
        let log = ScopedLog::new(&config.log_tag, config.log_enabled);
        Self {
            inner: Arc::new(CoordinatorInner {
                backend,
                config,
                log,
                runtime,
                state: Mutex::new(CoordinatorState {
                    handles: HashMap::new(),
                    pending: HashMap::new(),
                    next_episode: 0,
                }),
            }),
        }
    }

    /// The backend this coordinator loads from
    pub fn backend(&self) -> &Arc<B> {
        &self.inner.backend
    }

    /// Configuration the coordinator was created with
    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Load `key`, delivering the outcome through `request`
    ///
    /// Never blocks. Cache hits and invalid input are answered before this
    /// returns; everything else is answered from the runtime.
    pub fn load(&self, key: &str, request: LoadRequest<B::Resource>) {
        self.inner.load(key, request);
    }

    /// Load `key` and wait for the outcome
    pub async fn load_async(&self, key: &str) -> Result<B::Resource, LoadError> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let tx_failed = Arc::clone(&tx);

        self.load(
            key,
            LoadRequest::new()
                .on_loaded(move |value| {
                    if let Some(tx) = tx.lock().take() {
                        let _ = tx.send(Ok(value));
                    }
                })
                .on_failed(move |error| {
                    if let Some(tx) = tx_failed.lock().take() {
                        let _ = tx.send(Err(error));
                    }
                }),
        );

        rx.await.unwrap_or_else(|_| {
            Err(LoadError::Cancelled {
                key: key.to_string(),
            })
        })
    }

    /// Resolved resource for `key`, without starting a load
    pub fn try_get_cached(&self, key: &str) -> Option<B::Resource> {
        if is_blank(key) {
            return None;
        }
        let state = self.inner.state.lock();
        state.handles.get(key).and_then(cached_value)
    }

    /// Whether a backend load for `key` is outstanding
    pub fn is_loading(&self, key: &str) -> bool {
        self.inner.state.lock().pending.contains_key(key)
    }

    /// Number of keys with an outstanding load
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Number of keys with a servable cached resource
    pub fn cached_count(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .handles
            .values()
            .filter(|h| cached_value(h).is_some())
            .count()
    }

    /// Drop `key`: cancel its pending queue and release its handle
    pub fn unload(&self, key: &str) {
        self.inner.unload(key);
    }

    /// Drop every key
    pub fn unload_all(&self) {
        self.inner.unload_all();
        self.inner.log.info(format_args!("Unloaded all assets."));
    }
}

impl<B: ResourceBackend> CoordinatorInner<B> {
    fn load(self: &Arc<Self>, key: &str, request: LoadRequest<B::Resource>) {
        if is_blank(key) {
            request.reject(LoadError::EmptyKey, &self.log);
            return;
        }
        if !request.has_on_loaded() {
            request.reject(LoadError::MissingCallback, &self.log);
            return;
        }

        let sink = Arc::new(RequestSink::new(request));
        let mut state = self.state.lock();

        // Already resolved
        let cached = state.handles.get(key).and_then(cached_value);
        if let Some(value) = cached {
            drop(state);
            sink.succeed(value, &self.log);
            return;
        }

        // Already loading: queue behind the outstanding load
        if let Some(flight) = state.pending.get_mut(key) {
            let wants_progress = sink.wants_progress();
            flight.requests.push(sink);
            if wants_progress && flight.poller.is_none() {
                if let Some(handle) = flight.handle.clone() {
                    flight.poller = Some(self.spawn_poller(key, flight.episode, handle));
                }
            }
            let queued = flight.requests.len();
            drop(state);
            self.log.debug(format_args!(
                "Joined in-flight load of '{}' ({} waiting)",
                key, queued
            ));
            return;
        }

        // Start a new load
        let episode = state.next_episode;
        state.next_episode += 1;
        state.pending.insert(
            key.to_string(),
            InFlight {
                episode,
                handle: None,
                requests: vec![sink],
                poller: None,
            },
        );
        drop(state);

        // The backend is called without holding the lock; requests arriving
        // meanwhile join the queue inserted above.
        let started = self.backend.load_async(key);

        let mut state = self.state.lock();
        let current = state
            .pending
            .get(key)
            .is_some_and(|flight| flight.episode == episode);

        match started {
            Err(error) => {
                let requests = if current {
                    state.pending.remove(key).map(|f| f.requests).unwrap_or_default()
                } else {
                    Vec::new()
                };
                drop(state);

                let error = LoadError::StartFailed {
                    key: key.to_string(),
                    reason: error.to_string(),
                };
                self.log.error(format_args!("{}", error));
                for request in requests {
                    request.fail(error.clone(), &self.log);
                }
            }
            Ok(handle) if !current => {
                drop(state);
                self.log.debug(format_args!(
                    "Load of '{}' was unloaded while starting; releasing",
                    key
                ));
                self.backend.release(&handle);
            }
            Ok(handle) => {
                let replaced = state.handles.insert(key.to_string(), handle.clone());
                if let Some(flight) = state.pending.get_mut(key) {
                    flight.handle = Some(handle.clone());
                    if flight.wants_progress() {
                        flight.poller = Some(self.spawn_poller(key, episode, handle.clone()));
                    }
                }
                drop(state);

                if let Some(old) = replaced {
                    self.backend.release(&old);
                }
                self.log.info(format_args!("Started loading '{}'", key));
                self.spawn_watcher(key, episode, handle);
            }
        }
    }

    /// Wait for the backend and resolve the episode
    fn spawn_watcher(self: &Arc<Self>, key: &str, episode: u64, handle: OperationHandle<B::Resource>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let key = key.to_string();
        self.runtime.spawn(async move {
            handle.completed().await;
            match weak.upgrade() {
                Some(inner) => inner.resolve(&key, episode, &handle),
                None => {
                    handle.release();
                }
            }
        });
    }

    /// Periodically forward backend progress to the queued requests
    fn spawn_poller(
        self: &Arc<Self>,
        key: &str,
        episode: u64,
        handle: OperationHandle<B::Resource>,
    ) -> AbortHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        let key = key.to_string();
        let period = Duration::from_millis(self.config.progress_interval_ms.max(1));

        let task = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if !handle.is_valid() || handle.is_done() {
                    break;
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let listeners: Vec<_> = {
                    let state = inner.state.lock();
                    match state.pending.get(&key) {
                        Some(flight) if flight.episode == episode => flight
                            .requests
                            .iter()
                            .filter(|r| r.wants_progress())
                            .cloned()
                            .collect(),
                        _ => break,
                    }
                };
                let percent = handle.percent_complete();
                for listener in listeners {
                    listener.progress(percent, &inner.log);
                }
            }
        });
        task.abort_handle()
    }

    fn resolve(&self, key: &str, episode: u64, handle: &OperationHandle<B::Resource>) {
        let mut state = self.state.lock();
        let mut flight = match state.pending.remove(key) {
            Some(flight) if flight.episode == episode => flight,
            other => {
                // Unloaded (and maybe restarted) while the backend was busy
                if let Some(newer) = other {
                    state.pending.insert(key.to_string(), newer);
                }
                drop(state);
                self.log.debug(format_args!(
                    "Discarding stale result for '{}' (unloaded while in flight)",
                    key
                ));
                self.backend.release(handle);
                return;
            }
        };
        flight.stop_poller();

        match cached_value(handle) {
            Some(value) => {
                drop(state);
                self.log.info(format_args!("Successfully loaded '{}'", key));
                for request in flight.requests {
                    request.succeed(value.clone(), &self.log);
                }
            }
            None => {
                if state
                    .handles
                    .get(key)
                    .is_some_and(|h| h.same_operation(handle))
                {
                    state.handles.remove(key);
                }
                drop(state);

                let reason = handle
                    .error()
                    .unwrap_or_else(|| format!("status: {:?}", handle.status()));
                let error = LoadError::ResolutionFailed {
                    key: key.to_string(),
                    reason,
                };
                self.log.error(format_args!("{}", error));
                self.backend.release(handle);
                for request in flight.requests {
                    request.fail(error.clone(), &self.log);
                }
            }
        }
    }

    fn unload(&self, key: &str) {
        if is_blank(key) {
            return;
        }

        let (flight, handle) = {
            let mut state = self.state.lock();
            (state.pending.remove(key), state.handles.remove(key))
        };

        if let Some(handle) = handle {
            if handle.is_valid() {
                self.log.info(format_args!("Unloaded '{}'", key));
            }
            self.backend.release(&handle);
        }
        if let Some(flight) = flight {
            self.cancel(key, flight);
        }
    }

    fn unload_all(&self) {
        let (pending, handles) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.handles),
            )
        };

        for handle in handles.values() {
            self.backend.release(handle);
        }
        for (key, flight) in pending {
            self.cancel(&key, flight);
        }
    }

    fn cancel(&self, key: &str, mut flight: InFlight<B::Resource>) {
        flight.stop_poller();
        if let Some(handle) = &flight.handle {
            self.backend.release(handle);
        }
        let error = LoadError::Cancelled {
            key: key.to_string(),
        };
        for request in flight.requests {
            request.fail(error.clone(), &self.log);
        }
    }
}

impl<B: ResourceBackend> Drop for CoordinatorInner<B> {
    fn drop(&mut self) {
        self.unload_all();
    }
}
