//! In-memory backend
//!
//! Serves resources registered up front. Useful for tests, tools and for
//! embedding content that ships with the binary.
//!
//! Keys can be:
//! - registered with a value or a failure reason
//! - made to fail before the operation starts
//! - gated, so their handles stay pending until `resolve` is called
//!
//! With a latency configured, loads settle on the runtime after ramping
//! progress in four steps.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;

use crate::backend::{ContentDownloader, ResourceBackend};
use crate::error::BackendError;
use crate::operation::OperationHandle;

#[derive(Clone)]
enum Entry<R> {
    Ready(R),
    Missing(String),
}

#[derive(Default)]
struct Counters {
    loads: HashMap<String, usize>,
    releases: usize,
    size_queries: usize,
    downloads: usize,
}

/// Backend serving registered in-memory resources
pub struct MemoryBackend<R> {
    entries: RwLock<HashMap<String, Entry<R>>>,
    start_failures: RwLock<HashMap<String, String>>,
    gated: RwLock<HashSet<String>>,
    held: Mutex<HashMap<String, Vec<OperationHandle<R>>>>,
    download_sizes: RwLock<HashMap<String, u64>>,
    size_failures: RwLock<HashSet<String>>,
    download_failures: RwLock<HashSet<String>>,
    downloaded: Mutex<HashSet<String>>,
    latency: Option<(Duration, Handle)>,
    counters: Mutex<Counters>,
    journal: Mutex<Vec<String>>,
}

impl<R: Clone + Send + Sync + 'static> MemoryBackend<R> {
    /// Create an empty backend
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            start_failures: RwLock::new(HashMap::new()),
            gated: RwLock::new(HashSet::new()),
            held: Mutex::new(HashMap::new()),
            download_sizes: RwLock::new(HashMap::new()),
            size_failures: RwLock::new(HashSet::new()),
            download_failures: RwLock::new(HashSet::new()),
            downloaded: Mutex::new(HashSet::new()),
            latency: None,
            counters: Mutex::new(Counters::default()),
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Settle ungated loads after `latency` on `runtime`
    pub fn with_latency(mut self, latency: Duration, runtime: Handle) -> Self {
        self.latency = Some((latency, runtime));
        self
    }

    /// Register a resource
    pub fn insert(&self, key: impl Into<String>, value: R) {
        self.entries.write().insert(key.into(), Entry::Ready(value));
    }

    /// Register a key whose load fails with `reason`
    pub fn insert_failure(&self, key: impl Into<String>, reason: impl Into<String>) {
        self.entries
            .write()
            .insert(key.into(), Entry::Missing(reason.into()));
    }

    /// Make `load_async` return an error for `key`
    pub fn fail_on_start(&self, key: impl Into<String>, reason: impl Into<String>) {
        self.start_failures.write().insert(key.into(), reason.into());
    }

    /// Keep loads of `key` pending until `resolve`
    pub fn gate(&self, key: impl Into<String>) {
        self.gated.write().insert(key.into());
    }

    /// Report progress on every pending load of `key`
    pub fn set_progress(&self, key: &str, percent: f32) {
        if let Some(handles) = self.held.lock().get(key) {
            for handle in handles {
                handle.set_progress(percent);
            }
        }
    }

    /// Settle every pending load of `key` from its registered entry
    ///
    /// Returns the number of handles settled.
    pub fn resolve(&self, key: &str) -> usize {
        let handles = self.held.lock().remove(key).unwrap_or_default();
        let entry = self.entry(key);
        let mut settled = 0;
        for handle in handles {
            if Self::settle(&handle, &entry) {
                settled += 1;
            }
        }
        settled
    }

    /// Number of pending loads held for `key`
    pub fn held_count(&self, key: &str) -> usize {
        self.held.lock().get(key).map_or(0, Vec::len)
    }

    /// Bytes `download_size` reports for `key` until it is downloaded
    pub fn set_download_size(&self, key: impl Into<String>, bytes: u64) {
        self.download_sizes.write().insert(key.into(), bytes);
    }

    /// Make size queries involving `key` fail
    pub fn fail_size_query(&self, key: impl Into<String>) {
        self.size_failures.write().insert(key.into());
    }

    /// Make downloads involving `key` fail
    pub fn fail_download(&self, key: impl Into<String>) {
        self.download_failures.write().insert(key.into());
    }

    /// Backend loads started for `key`
    pub fn load_calls(&self, key: &str) -> usize {
        self.counters.lock().loads.get(key).copied().unwrap_or(0)
    }

    /// Backend loads started for any key
    pub fn total_load_calls(&self) -> usize {
        self.counters.lock().loads.values().sum()
    }

    /// Handles actually released (repeated releases are not counted)
    pub fn release_calls(&self) -> usize {
        self.counters.lock().releases
    }

    /// Size queries received
    pub fn size_queries(&self) -> usize {
        self.counters.lock().size_queries
    }

    /// Dependency downloads started
    pub fn download_calls(&self) -> usize {
        self.counters.lock().downloads
    }

    /// Backend calls in the order they happened (`size:..`, `download:..`, `load:..`)
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    fn entry(&self, key: &str) -> Entry<R> {
        self.entries
            .read()
            .get(key)
            .cloned()
            .unwrap_or_else(|| Entry::Missing(format!("No resource registered for '{}'", key)))
    }

    fn settle(handle: &OperationHandle<R>, entry: &Entry<R>) -> bool {
        match entry {
            Entry::Ready(value) => handle.complete(value.clone()),
            Entry::Missing(reason) => handle.fail(reason.clone()),
        }
    }

    fn record(&self, line: String) {
        self.journal.lock().push(line);
    }

    fn first_listed(set: &RwLock<HashSet<String>>, keys: &[String]) -> Option<String> {
        let set = set.read();
        keys.iter().find(|k| set.contains(*k)).cloned()
    }

    fn remaining_bytes(&self, keys: &[String]) -> u64 {
        let sizes = self.download_sizes.read();
        let downloaded = self.downloaded.lock();
        keys.iter()
            .filter(|k| !downloaded.contains(*k))
            .filter_map(|k| sizes.get(k))
            .sum()
    }
}

impl<R: Clone + Send + Sync + 'static> Default for MemoryBackend<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Clone + Send + Sync + 'static> ResourceBackend for MemoryBackend<R> {
    type Resource = R;

    fn load_async(&self, key: &str) -> Result<OperationHandle<R>, BackendError> {
        *self.counters.lock().loads.entry(key.to_string()).or_insert(0) += 1;
        self.record(format!("load:{}", key));

        if let Some(reason) = self.start_failures.read().get(key) {
            return Err(BackendError::new(reason.clone()));
        }

        let handle = OperationHandle::pending();
        if self.gated.read().contains(key) {
            self.held
                .lock()
                .entry(key.to_string())
                .or_default()
                .push(handle.clone());
            return Ok(handle);
        }

        let entry = self.entry(key);
        match &self.latency {
            Some((latency, runtime)) => {
                let latency = *latency;
                let pending = handle.clone();
                runtime.spawn(async move {
                    let step = latency / 4;
                    for i in 1..4 {
                        tokio::time::sleep(step).await;
                        pending.set_progress(i as f32 / 4.0);
                    }
                    tokio::time::sleep(step).await;
                    Self::settle(&pending, &entry);
                });
            }
            None => {
                Self::settle(&handle, &entry);
            }
        }
        Ok(handle)
    }

    fn release(&self, handle: &OperationHandle<R>) {
        if handle.release() {
            self.counters.lock().releases += 1;
        }
    }
}

impl<R: Clone + Send + Sync + 'static> ContentDownloader for MemoryBackend<R> {
    fn download_size(&self, keys: &[String]) -> OperationHandle<u64> {
        self.counters.lock().size_queries += 1;
        self.record(format!("size:{}", keys.join(",")));

        match Self::first_listed(&self.size_failures, keys) {
            Some(key) => OperationHandle::failed(format!("Unknown content key '{}'", key)),
            None => OperationHandle::succeeded(self.remaining_bytes(keys)),
        }
    }

    fn download_dependencies(&self, keys: &[String]) -> OperationHandle<u64> {
        self.counters.lock().downloads += 1;
        self.record(format!("download:{}", keys.join(",")));

        if let Some(key) = Self::first_listed(&self.download_failures, keys) {
            return OperationHandle::failed(format!("Download of '{}' failed", key));
        }
        let bytes = self.remaining_bytes(keys);
        self.downloaded.lock().extend(keys.iter().cloned());
        OperationHandle::succeeded(bytes)
    }
}
