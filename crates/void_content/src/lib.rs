//! # Void Content
//!
//! Coalescing asset loading on top of an asynchronous resource backend.
//!
//! Layers:
//! - `LoadCoordinator`: one backend load per key, concurrent requests
//!   queued on it, progress fan-out, explicit unload
//! - `AssetCache`: logical ids mapped to backend addresses, its own
//!   resolved cache, ready/progress/failed events, preload and unload
//! - `Prefetcher`: download size query and bulk dependency download
//!   ahead of the data load
//!
//! The backend itself is external and plugs in through `ResourceBackend`
//! and `ContentDownloader`. `MemoryBackend` implements both.
//!
//! ## Usage
//!
//! ```ignore
//! let backend = Arc::new(MemoryBackend::new());
//! backend.insert("offerpack-bag/bundle-data.asset", bundle);
//!
//! let cache = AssetCache::new(backend, RepositoryConfig::default())?;
//! let _ready = cache.on_asset_ready(|e| log::info!("{} ready", e.id));
//!
//! cache.get_asset(
//!     "offerpack-bag",
//!     AssetRequest::new()
//!         .on_progress(|id, p| log::debug!("{}: {:.0}%", id, p * 100.0))
//!         .on_failed(|id, e| log::warn!("{}: {}", id, e)),
//! );
//!
//! let bundle = cache.get_asset_async("offerpack-bag").await?;
//! ```

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod logging;
pub mod memory;
pub mod operation;
pub mod prefetch;
pub mod repository;
pub mod request;
pub mod service;

pub use backend::{ContentDownloader, ResourceBackend};
pub use config::{CoordinatorConfig, DownloaderConfig, RepositoryConfig, ID_PLACEHOLDER};
pub use coordinator::LoadCoordinator;
pub use error::{BackendError, ContentError, ContentResult, ErrorKind, LoadError};
pub use events::{AssetFailed, AssetProgress, AssetReady, EventTopic, Subscription};
pub use logging::ScopedLog;
pub use memory::MemoryBackend;
pub use operation::{OperationHandle, OperationStatus};
pub use prefetch::{format_bytes, PrefetchState, Prefetcher};
pub use repository::{AssetCache, AssetRequest, CacheStats};
pub use request::LoadRequest;
pub use service::{Service, ServiceError, ServiceHealth, ServiceResult, ServiceState};

/// Prelude for common imports
pub mod prelude {
    pub use crate::backend::{ContentDownloader, ResourceBackend};
    pub use crate::config::{CoordinatorConfig, DownloaderConfig, RepositoryConfig};
    pub use crate::coordinator::LoadCoordinator;
    pub use crate::error::LoadError;
    pub use crate::prefetch::Prefetcher;
    pub use crate::repository::{AssetCache, AssetRequest};
    pub use crate::request::LoadRequest;
    pub use crate::service::Service;
}
