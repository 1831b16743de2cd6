//! Backend boundary
//!
//! The asynchronous resource-delivery subsystem is external. The core only
//! talks to it through these two traits.

use crate::error::BackendError;
use crate::operation::OperationHandle;

/// Resolves keys into resources
pub trait ResourceBackend: Send + Sync + 'static {
    /// Resource type handed out to consumers
    type Resource: Clone + Send + Sync + 'static;

    /// Start loading `key`
    ///
    /// An `Err` means the operation could not even start. Otherwise the
    /// returned handle settles later as succeeded or failed.
    fn load_async(&self, key: &str) -> Result<OperationHandle<Self::Resource>, BackendError>;

    /// Release a handle obtained from `load_async`. Must be idempotent.
    fn release(&self, handle: &OperationHandle<Self::Resource>) {
        handle.release();
    }
}

/// Bulk dependency fetching, separate from per-asset data loads
pub trait ContentDownloader: Send + Sync + 'static {
    /// Bytes still to download for `keys` (0 if everything is local)
    fn download_size(&self, keys: &[String]) -> OperationHandle<u64>;

    /// Download everything `keys` depend on; settles with the bytes fetched
    fn download_dependencies(&self, keys: &[String]) -> OperationHandle<u64>;
}
