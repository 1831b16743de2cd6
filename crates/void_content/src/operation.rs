//! Backend operation handles
//!
//! An `OperationHandle` is one asynchronous backend request:
//! - Status (pending, succeeded, failed)
//! - Fractional progress while pending
//! - Result value or error message once done
//! - Validity (cleared by `release`)
//!
//! Clones share the same operation. Backends create and complete handles,
//! the coordinator observes and releases them.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

/// Operation status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    /// Still running
    Pending,
    /// Finished with a value
    Succeeded,
    /// Finished with an error message
    Failed,
}

struct OperationState<T> {
    status: OperationStatus,
    percent: f32,
    result: Option<T>,
    error: Option<String>,
    valid: bool,
}

struct OperationShared<T> {
    state: Mutex<OperationState<T>>,
    /// Flips to `true` once the operation is done or released
    settled: watch::Sender<bool>,
}

/// Shared handle to a backend operation
pub struct OperationHandle<T> {
    shared: Arc<OperationShared<T>>,
}

impl<T: Clone> OperationHandle<T> {
    /// Create a pending operation
    pub fn pending() -> Self {
        let (settled, _) = watch::channel(false);
        Self {
            shared: Arc::new(OperationShared {
                state: Mutex::new(OperationState {
                    status: OperationStatus::Pending,
                    percent: 0.0,
                    result: None,
                    error: None,
                    valid: true,
                }),
                settled,
            }),
        }
    }

    /// Create an operation that already succeeded
    pub fn succeeded(value: T) -> Self {
        let handle = Self::pending();
        handle.complete(value);
        handle
    }

    /// Create an operation that already failed
    pub fn failed(message: impl Into<String>) -> Self {
        let handle = Self::pending();
        handle.fail(message);
        handle
    }

    /// Report progress in `[0, 1]`
    ///
    /// Ignored once the operation is done or released. Progress never goes
    /// backwards.
    pub fn set_progress(&self, percent: f32) {
        let mut state = self.shared.state.lock();
        if state.status == OperationStatus::Pending && state.valid {
            state.percent = state.percent.max(percent.clamp(0.0, 1.0));
        }
    }

    /// Finish with a value. Returns `false` if already done or released.
    pub fn complete(&self, value: T) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.status != OperationStatus::Pending || !state.valid {
                return false;
            }
            state.status = OperationStatus::Succeeded;
            state.percent = 1.0;
            state.result = Some(value);
        }
        self.shared.settled.send_replace(true);
        true
    }

    /// Finish with an error. Returns `false` if already done or released.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.status != OperationStatus::Pending || !state.valid {
                return false;
            }
            state.status = OperationStatus::Failed;
            state.error = Some(message.into());
        }
        self.shared.settled.send_replace(true);
        true
    }

    /// Invalidate the handle and drop its result
    ///
    /// Idempotent: only the first call returns `true`.
    pub fn release(&self) -> bool {
        {
            let mut state = self.shared.state.lock();
            if !state.valid {
                return false;
            }
            state.valid = false;
            state.result = None;
        }
        self.shared.settled.send_replace(true);
        true
    }

    /// Current status
    pub fn status(&self) -> OperationStatus {
        self.shared.state.lock().status
    }

    /// Progress in `[0, 1]`; 1.0 once succeeded
    pub fn percent_complete(&self) -> f32 {
        self.shared.state.lock().percent
    }

    /// Succeeded or failed
    pub fn is_done(&self) -> bool {
        self.status() != OperationStatus::Pending
    }

    /// False once released
    pub fn is_valid(&self) -> bool {
        self.shared.state.lock().valid
    }

    /// The value, if the operation succeeded and is still valid
    pub fn result(&self) -> Option<T> {
        let state = self.shared.state.lock();
        if state.valid && state.status == OperationStatus::Succeeded {
            state.result.clone()
        } else {
            None
        }
    }

    /// The error message, if the operation failed
    pub fn error(&self) -> Option<String> {
        self.shared.state.lock().error.clone()
    }

    /// Wait until the operation is done or released
    pub async fn completed(&self) -> OperationStatus {
        let mut settled = self.shared.settled.subscribe();
        // Never errors: the sender lives as long as `self`
        let _ = settled.wait_for(|done| *done).await;
        self.status()
    }

    /// Whether two handles refer to the same operation
    pub fn same_operation(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T> Clone for OperationHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for OperationHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("OperationHandle")
            .field("status", &state.status)
            .field("percent", &state.percent)
            .field("valid", &state.valid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete() {
        let handle: OperationHandle<u32> = OperationHandle::pending();
        assert!(!handle.is_done());
        assert!(handle.is_valid());

        handle.set_progress(0.4);
        assert!((handle.percent_complete() - 0.4).abs() < f32::EPSILON);

        assert!(handle.complete(7));
        assert!(!handle.complete(8));
        assert_eq!(handle.status(), OperationStatus::Succeeded);
        assert_eq!(handle.result(), Some(7));
        assert!((handle.percent_complete() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_progress_never_regresses() {
        let handle: OperationHandle<u32> = OperationHandle::pending();
        handle.set_progress(0.6);
        handle.set_progress(0.2);
        assert!((handle.percent_complete() - 0.6).abs() < f32::EPSILON);
        handle.set_progress(3.0);
        assert!((handle.percent_complete() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_fail() {
        let handle: OperationHandle<u32> = OperationHandle::failed("404");
        assert_eq!(handle.status(), OperationStatus::Failed);
        assert_eq!(handle.error().as_deref(), Some("404"));
        assert_eq!(handle.result(), None);
    }

    #[test]
    fn test_release_is_idempotent() {
        let handle = OperationHandle::succeeded("asset".to_string());
        let clone = handle.clone();
        assert!(handle.same_operation(&clone));

        assert!(clone.release());
        assert!(!handle.release());
        assert!(!handle.is_valid());
        assert_eq!(handle.result(), None);
    }

    #[tokio::test]
    async fn test_completed_wakes_on_release() {
        let handle: OperationHandle<u32> = OperationHandle::pending();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.completed().await });

        handle.release();
        assert_eq!(task.await.unwrap(), OperationStatus::Pending);
    }
}
