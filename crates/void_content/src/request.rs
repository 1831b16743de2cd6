//! Load requests and their delivery sinks
//!
//! A `LoadRequest` bundles the callbacks of one `load` call. Once queued it
//! becomes a `RequestSink`, which guarantees:
//! - exactly one terminal callback (loaded or failed)
//! - no progress after the terminal callback
//! - non-decreasing progress values
//!
//! Delivery to one sink is serialized across threads. The lock is
//! reentrant so a callback may call back into the coordinator for the same
//! request without deadlocking.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::ReentrantMutex;

use crate::error::LoadError;
use crate::logging::ScopedLog;

/// Success callback
pub type LoadedFn<R> = Box<dyn FnOnce(R) + Send>;
/// Progress callback, called with values in `[0, 1]`
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;
/// Failure callback
pub type FailedFn = Box<dyn FnOnce(LoadError) + Send>;

/// Callbacks for one load
pub struct LoadRequest<R> {
    on_loaded: Option<LoadedFn<R>>,
    on_progress: Option<ProgressFn>,
    on_failed: Option<FailedFn>,
}

impl<R> LoadRequest<R> {
    /// Empty request; `on_loaded` is required before loading
    pub fn new() -> Self {
        Self {
            on_loaded: None,
            on_progress: None,
            on_failed: None,
        }
    }

    /// Called once with the resource on success
    pub fn on_loaded<F>(mut self, f: F) -> Self
    where
        F: FnOnce(R) + Send + 'static,
    {
        self.on_loaded = Some(Box::new(f));
        self
    }

    /// Called with strictly increasing progress while loading
    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: Fn(f32) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(f));
        self
    }

    /// Called once if the load fails or is cancelled
    pub fn on_failed<F>(mut self, f: F) -> Self
    where
        F: FnOnce(LoadError) + Send + 'static,
    {
        self.on_failed = Some(Box::new(f));
        self
    }

    /// Whether a success callback is set
    pub fn has_on_loaded(&self) -> bool {
        self.on_loaded.is_some()
    }

    /// Whether a progress callback is set
    pub fn wants_progress(&self) -> bool {
        self.on_progress.is_some()
    }

    /// Fail without ever queueing
    pub(crate) fn reject(self, error: LoadError, log: &ScopedLog) {
        if let Some(on_failed) = self.on_failed {
            log.guarded("on_failed", move || on_failed(error));
        }
    }
}

impl<R> Default for LoadRequest<R> {
    fn default() -> Self {
        Self::new()
    }
}

struct SinkSlot<R> {
    on_loaded: Option<LoadedFn<R>>,
    on_progress: Option<ProgressFn>,
    on_failed: Option<FailedFn>,
    last_progress: Option<f32>,
    finished: bool,
}

/// A queued request
pub(crate) struct RequestSink<R> {
    slot: ReentrantMutex<RefCell<SinkSlot<R>>>,
    wants_progress: bool,
}

impl<R> RequestSink<R> {
    pub(crate) fn new(request: LoadRequest<R>) -> Self {
        let wants_progress = request.wants_progress();
        Self {
            slot: ReentrantMutex::new(RefCell::new(SinkSlot {
                on_loaded: request.on_loaded,
                on_progress: request.on_progress,
                on_failed: request.on_failed,
                last_progress: None,
                finished: false,
            })),
            wants_progress,
        }
    }

    pub(crate) fn wants_progress(&self) -> bool {
        self.wants_progress
    }

    /// Deliver a progress value if it moves forward
    pub(crate) fn progress(&self, percent: f32, log: &ScopedLog) {
        let guard = self.slot.lock();
        let callback = {
            let mut slot = guard.borrow_mut();
            if slot.finished {
                return;
            }
            let percent = percent.clamp(0.0, 1.0);
            if slot.last_progress.is_some_and(|last| percent <= last) {
                return;
            }
            match &slot.on_progress {
                Some(callback) => {
                    let callback = Arc::clone(callback);
                    slot.last_progress = Some(percent);
                    (callback, percent)
                }
                None => return,
            }
        };
        let (callback, percent) = callback;
        log.guarded("on_progress", || callback(percent));
    }

    /// Deliver the final 100% and the resource. Returns `false` if this
    /// sink already received its terminal callback.
    pub(crate) fn succeed(&self, value: R, log: &ScopedLog) -> bool {
        let guard = self.slot.lock();
        if guard.borrow().finished {
            return false;
        }
        self.progress(1.0, log);

        let on_loaded = {
            let mut slot = guard.borrow_mut();
            if slot.finished {
                return false;
            }
            slot.finished = true;
            slot.on_failed = None;
            slot.on_loaded.take()
        };
        if let Some(on_loaded) = on_loaded {
            log.guarded("on_loaded", move || on_loaded(value));
        }
        true
    }

    /// Deliver a failure. Returns `false` if this sink already received its
    /// terminal callback.
    pub(crate) fn fail(&self, error: LoadError, log: &ScopedLog) -> bool {
        let guard = self.slot.lock();
        let on_failed = {
            let mut slot = guard.borrow_mut();
            if slot.finished {
                return false;
            }
            slot.finished = true;
            slot.on_loaded = None;
            slot.on_failed.take()
        };
        if let Some(on_failed) = on_failed {
            log.guarded("on_failed", move || on_failed(error));
        }
        true
    }
}
