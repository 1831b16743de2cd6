//! Tagged logging
//!
//! Thin facade over the `log` crate. Every message is prefixed with the
//! owner's tag, and a disabled logger drops everything.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Logger scoped to one component
#[derive(Clone)]
pub struct ScopedLog {
    tag: Arc<str>,
    enabled: bool,
}

impl ScopedLog {
    /// Create a logger with the given tag
    pub fn new(tag: impl AsRef<str>, enabled: bool) -> Self {
        Self {
            tag: Arc::from(tag.as_ref()),
            enabled,
        }
    }

    /// A logger that drops everything
    pub fn disabled() -> Self {
        Self::new("", false)
    }

    /// Tag prefixed to every line
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Whether lines are emitted at all
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        if self.enabled {
            log::debug!("[{}] {}", self.tag, args);
        }
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        if self.enabled {
            log::info!("[{}] {}", self.tag, args);
        }
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        if self.enabled {
            log::warn!("[{}] {}", self.tag, args);
        }
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        if self.enabled {
            log::error!("[{}] {}", self.tag, args);
        }
    }

    /// Run a consumer callback, logging instead of propagating a panic
    ///
    /// Returns `false` if the callback panicked.
    pub fn guarded<F: FnOnce()>(&self, callback: &str, f: F) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => true,
            Err(payload) => {
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                self.error(format_args!("Callback '{}' panicked: {}", callback, message));
                false
            }
        }
    }
}

impl fmt::Debug for ScopedLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedLog")
            .field("tag", &self.tag)
            .field("enabled", &self.enabled)
            .finish()
    }
}
