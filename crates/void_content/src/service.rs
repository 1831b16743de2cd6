//! Service lifecycle
//!
//! A host drives long-lived content components (repositories) through
//! `Service`: start, stop and a health snapshot built from the component's
//! own counters.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

/// Lifecycle state of a content service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    Stopped,
    Running,
    /// Running, with failed loads since the last start
    Degraded,
}

impl ServiceState {
    /// Running or degraded
    pub fn is_running(&self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

/// Point-in-time health report
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub state: ServiceState,
    /// 0.0 when stopped, 1.0 when running cleanly
    pub score: f32,
    /// Why the service is degraded
    pub detail: Option<String>,
    pub metrics: BTreeMap<String, f64>,
}

impl ServiceHealth {
    /// Report for a service that is not running
    pub fn stopped() -> Self {
        Self::with_state(ServiceState::Stopped, 0.0, None)
    }

    /// Report for a service running without failures
    pub fn running() -> Self {
        Self::with_state(ServiceState::Running, 1.0, None)
    }

    /// Report for a running service with failures
    pub fn degraded(detail: impl Into<String>) -> Self {
        Self::with_state(ServiceState::Degraded, 0.5, Some(detail.into()))
    }

    /// Attach a named metric
    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }

    fn with_state(state: ServiceState, score: f32, detail: Option<String>) -> Self {
        Self {
            state,
            score,
            detail,
            metrics: BTreeMap::new(),
        }
    }
}

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service already running: {0}")]
    AlreadyRunning(String),

    #[error("Service not running: {0}")]
    NotRunning(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Lifecycle of a long-lived content component
pub trait Service: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &str;

    fn state(&self) -> ServiceState;

    fn health(&self) -> ServiceHealth;

    fn start(&mut self) -> ServiceResult<()>;

    fn stop(&mut self) -> ServiceResult<()>;

    /// Stop if running, then start again
    fn restart(&mut self) -> ServiceResult<()> {
        if self.state().is_running() {
            self.stop()?;
        }
        self.start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_reports() {
        assert!(ServiceState::Degraded.is_running());
        assert!(!ServiceState::Stopped.is_running());

        let stopped = ServiceHealth::stopped();
        assert_eq!(stopped.state, ServiceState::Stopped);
        assert_eq!(stopped.score, 0.0);

        let degraded = ServiceHealth::degraded("2 failed loads").with_metric("pending_loads", 3.0);
        assert_eq!(degraded.state, ServiceState::Degraded);
        assert_eq!(degraded.detail.as_deref(), Some("2 failed loads"));
        assert_eq!(degraded.metrics.get("pending_loads"), Some(&3.0));
    }

    struct Counter {
        running: bool,
        starts: u32,
    }

    impl Service for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn state(&self) -> ServiceState {
            if self.running {
                ServiceState::Running
            } else {
                ServiceState::Stopped
            }
        }

        fn health(&self) -> ServiceHealth {
            ServiceHealth::running()
        }

        fn start(&mut self) -> ServiceResult<()> {
            if self.running {
                return Err(ServiceError::AlreadyRunning(self.name().to_string()));
            }
            self.running = true;
            self.starts += 1;
            Ok(())
        }

        fn stop(&mut self) -> ServiceResult<()> {
            if !self.running {
                return Err(ServiceError::NotRunning(self.name().to_string()));
            }
            self.running = false;
            Ok(())
        }
    }

    #[test]
    fn test_restart_from_either_state() {
        let mut service = Counter {
            running: false,
            starts: 0,
        };
        service.restart().unwrap();
        service.restart().unwrap();
        assert_eq!(service.starts, 2);
        assert_eq!(service.state(), ServiceState::Running);
        assert!(service.start().is_err());
    }
}
