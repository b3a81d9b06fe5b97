//! Starting and closing groups of services.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::service::Service;

/// Starts services in order, closing the ones already started if any fails.
#[derive(Default)]
pub struct MultiStart {
    started: Vec<Arc<dyn Service>>,
}

impl MultiStart {
    /// Creates an orchestrator that has started nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `services` one after another.
    ///
    /// # Errors
    ///
    /// If a service fails to start, every service this orchestrator already
    /// started is closed in reverse order and the start error is returned
    /// joined with any errors from those closes.
    pub async fn start(&mut self, services: &[Arc<dyn Service>]) -> Result<()> {
        for service in services {
            if let Err(err) = service.start().await {
                warn!(service = %service.name(), "failed to start, rolling back: {err}");
                return Err(self.close_because(err).await);
            }
            debug!(service = %service.name(), "started");
            self.started.push(Arc::clone(service));
        }
        Ok(())
    }

    /// Closes every started service in reverse start order.
    ///
    /// # Errors
    ///
    /// Returns the close errors joined.
    pub async fn close(&mut self) -> Result<()> {
        let started = std::mem::take(&mut self.started);
        MultiCloser::new(started).close().await
    }

    /// Closes every started service and returns `reason` joined with any close errors.
    pub async fn close_because(&mut self, reason: Error) -> Error {
        reason.and(self.close().await)
    }
}

/// Closes a group of services, attempting all of them even if some fail.
pub struct MultiCloser {
    services: Vec<Arc<dyn Service>>,
}

impl MultiCloser {
    /// Creates a closer for `services`.
    #[must_use]
    pub fn new(services: Vec<Arc<dyn Service>>) -> Self {
        Self { services }
    }

    /// Closes the services in reverse order.
    ///
    /// # Errors
    ///
    /// Returns the errors of every service that failed to close, joined.
    pub async fn close(&self) -> Result<()> {
        let mut errors = Vec::new();
        for service in self.services.iter().rev() {
            if let Err(err) = service.close().await {
                warn!(service = %service.name(), "failed to close: {err}");
                errors.push(err);
            }
        }
        Error::join(errors)
    }
}
