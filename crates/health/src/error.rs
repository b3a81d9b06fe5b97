//! Error types for the health checker.

use thiserror::Error;

/// Result type for health checker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from the health checker and its metrics sinks.
#[derive(Debug, Error)]
pub enum Error {
    /// Lifecycle or registration error.
    #[error(transparent)]
    Service(#[from] proven_services::Error),

    /// Prometheus metric creation or registration failed.
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
}
