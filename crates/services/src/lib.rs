//! Lifecycle primitives for long-running services.
//!
//! A [`StateMachine`] guards exactly-once start and stop. An [`Engine`] tracks
//! the background tasks and health conditions of one service. A [`Config`]
//! compiles into a [`ServiceNode`] that owns both plus any number of child
//! services, starting them in order and closing them after its own tasks
//! have drained.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod engine;
mod error;
mod error_buffer;
mod logger;
mod multi;
mod report;
mod service;
mod state;
mod stop;
mod ticker;
mod wait_group;

pub use engine::{Engine, HealthCondGuard};
pub use error::{Error, JoinedErrors, Result, join_errors};
pub use error_buffer::{DEFAULT_ERROR_BUFFER_CAP, ErrorBuffer};
pub use logger::Logger;
pub use multi::{MultiCloser, MultiStart};
pub use report::{
    DuplicatePolicy, HealthReport, HealthReporter, contains_error, copy_health, merge_health,
};
pub use service::{Config, Service, ServiceNode};
pub use state::{State, StateMachine};
pub use stop::StopChan;
pub use ticker::{Ticker, TickerConfig};
pub use wait_group::WaitGroup;

// Re-exported so callers can name the token handed to engine tasks.
pub use tokio_util::sync::CancellationToken;
