//! Periodic health aggregation for service trees.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod checker;
mod error;
mod metrics;

pub use checker::{HEALTH_CHECK_INTERVAL, HealthChecker, HealthCheckerConfig};
pub use error::{Error, Result};
pub use metrics::{
    HEALTH_GAUGE, MetricsSink, NoopMetrics, PrometheusMetrics, SERVICE_ID_LABEL, UPTIME_COUNTER,
};
