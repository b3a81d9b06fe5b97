//! Metrics emitted by the health checker.

use std::collections::HashMap;

use parking_lot::Mutex;
use prometheus::{CounterVec, GaugeVec, Opts, Registry};
use tracing::warn;

use crate::error::Result;

/// Gauge set to 1 for a healthy report entry and 0 otherwise.
pub const HEALTH_GAUGE: &str = "health";

/// Label carrying the qualified name of a report entry.
pub const SERVICE_ID_LABEL: &str = "service_id";

/// Counter of seconds the checker has been running.
pub const UPTIME_COUNTER: &str = "uptime_seconds";

/// Backend the health checker reports through.
///
/// Series are identified by a metric name plus label pairs. Implementations
/// must not block; they are called from inside an aggregation pass.
pub trait MetricsSink: Send + Sync {
    /// Sets a gauge series.
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64);

    /// Adds `by` to a counter series.
    fn inc_counter(&self, name: &str, labels: &[(&str, &str)], by: f64);

    /// Removes a gauge series, if present.
    fn delete_series(&self, name: &str, labels: &[(&str, &str)]);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn set_gauge(&self, _name: &str, _labels: &[(&str, &str)], _value: f64) {}

    fn inc_counter(&self, _name: &str, _labels: &[(&str, &str)], _by: f64) {}

    fn delete_series(&self, _name: &str, _labels: &[(&str, &str)]) {}
}

/// Sink backed by a Prometheus registry.
///
/// Metric families are created and registered on first use, with label names
/// taken from the first call. Failures are logged and the update is dropped.
pub struct PrometheusMetrics {
    registry: Registry,
    gauges: Mutex<HashMap<String, GaugeVec>>,
    counters: Mutex<HashMap<String, CounterVec>>,
}

impl PrometheusMetrics {
    /// Creates a sink registering into `registry`.
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            gauges: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// The registry metric families are registered in.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Result<GaugeVec> {
        let mut gauges = self.gauges.lock();
        if let Some(gauge) = gauges.get(name) {
            return Ok(gauge.clone());
        }

        let gauge = GaugeVec::new(Opts::new(name, help(name)), &label_names(labels))?;
        self.registry.register(Box::new(gauge.clone()))?;
        gauges.insert(name.to_string(), gauge.clone());
        Ok(gauge)
    }

    fn counter(&self, name: &str, labels: &[(&str, &str)]) -> Result<CounterVec> {
        let mut counters = self.counters.lock();
        if let Some(counter) = counters.get(name) {
            return Ok(counter.clone());
        }

        let counter = CounterVec::new(Opts::new(name, help(name)), &label_names(labels))?;
        self.registry.register(Box::new(counter.clone()))?;
        counters.insert(name.to_string(), counter.clone());
        Ok(counter)
    }
}

impl MetricsSink for PrometheusMetrics {
    fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        match self.gauge(name, labels) {
            Ok(gauge) => match gauge.get_metric_with_label_values(&label_values(labels)) {
                Ok(series) => series.set(value),
                Err(err) => warn!(metric = name, "failed to set gauge: {err}"),
            },
            Err(err) => warn!(metric = name, "failed to register gauge: {err}"),
        }
    }

    fn inc_counter(&self, name: &str, labels: &[(&str, &str)], by: f64) {
        match self.counter(name, labels) {
            Ok(counter) => match counter.get_metric_with_label_values(&label_values(labels)) {
                Ok(series) => series.inc_by(by),
                Err(err) => warn!(metric = name, "failed to increment counter: {err}"),
            },
            Err(err) => warn!(metric = name, "failed to register counter: {err}"),
        }
    }

    fn delete_series(&self, name: &str, labels: &[(&str, &str)]) {
        let gauge = self.gauges.lock().get(name).cloned();
        if let Some(gauge) = gauge {
            // Missing series are not an error here
            let _ = gauge.remove_label_values(&label_values(labels));
        }
    }
}

fn label_names<'a>(labels: &[(&'a str, &str)]) -> Vec<&'a str> {
    labels.iter().map(|(name, _)| *name).collect()
}

fn label_values<'a>(labels: &[(&str, &'a str)]) -> Vec<&'a str> {
    labels.iter().map(|(_, value)| *value).collect()
}

fn help(name: &str) -> String {
    match name {
        HEALTH_GAUGE => "Health of a service, 1 if healthy and 0 otherwise".to_string(),
        UPTIME_COUNTER => "Seconds the health checker has been running".to_string(),
        other => format!("{other} reported by the health checker"),
    }
}
