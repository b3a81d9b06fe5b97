//! Periodic aggregation of readiness and health across registered components.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use proven_services::{
    DuplicatePolicy, Error as ServiceError, HealthReport, HealthReporter, Result as ServiceResult,
    Service, StateMachine, StopChan, Ticker, join_errors, merge_health,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metrics::{HEALTH_GAUGE, MetricsSink, NoopMetrics, SERVICE_ID_LABEL, UPTIME_COUNTER};

/// Time between aggregation passes.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(15);

const NAME: &str = "HealthChecker";

/// Settings for a [`HealthChecker`].
#[derive(Clone)]
pub struct HealthCheckerConfig {
    /// Where gauge and counter updates go.
    pub metrics: Arc<dyn MetricsSink>,
    /// How to treat two reporters or report entries sharing a name.
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            metrics: Arc::new(NoopMetrics),
            duplicate_policy: DuplicatePolicy::default(),
        }
    }
}

/// Polls registered components and keeps the latest readiness and health snapshot.
pub struct HealthChecker {
    state: StateMachine,
    shared: Arc<Shared>,
    stop: StopChan,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    registry: Mutex<HashMap<String, Vec<Arc<dyn HealthReporter>>>>,
    snapshot: RwLock<Snapshot>,
    metrics: Arc<dyn MetricsSink>,
    policy: DuplicatePolicy,
}

#[derive(Default)]
struct Snapshot {
    ready: HashMap<String, ServiceResult<()>>,
    healthy: HealthReport,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    /// Creates a checker that discards metrics.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HealthCheckerConfig::default())
    }

    /// Creates a checker reporting to `metrics`.
    #[must_use]
    pub fn with_metrics(metrics: Arc<dyn MetricsSink>) -> Self {
        Self::with_config(HealthCheckerConfig {
            metrics,
            ..HealthCheckerConfig::default()
        })
    }

    /// Creates a checker from `config`.
    #[must_use]
    pub fn with_config(config: HealthCheckerConfig) -> Self {
        Self {
            state: StateMachine::new(),
            shared: Arc::new(Shared {
                registry: Mutex::new(HashMap::new()),
                snapshot: RwLock::new(Snapshot::default()),
                metrics: config.metrics,
                policy: config.duplicate_policy,
            }),
            stop: StopChan::new(),
            task: Mutex::new(None),
        }
    }

    /// Adds a component to the set polled on every pass.
    ///
    /// Registering the same component twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the component has an empty name.
    ///
    /// # Panics
    ///
    /// Panics if a different component is already registered under the same
    /// name and the duplicate policy is [`DuplicatePolicy::Panic`].
    pub fn register(&self, reporter: Arc<dyn HealthReporter>) -> Result<()> {
        let name = reporter.name().to_string();
        if name.is_empty() {
            return Err(ServiceError::EmptyName.into());
        }

        let mut registry = self.shared.registry.lock();
        let entries = registry.entry(name).or_default();
        if entries.iter().any(|existing| Arc::ptr_eq(existing, &reporter)) {
            return Ok(());
        }

        if !entries.is_empty() {
            assert!(
                self.shared.policy != DuplicatePolicy::Panic,
                "duplicate health check registration {:?}",
                reporter.name()
            );
            warn!(name = %reporter.name(), "duplicate health check registration");
        }

        entries.push(reporter);
        Ok(())
    }

    /// Removes the components registered under `name` and drops their metric series.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is empty.
    pub fn unregister(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(ServiceError::EmptyName.into());
        }

        // Held until the series are gone so a running pass cannot write them back
        let mut registry = self.shared.registry.lock();
        registry.remove(name);

        let mut snapshot = self.shared.snapshot.write();
        snapshot.ready.remove(name);
        let prefix = format!("{name}.");
        let dropped: Vec<String> = snapshot
            .healthy
            .keys()
            .filter(|key| *key == name || key.starts_with(&prefix))
            .cloned()
            .collect();
        for key in &dropped {
            snapshot.healthy.remove(key);
            self.shared
                .metrics
                .delete_series(HEALTH_GAUGE, &[(SERVICE_ID_LABEL, key.as_str())]);
        }
        drop(snapshot);
        drop(registry);

        Ok(())
    }

    /// Whether every registered component was ready at the last pass, with per-name results.
    #[must_use]
    pub fn is_ready(&self) -> (bool, HashMap<String, ServiceResult<()>>) {
        let ready = self.shared.snapshot.read().ready.clone();
        (ready.values().all(|r| r.is_ok()), ready)
    }

    /// Whether every report entry was healthy at the last pass, with per-name results.
    #[must_use]
    pub fn is_healthy(&self) -> (bool, HealthReport) {
        let healthy = self.shared.snapshot.read().healthy.clone();
        (healthy.values().all(|r| r.is_ok()), healthy)
    }

    /// Runs one aggregation pass immediately.
    pub fn check_all(&self) {
        self.shared.check();
    }

    fn healthy(&self) -> ServiceResult<()> {
        self.state.healthy()?;
        if self.task.lock().as_ref().is_some_and(JoinHandle::is_finished) {
            return Err(ServiceError::custom("health check loop exited"));
        }
        Ok(())
    }
}

impl Shared {
    fn check(&self) {
        let reporters: Vec<(String, Vec<Arc<dyn HealthReporter>>)> = self
            .registry
            .lock()
            .iter()
            .map(|(name, entries)| (name.clone(), entries.clone()))
            .collect();

        let results: Vec<(String, ServiceResult<()>, HealthReport)> = reporters
            .into_iter()
            .map(|(name, entries)| {
                let ready = join_errors(entries.iter().map(|r| r.ready()));
                let mut report = HealthReport::new();
                for reporter in &entries {
                    merge_health(&mut report, reporter.health_report(), self.policy);
                }
                (name, ready, report)
            })
            .collect();

        // Names unregistered while the checks ran are dropped here
        let registry = self.registry.lock();

        let mut ready = HashMap::with_capacity(results.len());
        let mut healthy = HealthReport::new();
        for (name, readiness, report) in results {
            if registry.contains_key(&name) {
                merge_health(&mut healthy, report, self.policy);
                ready.insert(name, readiness);
            }
        }

        let mut snapshot = self.snapshot.write();
        for stale in snapshot.healthy.keys().filter(|key| !healthy.contains_key(*key)) {
            self.metrics
                .delete_series(HEALTH_GAUGE, &[(SERVICE_ID_LABEL, stale.as_str())]);
        }
        for (name, result) in &healthy {
            let value = if result.is_ok() { 1.0 } else { 0.0 };
            self.metrics
                .set_gauge(HEALTH_GAUGE, &[(SERVICE_ID_LABEL, name.as_str())], value);
        }
        self.metrics
            .inc_counter(UPTIME_COUNTER, &[], HEALTH_CHECK_INTERVAL.as_secs_f64());

        debug!(
            components = ready.len(),
            entries = healthy.len(),
            "health check pass complete"
        );

        *snapshot = Snapshot { ready, healthy };
        drop(snapshot);
        drop(registry);
    }

    async fn run(self: Arc<Self>, stop: StopChan) {
        let mut ticker = Ticker::every(HEALTH_CHECK_INTERVAL);
        loop {
            tokio::select! {
                () = stop.cancelled() => break,
                () = ticker.tick() => self.check(),
            }
        }
        debug!("health check loop stopped");
    }
}

impl HealthReporter for HealthChecker {
    fn name(&self) -> &str {
        NAME
    }

    fn ready(&self) -> ServiceResult<()> {
        self.state.ready()
    }

    fn health_report(&self) -> HealthReport {
        HealthReport::from([(NAME.to_string(), self.healthy())])
    }
}

#[async_trait]
impl Service for HealthChecker {
    async fn start(&self) -> ServiceResult<()> {
        self.state
            .start_once(NAME, || async {
                self.shared.check();
                let handle = tokio::spawn(Arc::clone(&self.shared).run(self.stop.clone()));
                *self.task.lock() = Some(handle);
                info!("health checker started");
                Ok(())
            })
            .await
    }

    async fn close(&self) -> ServiceResult<()> {
        self.state
            .stop_once(NAME, || async {
                self.stop.close();
                let handle = self.task.lock().take();
                if let Some(handle) = handle {
                    handle.await.map_err(ServiceError::other)?;
                }
                info!("health checker stopped");
                Ok(())
            })
            .await
    }
}
