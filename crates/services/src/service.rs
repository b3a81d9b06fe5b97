//! Service trees built from a declarative [`Config`].

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::engine::Engine;
use crate::error::{Error, Result, join_errors};
use crate::logger::Logger;
use crate::multi::{MultiCloser, MultiStart};
use crate::report::{HealthReport, HealthReporter, copy_health};
use crate::state::{State, StateMachine};

/// A component with a start/close lifecycle that reports its health.
#[async_trait]
pub trait Service: HealthReporter {
    /// Starts the service. Succeeds at most once.
    ///
    /// # Errors
    ///
    /// Returns an error if the service was already started or failed to start.
    async fn start(&self) -> Result<()>;

    /// Closes the service and everything it owns.
    ///
    /// # Errors
    ///
    /// Returns an error if the service is not started or failed to close.
    async fn close(&self) -> Result<()>;
}

type SubServicesFn = Box<dyn FnOnce(&Logger) -> Vec<Arc<dyn Service>> + Send>;
type StartHook = Box<dyn FnOnce(Engine) -> BoxFuture<'static, Result<()>> + Send>;
type CloseHook = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Description of a service node, compiled with [`Config::new_service`].
pub struct Config {
    name: String,
    sub_services: Option<SubServicesFn>,
    start: Option<StartHook>,
    close: Option<CloseHook>,
}

impl Config {
    /// Describes a node called `name`, qualified by the parent logger when compiled.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sub_services: None,
            start: None,
            close: None,
        }
    }

    /// Sets the factory that builds the node's children.
    ///
    /// It is called once, at compile time, with the node's own logger so
    /// children are named beneath it.
    #[must_use]
    pub fn with_sub_services<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&Logger) -> Vec<Arc<dyn Service>> + Send + 'static,
    {
        self.sub_services = Some(Box::new(f));
        self
    }

    /// Sets the hook run after every child has started.
    #[must_use]
    pub fn with_start<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce(Engine) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.start = Some(Box::new(move |engine| f(engine).boxed()));
        self
    }

    /// Sets the hook run after the engine's tasks have returned and before children close.
    #[must_use]
    pub fn with_close<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.close = Some(Box::new(move || f().boxed()));
        self
    }

    /// Compiles the node and returns it along with its engine.
    pub fn new_service_engine(self, parent: &Logger) -> (Arc<ServiceNode>, Engine) {
        let logger = parent.named(&self.name);
        let state = StateMachine::new();
        let engine = Engine::new(logger.clone(), Arc::clone(state.error_buffer()));
        let subs = self.sub_services.map(|f| f(&logger)).unwrap_or_default();

        let node = Arc::new(ServiceNode {
            state,
            engine: engine.clone(),
            subs,
            start: Mutex::new(self.start),
            close: Mutex::new(self.close),
        });

        (node, engine)
    }

    /// Compiles the node.
    pub fn new_service(self, parent: &Logger) -> Arc<ServiceNode> {
        self.new_service_engine(parent).0
    }
}

/// A compiled service: a state machine, an engine, hooks and child services.
pub struct ServiceNode {
    state: StateMachine,
    engine: Engine,
    subs: Vec<Arc<dyn Service>>,
    start: Mutex<Option<StartHook>>,
    close: Mutex<Option<CloseHook>>,
}

impl ServiceNode {
    /// Lifecycle state of this node.
    #[must_use]
    pub fn state(&self) -> State {
        self.state.state()
    }

    /// Engine of this node.
    #[must_use]
    pub const fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Children of this node, in start order.
    #[must_use]
    pub fn sub_services(&self) -> &[Arc<dyn Service>] {
        &self.subs
    }

    /// Health of this node alone, without its children.
    ///
    /// # Errors
    ///
    /// Returns the state machine error if the node is not started or has
    /// buffered errors, otherwise any unresolved engine condition.
    pub fn healthy(&self) -> Result<()> {
        self.state.healthy()?;
        self.engine.check_conds()
    }

    async fn run_start(&self) -> Result<()> {
        let name = self.name();
        let mut started = MultiStart::new();

        started
            .start(&self.subs)
            .await
            .map_err(|source| Error::SubServicesStartFailed {
                name: name.to_string(),
                source: Box::new(source),
            })?;

        let hook = self.start.lock().take();
        if let Some(hook) = hook {
            if let Err(source) = hook(self.engine.clone()).await {
                self.engine.shutdown().await;
                let err = Error::StartFailed {
                    name: name.to_string(),
                    source: Box::new(source),
                };
                return Err(started.close_because(err).await);
            }
        }

        Ok(())
    }

    async fn run_close(&self) -> Result<()> {
        self.engine.shutdown().await;

        let mut errors = Vec::new();

        let hook = self.close.lock().take();
        if let Some(hook) = hook {
            if let Err(source) = hook().await {
                errors.push(Error::CloseFailed {
                    name: self.name().to_string(),
                    source: Box::new(source),
                });
            }
        }

        if let Err(err) = MultiCloser::new(self.subs.clone()).close().await {
            errors.push(err);
        }

        Error::join(errors)
    }
}

impl HealthReporter for ServiceNode {
    fn name(&self) -> &str {
        self.engine.name()
    }

    fn ready(&self) -> Result<()> {
        join_errors(std::iter::once(self.state.ready()).chain(self.subs.iter().map(|s| s.ready())))
    }

    fn health_report(&self) -> HealthReport {
        let mut report = HealthReport::from([(self.name().to_string(), self.healthy())]);
        for sub in &self.subs {
            copy_health(&mut report, sub.health_report());
        }
        report
    }
}

#[async_trait]
impl Service for ServiceNode {
    async fn start(&self) -> Result<()> {
        let result = self.state.start_once(self.name(), || self.run_start()).await;
        match &result {
            Ok(()) => self.engine.logger().info("started"),
            Err(err) => self.engine.logger().warn(format!("start failed: {err}")),
        }
        result
    }

    async fn close(&self) -> Result<()> {
        let result = self.state.stop_once(self.name(), || self.run_close()).await;
        match &result {
            Ok(()) => self.engine.logger().info("closed"),
            Err(err) => self.engine.logger().warn(format!("close failed: {err}")),
        }
        result
    }
}
