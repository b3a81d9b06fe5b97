//! Per-service helper for background tasks and health conditions.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::error_buffer::ErrorBuffer;
use crate::logger::Logger;
use crate::stop::StopChan;
use crate::ticker::Ticker;
use crate::wait_group::WaitGroup;

/// Tracks the background tasks of one service and the conditions that make it unhealthy.
///
/// Every task spawned through the engine gets a token that is cancelled when
/// the owning service closes, and the service's close waits for all of them
/// to return before running its close hook.
#[derive(Clone, Debug)]
pub struct Engine {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    stop: StopChan,
    tasks: WaitGroup,
    conds: Mutex<BTreeMap<String, Error>>,
    errors: Arc<ErrorBuffer>,
    logger: Logger,
}

impl Engine {
    pub(crate) fn new(logger: Logger, errors: Arc<ErrorBuffer>) -> Self {
        Self {
            inner: Arc::new(Inner {
                stop: StopChan::new(),
                tasks: WaitGroup::new(),
                conds: Mutex::new(BTreeMap::new()),
                errors,
                logger,
            }),
        }
    }

    /// Qualified name of the owning service.
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.logger.name()
    }

    /// Logger of the owning service.
    #[must_use]
    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    /// Span that spawned tasks are instrumented with.
    #[must_use]
    pub fn span(&self) -> &Span {
        self.inner.logger.span()
    }

    /// The stop signal closed when the owning service closes.
    #[must_use]
    pub fn stop_chan(&self) -> &StopChan {
        &self.inner.stop
    }

    /// Whether the owning service has begun closing.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_closed()
    }

    /// Number of spawned tasks that have not returned yet.
    #[must_use]
    pub fn running_tasks(&self) -> usize {
        self.inner.tasks.count()
    }

    /// Spawns a tracked task. The token is cancelled when the service closes.
    ///
    /// Tasks spawned after the service began closing are dropped with a warning.
    pub fn go<F, Fut>(&self, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.inner.stop.new_token();
        self.spawn(f(token));
    }

    /// Like [`Engine::go`], but the token is also cancelled when `parent` is.
    pub fn go_ctx<F, Fut>(&self, parent: &CancellationToken, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.inner.stop.token_with_parent(parent);
        let task = f(token.clone());
        self.spawn(async move {
            task.await;
            token.cancel();
        });
    }

    /// Spawns a tracked task calling `f` on every tick until the service closes.
    pub fn go_tick<F, Fut>(&self, mut ticker: Ticker, mut f: F)
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.go(move |token| async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => return,
                    () = ticker.tick() => f(token.clone()).await,
                }
            }
        });
    }

    /// Records a soft error, reported by the next health check of the service.
    pub fn emit_health_err(&self, error: Error) {
        self.inner.errors.append(error);
    }

    /// Marks the service unhealthy under `key` until the condition is cleared.
    pub fn set_health_cond(&self, key: impl Into<String>, error: Error) {
        self.inner.conds.lock().insert(key.into(), error);
    }

    /// Clears the condition recorded under `key`.
    pub fn clear_health_cond(&self, key: &str) {
        self.inner.conds.lock().remove(key);
    }

    /// Records a condition under a fresh key, cleared when the guard is cleared or dropped.
    #[must_use = "the condition is cleared as soon as the guard is dropped"]
    pub fn new_health_cond(&self, error: Error) -> HealthCondGuard {
        let key = Uuid::new_v4().to_string();
        self.set_health_cond(key.clone(), error);
        HealthCondGuard {
            engine: self.clone(),
            key,
        }
    }

    /// All recorded conditions joined.
    pub(crate) fn check_conds(&self) -> Result<()> {
        Error::join(self.inner.conds.lock().values().cloned())
    }

    /// Closes the stop signal and waits for every spawned task to return.
    pub(crate) async fn shutdown(&self) {
        self.inner.stop.close();
        self.inner.tasks.wait().await;
    }

    fn spawn<Fut>(&self, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if let Err(err) = self.inner.tasks.try_add(1) {
            self.inner
                .logger
                .warn(format!("dropping task spawned after close: {err}"));
            return;
        }

        let done = TaskDone(Arc::clone(&self.inner));
        tokio::spawn(
            async move {
                let _done = done;
                task.await;
            }
            .instrument(self.span().clone()),
        );
    }
}

// Marks a task done even if it panics.
struct TaskDone(Arc<Inner>);

impl Drop for TaskDone {
    fn drop(&mut self) {
        self.0.tasks.done();
    }
}

/// Clears a health condition exactly once.
#[derive(Debug)]
pub struct HealthCondGuard {
    engine: Engine,
    key: String,
}

impl HealthCondGuard {
    /// Clears the condition.
    pub fn clear(self) {
        drop(self);
    }
}

impl Drop for HealthCondGuard {
    fn drop(&mut self) {
        self.engine.clear_health_cond(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn engine() -> Engine {
        Engine::new(Logger::root().named("test"), Arc::new(ErrorBuffer::new()))
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_tasks() {
        let engine = engine();
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let finished = Arc::clone(&finished);
            engine.go(|token| async move {
                token.cancelled().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(engine.running_tasks(), 8);

        engine.shutdown().await;

        assert_eq!(finished.load(Ordering::SeqCst), 8);
        assert_eq!(engine.running_tasks(), 0);
        assert!(engine.is_stopped());
    }

    #[tokio::test]
    async fn test_go_after_shutdown_is_dropped() {
        let engine = engine();
        engine.shutdown().await;

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        engine.go(|_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::task::yield_now().await;

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(engine.running_tasks(), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_is_still_counted_done() {
        let engine = engine();
        engine.go(|_| async { panic!("task failed") });

        tokio::time::timeout(Duration::from_secs(1), engine.shutdown())
            .await
            .expect("shutdown should not hang on a panicked task");
    }

    #[tokio::test]
    async fn test_go_ctx_cancels_on_parent() {
        let engine = engine();
        let parent = CancellationToken::new();
        let (tx, rx) = tokio::sync::oneshot::channel();

        engine.go_ctx(&parent, |token| async move {
            token.cancelled().await;
            let _ = tx.send(());
        });

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .expect("task should observe parent cancellation")
            .unwrap();

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_go_tick_runs_until_shutdown() {
        let engine = engine();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ticks);
        engine.go_tick(Ticker::every(Duration::from_secs(1)), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        engine.shutdown().await;

        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_health_conditions() {
        let engine = engine();
        assert!(engine.check_conds().is_ok());

        engine.set_health_cond("db", Error::custom("db down"));
        assert_matches!(engine.check_conds(), Err(Error::Custom(msg)) if msg == "db down");

        let guard = engine.new_health_cond(Error::custom("lagging"));
        assert_matches!(engine.check_conds(), Err(Error::Joined(_)));

        engine.clear_health_cond("db");
        assert_matches!(engine.check_conds(), Err(Error::Custom(msg)) if msg == "lagging");

        guard.clear();
        assert!(engine.check_conds().is_ok());
    }

    #[test]
    fn test_emit_health_err_goes_to_buffer() {
        let errors = Arc::new(ErrorBuffer::new());
        let engine = Engine::new(Logger::root(), Arc::clone(&errors));

        engine.emit_health_err(Error::custom("soft"));

        assert_eq!(errors.len(), 1);
    }
}
