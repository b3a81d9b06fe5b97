//! Start/stop state machine.
//!
//! Transitions out of `Unstarted` and out of `Started` happen at most once.
//! The start and stop edges hold an exclusive lock for their whole duration,
//! while operations gated by [`StateMachine::if_started`] share it, so an
//! operation can never observe a transition half way through.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::error_buffer::{DEFAULT_ERROR_BUFFER_CAP, ErrorBuffer};

/// Lifecycle state of a service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum State {
    /// Constructed, never started.
    Unstarted = 0,
    /// The start function is running.
    Starting = 1,
    /// Started successfully.
    Started = 2,
    /// The start function failed. Terminal.
    StartFailed = 3,
    /// The stop function is running.
    Stopping = 4,
    /// Stopped successfully. Terminal.
    Stopped = 5,
    /// The stop function failed. Terminal.
    StopFailed = 6,
}

impl State {
    const fn from_raw(value: u8) -> Self {
        match value {
            0 => Self::Unstarted,
            1 => Self::Starting,
            2 => Self::Started,
            3 => Self::StartFailed,
            4 => Self::Stopping,
            5 => Self::Stopped,
            6 => Self::StopFailed,
            _ => unreachable!(),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unstarted => "Unstarted",
            Self::Starting => "Starting",
            Self::Started => "Started",
            Self::StartFailed => "StartFailed",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::StopFailed => "StopFailed",
        };
        f.write_str(name)
    }
}

/// Holds the lifecycle state of a service and guards its transitions.
#[derive(Debug)]
pub struct StateMachine {
    state: AtomicU8,
    lock: RwLock<()>,
    errors: Arc<ErrorBuffer>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Creates a state machine in the `Unstarted` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(State::Unstarted as u8),
            lock: RwLock::new(()),
            errors: Arc::new(ErrorBuffer::new()),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> State {
        State::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Buffer of soft errors reported through [`StateMachine::healthy`].
    #[must_use]
    pub const fn error_buffer(&self) -> &Arc<ErrorBuffer> {
        &self.errors
    }

    /// Runs `f` if this is the first call to leave `Unstarted`.
    ///
    /// The initial compare-and-swap happens before taking the lock, so late
    /// callers fail fast instead of queueing behind a slow start.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStarted`] if the state machine already left
    /// `Unstarted`, or whatever `f` returns.
    ///
    /// # Panics
    ///
    /// Panics if the state changed underneath the running start function.
    pub async fn start_once<F, Fut>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if let Err(state) = self.transition(State::Unstarted, State::Starting) {
            return Err(Error::AlreadyStarted {
                name: name.to_string(),
                state,
            });
        }

        let _guard = self.lock.write().await;

        self.errors.set_cap(DEFAULT_ERROR_BUFFER_CAP);

        let result = f().await;
        let next = if result.is_ok() {
            State::Started
        } else {
            State::StartFailed
        };

        if let Err(state) = self.transition(State::Starting, next) {
            panic!("{name}: state changed while starting, expected Starting but was {state}");
        }

        debug!(service = %name, state = %next, "start transition complete");

        result
    }

    /// Runs `f` if this is the first call to leave `Started`.
    ///
    /// The lock is taken before the compare-and-swap so a close issued while a
    /// start is still running waits for it to finish.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyStopped`], [`Error::CannotStopUnstarted`] or
    /// [`Error::CannotStop`] depending on the current state, or whatever `f` returns.
    ///
    /// # Panics
    ///
    /// Panics if the state changed underneath the running stop function.
    pub async fn stop_once<F, Fut>(&self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _guard = self.lock.write().await;

        if let Err(state) = self.transition(State::Started, State::Stopping) {
            return Err(match state {
                State::Stopped => Error::AlreadyStopped {
                    name: name.to_string(),
                },
                State::Unstarted => Error::CannotStopUnstarted {
                    name: name.to_string(),
                },
                state => Error::CannotStop {
                    name: name.to_string(),
                    state,
                },
            });
        }

        let result = f().await;
        let next = if result.is_ok() {
            State::Stopped
        } else {
            State::StopFailed
        };

        if let Err(state) = self.transition(State::Stopping, next) {
            panic!("{name}: state changed while stopping, expected Stopping but was {state}");
        }

        debug!(service = %name, state = %next, "stop transition complete");

        result
    }

    /// Runs `f` under the shared lock if the state is `Started`.
    ///
    /// Returns whether `f` ran.
    pub async fn if_started<F>(&self, f: F) -> bool
    where
        F: FnOnce(),
    {
        let _guard = self.lock.read().await;
        if self.state() == State::Started {
            f();
            true
        } else {
            false
        }
    }

    /// Runs the future produced by `f` under the shared lock if the state is `Started`.
    pub async fn if_started_async<F, Fut>(&self, f: F) -> Option<Fut::Output>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let _guard = self.lock.read().await;
        if self.state() == State::Started {
            Some(f().await)
        } else {
            None
        }
    }

    /// Runs `f` under the shared lock unless the state machine has stopped.
    ///
    /// Returns whether `f` ran.
    pub async fn if_not_stopped<F>(&self, f: F) -> bool
    where
        F: FnOnce(),
    {
        let _guard = self.lock.read().await;
        if matches!(self.state(), State::Stopped | State::StopFailed) {
            false
        } else {
            f();
            true
        }
    }

    /// Ok once started, until stopping begins.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] in any other state.
    pub fn ready(&self) -> Result<()> {
        match self.state() {
            State::Started => Ok(()),
            state => Err(Error::NotStarted { state }),
        }
    }

    /// Like [`StateMachine::ready`], but also drains the soft errors buffered since the last call.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotStarted`] if not started, otherwise the buffered errors joined.
    pub fn healthy(&self) -> Result<()> {
        match self.state() {
            State::Started => self.errors.flush(),
            state => Err(Error::NotStarted { state }),
        }
    }

    fn transition(&self, from: State, to: State) -> std::result::Result<(), State> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(State::from_raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_start_once_only_runs_once() {
        let sm = StateMachine::new();
        let calls = AtomicUsize::new(0);

        sm.start_once("svc", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

        let err = sm
            .start_once("svc", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert_matches!(err, Error::AlreadyStarted { state: State::Started, .. });
        assert!(err.to_string().contains("already been started"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sm.state(), State::Started);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_have_one_winner() {
        let sm = Arc::new(StateMachine::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let sm = Arc::clone(&sm);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                sm.start_once("svc", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_start_is_terminal() {
        let sm = StateMachine::new();

        let err = sm
            .start_once("svc", || async { Err(Error::custom("boom")) })
            .await
            .unwrap_err();
        assert_matches!(err, Error::Custom(msg) if msg == "boom");
        assert_eq!(sm.state(), State::StartFailed);

        assert_matches!(
            sm.start_once("svc", || async { Ok(()) }).await,
            Err(Error::AlreadyStarted { state: State::StartFailed, .. })
        );
        assert_matches!(
            sm.stop_once("svc", || async { Ok(()) }).await,
            Err(Error::CannotStop { state: State::StartFailed, .. })
        );
    }

    #[tokio::test]
    async fn test_stop_errors_by_state() {
        let sm = StateMachine::new();

        let err = sm.stop_once("svc", || async { Ok(()) }).await.unwrap_err();
        assert_matches!(err, Error::CannotStopUnstarted { .. });

        sm.start_once("svc", || async { Ok(()) }).await.unwrap();
        sm.stop_once("svc", || async { Ok(()) }).await.unwrap();
        assert_eq!(sm.state(), State::Stopped);

        let err = sm.stop_once("svc", || async { Ok(()) }).await.unwrap_err();
        assert_matches!(err, Error::AlreadyStopped { .. });
    }

    #[tokio::test]
    async fn test_failed_stop() {
        let sm = StateMachine::new();
        sm.start_once("svc", || async { Ok(()) }).await.unwrap();

        assert!(
            sm.stop_once("svc", || async { Err(Error::custom("stuck")) })
                .await
                .is_err()
        );
        assert_eq!(sm.state(), State::StopFailed);
        assert!(!sm.if_not_stopped(|| {}).await);
    }

    #[tokio::test]
    async fn test_stop_waits_for_running_start() {
        let sm = Arc::new(StateMachine::new());
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let start = tokio::spawn({
            let sm = Arc::clone(&sm);
            async move {
                sm.start_once("svc", || async move {
                    let _ = entered_tx.send(());
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
            }
        });

        entered_rx.await.unwrap();

        let stop = tokio::spawn({
            let sm = Arc::clone(&sm);
            async move { sm.stop_once("svc", || async { Ok(()) }).await }
        });

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!stop.is_finished());
        assert_eq!(sm.state(), State::Starting);

        release_tx.send(()).unwrap();

        start.await.unwrap().unwrap();
        stop.await.unwrap().unwrap();
        assert_eq!(sm.state(), State::Stopped);
    }

    #[tokio::test]
    async fn test_if_started_gates_on_state() {
        let sm = StateMachine::new();
        let ran = AtomicUsize::new(0);

        assert!(!sm.if_started(|| { ran.fetch_add(1, Ordering::SeqCst); }).await);
        assert!(sm.if_not_stopped(|| { ran.fetch_add(1, Ordering::SeqCst); }).await);

        sm.start_once("svc", || async { Ok(()) }).await.unwrap();
        assert!(sm.if_started(|| { ran.fetch_add(1, Ordering::SeqCst); }).await);
        assert_eq!(sm.if_started_async(|| async { 7 }).await, Some(7));

        sm.stop_once("svc", || async { Ok(()) }).await.unwrap();
        assert!(!sm.if_started(|| { ran.fetch_add(1, Ordering::SeqCst); }).await);
        assert!(!sm.if_not_stopped(|| { ran.fetch_add(1, Ordering::SeqCst); }).await);
        assert_eq!(sm.if_started_async(|| async { 7 }).await, None);

        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_healthy_flushes_buffered_errors() {
        let sm = StateMachine::new();
        assert_matches!(sm.healthy(), Err(Error::NotStarted { state: State::Unstarted }));

        sm.start_once("svc", || async { Ok(()) }).await.unwrap();
        assert!(sm.ready().is_ok());
        assert!(sm.healthy().is_ok());

        sm.error_buffer().append(Error::custom("soft"));
        assert_matches!(sm.healthy(), Err(Error::Custom(msg)) if msg == "soft");
        assert!(sm.healthy().is_ok());
    }
}
