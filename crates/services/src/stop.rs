//! Close-once stop signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A broadcast stop signal that can be closed exactly once.
///
/// Tokens derived from it are cancelled when it closes. Derived tokens can
/// be cancelled earlier on their own, but never outlive the signal.
#[derive(Clone, Debug, Default)]
pub struct StopChan {
    token: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl StopChan {
    /// Creates an open signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the signal, cancelling every derived token.
    ///
    /// # Panics
    ///
    /// Panics if the signal was already closed.
    pub fn close(&self) {
        assert!(
            !self.closed.swap(true, Ordering::AcqRel),
            "close of closed StopChan"
        );
        self.token.cancel();
    }

    /// Whether the signal has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Completes once the signal is closed.
    #[must_use]
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// A token cancelled when the signal closes.
    #[must_use]
    pub fn new_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// A token cancelled when either the signal closes or `parent` is cancelled.
    ///
    /// Cancel the returned token once it is no longer needed to release the
    /// task watching `parent`.
    #[must_use]
    pub fn token_with_parent(&self, parent: &CancellationToken) -> CancellationToken {
        let token = self.token.child_token();

        let linked = token.clone();
        let parent = parent.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = parent.cancelled() => linked.cancel(),
                () = linked.cancelled() => {}
            }
        });

        token
    }

    /// A token cancelled when either the signal closes or `timeout` elapses.
    #[must_use]
    pub fn token_with_timeout(&self, timeout: Duration) -> CancellationToken {
        let token = self.token.child_token();

        let linked = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => linked.cancel(),
                () = linked.cancelled() => {}
            }
        });

        token
    }
}
