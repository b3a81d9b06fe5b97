//! Wait group that refuses late additions.

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// A counting wait group where adding after [`WaitGroup::wait`] has begun fails
/// with [`Error::WaitGroupStopped`] instead of racing the waiter.
#[derive(Debug)]
pub struct WaitGroup {
    waiting: Mutex<bool>,
    count: watch::Sender<usize>,
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    /// Creates an empty wait group.
    #[must_use]
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            waiting: Mutex::new(false),
            count,
        }
    }

    /// Adds `n` to the live count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WaitGroupStopped`] once `wait` has been called.
    pub fn try_add(&self, n: usize) -> Result<()> {
        let waiting = self.waiting.lock();
        if *waiting {
            return Err(Error::WaitGroupStopped);
        }
        self.count.send_modify(|count| *count += n);
        Ok(())
    }

    /// Marks one unit of work as done, waking waiters when the count reaches zero.
    ///
    /// # Panics
    ///
    /// Panics if called more times than were added.
    pub fn done(&self) {
        self.count.send_modify(|count| {
            *count = count
                .checked_sub(1)
                .unwrap_or_else(|| panic!("negative WaitGroup counter"));
        });
    }

    /// Stops further additions, then waits for the count to reach zero.
    pub async fn wait(&self) {
        *self.waiting.lock() = true;

        let mut count = self.count.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = count.wait_for(|count| *count == 0).await;
    }

    /// Whether `wait` has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        *self.waiting.lock()
    }

    /// Current live count.
    #[must_use]
    pub fn count(&self) -> usize {
        *self.count.borrow()
    }
}
