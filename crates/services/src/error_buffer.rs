//! Bounded buffer of soft errors.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Capacity applied to a service's error buffer when it starts.
pub const DEFAULT_ERROR_BUFFER_CAP: usize = 50;

/// A thread-safe ring of recently observed errors.
///
/// Once the buffer holds `cap` errors, appending evicts the oldest one.
/// A capacity of zero means unbounded.
#[derive(Debug, Default)]
pub struct ErrorBuffer {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    errors: VecDeque<Error>,
    cap: usize,
}

impl ErrorBuffer {
    /// Creates an unbounded buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer holding at most `cap` errors.
    #[must_use]
    pub fn with_cap(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                errors: VecDeque::with_capacity(cap),
                cap,
            }),
        }
    }

    /// Appends an error, evicting the oldest one if the buffer is full.
    pub fn append(&self, error: Error) {
        let mut inner = self.inner.lock();
        if inner.cap > 0 && inner.errors.len() >= inner.cap {
            inner.errors.pop_front();
        }
        inner.errors.push_back(error);
    }

    /// Drains the buffer into a single joined error.
    ///
    /// # Errors
    ///
    /// Returns the buffered errors joined together, if there were any.
    pub fn flush(&self) -> Result<()> {
        let errors = std::mem::take(&mut self.inner.lock().errors);
        Error::join(errors)
    }

    /// Sets the capacity, keeping only the newest `cap` errors if the buffer is larger.
    pub fn set_cap(&self, cap: usize) {
        let mut inner = self.inner.lock();
        if cap > 0 && inner.errors.len() > cap {
            let excess = inner.errors.len() - cap;
            inner.errors.drain(..excess);
        }
        inner.cap = cap;
    }

    /// Number of buffered errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().errors.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().errors.is_empty()
    }
}
