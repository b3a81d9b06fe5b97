//! Error types for service lifecycles.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::state::State;

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by state machines, engines and service trees.
///
/// Errors are cheap to clone so they can be copied into health snapshots.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// `start` was called on something that already left `Unstarted`.
    #[error("{name} has already been started once; state={state}")]
    AlreadyStarted {
        /// Name of the service.
        name: String,
        /// State observed by the failed call.
        state: State,
    },

    /// `close` was called on something that is already stopped.
    #[error("{name} has already been stopped")]
    AlreadyStopped {
        /// Name of the service.
        name: String,
    },

    /// `close` was called before `start`.
    #[error("cannot stop unstarted service {name}")]
    CannotStopUnstarted {
        /// Name of the service.
        name: String,
    },

    /// `close` was called from a state that cannot transition to `Stopping`.
    #[error("{name} cannot be stopped from this state; state={state}")]
    CannotStop {
        /// Name of the service.
        name: String,
        /// State observed by the failed call.
        state: State,
    },

    /// The service is not in the `Started` state.
    #[error("service is {state}, not started")]
    NotStarted {
        /// State observed by the check.
        state: State,
    },

    /// `try_add` was called on a wait group that is already being waited on.
    #[error("wait group is stopped")]
    WaitGroupStopped,

    /// A health reporter was registered or unregistered without a name.
    #[error("misconfigured check for empty name")]
    EmptyName,

    /// Sub-services of a node failed to start.
    #[error("failed to start sub-services of {name}: {source}")]
    SubServicesStartFailed {
        /// Name of the parent service.
        name: String,
        /// Underlying error.
        source: Box<Error>,
    },

    /// The start hook of a service failed.
    #[error("failed to start service {name}: {source}")]
    StartFailed {
        /// Name of the service.
        name: String,
        /// Underlying error.
        source: Box<Error>,
    },

    /// The close hook of a service failed.
    #[error("failed to close service {name}: {source}")]
    CloseFailed {
        /// Name of the service.
        name: String,
        /// Underlying error.
        source: Box<Error>,
    },

    /// Free-form error message.
    #[error("{0}")]
    Custom(String),

    /// Any other error.
    #[error(transparent)]
    Other(Arc<dyn std::error::Error + Send + Sync>),

    /// Several errors joined together.
    #[error("{0}")]
    Joined(JoinedErrors),
}

impl Error {
    /// Creates a free-form error.
    pub fn custom(message: impl Into<String>) -> Self {
        Self::Custom(message.into())
    }

    /// Wraps an arbitrary error.
    pub fn other<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Other(Arc::new(error))
    }

    /// Joins errors into one.
    ///
    /// Returns `Ok(())` for no errors and the error itself for exactly one.
    /// Nested joined errors are flattened.
    ///
    /// # Errors
    ///
    /// Returns the joined error when at least one error is given.
    pub fn join<I>(errors: I) -> Result<()>
    where
        I: IntoIterator<Item = Self>,
    {
        let mut flat: Vec<Self> = errors.into_iter().flat_map(Self::into_list).collect();

        match flat.len() {
            0 => Ok(()),
            1 => Err(flat.remove(0)),
            _ => Err(Self::Joined(JoinedErrors(flat))),
        }
    }

    /// Joins this error with the error in `other`, if any.
    #[must_use]
    pub fn and(self, other: Result<()>) -> Self {
        match other {
            Ok(()) => self,
            Err(other) => {
                let mut errors = self.into_list();
                errors.extend(other.into_list());
                Self::Joined(JoinedErrors(errors))
            }
        }
    }

    fn into_list(self) -> Vec<Self> {
        match self {
            Self::Joined(JoinedErrors(inner)) => inner,
            other => vec![other],
        }
    }

    /// Returns true if this error, or any error it wraps or joins, matches `predicate`.
    pub fn any<F>(&self, predicate: F) -> bool
    where
        F: Fn(&Self) -> bool + Copy,
    {
        if predicate(self) {
            return true;
        }

        match self {
            Self::Joined(JoinedErrors(inner)) => inner.iter().any(|e| e.any(predicate)),
            Self::SubServicesStartFailed { source, .. }
            | Self::StartFailed { source, .. }
            | Self::CloseFailed { source, .. } => source.any(predicate),
            _ => false,
        }
    }
}

/// Joins the errors out of a sequence of results.
///
/// # Errors
///
/// Returns the joined error when any of the results failed.
pub fn join_errors<I>(results: I) -> Result<()>
where
    I: IntoIterator<Item = Result<()>>,
{
    Error::join(results.into_iter().filter_map(std::result::Result::err))
}

/// A list of errors reported as one.
#[derive(Clone, Debug)]
pub struct JoinedErrors(Vec<Error>);

impl JoinedErrors {
    /// The joined errors, in the order they were joined.
    #[must_use]
    pub fn errors(&self) -> &[Error] {
        &self.0
    }
}

impl fmt::Display for JoinedErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}
