use std::time::Duration;

use thiserror::Error;

use crate::sync::{AcquireError, TaskError};

/// An error produced by a recovery or save strategy.
///
/// These are the failures of the collaborators a cell is built from. They are cloneable, so the
/// same failure can be reported to every caller waiting on one recovery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// The data backing the value does not exist (anymore).
    #[error("not found")]
    NotFound,
    /// The backing store could not be reached.
    ///
    /// The attached string describes the underlying problem.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The data was read successfully, but could not be turned into a value.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The strategy observed its cancellation token and stopped.
    #[error("cancelled")]
    Cancelled,
    /// An unexpected error in revive itself.
    ///
    /// The underlying error was logged when this was created.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for SourceError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for SourceError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<TaskError> for SourceError {
    #[track_caller]
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Dropped => Self::Cancelled,
            TaskError::Panicked => Self::from_std_error(err),
        }
    }
}

impl SourceError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

/// The result of a recovery or save strategy.
pub type SourceResult<T> = Result<T, SourceError>;

/// An error returned to callers asking a [`ValueSource`](super::ValueSource) for its value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    /// The caller's cancellation token fired, either while waiting or during recovery.
    #[error("cancelled")]
    Cancelled,
    /// A blocking wait for the cell's lock exceeded the configured timeout.
    #[error("timed out after {0:?} waiting for the value")]
    TimedOut(Duration),
    /// The value was reclaimed and this source has no way to recover it.
    #[error("value was reclaimed")]
    Reclaimed,
    /// Recovering the value failed.
    #[error("recovery failed: {0}")]
    Recovery(#[source] SourceError),
}

impl From<SourceError> for ValueError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Cancelled => Self::Cancelled,
            err => Self::Recovery(err),
        }
    }
}

impl From<AcquireError> for ValueError {
    fn from(err: AcquireError) -> Self {
        match err {
            AcquireError::Cancelled => Self::Cancelled,
            AcquireError::TimedOut(timeout) => Self::TimedOut(timeout),
        }
    }
}

/// The result of asking a [`ValueSource`](super::ValueSource) for its value.
pub type ValueResult<T> = Result<T, ValueError>;
