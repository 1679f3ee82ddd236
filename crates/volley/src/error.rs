//! Error types for batch dispatch.
//!
//! Two layers are distinguished:
//!
//! - [`ValidationError`]: the call itself was malformed. Raised before any
//!   task is started, so no executor was ever invoked.
//! - [`DispatchError`]: the batch-level error surfaced by
//!   [`dispatch`](crate::dispatch). It either wraps a [`ValidationError`], a
//!   failure reported by the executor for a specific index, or a cancellation
//!   observed by a specific task.
//!
//! The executor's own error type is carried through unchanged in
//! [`DispatchError::Task`], so callers can match on transport-specific causes.

use crate::cancel::CancelCause;
use thiserror::Error;

/// Convenience alias for the outcome of a dispatched batch.
pub type Result<T, E> = core::result::Result<T, DispatchError<E>>;

/// A malformed dispatch call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    /// `max_concurrency` was zero.
    #[error("max_concurrency must be a positive integer")]
    InvalidConcurrency,

    /// The input at `index` was absent (`None`).
    #[error("invalid input at index {index}: input is missing")]
    MissingInput { index: usize },

    /// The executor rejected the input at `index` before the batch started.
    #[error("invalid input at index {index}: {reason}")]
    InvalidInput { index: usize, reason: String },
}

/// The terminal error of a dispatched batch.
///
/// The generic parameter `E` is the executor's error type.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DispatchError<E> {
    /// The call was rejected before any task started.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The executor reported a failure for the task at `index`.
    #[error("task {index} failed: {source}")]
    Task {
        index: usize,
        #[source]
        source: E,
    },

    /// The task at `index` observed its cancellation token firing, either
    /// before it was started or while it was in flight.
    #[error("task {index} cancelled ({cause})")]
    Cancelled { index: usize, cause: CancelCause },
}

impl<E> DispatchError<E> {
    /// Index of the task this error is attributed to, if any.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Validation(ValidationError::MissingInput { index })
            | Self::Validation(ValidationError::InvalidInput { index, .. })
            | Self::Task { index, .. }
            | Self::Cancelled { index, .. } => Some(*index),
            Self::Validation(_) => None,
        }
    }

    /// The cancellation cause, if this is a cancellation-flavored failure.
    pub fn cause(&self) -> Option<CancelCause> {
        match self {
            Self::Cancelled { cause, .. } => Some(*cause),
            _ => None,
        }
    }

    /// Returns `true` if the task was stopped by its cancellation token.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns `true` if the call was rejected before any work started.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns the executor's error, if the executor reported one.
    pub fn into_task_error(self) -> Option<E> {
        match self {
            Self::Task { source, .. } => Some(source),
            _ => None,
        }
    }
}
