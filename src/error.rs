/// A centralized error type for everything a [`TaskHandle`] can resolve with.
///
/// Cancellation is a sentinel, not a failure: coordinators never log it at
/// error level, and a cancelled chain keeps advancing exactly as if the
/// operation had succeeded.
///
/// [`TaskHandle`]: crate::bridge::TaskHandle
#[derive(thiserror::Error, Debug)]
pub enum TaskError {
    /// The node backing the submission was invalidated, or the operation
    /// observed cancellation before producing a result.
    #[error("task was cancelled before completing")]
    Cancelled,

    /// The operation itself failed. The error is forwarded verbatim from the
    /// submitted closure.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl TaskError {
    /// Returns `true` if this is the cancellation sentinel.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }
}

/// Result type resolved by a [`TaskHandle`](crate::bridge::TaskHandle).
pub type TaskResult<R> = std::result::Result<R, TaskError>;
