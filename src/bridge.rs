//! One-shot plumbing between a submission's resolution site and the caller.
//!
//! Submitting an operation synchronously returns a [`TaskHandle`]; the
//! operation resolves later, somewhere inside a spawned task. The
//! [`ContinuationBridge`] is the sink in between: exactly one resume wins,
//! and a bridge torn down without a resume delivers [`TaskError::Cancelled`]
//! so no handle is ever left dangling.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{TaskError, TaskResult};
use crate::id::Id;
use crate::node::TaskNode;

/// A one-shot sink holding at most one resolver for a result of type `R`.
///
/// The resolver is installed at construction, as the sending half of the
/// channel created by [`ContinuationBridge::channel`]; replacement is not
/// supported. The first of `resume_ok` / `resume_err` consumes the bridge,
/// subsequent resumes are silently discarded.
pub(crate) struct ContinuationBridge<R> {
    tx: Option<oneshot::Sender<TaskResult<R>>>,
}

impl<R> ContinuationBridge<R> {
    /// Creates a bridge and the receiving half its [`TaskHandle`] awaits.
    pub(crate) fn channel() -> (Self, oneshot::Receiver<TaskResult<R>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub(crate) fn resume_ok(&mut self, value: R) {
        self.resume(Ok(value));
    }

    pub(crate) fn resume_err(&mut self, err: TaskError) {
        self.resume(Err(err));
    }

    fn resume(&mut self, result: TaskResult<R>) {
        if let Some(tx) = self.tx.take() {
            // A send error means the caller dropped the handle; the result is
            // discarded, which is exactly detach semantics.
            let _ = tx.send(result);
        }
    }
}

impl<R> Drop for ContinuationBridge<R> {
    fn drop(&mut self) {
        // Teardown without a result counts as cancellation. This fires when a
        // never-activated node is invalidated and its factory is dropped with
        // the bridge still inside.
        self.resume(Err(TaskError::Cancelled));
    }
}

impl<R> fmt::Debug for ContinuationBridge<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationBridge")
            .field("resumed", &self.tx.is_none())
            .finish()
    }
}

/// An owned claim on the result of one submission.
///
/// Awaiting the handle yields the operation's returned value, the operation's
/// error, or [`TaskError::Cancelled`]. Every handle resolves exactly once.
///
/// Dropping a `TaskHandle` *detaches* the submission: the operation keeps its
/// place in its coordinator and runs to completion, its result is discarded.
/// Use [`TaskHandle::cancel`] to actually stop the work.
pub struct TaskHandle<R> {
    rx: oneshot::Receiver<TaskResult<R>>,
    node: Weak<TaskNode>,
    id: Id,
    label: Arc<str>,
}

impl<R> TaskHandle<R> {
    pub(crate) fn new(
        rx: oneshot::Receiver<TaskResult<R>>,
        node: Weak<TaskNode>,
        id: Id,
        label: Arc<str>,
    ) -> Self {
        Self {
            rx,
            node,
            id,
            label,
        }
    }

    /// Requests cancellation of the submission backing this handle.
    ///
    /// Propagates to the running operation's cancellation token, or prevents
    /// activation entirely if the operation has not started yet. Idempotent;
    /// the handle then resolves with [`TaskError::Cancelled`] unless the
    /// operation already delivered a result.
    pub fn cancel(&self) {
        if let Some(node) = self.node.upgrade() {
            node.invalidate();
        }
    }

    /// Returns `true` once the underlying node reached a terminal state
    /// (finished or invalidated). A node that was reclaimed entirely counts
    /// as finished.
    pub fn is_finished(&self) -> bool {
        self.node.upgrade().is_none_or(|node| node.is_terminal())
    }

    /// The unique ID of the submission backing this handle.
    pub fn id(&self) -> Id {
        self.id
    }

    /// The label the submission was created with.
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = TaskResult<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The bridge was dropped without resuming and its own Drop could
            // not run (task aborted mid-poll); still resolve, as Cancelled.
            Poll::Ready(Err(_closed)) => Poll::Ready(Err(TaskError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<R> fmt::Debug for TaskHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("finished", &self.is_finished())
            .finish()
    }
}
