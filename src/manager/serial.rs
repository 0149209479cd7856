use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::bridge::TaskHandle;
use crate::manager::Priority;
use crate::node::{TaskNode, new_task};

/// A single logical FIFO stream.
///
/// Equivalent to a [`KeyedTaskManager`](crate::manager::KeyedTaskManager)
/// with exactly one key and wait-in-current semantics, for call sites that
/// need no keying: one operation runs at a time, in submission order.
///
/// Cloning is cheap and every clone drives the same queue.
#[derive(Clone, Default)]
pub struct SerialTaskQueue {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<QueueState>,
    /// Signalled on every head transition, so drain waiters can re-observe
    /// the chain without polling.
    changed: Notify,
}

#[derive(Default)]
struct QueueState {
    /// The currently-active (or about-to-be-activated) node; the chain behind
    /// it is the waiting list in FIFO order.
    head: Option<Arc<TaskNode>>,
}

impl SerialTaskQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Submits an operation at the back of the stream.
    ///
    /// If the queue is idle the operation activates immediately; otherwise it
    /// runs once everything submitted before it has reached a terminal state.
    pub fn submit<R, F, Fut>(
        &self,
        label: impl Into<String>,
        priority: Priority,
        op: F,
    ) -> TaskHandle<R>
    where
        R: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let (node, handle) = new_task(label.into(), priority, op, move |completed| {
            inner.advance(completed);
        });

        debug!(node = %node.id(), label = %node.label(), "submit");

        let is_head = {
            let mut state = self.inner.state.lock();
            match &state.head {
                Some(head) => {
                    head.endpoint().add_next(Arc::clone(&node));
                    false
                }
                None => {
                    state.head = Some(Arc::clone(&node));
                    true
                }
            }
        };

        if is_head {
            self.inner.changed.notify_waiters();
            if !node.activate() && !node.is_activated() {
                self.inner.advance(&node);
            }
        }
        handle
    }

    /// Whether any node is queued or in flight.
    pub fn has_work(&self) -> bool {
        self.inner.state.lock().head.is_some()
    }

    /// Invalidates every node reachable from the head and clears the queue.
    /// Idempotent, and safe to call concurrently with submissions.
    pub fn cancel_all(&self) {
        let chain = self.inner.state.lock().head.take();
        if let Some(head) = chain {
            debug!("cancel_all");
            self.inner.changed.notify_waiters();
            head.for_each(|node| node.invalidate());
        }
    }

    /// Awaits completion of the *present* endpoint: everything queued at the
    /// time of the call, but not operations appended afterwards.
    pub async fn wait_until_current_drained(&self) {
        let endpoint = {
            let state = self.inner.state.lock();
            state.head.as_ref().map(TaskNode::endpoint)
        };
        if let Some(node) = endpoint {
            node.wait().await;
        }
    }

    /// Awaits quiescence: successively awaits each head until the queue is
    /// empty, *including* operations appended while draining.
    pub async fn wait_until_all_drained(&self) {
        loop {
            let changed = self.inner.changed.notified();
            let mut changed = std::pin::pin!(changed);
            changed.as_mut().enable();

            let Some(head) = ({
                let state = self.inner.state.lock();
                state.head.clone()
            }) else {
                return;
            };

            if head.is_terminal() {
                // The completing task promotes the successor after waking the
                // node's waiters; wait for the structural transition instead
                // of spinning on the spent head.
                changed.await;
            } else {
                head.wait().await;
            }
        }
    }
}

impl Inner {
    /// Completion loopback: promote the completed head's successor, skipping
    /// nodes cancelled while they waited, or clear the head if the completed
    /// node was the tail.
    fn advance(&self, completed: &Arc<TaskNode>) {
        let mut completed = Arc::clone(completed);
        loop {
            let promoted = {
                let mut state = self.state.lock();
                let Some(head) = state.head.as_ref() else {
                    // Raced a cancel_all; nothing to advance.
                    return;
                };
                if !Arc::ptr_eq(head, &completed) {
                    return;
                }

                let promoted = Self::first_live(completed.next());
                state.head = promoted.clone();
                promoted
            };
            self.changed.notify_waiters();

            let Some(node) = promoted else { return };
            trace!(node = %node.id(), "promoted");
            if node.activate() || node.is_activated() {
                return;
            }
            // Cancelled between promotion and activation; keep advancing.
            completed = node;
        }
    }

    /// First node of `chain` that was not cancelled while it waited.
    fn first_live(mut chain: Option<Arc<TaskNode>>) -> Option<Arc<TaskNode>> {
        while let Some(node) = chain {
            if node.is_terminal() {
                chain = node.next();
            } else {
                return Some(node);
            }
        }
        None
    }
}

impl fmt::Debug for SerialTaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTaskQueue")
            .field("has_work", &self.has_work())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{Recorder, emit_after, init_test_logging};
    use std::time::Duration;

    const MS: fn(u64) -> Duration = Duration::from_millis;

    #[tokio::test(start_paused = true)]
    async fn test_operations_run_in_submission_order() {
        init_test_logging();
        let queue = SerialTaskQueue::new();
        let rec = Recorder::new();

        for i in 0..4 {
            queue.submit(
                format!("op-{i}"),
                Priority::Normal,
                emit_after(&rec, &i.to_string(), MS(50)),
            );
        }

        queue.wait_until_all_drained().await;
        assert_eq!(rec.snapshot(), vec!["0", "1", "2", "3"]);
        assert!(!queue.has_work());
    }

    #[tokio::test(start_paused = true)]
    async fn test_has_work_transitions() {
        init_test_logging();
        let queue = SerialTaskQueue::new();
        let rec = Recorder::new();

        assert!(!queue.has_work());
        queue.submit("only", Priority::Normal, emit_after(&rec, "only", MS(10)));
        assert!(queue.has_work());

        queue.wait_until_all_drained().await;
        assert!(!queue.has_work());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_empties_the_queue() {
        init_test_logging();
        let queue = SerialTaskQueue::new();
        let rec = Recorder::new();

        let handles: Vec<_> = (0..3)
            .map(|i| {
                queue.submit(
                    format!("op-{i}"),
                    Priority::Normal,
                    emit_after(&rec, &i.to_string(), MS(1000)),
                )
            })
            .collect();

        tokio::time::sleep(MS(100)).await;
        queue.cancel_all();
        assert!(!queue.has_work());

        for handle in handles {
            assert!(handle.await.unwrap_err().is_cancelled());
        }
        tokio::time::sleep(MS(2000)).await;
        assert!(rec.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_current_drained_ignores_later_appends() {
        init_test_logging();
        let queue = SerialTaskQueue::new();
        let rec = Recorder::new();

        queue.submit("a", Priority::Normal, emit_after(&rec, "a", MS(100)));
        queue.submit("b", Priority::Normal, emit_after(&rec, "b", MS(100)));

        let observer = {
            let queue = queue.clone();
            let rec = rec.clone();
            tokio::spawn(async move {
                queue.wait_until_current_drained().await;
                rec.push("drained");
            })
        };
        // Let the observer take its endpoint snapshot before appending more.
        tokio::task::yield_now().await;
        queue.submit("c", Priority::Normal, emit_after(&rec, "c", MS(100)));

        observer.await.expect("observer panicked");
        queue.wait_until_all_drained().await;
        assert_eq!(rec.snapshot(), vec!["a", "b", "drained", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_all_drained_follows_new_submissions() {
        init_test_logging();
        let queue = SerialTaskQueue::new();
        let rec = Recorder::new();

        let tail_queue = queue.clone();
        let tail_rec = rec.clone();
        queue.submit("a", Priority::Normal, move |_token| async move {
            tokio::time::sleep(MS(50)).await;
            tail_rec.push("a");
            // Submitted mid-drain; quiescence must include it.
            let rec = tail_rec.clone();
            tail_queue.submit("b", Priority::Normal, move |_token| async move {
                tokio::time::sleep(MS(50)).await;
                rec.push("b");
                anyhow::Ok(())
            });
            anyhow::Ok(())
        });

        queue.wait_until_all_drained().await;
        assert_eq!(rec.snapshot(), vec!["a", "b"]);
        assert!(!queue.has_work());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drained_waits_return_immediately_when_idle() {
        init_test_logging();
        let queue = SerialTaskQueue::new();
        queue.wait_until_current_drained().await;
        queue.wait_until_all_drained().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_operation_does_not_stop_the_stream() {
        init_test_logging();
        let queue = SerialTaskQueue::new();
        let rec = Recorder::new();

        let failing = queue.submit("failing", Priority::Normal, |_token| async {
            Err::<(), _>(anyhow::anyhow!("boom"))
        });
        queue.submit("after", Priority::Normal, emit_after(&rec, "after", MS(10)));

        assert!(!failing.await.unwrap_err().is_cancelled());
        queue.wait_until_all_drained().await;
        assert_eq!(rec.snapshot(), vec!["after"]);
    }
}
