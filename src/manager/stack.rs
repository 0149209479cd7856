use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::bridge::TaskHandle;
use crate::manager::Priority;
use crate::node::{TaskNode, new_task};

/// Published `{waiting, executing}` snapshot of a [`StackScheduler`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Nodes parked in the waiting deque, newest first.
    pub waiting: usize,
    /// Nodes currently executing.
    pub executing: usize,
}

/// A LIFO scheduler with a ceiling on concurrently executing tasks.
///
/// Newly submitted work is preferred over older waiting work: whenever
/// capacity frees up, the *most recent* waiting submission activates next.
/// With a ceiling of 1 and submissions A, B, C, the execution order is
/// A (activated immediately), then C, then B.
///
/// Cloning is cheap and every clone drives the same stack.
#[derive(Clone)]
pub struct StackScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    max_concurrent: usize,
    state: Mutex<StackState>,
    counts_tx: watch::Sender<Counts>,
}

#[derive(Default)]
struct StackState {
    /// Waiting nodes, newest at the front.
    waiting: VecDeque<Arc<TaskNode>>,
    executing: Vec<Arc<TaskNode>>,
}

impl StackScheduler {
    /// Creates a scheduler that executes at most `max_concurrent` operations
    /// at once.
    ///
    /// A ceiling of zero is a programming error; release builds clamp it
    /// to 1.
    pub fn new(max_concurrent: usize) -> Self {
        debug_assert!(max_concurrent >= 1, "ceiling must be at least 1");
        let (counts_tx, _) = watch::channel(Counts::default());
        Self {
            inner: Arc::new(Inner {
                max_concurrent: max_concurrent.max(1),
                state: Mutex::new(StackState::default()),
                counts_tx,
            }),
        }
    }

    /// Submits an operation at the top of the stack, then drains: if capacity
    /// allows, the operation starts immediately, ahead of older waiting work.
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
            inner.finish(completed);
        });

        debug!(node = %node.id(), label = %node.label(), "submit");

        {
            let mut state = self.inner.state.lock();
            state.waiting.push_front(node);
            self.inner.publish(&state);
        }
        self.inner.drain();
        handle
    }

    /// The configured ceiling.
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Snapshot of the published counter pair.
    pub fn counts(&self) -> Counts {
        *self.inner.counts_tx.borrow()
    }

    /// Returns once both published counters are zero: nothing waiting,
    /// nothing executing.
    pub async fn wait_until_all_item_processed(&self) {
        let mut rx = self.inner.counts_tx.subscribe();
        // The sender lives on `self`, so this cannot fail while we borrow it.
        let _ = rx
            .wait_for(|counts| counts.waiting == 0 && counts.executing == 0)
            .await;
    }

    /// Invalidates every waiting node without running it and requests
    /// cancellation of everything currently executing. Executing nodes leave
    /// the published counts as their operations wind down. Idempotent.
    pub fn cancel_all(&self) {
        let dropped: Vec<Arc<TaskNode>> = {
            let mut state = self.inner.state.lock();
            let mut dropped: Vec<_> = state.waiting.drain(..).collect();
            dropped.extend(state.executing.iter().cloned());
            self.inner.publish(&state);
            dropped
        };
        if dropped.is_empty() {
            return;
        }
        debug!(nodes = dropped.len(), "cancel_all");
        for node in dropped {
            node.invalidate();
        }
    }
}

impl Inner {
    /// Activates waiting nodes, newest first, until the ceiling is reached or
    /// the deque is empty.
    fn drain(&self) {
        loop {
            let to_activate: SmallVec<[Arc<TaskNode>; 4]> = {
                let mut state = self.state.lock();
                let mut out = SmallVec::new();
                while state.executing.len() < self.max_concurrent {
                    let Some(node) = state.waiting.pop_front() else {
                        break;
                    };
                    // Dropped from the deque without ever running.
                    if node.is_terminal() {
                        continue;
                    }
                    state.executing.push(Arc::clone(&node));
                    out.push(node);
                }
                self.publish(&state);
                out
            };

            if to_activate.is_empty() {
                return;
            }

            let mut stalled = false;
            for node in to_activate {
                trace!(node = %node.id(), "drained");
                if node.activate() || node.is_activated() {
                    continue;
                }
                // Cancelled between the pop and the activation; no completion
                // will come from it, so withdraw it from the executing set.
                let mut state = self.state.lock();
                if let Some(pos) = state
                    .executing
                    .iter()
                    .position(|executing| Arc::ptr_eq(executing, &node))
                {
                    state.executing.swap_remove(pos);
                }
                self.publish(&state);
                stalled = true;
            }
            if !stalled {
                return;
            }
            // Capacity freed up; take another pass over the deque.
        }
    }

    /// Completion loopback: withdraw the node from the executing set, publish
    /// the new counts, and refill from the deque.
    fn finish(&self, completed: &Arc<TaskNode>) {
        {
            let mut state = self.state.lock();
            if let Some(pos) = state
                .executing
                .iter()
                .position(|executing| Arc::ptr_eq(executing, completed))
            {
                state.executing.swap_remove(pos);
            }
            self.publish(&state);
        }
        self.drain();
    }

    fn publish(&self, state: &StackState) {
        self.counts_tx.send_replace(Counts {
            waiting: state.waiting.len(),
            executing: state.executing.len(),
        });
    }
}

impl fmt::Debug for StackScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts = self.counts();
        f.debug_struct("StackScheduler")
            .field("max_concurrent", &self.inner.max_concurrent)
            .field("waiting", &counts.waiting)
            .field("executing", &counts.executing)
            .finish()
    }
}
