//! Deferred-activation chain elements shared by every coordinator.
//!
//! A [`TaskNode`] wraps a single asynchronous operation behind a one-shot
//! activation gate. Coordinators link nodes into singly-linked chains and
//! decide when each node activates; the node itself guarantees at-most-once
//! activation, cooperative invalidation, and a completion event that any
//! number of waiters can await.

use std::fmt;
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::bridge::{ContinuationBridge, TaskHandle};
use crate::error::TaskError;
use crate::id::Id;
use crate::manager::Priority;

bitflags! {
    /// Monotonic lifecycle flags of a node. Once set, a flag is never cleared.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct NodeFlags: u8 {
        /// The factory was consumed and spawned onto the runtime.
        const ACTIVATED = 1;
        /// The factory future resolved, value or error delivered.
        const FINISHED = 1 << 1;
        /// The node was cancelled; a pending activation is suppressed.
        const INVALIDATED = 1 << 2;
    }
}

impl NodeFlags {
    fn is_terminal(self) -> bool {
        self.intersects(NodeFlags::FINISHED | NodeFlags::INVALIDATED)
    }
}

/// The stored operation: consumes a weak back-reference to its node and
/// produces the future that is spawned at activation time. The weak direction
/// matters, a finished node must be reclaimable while its spawned future is
/// still pending drop.
type Factory = Box<dyn FnOnce(Weak<TaskNode>) -> BoxFuture<'static, ()> + Send + 'static>;

struct NodeState {
    flags: NodeFlags,
    factory: Option<Factory>,
    task: Option<JoinHandle<()>>,
    next: Option<Arc<TaskNode>>,
}

/// A singly-linked chain element wrapping one deferred asynchronous operation.
///
/// State machine: `Pending → (Activated → Finished) | Invalidated`. Both
/// `Finished` and `Invalidated` are sinks and both wake waiters.
pub(crate) struct TaskNode {
    id: Id,
    label: Arc<str>,
    priority: Priority,
    token: CancellationToken,
    /// Completion-or-invalidation event. Waiters register through
    /// [`TaskNode::wait`]; terminal transitions call `notify_waiters`.
    done: Notify,
    state: Mutex<NodeState>,
}

impl TaskNode {
    fn new(
        label: Arc<str>,
        priority: Priority,
        token: CancellationToken,
        factory: Factory,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Id::next(),
            label,
            priority,
            token,
            done: Notify::new(),
            state: Mutex::new(NodeState {
                flags: NodeFlags::default(),
                factory: Some(factory),
                task: None,
                next: None,
            }),
        })
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    pub(crate) fn label(&self) -> &Arc<str> {
        &self.label
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.lock().flags.contains(NodeFlags::FINISHED)
    }

    pub(crate) fn is_invalidated(&self) -> bool {
        self.state.lock().flags.contains(NodeFlags::INVALIDATED)
    }

    pub(crate) fn is_activated(&self) -> bool {
        self.state.lock().flags.contains(NodeFlags::ACTIVATED)
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.state.lock().flags.is_terminal()
    }

    /// Spawns the stored factory onto the runtime.
    ///
    /// Idempotent: a node that is already activated, already invalidated, or
    /// already carries a spawned task is left untouched. Returns `true` iff
    /// this call performed the activation, so callers that just installed the
    /// node into their structure can tell whether a racing invalidation won.
    pub(crate) fn activate(self: &Arc<Self>) -> bool {
        let mut state = self.state.lock();
        if state
            .flags
            .intersects(NodeFlags::ACTIVATED | NodeFlags::INVALIDATED)
            || state.task.is_some()
        {
            return false;
        }
        let Some(factory) = state.factory.take() else {
            return false;
        };

        state.flags |= NodeFlags::ACTIVATED;
        let fut = factory(Arc::downgrade(self));
        // Spawning is a non-blocking enqueue; the spawned future cannot run
        // inline, so holding the node lock here cannot deadlock.
        state.task = Some(tokio::spawn(fut));

        trace!(node = %self.id, label = %self.label, priority = ?self.priority, "activated");
        true
    }

    /// Marks the node finished and wakes every waiter. Called exactly once by
    /// the factory future's trailing step; runs outside any coordinator lock.
    pub(crate) fn complete(&self) {
        {
            let mut state = self.state.lock();
            state.flags |= NodeFlags::FINISHED;
        }
        trace!(node = %self.id, label = %self.label, "finished");
        self.done.notify_waiters();
    }

    /// Requests cancellation: suppresses a pending activation, cancels the
    /// in-flight operation's token if one is running, and wakes every waiter.
    /// Idempotent.
    pub(crate) fn invalidate(&self) {
        {
            let mut state = self.state.lock();
            if state.flags.contains(NodeFlags::INVALIDATED) {
                return;
            }
            state.flags |= NodeFlags::INVALIDATED;
            // An invalidated, never-activated node must not run. Dropping the
            // factory also drops its captured bridge, which resolves the
            // caller's handle with `Cancelled`.
            state.factory = None;
        }
        trace!(node = %self.id, label = %self.label, "invalidated");
        self.token.cancel();
        self.done.notify_waiters();
    }

    /// Links `other` behind this node. A node's successor may be set at most
    /// once; a second call is a programming error.
    pub(crate) fn add_next(&self, other: Arc<TaskNode>) {
        let mut state = self.state.lock();
        debug_assert!(
            state.next.is_none(),
            "node {} already has a successor",
            self.id
        );
        if state.next.is_none() {
            state.next = Some(other);
        }
    }

    pub(crate) fn next(&self) -> Option<Arc<TaskNode>> {
        self.state.lock().next.clone()
    }

    /// Returns the last node reachable by following `next` pointers.
    pub(crate) fn endpoint(self: &Arc<Self>) -> Arc<TaskNode> {
        let mut current = Arc::clone(self);
        while let Some(next) = current.next() {
            current = next;
        }
        current
    }

    /// Applies `f` to every node in the chain starting at `self`.
    pub(crate) fn for_each<F: FnMut(&Arc<TaskNode>)>(self: &Arc<Self>, mut f: F) {
        let mut current = Some(Arc::clone(self));
        while let Some(node) = current {
            f(&node);
            current = node.next();
        }
    }

    /// Suspends until the node is finished or invalidated. Returns
    /// immediately if either flag is already set. Any number of waiters may
    /// wait concurrently; each is woken exactly once.
    pub(crate) async fn wait(&self) {
        let notified = self.done.notified();
        let mut notified = std::pin::pin!(notified);
        // Register before checking the flags so a terminal transition between
        // the check and the await cannot be missed.
        notified.as_mut().enable();
        if self.is_terminal() {
            return;
        }
        notified.await;
    }
}

// Skip the factory and the join handle, neither is Debug and neither is
// interesting beyond presence.
impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskNode")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("priority", &self.priority)
            .field("flags", &state.flags)
            .field("has_next", &state.next.is_some())
            .finish()
    }
}

/// Builds the node/handle pair every submission produces.
///
/// The returned handle resolves with the operation's value, the operation's
/// error, or [`TaskError::Cancelled`]. `on_complete` is the coordinator's
/// loopback: it runs in the spawned task after the node turned terminal and
/// must advance the coordinator's structure.
pub(crate) fn new_task<R, F, Fut, C>(
    label: String,
    priority: Priority,
    op: F,
    on_complete: C,
) -> (Arc<TaskNode>, TaskHandle<R>)
where
    R: Send + 'static,
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    C: FnOnce(&Arc<TaskNode>) + Send + 'static,
{
    let label: Arc<str> = label.into();
    let token = CancellationToken::new();
    let (mut bridge, rx) = ContinuationBridge::channel();

    let op_token = token.clone();
    let factory: Factory = Box::new(move |weak: Weak<TaskNode>| {
        Box::pin(async move {
            let result = op(op_token.clone()).await;

            // The cancelled predicate wins over whatever the operation
            // returned: a value produced after invalidation is stale.
            if op_token.is_cancelled() {
                bridge.resume_err(TaskError::Cancelled);
            } else {
                match result {
                    Ok(value) => bridge.resume_ok(value),
                    Err(err) => bridge.resume_err(TaskError::Failed(err)),
                }
            }

            // A failed upgrade means every owner dropped the node while the
            // operation was in flight; there is no structure left to advance.
            if let Some(node) = weak.upgrade() {
                node.complete();
                on_complete(&node);
            }
        })
    });

    let node = TaskNode::new(Arc::clone(&label), priority, token, factory);
    let handle = TaskHandle::new(rx, Arc::downgrade(&node), node.id(), label);
    (node, handle)
}
