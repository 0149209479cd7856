use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::bridge::TaskHandle;
use crate::key::Key;
use crate::manager::{Priority, SubmitMode};
use crate::node::{TaskNode, new_task};

/// Partitions submitted work by [`Key`] into independent chains.
///
/// Submissions under equal keys share one logical queue; submissions under
/// distinct keys run independently. Per submission the caller picks a
/// [`SubmitMode`]: `DropCurrent` supersedes everything queued under the key,
/// `WaitInCurrent` lines up behind it.
///
/// The manager carries a process-wide run/pause gate: while paused, freshly
/// submitted heads wait; flipping the gate back on re-activates every key's
/// head.
///
/// Cloning is cheap and every clone drives the same state.
///
/// # Example
///
/// ```no_run
/// use lariat::{Key, KeyedTaskManager, Priority, SubmitMode};
///
/// # async fn doc() {
/// let manager = KeyedTaskManager::new();
/// let handle = manager.submit(
///     "refresh",
///     Key::from("profile"),
///     SubmitMode::DropCurrent,
///     Priority::Normal,
///     |_token| async { anyhow::Ok(42) },
/// );
/// assert_eq!(handle.await.unwrap(), 42);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct KeyedTaskManager {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<ManagerState>,
}

struct ManagerState {
    chains: HashMap<Key, Arc<TaskNode>>,
    running: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: Mutex::new(ManagerState {
                chains: HashMap::new(),
                running: true,
            }),
        }
    }
}

impl KeyedTaskManager {
    /// Creates a manager in the running state with no chains.
    pub fn new() -> Self {
        Self::default()
    }

    /// Submits an operation under `key`.
    ///
    /// Returns synchronously with a [`TaskHandle`] that resolves with the
    /// operation's value, the operation's error, or
    /// [`TaskError::Cancelled`](crate::error::TaskError::Cancelled) if the
    /// submission is superseded, cancelled, or the operation observes its
    /// token cancelled.
    ///
    /// The operation receives a [`CancellationToken`] and is expected to
    /// observe it at its await points.
    pub fn submit<R, F, Fut>(
        &self,
        label: impl Into<String>,
        key: Key,
        mode: SubmitMode,
        priority: Priority,
        op: F,
    ) -> TaskHandle<R>
    where
        R: Send + 'static,
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let loop_key = key.clone();
        let (node, handle) = new_task(label.into(), priority, op, move |completed| {
            inner.advance(&loop_key, completed);
        });

        debug!(node = %node.id(), label = %node.label(), ?key, ?mode, "submit");

        let (activate, dropped) = {
            let mut state = self.inner.state.lock();
            match mode {
                SubmitMode::DropCurrent => {
                    let mut dropped = SmallVec::<[Arc<TaskNode>; 4]>::new();
                    if let Some(old_head) = state.chains.insert(key.clone(), Arc::clone(&node)) {
                        old_head.for_each(|stale| dropped.push(Arc::clone(stale)));
                    }
                    (state.running, dropped)
                }
                SubmitMode::WaitInCurrent => match state.chains.entry(key.clone()) {
                    Entry::Occupied(entry) => {
                        entry.get().endpoint().add_next(Arc::clone(&node));
                        (false, SmallVec::new())
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(Arc::clone(&node));
                        (state.running, SmallVec::new())
                    }
                },
            }
        };

        for stale in dropped {
            stale.invalidate();
        }
        if activate && !node.activate() && !node.is_activated() {
            // Cancelled between insertion and activation; advance past it.
            self.inner.advance(&key, &node);
        }
        handle
    }

    /// Whether the process-wide gate is open.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Whether `key` currently has a chain.
    pub fn is_running_for(&self, key: &Key) -> bool {
        self.inner.state.lock().chains.contains_key(key)
    }

    /// Number of keys with live chains.
    pub fn len(&self) -> usize {
        self.inner.state.lock().chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().chains.is_empty()
    }

    /// Opens or closes the process-wide gate.
    ///
    /// Closing prevents activation of not-yet-activated nodes; work already
    /// in flight is unaffected. The `false → true` transition resumes: every
    /// key's head is (re-)activated. Setting the current value again is a
    /// no-op.
    pub fn set_running(&self, running: bool) {
        let to_activate: SmallVec<[(Key, Arc<TaskNode>); 4]> = {
            let mut state = self.inner.state.lock();
            if state.running == running {
                return;
            }
            state.running = running;
            if !running {
                debug!("paused");
                return;
            }
            debug!("resumed");

            let keys: Vec<Key> = state.chains.keys().cloned().collect();
            let mut out = SmallVec::new();
            for key in keys {
                let head = state.chains.get(&key).cloned();
                if let Some(live) = Inner::install_live_head(&mut state, &key, head) {
                    out.push((key, live));
                }
            }
            out
        };

        for (key, node) in to_activate {
            if !node.activate() && !node.is_activated() {
                self.inner.advance(&key, &node);
            }
        }
    }

    /// Invalidates every node chained under `key` and forgets the key.
    ///
    /// Safe to call at any moment, including concurrently with in-flight
    /// submissions and completions; cancelling a key with no chain is a
    /// no-op.
    pub fn cancel(&self, key: &Key) {
        let chain = self.inner.state.lock().chains.remove(key);
        if let Some(head) = chain {
            debug!(?key, "cancel");
            head.for_each(|node| node.invalidate());
        }
    }

    /// Invalidates every node in every chain and clears the mapping.
    /// Idempotent.
    pub fn cancel_all(&self) {
        let chains: Vec<Arc<TaskNode>> = {
            let mut state = self.inner.state.lock();
            state.chains.drain().map(|(_, head)| head).collect()
        };
        if chains.is_empty() {
            return;
        }
        debug!(keys = chains.len(), "cancel_all");
        for head in chains {
            head.for_each(|node| node.invalidate());
        }
    }
}

impl Inner {
    /// Completion loopback. Runs in the spawned task after its node turned
    /// terminal.
    ///
    /// Tolerant by design: a missing head means a concurrent `cancel` already
    /// tore the chain down, and a head that is not the completed node means a
    /// newer drop-current head took over; both are no-ops, the surviving head
    /// carries its own lifecycle.
    fn advance(&self, key: &Key, completed: &Arc<TaskNode>) {
        let mut completed = Arc::clone(completed);
        loop {
            let promoted = {
                let mut state = self.state.lock();
                let Some(head) = state.chains.get(key) else {
                    return;
                };
                if !Arc::ptr_eq(head, &completed) {
                    return;
                }
                let promoted = Self::install_live_head(&mut state, key, completed.next());
                if state.running { promoted } else { None }
            };

            let Some(node) = promoted else { return };
            trace!(node = %node.id(), ?key, "promoted");
            if node.activate() || node.is_activated() {
                return;
            }
            // The promoted node was cancelled before it ever ran, so no
            // completion will come from it; keep walking the chain.
            completed = node;
        }
    }

    /// Installs the first non-terminal node of `chain` as the key's head and
    /// returns it; clears the key when the whole chain is spent.
    fn install_live_head(
        state: &mut ManagerState,
        key: &Key,
        mut chain: Option<Arc<TaskNode>>,
    ) -> Option<Arc<TaskNode>> {
        while let Some(node) = chain {
            if node.is_terminal() {
                chain = node.next();
            } else {
                state.chains.insert(key.clone(), Arc::clone(&node));
                return Some(node);
            }
        }
        state.chains.remove(key);
        None
    }
}

// Skip the chains themselves to avoid printing whole node trees.
impl fmt::Debug for KeyedTaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("KeyedTaskManager")
            .field("keys", &state.chains.len())
            .field("running", &state.running)
            .finish()
    }
}
