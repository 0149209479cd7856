//! The three coordinators.
//!
//! Every submission flows through exactly one of:
//!
//! - [`KeyedTaskManager`] — independent logical queues partitioned by
//!   [`Key`](crate::key::Key), with drop-current / wait-in-current semantics
//!   and an external run/pause gate.
//! - [`SerialTaskQueue`] — a single FIFO stream.
//! - [`StackScheduler`] — LIFO with a ceiling on concurrently executing
//!   tasks; fresh work is preferred over older waiting work.

mod keyed;
mod serial;
mod stack;

pub use keyed::KeyedTaskManager;
pub use serial::SerialTaskQueue;
pub use stack::{Counts, StackScheduler};

/// Relative urgency hint attached to a submission.
///
/// Forwarded to the runtime as a hint only: no coordinator derives ordering
/// from it. It is recorded on the node and shows up in tracing output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Below-normal urgency.
    Low,
    /// The default.
    #[default]
    Normal,
    /// Above-normal urgency.
    High,
}

/// How a keyed submission interacts with work already queued under its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubmitMode {
    /// Invalidate everything currently chained under the key, head and queued
    /// successors alike, and take its place. Each new intent supersedes every
    /// in-flight and pending intent for the same key.
    DropCurrent,
    /// Append behind the chain's endpoint and run once every predecessor has
    /// reached a terminal state.
    WaitInCurrent,
}
