//! Coordinators for fire-and-forget async work.
//!
//! Lariat routes each submitted operation through one of three coordinators
//! that impose well-defined ordering, concurrency, and cancellation
//! semantics on top of the tokio runtime:
//!
//! - [`KeyedTaskManager`] partitions work by [`Key`] into independent
//!   queues, each with drop-current or wait-in-current semantics and an
//!   external run/pause gate.
//! - [`SerialTaskQueue`] serializes work within one logical FIFO stream.
//! - [`StackScheduler`] runs the newest submissions first, under a ceiling
//!   of concurrently executing tasks.
//!
//! Every submission synchronously returns a [`TaskHandle`] that resolves
//! exactly once: with the operation's value, with the operation's error, or
//! with [`TaskError::Cancelled`]. Operations receive a
//! [`CancellationToken`](tokio_util::sync::CancellationToken) and are
//! expected to observe it at their await points.

pub mod bridge;
pub mod error;
pub mod key;
pub mod manager;

mod id;
mod node;

pub use bridge::TaskHandle;
pub use error::{TaskError, TaskResult};
pub use id::Id;
pub use key::{Key, KeyAtom};
pub use manager::{
    Counts, KeyedTaskManager, Priority, SerialTaskQueue, StackScheduler, SubmitMode,
};

#[cfg(test)]
pub(crate) mod test_utils;
