use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use std::fmt;

/// An opaque ID that uniquely identifies a node relative to all other nodes
/// created during the lifetime of the process.
///
/// # Notes
///
/// - Node IDs are allocated from a single process-wide counter, so they also
///   back [`Key::fresh`](crate::key::Key::fresh).
/// - IDs are never reused.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct Id(NonZeroU64);

impl Id {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // Safety: this number is unimaginably large, even at 1 billion
        // submissions/sec it would take 584 years to wrap around.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique node ID: bitspace exhausted")
    }

    pub(crate) fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
