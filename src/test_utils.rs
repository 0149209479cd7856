use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Installs a fmt subscriber honoring `RUST_LOG`. Safe to call from every
/// test; only the first call wins.
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Ordered event log shared between a test and the operations it submits.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

/// The canonical scenario operation: sleep for `delay`, then record `label`.
/// Cancellation is observed at the sleep, so a cancelled operation records
/// nothing.
pub(crate) fn emit_after(
    rec: &Recorder,
    label: &str,
    delay: Duration,
) -> impl FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + use<> {
    let rec = rec.clone();
    let label = label.to_string();
    move |token| {
        Box::pin(async move {
            tokio::select! {
                () = token.cancelled() => {}
                () = tokio::time::sleep(delay) => rec.push(label),
            }
            Ok(())
        })
    }
}
