//! Supervised background tasks

use crate::Result;
use std::future::Future;
use tokio::task::AbortHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

/// Spawn `fut` under `tracker`.
///
/// The task runs inside its own recovery boundary: an error or panic is
/// logged and never reaches whoever spawned it. The returned handle aborts
/// the task.
pub fn spawn_supervised<F>(tracker: &TaskTracker, name: &'static str, fut: F) -> AbortHandle
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let inner = tokio::spawn(fut);
    let abort = inner.abort_handle();

    tracker.spawn(async move {
        match inner.await {
            Ok(Ok(())) => debug!(task = name, "Background task finished"),
            Ok(Err(e)) => warn!(task = name, error = %e, "Background task failed"),
            Err(e) if e.is_cancelled() => debug!(task = name, "Background task aborted"),
            Err(e) => error!(task = name, "Background task panicked: {}", e),
        }
    });

    abort
}
