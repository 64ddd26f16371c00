//! Endpoint handlers, one module per resource.

pub mod extract;
pub mod health;
pub mod materials;

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Per-request cancellation: fires after `timeout`, or when the handler
/// future is dropped (client disconnected).
///
/// Cancelling never skips cleanup: strategies observe the token and release
/// their staged objects before returning `Cancelled`.
pub(crate) struct RequestDeadline {
    cancel: CancellationToken,
    timer: JoinHandle<()>,
}

impl RequestDeadline {
    pub(crate) fn start(timeout: Duration) -> Self {
        let cancel = CancellationToken::new();
        let timer = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                tracing::warn!(timeout_secs = timeout.as_secs(), "Extraction deadline reached");
                cancel.cancel();
            })
        };
        Self { cancel, timer }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for RequestDeadline {
    fn drop(&mut self) {
        self.timer.abort();
        self.cancel.cancel();
    }
}
