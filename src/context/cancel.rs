//! Request cancellation signal.

use std::sync::Arc;

use tokio::sync::watch;

/// A clonable, one-way cancellation flag shared between the transport and
/// everything spawned on behalf of a request.
///
/// The server cancels it when the peer stops accepting bytes and once the
/// top-level dispatch returns. Cancelling is idempotent.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Marks the token cancelled and wakes every waiter.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns `true` once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token is cancelled. Resolves immediately if it already is.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so the wait cannot fail.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
