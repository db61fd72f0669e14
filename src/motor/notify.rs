//! Operation completion handoff.

use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

/// Bounded single-slot channel carrying one outcome per operation.
///
/// The watchdog is the only producer. Consumers either await [`wait`] for
/// synchronous-style command wrappers, or ignore it and follow the broadcast
/// events instead. A stale outcome left by a caller that never waited is
/// discarded by [`drain`] before the next operation starts.
///
/// [`wait`]: CompletionChannel::wait
/// [`drain`]: CompletionChannel::drain
#[derive(Debug)]
pub struct CompletionChannel {
    tx: mpsc::Sender<bool>,
    rx: Mutex<mpsc::Receiver<bool>>,
}

impl CompletionChannel {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Discard any unconsumed outcome from a previous operation.
    pub async fn drain(&self) {
        let mut rx = self.rx.lock().await;
        while let Ok(stale) = rx.try_recv() {
            warn!(stale, "discarding unconsumed operation outcome");
        }
    }

    /// Deliver an outcome. The channel is drained before every operation, so
    /// a full slot here means the protocol was violated upstream.
    pub fn push(&self, success: bool) {
        if self.tx.try_send(success).is_err() {
            error!(success, "completion channel full, outcome dropped");
        }
    }

    /// Await the next outcome. Returns `None` only if the channel is closed,
    /// which cannot happen while the axis owns both ends.
    pub async fn wait(&self) -> Option<bool> {
        self.rx.lock().await.recv().await
    }
}

impl Default for CompletionChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_then_wait() {
        let channel = CompletionChannel::new();
        channel.push(true);
        assert_eq!(channel.wait().await, Some(true));
    }

    #[tokio::test]
    async fn test_drain_discards_stale_outcome() {
        let channel = CompletionChannel::new();
        channel.push(false);
        channel.drain().await;
        channel.push(true);
        assert_eq!(channel.wait().await, Some(true));
    }

    #[tokio::test]
    async fn test_push_into_full_slot_keeps_first() {
        let channel = CompletionChannel::new();
        channel.push(true);
        channel.push(false);
        assert_eq!(channel.wait().await, Some(true));
    }
}
