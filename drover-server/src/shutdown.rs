//! Cancellation plumbing for control loops.
//!
//! A loop's owner holds a [`ShutdownSender`]; the loop selects on its
//! [`ShutdownReceiver`]. Dropping the sender cancels every receiver: in-flight
//! RPCs complete or time out, the next select observes the closure, and the
//! loop exits.

use tokio::sync::watch;

/// Create a linked shutdown pair.
pub fn channel() -> (ShutdownSender, ShutdownReceiver) {
    let (tx, rx) = watch::channel(());
    (ShutdownSender { _tx: tx }, ShutdownReceiver { rx })
}

/// Cancels all linked receivers when dropped.
pub struct ShutdownSender {
    _tx: watch::Sender<()>,
}

/// Held by a control loop; resolves once the sender is gone.
#[derive(Clone)]
pub struct ShutdownReceiver {
    rx: watch::Receiver<()>,
}

impl ShutdownReceiver {
    /// Wait until shutdown is signalled. Cancel-safe.
    pub async fn recv(&mut self) {
        while self.rx.changed().await.is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn dropping_the_sender_releases_receivers() {
        let (tx, mut rx) = channel();
        let mut rx2 = rx.clone();
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), rx2.recv())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn receiver_blocks_while_sender_lives() {
        let (tx, mut rx) = channel();
        let blocked = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(blocked.is_err());
        drop(tx);
    }
}
