// Shutdown Token - cancellable lifetime for queues and workers

use tokio::sync::watch;

/// Shutdown signal observed by queues and workers
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    /// Check if shutdown was requested (a dropped sender counts as shutdown)
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Wait for shutdown signal
    ///
    /// Resolves immediately if shutdown already happened.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

/// Shutdown sender
#[derive(Debug)]
pub struct ShutdownSender {
    tx: watch::Sender<bool>,
}

impl ShutdownSender {
    /// Signal shutdown to every token
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    /// Hand out another token bound to this sender
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.tx.subscribe(),
        }
    }
}

/// Create a shutdown channel
pub fn shutdown_channel() -> (ShutdownSender, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    (ShutdownSender { tx }, ShutdownToken { rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_after_shutdown() {
        let (tx, mut token) = shutdown_channel();
        assert!(!token.is_shutdown());

        let waiter = tokio::spawn(async move {
            token.wait().await;
            token.is_shutdown()
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.shutdown();

        assert!(waiter.await.unwrap());
        assert!(tx.is_shutdown());
    }

    #[tokio::test]
    async fn test_late_token_sees_shutdown() {
        let (tx, _token) = shutdown_channel();
        tx.shutdown();

        let mut late = tx.token();
        assert!(late.is_shutdown());
        // Must not hang
        tokio::time::timeout(Duration::from_secs(1), late.wait())
            .await
            .expect("wait should resolve immediately");
    }

    #[test]
    fn test_dropped_sender_counts_as_shutdown() {
        let (tx, token) = shutdown_channel();
        drop(tx);
        assert!(token.is_shutdown());
    }
}
