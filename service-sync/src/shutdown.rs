//! Cooperative shutdown signalling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Sends the stop notification to every subscribed task.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl Shutdown {
    /// Create a new, untriggered shutdown source.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Notify all subscribers. Later calls are no-ops.
    pub fn trigger(&self) {
        if !self.triggered.swap(true, Ordering::SeqCst) {
            tracing::info!("Shutdown requested");
            let _ = self.tx.send(());
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// A receiver for the stop notification.
    ///
    /// Subscribing after [`Shutdown::trigger`] still observes the shutdown.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
            triggered: Arc::clone(&self.triggered),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of [`Shutdown`].
#[derive(Debug)]
pub struct ShutdownSignal {
    rx: broadcast::Receiver<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown is requested.
    ///
    /// Also resolves if every [`Shutdown`] handle was dropped.
    pub async fn recv(&mut self) {
        if self.triggered.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.rx.recv().await;
    }
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.resubscribe(),
            triggered: Arc::clone(&self.triggered),
        }
    }
}

/// Wait for SIGTERM or SIGINT.
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = terminate.recv() => tracing::info!("Received SIGTERM"),
            _ = interrupt.recv() => tracing::info!("Received SIGINT"),
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn subscriber_sees_trigger() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.subscribe();

        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), signal.recv())
            .await
            .expect("signal delivered");
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn late_subscriber_sees_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let mut signal = shutdown.subscribe();
        tokio::time::timeout(Duration::from_secs(1), signal.recv())
            .await
            .expect("signal delivered");
    }

    #[tokio::test]
    async fn cloned_signal_sees_trigger() {
        let shutdown = Shutdown::new();
        let signal = shutdown.subscribe();
        let mut cloned = signal.clone();

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), cloned.recv())
            .await
            .expect("signal delivered");
    }

    #[tokio::test]
    async fn untriggered_signal_stays_pending() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.subscribe();

        let waited = tokio::time::timeout(Duration::from_millis(50), signal.recv()).await;
        assert!(waited.is_err());
    }
}
