use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

/// Process-wide shutdown handle. Cloning shares the same signal.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);

        Self { tx: Arc::new(tx) }
    }

    /// Signals shutdown. Later calls are no-ops.
    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Waits for SIGINT or SIGTERM (ctrl-c elsewhere), then triggers shutdown.
    pub async fn listen_for_os_signals(&self) {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                    (Err(e), _) | (_, Err(e)) => {
                        error!("Failed to register signal handlers: {}", e);

                        return;
                    }
                };

            tokio::select! {
                _ = sigterm.recv() => info!(signal = "SIGTERM", "Received shutdown signal"),
                _ = sigint.recv() => info!(signal = "SIGINT", "Received shutdown signal"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl-c: {}", e);

                return;
            }

            info!(signal = "ctrl-c", "Received shutdown signal");
        }

        self.trigger();
    }
}

#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been triggered. Cancel-safe.
    pub async fn cancelled(&mut self) {
        // A dropped handle counts as shutdown
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_reaches_every_subscriber() {
        let shutdown = Shutdown::new();
        let mut first = shutdown.subscribe();
        let mut second = shutdown.clone().subscribe();

        assert!(!first.is_triggered());

        shutdown.trigger();
        shutdown.trigger();

        first.cancelled().await;
        second.cancelled().await;
        assert!(shutdown.is_triggered());

        // Subscribing late still observes it
        let mut late = shutdown.subscribe();
        assert!(late.is_triggered());
        late.cancelled().await;
    }
}
