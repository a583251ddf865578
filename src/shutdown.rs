//! Node shutdown signalling.
//!
//! A [`ShutdownCoordinator`] is shared by every component of a node. Closing
//! the node flips it once; publication waits return `Interrupted` and
//! background tasks stop.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Shutdown signal shared by a node's components.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Check if shutdown is in progress.
    pub fn is_shutting_down(&self) -> bool {
        *self.rx.borrow()
    }

    /// Initiate shutdown. Later calls are no-ops.
    pub fn shutdown(&self) {
        let changed = self.tx.send_if_modified(|flag| {
            if *flag {
                false
            } else {
                *flag = true;
                true
            }
        });
        if changed {
            info!("Initiating shutdown");
        }
    }

    /// Resolve once shutdown has been initiated (for use in `select!`).
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any coordinator clone, including self.
        let _ = rx.wait_for(|flag| *flag).await;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
