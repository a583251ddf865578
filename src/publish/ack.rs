//! Per-round acknowledgment tracking.

use crate::error::SyncError;
use crate::observability;
use crate::shutdown::ShutdownCoordinator;
use crate::types::{DiscoveryNode, NodeId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// What one peer answered during a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOutcome {
    Pending,
    Acked,
    Failed(String),
}

impl PeerOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, PeerOutcome::Pending)
    }
}

impl fmt::Display for PeerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerOutcome::Pending => write!(f, "pending"),
            PeerOutcome::Acked => write!(f, "acked"),
            PeerOutcome::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// How a wait for acknowledgments ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitOutcome {
    /// Every peer answered.
    Completed,
    /// The timeout elapsed first.
    TimedOut,
    /// The node is shutting down.
    Interrupted,
}

/// Observes each peer's answer as it arrives.
///
/// Called from the task that received the answer, possibly after the
/// publishing call has returned.
pub trait AckListener: Send + Sync {
    fn on_node_ack(&self, node: &DiscoveryNode, failure: Option<&SyncError>);
}

/// Counts outstanding answers for one publication round.
pub struct AckTracker {
    version: u64,
    peers: Mutex<BTreeMap<NodeId, PeerOutcome>>,
    remaining: watch::Sender<usize>,
    listener: Option<Arc<dyn AckListener>>,
}

impl AckTracker {
    /// Track `peers`; the caller excludes the local node.
    pub fn new<'a>(
        version: u64,
        peers: impl IntoIterator<Item = &'a DiscoveryNode>,
        listener: Option<Arc<dyn AckListener>>,
    ) -> Self {
        let peers: BTreeMap<NodeId, PeerOutcome> = peers
            .into_iter()
            .map(|n| (n.id.clone(), PeerOutcome::Pending))
            .collect();
        let (remaining, _) = watch::channel(peers.len());
        Self {
            version,
            peers: Mutex::new(peers),
            remaining,
            listener,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn expected(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn remaining(&self) -> usize {
        *self.remaining.borrow()
    }

    pub fn on_response(&self, node: &DiscoveryNode) {
        if self.record(node, PeerOutcome::Acked) {
            observability::record_publish_ack(true);
            if let Some(listener) = &self.listener {
                listener.on_node_ack(node, None);
            }
        }
    }

    pub fn on_failure(&self, node: &DiscoveryNode, cause: &SyncError) {
        if self.record(node, PeerOutcome::Failed(cause.to_string())) {
            debug!(node = %node, version = self.version, error = %cause, "Failed to send cluster state");
            observability::record_publish_ack(false);
            if let Some(listener) = &self.listener {
                listener.on_node_ack(node, Some(cause));
            }
        }
    }

    /// Returns whether the report counted.
    fn record(&self, node: &DiscoveryNode, outcome: PeerOutcome) -> bool {
        let mut peers = self.peers.lock();
        match peers.get_mut(&node.id) {
            Some(slot) if slot.is_pending() => {
                *slot = outcome;
                self.remaining.send_modify(|r| *r = r.saturating_sub(1));
                true
            }
            Some(previous) => {
                warn!(
                    node = %node,
                    version = self.version,
                    previous = %previous,
                    reported = %outcome,
                    "Ignoring duplicate publish response"
                );
                false
            }
            None => {
                warn!(node = %node, version = self.version, "Ignoring response from untracked node");
                false
            }
        }
    }

    /// Wait until every peer answered, `timeout` elapses, or shutdown starts.
    pub async fn await_all_nodes(
        &self,
        timeout: Duration,
        shutdown: &ShutdownCoordinator,
    ) -> AwaitOutcome {
        let mut rx = self.remaining.subscribe();
        tokio::select! {
            biased;
            _ = rx.wait_for(|r| *r == 0) => AwaitOutcome::Completed,
            _ = shutdown.wait_for_shutdown() => AwaitOutcome::Interrupted,
            _ = tokio::time::sleep(timeout) => AwaitOutcome::TimedOut,
        }
    }

    pub fn outcomes(&self) -> BTreeMap<NodeId, PeerOutcome> {
        self.peers.lock().clone()
    }

    pub fn pending_nodes(&self) -> Vec<NodeId> {
        self.peers
            .lock()
            .iter()
            .filter(|(_, o)| o.is_pending())
            .map(|(id, _)| id.clone())
            .collect()
    }
}
