//! Cluster-state publication.
//!
//! The coordinating node hands every new [`ClusterState`] to a [`Publisher`],
//! which serializes it once per distinct peer wire version, sends it to every
//! peer concurrently, and waits (bounded) for their answers. Peers receive
//! states through a [`PublishHandler`].
//!
//! The wait is advisory: a round that times out still returns normally, and
//! sends that are still in flight keep reporting into the round's
//! [`AckTracker`] and [`AckListener`].

mod ack;
mod handler;

pub use ack::{AckListener, AckTracker, AwaitOutcome, PeerOutcome};
pub use handler::PublishHandler;

use crate::applier::{ApplyOutcome, ClusterStateApplier};
use crate::codec::encode_state;
use crate::config::PublishConfig;
use crate::error::{Result, SyncError};
use crate::observability;
use crate::shutdown::ShutdownCoordinator;
use crate::state::ClusterState;
use crate::transport::{PublishRequest, Transport};
use crate::types::{NodeId, Version};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Source label for states adopted by the publishing node itself.
const LOCAL_APPLY_SOURCE: &str = "publish(local)";

/// Result of one publication round.
#[derive(Debug)]
pub struct PublishOutcome {
    pub version: u64,
    /// `None` when waiting was disabled.
    pub completion: Option<AwaitOutcome>,
    /// Peer answers as of the moment the wait ended.
    pub peers: BTreeMap<NodeId, PeerOutcome>,
    /// Local adoption result, when a local applier is attached.
    pub local: Option<Result<ApplyOutcome>>,
}

impl PublishOutcome {
    pub fn acked(&self) -> impl Iterator<Item = &NodeId> {
        self.peers
            .iter()
            .filter(|(_, o)| matches!(o, PeerOutcome::Acked))
            .map(|(id, _)| id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &NodeId> {
        self.peers
            .iter()
            .filter(|(_, o)| o.is_pending())
            .map(|(id, _)| id)
    }

    pub fn failed(&self) -> impl Iterator<Item = (&NodeId, &str)> {
        self.peers.iter().filter_map(|(id, o)| match o {
            PeerOutcome::Failed(reason) => Some((id, reason.as_str())),
            _ => None,
        })
    }
}

/// Publishes cluster states from the coordinating node.
pub struct Publisher {
    transport: Arc<dyn Transport>,
    config: PublishConfig,
    shutdown: ShutdownCoordinator,
    local_applier: Option<ClusterStateApplier>,
}

impl Publisher {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: PublishConfig,
        shutdown: ShutdownCoordinator,
    ) -> Self {
        Self {
            transport,
            config,
            shutdown,
            local_applier: None,
        }
    }

    /// Also adopt published states on this node once peers have been contacted.
    pub fn with_local_applier(mut self, applier: ClusterStateApplier) -> Self {
        self.local_applier = Some(applier);
        self
    }

    /// Run one publication round for `state`.
    pub async fn publish(
        &self,
        state: Arc<ClusterState>,
        ack_listener: Option<Arc<dyn AckListener>>,
    ) -> PublishOutcome {
        observability::record_publish_round();
        let peers: Vec<_> = state.nodes.peers().cloned().collect();
        let tracker = Arc::new(AckTracker::new(state.version, &peers, ack_listener));

        // Serialization failures are cached so other peers on that version fail fast.
        let mut payloads: HashMap<Version, std::result::Result<Arc<Vec<u8>>, String>> =
            HashMap::new();

        for node in peers {
            let payload = payloads
                .entry(node.version)
                .or_insert_with(|| match encode_state(&state, node.version) {
                    Ok(bytes) => Ok(Arc::new(bytes)),
                    Err(e) => {
                        warn!(
                            version = state.version,
                            wire_version = %node.version,
                            error = %e,
                            "Failed to serialize cluster state"
                        );
                        Err(e.to_string())
                    }
                })
                .clone();

            let payload = match payload {
                Ok(payload) => payload,
                Err(reason) => {
                    tracker.on_failure(&node, &SyncError::Serialization(reason));
                    continue;
                }
            };

            let request = PublishRequest::new(payload, node.version);
            let transport = Arc::clone(&self.transport);
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                match transport.send_state(&node, request).await {
                    Ok(()) => tracker.on_response(&node),
                    Err(e) => tracker.on_failure(&node, &e),
                }
            });
        }

        let completion = if self.config.timeout.is_zero() {
            None
        } else {
            let outcome = tracker
                .await_all_nodes(self.config.timeout, &self.shutdown)
                .await;
            match outcome {
                AwaitOutcome::TimedOut => {
                    observability::record_publish_timeout();
                    warn!(
                        version = state.version,
                        timeout = ?self.config.timeout,
                        pending = ?tracker.pending_nodes(),
                        "Timed out waiting for all nodes to process published state"
                    );
                }
                AwaitOutcome::Interrupted => {
                    info!(version = state.version, "Interrupted while waiting for publish acks");
                }
                AwaitOutcome::Completed => {
                    debug!(version = state.version, peers = tracker.expected(), "All nodes answered");
                }
            }
            Some(outcome)
        };

        let local = match &self.local_applier {
            Some(applier) => {
                let result = applier.apply(LOCAL_APPLY_SOURCE, Arc::clone(&state)).await;
                if let Err(e) = &result {
                    warn!(version = state.version, error = %e, "Failed to apply published state locally");
                }
                Some(result)
            }
            None => None,
        };

        PublishOutcome {
            version: state.version,
            completion,
            peers: tracker.outcomes(),
            local,
        }
    }
}
