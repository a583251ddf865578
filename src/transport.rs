//! Transport seam for cluster-state publication.
//!
//! Connection management and request dispatch live outside this crate; the
//! publisher only needs [`Transport::send_state`]. [`LocalTransport`] routes
//! requests to in-process handlers and can inject faults.

use crate::error::{Result, SyncError};
use crate::types::{DiscoveryNode, NodeId, Version};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Action name publish requests are registered under.
pub const PUBLISH_ACTION: &str = "discovery/zen/publish";

/// A serialized cluster state on its way to one peer.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    /// Possibly compressed; the format is self-describing.
    pub payload: Arc<Vec<u8>>,
    /// Wire version the payload was encoded for.
    pub protocol_version: Version,
}

impl PublishRequest {
    pub fn new(payload: Arc<Vec<u8>>, protocol_version: Version) -> Self {
        Self {
            payload,
            protocol_version,
        }
    }
}

/// Outbound side of the transport.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send a state to `target`. Resolves once the peer applied it or failed.
    async fn send_state(&self, target: &DiscoveryNode, request: PublishRequest) -> Result<()>;
}

/// Inbound side: what a node registers to receive published states.
#[async_trait::async_trait]
pub trait PublishRequestHandler: Send + Sync {
    async fn handle(&self, request: PublishRequest) -> Result<()>;
}

/// Fault injected for a target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Sends fail immediately.
    Disconnected,
    /// Sends never complete.
    Blackhole,
    /// Sends are delayed before delivery.
    Delay(Duration),
}

/// In-process transport connecting nodes that live in the same process.
#[derive(Default)]
pub struct LocalTransport {
    handlers: RwLock<HashMap<NodeId, Arc<dyn PublishRequestHandler>>>,
    faults: RwLock<HashMap<NodeId, Fault>>,
    sent: RwLock<HashMap<NodeId, Arc<AtomicU64>>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler receiving states for `node`.
    pub fn register(&self, node: impl Into<NodeId>, handler: Arc<dyn PublishRequestHandler>) {
        self.handlers.write().insert(node.into(), handler);
    }

    pub fn unregister(&self, node: &str) {
        self.handlers.write().remove(node);
    }

    pub fn inject_fault(&self, node: impl Into<NodeId>, fault: Fault) {
        self.faults.write().insert(node.into(), fault);
    }

    pub fn clear_fault(&self, node: &str) {
        self.faults.write().remove(node);
    }

    /// Number of send attempts made to `node`.
    pub fn sent_count(&self, node: &str) -> u64 {
        self.sent
            .read()
            .get(node)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn record_send(&self, node: &str) {
        let counter = {
            let mut sent = self.sent.write();
            Arc::clone(sent.entry(node.to_string()).or_default())
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Transport for LocalTransport {
    async fn send_state(&self, target: &DiscoveryNode, request: PublishRequest) -> Result<()> {
        self.record_send(&target.id);
        trace!(node = %target, action = PUBLISH_ACTION, "sending cluster state");
        let fault = self.faults.read().get(&target.id).copied();

        match fault {
            Some(Fault::Disconnected) => {
                return Err(SyncError::NodeDisconnected(target.to_string()));
            }
            Some(Fault::Blackhole) => {
                trace!(node = %target, "dropping publish request");
                std::future::pending::<()>().await;
            }
            Some(Fault::Delay(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        let handler = self
            .handlers
            .read()
            .get(&target.id)
            .cloned()
            .ok_or_else(|| SyncError::NodeDisconnected(target.to_string()))?;

        handler.handle(request).await.map_err(|e| match e {
            SyncError::NodeDisconnected(_) | SyncError::Transport { .. } => e,
            other => SyncError::RemoteApply(other.to_string()),
        })
    }
}
