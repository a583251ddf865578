//! One cluster member with its publication and persistence components wired up.

use crate::applier::{ClusterStateApplier, ClusterStateListener};
use crate::config::StateSyncConfig;
use crate::error::{Result, SyncError};
use crate::gateway::{
    DanglingIndicesAllocator, GatewayMetaState, IndexDeletionNotifier, NodeEnvironment,
};
use crate::observability;
use crate::publish::{AckListener, PublishHandler, PublishOutcome, Publisher};
use crate::shutdown::ShutdownCoordinator;
use crate::state::ClusterState;
use crate::transport::{PublishRequestHandler, Transport};
use crate::types::DiscoveryNode;
use std::sync::Arc;
use tracing::info;

/// Collaborators a node hands work to.
pub struct NodeCollaborators {
    pub transport: Arc<dyn Transport>,
    pub allocator: Arc<dyn DanglingIndicesAllocator>,
    pub deletion_notifier: Arc<dyn IndexDeletionNotifier>,
}

/// A running node.
pub struct ClusterNode {
    local: DiscoveryNode,
    gateway: Option<Arc<GatewayMetaState>>,
    applier: ClusterStateApplier,
    publisher: Publisher,
    handler: Arc<PublishHandler>,
    shutdown: ShutdownCoordinator,
}

impl ClusterNode {
    /// Open local state and start the node's applier.
    ///
    /// Fails when local state is unusable; such errors are fatal.
    pub async fn start(config: StateSyncConfig, collaborators: NodeCollaborators) -> Result<Self> {
        config.validate()?;
        observability::register_metrics();
        let node = &config.node;
        let local = DiscoveryNode::new(node.id.clone(), node.address.clone(), node.version, node.roles)
            .with_name(node.name.clone());
        let shutdown = ShutdownCoordinator::new();

        let gateway = if node.roles.persists_state() {
            let env = Arc::new(NodeEnvironment::open(&node.data_paths)?);
            let gateway_config = config.gateway.clone();
            let legacy = config.legacy.clone();
            let node_id = node.id.clone();
            let roles = node.roles;
            let allocator = Arc::clone(&collaborators.allocator);
            let notifier = Arc::clone(&collaborators.deletion_notifier);
            let gateway = tokio::task::spawn_blocking(move || {
                GatewayMetaState::open(node_id, roles, env, &gateway_config, &legacy, allocator, notifier)
            })
            .await
            .map_err(|e| SyncError::Internal(format!("gateway startup task failed: {}", e)))??;
            Some(Arc::new(gateway))
        } else {
            None
        };

        let listeners: Vec<Arc<dyn ClusterStateListener>> = gateway
            .iter()
            .map(|g| Arc::clone(g) as Arc<dyn ClusterStateListener>)
            .collect();
        let applier = ClusterStateApplier::start(listeners, shutdown.clone());
        let handler = Arc::new(PublishHandler::new(local.id.clone(), applier.clone()));
        let publisher = Publisher::new(collaborators.transport, config.publish.clone(), shutdown.clone())
            .with_local_applier(applier.clone());

        info!(node = %local, roles = ?local.roles, "Node started");
        Ok(Self {
            local,
            gateway,
            applier,
            publisher,
            handler,
            shutdown,
        })
    }

    pub fn local_node(&self) -> &DiscoveryNode {
        &self.local
    }

    /// Handler to register with the transport for incoming states.
    pub fn publish_handler(&self) -> Arc<dyn PublishRequestHandler> {
        Arc::clone(&self.handler) as Arc<dyn PublishRequestHandler>
    }

    pub fn gateway(&self) -> Option<&Arc<GatewayMetaState>> {
        self.gateway.as_ref()
    }

    /// Publish `state` to the cluster and apply it locally.
    pub async fn publish(
        &self,
        state: Arc<ClusterState>,
        ack_listener: Option<Arc<dyn AckListener>>,
    ) -> PublishOutcome {
        self.publisher.publish(state, ack_listener).await
    }

    pub async fn applied_state(&self) -> Result<Option<Arc<ClusterState>>> {
        self.applier.current_state().await
    }

    /// Stop background work. Pending publication waits return `Interrupted`.
    pub async fn close(&self) {
        self.shutdown.shutdown();
        self.applier.shutdown().await;
        if let Some(gateway) = &self.gateway {
            gateway.dangling_indices().clear();
        }
        info!(node = %self.local, "Node closed");
    }
}
