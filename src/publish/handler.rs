//! Receiving side of publication.

use crate::applier::ClusterStateApplier;
use crate::codec::decode_state;
use crate::compression::compressor_for;
use crate::error::Result;
use crate::transport::{PublishRequest, PublishRequestHandler};
use crate::types::NodeId;
use std::sync::Arc;
use tracing::{debug, trace};

const RECEIVE_SOURCE: &str = "receive(from master)";

/// Decodes published states and hands them to the node's applier.
pub struct PublishHandler {
    local_node_id: NodeId,
    applier: ClusterStateApplier,
}

impl PublishHandler {
    pub fn new(local_node_id: impl Into<NodeId>, applier: ClusterStateApplier) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            applier,
        }
    }
}

#[async_trait::async_trait]
impl PublishRequestHandler for PublishHandler {
    async fn handle(&self, request: PublishRequest) -> Result<()> {
        if let Some(compressor) = compressor_for(&request.payload) {
            trace!(algorithm = %compressor.algorithm(), "Received compressed cluster state");
        }
        let state = decode_state(
            &request.payload,
            request.protocol_version,
            Some(self.local_node_id.clone()),
        )?;
        debug!(
            version = state.version,
            master = ?state.nodes.master_id(),
            "Received cluster state"
        );

        self.applier.apply(RECEIVE_SOURCE, Arc::new(state)).await?;
        Ok(())
    }
}
