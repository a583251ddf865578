//! Wire encoding of cluster states.
//!
//! Encoding is version aware: the layout is chosen by the wire version the
//! receiving peer declared, so one state is serialized once per distinct
//! peer version. Peers older than [`Version::V_1_4_0`] do not understand
//! cluster blocks and receive states without them.

use crate::compression::{decompress_if_needed, default_compressor};
use crate::error::{Result, SyncError};
use crate::state::{ClusterBlocks, ClusterState, MetaData};
use crate::types::{DiscoveryNode, DiscoveryNodes, NodeId, NodeRoles, Version};
use serde::{Deserialize, Serialize};

/// Types that can be written to and read from the wire at a given version.
pub trait Encodable: Sized {
    fn write_to(&self, version: Version) -> Result<Vec<u8>>;

    fn read_from(bytes: &[u8], version: Version) -> Result<Self>;
}

#[derive(Debug, Serialize, Deserialize)]
struct WireNode {
    id: NodeId,
    name: String,
    address: String,
    version: Version,
    master: bool,
    data: bool,
}

impl From<&DiscoveryNode> for WireNode {
    fn from(node: &DiscoveryNode) -> Self {
        Self {
            id: node.id.clone(),
            name: node.name.clone(),
            address: node.address.clone(),
            version: node.version,
            master: node.roles.master,
            data: node.roles.data,
        }
    }
}

impl From<WireNode> for DiscoveryNode {
    fn from(node: WireNode) -> Self {
        DiscoveryNode {
            id: node.id,
            name: node.name,
            address: node.address,
            version: node.version,
            roles: NodeRoles {
                master: node.master,
                data: node.data,
            },
        }
    }
}

/// Layout spoken by peers on or after 1.4.0.
#[derive(Debug, Serialize, Deserialize)]
struct WireClusterState {
    // Leading string length keeps plain payloads distinct from compressed ones.
    cluster_name: String,
    version: u64,
    state_uuid: String,
    master_node_id: Option<NodeId>,
    nodes: Vec<WireNode>,
    metadata: MetaData,
    blocks: ClusterBlocks,
}

/// Layout spoken by 1.x peers before 1.4.0.
#[derive(Debug, Serialize, Deserialize)]
struct WireClusterStateV1 {
    cluster_name: String,
    version: u64,
    state_uuid: String,
    master_node_id: Option<NodeId>,
    nodes: Vec<WireNode>,
    metadata: MetaData,
}

fn ensure_compatible(version: Version) -> Result<()> {
    if version.is_wire_compatible() {
        Ok(())
    } else {
        Err(SyncError::IncompatibleVersion {
            requested: version,
            minimum: Version::MINIMUM_WIRE_COMPATIBLE,
        })
    }
}

fn nodes_from_wire(nodes: Vec<WireNode>, master: Option<NodeId>) -> DiscoveryNodes {
    let mut out = nodes
        .into_iter()
        .fold(DiscoveryNodes::new(), |acc, n| acc.add(n.into()));
    if let Some(master) = master {
        out = out.master_node_id(master);
    }
    out
}

impl Encodable for ClusterState {
    fn write_to(&self, version: Version) -> Result<Vec<u8>> {
        ensure_compatible(version)?;
        let nodes: Vec<WireNode> = self.nodes.iter().map(WireNode::from).collect();
        let master_node_id = self.nodes.master_id().cloned();

        if version.before(Version::V_1_4_0) {
            let wire = WireClusterStateV1 {
                cluster_name: self.cluster_name.clone(),
                version: self.version,
                state_uuid: self.state_uuid.clone(),
                master_node_id,
                nodes,
                metadata: self.metadata.clone(),
            };
            Ok(bincode::serialize(&wire)?)
        } else {
            let wire = WireClusterState {
                cluster_name: self.cluster_name.clone(),
                version: self.version,
                state_uuid: self.state_uuid.clone(),
                master_node_id,
                nodes,
                metadata: self.metadata.clone(),
                blocks: self.blocks.clone(),
            };
            Ok(bincode::serialize(&wire)?)
        }
    }

    fn read_from(bytes: &[u8], version: Version) -> Result<Self> {
        ensure_compatible(version)?;
        let decode_err = |e: bincode::Error| SyncError::Deserialization(e.to_string());

        if version.before(Version::V_1_4_0) {
            let wire: WireClusterStateV1 = bincode::deserialize(bytes).map_err(decode_err)?;
            Ok(ClusterState {
                version: wire.version,
                state_uuid: wire.state_uuid,
                cluster_name: wire.cluster_name,
                nodes: nodes_from_wire(wire.nodes, wire.master_node_id),
                metadata: wire.metadata,
                blocks: ClusterBlocks::new(),
            })
        } else {
            let wire: WireClusterState = bincode::deserialize(bytes).map_err(decode_err)?;
            Ok(ClusterState {
                version: wire.version,
                state_uuid: wire.state_uuid,
                cluster_name: wire.cluster_name,
                nodes: nodes_from_wire(wire.nodes, wire.master_node_id),
                metadata: wire.metadata,
                blocks: wire.blocks,
            })
        }
    }
}

/// Serialize and compress a state for peers at `version`.
pub fn encode_state(state: &ClusterState, version: Version) -> Result<Vec<u8>> {
    let raw = state.write_to(version)?;
    Ok(default_compressor().compress(&raw))
}

/// Decode a payload (compressed or not) sent at `version`, as seen by `local_node`.
pub fn decode_state(
    payload: &[u8],
    version: Version,
    local_node: Option<NodeId>,
) -> Result<ClusterState> {
    let raw = decompress_if_needed(payload)?;
    let state = ClusterState::read_from(&raw, version)?;
    Ok(state.with_local_node(local_node))
}
