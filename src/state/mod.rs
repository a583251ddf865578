//! Cluster state: the authoritative, immutable snapshot a coordinator publishes.
//!
//! A [`ClusterState`] is produced once per coordinator decision and never
//! mutated. New states are derived from the previous one through
//! [`ClusterState::to_builder`] and shared as `Arc<ClusterState>`.

mod metadata;

pub use metadata::{
    IndexMetaData, IndexState, MetaData, SETTING_LEGACY_ROUTING_HASH_FUNCTION,
    SETTING_LEGACY_ROUTING_USE_TYPE, SETTING_NUMBER_OF_SHARDS, SETTING_VERSION_CREATED,
};

use crate::types::{DiscoveryNodes, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// Cluster-level blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ClusterBlock {
    /// State has not been recovered from the gateway yet; must not be persisted.
    StateNotRecovered,
    /// No elected master.
    NoMaster,
    /// Metadata writes are refused.
    ReadOnly,
}

impl ClusterBlock {
    pub fn disables_state_persistence(&self) -> bool {
        matches!(self, ClusterBlock::StateNotRecovered)
    }
}

/// Set of global blocks applied to a cluster state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterBlocks {
    global: BTreeSet<ClusterBlock>,
}

impl ClusterBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, block: ClusterBlock) -> Self {
        self.global.insert(block);
        self
    }

    pub fn without(mut self, block: ClusterBlock) -> Self {
        self.global.remove(&block);
        self
    }

    pub fn has(&self, block: ClusterBlock) -> bool {
        self.global.contains(&block)
    }

    pub fn disable_state_persistence(&self) -> bool {
        self.global.iter().any(ClusterBlock::disables_state_persistence)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterBlock> {
        self.global.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.global.is_empty()
    }
}

/// Immutable snapshot of cluster topology and metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterState {
    /// Strictly increasing per coordinator decision.
    pub version: u64,
    /// Unique per built state, distinguishes two states with the same version.
    pub state_uuid: String,
    pub cluster_name: String,
    pub nodes: DiscoveryNodes,
    pub metadata: MetaData,
    pub blocks: ClusterBlocks,
}

impl ClusterState {
    pub fn builder(cluster_name: impl Into<String>) -> ClusterStateBuilder {
        ClusterStateBuilder {
            version: 0,
            cluster_name: cluster_name.into(),
            nodes: DiscoveryNodes::new(),
            metadata: MetaData::default(),
            blocks: ClusterBlocks::new(),
        }
    }

    /// Start a new state from this one. The version is carried over unchanged.
    pub fn to_builder(&self) -> ClusterStateBuilder {
        ClusterStateBuilder {
            version: self.version,
            cluster_name: self.cluster_name.clone(),
            nodes: self.nodes.clone(),
            metadata: self.metadata.clone(),
            blocks: self.blocks.clone(),
        }
    }

    /// The same state as seen from another node.
    pub fn with_local_node(&self, local: Option<NodeId>) -> ClusterState {
        let mut state = self.clone();
        state.nodes.set_local_node_id(local);
        state
    }

    pub fn into_arc(self) -> Arc<ClusterState> {
        Arc::new(self)
    }
}

/// Builder for [`ClusterState`].
#[derive(Debug, Clone)]
pub struct ClusterStateBuilder {
    version: u64,
    cluster_name: String,
    nodes: DiscoveryNodes,
    metadata: MetaData,
    blocks: ClusterBlocks,
}

impl ClusterStateBuilder {
    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn incr_version(mut self) -> Self {
        self.version += 1;
        self
    }

    pub fn nodes(mut self, nodes: DiscoveryNodes) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn metadata(mut self, metadata: MetaData) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn blocks(mut self, blocks: ClusterBlocks) -> Self {
        self.blocks = blocks;
        self
    }

    pub fn build(self) -> ClusterState {
        ClusterState {
            version: self.version,
            state_uuid: Uuid::new_v4().to_string(),
            cluster_name: self.cluster_name,
            nodes: self.nodes,
            metadata: self.metadata,
            blocks: self.blocks,
        }
    }
}

/// A state transition delivered to [`ClusterStateListener`](crate::applier::ClusterStateListener)s.
#[derive(Debug, Clone)]
pub struct ClusterChangedEvent {
    pub source: String,
    pub state: Arc<ClusterState>,
    /// `None` for the first state applied after startup.
    pub previous: Option<Arc<ClusterState>>,
}

impl ClusterChangedEvent {
    pub fn new(
        source: impl Into<String>,
        state: Arc<ClusterState>,
        previous: Option<Arc<ClusterState>>,
    ) -> Self {
        Self {
            source: source.into(),
            state,
            previous,
        }
    }
}
