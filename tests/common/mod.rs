//! Common test utilities for integration tests.

use parking_lot::Mutex;
use statesync::config::{AutoImportDangled, StateSyncConfig};
use statesync::gateway::{
    DanglingIndicesAllocator, DocumentContentType, IndexDeletionNotifier, MetaStateFormat,
    INDEX_STATE_FILE_PREFIX,
};
use statesync::node::{ClusterNode, NodeCollaborators};
use statesync::state::{ClusterBlock, ClusterBlocks, ClusterState, IndexMetaData, MetaData};
use statesync::transport::LocalTransport;
use statesync::types::{DiscoveryNode, DiscoveryNodes, NodeRoles, Version};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const CLUSTER_NAME: &str = "test-cluster";

/// Test environment that manages temporary directories and cleanup.
pub struct TestEnv {
    pub temp_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Data path of one node.
    pub fn data_path(&self, node: &str) -> PathBuf {
        let path = self.temp_dir.path().join(node);
        std::fs::create_dir_all(&path).expect("Failed to create data path");
        path
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocator recording every import batch.
#[derive(Default)]
pub struct RecordingAllocator {
    pub batches: Mutex<Vec<Vec<IndexMetaData>>>,
}

impl RecordingAllocator {
    pub fn imported(&self) -> Vec<IndexMetaData> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait::async_trait]
impl DanglingIndicesAllocator for RecordingAllocator {
    async fn allocate_dangled(&self, indices: Vec<IndexMetaData>) -> statesync::Result<()> {
        self.batches.lock().push(indices);
        Ok(())
    }
}

/// Notifier recording deleted index stores.
#[derive(Default)]
pub struct RecordingNotifier {
    pub deleted: Mutex<Vec<(String, String)>>,
}

#[async_trait::async_trait]
impl IndexDeletionNotifier for RecordingNotifier {
    async fn index_store_deleted(&self, index: &str, node_id: &str) -> statesync::Result<()> {
        self.deleted.lock().push((index.to_string(), node_id.to_string()));
        Ok(())
    }
}

/// Node config for tests: JSON documents, short publish timeout.
pub fn node_config(id: &str, data_path: PathBuf, roles: NodeRoles) -> StateSyncConfig {
    let mut config = StateSyncConfig::default();
    config.node.id = id.to_string();
    config.node.name = id.to_string();
    config.node.address = format!("{}:9300", id);
    config.node.roles = roles;
    config.node.data_paths = vec![data_path];
    config.publish.timeout = Duration::from_secs(2);
    config.gateway.format = DocumentContentType::Json;
    config.gateway.auto_import_dangled = AutoImportDangled::No;
    config.gateway.dangling_timeout = Some(Duration::from_millis(200));
    config
}

/// Nodes sharing one in-process transport. Node 0 coordinates.
pub struct TestCluster {
    pub env: TestEnv,
    pub transport: Arc<LocalTransport>,
    pub nodes: Vec<ClusterNode>,
    pub allocator: Arc<RecordingAllocator>,
    pub notifier: Arc<RecordingNotifier>,
}

impl TestCluster {
    pub async fn start(size: usize) -> Self {
        Self::start_with(size, |_| {}).await
    }

    /// Start `size` nodes, letting `customize` adjust each config.
    pub async fn start_with(size: usize, customize: impl Fn(&mut StateSyncConfig)) -> Self {
        let env = TestEnv::new();
        let transport = Arc::new(LocalTransport::new());
        let allocator = Arc::new(RecordingAllocator::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let starts = (0..size).map(|i| {
            let id = format!("node-{}", i);
            let mut config = node_config(&id, env.data_path(&id), NodeRoles::master_and_data());
            customize(&mut config);
            ClusterNode::start(
                config,
                NodeCollaborators {
                    transport: transport.clone(),
                    allocator: allocator.clone(),
                    deletion_notifier: notifier.clone(),
                },
            )
        });
        let nodes: Vec<ClusterNode> = futures::future::join_all(starts)
            .await
            .into_iter()
            .collect::<statesync::Result<_>>()
            .expect("Failed to start cluster");

        for node in &nodes {
            transport.register(node.local_node().id.clone(), node.publish_handler());
        }

        Self {
            env,
            transport,
            nodes,
            allocator,
            notifier,
        }
    }

    pub fn coordinator(&self) -> &ClusterNode {
        &self.nodes[0]
    }

    pub fn discovery_nodes(&self) -> DiscoveryNodes {
        let mut nodes = DiscoveryNodes::new();
        for node in &self.nodes {
            nodes = nodes.add(node.local_node().clone());
        }
        let coordinator = self.coordinator().local_node().id.clone();
        nodes.local_node_id(coordinator.clone()).master_node_id(coordinator)
    }

    /// A recovered state as built by the coordinator.
    pub fn state(&self, version: u64, metadata: MetaData) -> Arc<ClusterState> {
        ClusterState::builder(CLUSTER_NAME)
            .version(version)
            .nodes(self.discovery_nodes())
            .metadata(metadata)
            .build()
            .into_arc()
    }

    /// A state that has not been recovered from the gateway yet.
    pub fn unrecovered_state(&self, version: u64) -> Arc<ClusterState> {
        ClusterState::builder(CLUSTER_NAME)
            .version(version)
            .nodes(self.discovery_nodes())
            .blocks(ClusterBlocks::new().with(ClusterBlock::StateNotRecovered))
            .build()
            .into_arc()
    }

    pub fn data_path(&self, node: usize) -> PathBuf {
        self.env.data_path(&self.nodes[node].local_node().id)
    }

    pub async fn close(&self) {
        futures::future::join_all(self.nodes.iter().map(|n| n.close())).await;
    }
}

/// A peer that only exists on the transport's membership list.
pub fn phantom_peer(id: &str) -> DiscoveryNode {
    DiscoveryNode::new(id, format!("{}:9300", id), Version::CURRENT, NodeRoles::data_only())
}

/// Write index metadata straight to disk, as an earlier cluster would have left it.
pub fn write_index_on_disk(data_path: &std::path::Path, dir_name: &str, index: &IndexMetaData, shards: &[u32]) {
    let index_dir = data_path.join("indices").join(dir_name);
    for shard in shards {
        std::fs::create_dir_all(index_dir.join(shard.to_string())).expect("Failed to create shard dir");
    }
    let format: MetaStateFormat<IndexMetaData> =
        MetaStateFormat::new(DocumentContentType::Json, INDEX_STATE_FILE_PREFIX);
    format
        .write(index, index.version, &[index_dir], false)
        .expect("Failed to write index state");
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
