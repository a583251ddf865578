//! Publication integration tests.
//!
//! Nodes run in one process and talk through a shared `LocalTransport`.

#[allow(dead_code)]
mod common;

use common::*;
use parking_lot::Mutex;
use statesync::applier::ApplyOutcome;
use statesync::publish::{AckListener, AwaitOutcome, PeerOutcome};
use statesync::state::{IndexMetaData, MetaData};
use statesync::transport::Fault;
use statesync::types::{DiscoveryNode, NodeId, Version};
use statesync::SyncError;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingAckListener {
    acks: Mutex<Vec<(NodeId, bool)>>,
}

impl AckListener for RecordingAckListener {
    fn on_node_ack(&self, node: &DiscoveryNode, failure: Option<&SyncError>) {
        self.acks.lock().push((node.id.clone(), failure.is_none()));
    }
}

fn metadata(indices: &[&str]) -> MetaData {
    indices
        .iter()
        .fold(MetaData::new("cluster-uuid"), |meta, name| meta.put(IndexMetaData::new(*name)))
}

async fn applied_versions(cluster: &TestCluster) -> Vec<Option<u64>> {
    let mut versions = Vec::new();
    for node in &cluster.nodes {
        let state = node.applied_state().await.unwrap();
        versions.push(state.map(|s| s.version));
    }
    versions
}

#[tokio::test]
async fn test_every_node_adopts_published_state() {
    let cluster = TestCluster::start(3).await;
    let listener = Arc::new(RecordingAckListener::default());

    let outcome = cluster
        .coordinator()
        .publish(cluster.state(1, metadata(&["logs"])), Some(listener.clone()))
        .await;

    assert_eq!(outcome.version, 1);
    assert_eq!(outcome.completion, Some(AwaitOutcome::Completed));
    assert_eq!(outcome.acked().count(), 2);
    assert!(matches!(outcome.local, Some(Ok(ApplyOutcome::Applied))));
    assert_eq!(applied_versions(&cluster).await, vec![Some(1), Some(1), Some(1)]);

    let mut acks = listener.acks.lock().clone();
    acks.sort();
    assert_eq!(
        acks,
        vec![("node-1".to_string(), true), ("node-2".to_string(), true)]
    );

    // Every receiver sees the state from its own point of view.
    for node in &cluster.nodes[1..] {
        let state = node.applied_state().await.unwrap().unwrap();
        assert_eq!(state.nodes.local_id(), Some(&node.local_node().id));
        assert_eq!(state.nodes.master_id().map(String::as_str), Some("node-0"));
        assert!(state.metadata.has_index("logs"));
    }

    cluster.close().await;
}

#[tokio::test]
async fn test_stale_state_is_acked_but_not_adopted() {
    let cluster = TestCluster::start(2).await;
    let coordinator = cluster.coordinator();

    coordinator.publish(cluster.state(5, metadata(&["a"])), None).await;
    let outcome = coordinator.publish(cluster.state(3, metadata(&["b"])), None).await;

    assert_eq!(outcome.completion, Some(AwaitOutcome::Completed));
    assert_eq!(outcome.acked().collect::<Vec<_>>(), vec!["node-1"]);
    assert!(matches!(
        outcome.local,
        Some(Ok(ApplyOutcome::Stale { applied_version: 5 }))
    ));

    let applied = cluster.nodes[1].applied_state().await.unwrap().unwrap();
    assert_eq!(applied.version, 5);
    assert!(applied.metadata.has_index("a"));
    assert!(!applied.metadata.has_index("b"));

    cluster.close().await;
}

#[tokio::test]
async fn test_versions_are_adopted_in_order() {
    let cluster = TestCluster::start(3).await;
    let coordinator = cluster.coordinator();

    for version in 1..=5 {
        let outcome = coordinator
            .publish(cluster.state(version, metadata(&["logs"])), None)
            .await;
        assert_eq!(outcome.completion, Some(AwaitOutcome::Completed));
    }

    assert_eq!(applied_versions(&cluster).await, vec![Some(5); 3]);
    cluster.close().await;
}

#[tokio::test]
async fn test_times_out_on_unresponsive_peer() {
    let cluster = TestCluster::start_with(3, |config| {
        config.publish.timeout = Duration::from_millis(200);
    })
    .await;
    cluster.transport.inject_fault("node-2", Fault::Blackhole);

    let started = tokio::time::Instant::now();
    let outcome = cluster
        .coordinator()
        .publish(cluster.state(1, metadata(&[])), None)
        .await;

    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(outcome.completion, Some(AwaitOutcome::TimedOut));
    assert_eq!(outcome.acked().collect::<Vec<_>>(), vec!["node-1"]);
    assert_eq!(outcome.pending().collect::<Vec<_>>(), vec!["node-2"]);
    // The coordinator adopts the state regardless of the timeout.
    assert!(matches!(outcome.local, Some(Ok(ApplyOutcome::Applied))));
    assert_eq!(applied_versions(&cluster).await, vec![Some(1), Some(1), None]);

    cluster.close().await;
}

#[tokio::test]
async fn test_failed_peers_do_not_hold_up_the_round() {
    let cluster = TestCluster::start_with(3, |config| {
        config.publish.timeout = Duration::from_secs(30);
    })
    .await;
    cluster.transport.inject_fault("node-1", Fault::Disconnected);

    let started = tokio::time::Instant::now();
    let outcome = cluster
        .coordinator()
        .publish(cluster.state(1, metadata(&[])), None)
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(outcome.completion, Some(AwaitOutcome::Completed));
    let failed: Vec<_> = outcome.failed().map(|(id, _)| id.as_str()).collect();
    assert_eq!(failed, vec!["node-1"]);
    assert_eq!(outcome.acked().collect::<Vec<_>>(), vec!["node-2"]);

    // Once reconnected the node catches up with the next state.
    cluster.transport.clear_fault("node-1");
    let outcome = cluster
        .coordinator()
        .publish(cluster.state(2, metadata(&[])), None)
        .await;
    assert_eq!(outcome.acked().count(), 2);
    assert_eq!(applied_versions(&cluster).await, vec![Some(2); 3]);

    cluster.close().await;
}

#[tokio::test]
async fn test_unknown_member_is_reported_as_failure() {
    let cluster = TestCluster::start(2).await;
    let nodes = cluster.discovery_nodes().add(phantom_peer("ghost"));
    let state = cluster
        .state(1, metadata(&[]))
        .to_builder()
        .nodes(nodes)
        .build()
        .into_arc();

    let outcome = cluster.coordinator().publish(state, None).await;

    assert_eq!(outcome.completion, Some(AwaitOutcome::Completed));
    assert!(matches!(outcome.peers.get("ghost"), Some(PeerOutcome::Failed(_))));
    assert_eq!(outcome.peers.get("node-1"), Some(&PeerOutcome::Acked));

    cluster.close().await;
}

#[tokio::test]
async fn test_mixed_wire_versions() {
    let cluster = TestCluster::start_with(3, |config| {
        if config.node.id == "node-2" {
            config.node.version = Version::V_1_4_0;
        }
    })
    .await;
    let ancient = DiscoveryNode::new(
        "ancient",
        "ancient:9300",
        Version::V_0_90_0,
        statesync::types::NodeRoles::data_only(),
    );
    let state = cluster
        .state(1, metadata(&["logs"]))
        .to_builder()
        .nodes(cluster.discovery_nodes().add(ancient))
        .build()
        .into_arc();

    let outcome = cluster.coordinator().publish(state, None).await;

    // A peer too old to encode for fails without being contacted.
    assert!(matches!(outcome.peers.get("ancient"), Some(PeerOutcome::Failed(_))));
    assert_eq!(cluster.transport.sent_count("ancient"), 0);
    assert_eq!(outcome.peers.get("node-1"), Some(&PeerOutcome::Acked));
    assert_eq!(outcome.peers.get("node-2"), Some(&PeerOutcome::Acked));

    let older = cluster.nodes[2].applied_state().await.unwrap().unwrap();
    assert!(older.metadata.has_index("logs"));

    cluster.close().await;
}

#[tokio::test]
async fn test_zero_timeout_does_not_wait() {
    let cluster = TestCluster::start_with(2, |config| {
        config.publish.timeout = Duration::ZERO;
    })
    .await;
    cluster.transport.inject_fault("node-1", Fault::Blackhole);

    let outcome = cluster
        .coordinator()
        .publish(cluster.state(1, metadata(&[])), None)
        .await;

    assert_eq!(outcome.completion, None);
    assert!(matches!(outcome.local, Some(Ok(ApplyOutcome::Applied))));

    cluster.close().await;
}

#[tokio::test]
async fn test_close_interrupts_pending_wait() {
    let cluster = Arc::new(
        TestCluster::start_with(2, |config| {
            config.publish.timeout = Duration::from_secs(60);
        })
        .await,
    );
    cluster.transport.inject_fault("node-1", Fault::Blackhole);

    let publishing = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move {
            cluster
                .coordinator()
                .publish(cluster.state(1, metadata(&[])), None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.coordinator().close().await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), publishing)
        .await
        .expect("publish did not return after close")
        .unwrap();
    assert_eq!(outcome.completion, Some(AwaitOutcome::Interrupted));
}
