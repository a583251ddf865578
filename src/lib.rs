//! statesync - cluster-state publication and local metadata persistence.
//!
//! A distributed document store keeps one authoritative cluster state: node
//! membership, cluster-wide settings and the metadata of every index. This
//! crate moves that state around and keeps it safe:
//!
//! # Features
//!
//! - **Publication**: the coordinating node serializes each new state once per
//!   peer wire version, sends it to every peer concurrently and waits, bounded,
//!   for acknowledgments.
//! - **Serialized adoption**: every node applies received states one at a time,
//!   in version order, and notifies its listeners.
//! - **Gateway persistence**: master-eligible and data nodes write global and
//!   per-index metadata with atomic, versioned, checksummed documents.
//! - **Dangling indices**: index directories missing from the cluster state are
//!   imported back or deleted after a timeout.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Coordinator: Publisher ── AckTracker ── Transport           │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Every node:  PublishHandler ── ClusterStateApplier          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Listeners:   GatewayMetaState ── DanglingIndices            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Disk:        NodeEnvironment ── MetaStateFormat documents   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use statesync::config::StateSyncConfig;
//! use statesync::gateway::{NoopAllocator, NoopDeletionNotifier};
//! use statesync::node::{ClusterNode, NodeCollaborators};
//! use statesync::transport::LocalTransport;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> statesync::Result<()> {
//!     let config = StateSyncConfig::development();
//!     statesync::observability::init(&config.observability)?;
//!
//!     let transport = Arc::new(LocalTransport::new());
//!     let node = ClusterNode::start(
//!         config,
//!         NodeCollaborators {
//!             transport: transport.clone(),
//!             allocator: Arc::new(NoopAllocator),
//!             deletion_notifier: Arc::new(NoopDeletionNotifier),
//!         },
//!     )
//!     .await?;
//!     transport.register(node.local_node().id.clone(), node.publish_handler());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod applier;
pub mod codec;
pub mod compression;
pub mod gateway;
pub mod node;
pub mod observability;
pub mod publish;
pub mod routing;
pub mod shutdown;
pub mod state;
pub mod transport;

pub use error::{Result, SyncError};
pub use node::ClusterNode;
pub use state::{ClusterState, IndexMetaData, MetaData};
pub use types::{DiscoveryNode, DiscoveryNodes, NodeId, Version};
