//! Local persistence of cluster metadata.
//!
//! # Overview
//!
//! Every master-eligible or data node keeps the global metadata and each
//! index's metadata on local disk, so that a full cluster restart can recover
//! the last committed state:
//!
//! ```text
//! <data_path>/
//! ├── _state/
//! │   └── global-<version>.st
//! └── indices/
//!     └── <index>/
//!         ├── _state/
//!         │   └── state-<version>.st
//!         └── <shard>/...
//! ```
//!
//! [`GatewayMetaState`] writes documents as states are applied and deletes
//! indices that left the cluster. [`DanglingIndices`] deals with index
//! directories found on disk that the cluster state does not know about.

mod dangling;
mod env;
mod format;
mod meta_state;

pub use dangling::{DanglingIndices, ReconcileReport};
pub use env::{NodeEnvironment, ShardId, ShardLock, INDICES_DIR_NAME};
pub use format::{
    DocumentContentType, DocumentFormat, MetaStateFormat, StateFile, GLOBAL_STATE_FILE_PREFIX,
    INDEX_STATE_FILE_PREFIX, STATE_DIR_NAME, STATE_FILE_EXTENSION,
};
pub use meta_state::GatewayMetaState;

use crate::error::Result;
use crate::state::IndexMetaData;

/// Hands dangling indices to the allocation layer for import.
#[async_trait::async_trait]
pub trait DanglingIndicesAllocator: Send + Sync {
    async fn allocate_dangled(&self, indices: Vec<IndexMetaData>) -> Result<()>;
}

/// Told when this node removed an index's files.
#[async_trait::async_trait]
pub trait IndexDeletionNotifier: Send + Sync {
    async fn index_store_deleted(&self, index: &str, node_id: &str) -> Result<()>;
}

/// Allocator that drops every batch; for nodes without an allocation layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAllocator;

#[async_trait::async_trait]
impl DanglingIndicesAllocator for NoopAllocator {
    async fn allocate_dangled(&self, indices: Vec<IndexMetaData>) -> Result<()> {
        tracing::debug!(count = indices.len(), "No allocator configured, dropping dangling import");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDeletionNotifier;

#[async_trait::async_trait]
impl IndexDeletionNotifier for NoopDeletionNotifier {
    async fn index_store_deleted(&self, _index: &str, _node_id: &str) -> Result<()> {
        Ok(())
    }
}
