//! Persists applied cluster metadata and handles startup checks.

use super::dangling::DanglingIndices;
use super::env::NodeEnvironment;
use super::format::{
    contains_pre_019_state, MetaStateFormat, GLOBAL_STATE_FILE_PREFIX, INDEX_STATE_FILE_PREFIX,
};
use super::{DanglingIndicesAllocator, IndexDeletionNotifier};
use crate::applier::ClusterStateListener;
use crate::config::{GatewayConfig, LegacyConfig};
use crate::error::{Result, SyncError};
use crate::observability;
use crate::state::{
    ClusterChangedEvent, ClusterState, IndexMetaData, MetaData,
    SETTING_LEGACY_ROUTING_HASH_FUNCTION, SETTING_LEGACY_ROUTING_USE_TYPE,
};
use crate::types::{NodeId, NodeRoles, Settings, Version};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::{debug, error, info, trace, warn};

/// Writes global and index metadata as cluster states are applied.
pub struct GatewayMetaState {
    node_id: NodeId,
    roles: NodeRoles,
    env: Arc<NodeEnvironment>,
    global_format: MetaStateFormat<MetaData>,
    index_format: Arc<MetaStateFormat<IndexMetaData>>,
    keep_global_history: bool,
    /// Last state whose persistence fully succeeded.
    committed: Mutex<Option<Arc<ClusterState>>>,
    /// Removed indices whose directory is still on disk, retried on every state change.
    pending_deletions: Mutex<BTreeSet<String>>,
    dangling: DanglingIndices,
    deletion_notifier: Arc<dyn IndexDeletionNotifier>,
    runtime: Option<Handle>,
}

impl GatewayMetaState {
    /// Open the gateway, running startup checks and the legacy routing upgrade.
    ///
    /// Must be called before the node joins the cluster; every error it
    /// returns should abort startup.
    pub fn open(
        node_id: impl Into<NodeId>,
        roles: NodeRoles,
        env: Arc<NodeEnvironment>,
        gateway: &GatewayConfig,
        legacy: &LegacyConfig,
        allocator: Arc<dyn DanglingIndicesAllocator>,
        deletion_notifier: Arc<dyn IndexDeletionNotifier>,
    ) -> Result<Self> {
        let index_format = Arc::new(MetaStateFormat::new(gateway.format, INDEX_STATE_FILE_PREFIX));
        let dangling = DanglingIndices::new(
            Arc::clone(&env),
            Arc::clone(&index_format),
            gateway,
            allocator,
        );
        let gateway_state = Self {
            node_id: node_id.into(),
            roles,
            env,
            global_format: MetaStateFormat::new(gateway.format, GLOBAL_STATE_FILE_PREFIX),
            index_format,
            keep_global_history: gateway.global_state_history,
            committed: Mutex::new(None),
            pending_deletions: Mutex::new(BTreeSet::new()),
            dangling,
            deletion_notifier,
            runtime: Handle::try_current().ok(),
        };

        if roles.persists_state() {
            gateway_state.env.ensure_atomic_move_supported()?;
        }

        if roles.is_master_eligible() {
            gateway_state.ensure_no_pre_019_state().map_err(log_fatal)?;
            gateway_state.upgrade_legacy_routing(legacy).map_err(log_fatal)?;

            // Fails startup early on unreadable documents; recovery loads again later.
            let start = Instant::now();
            let metadata = gateway_state.load_meta_state()?;
            debug!(
                indices = metadata.indices.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Loaded local metadata state"
            );
        }

        Ok(gateway_state)
    }

    pub fn dangling_indices(&self) -> &DanglingIndices {
        &self.dangling
    }

    /// Metadata of the last fully persisted state.
    ///
    /// Lags behind the applied state while metadata writes keep failing.
    pub fn committed_metadata(&self) -> Option<MetaData> {
        self.committed.lock().as_ref().map(|s| s.metadata.clone())
    }

    /// Removed indices whose directory deletion is waiting for a retry.
    pub fn pending_deletions(&self) -> Vec<String> {
        self.pending_deletions.lock().iter().cloned().collect()
    }

    /// Rebuild metadata from the newest documents on disk.
    pub fn load_meta_state(&self) -> Result<MetaData> {
        let mut metadata = self
            .global_format
            .load_latest(self.env.node_data_paths())?
            .unwrap_or_default();

        for name in self.env.find_all_indices()? {
            match self.index_format.load_latest(&self.env.index_paths(&name))? {
                Some(index) => metadata = metadata.put(index),
                None => debug!(index = %name, "Failed to find metadata for existing index location"),
            }
        }
        Ok(metadata)
    }

    fn ensure_no_pre_019_state(&self) -> Result<()> {
        for dir in self.env.node_state_dirs() {
            if let Some(found) = contains_pre_019_state(&dir)? {
                return Err(SyncError::IncompatibleStateFormat(found.display().to_string()));
            }
        }
        Ok(())
    }

    /// Record the node-level routing settings on every index that predates them.
    fn upgrade_legacy_routing(&self, legacy: &LegacyConfig) -> Result<()> {
        if legacy.is_configured() {
            warn!(
                "Settings [cluster.routing.operation.hash.type] and \
                 [cluster.routing.operation.use_type] are deprecated and only applied \
                 to indices created before {}",
                Version::V_2_0_0
            );
        }
        let hash_function = legacy.routing_hash_function.unwrap_or_default();
        let use_type = legacy.routing_use_type.unwrap_or(false);

        let metadata = self.load_meta_state()?;
        for index in metadata.iter() {
            let created = index.creation_version()?;
            let has_hash = index.settings.contains(SETTING_LEGACY_ROUTING_HASH_FUNCTION);
            let has_use_type = index.settings.contains(SETTING_LEGACY_ROUTING_USE_TYPE);

            if created.before(Version::V_2_0_0) {
                if has_hash {
                    continue;
                }
                let settings = index
                    .settings
                    .clone()
                    .with(SETTING_LEGACY_ROUTING_HASH_FUNCTION, hash_function)
                    .with(SETTING_LEGACY_ROUTING_USE_TYPE, use_type);
                let upgraded = index.clone().with_settings(settings);
                self.index_format.write(
                    &upgraded,
                    upgraded.version,
                    &self.env.index_paths(&upgraded.index),
                    false,
                )?;
                info!(
                    index = %upgraded.index,
                    created = %created,
                    hash_function = %hash_function,
                    use_type,
                    "Recorded legacy routing settings on index"
                );
            } else if has_hash || has_use_type {
                return Err(SyncError::CorruptedLegacySettings {
                    index: index.index.clone(),
                    threshold: Version::V_2_0_0,
                    settings: legacy_settings_of(&index.settings),
                });
            }
        }
        Ok(())
    }

    fn write_global(&self, metadata: &MetaData) -> Result<()> {
        // Only the global portion is persisted here; indices have their own documents.
        let mut global = MetaData::new(metadata.cluster_uuid.clone()).with_version(metadata.version);
        global.persistent_settings = metadata.persistent_settings.clone();

        let result = self.global_format.write(
            &global,
            metadata.version,
            self.env.node_data_paths(),
            !self.keep_global_history,
        );
        observability::record_gateway_write("global", result.is_ok());
        result
    }

    fn write_index(&self, reason: &str, index: &IndexMetaData, previous: Option<&IndexMetaData>) -> Result<()> {
        trace!(index = %index.index, version = index.version, reason, "Writing index state");
        let delete_old = previous.map_or(false, |p| p.version != index.version);
        let result = self.index_format.write(
            index,
            index.version,
            &self.env.index_paths(&index.index),
            delete_old,
        );
        observability::record_gateway_write("index", result.is_ok());
        result
    }

    fn delete_index(&self, name: &str) {
        let locations = self.env.index_paths(name);
        if let Err(e) = self.index_format.delete_meta_state(&locations) {
            warn!(index = %name, error = %e, "Failed to delete index metadata");
        }
        if !self.delete_index_directory(name) {
            self.pending_deletions.lock().insert(name.to_string());
        }
        self.notify_deleted(name);
    }

    /// Returns false when the deletion should be tried again on a later state change.
    fn delete_index_directory(&self, name: &str) -> bool {
        match self.env.delete_index_directory_safe(name) {
            Ok(()) => {
                info!(index = %name, "Deleted index that is no longer part of the cluster");
                true
            }
            Err(SyncError::ShardLocked { index, shard }) => {
                debug!(index = %index, shard, "Shard locked, deferring index directory deletion");
                false
            }
            Err(e) => {
                warn!(index = %name, error = %e, "Failed to delete index directory");
                !e.is_retryable()
            }
        }
    }

    fn retry_pending_deletions(&self, state: &ClusterState) {
        let mut pending = self.pending_deletions.lock();
        pending.retain(|name| {
            if state.metadata.has_index(name) {
                debug!(index = %name, "Index is part of the cluster again, dropping deferred deletion");
                return false;
            }
            !self.delete_index_directory(name)
        });
    }

    fn notify_deleted(&self, name: &str) {
        let Some(runtime) = &self.runtime else {
            debug!(index = %name, "No runtime available, skipping index deletion notification");
            return;
        };
        let notifier = Arc::clone(&self.deletion_notifier);
        let index = name.to_string();
        let node_id = self.node_id.clone();
        runtime.spawn(async move {
            if let Err(e) = notifier.index_store_deleted(&index, &node_id).await {
                warn!(index = %index, error = %e, "Failed to notify index store deletion");
            }
        });
    }

    fn persist(&self, state: &Arc<ClusterState>, committed: Option<&Arc<ClusterState>>) -> bool {
        let metadata = &state.metadata;
        let mut success = true;

        let global_changed = committed
            .map_or(true, |c| !MetaData::is_global_state_equal(&c.metadata, metadata));
        if global_changed {
            if let Err(e) = self.write_global(metadata) {
                warn!(version = metadata.version, error = %e, "Failed to write global state");
                success = false;
            }
        }

        for index in metadata.iter() {
            let previous = match committed {
                Some(c) => c.metadata.index(&index.index).cloned(),
                None => match self.index_format.load_latest(&self.env.index_paths(&index.index)) {
                    Ok(found) => found,
                    Err(e) => {
                        debug!(index = %index.index, error = %e, "Unreadable index state on disk");
                        None
                    }
                },
            };

            let reason = match &previous {
                None => "freshly created".to_string(),
                Some(p) if p.version != index.version => {
                    format!("version changed from [{}] to [{}]", p.version, index.version)
                }
                Some(_) => continue,
            };

            if let Err(e) = self.write_index(&reason, index, previous.as_ref()) {
                warn!(index = %index.index, error = %e, "Failed to write index state");
                success = false;
            }
        }
        success
    }
}

impl ClusterStateListener for GatewayMetaState {
    fn name(&self) -> &str {
        "gateway"
    }

    fn cluster_changed(&self, event: &ClusterChangedEvent) -> Result<()> {
        let state = &event.state;
        let mut committed = self.committed.lock();

        if state.blocks.disable_state_persistence() {
            // Reset so the first recovered state is written in full.
            *committed = None;
            return Ok(());
        }

        let mut success = true;
        if self.roles.persists_state() {
            success = self.persist(state, committed.as_ref());
        }

        self.retry_pending_deletions(state);
        if let Some(previous) = committed.as_ref() {
            for name in previous.metadata.indices_missing_from(&state.metadata) {
                if self.dangling.contains(name) {
                    continue;
                }
                self.delete_index(name);
            }
        }

        self.dangling.reconcile(state);

        // A failed write holds back the committed state only; the next state retries it.
        if success {
            *committed = Some(Arc::clone(state));
        } else {
            warn!(
                version = state.version,
                "Failed to persist cluster state, keeping last committed metadata"
            );
        }
        Ok(())
    }
}

fn legacy_settings_of(settings: &Settings) -> String {
    [SETTING_LEGACY_ROUTING_HASH_FUNCTION, SETTING_LEGACY_ROUTING_USE_TYPE]
        .iter()
        .filter_map(|key| settings.get(key).map(|v| format!("{}={}", key, v)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn log_fatal(e: SyncError) -> SyncError {
    error!(error = %e, "Local metadata state is not usable");
    e
}
