//! Index directories present on disk but absent from the cluster state.
//!
//! Every applied state is reconciled against the local `indices/` directory.
//! An unknown index is either imported back into the cluster (through the
//! [`DanglingIndicesAllocator`]) or deleted, immediately or after the
//! configured timeout. A pending deletion is cancelled when the index shows
//! up in a later state.
//!
//! All table mutations and timer fires happen under one mutex. Timers carry
//! the generation of the record that scheduled them, so a timer that fires
//! after its record was cancelled (or replaced) does nothing.

use super::env::NodeEnvironment;
use super::format::MetaStateFormat;
use super::DanglingIndicesAllocator;
use crate::config::{AutoImportDangled, GatewayConfig};
use crate::error::SyncError;
use crate::observability;
use crate::state::{ClusterState, IndexMetaData, IndexState};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

struct DanglingIndex {
    generation: u64,
    timer: Option<AbortHandle>,
}

/// What one reconciliation did, by index name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Tracked indices that reappeared in the cluster state.
    pub cancelled: Vec<String>,
    /// Indices submitted for import.
    pub imported: Vec<String>,
    /// Indices whose deletion was scheduled.
    pub scheduled: Vec<String>,
    /// Indices deleted right away.
    pub deleted: Vec<String>,
    /// Indices left alone this round.
    pub skipped: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.cancelled.is_empty()
            && self.imported.is_empty()
            && self.scheduled.is_empty()
            && self.deleted.is_empty()
            && self.skipped.is_empty()
    }
}

struct Inner {
    env: Arc<NodeEnvironment>,
    index_format: Arc<MetaStateFormat<IndexMetaData>>,
    policy: AutoImportDangled,
    timeout: Option<Duration>,
    allocator: Arc<dyn DanglingIndicesAllocator>,
    table: Mutex<BTreeMap<String, DanglingIndex>>,
    next_generation: AtomicU64,
    runtime: Option<Handle>,
}

/// Tracks dangling indices of one node.
#[derive(Clone)]
pub struct DanglingIndices {
    inner: Arc<Inner>,
}

impl DanglingIndices {
    pub fn new(
        env: Arc<NodeEnvironment>,
        index_format: Arc<MetaStateFormat<IndexMetaData>>,
        config: &GatewayConfig,
        allocator: Arc<dyn DanglingIndicesAllocator>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                env,
                index_format,
                policy: config.auto_import_dangled,
                timeout: config.dangling_timeout,
                allocator,
                table: Mutex::new(BTreeMap::new()),
                next_generation: AtomicU64::new(1),
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    pub fn contains(&self, index: &str) -> bool {
        self.inner.table.lock().contains_key(index)
    }

    /// Names of tracked indices.
    pub fn tracked(&self) -> Vec<String> {
        self.inner.table.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record and abort pending deletions.
    pub fn clear(&self) {
        let mut table = self.inner.table.lock();
        for (_, record) in std::mem::take(&mut *table) {
            if let Some(timer) = record.timer {
                timer.abort();
            }
        }
        observability::update_dangling_indices(0);
    }

    /// Reconcile local index directories against `state`.
    pub fn reconcile(&self, state: &ClusterState) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let inner = &self.inner;
        let Some(timeout) = inner.timeout else {
            return report;
        };
        if !inner.env.has_node_file() {
            return report;
        }

        let mut table = inner.table.lock();

        table.retain(|name, record| {
            if !state.metadata.has_index(name) {
                return true;
            }
            if let Some(timer) = record.timer.take() {
                timer.abort();
            }
            debug!(index = %name, "Dangling index now part of the cluster state, no longer tracked");
            report.cancelled.push(name.clone());
            false
        });

        let on_disk = match inner.env.find_all_indices() {
            Ok(indices) => indices,
            Err(e) => {
                warn!(error = %e, "Failed to list local indices");
                observability::update_dangling_indices(table.len());
                return report;
            }
        };

        for name in on_disk {
            if state.metadata.has_index(&name) || table.contains_key(&name) {
                continue;
            }
            match inner.index_format.load_latest(&inner.env.index_paths(&name)) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!(index = %name, "Index directory without metadata, ignoring");
                    report.skipped.push(name);
                    continue;
                }
                Err(e) => {
                    warn!(index = %name, error = %e, "Failed to read metadata of unknown index");
                    report.skipped.push(name);
                    continue;
                }
            }

            let locks = match inner.env.lock_all_for_index(&name) {
                Ok(locks) => locks,
                Err(e) => {
                    debug!(index = %name, error = %e, "Unknown index is in use, will retry on next change");
                    report.skipped.push(name);
                    continue;
                }
            };

            if locks.is_empty() {
                drop(locks);
                info!(index = %name, "Deleting dangling index directory since it has no shards");
                match inner.env.delete_index_directory_safe(&name) {
                    Ok(()) => report.deleted.push(name),
                    Err(e) => {
                        warn!(index = %name, error = %e, "Failed to delete dangling index");
                        report.skipped.push(name);
                    }
                }
                continue;
            }
            drop(locks);

            if inner.policy.should_import() {
                info!(
                    index = %name,
                    auto_import = %inner.policy,
                    "Dangling index exists on local file system but not in cluster metadata, importing"
                );
                let generation = inner.next_generation.fetch_add(1, Ordering::SeqCst);
                table.insert(name, DanglingIndex { generation, timer: None });
            } else if timeout.is_zero() {
                info!(index = %name, "Dangling index exists on local file system but not in cluster metadata, timeout is 0, deleting now");
                match inner.env.delete_index_directory_safe(&name) {
                    Ok(()) => report.deleted.push(name),
                    Err(e) => {
                        warn!(index = %name, error = %e, "Failed to delete dangling index");
                        report.skipped.push(name);
                    }
                }
            } else {
                info!(
                    index = %name,
                    timeout = ?timeout,
                    "Dangling index exists on local file system but not in cluster metadata, scheduling deletion"
                );
                let generation = inner.next_generation.fetch_add(1, Ordering::SeqCst);
                let timer = self.schedule_removal(&name, generation, timeout);
                table.insert(name.clone(), DanglingIndex { generation, timer });
                report.scheduled.push(name);
            }
        }

        let batch = if inner.policy.should_import() && !table.is_empty() {
            self.import_batch(table.keys(), &mut report)
        } else {
            Vec::new()
        };
        observability::update_dangling_indices(table.len());
        drop(table);

        if !batch.is_empty() {
            self.submit_import(batch);
        }
        report
    }

    fn import_batch<'a>(
        &self,
        names: impl Iterator<Item = &'a String>,
        report: &mut ReconcileReport,
    ) -> Vec<IndexMetaData> {
        let inner = &self.inner;
        let mut batch = Vec::new();
        for name in names {
            let index = match inner.index_format.load_latest(&inner.env.index_paths(name)) {
                Ok(Some(index)) => index,
                Ok(None) => {
                    warn!(index = %name, "Dangling index metadata disappeared, not importing");
                    continue;
                }
                Err(e) => {
                    warn!(index = %name, error = %e, "Failed to load dangling index metadata");
                    continue;
                }
            };
            let mut index = if index.index != *name {
                info!(index = %name, stored = %index.index, "Dangled index directory name does not match stored name, renaming");
                index.with_index(name.clone())
            } else {
                index
            };
            if inner.policy.import_closed() {
                index = index.with_state(IndexState::Close);
            }
            report.imported.push(name.clone());
            batch.push(index);
        }
        batch
    }

    fn submit_import(&self, batch: Vec<IndexMetaData>) {
        let Some(runtime) = &self.inner.runtime else {
            warn!(count = batch.len(), "No runtime available, cannot import dangling indices");
            return;
        };
        let allocator = Arc::clone(&self.inner.allocator);
        runtime.spawn(async move {
            let names: Vec<String> = batch.iter().map(|i| i.index.clone()).collect();
            match allocator.allocate_dangled(batch).await {
                Ok(()) => debug!(indices = ?names, "Submitted dangling indices for import"),
                Err(e) => warn!(indices = ?names, error = %e, "Failed to import dangling indices"),
            }
        });
    }

    fn schedule_removal(&self, name: &str, generation: u64, delay: Duration) -> Option<AbortHandle> {
        let Some(runtime) = &self.inner.runtime else {
            warn!(index = %name, "No runtime available, dangling index deletion not scheduled");
            return None;
        };
        let inner = Arc::clone(&self.inner);
        let name = name.to_string();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let fire = tokio::task::spawn_blocking(move || inner.remove_expired(&name, generation));
            if let Err(e) = fire.await {
                warn!(error = %e, "Dangling index removal task failed");
            }
        });
        Some(handle.abort_handle())
    }
}

impl Inner {
    fn remove_expired(&self, name: &str, generation: u64) {
        let mut table = self.table.lock();
        match table.get(name) {
            Some(record) if record.generation == generation => {}
            _ => {
                debug!(index = %name, generation, "Dangling index no longer tracked, skipping removal");
                return;
            }
        }
        table.remove(name);

        match self.env.delete_index_directory_safe(name) {
            Ok(()) => info!(index = %name, "Deleted dangling index after timeout"),
            Err(SyncError::ShardLocked { index, shard }) => {
                debug!(index = %index, shard, "Dangling index is in use, not deleting");
            }
            Err(e) => warn!(index = %name, error = %e, "Failed to delete dangling index"),
        }
        observability::update_dangling_indices(table.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{DocumentContentType, INDEX_STATE_FILE_PREFIX};
    use crate::state::MetaData;
    use std::fs;
    use std::path::Path;

    #[derive(Default)]
    struct RecordingAllocator {
        batches: Mutex<Vec<Vec<IndexMetaData>>>,
    }

    #[async_trait::async_trait]
    impl DanglingIndicesAllocator for RecordingAllocator {
        async fn allocate_dangled(&self, indices: Vec<IndexMetaData>) -> crate::error::Result<()> {
            self.batches.lock().push(indices);
            Ok(())
        }
    }

    fn setup(
        root: &Path,
        policy: AutoImportDangled,
        timeout: Option<Duration>,
    ) -> (Arc<NodeEnvironment>, DanglingIndices, Arc<RecordingAllocator>) {
        let env = Arc::new(NodeEnvironment::open(&[root.to_path_buf()]).unwrap());
        let format = Arc::new(MetaStateFormat::new(DocumentContentType::Json, INDEX_STATE_FILE_PREFIX));
        let allocator = Arc::new(RecordingAllocator::default());
        let config = GatewayConfig {
            auto_import_dangled: policy,
            dangling_timeout: timeout,
            format: DocumentContentType::Json,
            global_state_history: false,
        };
        let dangling = DanglingIndices::new(env.clone(), format, &config, allocator.clone());
        (env, dangling, allocator)
    }

    fn write_index(env: &NodeEnvironment, dir_name: &str, stored: IndexMetaData, shards: &[u32]) {
        let format: MetaStateFormat<IndexMetaData> =
            MetaStateFormat::new(DocumentContentType::Json, INDEX_STATE_FILE_PREFIX);
        let version = stored.version;
        format.write(&stored, version, &env.index_paths(dir_name), false).unwrap();
        for shard in shards {
            fs::create_dir_all(env.index_paths(dir_name)[0].join(shard.to_string())).unwrap();
        }
    }

    fn state_with(indices: &[&str]) -> ClusterState {
        let metadata = indices
            .iter()
            .fold(MetaData::new("uuid"), |m, name| m.put(IndexMetaData::new(*name)));
        ClusterState::builder("test").version(1).metadata(metadata).build()
    }

    #[test]
    fn test_disabled_by_negative_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (env, dangling, _) = setup(dir.path(), AutoImportDangled::No, None);
        write_index(&env, "lost", IndexMetaData::new("lost"), &[0]);

        assert!(dangling.reconcile(&state_with(&[])).is_empty());
        assert!(dangling.is_empty());
    }

    #[test]
    fn test_index_without_shards_deleted_now() {
        let dir = tempfile::tempdir().unwrap();
        let (env, dangling, _) = setup(dir.path(), AutoImportDangled::Yes, Some(Duration::from_secs(60)));
        write_index(&env, "empty", IndexMetaData::new("empty"), &[]);

        let report = dangling.reconcile(&state_with(&[]));
        assert_eq!(report.deleted, vec!["empty".to_string()]);
        assert!(!env.index_paths("empty")[0].exists());
    }

    #[test]
    fn test_locked_shard_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (env, dangling, _) = setup(dir.path(), AutoImportDangled::No, Some(Duration::ZERO));
        write_index(&env, "busy", IndexMetaData::new("busy"), &[0]);
        let _lock = env.shard_lock(&crate::gateway::ShardId::new("busy", 0)).unwrap();

        let report = dangling.reconcile(&state_with(&[]));
        assert_eq!(report.skipped, vec!["busy".to_string()]);
        assert!(env.index_paths("busy")[0].exists());
        assert!(!dangling.contains("busy"));
    }

    #[test]
    fn test_zero_timeout_deletes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let (env, dangling, _) = setup(dir.path(), AutoImportDangled::No, Some(Duration::ZERO));
        write_index(&env, "lost", IndexMetaData::new("lost"), &[0, 1]);

        let report = dangling.reconcile(&state_with(&[]));
        assert_eq!(report.deleted, vec!["lost".to_string()]);
        assert!(!env.index_paths("lost")[0].exists());
    }

    #[test]
    fn test_known_and_metadata_less_indices_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (env, dangling, _) = setup(dir.path(), AutoImportDangled::No, Some(Duration::ZERO));
        write_index(&env, "known", IndexMetaData::new("known"), &[0]);
        fs::create_dir_all(env.index_paths("bare")[0].join("0")).unwrap();

        let report = dangling.reconcile(&state_with(&["known"]));
        assert_eq!(report.skipped, vec!["bare".to_string()]);
        assert!(report.deleted.is_empty());
        assert!(env.index_paths("known")[0].exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_deletion_fires_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let (env, dangling, _) = setup(dir.path(), AutoImportDangled::No, Some(Duration::from_secs(10)));
        write_index(&env, "lost", IndexMetaData::new("lost"), &[0]);

        let report = dangling.reconcile(&state_with(&[]));
        assert_eq!(report.scheduled, vec!["lost".to_string()]);
        assert!(dangling.contains("lost"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(env.index_paths("lost")[0].exists());

        tokio::time::sleep(Duration::from_secs(6)).await;
        for _ in 0..100 {
            if !dangling.contains("lost") && !env.index_paths("lost")[0].exists() {
                break;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(!dangling.contains("lost"));
        assert!(!env.index_paths("lost")[0].exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reappearing_index_cancels_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let (env, dangling, _) = setup(dir.path(), AutoImportDangled::No, Some(Duration::from_secs(10)));
        write_index(&env, "lost", IndexMetaData::new("lost"), &[0]);

        dangling.reconcile(&state_with(&[]));
        let report = dangling.reconcile(&state_with(&["lost"]));
        assert_eq!(report.cancelled, vec!["lost".to_string()]);
        assert!(!dangling.contains("lost"));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(env.index_paths("lost")[0].exists());
    }

    #[test]
    fn test_stale_timer_fire_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (env, dangling, _) = setup(dir.path(), AutoImportDangled::Yes, Some(Duration::from_secs(10)));
        write_index(&env, "lost", IndexMetaData::new("lost"), &[0]);

        dangling.reconcile(&state_with(&[]));
        assert!(dangling.contains("lost"));

        // A fire carrying an older generation must not touch the current record.
        dangling.inner.remove_expired("lost", 0);
        assert!(dangling.contains("lost"));
        assert!(env.index_paths("lost")[0].exists());
    }

    #[tokio::test]
    async fn test_auto_import_renames_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let (env, dangling, allocator) =
            setup(dir.path(), AutoImportDangled::Closed, Some(Duration::from_secs(60)));
        write_index(&env, "foo", IndexMetaData::new("foo-old").with_version(3), &[0]);

        let report = dangling.reconcile(&state_with(&[]));
        assert_eq!(report.imported, vec!["foo".to_string()]);
        assert!(report.scheduled.is_empty());

        for _ in 0..100 {
            if !allocator.batches.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let batches = allocator.batches.lock();
        assert_eq!(batches.len(), 1);
        let imported = &batches[0][0];
        assert_eq!(imported.index, "foo");
        assert_eq!(imported.version, 3);
        assert_eq!(imported.state, IndexState::Close);
    }
}
