//! Node data directories and shard locks.

use super::format::STATE_DIR_NAME;
use crate::error::{Result, SyncError};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Directory under each data path holding one directory per index.
pub const INDICES_DIR_NAME: &str = "indices";

const ATOMIC_MOVE_CHECK_FILE: &str = ".atomic_move_check";

/// A shard of an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId {
    pub index: String,
    pub id: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, id: u32) -> Self {
        Self {
            index: index.into(),
            id,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.id)
    }
}

type LockTable = Arc<Mutex<HashSet<ShardId>>>;

/// Exclusive hold on a shard's directories. Released on drop.
#[derive(Debug)]
pub struct ShardLock {
    shard: ShardId,
    table: LockTable,
}

impl ShardLock {
    pub fn shard(&self) -> &ShardId {
        &self.shard
    }
}

impl Drop for ShardLock {
    fn drop(&mut self) {
        self.table.lock().remove(&self.shard);
        trace!(shard = %self.shard, "Released shard lock");
    }
}

/// The data paths of one node.
#[derive(Debug)]
pub struct NodeEnvironment {
    data_paths: Vec<PathBuf>,
    locks: LockTable,
}

impl NodeEnvironment {
    /// Open (creating when missing) the given data paths.
    pub fn open(data_paths: &[PathBuf]) -> Result<Self> {
        for path in data_paths {
            fs::create_dir_all(path.join(INDICES_DIR_NAME))?;
        }
        Ok(Self {
            data_paths: data_paths.to_vec(),
            locks: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Use existing data paths without creating anything.
    pub fn read_only(data_paths: &[PathBuf]) -> Self {
        Self {
            data_paths: data_paths.to_vec(),
            locks: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Whether this node keeps anything on disk.
    pub fn has_node_file(&self) -> bool {
        !self.data_paths.is_empty()
    }

    pub fn node_data_paths(&self) -> &[PathBuf] {
        &self.data_paths
    }

    /// `<data_path>/indices/<index>` on every data path.
    pub fn index_paths(&self, index: &str) -> Vec<PathBuf> {
        self.data_paths
            .iter()
            .map(|p| p.join(INDICES_DIR_NAME).join(index))
            .collect()
    }

    /// Names of every index with a directory on any data path.
    pub fn find_all_indices(&self) -> Result<BTreeSet<String>> {
        let mut indices = BTreeSet::new();
        for path in &self.data_paths {
            let dir = path.join(INDICES_DIR_NAME);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        indices.insert(name.to_string());
                    }
                }
            }
        }
        Ok(indices)
    }

    /// Ids of the shard directories of `index` on any data path.
    pub fn find_shards(&self, index: &str) -> Result<BTreeSet<u32>> {
        let mut shards = BTreeSet::new();
        for dir in self.index_paths(index) {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                if let Some(id) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                    shards.insert(id);
                }
            }
        }
        Ok(shards)
    }

    /// Try to take the lock for one shard without waiting.
    pub fn shard_lock(&self, shard: &ShardId) -> Result<ShardLock> {
        let mut locks = self.locks.lock();
        if !locks.insert(shard.clone()) {
            return Err(SyncError::ShardLocked {
                index: shard.index.clone(),
                shard: shard.id,
            });
        }
        trace!(shard = %shard, "Acquired shard lock");
        Ok(ShardLock {
            shard: shard.clone(),
            table: Arc::clone(&self.locks),
        })
    }

    /// Lock every shard of `index`. Empty when the index has no shard directories.
    ///
    /// All or nothing: on contention, locks taken so far are released.
    pub fn lock_all_for_index(&self, index: &str) -> Result<Vec<ShardLock>> {
        let shards = self.find_shards(index)?;
        let mut held = Vec::with_capacity(shards.len());
        for id in shards {
            held.push(self.shard_lock(&ShardId::new(index, id))?);
        }
        Ok(held)
    }

    /// Delete every directory of `index` once all of its shards are locked.
    pub fn delete_index_directory_safe(&self, index: &str) -> Result<()> {
        let locks = self.lock_all_for_index(index)?;
        for dir in self.index_paths(index) {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        debug!(index = %index, shards = locks.len(), "Deleted index directory");
        Ok(())
    }

    /// Verify every data path supports renaming a file over another atomically.
    pub fn ensure_atomic_move_supported(&self) -> Result<()> {
        for path in &self.data_paths {
            check_atomic_move(path)
                .map_err(|e| SyncError::AtomicMoveUnsupported(format!("{}: {}", path.display(), e)))?;
        }
        Ok(())
    }

    /// `_state` directories of the node itself, one per data path.
    pub fn node_state_dirs(&self) -> Vec<PathBuf> {
        self.data_paths.iter().map(|p| p.join(STATE_DIR_NAME)).collect()
    }
}

fn check_atomic_move(dir: &Path) -> std::io::Result<()> {
    let src = dir.join(format!("{}.tmp", ATOMIC_MOVE_CHECK_FILE));
    let dst = dir.join(ATOMIC_MOVE_CHECK_FILE);
    {
        let mut file = File::create(&src)?;
        file.write_all(b"check")?;
        file.sync_all()?;
    }
    fs::write(&dst, b"previous")?;
    let result = fs::rename(&src, &dst);
    let _ = fs::remove_file(&src);
    let _ = fs::remove_file(&dst);
    result
}
