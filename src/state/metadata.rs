//! Global and per-index metadata.

use crate::error::Result;
use crate::types::{Settings, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Setting recording the version an index was created with.
pub const SETTING_VERSION_CREATED: &str = "index.version.created";
/// Number of primary shards.
pub const SETTING_NUMBER_OF_SHARDS: &str = "index.number_of_shards";
/// Routing hash function carried over from the deprecated node-level setting.
pub const SETTING_LEGACY_ROUTING_HASH_FUNCTION: &str = "index.legacy.routing.hash.type";
/// Whether routing included the document type, carried over from the node-level setting.
pub const SETTING_LEGACY_ROUTING_USE_TYPE: &str = "index.legacy.routing.use_type";

/// Lifecycle state of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    #[default]
    Open,
    Close,
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexState::Open => write!(f, "open"),
            IndexState::Close => write!(f, "close"),
        }
    }
}

/// Metadata for a single index.
///
/// Versioned independently of the cluster-wide [`MetaData`] so only indices
/// whose version moved are rewritten to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetaData {
    pub index: String,
    pub version: u64,
    #[serde(default)]
    pub state: IndexState,
    #[serde(default)]
    pub settings: Settings,
    /// Mapping sources keyed by type name.
    #[serde(default)]
    pub mappings: BTreeMap<String, String>,
}

impl IndexMetaData {
    /// Create a new open index at version 1, created with the current version.
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            version: 1,
            state: IndexState::Open,
            settings: Settings::new().with(SETTING_VERSION_CREATED, Version::CURRENT.id()),
            mappings: BTreeMap::new(),
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_state(mut self, state: IndexState) -> Self {
        self.state = state;
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.settings.put(key, value);
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_mapping(mut self, doc_type: impl Into<String>, source: impl Into<String>) -> Self {
        self.mappings.insert(doc_type.into(), source.into());
        self
    }

    /// Rename the index, keeping everything else.
    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = index.into();
        self
    }

    /// Version the index was created with. Indices without the setting predate it.
    pub fn creation_version(&self) -> Result<Version> {
        Ok(self
            .settings
            .get_as_version(SETTING_VERSION_CREATED)?
            .unwrap_or(Version::V_0_90_0))
    }

    pub fn number_of_shards(&self) -> Result<Option<u32>> {
        self.settings.get_as_u32(SETTING_NUMBER_OF_SHARDS)
    }

    pub fn is_open(&self) -> bool {
        self.state == IndexState::Open
    }
}

/// Cluster-wide metadata: global settings plus every index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaData {
    pub version: u64,
    pub cluster_uuid: String,
    #[serde(default)]
    pub persistent_settings: Settings,
    /// Never written to disk.
    #[serde(default)]
    pub transient_settings: Settings,
    #[serde(default)]
    pub indices: BTreeMap<String, IndexMetaData>,
}

impl MetaData {
    pub fn new(cluster_uuid: impl Into<String>) -> Self {
        Self {
            cluster_uuid: cluster_uuid.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_persistent_setting(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.persistent_settings.put(key, value);
        self
    }

    pub fn with_transient_setting(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.transient_settings.put(key, value);
        self
    }

    /// Insert or replace an index.
    pub fn put(mut self, index: IndexMetaData) -> Self {
        self.indices.insert(index.index.clone(), index);
        self
    }

    pub fn remove(mut self, index: &str) -> Self {
        self.indices.remove(index);
        self
    }

    pub fn index(&self, name: &str) -> Option<&IndexMetaData> {
        self.indices.get(name)
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexMetaData> {
        self.indices.values()
    }

    /// Names of indices in `self` that `other` no longer has.
    pub fn indices_missing_from<'a>(&'a self, other: &'a MetaData) -> impl Iterator<Item = &'a str> {
        self.indices
            .keys()
            .map(String::as_str)
            .filter(move |name| !other.has_index(name))
    }

    pub fn index_names(&self) -> Vec<&str> {
        self.indices.keys().map(String::as_str).collect()
    }

    /// Compare the global portion only, ignoring indices and transient settings.
    pub fn is_global_state_equal(a: &MetaData, b: &MetaData) -> bool {
        a.cluster_uuid == b.cluster_uuid && a.persistent_settings == b.persistent_settings
    }
}
