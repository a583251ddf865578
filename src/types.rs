//! Core type definitions shared by the publication and persistence layers.
//!
//! # Key Types
//!
//! - [`Version`]: wire-protocol and index-format version, ordered by id
//! - [`DiscoveryNode`]: identity of a cluster member (equality by id)
//! - [`DiscoveryNodes`]: membership set plus local and master node ids
//! - [`Settings`]: ordered string settings with typed getters
//!
//! # Examples
//!
//! ```rust
//! use statesync::types::{DiscoveryNode, NodeRoles, Version};
//!
//! let a = DiscoveryNode::new("node-a", "10.0.0.1:9300", Version::CURRENT, NodeRoles::master_and_data());
//! let b = DiscoveryNode::new("node-a", "10.0.0.9:9300", Version::V_1_4_0, NodeRoles::data_only());
//! // Nodes are equal when their ids match.
//! assert_eq!(a, b);
//! assert!(Version::V_1_4_0.before(Version::V_2_0_0));
//! ```

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Version of the wire protocol and of on-disk index formats.
///
/// Encoded as `major * 1_000_000 + minor * 10_000 + revision * 100 + 99`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version(u32);

impl Version {
    pub const V_0_90_0: Version = Version(90_099);
    pub const V_1_0_0: Version = Version(1_000_099);
    pub const V_1_4_0: Version = Version(1_040_099);
    pub const V_2_0_0: Version = Version(2_000_099);

    /// The version this build speaks.
    pub const CURRENT: Version = Version::V_2_0_0;

    /// Oldest peer version a cluster state can still be encoded for.
    pub const MINIMUM_WIRE_COMPATIBLE: Version = Version::V_1_0_0;

    pub const fn from_id(id: u32) -> Self {
        Version(id)
    }

    pub const fn id(&self) -> u32 {
        self.0
    }

    pub const fn major(&self) -> u32 {
        self.0 / 1_000_000
    }

    pub const fn minor(&self) -> u32 {
        (self.0 / 10_000) % 100
    }

    pub const fn revision(&self) -> u32 {
        (self.0 / 100) % 100
    }

    pub fn before(&self, other: Version) -> bool {
        self.0 < other.0
    }

    pub fn on_or_after(&self, other: Version) -> bool {
        self.0 >= other.0
    }

    /// Whether a state can be encoded for a peer at this version.
    pub fn is_wire_compatible(&self) -> bool {
        self.on_or_after(Version::MINIMUM_WIRE_COMPATIBLE)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.revision())
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self)
    }
}

impl FromStr for Version {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            // Raw ids are accepted too, that is how index settings record them.
            return s
                .trim()
                .parse::<u32>()
                .map(Version)
                .map_err(|_| SyncError::InvalidArgument(format!("invalid version [{}]", s)));
        }
        let invalid = || SyncError::InvalidArgument(format!("invalid version [{}]", s));
        let mut nums = [0u32; 3];
        for (slot, part) in nums.iter_mut().zip(parts) {
            *slot = part.parse().map_err(|_| invalid())?;
        }
        // Minor and revision each own two decimal digits of the id.
        if nums[1] > 99 || nums[2] > 99 {
            return Err(invalid());
        }
        nums[0]
            .checked_mul(1_000_000)
            .and_then(|id| id.checked_add(nums[1] * 10_000 + nums[2] * 100 + 99))
            .map(Version)
            .ok_or_else(invalid)
    }
}

/// Roles a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeRoles {
    /// Eligible to coordinate (publish cluster state).
    pub master: bool,
    /// Holds index data on local disk.
    pub data: bool,
}

impl NodeRoles {
    pub fn master_and_data() -> Self {
        Self {
            master: true,
            data: true,
        }
    }

    pub fn master_only() -> Self {
        Self {
            master: true,
            data: false,
        }
    }

    pub fn data_only() -> Self {
        Self {
            master: false,
            data: true,
        }
    }

    pub fn client() -> Self {
        Self::default()
    }

    pub fn is_master_eligible(&self) -> bool {
        self.master
    }

    pub fn is_data(&self) -> bool {
        self.data
    }

    /// Nodes that keep a node-level data directory write state documents.
    pub fn persists_state(&self) -> bool {
        self.master || self.data
    }
}

/// Identity of a cluster member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryNode {
    pub id: NodeId,
    pub name: String,
    pub address: String,
    /// Wire-protocol version the node declares.
    pub version: Version,
    pub roles: NodeRoles,
}

impl DiscoveryNode {
    pub fn new(
        id: impl Into<NodeId>,
        address: impl Into<String>,
        version: Version,
        roles: NodeRoles,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            address: address.into(),
            version,
            roles,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl PartialEq for DiscoveryNode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for DiscoveryNode {}

impl Hash for DiscoveryNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for DiscoveryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}][{}]", self.name, self.id, self.address)
    }
}

/// Cluster membership as seen by one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryNodes {
    nodes: BTreeMap<NodeId, DiscoveryNode>,
    local_node_id: Option<NodeId>,
    master_node_id: Option<NodeId>,
}

impl DiscoveryNodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, node: DiscoveryNode) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    pub fn remove(mut self, id: &str) -> Self {
        self.nodes.remove(id);
        self
    }

    pub fn local_node_id(mut self, id: impl Into<NodeId>) -> Self {
        self.local_node_id = Some(id.into());
        self
    }

    pub fn master_node_id(mut self, id: impl Into<NodeId>) -> Self {
        self.master_node_id = Some(id.into());
        self
    }

    /// Replace the local node id; used when a received state is adopted.
    pub(crate) fn set_local_node_id(&mut self, id: Option<NodeId>) {
        self.local_node_id = id;
    }

    pub fn get(&self, id: &str) -> Option<&DiscoveryNode> {
        self.nodes.get(id)
    }

    pub fn local_node(&self) -> Option<&DiscoveryNode> {
        self.local_node_id.as_ref().and_then(|id| self.nodes.get(id))
    }

    pub fn local_id(&self) -> Option<&NodeId> {
        self.local_node_id.as_ref()
    }

    pub fn master_node(&self) -> Option<&DiscoveryNode> {
        self.master_node_id.as_ref().and_then(|id| self.nodes.get(id))
    }

    pub fn master_id(&self) -> Option<&NodeId> {
        self.master_node_id.as_ref()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values()
    }

    /// Every member except the local node.
    pub fn peers(&self) -> impl Iterator<Item = &DiscoveryNode> {
        let local = self.local_node_id.clone();
        self.nodes
            .values()
            .filter(move |n| Some(&n.id) != local.as_ref())
    }
}

/// Ordered string settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(BTreeMap<String, String>);

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get_as_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None => Ok(None),
            Some("true") | Some("on") | Some("yes") | Some("1") => Ok(Some(true)),
            Some("false") | Some("off") | Some("no") | Some("0") => Ok(Some(false)),
            Some(other) => Err(SyncError::InvalidArgument(format!(
                "setting [{}] has non-boolean value [{}]",
                key, other
            ))),
        }
    }

    pub fn get_as_u32(&self, key: &str) -> Result<Option<u32>> {
        self.get(key)
            .map(|v| {
                v.parse().map_err(|_| {
                    SyncError::InvalidArgument(format!(
                        "setting [{}] has non-numeric value [{}]",
                        key, v
                    ))
                })
            })
            .transpose()
    }

    pub fn get_as_version(&self, key: &str) -> Result<Option<Version>> {
        self.get(key).map(str::parse).transpose()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl FromIterator<(String, String)> for Settings {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Settings(iter.into_iter().collect())
    }
}
