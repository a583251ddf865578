//! Configuration module for statesync.

use crate::error::{Result, SyncError};
use crate::gateway::DocumentContentType;
use crate::routing::HashFunction;
use crate::types::{NodeId, NodeRoles, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Main configuration for a statesync node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSyncConfig {
    /// Node identity and data paths.
    pub node: NodeConfig,
    /// Cluster-state publication.
    pub publish: PublishConfig,
    /// Local metadata persistence and dangling indices.
    pub gateway: GatewayConfig,
    /// Deprecated node-level settings consulted during upgrade only.
    pub legacy: LegacyConfig,
    /// Observability configuration.
    pub observability: ObservabilityConfig,
}

impl StateSyncConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| SyncError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.id.trim().is_empty() {
            return Err(SyncError::InvalidConfig {
                field: "node.id".to_string(),
                reason: "Node ID must not be empty".to_string(),
            });
        }

        if self.node.roles.persists_state() && self.node.data_paths.is_empty() {
            return Err(SyncError::InvalidConfig {
                field: "node.data_paths".to_string(),
                reason: "Master-eligible and data nodes require at least one data path".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal development configuration.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                id: "dev-node".to_string(),
                name: "dev-node".to_string(),
                roles: NodeRoles::master_and_data(),
                data_paths: vec![PathBuf::from("/tmp/statesync/data")],
                ..NodeConfig::default()
            },
            publish: PublishConfig {
                timeout: Duration::from_secs(1),
            },
            gateway: GatewayConfig {
                format: DocumentContentType::Json,
                ..GatewayConfig::default()
            },
            legacy: LegacyConfig::default(),
            observability: ObservabilityConfig {
                log_level: "debug".to_string(),
                json_logs: false,
            },
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique node identifier.
    pub id: NodeId,
    /// Human-readable node name.
    pub name: String,
    /// Address peers use to reach this node.
    pub address: String,
    pub roles: NodeRoles,
    /// Directories holding node state and index data.
    pub data_paths: Vec<PathBuf>,
    /// Wire-protocol version this node declares.
    pub version: Version,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "statesync-node".to_string(),
            name: "statesync-node".to_string(),
            address: "127.0.0.1:9300".to_string(),
            roles: NodeRoles::master_and_data(),
            data_paths: vec![PathBuf::from("/var/lib/statesync")],
            version: Version::CURRENT,
        }
    }
}

/// Cluster-state publication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// How long the coordinator waits for acks. Zero skips the wait.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

/// What to do with index directories that are missing from the cluster state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoImportDangled {
    /// Schedule deletion after the dangling timeout.
    #[serde(alias = "false")]
    No,
    /// Import the index as found.
    #[default]
    #[serde(alias = "true")]
    Yes,
    /// Import the index in the closed state.
    Closed,
}

impl AutoImportDangled {
    pub fn should_import(&self) -> bool {
        !matches!(self, AutoImportDangled::No)
    }

    pub fn import_closed(&self) -> bool {
        matches!(self, AutoImportDangled::Closed)
    }
}

impl fmt::Display for AutoImportDangled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutoImportDangled::No => write!(f, "no"),
            AutoImportDangled::Yes => write!(f, "yes"),
            AutoImportDangled::Closed => write!(f, "closed"),
        }
    }
}

impl FromStr for AutoImportDangled {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "no" | "false" => Ok(AutoImportDangled::No),
            "yes" | "true" => Ok(AutoImportDangled::Yes),
            "closed" => Ok(AutoImportDangled::Closed),
            _ => Err(SyncError::InvalidArgument(format!(
                "failed to parse auto import dangled state [{}]",
                s
            ))),
        }
    }
}

/// Local persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub auto_import_dangled: AutoImportDangled,
    /// `None` disables dangling detection. Zero deletes dangling indices immediately.
    #[serde(with = "signed_humantime_serde")]
    pub dangling_timeout: Option<Duration>,
    /// Content type of newly written state documents.
    pub format: DocumentContentType,
    /// Keep superseded global documents instead of pruning them.
    pub global_state_history: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            auto_import_dangled: AutoImportDangled::Yes,
            dangling_timeout: Some(Duration::from_secs(2 * 60 * 60)),
            format: DocumentContentType::MessagePack,
            global_state_history: false,
        }
    }
}

/// Node-level routing settings from before routing was recorded per index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyConfig {
    pub routing_hash_function: Option<HashFunction>,
    pub routing_use_type: Option<bool>,
}

impl LegacyConfig {
    /// Whether any deprecated setting was configured.
    pub fn is_configured(&self) -> bool {
        self.routing_hash_function.is_some() || self.routing_use_type.is_some()
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let (digits, unit_ms) = if let Some(v) = s.strip_suffix("ms") {
        (v, 1)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1_000)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, 60_000)
    } else if let Some(v) = s.strip_suffix('h') {
        (v, 3_600_000)
    } else if let Some(v) = s.strip_suffix('d') {
        (v, 86_400_000)
    } else {
        (s, 1)
    };
    digits
        .trim()
        .parse::<u64>()
        .map(|v| Duration::from_millis(v.saturating_mul(unit_ms)))
        .map_err(|e| format!("invalid duration [{}]: {}", s, e))
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Like [`humantime_serde`], but any negative value (`"-1"`, `"-1s"`) maps to `None`.
pub mod signed_humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_str(&format!("{}ms", d.as_millis())),
            None => serializer.serialize_str("-1"),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.trim_start().starts_with('-') {
            return Ok(None);
        }
        super::parse_duration(&s)
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}
