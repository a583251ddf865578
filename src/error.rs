//! Error types for cluster-state publication and local persistence.
//!
//! This module provides a unified error type [`SyncError`] for all operations,
//! along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Transport**: a single peer could not be reached or rejected the state
//! - **Codec**: a state could not be encoded for, or decoded from, a wire version
//! - **Persistence**: a metadata document could not be written or read
//! - **Locking**: shard directories are held by in-flight shard activity
//! - **Startup**: fatal conditions that must abort the node before it joins
//!
//! # Example
//!
//! ```rust
//! use statesync::error::{Result, SyncError};
//!
//! fn check_index_name(name: &str) -> Result<()> {
//!     if name.is_empty() {
//!         return Err(SyncError::InvalidArgument("index name cannot be empty".into()));
//!     }
//!     Ok(())
//! }
//!
//! let err = check_index_name("").unwrap_err();
//! assert!(!err.is_fatal());
//! ```

use crate::types::Version;
use std::io;
use thiserror::Error;

/// Main error type for state synchronization.
#[derive(Error, Debug)]
pub enum SyncError {
    // Transport errors
    #[error("Transport error sending to [{node}]: {reason}")]
    Transport { node: String, reason: String },

    #[error("Node disconnected: {0}")]
    NodeDisconnected(String),

    #[error("Remote node failed to apply state: {0}")]
    RemoteApply(String),

    // Codec errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Wire version {requested} is not compatible (minimum {minimum})")]
    IncompatibleVersion { requested: Version, minimum: Version },

    // Persistence errors
    #[error("Failed to persist {what}: {reason}")]
    Persistence { what: String, reason: String },

    #[error("Corrupted state file {path}: {reason}")]
    CorruptedState { path: String, reason: String },

    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Atomic move not supported on {0}")]
    AtomicMoveUnsupported(String),

    // Locking
    #[error("Shard [{index}][{shard}] is locked")]
    ShardLocked { index: String, shard: u32 },

    // Fatal startup errors
    #[error("Detected pre-0.19 metadata file, upgrade state structures first - metadata found: [{0}]")]
    IncompatibleStateFormat(String),

    #[error("Index [{index}] created on or after {threshold} must not carry legacy routing settings [{settings}]")]
    CorruptedLegacySettings {
        index: String,
        threshold: Version,
        settings: String,
    },

    // Applier errors
    #[error("Cluster state applier is shut down")]
    ApplierClosed,

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Fatal errors abort node startup instead of being logged and retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::IncompatibleStateFormat(_)
                | SyncError::CorruptedLegacySettings { .. }
                | SyncError::AtomicMoveUnsupported(_)
                | SyncError::InvalidConfig { .. }
        )
    }

    /// Check if the operation may succeed on the next state change.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport { .. }
                | SyncError::NodeDisconnected(_)
                | SyncError::ShardLocked { .. }
                | SyncError::Persistence { .. }
                | SyncError::Io(_)
        )
    }

    pub(crate) fn persistence(what: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        SyncError::Persistence {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<bincode::Error> for SyncError {
    fn from(e: bincode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

impl From<lz4_flex::block::DecompressError> for SyncError {
    fn from(e: lz4_flex::block::DecompressError) -> Self {
        SyncError::Compression(e.to_string())
    }
}

/// Result type alias for state synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;
