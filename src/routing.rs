//! Legacy routing hash function names.
//!
//! Indices created before 2.0 routed documents with a node-level hash
//! function. During upgrade its name is recorded per index so routing
//! stays stable after the node-level setting is removed.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hash function used to route a document id to a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HashFunction {
    /// Daniel J. Bernstein's string hash.
    #[default]
    Djb,
    /// Java-style `String` hash code.
    Simple,
}

impl HashFunction {
    pub fn name(&self) -> &'static str {
        match self {
            HashFunction::Djb => "Djb",
            HashFunction::Simple => "Simple",
        }
    }
}

impl fmt::Display for HashFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashFunction {
    type Err = SyncError;

    /// Accepts short names and the class-style names older nodes recorded.
    fn from_str(s: &str) -> Result<Self> {
        let short = s.rsplit('.').next().unwrap_or(s);
        let short = short.strip_suffix("HashFunction").unwrap_or(short);
        match short.to_ascii_lowercase().as_str() {
            "djb" => Ok(HashFunction::Djb),
            "simple" => Ok(HashFunction::Simple),
            _ => Err(SyncError::InvalidArgument(format!(
                "unknown routing hash function [{}]",
                s
            ))),
        }
    }
}

impl TryFrom<String> for HashFunction {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<HashFunction> for String {
    fn from(value: HashFunction) -> Self {
        value.name().to_string()
    }
}
