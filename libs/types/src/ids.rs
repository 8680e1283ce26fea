//! Identifier types for streams and cached collections
//!
//! Stream identifiers use UUID v7 so that log lines for successive fetches
//! under the same key sort chronologically.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for one registered stream
///
/// A new id is minted every time a key is (re-)registered, which lets a
/// finishing fetch tell its own registration apart from a successor's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(Uuid);

impl StreamId {
    /// Create a new StreamId with current timestamp
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create from existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sharing granularity of a cached store or collection
///
/// Some data is global (one instance per process), some is naturally
/// per-chain, and some is per-address on a chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ScopeKey {
    Singleton,
    Chain(String),
    Address { chain: String, address: String },
}

impl ScopeKey {
    pub fn chain(chain: impl Into<String>) -> Self {
        ScopeKey::Chain(chain.into())
    }

    /// Addresses are case-insensitive hex, so they are stored lowercased.
    pub fn address(chain: impl Into<String>, address: impl AsRef<str>) -> Self {
        ScopeKey::Address {
            chain: chain.into(),
            address: address.as_ref().to_lowercase(),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Singleton => write!(f, "singleton"),
            ScopeKey::Chain(chain) => write!(f, "{}", chain),
            ScopeKey::Address { chain, address } => write!(f, "{}_{}", chain, address),
        }
    }
}
