//! Storage behind the business handlers.
//!
//! This module contains:
//! - `NodeRegistry`: connector nodes registered with the cluster
//! - `SessionStore`: devices currently logged in, and through which node
//! - `DeviceDirectory`: devices known to the gateway
//! - `BackupStore`: uploads that could not be forwarded
//!
//! Implementations:
//! - in-memory (`memory`), used without Redis and in tests
//! - Redis (`redis`, feature `redis`)

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::{ConfigDeviceDirectory, MemoryBackupStore, MemoryNodeRegistry, MemorySessionStore};
#[cfg(feature = "redis")]
pub use self::redis::{RedisBackupStore, RedisNodeRegistry, RedisSessionStore};

/// Hash holding one session per device, keyed by unique id.
pub const SESSION_MAP: &str = "device:session";
/// Hash holding failed uploads, keyed by serial number.
pub const BACKUP_MAP: &str = "http_backup";

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A registered connector node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEntry {
    pub node_id: String,
    pub eq_type: i32,
    pub protocol: i32,
}

/// A logged-in device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub eq_id: String,
    pub eq_type: i32,
    pub profile: i32,
    /// Connector node the device logged in through.
    pub node: String,
}

/// A device known to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub unique_id: String,
    pub eq_type: i32,
    pub eq_id: String,
    pub profile: i32,
}

/// An upload that could not be delivered to its callback domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedUpload {
    pub serial_number: String,
    pub url: String,
    pub body: String,
}

/// Device identity shared by the directory and the session store:
/// hex SHA-256 of the device type followed by the device id.
pub fn unique_id(eq_type: i32, eq_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(eq_type.to_string().as_bytes());
    hasher.update(eq_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Connector nodes registered with the cluster.
///
/// Entries expire unless renewed, so a node that stops sending heartbeats
/// drops out on its own.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// Register `entry` for `ttl`. Returns `false` if the node is already registered.
    async fn register(&self, entry: &NodeEntry, ttl: Duration) -> Result<bool>;

    async fn is_registered(&self, node_id: &str) -> Result<bool>;
}

/// Devices currently logged in.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store `entry` unless a session exists. Returns `true` on first login.
    async fn open(&self, unique_id: &str, entry: &SessionEntry) -> Result<bool>;

    async fn get(&self, unique_id: &str) -> Result<Option<SessionEntry>>;
}

/// Devices known to the gateway.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    async fn find(&self, unique_id: &str) -> Result<Option<DeviceRecord>>;
}

/// Persistent store of failed uploads.
#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn write_batch(&self, uploads: Vec<FailedUpload>) -> Result<()>;

    /// Remove the record for `serial_number`. Returns whether one existed.
    async fn remove(&self, serial_number: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_id_is_type_then_id() {
        assert_eq!(
            unique_id(7, "dev-1"),
            "8bc8b878948718c25901fdd2896cee2ce6cf98b82bcf55385a3ef8aa11f82e6d"
        );
        // Plain concatenation, no separator
        assert_eq!(unique_id(71, "dev"), unique_id(7, "1dev"));
    }

    #[test]
    fn test_session_entry_json_shape() {
        let entry = SessionEntry {
            eq_id: "dev-1".to_string(),
            eq_type: 7,
            profile: 3,
            node: "node-a".to_string(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["eqId"], "dev-1");
        assert_eq!(json["eqType"], 7);
        assert_eq!(json["node"], "node-a");
    }
}
