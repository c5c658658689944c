//! In-memory registries.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::{
    unique_id, BackupStore, DeviceDirectory, DeviceRecord, FailedUpload, NodeEntry, NodeRegistry,
    Result, SessionEntry, SessionStore,
};
use crate::config::DeviceSeed;

/// Node registry with per-entry expiry.
#[derive(Default)]
pub struct MemoryNodeRegistry {
    nodes: RwLock<HashMap<String, (NodeEntry, Instant)>>,
}

impl MemoryNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeRegistry for MemoryNodeRegistry {
    async fn register(&self, entry: &NodeEntry, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut nodes = self.nodes.write().await;
        if let Some((_, expires_at)) = nodes.get(&entry.node_id) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        nodes.insert(entry.node_id.clone(), (entry.clone(), now + ttl));
        Ok(true)
    }

    async fn is_registered(&self, node_id: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .nodes
            .read()
            .await
            .get(node_id)
            .is_some_and(|(_, expires_at)| *expires_at > now))
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn open(&self, unique_id: &str, entry: &SessionEntry) -> Result<bool> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(unique_id) {
            return Ok(false);
        }
        sessions.insert(unique_id.to_string(), entry.clone());
        Ok(true)
    }

    async fn get(&self, unique_id: &str) -> Result<Option<SessionEntry>> {
        Ok(self.sessions.read().await.get(unique_id).cloned())
    }
}

/// Device directory seeded from configuration.
#[derive(Default)]
pub struct ConfigDeviceDirectory {
    devices: HashMap<String, DeviceRecord>,
}

impl ConfigDeviceDirectory {
    pub fn new(seeds: &[DeviceSeed]) -> Self {
        let devices = seeds
            .iter()
            .map(|seed| {
                let id = unique_id(seed.eq_type, &seed.eq_id);
                let record = DeviceRecord {
                    unique_id: id.clone(),
                    eq_type: seed.eq_type,
                    eq_id: seed.eq_id.clone(),
                    profile: seed.profile,
                };
                (id, record)
            })
            .collect();
        Self { devices }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[async_trait]
impl DeviceDirectory for ConfigDeviceDirectory {
    async fn find(&self, unique_id: &str) -> Result<Option<DeviceRecord>> {
        Ok(self.devices.get(unique_id).cloned())
    }
}

/// Backup store that keeps failed uploads in memory.
#[derive(Default)]
pub struct MemoryBackupStore {
    uploads: RwLock<HashMap<String, FailedUpload>>,
}

impl MemoryBackupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, serial_number: &str) -> Option<FailedUpload> {
        self.uploads.read().await.get(serial_number).cloned()
    }

    pub async fn len(&self) -> usize {
        self.uploads.read().await.len()
    }
}

#[async_trait]
impl BackupStore for MemoryBackupStore {
    async fn write_batch(&self, uploads: Vec<FailedUpload>) -> Result<()> {
        let mut stored = self.uploads.write().await;
        for upload in uploads {
            stored.insert(upload.serial_number.clone(), upload);
        }
        Ok(())
    }

    async fn remove(&self, serial_number: &str) -> Result<bool> {
        Ok(self.uploads.write().await.remove(serial_number).is_some())
    }
}
