//! Redis registries.
//!
//! Key layout:
//! - node registrations: one string key per node id, JSON value, `EX` ttl
//! - device sessions: hash `device:session`, field = device unique id
//! - failed uploads: hash `http_backup`, field = serial number

use std::time::Duration;

use ::redis::{aio::ConnectionManager, AsyncCommands, Client};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{
    BackupStore, FailedUpload, NodeEntry, NodeRegistry, Result, SessionEntry, SessionStore,
    BACKUP_MAP, SESSION_MAP,
};

/// Open a managed connection shared by the Redis registries.
///
/// The manager reconnects on its own; each call clones it, so a handle
/// never outlives the command that used it.
pub async fn connect(url: &str) -> Result<ConnectionManager> {
    let client = Client::open(url)?;
    let conn = ConnectionManager::new(client).await?;
    info!("Connected to Redis");
    Ok(conn)
}

pub struct RedisNodeRegistry {
    conn: ConnectionManager,
}

impl RedisNodeRegistry {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl NodeRegistry for RedisNodeRegistry {
    async fn register(&self, entry: &NodeEntry, ttl: Duration) -> Result<bool> {
        let value = serde_json::to_string(entry)?;
        let mut conn = self.conn.clone();

        // SET key value NX EX ttl: nil when the key already exists
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(&entry.node_id)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        debug!(node_id = %entry.node_id, stored = reply.is_some(), "Node registration");
        Ok(reply.is_some())
    }

    async fn is_registered(&self, node_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(node_id).await?;
        Ok(exists)
    }
}

pub struct RedisSessionStore {
    conn: ConnectionManager,
}

impl RedisSessionStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn open(&self, unique_id: &str, entry: &SessionEntry) -> Result<bool> {
        let value = serde_json::to_string(entry)?;
        let mut conn = self.conn.clone();
        let created: bool = conn.hset_nx(SESSION_MAP, unique_id, value).await?;
        Ok(created)
    }

    async fn get(&self, unique_id: &str) -> Result<Option<SessionEntry>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(SESSION_MAP, unique_id).await?;
        match value {
            Some(json) if !json.is_empty() => Ok(Some(serde_json::from_str(&json)?)),
            _ => Ok(None),
        }
    }
}

pub struct RedisBackupStore {
    conn: ConnectionManager,
}

impl RedisBackupStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl BackupStore for RedisBackupStore {
    async fn write_batch(&self, uploads: Vec<FailedUpload>) -> Result<()> {
        if uploads.is_empty() {
            return Ok(());
        }
        let mut fields = Vec::with_capacity(uploads.len());
        for upload in &uploads {
            fields.push((upload.serial_number.clone(), serde_json::to_string(upload)?));
        }

        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(BACKUP_MAP, &fields).await?;
        info!(count = fields.len(), "Persisted failed uploads");
        Ok(())
    }

    async fn remove(&self, serial_number: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.hdel(BACKUP_MAP, serial_number).await?;
        Ok(removed > 0)
    }
}
