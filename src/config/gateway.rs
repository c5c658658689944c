//! Gateway catalogue: accepted equipment types, protocols, callback profiles.

use std::time::Duration;

use serde::Deserialize;

/// What connector nodes may register with and where uploads are forwarded.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Equipment type codes nodes may register for.
    pub equipment_types: Vec<i32>,
    /// Protocol codes nodes may speak.
    pub protocols: Vec<i32>,
    /// Callback domains uploads are forwarded to, by profile.
    pub profiles: Vec<CallbackProfile>,
    /// Known devices, seeding the device directory.
    pub devices: Vec<DeviceSeed>,
}

/// Callback domain (scheme + host) of one profile.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackProfile {
    pub id: i32,
    pub domain: String,
}

/// One registered device.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSeed {
    pub eq_type: i32,
    pub eq_id: String,
    pub profile: i32,
}

impl GatewayConfig {
    pub fn accepts_equipment_type(&self, eq_type: i32) -> bool {
        self.equipment_types.contains(&eq_type)
    }

    pub fn accepts_protocol(&self, protocol: i32) -> bool {
        self.protocols.contains(&protocol)
    }

    pub fn callback_domain(&self, profile: i32) -> Option<&str> {
        self.profiles
            .iter()
            .find(|p| p.id == profile)
            .map(|p| p.domain.as_str())
    }
}

/// Storage for node registrations and device sessions.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis URL. Unset keeps registries in memory.
    pub url: Option<String>,
    /// Node registrations expire after this many seconds without renewal.
    pub key_expire_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_expire_secs: 60,
        }
    }
}

/// Failed-upload backup writer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Failed uploads buffered before a batch write.
    pub batch_size: usize,
    /// Timeout of one forwarding POST.
    pub http_timeout_ms: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            http_timeout_ms: 10_000,
        }
    }
}

impl BackupConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}
