//! Configuration for the gateway dispatcher.
//!
//! Loaded with the `config` crate from YAML files and `DISPATCHER__*`
//! environment overrides. Every section has working defaults.

mod broker;
mod dispatch;
mod gateway;

pub use broker::{BrokerConfig, DEFAULT_RECONNECT_INTERVAL_MS, MIN_CONSUMER_COUNT};
pub use dispatch::DispatchConfig;
pub use gateway::{BackupConfig, CallbackProfile, DeviceSeed, GatewayConfig, RedisConfig};

use serde::Deserialize;

/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "DISPATCHER_CONFIG";
/// Prefix of environment overrides, e.g. `DISPATCHER__BROKER__HOST`.
pub const CONFIG_ENV_PREFIX: &str = "DISPATCHER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "DISPATCHER_LOG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub dispatch: DispatchConfig,
    pub redis: RedisConfig,
    pub gateway: GatewayConfig,
    pub backup: BackupConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.consumer_count < MIN_CONSUMER_COUNT {
            return Err(ConfigError::Invalid(format!(
                "broker.consumer_count must be at least {}, got {}",
                MIN_CONSUMER_COUNT, self.broker.consumer_count
            )));
        }
        if self.broker.reconnect_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "broker.reconnect_interval_ms must be positive".to_string(),
            ));
        }
        if self.broker.max_connect_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "broker.max_connect_attempts must be positive when set".to_string(),
            ));
        }
        if self.dispatch.dispatcher_id.is_empty() {
            return Err(ConfigError::Invalid(
                "dispatch.dispatcher_id must not be empty".to_string(),
            ));
        }
        let capacities = [
            ("dispatch.ingress_capacity", self.dispatch.ingress_capacity),
            ("dispatch.outbound_capacity", self.dispatch.outbound_capacity),
            ("backup.batch_size", self.backup.batch_size),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        let timeouts = [
            ("dispatch.sync_timeout_ms", self.dispatch.sync_timeout_ms),
            ("backup.http_timeout_ms", self.backup.http_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.broker.consumer_count, 2);
        assert_eq!(config.broker.reconnect_interval_ms, 5_000);
        assert_eq!(config.dispatch.outbound_capacity, 100);
        assert_eq!(config.dispatch.dispatch_threads, 1);
        assert_eq!(config.redis.key_expire_secs, 60);
        assert!(config.redis.url.is_none());
        assert_eq!(config.backup.batch_size, 100);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
broker:
  host: rabbit.internal
dispatch:
  dispatcher_id: dispatcher-7
  sync_reply_types: [42]
gateway:
  equipment_types: [7, 8]
  protocols: [1]
  profiles:
    - id: 3
      domain: http://profile.internal
  devices:
    - eq_type: 7
      eq_id: dev-1
      profile: 3
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.broker.host, "rabbit.internal");
        assert_eq!(config.broker.port, 5672);
        assert_eq!(config.dispatch.dispatcher_id, "dispatcher-7");
        assert_eq!(config.dispatch.sync_reply_types, vec![42]);
        assert!(config.gateway.accepts_equipment_type(8));
        assert!(!config.gateway.accepts_protocol(2));
        assert_eq!(
            config.gateway.callback_domain(3),
            Some("http://profile.internal")
        );
        assert_eq!(config.gateway.devices[0].eq_id, "dev-1");
    }

    #[test]
    fn test_single_consumer_is_rejected() {
        let mut config = Config::for_test();
        config.broker.consumer_count = 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let mut config = Config::for_test();
        config.dispatch.outbound_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dispatch.outbound_capacity"));
    }

    #[test]
    #[serial]
    fn test_load_file_then_env_override() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(
            file,
            "broker:\n  host: from-file\n  port: 5673\ndispatch:\n  dispatcher_id: from-file"
        )
        .unwrap();

        std::env::set_var("DISPATCHER__DISPATCH__DISPATCHER_ID", "from-env");
        let loaded = Config::load(file.path().to_str());
        std::env::remove_var("DISPATCHER__DISPATCH__DISPATCHER_ID");

        let config = loaded.unwrap();
        assert_eq!(config.broker.host, "from-file");
        assert_eq!(config.broker.port, 5673);
        assert_eq!(config.dispatch.dispatcher_id, "from-env");
    }

    #[test]
    #[serial]
    fn test_load_missing_explicit_file_fails() {
        let err = Config::load(Some("/nonexistent/dispatcher.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)));
    }
}
