//! Broker connection configuration.

use std::time::Duration;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;

/// Default fixed interval between connection attempts.
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5_000;

/// Minimum number of inbound consumers.
pub const MIN_CONSUMER_COUNT: usize = 2;

/// Everything but RFC 3986 unreserved characters is escaped.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// RabbitMQ connection and topology.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Virtual host. Empty means "/".
    pub virtual_host: String,
    /// Direct exchange that outbound device queues are bound to.
    pub exchange: String,
    /// Well-known queue connector nodes publish to.
    pub inbound_queue: String,
    /// Parallel consumers on the inbound queue.
    pub consumer_count: usize,
    /// Fixed delay between connection attempts.
    pub reconnect_interval_ms: u64,
    /// Give up connecting after this many attempts. Unset retries forever.
    pub max_connect_attempts: Option<usize>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
            exchange: "gateway.exchange".to_string(),
            inbound_queue: "dispatcher.upstream".to_string(),
            consumer_count: MIN_CONSUMER_COUNT,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            max_connect_attempts: None,
        }
    }
}

impl BrokerConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    fn vhost(&self) -> &str {
        if self.virtual_host.is_empty() {
            "/"
        } else {
            &self.virtual_host
        }
    }

    /// AMQP URI with percent-encoded credentials and vhost.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            encode_component(&self.username),
            encode_component(&self.password),
            self.host,
            self.port,
            encode_component(self.vhost())
        )
    }

    /// URI safe for logs (no password).
    pub fn redacted_uri(&self) -> String {
        format!(
            "amqp://{}@{}:{}/{}",
            encode_component(&self.username),
            self.host,
            self.port,
            encode_component(self.vhost())
        )
    }
}

fn encode_component(raw: &str) -> String {
    utf8_percent_encode(raw, URI_COMPONENT).to_string()
}
