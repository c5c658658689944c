//! Dispatcher runtime configuration.

use std::time::Duration;

use serde::Deserialize;

/// Dispatcher identity, queue capacities and sync-call timeout.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Identity of this dispatcher instance in the cluster.
    pub dispatcher_id: String,
    /// Ingress queue capacity. Events beyond it are dropped.
    pub ingress_capacity: usize,
    /// Dispatch workers. Handlers assume serial invocation, so only 1 is honoured.
    pub dispatch_threads: usize,
    /// Outbound queue capacity. Messages beyond it are dropped.
    pub outbound_capacity: usize,
    /// Default timeout of synchronous publishes.
    pub sync_timeout_ms: u64,
    /// Event codes whose replies are routed to waiting synchronous callers.
    pub sync_reply_types: Vec<i32>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            dispatcher_id: "dispatcher-1".to_string(),
            ingress_capacity: 1024,
            dispatch_threads: 1,
            outbound_capacity: 100,
            sync_timeout_ms: 3_000,
            sync_reply_types: Vec::new(),
        }
    }
}

impl DispatchConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}
