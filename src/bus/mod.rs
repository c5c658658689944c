//! Broker transport towards connector nodes.
//!
//! This module contains:
//! - `EventPublisher` trait: outbound API used by handlers
//! - `PublishRequest`: one outbound message
//! - `QueueNames`: device type → routing key memo
//! - Implementation: AMQP (RabbitMQ) connector

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::dispatch::CallbackError;
use crate::envelope::{self, EventEnvelope};

pub mod amqp;

pub use amqp::{AmqpConnector, ConnectionState};

/// Header naming the dispatcher instance that owns an inbound message.
pub const DISPATCHER_ID_HEADER: &str = "dispatcherId";
/// Header naming the connector node an outbound message is for.
pub const CONNECTOR_ID_HEADER: &str = "connectorId";

const EQUIPMENT_QUEUE_PREFIX: &str = "equipment_type_";

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Outbound queue full (capacity {capacity}), message dropped")]
    QueueFull { capacity: usize },

    #[error("Outbound queue closed")]
    Closed,

    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error("No reply within {0:?}")]
    Timeout(Duration),
}

/// Outbound API towards connector nodes.
///
/// Implementations:
/// - `AmqpConnector`: RabbitMQ via AMQP
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Queue a message for the publisher. Never waits; a full queue drops the message.
    fn publish_async(&self, request: PublishRequest) -> Result<()>;

    /// Publish and wait for the reply carrying the same serial number.
    ///
    /// `None` means no reply: timeout, dropped message and cancellation are
    /// indistinguishable to the caller.
    async fn publish_sync(
        &self,
        request: PublishRequest,
        timeout: Duration,
    ) -> Option<Arc<EventEnvelope>>;

    /// Routing key of the outbound queue for a device type.
    fn get_queue(&self, eq_type: i32) -> Arc<str>;
}

/// One outbound message.
#[derive(Clone)]
pub struct PublishRequest {
    queue: Arc<str>,
    payload: Vec<u8>,
    serial_number: String,
    headers: BTreeMap<String, String>,
}

impl PublishRequest {
    pub fn new(queue: Arc<str>, payload: Vec<u8>, serial_number: impl Into<String>) -> Self {
        Self {
            queue,
            payload,
            serial_number: serial_number.into(),
            headers: BTreeMap::new(),
        }
    }

    /// Encode `event` for `queue`, correlated by the event's serial number.
    pub fn for_event(queue: Arc<str>, event: &EventEnvelope) -> Self {
        Self::new(queue, envelope::encode(event), event.serial_number.clone())
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Address the message to one connector node.
    pub fn to_connector(self, node_id: impl Into<String>) -> Self {
        self.with_header(CONNECTOR_ID_HEADER, node_id)
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }
}

impl fmt::Debug for PublishRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishRequest")
            .field("queue", &self.queue)
            .field("serial_number", &self.serial_number)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .finish()
    }
}

/// Memoized device type → routing key.
#[derive(Default)]
pub struct QueueNames {
    names: Mutex<HashMap<i32, Arc<str>>>,
}

impl QueueNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, eq_type: i32) -> Arc<str> {
        let mut names = self.names.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            names
                .entry(eq_type)
                .or_insert_with(|| Arc::from(format!("{}{}", EQUIPMENT_QUEUE_PREFIX, eq_type))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventType;

    #[test]
    fn test_queue_name_for_device_type() {
        let names = QueueNames::new();
        assert_eq!(&*names.get(7), "equipment_type_7");
    }

    #[test]
    fn test_queue_name_is_memoized() {
        let names = QueueNames::new();
        let first = names.get(7);
        let second = names.get(7);
        assert!(Arc::ptr_eq(&first, &second));
        assert_ne!(names.get(8), first);
    }

    #[test]
    fn test_publish_request_for_event() {
        let names = QueueNames::new();
        let event = EventEnvelope::builder(EventType::LoginSuccess, "abc-1").build();
        let request = PublishRequest::for_event(names.get(7), &event).to_connector("node-a");

        assert_eq!(request.queue(), "equipment_type_7");
        assert_eq!(request.serial_number(), "abc-1");
        assert_eq!(
            request.headers().get(CONNECTOR_ID_HEADER).map(String::as_str),
            Some("node-a")
        );
        assert_eq!(envelope::decode(request.payload()).unwrap(), event);
    }
}
