//! Business handlers for connector traffic.
//!
//! Each handler serves one event type from the default pipeline. Storage and
//! HTTP work runs on offloaded tasks; replies go back through the
//! [`EventPublisher`] to the queue of the device type, addressed to the
//! originating connector node.

use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::bus::{EventPublisher, PublishRequest};
use crate::envelope::{EventEnvelope, EventType};

pub mod backup;
mod login;
mod register;
mod upload;

pub use backup::HttpBackup;
pub use login::DeviceLogin;
pub use register::InstanceRegister;
pub use upload::{DataUpload, HttpForwarder, UploadError, UploadForwarder};

/// Send `event` to `node_id` on the queue of `eq_type`.
///
/// The publisher logs a dropped message; nothing more can be done here.
pub(crate) fn reply_to_node(
    publisher: &dyn EventPublisher,
    eq_type: i32,
    node_id: &str,
    event: &EventEnvelope,
) {
    let request = PublishRequest::for_event(publisher.get_queue(eq_type), event).to_connector(node_id);
    let _ = publisher.publish_async(request);
}

/// Tell an unregistered node to drop its connection and register again.
pub(crate) fn request_reconnect(publisher: &dyn EventPublisher, eq_type: i32, node_id: &str) {
    warn!(node_id = %node_id, "Node not registered, requesting reconnect");
    let event = EventEnvelope::builder(EventType::Dropped, Uuid::new_v4().to_string()).build();
    reply_to_node(publisher, eq_type, node_id, &event);
}

/// Handlers share the publisher as a trait object.
pub type SharedPublisher = Arc<dyn EventPublisher>;

#[cfg(test)]
mod tests;
