//! Connector node registration.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::{reply_to_node, SharedPublisher};
use crate::config::GatewayConfig;
use crate::dispatch::{offload, require, require_code, EventHandler, HandlerError};
use crate::envelope::{EventEnvelope, EventType};
use crate::registry::{NodeEntry, NodeRegistry, RegistryError};

/// Registers a connector node for an equipment type and protocol.
///
/// Replies `RegisterSuccess` carrying this dispatcher's id, `RegisterFail`
/// when the node is already registered, or `RegisterError` when the type or
/// protocol is not served by this gateway.
pub struct InstanceRegister {
    gateway: Arc<GatewayConfig>,
    nodes: Arc<dyn NodeRegistry>,
    publisher: SharedPublisher,
    dispatcher_id: String,
    node_ttl: Duration,
}

impl InstanceRegister {
    pub fn new(
        gateway: Arc<GatewayConfig>,
        nodes: Arc<dyn NodeRegistry>,
        publisher: SharedPublisher,
        dispatcher_id: impl Into<String>,
        node_ttl: Duration,
    ) -> Self {
        Self {
            gateway,
            nodes,
            publisher,
            dispatcher_id: dispatcher_id.into(),
            node_ttl,
        }
    }
}

fn register_reply(
    event_type: EventType,
    serial_number: &str,
    node_id: &str,
    dispatcher_id: &str,
    msg: &str,
) -> EventEnvelope {
    EventEnvelope::builder(event_type, serial_number)
        .node_artifact_id(node_id)
        .dispatcher_id(dispatcher_id)
        .msg(msg)
        .build()
}

impl EventHandler for InstanceRegister {
    fn event_type(&self) -> i32 {
        EventType::InstanceRegister.code()
    }

    fn accept(&self, event: Arc<EventEnvelope>) -> Result<(), HandlerError> {
        let node_id = require("node_artifact_id", &event.node_artifact_id)?.to_string();
        let serial_number = require("serial_number", &event.serial_number)?.to_string();
        let eq_type = require_code("eq_type", event.eq_type)?;
        let protocol = require_code("protocol", event.protocol)?;

        let rejection = if !self.gateway.accepts_equipment_type(eq_type) {
            Some("equipment type not registered, connection refused")
        } else if !self.gateway.accepts_protocol(protocol) {
            Some("protocol not supported, connection refused")
        } else {
            None
        };
        if let Some(reason) = rejection {
            warn!(node_id = %node_id, eq_type, protocol, reason, "Rejecting node registration");
            let reply = register_reply(
                EventType::RegisterError,
                &serial_number,
                &node_id,
                &self.dispatcher_id,
                reason,
            );
            reply_to_node(self.publisher.as_ref(), eq_type, &node_id, &reply);
            return Ok(());
        }

        let nodes = Arc::clone(&self.nodes);
        let publisher = Arc::clone(&self.publisher);
        let dispatcher_id = self.dispatcher_id.clone();
        let ttl = self.node_ttl;
        let operation_serial = serial_number.clone();

        offload("instance_register", &operation_serial, async move {
            let entry = NodeEntry {
                node_id: node_id.clone(),
                eq_type,
                protocol,
            };
            let reply = if nodes.register(&entry, ttl).await? {
                info!(node_id = %node_id, eq_type, protocol, "Node registered");
                register_reply(
                    EventType::RegisterSuccess,
                    &serial_number,
                    &node_id,
                    &dispatcher_id,
                    "",
                )
            } else {
                warn!(node_id = %node_id, "Node already registered");
                register_reply(
                    EventType::RegisterFail,
                    &serial_number,
                    &node_id,
                    &dispatcher_id,
                    "node already registered",
                )
            };
            reply_to_node(publisher.as_ref(), eq_type, &node_id, &reply);
            Ok::<(), RegistryError>(())
        });
        Ok(())
    }
}
