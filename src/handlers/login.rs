//! Device login.

use std::sync::Arc;

use tracing::{info, warn};

use super::{reply_to_node, request_reconnect, SharedPublisher};
use crate::dispatch::{offload, require, require_code, EventHandler, HandlerError};
use crate::envelope::{EventEnvelope, EventType};
use crate::registry::{
    unique_id, DeviceDirectory, NodeRegistry, RegistryError, SessionEntry, SessionStore,
};

/// Logs a device in through a registered connector node.
///
/// `msg` carries the connector's socket id, echoed back on failure so the
/// node can close the right socket. Repeated logins are accepted: some
/// devices resend their login packet on unstable links.
pub struct DeviceLogin {
    nodes: Arc<dyn NodeRegistry>,
    sessions: Arc<dyn SessionStore>,
    devices: Arc<dyn DeviceDirectory>,
    publisher: SharedPublisher,
}

impl DeviceLogin {
    pub fn new(
        nodes: Arc<dyn NodeRegistry>,
        sessions: Arc<dyn SessionStore>,
        devices: Arc<dyn DeviceDirectory>,
        publisher: SharedPublisher,
    ) -> Self {
        Self {
            nodes,
            sessions,
            devices,
            publisher,
        }
    }
}

impl EventHandler for DeviceLogin {
    fn event_type(&self) -> i32 {
        EventType::DeviceLogin.code()
    }

    fn accept(&self, event: Arc<EventEnvelope>) -> Result<(), HandlerError> {
        require("node_artifact_id", &event.node_artifact_id)?;
        require_code("eq_type", event.eq_type)?;
        require("eq_id", &event.eq_id)?;
        require("serial_number", &event.serial_number)?;
        require("msg", &event.msg)?;

        let nodes = Arc::clone(&self.nodes);
        let sessions = Arc::clone(&self.sessions);
        let devices = Arc::clone(&self.devices);
        let publisher = Arc::clone(&self.publisher);
        let serial_number = event.serial_number.clone();

        offload("device_login", &serial_number, async move {
            let node_id = event.node_artifact_id.as_str();
            let eq_type = event.eq_type;
            let eq_id = event.eq_id.as_str();

            if !nodes.is_registered(node_id).await? {
                request_reconnect(publisher.as_ref(), eq_type, node_id);
                return Ok(());
            }

            let uid = unique_id(eq_type, eq_id);
            let reply = match devices.find(&uid).await? {
                None => {
                    warn!(eq_type, eq_id = %eq_id, node_id = %node_id, "Login refused, device not registered");
                    EventEnvelope::builder(EventType::LoginFail, event.serial_number.as_str())
                        .node_artifact_id(node_id)
                        .eq_id(eq_id)
                        .msg(format!("{}:device login failed, not registered", event.msg))
                        .build()
                }
                Some(device) => {
                    let session = SessionEntry {
                        eq_id: eq_id.to_string(),
                        eq_type: device.eq_type,
                        profile: device.profile,
                        node: node_id.to_string(),
                    };
                    if sessions.open(&uid, &session).await? {
                        info!(eq_type, eq_id = %eq_id, node_id = %node_id, "Device logged in");
                    } else {
                        info!(eq_type, eq_id = %eq_id, node_id = %node_id, "Device logged in again");
                    }
                    EventEnvelope::builder(EventType::LoginSuccess, event.serial_number.as_str())
                        .node_artifact_id(node_id)
                        .eq_id(eq_id)
                        .build()
                }
            };
            reply_to_node(publisher.as_ref(), eq_type, node_id, &reply);
            Ok::<(), RegistryError>(())
        });
        Ok(())
    }
}
