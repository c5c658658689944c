//! Device data upload.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::{reply_to_node, request_reconnect, HttpBackup, SharedPublisher};
use crate::config::GatewayConfig;
use crate::dispatch::{offload, require, require_code, EventHandler, HandlerError};
use crate::envelope::{EventEnvelope, EventType};
use crate::registry::{
    unique_id, DeviceDirectory, FailedUpload, NodeRegistry, RegistryError, SessionStore,
};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Delivers an upload body to its callback URL.
#[async_trait]
pub trait UploadForwarder: Send + Sync {
    async fn post(&self, url: &str, body: &str) -> Result<(), UploadError>;
}

/// Forwarder over HTTP with `reqwest`.
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new(timeout: Duration) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl UploadForwarder for HttpForwarder {
    async fn post(&self, url: &str, body: &str) -> Result<(), UploadError> {
        self.client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Forwards device data to the callback domain of the device's profile.
///
/// The upload is always acknowledged with `UploadSuccess`, also when the
/// node is unregistered (it is told to reconnect but its data is kept) or
/// when forwarding fails (the body goes to the [`HttpBackup`]).
pub struct DataUpload {
    gateway: Arc<GatewayConfig>,
    nodes: Arc<dyn NodeRegistry>,
    sessions: Arc<dyn SessionStore>,
    devices: Arc<dyn DeviceDirectory>,
    forwarder: Arc<dyn UploadForwarder>,
    backup: Arc<HttpBackup>,
    publisher: SharedPublisher,
}

impl DataUpload {
    pub fn new(
        gateway: Arc<GatewayConfig>,
        nodes: Arc<dyn NodeRegistry>,
        sessions: Arc<dyn SessionStore>,
        devices: Arc<dyn DeviceDirectory>,
        forwarder: Arc<dyn UploadForwarder>,
        backup: Arc<HttpBackup>,
        publisher: SharedPublisher,
    ) -> Self {
        Self {
            gateway,
            nodes,
            sessions,
            devices,
            forwarder,
            backup,
            publisher,
        }
    }
}

/// Everything the offloaded upload needs.
struct UploadJob {
    gateway: Arc<GatewayConfig>,
    nodes: Arc<dyn NodeRegistry>,
    sessions: Arc<dyn SessionStore>,
    devices: Arc<dyn DeviceDirectory>,
    forwarder: Arc<dyn UploadForwarder>,
    backup: Arc<HttpBackup>,
    publisher: SharedPublisher,
    event: Arc<EventEnvelope>,
}

impl UploadJob {
    async fn run(self) -> Result<(), UploadError> {
        let event = &self.event;
        if !self.nodes.is_registered(&event.node_artifact_id).await? {
            request_reconnect(self.publisher.as_ref(), event.eq_type, &event.node_artifact_id);
        }

        match self.callback_url().await {
            Ok(Some(url)) => self.forward(url).await,
            Ok(None) => {}
            Err(e) => error!(error = %e, "Failed to resolve callback for upload"),
        }

        let ack = EventEnvelope::builder(EventType::UploadSuccess, event.serial_number.as_str()).build();
        reply_to_node(
            self.publisher.as_ref(),
            event.eq_type,
            &event.node_artifact_id,
            &ack,
        );
        Ok(())
    }

    /// Callback URL from the device's session profile, falling back to the directory.
    async fn callback_url(&self) -> Result<Option<String>, RegistryError> {
        let event = &self.event;
        let uid = unique_id(event.eq_type, &event.eq_id);

        let profile = match self.sessions.get(&uid).await? {
            Some(session) => Some(session.profile),
            None => {
                warn!(eq_id = %event.eq_id, "Device has no session but is uploading, checking directory");
                self.devices.find(&uid).await?.map(|device| device.profile)
            }
        };
        let Some(profile) = profile else {
            warn!(eq_type = event.eq_type, eq_id = %event.eq_id, "Upload from unregistered device");
            return Ok(None);
        };
        let Some(domain) = self.gateway.callback_domain(profile) else {
            warn!(profile, eq_id = %event.eq_id, "No callback domain for profile");
            return Ok(None);
        };

        let uri = event.uri.as_deref().unwrap_or_default();
        Ok(Some(format!("{}{}", domain, uri)))
    }

    async fn forward(&self, url: String) {
        let serial_number = self.event.serial_number.clone();
        let body = self.event.msg.clone();

        match self.forwarder.post(&url, &body).await {
            Ok(()) => {
                info!(url = %url, serial_number = %serial_number, "Upload forwarded");
                if let Err(e) = self.backup.record_success(&serial_number).await {
                    error!(error = %e, serial_number = %serial_number, "Failed to clear upload backup");
                }
            }
            Err(e) => {
                warn!(url = %url, serial_number = %serial_number, error = %e, "Upload forwarding failed, backing up");
                let failed = FailedUpload {
                    serial_number: serial_number.clone(),
                    url,
                    body,
                };
                if let Err(e) = self.backup.record_failure(failed).await {
                    error!(error = %e, serial_number = %serial_number, "Failed to back up upload");
                }
            }
        }
    }
}

impl EventHandler for DataUpload {
    fn event_type(&self) -> i32 {
        EventType::DeviceUpload.code()
    }

    fn accept(&self, event: Arc<EventEnvelope>) -> Result<(), HandlerError> {
        require("eq_id", &event.eq_id)?;
        require("uri", event.uri.as_deref().unwrap_or_default())?;
        require("msg", &event.msg)?;
        require_code("eq_type", event.eq_type)?;
        require("node_artifact_id", &event.node_artifact_id)?;
        require("serial_number", &event.serial_number)?;

        info!(%event, "Device upload received");

        let serial_number = event.serial_number.clone();
        let job = UploadJob {
            gateway: Arc::clone(&self.gateway),
            nodes: Arc::clone(&self.nodes),
            sessions: Arc::clone(&self.sessions),
            devices: Arc::clone(&self.devices),
            forwarder: Arc::clone(&self.forwarder),
            backup: Arc::clone(&self.backup),
            publisher: Arc::clone(&self.publisher),
            event,
        };
        offload("data_upload", &serial_number, job.run());
        Ok(())
    }
}
