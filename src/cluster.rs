//! Cluster routing of inbound broker messages.
//!
//! Every dispatcher in a cluster consumes the same inbound queue. A message
//! carries the id of the dispatcher that owns its conversation; only the
//! owner may process it.

use tracing::{debug, warn};

use crate::dispatch::IngressQueue;

/// What happened to one inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Queued on the local ingress queue.
    Local,
    /// Owned by another dispatcher instance; not processed here.
    Peer,
    /// Locally owned but the ingress queue could not take it.
    Dropped,
}

/// Decides where an inbound payload is processed.
pub trait ClusterRouter: Send + Sync {
    fn route(&self, dispatcher_id: &str, payload: &[u8]) -> RouteOutcome;
}

/// Router for a dispatcher that only processes its own messages.
pub struct LocalRouter {
    local_id: String,
    ingress: IngressQueue,
}

impl LocalRouter {
    pub fn new(local_id: impl Into<String>, ingress: IngressQueue) -> Self {
        Self {
            local_id: local_id.into(),
            ingress,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }
}

impl ClusterRouter for LocalRouter {
    fn route(&self, dispatcher_id: &str, payload: &[u8]) -> RouteOutcome {
        if dispatcher_id != self.local_id {
            warn!(
                dispatcher_id = %dispatcher_id,
                local_id = %self.local_id,
                "Message owned by another dispatcher, dropping"
            );
            return RouteOutcome::Peer;
        }

        match self.ingress.enqueue_payload(payload) {
            Ok(()) => {
                debug!(len = payload.len(), "Routed message to local ingress");
                RouteOutcome::Local
            }
            // Full or closed; already logged by the queue
            Err(_) => RouteOutcome::Dropped,
        }
    }
}
