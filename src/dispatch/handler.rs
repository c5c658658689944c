//! Handler contract for inbound events.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, error, Instrument};

use super::callback::CallbackRegistry;
use crate::envelope::EventEnvelope;

/// Errors a handler reports back to the dispatch loop.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Handler failed: {0}")]
    Failed(String),
}

/// How a handler treats the dispatch task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Performs I/O; moves it off the dispatch task with [`offload`].
    Async,
    /// Only routes the envelope to a waiting caller; never blocks.
    Sync,
}

/// Handler for one event type.
///
/// `accept` is invoked from the single dispatch task, one event at a time.
/// It must return quickly: storage or network work goes through [`offload`].
pub trait EventHandler: Send + Sync {
    /// Event code this handler serves.
    fn event_type(&self) -> i32;

    fn kind(&self) -> HandlerKind {
        HandlerKind::Async
    }

    fn accept(&self, event: Arc<EventEnvelope>) -> Result<(), HandlerError>;
}

/// Run handler I/O on its own task, logging failure.
pub fn offload<F, E>(operation: &'static str, serial_number: &str, work: F)
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let span = tracing::info_span!("handler.offload", operation, serial_number = %serial_number);
    tokio::spawn(
        async move {
            if let Err(e) = work.await {
                error!(error = %e, "Offloaded handler work failed");
            }
        }
        .instrument(span),
    );
}

/// Require a non-empty string field.
pub fn require<'a>(field: &'static str, value: &'a str) -> Result<&'a str, HandlerError> {
    if value.trim().is_empty() {
        Err(HandlerError::MissingField(field))
    } else {
        Ok(value)
    }
}

/// Require a non-zero numeric field.
pub fn require_code(field: &'static str, value: i32) -> Result<i32, HandlerError> {
    if value == 0 {
        Err(HandlerError::MissingField(field))
    } else {
        Ok(value)
    }
}

/// Bridges a reply event back to the caller blocked in `publish_sync`.
pub struct SyncReplyHandler {
    event_type: i32,
    callbacks: Arc<CallbackRegistry>,
}

impl SyncReplyHandler {
    pub fn new(event_type: i32, callbacks: Arc<CallbackRegistry>) -> Self {
        Self {
            event_type,
            callbacks,
        }
    }
}

impl EventHandler for SyncReplyHandler {
    fn event_type(&self) -> i32 {
        self.event_type
    }

    fn kind(&self) -> HandlerKind {
        HandlerKind::Sync
    }

    fn accept(&self, event: Arc<EventEnvelope>) -> Result<(), HandlerError> {
        let serial_number = event.serial_number.clone();
        if self.callbacks.fulfill(&serial_number, event) {
            debug!(serial_number = %serial_number, "Reply routed to waiting caller");
        }
        Ok(())
    }
}
