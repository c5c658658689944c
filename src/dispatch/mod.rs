//! Inbound event dispatch.
//!
//! This module contains:
//! - `IngressQueue`: bounded, non-blocking hand-off from broker consumers
//! - `DispatchLoop`: the single task that resolves a pipeline and runs its handler
//! - `callback`: reply correlation for synchronous publishes
//! - `pipeline`: per-conversation and default handler pipelines
//! - `handler`: the handler contract

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::envelope::{self, DecodeError, EventEnvelope};

pub mod callback;
pub mod handler;
pub mod pipeline;

pub use callback::{CallbackError, CallbackRegistry, Registration, ReplyConsumer};
pub use handler::{
    offload, require, require_code, EventHandler, HandlerError, HandlerKind, SyncReplyHandler,
};
pub use pipeline::{Pipeline, PipelineError, PipelineRegistry};

/// Errors raised while queueing or dispatching one inbound event.
///
/// None of these stop the dispatch loop.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Ingress queue full (capacity {capacity}), event dropped")]
    QueueFull { capacity: usize },

    #[error("Ingress queue closed")]
    Closed,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("No handler registered for event type {event_type} (serial '{serial_number}')")]
    Unregistered {
        event_type: i32,
        serial_number: String,
    },

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),
}

/// Item handed to the dispatch loop.
#[derive(Debug)]
pub enum Inbound {
    /// Raw broker payload, decoded on the dispatch task.
    Payload(Vec<u8>),
    /// Already-decoded envelope.
    Event(EventEnvelope),
}

/// Producer side of the bounded ingress queue.
///
/// Enqueueing never waits: when the queue is full the event is dropped.
#[derive(Clone, Debug)]
pub struct IngressQueue {
    sender: mpsc::Sender<Inbound>,
    capacity: usize,
}

impl IngressQueue {
    /// Create a queue holding at most `capacity` events (minimum 1).
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Inbound>) {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender, capacity }, receiver)
    }

    pub fn enqueue(&self, item: Inbound) -> Result<(), DispatchError> {
        match self.sender.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(capacity = self.capacity, "Ingress queue full, dropping event");
                Err(DispatchError::QueueFull {
                    capacity: self.capacity,
                })
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Ingress queue closed, dropping event");
                Err(DispatchError::Closed)
            }
        }
    }

    pub fn enqueue_payload(&self, payload: &[u8]) -> Result<(), DispatchError> {
        self.enqueue(Inbound::Payload(payload.to_vec()))
    }

    pub fn enqueue_event(&self, event: EventEnvelope) -> Result<(), DispatchError> {
        self.enqueue(Inbound::Event(event))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events currently waiting.
    pub fn len(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The single consumer of the ingress queue.
pub struct DispatchLoop {
    pipelines: Arc<PipelineRegistry>,
    receiver: mpsc::Receiver<Inbound>,
}

impl DispatchLoop {
    pub fn new(pipelines: Arc<PipelineRegistry>, receiver: mpsc::Receiver<Inbound>) -> Self {
        Self {
            pipelines,
            receiver,
        }
    }

    /// Run the loop on its own task until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Dispatch loop started");
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = self.receiver.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            if let Err(e) = self.process(item) {
                match &e {
                    DispatchError::Decode(_) | DispatchError::Unregistered { .. } => {
                        warn!(error = %e, "Event dropped")
                    }
                    DispatchError::Handler(HandlerError::MissingField(_)) => {
                        warn!(error = %e, "Event rejected by handler")
                    }
                    _ => error!(error = %e, "Event handling failed"),
                }
            }
        }
        info!("Dispatch loop stopped");
    }

    /// Resolve and run the handler for one event.
    ///
    /// A conversation pipeline is consumed before its handler runs, so the
    /// handler may register a follow-up pipeline under the same serial number.
    pub fn process(&self, item: Inbound) -> Result<(), DispatchError> {
        let event = match item {
            Inbound::Payload(payload) => envelope::decode(&payload)?,
            Inbound::Event(event) => event,
        };
        let event = Arc::new(event);
        let serial_number = event.serial_number.as_str();

        let conversation = self.pipelines.get_by_serial(serial_number);
        let from_conversation = conversation.is_some();
        let pipeline = conversation.unwrap_or_else(|| self.pipelines.get_default());

        let Some(handler) = pipeline.adapt(event.event_type) else {
            return Err(DispatchError::Unregistered {
                event_type: event.event_type,
                serial_number: serial_number.to_string(),
            });
        };

        if from_conversation {
            self.pipelines.remove(serial_number);
        }

        debug!(
            serial_number = %serial_number,
            event_type = event.event_type,
            conversation = from_conversation,
            "Dispatching event"
        );

        match catch_unwind(AssertUnwindSafe(|| handler.accept(Arc::clone(&event)))) {
            Ok(result) => result.map_err(DispatchError::from),
            Err(panic) => Err(DispatchError::HandlerPanicked(panic_message(panic))),
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
