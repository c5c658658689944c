//! Type-keyed handler pipelines.
//!
//! A per-conversation pipeline is registered under a serial number and
//! consumed by the first event dispatched for it. Events with no
//! conversation pipeline fall back to the process-wide default pipeline.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use super::handler::EventHandler;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Pipeline already registered for serial number '{0}'")]
    AlreadyRegistered(String),
}

/// Event type → handler.
#[derive(Clone, Default)]
pub struct Pipeline {
    handlers: HashMap<i32, Arc<dyn EventHandler>>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Handler for `event_type`, if any.
    pub fn adapt(&self, event_type: i32) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(&event_type).cloned()
    }

    pub fn event_types(&self) -> Vec<i32> {
        let mut types: Vec<i32> = self.handlers.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Default)]
pub struct PipelineBuilder {
    handlers: HashMap<i32, Arc<dyn EventHandler>>,
}

impl PipelineBuilder {
    /// Add a handler under the type it declares. A later handler for the same type wins.
    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        let event_type = handler.event_type();
        if self.handlers.insert(event_type, handler).is_some() {
            warn!(event_type, "Handler replaced in pipeline");
        }
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            handlers: self.handlers,
        }
    }
}

/// Default pipeline plus live per-conversation pipelines.
pub struct PipelineRegistry {
    default: Arc<Pipeline>,
    conversations: Mutex<HashMap<String, Arc<Pipeline>>>,
}

impl PipelineRegistry {
    pub fn new(default: Pipeline) -> Self {
        debug!(event_types = ?default.event_types(), "Default pipeline installed");
        Self {
            default: Arc::new(default),
            conversations: Mutex::new(HashMap::new()),
        }
    }

    fn conversations(&self) -> MutexGuard<'_, HashMap<String, Arc<Pipeline>>> {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the pipeline for one conversation.
    pub fn register(&self, serial_number: &str, pipeline: Pipeline) -> Result<(), PipelineError> {
        let mut conversations = self.conversations();
        if conversations.contains_key(serial_number) {
            return Err(PipelineError::AlreadyRegistered(serial_number.to_string()));
        }
        conversations.insert(serial_number.to_string(), Arc::new(pipeline));
        Ok(())
    }

    pub fn get_by_serial(&self, serial_number: &str) -> Option<Arc<Pipeline>> {
        self.conversations().get(serial_number).cloned()
    }

    pub fn get_default(&self) -> Arc<Pipeline> {
        Arc::clone(&self.default)
    }

    pub fn remove(&self, serial_number: &str) -> Option<Arc<Pipeline>> {
        self.conversations().remove(serial_number)
    }

    /// Number of live per-conversation pipelines.
    pub fn len(&self) -> usize {
        self.conversations().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations().is_empty()
    }
}
