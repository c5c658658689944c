//! Correlation of replies to waiting callers.
//!
//! A caller registers a one-shot consumer under the serial number of the
//! request it is about to publish. The dispatch task fulfills it when the
//! reply arrives. Entries whose caller has given up are removed by
//! [`CallbackRegistry::cancel`], replaced on the next colliding
//! registration once expired, or dropped by [`CallbackRegistry::sweep_expired`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::envelope::EventEnvelope;

/// One-shot consumer of a reply.
pub type ReplyConsumer = Box<dyn FnOnce(Arc<EventEnvelope>) + Send>;

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("Callback already registered for serial number '{0}'")]
    AlreadyRegistered(String),
}

/// Identifies one registration, so a caller can only cancel its own entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration(u64);

struct CallbackEntry {
    consumer: ReplyConsumer,
    expires_at: Instant,
    registration: Registration,
}

impl CallbackEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Serial number → pending reply consumer.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: Mutex<HashMap<String, CallbackEntry>>,
    next_registration: AtomicU64,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CallbackEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a consumer for `serial_number`, live for `ttl`.
    ///
    /// Fails if a live entry already exists; an expired one is replaced.
    pub fn register(
        &self,
        serial_number: &str,
        consumer: ReplyConsumer,
        ttl: Duration,
    ) -> Result<Registration, CallbackError> {
        let now = Instant::now();
        let mut entries = self.entries();

        if let Some(existing) = entries.get(serial_number) {
            if !existing.is_expired(now) {
                return Err(CallbackError::AlreadyRegistered(serial_number.to_string()));
            }
            debug!(serial_number = %serial_number, "Replacing expired callback");
        }

        let registration = Registration(self.next_registration.fetch_add(1, Ordering::Relaxed));
        entries.insert(
            serial_number.to_string(),
            CallbackEntry {
                consumer,
                expires_at: now + ttl,
                registration,
            },
        );
        Ok(registration)
    }

    /// Register a oneshot sender as the consumer.
    pub fn register_oneshot(
        &self,
        serial_number: &str,
        sender: oneshot::Sender<Arc<EventEnvelope>>,
        ttl: Duration,
    ) -> Result<Registration, CallbackError> {
        let serial = serial_number.to_string();
        self.register(
            serial_number,
            Box::new(move |reply| {
                if sender.send(reply).is_err() {
                    warn!(serial_number = %serial, "Reply arrived after caller stopped waiting");
                }
            }),
            ttl,
        )
    }

    /// Deliver a reply. Returns `true` if a consumer was waiting.
    ///
    /// The consumer runs at most once: the entry is removed before it is invoked.
    pub fn fulfill(&self, serial_number: &str, reply: Arc<EventEnvelope>) -> bool {
        let entry = self.entries().remove(serial_number);
        match entry {
            Some(entry) => {
                (entry.consumer)(reply);
                true
            }
            None => {
                warn!(
                    serial_number = %serial_number,
                    event_type = reply.event_type,
                    "No callback registered for reply, discarding"
                );
                false
            }
        }
    }

    /// Drop the entry made by `registration` without invoking it.
    ///
    /// A newer entry under the same serial number is left alone.
    pub fn cancel(&self, serial_number: &str, registration: Registration) -> bool {
        let mut entries = self.entries();
        match entries.get(serial_number) {
            Some(entry) if entry.registration == registration => {
                entries.remove(serial_number);
                true
            }
            Some(_) => {
                debug!(serial_number = %serial_number, "Callback was replaced, not cancelling");
                false
            }
            None => false,
        }
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Swept expired callbacks");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}
