//! AMQP (RabbitMQ) connector.
//!
//! One physical connection per session. A supervisor task watches the
//! session and rebuilds it after the broker drops the connection or any of
//! its consumers stops; lapin does not recover connections itself. Per session:
//! - `consumer_count` consumers on the inbound queue, routed through the
//!   cluster router
//! - one publisher draining the bounded outbound queue
//!
//! The outbound queue outlives sessions, so messages published during an
//! outage wait for the next publisher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use lapin::{Connection, ConnectionProperties};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BusError, EventPublisher, PublishRequest, QueueNames, Result};
use crate::cluster::ClusterRouter;
use crate::config::{BrokerConfig, Config};
use crate::dispatch::CallbackRegistry;
use crate::envelope::EventEnvelope;
use crate::utils::retry::reconnect_backoff;

mod consumer;
mod publisher;

use publisher::OutboundReceiver;

/// Floor for the callback sweep period; a zero interval panics.
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(1);

/// Connection lifecycle as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Recovering,
}

/// Broker connector: inbound consumers, outbound publisher and the
/// sync-over-async request bridge.
pub struct AmqpConnector {
    broker: BrokerConfig,
    dispatcher_id: String,
    sync_timeout: Duration,
    outbound_tx: mpsc::Sender<PublishRequest>,
    outbound_rx: OutboundReceiver,
    outbound_capacity: usize,
    callbacks: Arc<CallbackRegistry>,
    router: Arc<dyn ClusterRouter>,
    queues: QueueNames,
    connected: Arc<AtomicBool>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
}

/// One live connection and the tasks bound to it.
struct Session {
    connection: Arc<Connection>,
    cancel: CancellationToken,
    /// Why the session died: connection errors and stopped consumers.
    lost: mpsc::UnboundedReceiver<String>,
    publisher: JoinHandle<()>,
}

impl Session {
    async fn close(self) {
        self.cancel.cancel();
        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(200, "dispatcher shutdown").await {
                debug!(error = %e, "Failed to close broker connection");
            }
        }
    }
}

impl AmqpConnector {
    pub fn new(
        config: &Config,
        callbacks: Arc<CallbackRegistry>,
        router: Arc<dyn ClusterRouter>,
    ) -> Self {
        let outbound_capacity = config.dispatch.outbound_capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(outbound_capacity);
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            broker: config.broker.clone(),
            dispatcher_id: config.dispatch.dispatcher_id.clone(),
            sync_timeout: config.dispatch.sync_timeout(),
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
            outbound_capacity,
            callbacks,
            router,
            queues: QueueNames::new(),
            connected: Arc::new(AtomicBool::new(false)),
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// Connect, start consumers and the publisher, and keep them running.
    ///
    /// Returns once the first connection is up. Fails only if
    /// `max_connect_attempts` is exhausted or the connector is shut down first.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.set_state(ConnectionState::Connecting);
        let session = match self.connect_with_backoff().await {
            Ok(session) => session,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        self.set_state(ConnectionState::Connected);

        tokio::spawn(Arc::clone(self).supervise(session));
        self.spawn_sweeper();
        Ok(())
    }

    async fn supervise(self: Arc<Self>, mut session: Session) {
        loop {
            let reason = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                lost = session.lost.recv() => Some(
                    lost.unwrap_or_else(|| "connection dropped".to_string())
                ),
                _ = &mut session.publisher => Some("publisher stopped".to_string()),
            };

            let Some(reason) = reason else {
                session.close().await;
                break;
            };

            self.connected.store(false, Ordering::SeqCst);
            self.set_state(ConnectionState::Recovering);
            error!(reason = %reason, "Broker session lost, recovering");
            session.close().await;

            match self.connect_with_backoff().await {
                Ok(next) => {
                    session = next;
                    self.set_state(ConnectionState::Connected);
                    info!("Broker session recovered");
                }
                Err(e) => {
                    if !self.cancel.is_cancelled() {
                        error!(error = %e, "Giving up on broker connection");
                    }
                    break;
                }
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        info!("Broker supervisor stopped");
    }

    async fn connect_with_backoff(&self) -> Result<Session> {
        let backoff = reconnect_backoff(
            self.broker.reconnect_interval(),
            self.broker.max_connect_attempts,
        );
        let connect = (|| self.open_session())
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .notify(|e: &BusError, delay: Duration| {
                warn!(
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Broker connection failed, retrying"
                );
            });

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BusError::Closed),
            result = connect => result,
        }
    }

    async fn open_session(&self) -> Result<Session> {
        debug!(uri = %self.broker.redacted_uri(), "Connecting to broker");
        let connection = Connection::connect(&self.broker.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        let (lost_tx, lost) = mpsc::unbounded_channel();
        let connected = Arc::clone(&self.connected);
        let on_error_tx = lost_tx.clone();
        connection.on_error(move |e| {
            connected.store(false, Ordering::SeqCst);
            let _ = on_error_tx.send(e.to_string());
        });

        let connection = Arc::new(connection);
        let cancel = self.cancel.child_token();

        if let Err(e) = consumer::start_consumers(
            &connection,
            &self.broker,
            &self.dispatcher_id,
            &self.router,
            &lost_tx,
            &cancel,
        )
        .await
        {
            cancel.cancel();
            if let Err(close_err) = connection.close(200, "consumer setup failed").await {
                debug!(error = %close_err, "Failed to close broker connection");
            }
            return Err(e);
        }

        let publisher = publisher::spawn(
            Arc::clone(&connection),
            self.broker.exchange.clone(),
            Arc::clone(&self.outbound_rx),
            cancel.clone(),
        );

        self.connected.store(true, Ordering::SeqCst);
        info!(uri = %self.broker.redacted_uri(), "Connected to broker");

        Ok(Session {
            connection,
            cancel,
            lost,
            publisher,
        })
    }

    /// Periodically drop callbacks whose callers have given up.
    fn spawn_sweeper(&self) {
        let callbacks = Arc::clone(&self.callbacks);
        let cancel = self.cancel.clone();
        let period = sweep_period(self.sync_timeout);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        callbacks.sweep_expired();
                    }
                }
            }
        });
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Connection state changed");
        }
    }

    /// Queue a message for the publisher without waiting.
    pub fn publish_async(&self, request: PublishRequest) -> Result<()> {
        match self.outbound_tx.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(request)) => {
                warn!(
                    routing_key = %request.queue(),
                    serial_number = %request.serial_number(),
                    capacity = self.outbound_capacity,
                    "Outbound queue full, dropping message"
                );
                Err(BusError::QueueFull {
                    capacity: self.outbound_capacity,
                })
            }
            Err(TrySendError::Closed(_)) => Err(BusError::Closed),
        }
    }

    /// Publish and wait up to `timeout` for the reply with the same serial number.
    ///
    /// Every failure waits out the full timeout, including a rejected
    /// registration or a full outbound queue, so a missing reply always
    /// takes exactly `timeout`.
    pub async fn request(
        &self,
        request: PublishRequest,
        timeout: Duration,
    ) -> Result<Arc<EventEnvelope>> {
        let serial_number = request.serial_number().to_string();
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();

        let registration = match self.callbacks.register_oneshot(&serial_number, tx, timeout) {
            Ok(registration) => registration,
            Err(e) => {
                tokio::time::sleep_until(deadline).await;
                return Err(e.into());
            }
        };
        if let Err(e) = self.publish_async(request) {
            self.callbacks.cancel(&serial_number, registration);
            tokio::time::sleep_until(deadline).await;
            return Err(e);
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                tokio::time::sleep_until(deadline).await;
                Err(BusError::Timeout(timeout))
            }
            Err(_) => {
                self.callbacks.cancel(&serial_number, registration);
                Err(BusError::Timeout(timeout))
            }
        }
    }

    /// [`request`](Self::request) with every failure collapsed to "no reply".
    pub async fn publish_sync(
        &self,
        request: PublishRequest,
        timeout: Duration,
    ) -> Option<Arc<EventEnvelope>> {
        let serial_number = request.serial_number().to_string();
        match self.request(request, timeout).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                debug!(serial_number = %serial_number, error = %e, "No reply");
                None
            }
        }
    }

    pub fn get_queue(&self, eq_type: i32) -> Arc<str> {
        self.queues.get(eq_type)
    }

    /// Default timeout for synchronous publishes.
    pub fn sync_timeout(&self) -> Duration {
        self.sync_timeout
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Messages waiting for the publisher.
    pub fn outbound_len(&self) -> usize {
        self.outbound_capacity - self.outbound_tx.capacity()
    }

    /// Stop the supervisor, consumers, publisher and sweeper.
    pub fn shutdown(&self) {
        info!("Shutting down broker connector");
        self.cancel.cancel();
    }
}

fn sweep_period(sync_timeout: Duration) -> Duration {
    sync_timeout.max(MIN_SWEEP_PERIOD)
}

#[async_trait]
impl EventPublisher for AmqpConnector {
    fn publish_async(&self, request: PublishRequest) -> Result<()> {
        AmqpConnector::publish_async(self, request)
    }

    async fn publish_sync(
        &self,
        request: PublishRequest,
        timeout: Duration,
    ) -> Option<Arc<EventEnvelope>> {
        AmqpConnector::publish_sync(self, request, timeout).await
    }

    fn get_queue(&self, eq_type: i32) -> Arc<str> {
        AmqpConnector::get_queue(self, eq_type)
    }
}
