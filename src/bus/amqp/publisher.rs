//! The outbound publisher.
//!
//! Exactly one publisher task runs per broker session. It is the only code
//! that touches outbound channels, so the routing key → channel map needs no
//! locking.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ExchangeKind,
};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bus::{BusError, PublishRequest, Result};

/// Non-persistent delivery.
const TRANSIENT_DELIVERY_MODE: u8 = 1;

pub(super) type OutboundReceiver = Arc<Mutex<mpsc::Receiver<PublishRequest>>>;

/// Start the publisher for one session.
///
/// The task holds the outbound receiver for its whole life. The next
/// session's publisher waits for it, so nothing queued is skipped.
pub(super) fn spawn(
    connection: Arc<Connection>,
    exchange: String,
    outbound: OutboundReceiver,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let receiver = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            receiver = outbound.lock_owned() => receiver,
        };
        OutboundPublisher::new(connection, exchange)
            .run(receiver, cancel)
            .await;
    })
}

struct OutboundPublisher {
    connection: Arc<Connection>,
    exchange: String,
    exchange_declared: bool,
    channels: HashMap<String, Channel>,
}

impl OutboundPublisher {
    fn new(connection: Arc<Connection>, exchange: String) -> Self {
        Self {
            connection,
            exchange,
            exchange_declared: false,
            channels: HashMap::new(),
        }
    }

    async fn run(
        mut self,
        mut receiver: OwnedMutexGuard<mpsc::Receiver<PublishRequest>>,
        cancel: CancellationToken,
    ) {
        info!(exchange = %self.exchange, "Outbound publisher started");
        loop {
            let request = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = receiver.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            match self.publish(&request).await {
                Ok(()) => debug!(
                    routing_key = %request.queue(),
                    serial_number = %request.serial_number(),
                    "Published message"
                ),
                Err(e) if !self.connection.status().connected() => {
                    error!(
                        error = %e,
                        routing_key = %request.queue(),
                        serial_number = %request.serial_number(),
                        "Connection closed, message dropped and publisher stopping"
                    );
                    return;
                }
                Err(e) => error!(
                    error = %e,
                    routing_key = %request.queue(),
                    serial_number = %request.serial_number(),
                    "Publish failed, message dropped"
                ),
            }
        }
        info!("Outbound publisher stopped");
    }

    async fn publish(&mut self, request: &PublishRequest) -> Result<()> {
        let channel = self.channel_for(request.queue()).await?;
        let properties = BasicProperties::default()
            .with_delivery_mode(TRANSIENT_DELIVERY_MODE)
            .with_headers(header_table(request.headers()));

        let outcome: std::result::Result<_, lapin::Error> = async {
            channel
                .basic_publish(
                    &self.exchange,
                    request.queue(),
                    BasicPublishOptions::default(),
                    request.payload(),
                    properties,
                )
                .await?
                .await
        }
        .await;

        if let Err(e) = outcome {
            if !channel.status().connected() {
                self.channels.remove(request.queue());
            }
            return Err(BusError::Channel(format!("Failed to publish: {}", e)));
        }
        Ok(())
    }

    /// Channel for `routing_key`, created and bound on first use.
    async fn channel_for(&mut self, routing_key: &str) -> Result<Channel> {
        if let Some(channel) = self.channels.get(routing_key) {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
            debug!(routing_key = %routing_key, "Evicting closed channel");
            self.channels.remove(routing_key);
        }

        let channel = self.open_channel(routing_key).await?;
        self.channels.insert(routing_key.to_string(), channel.clone());
        Ok(channel)
    }

    async fn open_channel(&mut self, routing_key: &str) -> Result<Channel> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BusError::Channel(format!("Failed to create channel: {}", e)))?;

        if !self.exchange_declared {
            channel
                .exchange_declare(
                    &self.exchange,
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Channel(format!("Failed to declare exchange: {}", e)))?;
            self.exchange_declared = true;
        }

        channel
            .queue_declare(
                routing_key,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Channel(format!("Failed to declare queue: {}", e)))?;

        channel
            .queue_bind(
                routing_key,
                &self.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Channel(format!("Failed to bind queue: {}", e)))?;

        info!(
            exchange = %self.exchange,
            routing_key = %routing_key,
            "Opened outbound channel"
        );
        Ok(channel)
    }
}

/// Request headers as an AMQP field table of long strings.
fn header_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            key.as_str().into(),
            AMQPValue::LongString(value.clone().into()),
        );
    }
    table
}
