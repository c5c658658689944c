//! Inbound consumers.
//!
//! Each consumer owns one channel on the session connection and hands every
//! delivery to the cluster router. Deliveries are auto-acknowledged. A
//! consumer that stops on its own reports to the session's loss channel so
//! the supervisor rebuilds the session.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use lapin::{
    message::Delivery,
    options::{BasicConsumeOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, Consumer,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bus::{BusError, Result, DISPATCHER_ID_HEADER};
use crate::cluster::ClusterRouter;
use crate::config::BrokerConfig;

/// Declare the inbound queue and start `consumer_count` consumers on it.
pub(super) async fn start_consumers(
    connection: &Connection,
    broker: &BrokerConfig,
    local_id: &str,
    router: &Arc<dyn ClusterRouter>,
    lost: &mpsc::UnboundedSender<String>,
    cancel: &CancellationToken,
) -> Result<()> {
    for index in 0..broker.consumer_count {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Channel(format!("Failed to create channel: {}", e)))?;

        channel
            .queue_declare(
                &broker.inbound_queue,
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

        let tag = format!("{}-consumer-{}", local_id, index);
        let consumer = channel
            .basic_consume(
                &broker.inbound_queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Channel(format!("Failed to start consumer: {}", e)))?;

        tokio::spawn(consume(
            consumer,
            channel,
            tag,
            local_id.to_string(),
            Arc::clone(router),
            lost.clone(),
            cancel.clone(),
        ));
    }

    info!(
        queue = %broker.inbound_queue,
        consumers = broker.consumer_count,
        "Inbound consumers started"
    );
    Ok(())
}

async fn consume(
    mut consumer: Consumer,
    channel: Channel,
    tag: String,
    local_id: String,
    router: Arc<dyn ClusterRouter>,
    lost: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    if let Some(reason) = drain(&mut consumer, &tag, &local_id, router.as_ref(), &cancel).await {
        let _ = lost.send(format!("consumer {} stopped: {}", tag, reason));
    }

    if channel.status().connected() {
        if let Err(e) = channel.close(200, "consumer stopped").await {
            debug!(consumer = %tag, error = %e, "Failed to close consumer channel");
        }
    }
    info!(consumer = %tag, "Consumer stopped");
}

/// Route deliveries until cancelled or the stream gives out.
///
/// Returns why the stream gave out, or `None` if cancelled.
async fn drain<S>(
    deliveries: &mut S,
    tag: &str,
    local_id: &str,
    router: &dyn ClusterRouter,
    cancel: &CancellationToken,
) -> Option<String>
where
    S: Stream<Item = lapin::Result<Delivery>> + Unpin,
{
    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            delivery = deliveries.next() => delivery,
        };

        match delivery {
            Some(Ok(delivery)) => {
                let owner = dispatcher_id(&delivery.properties);
                let owner = owner.as_deref().unwrap_or(local_id);
                let outcome = router.route(owner, &delivery.data);
                debug!(
                    consumer = %tag,
                    dispatcher_id = %owner,
                    outcome = ?outcome,
                    "Routed inbound message"
                );
            }
            Some(Err(e)) => {
                error!(consumer = %tag, error = %e, "Consumer delivery error");
                return Some(e.to_string());
            }
            None => {
                error!(consumer = %tag, "Delivery stream ended");
                return Some("delivery stream ended".to_string());
            }
        }
    }
}

/// Owning dispatcher named in the message headers, if any.
pub(super) fn dispatcher_id(properties: &BasicProperties) -> Option<String> {
    let value = properties
        .headers()
        .as_ref()?
        .inner()
        .get(DISPATCHER_ID_HEADER)?;
    let id = match value {
        AMQPValue::LongString(s) => std::str::from_utf8(s.as_bytes()).ok()?.to_string(),
        AMQPValue::ShortString(s) => s.as_str().to_string(),
        _ => return None,
    };
    (!id.is_empty()).then_some(id)
}
