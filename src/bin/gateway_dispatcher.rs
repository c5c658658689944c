//! gateway-dispatcher: event dispatcher for connector nodes
//!
//! ## Architecture
//! ```text
//! [Connector nodes] -> [dispatcher.upstream] -> consumers -> [ClusterRouter]
//!        ^                                                        |
//!        |                                                  [Ingress queue]
//!        |                                                        |
//!        |                                                  [DispatchLoop]
//!        |                                                        |
//!        +--- equipment_type_<n> <- publisher <- handlers --------+
//! ```
//!
//! ## Configuration
//! - `gateway-dispatcher [config-path]`, or DISPATCHER_CONFIG
//! - Overrides: DISPATCHER__<SECTION>__<KEY>, e.g. DISPATCHER__BROKER__HOST
//! - DISPATCHER_LOG: tracing filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use gateway_dispatcher::bus::{AmqpConnector, EventPublisher};
use gateway_dispatcher::cluster::{ClusterRouter, LocalRouter};
use gateway_dispatcher::config::Config;
use gateway_dispatcher::dispatch::{
    CallbackRegistry, DispatchLoop, EventHandler, IngressQueue, Pipeline, PipelineRegistry,
    SyncReplyHandler,
};
use gateway_dispatcher::handlers::{
    DataUpload, DeviceLogin, HttpBackup, HttpForwarder, InstanceRegister,
};
use gateway_dispatcher::registry::{
    BackupStore, ConfigDeviceDirectory, DeviceDirectory, MemoryBackupStore, MemoryNodeRegistry,
    MemorySessionStore, NodeRegistry, SessionStore,
};
use gateway_dispatcher::utils::bootstrap::{init_tracing, shutdown_signal};

/// Node, session and backup storage.
struct Stores {
    nodes: Arc<dyn NodeRegistry>,
    sessions: Arc<dyn SessionStore>,
    backup: Arc<dyn BackupStore>,
}

async fn build_stores(config: &Config) -> Result<Stores, Box<dyn std::error::Error>> {
    match &config.redis.url {
        #[cfg(feature = "redis")]
        Some(url) => {
            use gateway_dispatcher::registry::redis::{
                connect, RedisBackupStore, RedisNodeRegistry, RedisSessionStore,
            };

            let conn = connect(url).await?;
            info!("Using Redis registries");
            Ok(Stores {
                nodes: Arc::new(RedisNodeRegistry::new(conn.clone())),
                sessions: Arc::new(RedisSessionStore::new(conn.clone())),
                backup: Arc::new(RedisBackupStore::new(conn)),
            })
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => Err("redis.url is set but the redis feature is disabled".into()),
        None => {
            warn!("redis.url not set - registries are in memory and not shared");
            Ok(Stores {
                nodes: Arc::new(MemoryNodeRegistry::new()),
                sessions: Arc::new(MemorySessionStore::new()),
                backup: Arc::new(MemoryBackupStore::new()),
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting gateway-dispatcher");

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    if config.dispatch.dispatch_threads != 1 {
        warn!(
            dispatch_threads = config.dispatch.dispatch_threads,
            "Handlers require serial dispatch, using one dispatch task"
        );
    }

    let stores = build_stores(&config).await?;
    let devices: Arc<dyn DeviceDirectory> =
        Arc::new(ConfigDeviceDirectory::new(&config.gateway.devices));
    let gateway = Arc::new(config.gateway.clone());

    let callbacks = Arc::new(CallbackRegistry::new());
    let (ingress, receiver) = IngressQueue::bounded(config.dispatch.ingress_capacity);
    let router: Arc<dyn ClusterRouter> = Arc::new(LocalRouter::new(
        config.dispatch.dispatcher_id.clone(),
        ingress,
    ));
    let connector = Arc::new(AmqpConnector::new(
        &config,
        Arc::clone(&callbacks),
        router,
    ));
    let publisher: Arc<dyn EventPublisher> = connector.clone();

    let backup = Arc::new(HttpBackup::new(stores.backup, config.backup.batch_size));
    let forwarder = Arc::new(HttpForwarder::new(config.backup.http_timeout())?);

    let mut handlers: Vec<Arc<dyn EventHandler>> = vec![
        Arc::new(InstanceRegister::new(
            Arc::clone(&gateway),
            Arc::clone(&stores.nodes),
            Arc::clone(&publisher),
            config.dispatch.dispatcher_id.clone(),
            Duration::from_secs(config.redis.key_expire_secs),
        )),
        Arc::new(DeviceLogin::new(
            Arc::clone(&stores.nodes),
            Arc::clone(&stores.sessions),
            Arc::clone(&devices),
            Arc::clone(&publisher),
        )),
        Arc::new(DataUpload::new(
            gateway,
            stores.nodes,
            stores.sessions,
            devices,
            forwarder,
            Arc::clone(&backup),
            publisher,
        )),
    ];
    for &code in &config.dispatch.sync_reply_types {
        handlers.push(Arc::new(SyncReplyHandler::new(code, Arc::clone(&callbacks))));
    }
    let default = handlers
        .into_iter()
        .fold(Pipeline::builder(), |builder, handler| builder.handler(handler))
        .build();
    let pipelines = Arc::new(PipelineRegistry::new(default));

    let cancel = CancellationToken::new();
    let dispatch = DispatchLoop::new(pipelines, receiver).spawn(cancel.clone());

    tokio::select! {
        started = connector.start() => started?,
        _ = shutdown_signal() => {
            connector.shutdown();
            cancel.cancel();
            return Ok(());
        }
    }
    info!(
        dispatcher_id = %config.dispatch.dispatcher_id,
        broker = %config.broker.redacted_uri(),
        "gateway-dispatcher running"
    );

    shutdown_signal().await?;

    connector.shutdown();
    cancel.cancel();
    if let Err(e) = dispatch.await {
        error!(error = %e, "Dispatch loop ended abnormally");
    }
    match backup.flush().await {
        Ok(count) => info!(count, "Flushed upload backup"),
        Err(e) => error!(error = %e, "Failed to flush upload backup"),
    }

    info!("gateway-dispatcher stopped");
    Ok(())
}
