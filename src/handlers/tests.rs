use super::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::{QueueNames, Result as BusResult, CONNECTOR_ID_HEADER};
use crate::config::{CallbackProfile, DeviceSeed, GatewayConfig};
use crate::dispatch::{EventHandler, HandlerError};
use crate::envelope::decode;
use crate::registry::{
    unique_id, ConfigDeviceDirectory, MemoryBackupStore, MemoryNodeRegistry, MemorySessionStore,
    NodeEntry, NodeRegistry, SessionStore,
};

const NODE: &str = "node-a";
const EQ_TYPE: i32 = 7;
const PROTOCOL: i32 = 2;
const REPLY_WAIT: Duration = Duration::from_secs(2);

/// Publisher that hands every outbound request to the test.
struct RecordingPublisher {
    queues: QueueNames,
    sent: mpsc::UnboundedSender<PublishRequest>,
}

impl RecordingPublisher {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PublishRequest>) {
        let (sent, rx) = mpsc::unbounded_channel();
        let publisher = Arc::new(Self {
            queues: QueueNames::new(),
            sent,
        });
        (publisher, rx)
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    fn publish_async(&self, request: PublishRequest) -> BusResult<()> {
        let _ = self.sent.send(request);
        Ok(())
    }

    async fn publish_sync(
        &self,
        request: PublishRequest,
        _timeout: Duration,
    ) -> Option<Arc<EventEnvelope>> {
        let _ = self.sent.send(request);
        None
    }

    fn get_queue(&self, eq_type: i32) -> Arc<str> {
        self.queues.get(eq_type)
    }
}

/// Forwarder that records posts and fails on demand.
#[derive(Default)]
struct StubForwarder {
    fail: AtomicBool,
    posted: std::sync::Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl UploadForwarder for StubForwarder {
    async fn post(&self, url: &str, body: &str) -> std::result::Result<(), UploadError> {
        self.posted
            .lock()
            .unwrap()
            .push((url.to_string(), body.to_string()));
        if self.fail.load(Ordering::SeqCst) {
            Err(UploadError::Registry(crate::registry::RegistryError::Serialization(
                serde_json::from_str::<()>("x").unwrap_err(),
            )))
        } else {
            Ok(())
        }
    }
}

fn gateway() -> Arc<GatewayConfig> {
    Arc::new(GatewayConfig {
        equipment_types: vec![EQ_TYPE],
        protocols: vec![PROTOCOL],
        profiles: vec![CallbackProfile {
            id: 3,
            domain: "http://profile-3.internal".to_string(),
        }],
        devices: vec![DeviceSeed {
            eq_type: EQ_TYPE,
            eq_id: "dev-1".to_string(),
            profile: 3,
        }],
    })
}

async fn next_reply(rx: &mut mpsc::UnboundedReceiver<PublishRequest>) -> (PublishRequest, EventEnvelope) {
    let request = tokio::time::timeout(REPLY_WAIT, rx.recv())
        .await
        .expect("no reply published")
        .expect("publisher closed");
    let event = decode(request.payload()).unwrap();
    (request, event)
}

async fn registered_nodes() -> Arc<MemoryNodeRegistry> {
    let nodes = Arc::new(MemoryNodeRegistry::new());
    let entry = NodeEntry {
        node_id: NODE.to_string(),
        eq_type: EQ_TYPE,
        protocol: PROTOCOL,
    };
    assert!(nodes.register(&entry, Duration::from_secs(60)).await.unwrap());
    nodes
}

fn register_event(serial: &str, eq_type: i32, protocol: i32) -> Arc<EventEnvelope> {
    Arc::new(
        EventEnvelope::builder(EventType::InstanceRegister, serial)
            .node_artifact_id(NODE)
            .eq_type(eq_type)
            .protocol(protocol)
            .build(),
    )
}

fn login_event(serial: &str, eq_id: &str) -> Arc<EventEnvelope> {
    Arc::new(
        EventEnvelope::builder(EventType::DeviceLogin, serial)
            .node_artifact_id(NODE)
            .eq_type(EQ_TYPE)
            .eq_id(eq_id)
            .msg("socket-9")
            .build(),
    )
}

fn upload_event(serial: &str, eq_id: &str) -> Arc<EventEnvelope> {
    Arc::new(
        EventEnvelope::builder(EventType::DeviceUpload, serial)
            .node_artifact_id(NODE)
            .eq_type(EQ_TYPE)
            .eq_id(eq_id)
            .uri("/api/upload")
            .msg("{\"t\":21.5}")
            .build(),
    )
}

fn register_handler(
    nodes: Arc<MemoryNodeRegistry>,
) -> (InstanceRegister, mpsc::UnboundedReceiver<PublishRequest>) {
    let (publisher, rx) = RecordingPublisher::new();
    let handler = InstanceRegister::new(
        gateway(),
        nodes,
        publisher,
        "dispatcher-1",
        Duration::from_secs(60),
    );
    (handler, rx)
}

#[tokio::test]
async fn test_register_success_carries_dispatcher_id() {
    let nodes = Arc::new(MemoryNodeRegistry::new());
    let (handler, mut rx) = register_handler(nodes.clone());

    handler.accept(register_event("r-1", EQ_TYPE, PROTOCOL)).unwrap();

    let (request, reply) = next_reply(&mut rx).await;
    assert_eq!(request.queue(), "equipment_type_7");
    assert_eq!(
        request.headers().get(CONNECTOR_ID_HEADER).map(String::as_str),
        Some(NODE)
    );
    assert_eq!(reply.known_type(), Some(EventType::RegisterSuccess));
    assert_eq!(reply.serial_number, "r-1");
    assert_eq!(reply.dispatcher_id.as_deref(), Some("dispatcher-1"));
    assert!(nodes.is_registered(NODE).await.unwrap());
}

#[tokio::test]
async fn test_register_twice_fails() {
    let (handler, mut rx) = register_handler(registered_nodes().await);

    handler.accept(register_event("r-2", EQ_TYPE, PROTOCOL)).unwrap();

    let (_, reply) = next_reply(&mut rx).await;
    assert_eq!(reply.known_type(), Some(EventType::RegisterFail));
}

#[tokio::test]
async fn test_register_unknown_equipment_type_is_refused() {
    let nodes = Arc::new(MemoryNodeRegistry::new());
    let (handler, mut rx) = register_handler(nodes.clone());

    handler.accept(register_event("r-3", 99, PROTOCOL)).unwrap();

    let (request, reply) = next_reply(&mut rx).await;
    assert_eq!(request.queue(), "equipment_type_99");
    assert_eq!(reply.known_type(), Some(EventType::RegisterError));
    assert!(!nodes.is_registered(NODE).await.unwrap());
}

#[tokio::test]
async fn test_register_unknown_protocol_is_refused() {
    let (handler, mut rx) = register_handler(Arc::new(MemoryNodeRegistry::new()));

    handler.accept(register_event("r-4", EQ_TYPE, 42)).unwrap();

    let (_, reply) = next_reply(&mut rx).await;
    assert_eq!(reply.known_type(), Some(EventType::RegisterError));
    assert!(reply.msg.contains("protocol"));
}

#[tokio::test]
async fn test_register_missing_node_is_rejected() {
    let (handler, _rx) = register_handler(Arc::new(MemoryNodeRegistry::new()));
    let event = Arc::new(
        EventEnvelope::builder(EventType::InstanceRegister, "r-5")
            .eq_type(EQ_TYPE)
            .protocol(PROTOCOL)
            .build(),
    );

    let err = handler.accept(event).unwrap_err();
    assert!(matches!(err, HandlerError::MissingField("node_artifact_id")));
}

fn login_handler(
    nodes: Arc<MemoryNodeRegistry>,
    sessions: Arc<MemorySessionStore>,
) -> (DeviceLogin, mpsc::UnboundedReceiver<PublishRequest>) {
    let (publisher, rx) = RecordingPublisher::new();
    let devices = Arc::new(ConfigDeviceDirectory::new(&gateway().devices));
    (DeviceLogin::new(nodes, sessions, devices, publisher), rx)
}

#[tokio::test]
async fn test_login_opens_session() {
    let sessions = Arc::new(MemorySessionStore::new());
    let (handler, mut rx) = login_handler(registered_nodes().await, sessions.clone());

    handler.accept(login_event("l-1", "dev-1")).unwrap();

    let (_, reply) = next_reply(&mut rx).await;
    assert_eq!(reply.known_type(), Some(EventType::LoginSuccess));
    assert_eq!(reply.eq_id, "dev-1");

    let session = sessions
        .get(&unique_id(EQ_TYPE, "dev-1"))
        .await
        .unwrap()
        .expect("session opened");
    assert_eq!(session.profile, 3);
    assert_eq!(session.node, NODE);
}

#[tokio::test]
async fn test_repeated_login_succeeds() {
    let sessions = Arc::new(MemorySessionStore::new());
    let (handler, mut rx) = login_handler(registered_nodes().await, sessions);

    handler.accept(login_event("l-2", "dev-1")).unwrap();
    next_reply(&mut rx).await;
    handler.accept(login_event("l-3", "dev-1")).unwrap();

    let (_, reply) = next_reply(&mut rx).await;
    assert_eq!(reply.known_type(), Some(EventType::LoginSuccess));
    assert_eq!(reply.serial_number, "l-3");
}

#[tokio::test]
async fn test_login_unknown_device_echoes_socket() {
    let (handler, mut rx) =
        login_handler(registered_nodes().await, Arc::new(MemorySessionStore::new()));

    handler.accept(login_event("l-4", "stranger")).unwrap();

    let (_, reply) = next_reply(&mut rx).await;
    assert_eq!(reply.known_type(), Some(EventType::LoginFail));
    assert!(reply.msg.starts_with("socket-9:"));
}

#[tokio::test]
async fn test_login_from_unregistered_node_requests_reconnect() {
    let sessions = Arc::new(MemorySessionStore::new());
    let (handler, mut rx) = login_handler(Arc::new(MemoryNodeRegistry::new()), sessions.clone());

    handler.accept(login_event("l-5", "dev-1")).unwrap();

    let (request, reply) = next_reply(&mut rx).await;
    assert_eq!(reply.known_type(), Some(EventType::Dropped));
    assert_ne!(reply.serial_number, "l-5");
    assert_eq!(
        request.headers().get(CONNECTOR_ID_HEADER).map(String::as_str),
        Some(NODE)
    );
    assert!(sessions
        .get(&unique_id(EQ_TYPE, "dev-1"))
        .await
        .unwrap()
        .is_none());
}

struct UploadFixture {
    handler: DataUpload,
    forwarder: Arc<StubForwarder>,
    store: Arc<MemoryBackupStore>,
    backup: Arc<HttpBackup>,
    rx: mpsc::UnboundedReceiver<PublishRequest>,
}

fn upload_fixture(nodes: Arc<MemoryNodeRegistry>, sessions: Arc<MemorySessionStore>) -> UploadFixture {
    let (publisher, rx) = RecordingPublisher::new();
    let gateway = gateway();
    let devices = Arc::new(ConfigDeviceDirectory::new(&gateway.devices));
    let forwarder = Arc::new(StubForwarder::default());
    let store = Arc::new(MemoryBackupStore::new());
    let backup = Arc::new(HttpBackup::new(store.clone(), 100));
    let handler = DataUpload::new(
        gateway,
        nodes,
        sessions,
        devices,
        forwarder.clone(),
        backup.clone(),
        publisher,
    );
    UploadFixture {
        handler,
        forwarder,
        store,
        backup,
        rx,
    }
}

#[tokio::test]
async fn test_upload_forwards_to_profile_domain() {
    let mut fx = upload_fixture(registered_nodes().await, Arc::new(MemorySessionStore::new()));

    fx.handler.accept(upload_event("u-1", "dev-1")).unwrap();

    let (_, reply) = next_reply(&mut fx.rx).await;
    assert_eq!(reply.known_type(), Some(EventType::UploadSuccess));
    assert_eq!(reply.serial_number, "u-1");

    let posted = fx.forwarder.posted.lock().unwrap().clone();
    assert_eq!(
        posted,
        vec![(
            "http://profile-3.internal/api/upload".to_string(),
            "{\"t\":21.5}".to_string()
        )]
    );
    assert_eq!(fx.backup.pending().await, 0);
}

#[tokio::test]
async fn test_upload_failure_is_backed_up_and_acknowledged() {
    let mut fx = upload_fixture(registered_nodes().await, Arc::new(MemorySessionStore::new()));
    fx.forwarder.fail.store(true, Ordering::SeqCst);

    fx.handler.accept(upload_event("u-2", "dev-1")).unwrap();

    let (_, reply) = next_reply(&mut fx.rx).await;
    assert_eq!(reply.known_type(), Some(EventType::UploadSuccess));
    assert_eq!(fx.backup.pending().await, 1);

    assert_eq!(fx.backup.flush().await.unwrap(), 1);
    let saved = fx.store.get("u-2").await.expect("backed up");
    assert_eq!(saved.url, "http://profile-3.internal/api/upload");
}

#[tokio::test]
async fn test_upload_from_unregistered_node_still_forwards() {
    let mut fx = upload_fixture(
        Arc::new(MemoryNodeRegistry::new()),
        Arc::new(MemorySessionStore::new()),
    );

    fx.handler.accept(upload_event("u-3", "dev-1")).unwrap();

    let (_, first) = next_reply(&mut fx.rx).await;
    assert_eq!(first.known_type(), Some(EventType::Dropped));
    let (_, second) = next_reply(&mut fx.rx).await;
    assert_eq!(second.known_type(), Some(EventType::UploadSuccess));
    assert_eq!(fx.forwarder.posted.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_upload_unknown_device_is_acknowledged_without_forwarding() {
    let mut fx = upload_fixture(registered_nodes().await, Arc::new(MemorySessionStore::new()));

    fx.handler.accept(upload_event("u-4", "stranger")).unwrap();

    let (_, reply) = next_reply(&mut fx.rx).await;
    assert_eq!(reply.known_type(), Some(EventType::UploadSuccess));
    assert!(fx.forwarder.posted.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_upload_without_uri_is_rejected() {
    let fx = upload_fixture(registered_nodes().await, Arc::new(MemorySessionStore::new()));
    let event = Arc::new(
        EventEnvelope::builder(EventType::DeviceUpload, "u-5")
            .node_artifact_id(NODE)
            .eq_type(EQ_TYPE)
            .eq_id("dev-1")
            .msg("{}")
            .build(),
    );

    let err = fx.handler.accept(event).unwrap_err();
    assert!(matches!(err, HandlerError::MissingField("uri")));
}
