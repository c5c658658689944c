//! Gateway Dispatcher - event dispatch for device-gateway connector nodes
//!
//! Connector nodes hold the device sockets; they exchange protobuf-encoded
//! events with the dispatcher over RabbitMQ. The dispatcher decodes each
//! inbound message, routes it to the pipeline waiting on its serial number
//! (or the default pipeline), and replies to the originating node.

pub mod bus;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod handlers;
pub mod registry;
pub mod utils;
