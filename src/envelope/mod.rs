//! Event envelope exchanged with connector nodes.
//!
//! The wire form is a flat protobuf message. Every inbound delivery is
//! decoded into a fresh [`EventEnvelope`]; outbound events are built with
//! [`EventEnvelope::builder`] and encoded once before they are queued.

use std::fmt;

mod event_type;

pub use event_type::EventType;

/// Result type for envelope decoding.
pub type Result<T> = std::result::Result<T, DecodeError>;

/// Payload could not be decoded into an [`EventEnvelope`].
#[derive(Debug, thiserror::Error)]
#[error("Failed to decode event envelope ({len} bytes): {source}")]
pub struct DecodeError {
    len: usize,
    #[source]
    source: prost::DecodeError,
}

/// One event travelling between the dispatcher and a connector node.
///
/// `serial_number` ties a request to its reply: a reply reuses the serial
/// number of the request it answers.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventEnvelope {
    /// Event code, see [`EventType`]. Kept raw so unknown codes survive decoding.
    #[prost(int32, tag = "1")]
    pub event_type: i32,
    #[prost(string, tag = "2")]
    pub serial_number: ::prost::alloc::string::String,
    /// Epoch millis.
    #[prost(int64, tag = "3")]
    pub time_stamp: i64,
    #[prost(string, tag = "4")]
    pub node_artifact_id: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub eq_id: ::prost::alloc::string::String,
    #[prost(int32, tag = "6")]
    pub eq_type: i32,
    #[prost(int32, tag = "7")]
    pub protocol: i32,
    #[prost(string, tag = "8")]
    pub msg: ::prost::alloc::string::String,
    #[prost(string, optional, tag = "9")]
    pub uri: ::core::option::Option<::prost::alloc::string::String>,
    /// Dispatcher instance that owns the conversation.
    #[prost(string, optional, tag = "10")]
    pub dispatcher_id: ::core::option::Option<::prost::alloc::string::String>,
}

impl EventEnvelope {
    /// Start building an outbound event stamped with the current time.
    pub fn builder(event_type: EventType, serial_number: impl Into<String>) -> EnvelopeBuilder {
        EnvelopeBuilder {
            inner: EventEnvelope {
                event_type: event_type.code(),
                serial_number: serial_number.into(),
                time_stamp: chrono::Utc::now().timestamp_millis(),
                ..Default::default()
            },
        }
    }

    /// Known event type, if the code is one this dispatcher understands.
    pub fn known_type(&self) -> Option<EventType> {
        EventType::from_code(self.event_type)
    }
}

impl fmt::Display for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "event(type={}, serial={}, node={}, eq={}/{})",
            self.event_type, self.serial_number, self.node_artifact_id, self.eq_type, self.eq_id
        )
    }
}

/// Builder for outbound envelopes.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    inner: EventEnvelope,
}

impl EnvelopeBuilder {
    pub fn node_artifact_id(mut self, node: impl Into<String>) -> Self {
        self.inner.node_artifact_id = node.into();
        self
    }

    pub fn eq_id(mut self, eq_id: impl Into<String>) -> Self {
        self.inner.eq_id = eq_id.into();
        self
    }

    pub fn eq_type(mut self, eq_type: i32) -> Self {
        self.inner.eq_type = eq_type;
        self
    }

    pub fn protocol(mut self, protocol: i32) -> Self {
        self.inner.protocol = protocol;
        self
    }

    pub fn msg(mut self, msg: impl Into<String>) -> Self {
        self.inner.msg = msg.into();
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.inner.uri = Some(uri.into());
        self
    }

    pub fn dispatcher_id(mut self, dispatcher_id: impl Into<String>) -> Self {
        self.inner.dispatcher_id = Some(dispatcher_id.into());
        self
    }

    pub fn build(self) -> EventEnvelope {
        self.inner
    }
}

/// Serialize an envelope to its broker payload.
pub fn encode(envelope: &EventEnvelope) -> Vec<u8> {
    use prost::Message;
    envelope.encode_to_vec()
}

/// Deserialize a broker payload.
pub fn decode(payload: &[u8]) -> Result<EventEnvelope> {
    use prost::Message;
    EventEnvelope::decode(payload).map_err(|source| DecodeError {
        len: payload.len(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_stamps_time_and_type() {
        let before = chrono::Utc::now().timestamp_millis();
        let envelope = EventEnvelope::builder(EventType::LoginSuccess, "abc-1")
            .node_artifact_id("node-a")
            .eq_id("meter-9")
            .eq_type(7)
            .build();

        assert_eq!(envelope.event_type, 41);
        assert_eq!(envelope.serial_number, "abc-1");
        assert!(envelope.time_stamp >= before);
        assert_eq!(envelope.known_type(), Some(EventType::LoginSuccess));
        assert!(envelope.uri.is_none());
        assert!(envelope.dispatcher_id.is_none());
    }

    #[test]
    fn test_decode_preserves_optional_fields() {
        let envelope = EventEnvelope::builder(EventType::DeviceUpload, "up-1")
            .uri("/api/telemetry")
            .msg("{\"t\":21.5}")
            .dispatcher_id("dispatcher-2")
            .build();

        let decoded = decode(&encode(&envelope)).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.uri.as_deref(), Some("/api/telemetry"));
    }

    #[test]
    fn test_decode_unknown_type_is_kept_raw() {
        let envelope = EventEnvelope {
            event_type: 999,
            serial_number: "x".to_string(),
            ..Default::default()
        };

        let decoded = decode(&encode(&envelope)).unwrap();
        assert_eq!(decoded.event_type, 999);
        assert!(decoded.known_type().is_none());
    }

    #[test]
    fn test_decode_malformed_payload_fails() {
        // Truncated varint
        let err = decode(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(err.to_string().contains("3 bytes"));
    }

    #[test]
    fn test_display_is_compact() {
        let envelope = EventEnvelope::builder(EventType::DeviceLogin, "abc-1")
            .node_artifact_id("node-a")
            .eq_type(7)
            .eq_id("m1")
            .build();
        assert_eq!(
            envelope.to_string(),
            "event(type=40, serial=abc-1, node=node-a, eq=7/m1)"
        );
    }
}
