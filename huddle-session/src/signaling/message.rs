//! Signaling message protocol
//!
//! Every frame is a JSON envelope `{ "type": "<namespace>:<verb>", "data": {...} }`.
//! Outbound payloads implement [`OutboundMessage`], inbound ones [`InboundMessage`];
//! both carry their wire type so the channel can route them without a registry.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    ConnectionId, ConsumerId, MediaKind, MediaSource, ProducerId, RoomId, TransportId, UserId,
};

pub const JOIN: &str = "media:join";
pub const ROUTER_CAPABILITIES: &str = "media:router_capabilities";
pub const TRANSPORT_CREATED: &str = "media:transport_created";
pub const CONNECT_TRANSPORT: &str = "media:connect_transport";
pub const PRODUCE: &str = "media:produce";
pub const PRODUCE_RESULT: &str = "media:produce_result";
pub const CONSUME: &str = "media:consume";
pub const CONSUMER_CREATED: &str = "media:consumer_created";
pub const NEW_PRODUCER: &str = "media:new_producer";
pub const PEER_LEFT: &str = "media:peer_left";
pub const PRODUCER_CLOSED: &str = "media:producer_closed";
pub const PRODUCER_CLOSE: &str = "media:producer_close";
pub const LEAVE: &str = "media:leave";
pub const ERROR: &str = "media:error";
pub const ROOM_CLOSED: &str = "media:room_closed";
pub const PING: &str = "ping";
pub const PONG: &str = "pong";

/// Raw wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Envelope {
    pub fn new(message_type: impl Into<String>, data: Value) -> Self {
        Self {
            message_type: message_type.into(),
            data,
        }
    }

    /// Decode the payload as a typed inbound message
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.data)
    }
}

/// Message sent by the client
pub trait OutboundMessage: Serialize {
    const TYPE: &'static str;
}

/// Message sent by the server
pub trait InboundMessage: DeserializeOwned {
    const TYPE: &'static str;
}

macro_rules! outbound {
    ($ty:ty, $name:expr) => {
        impl OutboundMessage for $ty {
            const TYPE: &'static str = $name;
        }
    };
}

macro_rules! inbound {
    ($ty:ty, $name:expr) => {
        impl InboundMessage for $ty {
            const TYPE: &'static str = $name;
        }
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub room_id: RoomId,
}
outbound!(JoinRequest, JOIN);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterCapabilities {
    pub rtp_capabilities: Value,
}
inbound!(RouterCapabilities, ROUTER_CAPABILITIES);

/// Server-side transport description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: Value,
    #[serde(default)]
    pub ice_candidates: Vec<Value>,
    pub dtls_parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<Value>,
}

/// STUN/TURN server handed out with the transports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportCreated {
    pub send_transport: TransportParams,
    pub recv_transport: TransportParams,
    #[serde(default)]
    pub ice_servers: Vec<IceServerConfig>,
    #[serde(default)]
    pub force_relay: bool,
}
inbound!(TransportCreated, TRANSPORT_CREATED);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectTransport {
    pub room_id: RoomId,
    pub transport_id: TransportId,
    pub dtls_parameters: Value,
}
outbound!(ConnectTransport, CONNECT_TRANSPORT);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Produce {
    pub room_id: RoomId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
    pub source: MediaSource,
}
outbound!(Produce, PRODUCE);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProduceResult {
    pub id: ProducerId,
}
inbound!(ProduceResult, PRODUCE_RESULT);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consume {
    pub room_id: RoomId,
    pub producer_id: ProducerId,
    pub rtp_capabilities: Value,
}
outbound!(Consume, CONSUME);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerCreated {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}
inbound!(ConsumerCreated, CONSUMER_CREATED);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProducer {
    pub producer_id: ProducerId,
    pub user_id: UserId,
    #[serde(default)]
    pub connection_id: Option<ConnectionId>,
    pub kind: MediaKind,
    #[serde(default)]
    pub source: Option<MediaSource>,
}
inbound!(NewProducer, NEW_PRODUCER);

impl NewProducer {
    /// Identity of the announcing peer, falling back to the user id
    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        ConnectionId::or_user(self.connection_id.clone(), &self.user_id)
    }

    #[must_use]
    pub fn media_source(&self) -> MediaSource {
        self.source.unwrap_or_else(|| MediaSource::default_for(self.kind))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerLeft {
    pub user_id: UserId,
    #[serde(default)]
    pub connection_id: Option<ConnectionId>,
    #[serde(default)]
    pub room_id: Option<RoomId>,
}
inbound!(PeerLeft, PEER_LEFT);

impl PeerLeft {
    #[must_use]
    pub fn connection(&self) -> ConnectionId {
        ConnectionId::or_user(self.connection_id.clone(), &self.user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerClosed {
    pub producer_id: ProducerId,
    pub user_id: UserId,
}
inbound!(ProducerClosed, PRODUCER_CLOSED);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerClose {
    pub room_id: RoomId,
    pub producer_id: ProducerId,
}
outbound!(ProducerClose, PRODUCER_CLOSE);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub room_id: RoomId,
}
outbound!(LeaveRequest, LEAVE);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaError {
    pub message: String,
}
inbound!(MediaError, ERROR);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomClosed {
    pub room_id: RoomId,
}
inbound!(RoomClosed, ROOM_CLOSED);

/// Keepalive; carries no payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping;
outbound!(Ping, PING);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_roundtrip_shape() {
        let env = Envelope::new(JOIN, serde_json::to_value(JoinRequest { room_id: "r1".into() }).unwrap());
        let text = serde_json::to_string(&env).unwrap();
        assert_eq!(text, r#"{"type":"media:join","data":{"room_id":"r1"}}"#);
    }

    #[test]
    fn test_envelope_without_data() {
        let env: Envelope = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(env.message_type, PONG);
        assert!(env.data.is_null());
        assert_eq!(serde_json::to_string(&env).unwrap(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_new_producer_fallbacks() {
        let env = Envelope::new(
            NEW_PRODUCER,
            json!({ "producer_id": "p1", "user_id": "u1", "kind": "video" }),
        );
        let announcement: NewProducer = env.decode().unwrap();
        assert_eq!(announcement.connection().as_str(), "u1");
        assert_eq!(announcement.media_source(), MediaSource::Camera);

        let env = Envelope::new(
            NEW_PRODUCER,
            json!({
                "producer_id": "p2", "user_id": "u1", "connection_id": "c2",
                "kind": "video", "source": "screen"
            }),
        );
        let announcement: NewProducer = env.decode().unwrap();
        assert_eq!(announcement.connection().as_str(), "c2");
        assert_eq!(announcement.media_source(), MediaSource::Screen);
    }

    #[test]
    fn test_transport_created_defaults() {
        let payload = json!({
            "send_transport": {
                "id": "t-send", "ice_parameters": {}, "ice_candidates": [], "dtls_parameters": {}
            },
            "recv_transport": {
                "id": "t-recv", "ice_parameters": {}, "dtls_parameters": {}
            }
        });
        let created: TransportCreated = serde_json::from_value(payload).unwrap();
        assert_eq!(created.send_transport.id.as_str(), "t-send");
        assert!(created.recv_transport.ice_candidates.is_empty());
        assert!(created.ice_servers.is_empty());
        assert!(!created.force_relay);
    }

    #[test]
    fn test_produce_serializes_room_and_source() {
        let msg = Produce {
            room_id: "r1".into(),
            kind: MediaKind::Video,
            rtp_parameters: json!({ "codecs": [] }),
            source: MediaSource::Screen,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["room_id"], "r1");
        assert_eq!(value["kind"], "video");
        assert_eq!(value["source"], "screen");
        assert_eq!(<Produce as OutboundMessage>::TYPE, "media:produce");
    }
}
