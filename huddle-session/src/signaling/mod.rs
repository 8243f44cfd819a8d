//! Signaling: JSON message protocol over a reconnecting bidirectional channel

pub mod channel;
pub mod message;
pub mod websocket;

pub use channel::{
    ConnectionState, MessageHandler, SignalingChannel, SignalingConnector, SignalingLink, Waiter,
};
pub use message::{Envelope, InboundMessage, OutboundMessage};
pub use websocket::WebSocketConnector;
