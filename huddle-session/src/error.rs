//! Error types for the session core

use std::time::Duration;
use thiserror::Error;

use crate::types::{ProducerSlot, RoomId};

/// Session core error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("Timed out after {timeout:?} waiting for {message_type}")]
    SignalingTimeout {
        message_type: String,
        timeout: Duration,
    },

    #[error("Signaling connection lost while waiting for {message_type}")]
    ConnectionLost { message_type: String },

    #[error("Signaling channel is not connected")]
    NotConnected,

    #[error("Signaling transport error: {0}")]
    Transport(String),

    #[error("A waiter for {message_type} is already pending")]
    DuplicateWaiter { message_type: String },

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Not joined to a room")]
    NotJoined,

    #[error("Already joined to room {current}")]
    AlreadyJoined { current: RoomId },

    #[error("A join is already in progress")]
    JoinInProgress,

    #[error("Operation cancelled by leave")]
    Cancelled,

    #[error("Session is closed")]
    SessionClosed,

    #[error("No local {0} track")]
    NoLocalTrack(ProducerSlot),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capture device errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("Permission denied")]
    PermissionDenied,

    #[error("No matching device")]
    NotFound,

    #[error("Device unavailable: {0}")]
    Unavailable(String),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, Error>;
