//! Huddle media session core
//!
//! Client side of a conference call routed through an SFU (Selective
//! Forwarding Unit). A single [`SessionCoordinator`] owns the lifecycle of
//! one room membership: it negotiates the send/receive transports, publishes
//! local microphone, camera and screen, consumes everything the other peers
//! publish, and groups those flows into per-connection remote streams.
//!
//! ## Architecture
//!
//! - **`SignalingChannel`**: JSON envelope transport with request/response
//!   correlation, handlers for unsolicited messages and reconnect
//! - **`TransportNegotiator`**: join handshake and transport creation; buffers
//!   announcements that race ahead of it
//! - **`MediaResourceManager`**: local capture, producers and consumers
//! - **`StreamComposer`**: remote flows keyed by connection (`<conn>` and
//!   `<conn>:screen`)
//! - **`ActiveSpeakerDetector`**: audio-level election with a hold window
//!
//! WebRTC, capture hardware and audio analysis sit behind the
//! [`MediaEngine`], [`CaptureDevices`] and [`AudioBackend`] traits so the
//! session logic runs against the in-memory `testing` implementations too
//! (behind the `testing` feature).
//!
//! ## Usage
//!
//! ```rust,ignore
//! use huddle_session::{
//!     Collaborators, Config, JoinOptions, JoinTarget, SessionCoordinator, SignalingChannel,
//!     WebSocketConnector,
//! };
//!
//! let config = Config::load(None)?;
//! let connector = WebSocketConnector::new(&config.signaling)?;
//! let signaling = SignalingChannel::connect(config.signaling.clone(), Arc::new(connector));
//! let session = SessionCoordinator::new(config, signaling, collaborators);
//!
//! session.join(JoinTarget::room("r1"), JoinOptions::default()).await?;
//! let mut events = session.subscribe();
//! ```

pub mod composer;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod logging;
pub mod media;
pub mod monitor;
pub mod negotiator;
pub mod signaling;
pub mod speaker;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use composer::{RemoteStream, StreamComposer};
pub use config::{Config, LoggingConfig, SessionConfig, SignalingConfig, SpeakerConfig};
pub use coordinator::{
    Collaborators, JoinOptions, JoinReport, JoinTarget, Session, SessionCoordinator, SessionEvent,
    SessionResources, SessionState,
};
pub use engine::{
    ConsumerHandle, MediaEngine, ProducerHandle, RecvTransport, SendTransport, Transport,
    TransportConnectionState, TransportDirection, TransportEvent, TransportOptions, TransportStats,
};
pub use error::{DeviceError, Error, Result};
pub use logging::init_logging;
pub use media::{
    CaptureDevices, LocalMediaStatus, MediaConstraints, MediaResourceManager, MediaStream,
    MediaTrack, TrackState,
};
pub use monitor::{QualityAction, TransportHealth};
pub use negotiator::TransportNegotiator;
pub use signaling::{ConnectionState, SignalingChannel, SignalingConnector, WebSocketConnector};
pub use speaker::{ActiveSpeakerDetector, AudioAnalyser, AudioBackend, AudioContext};
pub use types::{
    ConnectionId, ConsumerId, MediaKind, MediaSource, ProducerId, ProducerSlot, RoomId,
    StreamKey, TenantId, TransportId, UserId,
};
