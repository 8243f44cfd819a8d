//! WebRTC engine seam
//!
//! The session core never talks to a WebRTC stack directly. It loads router
//! capabilities into a [`MediaEngine`], asks it for one send and one receive
//! transport, and reacts to the typed [`TransportEvent`]s each transport
//! reports while it negotiates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;

use crate::error::Result;
use crate::media::MediaTrack;
use crate::signaling::message::{IceServerConfig, TransportParams};
use crate::types::{ConsumerId, MediaKind, MediaSource, ProducerId, TransportId};

/// Which way media flows over a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Send => "send",
            Self::Recv => "recv",
        })
    }
}

/// ICE/DTLS connection state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportConnectionState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Typed transition reported by a transport.
///
/// `NeedsDtls` and `NeedsProduce` block the engine until `reply` is answered.
#[derive(Debug)]
pub enum TransportEvent {
    /// Local DTLS parameters must be relayed to the server
    NeedsDtls {
        dtls_parameters: Value,
        reply: oneshot::Sender<Result<()>>,
    },
    /// The server must create a producer for these RTP parameters
    NeedsProduce {
        kind: MediaKind,
        rtp_parameters: Value,
        source: MediaSource,
        reply: oneshot::Sender<Result<ProducerId>>,
    },
    StateChanged(TransportConnectionState),
}

/// Everything needed to build a local transport mirroring a server one
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub params: TransportParams,
    pub ice_servers: Vec<IceServerConfig>,
    pub force_relay: bool,
}

impl TransportOptions {
    #[must_use]
    pub fn id(&self) -> &TransportId {
        &self.params.id
    }

    /// Peer-connection configuration for engines built on the `webrtc` crate
    #[must_use]
    pub fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = self
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let ice_transport_policy = if self.force_relay {
            RTCIceTransportPolicy::Relay
        } else {
            RTCIceTransportPolicy::All
        };

        RTCConfiguration {
            ice_servers,
            ice_transport_policy,
            ..Default::default()
        }
    }
}

/// Snapshot of transport statistics, gathered for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportStats {
    pub rtt_ms: Option<u32>,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub available_bitrate_kbps: Option<u32>,
    /// e.g. `"host 192.168.1.4:50000 <-> relay 203.0.113.9:3478"`
    pub selected_candidate_pair: Option<String>,
}

/// Server-created consumer the receive transport has to mirror
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: Value,
}

/// Capability negotiation and transport factory
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Initialize from the router's advertised capabilities
    async fn load(&self, router_rtp_capabilities: &Value) -> Result<()>;

    /// Local receive capabilities, valid after [`MediaEngine::load`]
    fn rtp_capabilities(&self) -> Result<Value>;

    fn create_send_transport(
        &self,
        options: TransportOptions,
    ) -> Result<(Arc<dyn SendTransport>, mpsc::UnboundedReceiver<TransportEvent>)>;

    fn create_recv_transport(
        &self,
        options: TransportOptions,
    ) -> Result<(Arc<dyn RecvTransport>, mpsc::UnboundedReceiver<TransportEvent>)>;
}

/// Behaviour shared by both transport directions
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> &TransportId;

    fn connection_state(&self) -> TransportConnectionState;

    async fn stats(&self) -> Result<TransportStats>;

    /// Force-close regardless of negotiation state. Idempotent.
    fn close(&self);
}

#[async_trait]
pub trait SendTransport: Transport {
    async fn produce(&self, track: MediaTrack, source: MediaSource)
        -> Result<Arc<dyn ProducerHandle>>;
}

#[async_trait]
pub trait RecvTransport: Transport {
    async fn consume(&self, params: ConsumerParams) -> Result<Arc<dyn ConsumerHandle>>;
}

/// Local outbound flow
pub trait ProducerHandle: Send + Sync {
    fn id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn source(&self) -> MediaSource;
    fn track(&self) -> &MediaTrack;
    /// Stop transmitting without renegotiation
    fn pause(&self);
    fn resume(&self);
    fn is_paused(&self) -> bool;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Local end of a remote flow
pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> &ConsumerId;
    fn producer_id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    fn track(&self) -> &MediaTrack;
    fn close(&self);
    fn is_closed(&self) -> bool;
}
