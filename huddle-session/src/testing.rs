//! In-memory collaborators for tests and local experiments
//!
//! - [`memory_connector`]: raw signaling pipe with a scripted server end
//! - [`MockSfu`]: speaks the media protocol for any number of connections
//! - [`FakeEngine`], [`FakeDevices`], [`FakeAudioBackend`]: stand-ins for
//!   WebRTC, capture hardware and audio analysis

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::engine::{
    ConsumerHandle, ConsumerParams, MediaEngine, ProducerHandle, RecvTransport, SendTransport,
    Transport, TransportConnectionState, TransportDirection, TransportEvent, TransportOptions,
    TransportStats,
};
use crate::error::{DeviceError, Error, Result};
use crate::media::{CaptureDevices, MediaConstraints, MediaStream, MediaTrack};
use crate::signaling::message;
use crate::signaling::{Envelope, SignalingConnector, SignalingLink};
use crate::speaker::{AudioAnalyser, AudioBackend, AudioContext};
use crate::types::{
    ConnectionId, ConsumerId, MediaKind, MediaSource, ProducerId, RoomId, TransportId, UserId,
};

// ---------------------------------------------------------------------------
// Signaling pipe
// ---------------------------------------------------------------------------

/// Server side of one in-memory connection
pub struct ServerEnd {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    /// Deliver a message to the client
    pub fn push(&self, message_type: &str, data: Value) {
        let envelope = Envelope::new(message_type, data);
        if let Ok(text) = serde_json::to_string(&envelope) {
            let _ = self.to_client.send(text);
        }
    }

    /// Next message sent by the client, `None` once it disconnected
    pub async fn next(&mut self) -> Option<Envelope> {
        loop {
            let text = self.from_client.recv().await?;
            if let Ok(envelope) = serde_json::from_str(&text) {
                return Some(envelope);
            }
        }
    }

    /// Drop the connection from the server side
    pub fn close(self) {}
}

/// Accepts connections opened through a [`MemoryConnector`]
pub struct MemoryServer {
    accepted: mpsc::UnboundedReceiver<ServerEnd>,
}

impl MemoryServer {
    pub async fn accept(&mut self) -> Option<ServerEnd> {
        self.accepted.recv().await
    }
}

pub struct MemoryConnector {
    user_id: UserId,
    accepted: mpsc::UnboundedSender<ServerEnd>,
    refuse: AtomicBool,
    opened: Arc<AtomicU64>,
}

impl MemoryConnector {
    /// Make further connection attempts fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalingConnector for MemoryConnector {
    async fn connect(&self) -> Result<SignalingLink> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection refused".to_string()));
        }
        let n = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let end = ServerEnd {
            user_id: self.user_id.clone(),
            connection_id: ConnectionId::new(format!("{}-conn{n}", self.user_id)),
            to_client,
            from_client,
        };
        self.accepted
            .send(end)
            .map_err(|_| Error::Transport("server gone".to_string()))?;
        Ok(SignalingLink {
            outbound: to_server,
            inbound: from_server,
        })
    }
}

/// Connector/server pair for one user
#[must_use]
pub fn memory_connector(user_id: &str) -> (MemoryConnector, MemoryServer) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            user_id: UserId::from(user_id),
            accepted: tx,
            refuse: AtomicBool::new(false),
            opened: Arc::new(AtomicU64::new(0)),
        },
        MemoryServer { accepted: rx },
    )
}

// ---------------------------------------------------------------------------
// Mock SFU
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MockSfuOptions {
    /// Announce existing producers before `media:transport_created`
    pub announce_before_transports: bool,
    /// Also announce a producer to the connection that created it
    pub echo_own_producers: bool,
    /// Leave `connection_id` out of announcements
    pub omit_connection_ids: bool,
    /// Message types the server never answers
    pub ignore: HashSet<String>,
}

#[derive(Debug, Clone)]
struct MockProducer {
    id: ProducerId,
    room_id: RoomId,
    user_id: UserId,
    connection_id: ConnectionId,
    kind: MediaKind,
    source: MediaSource,
}

struct MockClient {
    user_id: UserId,
    tx: mpsc::UnboundedSender<String>,
    room: Option<RoomId>,
}

#[derive(Default)]
struct SfuState {
    clients: HashMap<ConnectionId, MockClient>,
    producers: Vec<MockProducer>,
    consumers: HashMap<ConsumerId, ProducerId>,
    received: Vec<(ConnectionId, Envelope)>,
}

struct SfuShared {
    options: Mutex<MockSfuOptions>,
    state: Mutex<SfuState>,
    next_id: AtomicU64,
}

/// Scripted selective forwarding unit.
///
/// Rooms are implicit: a connection is in a room once it sent `media:join`.
#[derive(Clone)]
pub struct MockSfu {
    shared: Arc<SfuShared>,
    accept_tx: mpsc::UnboundedSender<ServerEnd>,
    connections: Arc<AtomicU64>,
}

impl MockSfu {
    #[must_use]
    pub fn start(options: MockSfuOptions) -> Self {
        let shared = Arc::new(SfuShared {
            options: Mutex::new(options),
            state: Mutex::new(SfuState::default()),
            next_id: AtomicU64::new(1),
        });
        let (accept_tx, mut accept_rx) = mpsc::unbounded_channel::<ServerEnd>();

        let acceptor = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Some(end) = accept_rx.recv().await {
                tokio::spawn(serve(Arc::clone(&acceptor), end));
            }
        });

        Self {
            shared,
            accept_tx,
            connections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Connector for a client logged in as `user_id`
    #[must_use]
    pub fn connector(&self, user_id: &str) -> MemoryConnector {
        MemoryConnector {
            user_id: UserId::from(user_id),
            accepted: self.accept_tx.clone(),
            refuse: AtomicBool::new(false),
            opened: Arc::clone(&self.connections),
        }
    }

    pub fn set_options(&self, options: MockSfuOptions) {
        *self.shared.options.lock() = options;
    }

    /// Stop answering one message type
    pub fn ignore(&self, message_type: &str) {
        self.shared.options.lock().ignore.insert(message_type.to_string());
    }

    /// Register a producer of a peer that is not connected to this mock and
    /// announce it to everyone in the room
    pub fn add_remote_producer(
        &self,
        room_id: &str,
        producer_id: &str,
        user_id: &str,
        connection_id: &str,
        kind: MediaKind,
        source: MediaSource,
    ) {
        let producer = MockProducer {
            id: ProducerId::from(producer_id),
            room_id: RoomId::from(room_id),
            user_id: UserId::from(user_id),
            connection_id: ConnectionId::from(connection_id),
            kind,
            source,
        };
        let options = self.shared.options.lock().clone();
        let mut state = self.shared.state.lock();
        for client in state.room_members(&producer.room_id) {
            client.send(message::NEW_PRODUCER, announcement(&producer, &options));
        }
        state.producers.push(producer);
    }

    /// Close a producer and announce `media:producer_closed`
    pub fn close_remote_producer(&self, producer_id: &str) {
        let mut state = self.shared.state.lock();
        state.close_producer(&ProducerId::from(producer_id), None);
    }

    /// Announce that a remote connection left
    pub fn remove_remote_peer(&self, room_id: &str, user_id: &str, connection_id: &str) {
        let mut state = self.shared.state.lock();
        let room_id = RoomId::from(room_id);
        let connection_id = ConnectionId::from(connection_id);
        state
            .producers
            .retain(|p| !(p.room_id == room_id && p.connection_id == connection_id));
        let omit = self.shared.options.lock().omit_connection_ids;
        let payload = peer_left(&room_id, &UserId::from(user_id), &connection_id, omit);
        for client in state.room_members(&room_id) {
            client.send(message::PEER_LEFT, payload.clone());
        }
    }

    pub fn close_room(&self, room_id: &str) {
        let state = self.shared.state.lock();
        let room_id = RoomId::from(room_id);
        for client in state.room_members(&room_id) {
            client.send(message::ROOM_CLOSED, json!({ "room_id": room_id }));
        }
    }

    /// Push an arbitrary message to one connection
    pub fn push(&self, connection_id: &ConnectionId, message_type: &str, data: Value) {
        if let Some(client) = self.shared.state.lock().clients.get(connection_id) {
            client.send(message_type, data);
        }
    }

    /// Connections of a user, in order of connection
    #[must_use]
    pub fn connections_of(&self, user_id: &str) -> Vec<ConnectionId> {
        let state = self.shared.state.lock();
        let mut connections: Vec<ConnectionId> = state
            .clients
            .iter()
            .filter(|(_, c)| c.user_id.as_str() == user_id)
            .map(|(id, _)| id.clone())
            .collect();
        connections.sort();
        connections
    }

    /// Every message a connection sent, in order
    #[must_use]
    pub fn received_from(&self, connection_id: &ConnectionId) -> Vec<Envelope> {
        self.shared
            .state
            .lock()
            .received
            .iter()
            .filter(|(c, _)| c == connection_id)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Every message of one type, from any connection
    #[must_use]
    pub fn received_of_type(&self, message_type: &str) -> Vec<(ConnectionId, Envelope)> {
        self.shared
            .state
            .lock()
            .received
            .iter()
            .filter(|(_, e)| e.message_type == message_type)
            .cloned()
            .collect()
    }

    /// Producers created by a connection
    #[must_use]
    pub fn produced_by(&self, connection_id: &ConnectionId) -> Vec<ProducerId> {
        self.shared
            .state
            .lock()
            .producers
            .iter()
            .filter(|p| &p.connection_id == connection_id)
            .map(|p| p.id.clone())
            .collect()
    }

    /// Producers a connection asked to consume
    #[must_use]
    pub fn consumed_by(&self, connection_id: &ConnectionId) -> Vec<ProducerId> {
        self.received_from(connection_id)
            .into_iter()
            .filter(|e| e.message_type == message::CONSUME)
            .filter_map(|e| e.data.get("producer_id").and_then(Value::as_str).map(ProducerId::from))
            .collect()
    }

    #[must_use]
    pub fn producer_count(&self, room_id: &str) -> usize {
        let room_id = RoomId::from(room_id);
        self.shared
            .state
            .lock()
            .producers
            .iter()
            .filter(|p| p.room_id == room_id)
            .count()
    }
}

impl MockClient {
    fn send(&self, message_type: &str, data: Value) {
        if let Ok(text) = serde_json::to_string(&Envelope::new(message_type, data)) {
            let _ = self.tx.send(text);
        }
    }
}

impl SfuState {
    fn room_members(&self, room_id: &RoomId) -> Vec<&MockClient> {
        self.clients
            .values()
            .filter(|c| c.room.as_ref() == Some(room_id))
            .collect()
    }

    fn close_producer(&mut self, producer_id: &ProducerId, skip: Option<&ConnectionId>) {
        let Some(index) = self.producers.iter().position(|p| &p.id == producer_id) else {
            return;
        };
        let producer = self.producers.remove(index);
        let payload = json!({ "producer_id": producer.id, "user_id": producer.user_id });
        for (id, client) in &self.clients {
            if client.room.as_ref() == Some(&producer.room_id) && Some(id) != skip {
                client.send(message::PRODUCER_CLOSED, payload.clone());
            }
        }
    }

    fn depart(&mut self, connection_id: &ConnectionId, omit_connection_ids: bool) {
        let Some(client) = self.clients.get_mut(connection_id) else {
            return;
        };
        let Some(room_id) = client.room.take() else {
            return;
        };
        let user_id = client.user_id.clone();
        self.producers.retain(|p| &p.connection_id != connection_id);
        let payload = peer_left(&room_id, &user_id, connection_id, omit_connection_ids);
        for client in self.room_members(&room_id) {
            client.send(message::PEER_LEFT, payload.clone());
        }
    }
}

fn announcement(producer: &MockProducer, options: &MockSfuOptions) -> Value {
    let mut data = json!({
        "producer_id": producer.id,
        "user_id": producer.user_id,
        "kind": producer.kind,
        "source": producer.source,
    });
    if !options.omit_connection_ids {
        data["connection_id"] = json!(producer.connection_id);
    }
    data
}

fn peer_left(room_id: &RoomId, user_id: &UserId, connection_id: &ConnectionId, omit: bool) -> Value {
    let mut data = json!({ "user_id": user_id, "room_id": room_id });
    if !omit {
        data["connection_id"] = json!(connection_id);
    }
    data
}

fn transport_params(id: String) -> Value {
    json!({
        "id": id,
        "ice_parameters": { "usernameFragment": "frag", "password": "pw", "iceLite": true },
        "ice_candidates": [],
        "dtls_parameters": { "role": "auto", "fingerprints": [] },
    })
}

async fn serve(shared: Arc<SfuShared>, mut end: ServerEnd) {
    let connection_id = end.connection_id.clone();
    shared.state.lock().clients.insert(
        connection_id.clone(),
        MockClient {
            user_id: end.user_id.clone(),
            tx: end.to_client.clone(),
            room: None,
        },
    );
    end.push(
        "connected",
        json!({ "user_id": end.user_id, "connection_id": connection_id }),
    );

    while let Some(envelope) = end.next().await {
        handle(&shared, &connection_id, envelope);
    }

    let omit = shared.options.lock().omit_connection_ids;
    let mut state = shared.state.lock();
    state.depart(&connection_id, omit);
    state.clients.remove(&connection_id);
    debug!(connection_id = %connection_id, "Mock SFU connection closed");
}

fn handle(shared: &SfuShared, connection_id: &ConnectionId, envelope: Envelope) {
    let options = shared.options.lock().clone();
    let mut state = shared.state.lock();
    state.received.push((connection_id.clone(), envelope.clone()));
    if options.ignore.contains(&envelope.message_type) {
        return;
    }
    let Some(client) = state.clients.get(connection_id) else {
        return;
    };
    let reply = client.tx.clone();
    let user_id = client.user_id.clone();
    let send = |message_type: &str, data: Value| {
        if let Ok(text) = serde_json::to_string(&Envelope::new(message_type, data)) {
            let _ = reply.send(text);
        }
    };
    let data = &envelope.data;
    let room_id = data
        .get("room_id")
        .and_then(Value::as_str)
        .map(RoomId::from);

    match envelope.message_type.as_str() {
        message::PING => send(message::PONG, Value::Null),
        message::JOIN => {
            let Some(room_id) = room_id else {
                send(message::ERROR, json!({ "message": "Missing room_id" }));
                return;
            };
            if let Some(client) = state.clients.get_mut(connection_id) {
                client.room = Some(room_id.clone());
            }
            let existing: Vec<Value> = state
                .producers
                .iter()
                .filter(|p| p.room_id == room_id && &p.connection_id != connection_id)
                .map(|p| announcement(p, &options))
                .collect();

            if options.announce_before_transports {
                for data in &existing {
                    send(message::NEW_PRODUCER, data.clone());
                }
            }
            send(
                message::ROUTER_CAPABILITIES,
                json!({ "rtp_capabilities": { "codecs": [
                    { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
                    { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
                ] } }),
            );
            send(
                message::TRANSPORT_CREATED,
                json!({
                    "send_transport": transport_params(format!("send-{connection_id}")),
                    "recv_transport": transport_params(format!("recv-{connection_id}")),
                    "ice_servers": [{ "urls": ["stun:stun.example.com:3478"] }],
                    "force_relay": false,
                }),
            );
            if !options.announce_before_transports {
                for data in existing {
                    send(message::NEW_PRODUCER, data);
                }
            }
        }
        message::CONNECT_TRANSPORT => {}
        message::PRODUCE => {
            let Some(room_id) = room_id else {
                send(message::ERROR, json!({ "message": "Missing room_id" }));
                return;
            };
            let Ok(kind) = serde_json::from_value::<MediaKind>(data["kind"].clone()) else {
                send(message::ERROR, json!({ "message": "Invalid kind" }));
                return;
            };
            let source = serde_json::from_value::<MediaSource>(data["source"].clone())
                .unwrap_or_else(|_| MediaSource::default_for(kind));
            let producer = MockProducer {
                id: ProducerId::new(format!(
                    "prod-{}",
                    shared.next_id.fetch_add(1, Ordering::SeqCst)
                )),
                room_id: room_id.clone(),
                user_id,
                connection_id: connection_id.clone(),
                kind,
                source,
            };
            send(message::PRODUCE_RESULT, json!({ "id": producer.id }));

            let payload = announcement(&producer, &options);
            for (id, client) in &state.clients {
                let member = client.room.as_ref() == Some(&room_id);
                if member && (id != connection_id || options.echo_own_producers) {
                    client.send(message::NEW_PRODUCER, payload.clone());
                }
            }
            state.producers.push(producer);
        }
        message::CONSUME => {
            let producer_id = data.get("producer_id").and_then(Value::as_str).map(ProducerId::from);
            let producer = producer_id
                .as_ref()
                .and_then(|id| state.producers.iter().find(|p| &p.id == id).cloned());
            let Some(producer) = producer else {
                send(message::ERROR, json!({ "message": "consume failed: producer not found" }));
                return;
            };
            let consumer_id = ConsumerId::new(format!(
                "cons-{}",
                shared.next_id.fetch_add(1, Ordering::SeqCst)
            ));
            state.consumers.insert(consumer_id.clone(), producer.id.clone());
            send(
                message::CONSUMER_CREATED,
                json!({
                    "id": consumer_id,
                    "producer_id": producer.id,
                    "kind": producer.kind,
                    "rtp_parameters": { "mid": consumer_id },
                }),
            );
        }
        message::PRODUCER_CLOSE => {
            if let Some(id) = data.get("producer_id").and_then(Value::as_str) {
                state.close_producer(&ProducerId::from(id), Some(connection_id));
            }
        }
        message::LEAVE => state.depart(connection_id, options.omit_connection_ids),
        other => debug!(message_type = other, "Mock SFU ignoring message"),
    }
}

// ---------------------------------------------------------------------------
// Fake WebRTC engine
// ---------------------------------------------------------------------------

pub struct FakeProducer {
    id: ProducerId,
    source: MediaSource,
    track: MediaTrack,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl ProducerHandle for FakeProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }
    fn kind(&self) -> MediaKind {
        self.track.kind()
    }
    fn source(&self) -> MediaSource {
        self.source
    }
    fn track(&self) -> &MediaTrack {
        &self.track
    }
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }
    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakeConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    track: MediaTrack,
    closed: AtomicBool,
}

impl FakeConsumer {
    #[must_use]
    pub fn new(consumer_id: &str, producer_id: &str, kind: MediaKind) -> Self {
        Self {
            id: ConsumerId::from(consumer_id),
            producer_id: ProducerId::from(producer_id),
            track: MediaTrack::with_id(format!("track-{consumer_id}"), kind, "remote"),
            closed: AtomicBool::new(false),
        }
    }
}

impl ConsumerHandle for FakeConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }
    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }
    fn kind(&self) -> MediaKind {
        self.track.kind()
    }
    fn track(&self) -> &MediaTrack {
        &self.track
    }
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.track.end();
        }
    }
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Transport that performs the DTLS/produce handshakes through its events
pub struct FakeTransport {
    id: TransportId,
    direction: TransportDirection,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<TransportConnectionState>,
    connect: tokio::sync::Mutex<bool>,
    stats: Mutex<TransportStats>,
    producers: Mutex<Vec<Arc<FakeProducer>>>,
    consumers: Mutex<Vec<Arc<FakeConsumer>>>,
}

impl FakeTransport {
    fn new(
        id: TransportId,
        direction: TransportDirection,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            id,
            direction,
            events,
            state: Mutex::new(TransportConnectionState::New),
            connect: tokio::sync::Mutex::new(false),
            stats: Mutex::new(TransportStats::default()),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        });
        (transport, rx)
    }

    #[must_use]
    pub fn direction(&self) -> TransportDirection {
        self.direction
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.state.lock() == TransportConnectionState::Closed
    }

    /// Simulate an ICE/DTLS state transition
    pub fn set_state(&self, state: TransportConnectionState) {
        *self.state.lock() = state;
        let _ = self.events.send(TransportEvent::StateChanged(state));
    }

    pub fn set_stats(&self, stats: TransportStats) {
        *self.stats.lock() = stats;
    }

    #[must_use]
    pub fn producers(&self) -> Vec<Arc<FakeProducer>> {
        self.producers.lock().clone()
    }

    #[must_use]
    pub fn consumers(&self) -> Vec<Arc<FakeConsumer>> {
        self.consumers.lock().clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Negotiation(format!("transport {} is closed", self.id)));
        }
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<()> {
        let mut connected = self.connect.lock().await;
        if *connected {
            return Ok(());
        }
        let (reply, done) = oneshot::channel();
        self.events
            .send(TransportEvent::NeedsDtls {
                dtls_parameters: json!({ "role": "client", "fingerprints": [] }),
                reply,
            })
            .map_err(|_| Error::Negotiation("transport driver gone".to_string()))?;
        done.await
            .map_err(|_| Error::Negotiation("connect abandoned".to_string()))??;
        *connected = true;
        self.set_state(TransportConnectionState::Connecting);
        self.set_state(TransportConnectionState::Connected);
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn connection_state(&self) -> TransportConnectionState {
        *self.state.lock()
    }

    async fn stats(&self) -> Result<TransportStats> {
        Ok(self.stats.lock().clone())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if *state == TransportConnectionState::Closed {
            return;
        }
        *state = TransportConnectionState::Closed;
        drop(state);
        for producer in self.producers.lock().iter() {
            producer.close();
        }
        for consumer in self.consumers.lock().iter() {
            consumer.close();
        }
    }
}

#[async_trait]
impl SendTransport for FakeTransport {
    async fn produce(
        &self,
        track: MediaTrack,
        source: MediaSource,
    ) -> Result<Arc<dyn ProducerHandle>> {
        self.ensure_open()?;
        self.ensure_connected().await?;

        let (reply, done) = oneshot::channel();
        self.events
            .send(TransportEvent::NeedsProduce {
                kind: track.kind(),
                rtp_parameters: json!({ "mid": track.id(), "codecs": [] }),
                source,
                reply,
            })
            .map_err(|_| Error::Negotiation("transport driver gone".to_string()))?;
        let id = done
            .await
            .map_err(|_| Error::Negotiation("produce abandoned".to_string()))??;

        let producer = Arc::new(FakeProducer {
            id,
            source,
            track,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.producers.lock().push(Arc::clone(&producer));
        Ok(producer)
    }
}

#[async_trait]
impl RecvTransport for FakeTransport {
    async fn consume(&self, params: ConsumerParams) -> Result<Arc<dyn ConsumerHandle>> {
        self.ensure_open()?;
        self.ensure_connected().await?;
        let consumer = Arc::new(FakeConsumer::new(
            params.id.as_str(),
            params.producer_id.as_str(),
            params.kind,
        ));
        self.consumers.lock().push(Arc::clone(&consumer));
        Ok(consumer)
    }
}

#[derive(Default)]
struct FakeEngineState {
    loaded: bool,
    fail_load: bool,
    last_options: Option<TransportOptions>,
    transports: Vec<Arc<FakeTransport>>,
}

/// Engine that negotiates nothing but drives the same events a real one would
#[derive(Default)]
pub struct FakeEngine {
    state: Mutex<FakeEngineState>,
}

impl FakeEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_load(&self, fail: bool) {
        self.state.lock().fail_load = fail;
    }

    #[must_use]
    pub fn loaded(&self) -> bool {
        self.state.lock().loaded
    }

    #[must_use]
    pub fn last_options(&self) -> Option<TransportOptions> {
        self.state.lock().last_options.clone()
    }

    /// Transports not yet closed
    #[must_use]
    pub fn open_transports(&self) -> usize {
        self.state
            .lock()
            .transports
            .iter()
            .filter(|t| !t.is_closed())
            .count()
    }

    /// Most recent transport of a direction
    #[must_use]
    pub fn transport(&self, direction: TransportDirection) -> Option<Arc<FakeTransport>> {
        self.state
            .lock()
            .transports
            .iter()
            .rev()
            .find(|t| t.direction == direction)
            .cloned()
    }

    /// Producers ever created, open or closed
    #[must_use]
    pub fn producers(&self) -> Vec<Arc<FakeProducer>> {
        self.state
            .lock()
            .transports
            .iter()
            .flat_map(|t| t.producers())
            .collect()
    }

    #[must_use]
    pub fn consumers(&self) -> Vec<Arc<FakeConsumer>> {
        self.state
            .lock()
            .transports
            .iter()
            .flat_map(|t| t.consumers())
            .collect()
    }

    fn create(
        &self,
        options: TransportOptions,
        direction: TransportDirection,
    ) -> Result<(Arc<FakeTransport>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let mut state = self.state.lock();
        if !state.loaded {
            return Err(Error::Negotiation("engine not loaded".to_string()));
        }
        let (transport, events) = FakeTransport::new(options.id().clone(), direction);
        state.last_options = Some(options);
        state.transports.push(Arc::clone(&transport));
        Ok((transport, events))
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn load(&self, router_rtp_capabilities: &Value) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_load {
            return Err(Error::Negotiation("unsupported router capabilities".to_string()));
        }
        debug!(capabilities = %router_rtp_capabilities, "Fake engine loaded");
        state.loaded = true;
        Ok(())
    }

    fn rtp_capabilities(&self) -> Result<Value> {
        if !self.state.lock().loaded {
            return Err(Error::Negotiation("engine not loaded".to_string()));
        }
        Ok(json!({ "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
            { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
        ] }))
    }

    fn create_send_transport(
        &self,
        options: TransportOptions,
    ) -> Result<(Arc<dyn SendTransport>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (transport, events) = self.create(options, TransportDirection::Send)?;
        let transport: Arc<dyn SendTransport> = transport;
        Ok((transport, events))
    }

    fn create_recv_transport(
        &self,
        options: TransportOptions,
    ) -> Result<(Arc<dyn RecvTransport>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (transport, events) = self.create(options, TransportDirection::Recv)?;
        let transport: Arc<dyn RecvTransport> = transport;
        Ok((transport, events))
    }
}

// ---------------------------------------------------------------------------
// Fake capture devices
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeDevices {
    camera_error: Mutex<Option<DeviceError>>,
    microphone_error: Mutex<Option<DeviceError>>,
    display_error: Mutex<Option<DeviceError>>,
    hang: AtomicBool,
    user_media_calls: AtomicUsize,
    captured: Mutex<Vec<MediaTrack>>,
}

impl FakeDevices {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_camera(&self, error: DeviceError) {
        *self.camera_error.lock() = Some(error);
    }

    pub fn fail_microphone(&self, error: DeviceError) {
        *self.microphone_error.lock() = Some(error);
    }

    pub fn fail_display(&self, error: DeviceError) {
        *self.display_error.lock() = Some(error);
    }

    /// Leave user-media prompts unanswered forever
    pub fn hang_user_media(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    #[must_use]
    pub fn user_media_calls(&self) -> usize {
        self.user_media_calls.load(Ordering::SeqCst)
    }

    /// Every track handed out so far
    #[must_use]
    pub fn captured(&self) -> Vec<MediaTrack> {
        self.captured.lock().clone()
    }

    #[must_use]
    pub fn live_tracks(&self) -> usize {
        self.captured.lock().iter().filter(|t| t.is_live()).count()
    }

    #[must_use]
    pub fn last_display_track(&self) -> Option<MediaTrack> {
        self.captured
            .lock()
            .iter()
            .rev()
            .find(|t| t.label() == "screen")
            .cloned()
    }

    fn capture(&self, kind: MediaKind, label: &str) -> MediaTrack {
        let track = MediaTrack::new(kind, label);
        self.captured.lock().push(track.clone());
        track
    }
}

#[async_trait]
impl CaptureDevices for FakeDevices {
    async fn user_media(
        &self,
        constraints: MediaConstraints,
    ) -> std::result::Result<MediaStream, DeviceError> {
        self.user_media_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if constraints.video {
            if let Some(e) = self.camera_error.lock().clone() {
                return Err(e);
            }
        }
        if constraints.audio {
            if let Some(e) = self.microphone_error.lock().clone() {
                return Err(e);
            }
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(self.capture(MediaKind::Audio, "microphone"));
        }
        if constraints.video {
            tracks.push(self.capture(MediaKind::Video, "camera"));
        }
        Ok(MediaStream::new(tracks))
    }

    async fn display_media(&self) -> std::result::Result<MediaStream, DeviceError> {
        if let Some(e) = self.display_error.lock().clone() {
            return Err(e);
        }
        Ok(MediaStream::new(vec![self.capture(MediaKind::Video, "screen")]))
    }
}

// ---------------------------------------------------------------------------
// Fake audio analysis
// ---------------------------------------------------------------------------

#[derive(Default)]
struct AudioShared {
    levels: Mutex<HashMap<String, u8>>,
    open_contexts: AtomicUsize,
    open_analysers: AtomicUsize,
}

/// Audio backend whose analysers report a settable level per track
#[derive(Default)]
pub struct FakeAudioBackend {
    shared: Arc<AudioShared>,
    fail_open: AtomicBool,
}

impl FakeAudioBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every frequency bin of the track reports `level`
    pub fn set_level(&self, track_id: &str, level: u8) {
        self.shared.levels.lock().insert(track_id.to_string(), level);
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn open_contexts(&self) -> usize {
        self.shared.open_contexts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn open_analysers(&self) -> usize {
        self.shared.open_analysers.load(Ordering::SeqCst)
    }
}

impl AudioBackend for FakeAudioBackend {
    fn open_context(&self) -> Result<Arc<dyn AudioContext>> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(Error::Device(DeviceError::Unavailable("audio context".to_string())));
        }
        self.shared.open_contexts.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeAudioContext {
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeAudioContext {
    shared: Arc<AudioShared>,
    closed: AtomicBool,
}

impl AudioContext for FakeAudioContext {
    fn create_analyser(&self, track: &MediaTrack, _fft_bins: usize) -> Result<Box<dyn AudioAnalyser>> {
        self.shared.open_analysers.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeAnalyser {
            track_id: track.id().to_string(),
            shared: Arc::clone(&self.shared),
            connected: true,
        }))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.open_contexts.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct FakeAnalyser {
    track_id: String,
    shared: Arc<AudioShared>,
    connected: bool,
}

impl AudioAnalyser for FakeAnalyser {
    fn frequency_data(&mut self, bins: &mut [u8]) {
        let level = self.shared.levels.lock().get(&self.track_id).copied().unwrap_or(0);
        bins.fill(level);
    }

    fn disconnect(&mut self) {
        if std::mem::take(&mut self.connected) {
            self.shared.open_analysers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
