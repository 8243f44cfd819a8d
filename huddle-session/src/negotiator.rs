//! Join handshake and transport negotiation
//!
//! 1. The [`Inbox`] subscribes to remote announcements before `media:join` is
//!    sent, buffering them because the server may announce existing producers
//!    before local transports exist.
//! 2. `media:join` is answered by `media:router_capabilities` and
//!    `media:transport_created` in either order; both are awaited together.
//! 3. The engine is loaded and both transports are built. Each gets a driver
//!    task relaying its [`TransportEvent`]s over signaling.
//! 4. The caller switches the inbox to forwarding, which drains the buffer in
//!    arrival order.

use dashmap::DashSet;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::SessionEvent;
use crate::engine::{
    MediaEngine, RecvTransport, SendTransport, Transport, TransportConnectionState,
    TransportDirection, TransportEvent, TransportOptions,
};
use crate::error::{Error, Result};
use crate::media::QueueSender;
use crate::monitor;
use crate::signaling::message::{
    self, ConnectTransport, JoinRequest, NewProducer, PeerLeft, Produce, ProduceResult,
    ProducerClosed, RouterCapabilities, TransportCreated, TransportParams,
};
use crate::signaling::{Envelope, InboundMessage, SignalingChannel};
use crate::types::{MediaKind, MediaSource, ProducerId, RoomId};

/// Remote notification that changes the composite stream table
#[derive(Debug, Clone, PartialEq)]
pub enum Announcement {
    NewProducer(NewProducer),
    PeerLeft(PeerLeft),
    ProducerClosed(ProducerClosed),
}

enum InboxMode {
    Buffering(Vec<Announcement>),
    Forwarding(QueueSender<Announcement>),
    Closed,
}

/// Collects announcements until the session can act on them
pub struct Inbox {
    mode: Mutex<InboxMode>,
}

impl Inbox {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(InboxMode::Buffering(Vec::new())),
        })
    }

    /// Subscribe to `new_producer`, `peer_left` and `producer_closed`
    pub fn install(self: &Arc<Self>, signaling: &SignalingChannel) {
        self.subscribe::<NewProducer>(signaling, Announcement::NewProducer);
        self.subscribe::<PeerLeft>(signaling, Announcement::PeerLeft);
        self.subscribe::<ProducerClosed>(signaling, Announcement::ProducerClosed);
    }

    pub fn uninstall(signaling: &SignalingChannel) {
        signaling.off_message(message::NEW_PRODUCER);
        signaling.off_message(message::PEER_LEFT);
        signaling.off_message(message::PRODUCER_CLOSED);
    }

    fn subscribe<T>(self: &Arc<Self>, signaling: &SignalingChannel, wrap: fn(T) -> Announcement)
    where
        T: InboundMessage + 'static,
    {
        let inbox = Arc::downgrade(self);
        signaling.on_message(T::TYPE, move |envelope: Envelope| {
            let Some(inbox) = inbox.upgrade() else {
                return;
            };
            match envelope.decode::<T>() {
                Ok(payload) => inbox.push(wrap(payload)),
                Err(e) => warn!(message_type = T::TYPE, error = %e, "Malformed announcement"),
            }
        });
    }

    pub fn push(&self, announcement: Announcement) {
        let mut mode = self.mode.lock();
        match &mut *mode {
            InboxMode::Buffering(buffer) => {
                debug!(?announcement, buffered = buffer.len() + 1, "Buffering announcement");
                buffer.push(announcement);
            }
            InboxMode::Forwarding(queue) => {
                if queue.push(announcement).is_err() {
                    debug!("Announcement queue closed");
                }
            }
            InboxMode::Closed => debug!(?announcement, "Dropping announcement after close"),
        }
    }

    /// Forward everything buffered so far, then everything that follows.
    ///
    /// Returns the number of buffered announcements drained.
    pub fn forward_to(&self, queue: QueueSender<Announcement>) -> Result<usize> {
        let mut mode = self.mode.lock();
        let buffered = match std::mem::replace(&mut *mode, InboxMode::Closed) {
            InboxMode::Buffering(buffer) => buffer,
            InboxMode::Forwarding(previous) => {
                *mode = InboxMode::Forwarding(previous);
                return Ok(0);
            }
            InboxMode::Closed => return Err(Error::SessionClosed),
        };

        let drained = buffered.len();
        for announcement in buffered {
            queue.push(announcement)?;
        }
        *mode = InboxMode::Forwarding(queue);
        Ok(drained)
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        match &*self.mode.lock() {
            InboxMode::Buffering(buffer) => buffer.len(),
            _ => 0,
        }
    }

    pub fn close(&self) {
        *self.mode.lock() = InboxMode::Closed;
    }
}

/// Transports produced by a successful handshake
pub struct NegotiatedTransports {
    pub send: Arc<dyn SendTransport>,
    pub recv: Arc<dyn RecvTransport>,
    /// Local receive capabilities sent with every `media:consume`
    pub rtp_capabilities: Value,
    /// Producers this session created, used to ignore echoes of them
    pub own_producers: Arc<DashSet<ProducerId>>,
    /// Held for the whole produce round-trip, until the id is recorded
    pub produce_gate: Arc<tokio::sync::Mutex<()>>,
    cancel: CancellationToken,
    drivers: Vec<JoinHandle<()>>,
}

impl NegotiatedTransports {
    /// Close both transports and stop their drivers
    pub async fn close(self) {
        self.cancel.cancel();
        self.send.close();
        self.recv.close();
        for driver in self.drivers {
            if let Err(e) = driver.await {
                warn!(error = %e, "Transport driver panicked");
            }
        }
        debug!(
            send_transport_id = %self.send.id(),
            recv_transport_id = %self.recv.id(),
            "Transports closed"
        );
    }
}

/// Signaling half of a join: send `media:join` and wait for both replies,
/// which the server may send in either order.
pub async fn request_join(
    signaling: &SignalingChannel,
    room_id: &RoomId,
    timeout: Duration,
) -> Result<(RouterCapabilities, TransportCreated)> {
    let capabilities = signaling.expect::<RouterCapabilities>()?;
    let created = signaling.expect::<TransportCreated>()?;
    signaling.send(&JoinRequest {
        room_id: room_id.clone(),
    })?;
    debug!(room_id = %room_id, "Join sent, awaiting capabilities and transports");
    tokio::try_join!(capabilities.wait(timeout), created.wait(timeout))
}

#[derive(Clone)]
pub struct TransportNegotiator {
    signaling: SignalingChannel,
    engine: Arc<dyn MediaEngine>,
    events: broadcast::Sender<SessionEvent>,
    join_timeout: Duration,
    produce_timeout: Duration,
}

impl TransportNegotiator {
    #[must_use]
    pub fn new(
        signaling: SignalingChannel,
        engine: Arc<dyn MediaEngine>,
        events: broadcast::Sender<SessionEvent>,
        join_timeout: Duration,
        produce_timeout: Duration,
    ) -> Self {
        Self {
            signaling,
            engine,
            events,
            join_timeout,
            produce_timeout,
        }
    }

    /// Run the join handshake. Either both transports come back ready or
    /// nothing is left behind.
    pub async fn negotiate(
        &self,
        room_id: &RoomId,
        cancel: &CancellationToken,
    ) -> Result<NegotiatedTransports> {
        let (capabilities, created) = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            replies = request_join(&self.signaling, room_id, self.join_timeout) => replies?,
        };

        tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            loaded = self.engine.load(&capabilities.rtp_capabilities) => loaded?,
        }
        let rtp_capabilities = self.engine.rtp_capabilities()?;

        let options = |params: TransportParams| TransportOptions {
            params,
            ice_servers: created.ice_servers.clone(),
            force_relay: created.force_relay,
        };
        let (send, send_events) = self
            .engine
            .create_send_transport(options(created.send_transport.clone()))?;
        let (recv, recv_events) = match self
            .engine
            .create_recv_transport(options(created.recv_transport.clone()))
        {
            Ok(built) => built,
            Err(e) => {
                send.close();
                return Err(e);
            }
        };

        let driver_cancel = cancel.child_token();
        let own_producers = Arc::new(DashSet::new());
        let produce_gate = Arc::new(tokio::sync::Mutex::new(()));
        let driver = TransportDriver {
            room_id: room_id.clone(),
            signaling: self.signaling.clone(),
            events: self.events.clone(),
            own_producers: Arc::clone(&own_producers),
            produce_gate: Arc::clone(&produce_gate),
            produce_timeout: self.produce_timeout,
            cancel: driver_cancel.clone(),
        };
        let drivers = vec![
            tokio::spawn(driver.clone().run(
                TransportDirection::Send,
                Arc::downgrade(&send),
                send_events,
            )),
            tokio::spawn(driver.run(TransportDirection::Recv, Arc::downgrade(&recv), recv_events)),
        ];

        info!(
            room_id = %room_id,
            send_transport_id = %send.id(),
            recv_transport_id = %recv.id(),
            ice_servers = created.ice_servers.len(),
            force_relay = created.force_relay,
            "Transports negotiated"
        );

        Ok(NegotiatedTransports {
            send,
            recv,
            rtp_capabilities,
            own_producers,
            produce_gate,
            cancel: driver_cancel,
            drivers,
        })
    }
}

/// Relays one transport's events over signaling
#[derive(Clone)]
struct TransportDriver {
    room_id: RoomId,
    signaling: SignalingChannel,
    events: broadcast::Sender<SessionEvent>,
    own_producers: Arc<DashSet<ProducerId>>,
    produce_gate: Arc<tokio::sync::Mutex<()>>,
    produce_timeout: Duration,
    cancel: CancellationToken,
}

impl TransportDriver {
    async fn run<T>(
        self,
        direction: TransportDirection,
        transport: Weak<T>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) where
        T: Transport + ?Sized,
    {
        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                TransportEvent::NeedsDtls {
                    dtls_parameters,
                    reply,
                } => {
                    let Some(transport_id) = transport.upgrade().map(|t| t.id().clone()) else {
                        break;
                    };
                    debug!(%direction, transport_id = %transport_id, "Relaying DTLS parameters");
                    let sent = self.signaling.send(&ConnectTransport {
                        room_id: self.room_id.clone(),
                        transport_id,
                        dtls_parameters,
                    });
                    let _ = reply.send(sent);
                }
                TransportEvent::NeedsProduce {
                    kind,
                    rtp_parameters,
                    source,
                    reply,
                } => {
                    let driver = self.clone();
                    tokio::spawn(async move {
                        let produced = tokio::select! {
                            () = driver.cancel.cancelled() => Err(Error::Cancelled),
                            produced = driver.relay_produce(kind, rtp_parameters, source) => produced,
                        };
                        let _ = reply.send(produced);
                    });
                }
                TransportEvent::StateChanged(state) => {
                    self.on_state(direction, &transport, state).await;
                }
            }
        }
        debug!(%direction, "Transport driver stopped");
    }

    async fn relay_produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
        source: MediaSource,
    ) -> Result<ProducerId> {
        // one produce round-trip at a time: replies carry no correlation id
        let _gate = self.produce_gate.lock().await;
        let waiter = self.signaling.expect::<ProduceResult>()?;
        self.signaling.send(&Produce {
            room_id: self.room_id.clone(),
            kind,
            rtp_parameters,
            source,
        })?;
        let result = waiter.wait(self.produce_timeout).await?;
        self.own_producers.insert(result.id.clone());
        info!(producer_id = %result.id, %kind, %source, "Producer created");
        Ok(result.id)
    }

    async fn on_state<T>(&self, direction: TransportDirection, transport: &Weak<T>, state: TransportConnectionState)
    where
        T: Transport + ?Sized,
    {
        debug!(%direction, ?state, "Transport state changed");
        let _ = self
            .events
            .send(SessionEvent::TransportStateChanged { direction, state });

        if state != TransportConnectionState::Failed {
            return;
        }
        let Some(transport) = transport.upgrade() else {
            return;
        };
        match transport.stats().await {
            Ok(stats) => {
                let health = monitor::assess(direction, state, stats);
                warn!(
                    %direction,
                    transport_id = %transport.id(),
                    rtt_ms = health.rtt_ms,
                    packet_loss_rate = health.packet_loss_rate,
                    quality_score = health.quality_score,
                    candidate_pair = ?health.selected_candidate_pair,
                    "Transport failed"
                );
                let _ = self
                    .events
                    .send(SessionEvent::TransportDegraded { direction, health });
            }
            Err(e) => warn!(%direction, transport_id = %transport.id(), error = %e, "Transport failed, stats unavailable"),
        }
    }
}
