//! Session coordinator
//!
//! Owns the join/leave state machine:
//!
//! ```text
//! Idle -> Joining -> Joined -> Leaving -> Idle
//! ```
//!
//! Everything created by a join (transports, producers, consumers, composite
//! streams, speaker detection) lives in one `ActiveSession` that leave tears
//! down step by step. A failing step is logged and the next one still runs.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::composer::{RemoteStream, StreamComposer};
use crate::config::Config;
use crate::engine::{MediaEngine, TransportConnectionState, TransportDirection};
use crate::error::{Error, Result};
use crate::media::{
    CaptureDevices, LocalMediaStatus, MediaConstraints, MediaDeps, MediaResourceManager,
    SerialQueue,
};
use crate::monitor::TransportHealth;
use crate::negotiator::{Announcement, Inbox, NegotiatedTransports, TransportNegotiator};
use crate::signaling::message::{self, LeaveRequest, MediaError, RoomClosed};
use crate::signaling::{ConnectionState, SignalingChannel};
use crate::speaker::{ActiveSpeakerDetector, AudioBackend};
use crate::types::{ProducerId, RoomId, StreamKey, TenantId};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Joining,
    Joined,
    Leaving,
}

/// The room this process is in, if any
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Session {
    pub state: SessionState,
    pub tenant_id: Option<TenantId>,
    pub room_id: Option<RoomId>,
    pub room_name: Option<String>,
}

/// Change notification for the presentation layer
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    SignalingStateChanged(ConnectionState),
    StreamAdded(RemoteStream),
    StreamUpdated(RemoteStream),
    StreamRemoved(StreamKey),
    ActiveSpeakerChanged(Option<StreamKey>),
    TransportStateChanged {
        direction: TransportDirection,
        state: TransportConnectionState,
    },
    TransportDegraded {
        direction: TransportDirection,
        health: TransportHealth,
    },
    LocalMediaChanged(LocalMediaStatus),
    ScreenShareEnded {
        external: bool,
    },
    ServerError(String),
    RoomClosed(RoomId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTarget {
    pub tenant_id: Option<TenantId>,
    pub room_id: RoomId,
    pub room_name: Option<String>,
}

impl JoinTarget {
    pub fn room(room_id: impl Into<RoomId>) -> Self {
        Self {
            tenant_id: None,
            room_id: room_id.into(),
            room_name: None,
        }
    }
}

/// Which local devices to capture on join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOptions {
    pub audio: bool,
    pub video: bool,
}

impl JoinOptions {
    pub const WITHOUT_MEDIA: Self = Self {
        audio: false,
        video: false,
    };
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinReport {
    pub room_id: RoomId,
    /// Announcements received before the transports were ready
    pub drained_announcements: usize,
    pub local_media: LocalMediaStatus,
    /// The call reaffirmed an existing membership of the same room
    pub already_joined: bool,
}

/// External collaborators of the coordinator
pub struct Collaborators {
    pub engine: Arc<dyn MediaEngine>,
    pub devices: Arc<dyn CaptureDevices>,
    pub audio: Arc<dyn AudioBackend>,
}

struct ActiveSession {
    room_id: RoomId,
    cancel: CancellationToken,
    inbox: Arc<Inbox>,
    transports: Mutex<Option<NegotiatedTransports>>,
    media: Arc<MediaResourceManager>,
    composer: Arc<StreamComposer>,
    detector: ActiveSpeakerDetector,
    queue: SerialQueue<Announcement>,
}

pub struct SessionCoordinator {
    config: Config,
    signaling: SignalingChannel,
    negotiator: TransportNegotiator,
    devices: Arc<dyn CaptureDevices>,
    audio: Arc<dyn AudioBackend>,
    events: broadcast::Sender<SessionEvent>,
    session: Mutex<Session>,
    state: watch::Sender<SessionState>,
    join_cancel: Mutex<Option<CancellationToken>>,
    active: Mutex<Option<Arc<ActiveSession>>>,
    op_lock: tokio::sync::Mutex<()>,
    signaling_watch: Mutex<Option<JoinHandle<()>>>,
    me: Weak<Self>,
}

impl SessionCoordinator {
    #[must_use]
    pub fn new(config: Config, signaling: SignalingChannel, collaborators: Collaborators) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(SessionState::Idle);
        let negotiator = TransportNegotiator::new(
            signaling.clone(),
            collaborators.engine,
            events.clone(),
            config.session.join_timeout(),
            config.session.produce_timeout(),
        );

        let signaling_watch = tokio::spawn({
            let mut changes = signaling.state_changes();
            let events = events.clone();
            async move {
                while changes.changed().await.is_ok() {
                    let state = *changes.borrow_and_update();
                    let _ = events.send(SessionEvent::SignalingStateChanged(state));
                }
            }
        });

        Arc::new_cyclic(|me| Self {
            config,
            signaling,
            negotiator,
            devices: collaborators.devices,
            audio: collaborators.audio,
            events,
            session: Mutex::new(Session::default()),
            state,
            join_cancel: Mutex::new(None),
            active: Mutex::new(None),
            op_lock: tokio::sync::Mutex::new(()),
            signaling_watch: Mutex::new(Some(signaling_watch)),
            me: me.clone(),
        })
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn session(&self) -> Session {
        self.session.lock().clone()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.lock().state
    }

    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn signaling(&self) -> &SignalingChannel {
        &self.signaling
    }

    /// Join a room.
    ///
    /// Joining the room already joined is a no-op; joining another one while
    /// joined is refused until the caller leaves.
    pub async fn join(&self, target: JoinTarget, options: JoinOptions) -> Result<JoinReport> {
        let cancel = loop {
            {
                let mut session = self.session.lock();
                match session.state {
                    SessionState::Idle => {
                        session.state = SessionState::Joining;
                        session.tenant_id = target.tenant_id.clone();
                        session.room_id = Some(target.room_id.clone());
                        session.room_name = target.room_name.clone();
                        let cancel = CancellationToken::new();
                        *self.join_cancel.lock() = Some(cancel.clone());
                        self.publish_state(SessionState::Joining);
                        break cancel;
                    }
                    SessionState::Joined => {
                        let current = session.room_id.clone();
                        drop(session);
                        return self.reaffirm(&target.room_id, current);
                    }
                    SessionState::Joining => return Err(Error::JoinInProgress),
                    SessionState::Leaving => {}
                }
            }
            self.wait_idle().await;
        };

        info!(room_id = %target.room_id, tenant_id = ?target.tenant_id, "Joining room");
        let _op = self.op_lock.lock().await;

        match self.run_join(&target, options, &cancel).await {
            Ok((active, report)) => {
                let installed = {
                    let mut session = self.session.lock();
                    if cancel.is_cancelled() || session.state != SessionState::Joining {
                        false
                    } else {
                        *self.active.lock() = Some(Arc::clone(&active));
                        session.state = SessionState::Joined;
                        self.publish_state(SessionState::Joined);
                        true
                    }
                };
                if !installed {
                    self.teardown(&active).await;
                    return Err(Error::Cancelled);
                }
                info!(
                    room_id = %report.room_id,
                    drained = report.drained_announcements,
                    streams = active.composer.len(),
                    "Joined room"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(room_id = %target.room_id, error = %e, "Join failed");
                if !cancel.is_cancelled() {
                    self.notify_leave(&target.room_id);
                    self.reset_session();
                }
                Err(e)
            }
        }
    }

    fn reaffirm(&self, room_id: &RoomId, current: Option<RoomId>) -> Result<JoinReport> {
        match current {
            Some(current) if &current == room_id => {
                debug!(room_id = %room_id, "Already joined");
                let local_media = self
                    .active
                    .lock()
                    .as_ref()
                    .map(|active| active.media.status())
                    .unwrap_or_default();
                self.publish_state(SessionState::Joined);
                Ok(JoinReport {
                    room_id: room_id.clone(),
                    drained_announcements: 0,
                    local_media,
                    already_joined: true,
                })
            }
            Some(current) => Err(Error::AlreadyJoined { current }),
            None => Err(Error::NotJoined),
        }
    }

    async fn run_join(
        &self,
        target: &JoinTarget,
        options: JoinOptions,
        cancel: &CancellationToken,
    ) -> Result<(Arc<ActiveSession>, JoinReport)> {
        let room_id = target.room_id.clone();

        // subscribe before media:join goes out
        let inbox = Inbox::new();
        inbox.install(&self.signaling);
        self.install_session_handlers(&room_id);

        let transports = match self.negotiator.negotiate(&room_id, cancel).await {
            Ok(transports) => transports,
            Err(e) => {
                inbox.close();
                self.uninstall_handlers();
                return Err(e);
            }
        };

        let composer = Arc::new(StreamComposer::new(self.events.clone()));
        let media = MediaResourceManager::new(MediaDeps {
            room_id: room_id.clone(),
            signaling: self.signaling.clone(),
            devices: Arc::clone(&self.devices),
            send: Arc::clone(&transports.send),
            recv: Arc::clone(&transports.recv),
            rtp_capabilities: transports.rtp_capabilities.clone(),
            own_producers: Arc::clone(&transports.own_producers),
            produce_gate: Arc::clone(&transports.produce_gate),
            composer: Arc::clone(&composer),
            events: self.events.clone(),
            consume_timeout: self.config.session.consume_timeout(),
            cancel: cancel.clone(),
        });
        let queue = {
            let media = Arc::clone(&media);
            let composer = Arc::clone(&composer);
            let room_id = room_id.clone();
            SerialQueue::spawn("announcements", cancel.child_token(), move |announcement| {
                let media = Arc::clone(&media);
                let composer = Arc::clone(&composer);
                let room_id = room_id.clone();
                async move { apply_announcement(&media, &composer, &room_id, announcement).await }
            })
        };
        let detector = ActiveSpeakerDetector::new(
            self.config.speaker.clone(),
            Arc::clone(&self.audio),
            Arc::clone(&composer),
            self.events.clone(),
        );

        let active = Arc::new(ActiveSession {
            room_id: room_id.clone(),
            cancel: cancel.clone(),
            inbox,
            transports: Mutex::new(Some(transports)),
            media,
            composer,
            detector,
            queue,
        });

        match self.finish_join(&active, options).await {
            Ok(report) => Ok((active, report)),
            Err(e) => {
                self.teardown(&active).await;
                Err(e)
            }
        }
    }

    async fn finish_join(&self, active: &ActiveSession, options: JoinOptions) -> Result<JoinReport> {
        let drained = active.inbox.forward_to(active.queue.sender())?;
        if drained > 0 {
            debug!(room_id = %active.room_id, drained, "Replaying buffered announcements");
        }

        let constraints = MediaConstraints {
            audio: options.audio,
            video: options.video,
        };
        let local_media = if constraints.is_empty() {
            active.media.status()
        } else {
            active.media.acquire_local_media(constraints).await
        };
        if active.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        active.queue.flush().await?;

        if let Err(e) = active.detector.start() {
            warn!(room_id = %active.room_id, error = %e, "Active speaker detection unavailable");
        }

        Ok(JoinReport {
            room_id: active.room_id.clone(),
            drained_announcements: drained,
            local_media,
            already_joined: false,
        })
    }

    /// Leave the current room. Safe to call at any time, any number of times.
    pub async fn leave(&self) -> Result<()> {
        let room_id = {
            let mut session = self.session.lock();
            match session.state {
                SessionState::Idle => {
                    debug!("Leave while idle");
                    return Ok(());
                }
                SessionState::Leaving => None,
                SessionState::Joining | SessionState::Joined => {
                    session.state = SessionState::Leaving;
                    self.publish_state(SessionState::Leaving);
                    if let Some(cancel) = self.join_cancel.lock().take() {
                        cancel.cancel();
                    }
                    session.room_id.clone()
                }
            }
        };

        let Some(room_id) = room_id else {
            self.wait_idle().await;
            return Ok(());
        };

        info!(room_id = %room_id, "Leaving room");
        self.notify_leave(&room_id);

        let _op = self.op_lock.lock().await;
        let active = self.active.lock().take();
        if let Some(active) = active {
            self.teardown(&active).await;
        }
        self.uninstall_handlers();
        self.reset_session();
        info!(room_id = %room_id, "Left room");
        Ok(())
    }

    /// Leave and stop the signaling channel
    pub async fn shutdown(&self) {
        if let Err(e) = self.leave().await {
            warn!(error = %e, "Leave during shutdown failed");
        }
        if let Some(task) = self.signaling_watch.lock().take() {
            task.abort();
        }
        self.signaling.close().await;
    }

    async fn teardown(&self, active: &ActiveSession) {
        active.cancel.cancel();
        active.inbox.close();

        active.detector.stop().await;
        active.queue.close().await;

        let producers = active.media.close_producers();
        let consumers = active.composer.close_consumers();

        let transports = active.transports.lock().take();
        if let Some(transports) = transports {
            transports.close().await;
        }

        let tracks = active.media.stop_local_tracks();
        active.composer.clear();
        self.uninstall_handlers();

        info!(
            room_id = %active.room_id,
            producers,
            consumers,
            tracks,
            "Session resources released"
        );
    }

    fn notify_leave(&self, room_id: &RoomId) {
        if let Err(e) = self.signaling.send(&LeaveRequest {
            room_id: room_id.clone(),
        }) {
            warn!(room_id = %room_id, error = %e, "Failed to notify leave");
        }
    }

    fn reset_session(&self) {
        let mut session = self.session.lock();
        *session = Session::default();
        self.join_cancel.lock().take();
        self.publish_state(SessionState::Idle);
    }

    fn publish_state(&self, state: SessionState) {
        self.state.send_replace(state);
        let _ = self.events.send(SessionEvent::StateChanged(state));
    }

    async fn wait_idle(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Idle).await;
    }

    fn install_session_handlers(&self, room_id: &RoomId) {
        let me = self.me.clone();
        let joined_room = room_id.clone();
        self.signaling.on_message(message::ROOM_CLOSED, move |envelope| {
            let Ok(closed) = envelope.decode::<RoomClosed>() else {
                return;
            };
            if closed.room_id != joined_room {
                return;
            }
            let Some(coordinator) = me.upgrade() else {
                return;
            };
            warn!(room_id = %closed.room_id, "Room closed by server");
            let _ = coordinator.events.send(SessionEvent::RoomClosed(closed.room_id));
            tokio::spawn(async move {
                if let Err(e) = coordinator.leave().await {
                    warn!(error = %e, "Leave after room close failed");
                }
            });
        });

        let events = self.events.clone();
        self.signaling.on_message(message::ERROR, move |envelope| {
            let reason = envelope
                .decode::<MediaError>()
                .map_or_else(|_| "unknown server error".to_string(), |e| e.message);
            warn!(reason = %reason, "Server reported a media error");
            let _ = events.send(SessionEvent::ServerError(reason));
        });
    }

    fn uninstall_handlers(&self) {
        Inbox::uninstall(&self.signaling);
        self.signaling.off_message(message::ROOM_CLOSED);
        self.signaling.off_message(message::ERROR);
    }

    fn joined(&self) -> Result<Arc<ActiveSession>> {
        if self.state() != SessionState::Joined {
            return Err(Error::NotJoined);
        }
        self.active.lock().clone().ok_or(Error::NotJoined)
    }

    /// Returns `true` when now muted
    pub fn toggle_mute(&self) -> Result<bool> {
        self.joined()?.media.toggle_mute()
    }

    /// Returns `true` when video is now enabled
    pub fn toggle_video(&self) -> Result<bool> {
        self.joined()?.media.toggle_video()
    }

    pub async fn start_screen_share(&self) -> Result<ProducerId> {
        self.joined()?.media.start_screen_share().await
    }

    pub fn stop_screen_share(&self) -> Result<()> {
        self.joined()?.media.stop_screen_share();
        Ok(())
    }

    /// Capture local media after joining without it
    pub async fn acquire_local_media(&self, options: JoinOptions) -> Result<LocalMediaStatus> {
        let active = self.joined()?;
        Ok(active
            .media
            .acquire_local_media(MediaConstraints {
                audio: options.audio,
                video: options.video,
            })
            .await)
    }

    #[must_use]
    pub fn local_media(&self) -> Option<LocalMediaStatus> {
        self.active.lock().as_ref().map(|active| active.media.status())
    }

    /// Composite remote streams in order of first appearance
    #[must_use]
    pub fn streams(&self) -> Vec<RemoteStream> {
        self.active
            .lock()
            .as_ref()
            .map(|active| active.composer.streams())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn active_speaker(&self) -> Option<StreamKey> {
        self.active
            .lock()
            .as_ref()
            .and_then(|active| active.detector.active_speaker())
    }

    /// Counts of live resources, for diagnostics
    #[must_use]
    pub fn resources(&self) -> SessionResources {
        let active = self.active.lock().clone();
        active.map_or_else(SessionResources::default, |active| SessionResources {
            producers: active.media.producer_count(),
            consumers: active.composer.consumer_count(),
            transports: active.transports.lock().as_ref().map_or(0, |_| 2),
            local_tracks: active.media.local_stream().map_or(0, |s| s.len()),
            streams: active.composer.len(),
        })
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        if let Some(task) = self.signaling_watch.lock().take() {
            task.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionResources {
    pub producers: usize,
    pub consumers: usize,
    pub transports: usize,
    pub local_tracks: usize,
    pub streams: usize,
}

async fn apply_announcement(
    media: &MediaResourceManager,
    composer: &StreamComposer,
    room_id: &RoomId,
    announcement: Announcement,
) -> Result<()> {
    match announcement {
        Announcement::NewProducer(announced) => {
            let connection_id = announced.connection();
            let source = announced.media_source();
            media
                .consume_producer(announced.producer_id, announced.user_id, connection_id, source)
                .await
        }
        Announcement::PeerLeft(left) => {
            if left.room_id.as_ref().is_some_and(|r| r != room_id) {
                debug!(room_id = ?left.room_id, "Ignoring peer_left for another room");
                return Ok(());
            }
            composer.peer_left(&left.connection());
            Ok(())
        }
        Announcement::ProducerClosed(closed) => {
            composer.producer_closed(&closed.producer_id);
            Ok(())
        }
    }
}
