//! Local capture, outbound producers and inbound consumption

use dashmap::DashSet;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::devices::{acquire_with_fallback, CaptureDevices, LocalMediaStatus, MediaConstraints};
use super::track::{MediaStream, MediaTrack, TrackState};
use crate::composer::StreamComposer;
use crate::coordinator::SessionEvent;
use crate::engine::{ConsumerParams, ProducerHandle, RecvTransport, SendTransport};
use crate::error::{DeviceError, Error, Result};
use crate::signaling::message::{Consume, ConsumerCreated, ProducerClose};
use crate::signaling::SignalingChannel;
use crate::types::{ConnectionId, MediaSource, ProducerId, ProducerSlot, RoomId, UserId};

/// Everything the manager needs from the session that owns it
pub struct MediaDeps {
    pub room_id: RoomId,
    pub signaling: SignalingChannel,
    pub devices: Arc<dyn CaptureDevices>,
    pub send: Arc<dyn SendTransport>,
    pub recv: Arc<dyn RecvTransport>,
    pub rtp_capabilities: Value,
    pub own_producers: Arc<DashSet<ProducerId>>,
    pub produce_gate: Arc<tokio::sync::Mutex<()>>,
    pub composer: Arc<StreamComposer>,
    pub events: broadcast::Sender<SessionEvent>,
    pub consume_timeout: Duration,
    pub cancel: CancellationToken,
}

/// Owns local capture tracks and every producer of one session.
///
/// At most one producer occupies each [`ProducerSlot`].
pub struct MediaResourceManager {
    deps: MediaDeps,
    local: Mutex<Option<MediaStream>>,
    screen: Mutex<Option<MediaStream>>,
    producers: Mutex<HashMap<ProducerSlot, Arc<dyn ProducerHandle>>>,
    device_error: Mutex<Option<DeviceError>>,
}

impl MediaResourceManager {
    #[must_use]
    pub fn new(deps: MediaDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            local: Mutex::new(None),
            screen: Mutex::new(None),
            producers: Mutex::new(HashMap::new()),
            device_error: Mutex::new(None),
        })
    }

    /// Capture camera and microphone and produce every track obtained.
    ///
    /// Device failure is reported in the returned status, never as an error.
    pub async fn acquire_local_media(&self, constraints: MediaConstraints) -> LocalMediaStatus {
        let acquired = tokio::select! {
            biased;
            () = self.deps.cancel.cancelled() => None,
            acquired = acquire_with_fallback(self.deps.devices.as_ref(), constraints) => Some(acquired),
        };
        let Some((stream, error)) = acquired else {
            debug!("Local media acquisition cancelled");
            return self.status();
        };
        if self.deps.cancel.is_cancelled() {
            if let Some(stream) = stream {
                stream.stop_all();
            }
            return self.status();
        }
        *self.device_error.lock() = error;

        if let Some(stream) = stream {
            let previous = self.local.lock().replace(stream.clone());
            if let Some(previous) = previous {
                previous.stop_all();
            }

            let slots = [
                (ProducerSlot::Audio, stream.audio_track().cloned()),
                (ProducerSlot::Video, stream.video_track().cloned()),
            ];
            for (slot, track) in slots {
                let Some(track) = track else { continue };
                if let Err(e) = self.produce(slot, track).await {
                    warn!(%slot, error = %e, "Failed to produce local track");
                }
            }
        }

        let status = self.status();
        self.emit(SessionEvent::LocalMediaChanged(status.clone()));
        status
    }

    /// Toggle the microphone. Returns `true` when now muted.
    pub fn toggle_mute(&self) -> Result<bool> {
        self.toggle(ProducerSlot::Audio)
    }

    /// Toggle the camera. Returns `true` when video is now enabled.
    pub fn toggle_video(&self) -> Result<bool> {
        self.toggle(ProducerSlot::Video).map(|paused| !paused)
    }

    fn toggle(&self, slot: ProducerSlot) -> Result<bool> {
        let producer = self.producers.lock().get(&slot).cloned();
        let track = self.local.lock().as_ref().and_then(|stream| match slot {
            ProducerSlot::Audio => stream.audio_track().cloned(),
            _ => stream.video_track().cloned(),
        });

        let pause = match (&producer, &track) {
            (Some(producer), _) => !producer.is_paused(),
            (None, Some(track)) => track.is_enabled(),
            (None, None) => return Err(Error::NoLocalTrack(slot)),
        };

        if let Some(producer) = &producer {
            if pause {
                producer.pause();
            } else {
                producer.resume();
            }
        }
        if let Some(track) = &track {
            track.set_enabled(!pause);
        }

        info!(%slot, paused = pause, "Local track toggled");
        self.emit(SessionEvent::LocalMediaChanged(self.status()));
        Ok(pause)
    }

    /// Capture the display and produce it in the screen slot
    pub async fn start_screen_share(self: &Arc<Self>) -> Result<ProducerId> {
        if self.is_screen_sharing() {
            self.end_screen_share(None, false);
        }

        let stream = self.deps.devices.display_media().await?;
        let Some(track) = stream.video_track().cloned() else {
            stream.stop_all();
            return Err(DeviceError::NotFound.into());
        };

        let producer_id = match self.produce(ProducerSlot::Screen, track.clone()).await {
            Ok(id) => id,
            Err(e) => {
                stream.stop_all();
                return Err(e);
            }
        };
        *self.screen.lock() = Some(stream);

        self.watch_screen_track(track);
        info!(producer_id = %producer_id, "Screen share started");
        self.emit(SessionEvent::LocalMediaChanged(self.status()));
        Ok(producer_id)
    }

    /// Stop sharing and tell the server. No-op when not sharing.
    pub fn stop_screen_share(&self) {
        self.end_screen_share(None, false);
    }

    #[must_use]
    pub fn is_screen_sharing(&self) -> bool {
        self.producers.lock().contains_key(&ProducerSlot::Screen)
    }

    /// The OS (or the user through the OS) can end a capture at any time
    fn watch_screen_track(self: &Arc<Self>, track: MediaTrack) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let cancel = self.deps.cancel.clone();
        tokio::spawn(async move {
            let state = tokio::select! {
                () = cancel.cancelled() => return,
                state = track.ended() => state,
            };
            if state != TrackState::Ended {
                return;
            }
            if let Some(manager) = manager.upgrade() {
                info!(track_id = %track.id(), "Screen capture ended externally");
                manager.end_screen_share(Some(track.id()), true);
            }
        });
    }

    /// Shared path of explicit and external stop. With `track_id`, only the
    /// share backed by that track is ended.
    fn end_screen_share(&self, track_id: Option<&str>, external: bool) {
        let producer = {
            let mut producers = self.producers.lock();
            let matches = producers
                .get(&ProducerSlot::Screen)
                .is_some_and(|p| track_id.is_none_or(|id| p.track().id() == id));
            if matches {
                producers.remove(&ProducerSlot::Screen)
            } else {
                None
            }
        };

        let stream = self.screen.lock().take();
        if let Some(stream) = &stream {
            stream.stop_all();
        }

        let Some(producer) = producer else {
            return;
        };
        self.retire_producer(ProducerSlot::Screen, producer.as_ref(), true);
        info!(producer_id = %producer.id(), external, "Screen share stopped");
        self.emit(SessionEvent::ScreenShareEnded { external });
        self.emit(SessionEvent::LocalMediaChanged(self.status()));
    }

    async fn produce(&self, slot: ProducerSlot, track: MediaTrack) -> Result<ProducerId> {
        let previous = self.producers.lock().remove(&slot);
        if let Some(previous) = previous {
            debug!(%slot, producer_id = %previous.id(), "Replacing producer");
            self.retire_producer(slot, previous.as_ref(), true);
        }

        let producer = tokio::select! {
            () = self.deps.cancel.cancelled() => return Err(Error::Cancelled),
            produced = self.deps.send.produce(track, slot.source()) => produced?,
        };
        if self.deps.cancel.is_cancelled() {
            producer.close();
            return Err(Error::Cancelled);
        }

        let producer_id = producer.id().clone();
        self.producers.lock().insert(slot, producer);
        Ok(producer_id)
    }

    fn retire_producer(&self, slot: ProducerSlot, producer: &dyn ProducerHandle, notify: bool) {
        producer.close();
        if notify {
            let closed = self.deps.signaling.send(&ProducerClose {
                room_id: self.deps.room_id.clone(),
                producer_id: producer.id().clone(),
            });
            if let Err(e) = closed {
                warn!(%slot, producer_id = %producer.id(), error = %e, "Failed to notify producer close");
            }
        }
    }

    /// Consume a remote producer and hand its track to the composer.
    ///
    /// Callers must serialize these: `media:consumer_created` carries no
    /// request id.
    pub async fn consume_producer(
        &self,
        producer_id: ProducerId,
        user_id: UserId,
        connection_id: ConnectionId,
        source: MediaSource,
    ) -> Result<()> {
        // an echo of our own producer may overtake the produce reply's bookkeeping
        drop(self.deps.produce_gate.lock().await);
        if self.deps.own_producers.contains(&producer_id) {
            debug!(producer_id = %producer_id, "Skipping own producer");
            return Ok(());
        }
        if self.deps.composer.has_producer(&producer_id) {
            debug!(producer_id = %producer_id, "Producer already consumed");
            return Ok(());
        }

        let waiter = self.deps.signaling.expect::<ConsumerCreated>()?;
        self.deps.signaling.send(&Consume {
            room_id: self.deps.room_id.clone(),
            producer_id: producer_id.clone(),
            rtp_capabilities: self.deps.rtp_capabilities.clone(),
        })?;
        let created = tokio::select! {
            () = self.deps.cancel.cancelled() => return Err(Error::Cancelled),
            created = waiter.wait(self.deps.consume_timeout) => created?,
        };
        if created.producer_id != producer_id {
            return Err(Error::Negotiation(format!(
                "consumer {} created for producer {}, expected {producer_id}",
                created.id, created.producer_id
            )));
        }

        let consumer = tokio::select! {
            () = self.deps.cancel.cancelled() => return Err(Error::Cancelled),
            consumer = self.deps.recv.consume(ConsumerParams {
                id: created.id,
                producer_id: created.producer_id,
                kind: created.kind,
                rtp_parameters: created.rtp_parameters,
            }) => consumer?,
        };
        if self.deps.cancel.is_cancelled() {
            consumer.close();
            return Err(Error::Cancelled);
        }

        let key = self
            .deps
            .composer
            .add_consumer(Arc::clone(&consumer), user_id, connection_id, source);
        info!(
            producer_id = %producer_id,
            consumer_id = %consumer.id(),
            stream_key = %key,
            "Remote producer consumed"
        );
        Ok(())
    }

    /// Close every producer without notifying the server. Returns how many were open.
    pub fn close_producers(&self) -> usize {
        let producers: Vec<(ProducerSlot, Arc<dyn ProducerHandle>)> =
            self.producers.lock().drain().collect();
        for (slot, producer) in &producers {
            self.retire_producer(*slot, producer.as_ref(), false);
        }
        producers.len()
    }

    /// Stop camera, microphone and screen capture
    pub fn stop_local_tracks(&self) -> usize {
        let streams = [self.local.lock().take(), self.screen.lock().take()];
        streams
            .iter()
            .flatten()
            .map(|stream| {
                stream.stop_all();
                stream.len()
            })
            .sum()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.lock().len()
    }

    #[must_use]
    pub fn producer(&self, slot: ProducerSlot) -> Option<Arc<dyn ProducerHandle>> {
        self.producers.lock().get(&slot).cloned()
    }

    #[must_use]
    pub fn local_stream(&self) -> Option<MediaStream> {
        self.local.lock().clone()
    }

    #[must_use]
    pub fn status(&self) -> LocalMediaStatus {
        let producers = self.producers.lock();
        let local = self.local.lock();
        let audio = producers.get(&ProducerSlot::Audio);
        let video = producers.get(&ProducerSlot::Video);

        LocalMediaStatus {
            audio: audio.is_some(),
            video: video.is_some(),
            muted: audio.map_or_else(
                || {
                    local
                        .as_ref()
                        .and_then(MediaStream::audio_track)
                        .is_some_and(|t| !t.is_enabled())
                },
                |p| p.is_paused(),
            ),
            video_enabled: video.is_some_and(|p| !p.is_paused()),
            screen_sharing: producers.contains_key(&ProducerSlot::Screen),
            error: self.device_error.lock().as_ref().map(ToString::to_string),
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.deps.events.send(event);
    }
}
