//! Composite remote streams
//!
//! Inbound consumer tracks are grouped per connection and source: camera and
//! microphone of one connection share `<connectionId>`, a screen share gets
//! `<connectionId>:screen`. The table is ordered by first appearance and every
//! mutation is announced as a [`SessionEvent`].

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::coordinator::SessionEvent;
use crate::engine::ConsumerHandle;
use crate::media::{MediaStream, MediaTrack};
use crate::types::{ConnectionId, ConsumerId, MediaKind, MediaSource, ProducerId, StreamKey, UserId};

/// One playable per-peer stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub key: StreamKey,
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub source: MediaSource,
    pub stream: MediaStream,
}

impl RemoteStream {
    /// Video if the stream carries any video track
    #[must_use]
    pub fn kind(&self) -> MediaKind {
        if self.stream.video_track().is_some() {
            MediaKind::Video
        } else {
            MediaKind::Audio
        }
    }

    #[must_use]
    pub fn is_screen(&self) -> bool {
        self.key.is_screen()
    }
}

struct BoundConsumer {
    handle: Arc<dyn ConsumerHandle>,
    key: StreamKey,
}

#[derive(Default)]
struct ComposerState {
    streams: IndexMap<StreamKey, RemoteStream>,
    consumers: HashMap<ConsumerId, BoundConsumer>,
}

impl ComposerState {
    fn consumer_for_producer(&self, producer_id: &ProducerId) -> Option<ConsumerId> {
        self.consumers
            .iter()
            .find(|(_, bound)| bound.handle.producer_id() == producer_id)
            .map(|(id, _)| id.clone())
    }
}

pub struct StreamComposer {
    state: Mutex<ComposerState>,
    events: broadcast::Sender<SessionEvent>,
}

impl StreamComposer {
    #[must_use]
    pub fn new(events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            state: Mutex::new(ComposerState::default()),
            events,
        }
    }

    /// Bind a new consumer and merge its track into the matching stream
    pub fn add_consumer(
        &self,
        consumer: Arc<dyn ConsumerHandle>,
        user_id: UserId,
        connection_id: ConnectionId,
        source: MediaSource,
    ) -> StreamKey {
        let key = StreamKey::for_source(&connection_id, source);
        let track = consumer.track().clone();

        let (event, stream) = {
            let mut state = self.state.lock();
            state.consumers.insert(
                consumer.id().clone(),
                BoundConsumer {
                    handle: Arc::clone(&consumer),
                    key: key.clone(),
                },
            );

            if let Some(entry) = state.streams.get_mut(&key) {
                entry.stream = entry.stream.with_track(track);
                (StreamChange::Updated, entry.clone())
            } else {
                let entry = RemoteStream {
                    key: key.clone(),
                    user_id,
                    connection_id,
                    source: if key.is_screen() {
                        MediaSource::Screen
                    } else {
                        source
                    },
                    stream: MediaStream::new(vec![track]),
                };
                state.streams.insert(key.clone(), entry.clone());
                (StreamChange::Added, entry)
            }
        };

        debug!(
            stream_key = %key,
            consumer_id = %consumer.id(),
            producer_id = %consumer.producer_id(),
            tracks = stream.stream.len(),
            "Consumer track composed"
        );
        self.emit(match event {
            StreamChange::Added => SessionEvent::StreamAdded(stream),
            StreamChange::Updated => SessionEvent::StreamUpdated(stream),
        });
        key
    }

    /// Drop both streams of a departed connection and close their consumers
    pub fn peer_left(&self, connection_id: &ConnectionId) -> Vec<StreamKey> {
        let keys = [StreamKey::camera(connection_id), StreamKey::screen(connection_id)];

        let (removed, closing) = {
            let mut state = self.state.lock();
            let removed: Vec<StreamKey> = keys
                .iter()
                .filter(|key| state.streams.shift_remove(*key).is_some())
                .cloned()
                .collect();
            let closing: Vec<ConsumerId> = state
                .consumers
                .iter()
                .filter(|(_, bound)| keys.contains(&bound.key))
                .map(|(id, _)| id.clone())
                .collect();
            let closing: Vec<Arc<dyn ConsumerHandle>> = closing
                .iter()
                .filter_map(|id| state.consumers.remove(id))
                .map(|bound| bound.handle)
                .collect();
            (removed, closing)
        };

        for consumer in &closing {
            consumer.close();
        }
        info!(
            connection_id = %connection_id,
            streams = removed.len(),
            consumers = closing.len(),
            "Peer left"
        );
        for key in &removed {
            self.emit(SessionEvent::StreamRemoved(key.clone()));
        }
        removed
    }

    /// Close the consumer of a remote producer and update its stream.
    ///
    /// A screen stream is removed outright; a camera/audio stream only loses
    /// the track and stays until its peer leaves.
    pub fn producer_closed(&self, producer_id: &ProducerId) -> Option<StreamKey> {
        let (consumer, change) = {
            let mut state = self.state.lock();
            let consumer_id = state.consumer_for_producer(producer_id)?;
            let bound = state.consumers.remove(&consumer_id)?;
            let track_id = bound.handle.track().id().to_string();

            let change = if bound.key.is_screen() {
                state
                    .streams
                    .shift_remove(&bound.key)
                    .map(|_| SessionEvent::StreamRemoved(bound.key.clone()))
            } else {
                state.streams.get_mut(&bound.key).map(|entry| {
                    entry.stream = entry.stream.without_track(&track_id);
                    SessionEvent::StreamUpdated(entry.clone())
                })
            };
            (bound, change)
        };

        consumer.handle.close();
        debug!(
            producer_id = %producer_id,
            consumer_id = %consumer.handle.id(),
            stream_key = %consumer.key,
            "Remote producer closed"
        );
        if let Some(event) = change {
            self.emit(event);
        }
        Some(consumer.key)
    }

    #[must_use]
    pub fn has_producer(&self, producer_id: &ProducerId) -> bool {
        self.state.lock().consumer_for_producer(producer_id).is_some()
    }

    #[must_use]
    pub fn get(&self, key: &StreamKey) -> Option<RemoteStream> {
        self.state.lock().streams.get(key).cloned()
    }

    /// Snapshot in order of first appearance
    #[must_use]
    pub fn streams(&self) -> Vec<RemoteStream> {
        self.state.lock().streams.values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().streams.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().streams.is_empty()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Producers currently consumed, by consumer id
    #[must_use]
    pub fn consumed_producers(&self) -> Vec<(ConsumerId, ProducerId)> {
        self.state
            .lock()
            .consumers
            .iter()
            .map(|(id, bound)| (id.clone(), bound.handle.producer_id().clone()))
            .collect()
    }

    /// First audio track of every non-screen stream
    #[must_use]
    pub fn audio_sources(&self) -> Vec<(StreamKey, MediaTrack)> {
        self.state
            .lock()
            .streams
            .values()
            .filter(|entry| !entry.is_screen())
            .filter_map(|entry| {
                entry
                    .stream
                    .audio_track()
                    .map(|track| (entry.key.clone(), track.clone()))
            })
            .collect()
    }

    /// Close every consumer, leaving the stream table untouched
    pub fn close_consumers(&self) -> usize {
        let consumers: Vec<BoundConsumer> = self
            .state
            .lock()
            .consumers
            .drain()
            .map(|(_, bound)| bound)
            .collect();
        for bound in &consumers {
            bound.handle.close();
        }
        consumers.len()
    }

    /// Remove every stream
    pub fn clear(&self) {
        let keys: Vec<StreamKey> = self.state.lock().streams.drain(..).map(|(k, _)| k).collect();
        for key in keys {
            self.emit(SessionEvent::StreamRemoved(key));
        }
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

enum StreamChange {
    Added,
    Updated,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConsumer;

    fn composer() -> (StreamComposer, broadcast::Receiver<SessionEvent>) {
        let (tx, rx) = broadcast::channel(64);
        (StreamComposer::new(tx), rx)
    }

    fn add(
        composer: &StreamComposer,
        consumer: &str,
        producer: &str,
        kind: MediaKind,
        conn: &str,
        source: MediaSource,
    ) -> Arc<FakeConsumer> {
        let handle = Arc::new(FakeConsumer::new(consumer, producer, kind));
        composer.add_consumer(
            Arc::clone(&handle) as Arc<dyn ConsumerHandle>,
            UserId::from("u2"),
            ConnectionId::from(conn),
            source,
        );
        handle
    }

    #[test]
    fn test_audio_and_camera_merge() {
        let (composer, mut events) = composer();
        add(&composer, "c-a", "p-a", MediaKind::Audio, "c2", MediaSource::Audio);
        add(&composer, "c-v", "p-v", MediaKind::Video, "c2", MediaSource::Camera);

        let streams = composer.streams();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].key.as_str(), "c2");
        assert_eq!(streams[0].stream.len(), 2);
        assert_eq!(streams[0].kind(), MediaKind::Video);

        assert!(matches!(events.try_recv(), Ok(SessionEvent::StreamAdded(_))));
        assert!(matches!(events.try_recv(), Ok(SessionEvent::StreamUpdated(_))));
    }

    #[test]
    fn test_same_user_different_connections_stay_apart() {
        let (composer, _events) = composer();
        add(&composer, "c1", "p1", MediaKind::Video, "tab-a", MediaSource::Camera);
        add(&composer, "c2", "p2", MediaKind::Video, "tab-b", MediaSource::Camera);
        assert_eq!(composer.len(), 2);
    }

    #[test]
    fn test_peer_left_removes_both_keys_and_closes_consumers() {
        let (composer, _events) = composer();
        let cam = add(&composer, "c1", "p1", MediaKind::Video, "c2", MediaSource::Camera);
        let screen = add(&composer, "c2", "p2", MediaKind::Video, "c2", MediaSource::Screen);
        let other = add(&composer, "c3", "p3", MediaKind::Audio, "c9", MediaSource::Audio);

        let removed = composer.peer_left(&ConnectionId::from("c2"));
        assert_eq!(removed.len(), 2);
        assert!(cam.is_closed() && screen.is_closed());
        assert!(!other.is_closed());
        assert_eq!(composer.len(), 1);
        assert_eq!(composer.consumer_count(), 1);
    }

    #[test]
    fn test_producer_closed_prunes_screen_but_keeps_camera_entry() {
        let (composer, _events) = composer();
        let cam = add(&composer, "c1", "p1", MediaKind::Video, "c2", MediaSource::Camera);
        let screen = add(&composer, "c2", "p2", MediaKind::Video, "c2", MediaSource::Screen);

        assert_eq!(
            composer.producer_closed(&ProducerId::from("p2")).unwrap().as_str(),
            "c2:screen"
        );
        assert!(screen.is_closed());
        assert!(composer.get(&StreamKey::from("c2:screen")).is_none());

        composer.producer_closed(&ProducerId::from("p1"));
        assert!(cam.is_closed());
        let entry = composer.get(&StreamKey::from("c2")).unwrap();
        assert!(entry.stream.is_empty());
        assert_eq!(composer.consumer_count(), 0);
    }

    #[test]
    fn test_unknown_producer_closed_is_ignored() {
        let (composer, _events) = composer();
        assert!(composer.producer_closed(&ProducerId::from("nope")).is_none());
    }

    #[test]
    fn test_audio_sources_skip_screen() {
        let (composer, _events) = composer();
        add(&composer, "c1", "p1", MediaKind::Audio, "c2", MediaSource::Audio);
        add(&composer, "c2", "p2", MediaKind::Audio, "c3", MediaSource::Screen);
        add(&composer, "c3", "p3", MediaKind::Video, "c4", MediaSource::Camera);

        let sources = composer.audio_sources();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].0.as_str(), "c2");
    }

    #[test]
    fn test_close_consumers_then_clear() {
        let (composer, _events) = composer();
        let a = add(&composer, "c1", "p1", MediaKind::Audio, "c2", MediaSource::Audio);
        assert_eq!(composer.close_consumers(), 1);
        assert!(a.is_closed());
        assert_eq!(composer.len(), 1);
        composer.clear();
        assert!(composer.is_empty());
    }
}
