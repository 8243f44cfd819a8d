//! Local and remote media tracks and the immutable streams that group them

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::types::MediaKind;

/// Lifecycle of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    /// Stopped by this process
    Stopped,
    /// Ended externally, e.g. the OS revoked a screen capture
    Ended,
}

struct TrackInner {
    id: String,
    kind: MediaKind,
    label: String,
    enabled: AtomicBool,
    state: watch::Sender<TrackState>,
}

/// Shared handle to one audio or video track.
///
/// Clones refer to the same underlying track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), kind, label)
    }

    pub fn with_id(id: impl Into<String>, kind: MediaKind, label: impl Into<String>) -> Self {
        let (state, _) = watch::channel(TrackState::Live);
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                state,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// A disabled track renders silence / black frames
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn state(&self) -> TrackState {
        *self.inner.state.borrow()
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state() == TrackState::Live
    }

    /// Release the capture source. Does not fire [`MediaTrack::ended`] observers
    /// with [`TrackState::Ended`].
    pub fn stop(&self) {
        self.transition(TrackState::Stopped);
    }

    /// Mark the track as ended by its source
    pub fn end(&self) {
        self.transition(TrackState::Ended);
    }

    /// Resolve once the track leaves [`TrackState::Live`], returning the new state
    pub async fn ended(&self) -> TrackState {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(|s| *s != TrackState::Live).await {
            Ok(state) => *state,
            Err(_) => TrackState::Stopped,
        };
        state
    }

    fn transition(&self, to: TrackState) {
        let changed = self.inner.state.send_if_modified(|state| {
            if *state == TrackState::Live {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(track_id = %self.inner.id, kind = %self.inner.kind, state = ?to, "Track no longer live");
        }
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .finish()
    }
}

/// Group of tracks played together.
///
/// Membership is fixed at construction; adding or removing a track yields
/// a new stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    #[must_use]
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Video)
    }

    #[must_use]
    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.audio_tracks().next()
    }

    #[must_use]
    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.video_tracks().next()
    }

    #[must_use]
    pub fn contains(&self, track_id: &str) -> bool {
        self.tracks.iter().any(|t| t.id() == track_id)
    }

    #[must_use]
    pub fn with_track(&self, track: MediaTrack) -> Self {
        let mut tracks = self.tracks.clone();
        tracks.push(track);
        Self::new(tracks)
    }

    #[must_use]
    pub fn without_track(&self, track_id: &str) -> Self {
        Self::new(
            self.tracks
                .iter()
                .filter(|t| t.id() != track_id)
                .cloned()
                .collect(),
        )
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}
