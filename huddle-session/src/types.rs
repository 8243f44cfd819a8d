//! Common types used throughout the session core

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Tenant that owns the room
    TenantId
);
string_id!(
    /// Room hosted by the SFU
    RoomId
);
string_id!(
    /// Account-level identity; shared by every tab of the same user
    UserId
);
string_id!(
    /// Per-socket identity assigned by the server
    ConnectionId
);
string_id!(
    /// Server-assigned transport id
    TransportId
);
string_id!(
    /// Server-assigned producer id
    ProducerId
);
string_id!(
    /// Server-assigned consumer id
    ConsumerId
);

impl ConnectionId {
    /// Resolve the identity key for a remote peer.
    ///
    /// Older servers omit `connection_id`; the user id is used instead, which
    /// merges every tab of that user into one peer.
    #[must_use]
    pub fn or_user(connection_id: Option<Self>, user_id: &UserId) -> Self {
        connection_id.unwrap_or_else(|| Self(user_id.as_str().to_string()))
    }
}

/// Media kind of a track or flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<webrtc::rtp_transceiver::rtp_codec::RTPCodecType> for MediaKind {
    fn from(codec_type: webrtc::rtp_transceiver::rtp_codec::RTPCodecType) -> Self {
        match codec_type {
            webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

/// Logical origin of a media flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    Audio,
    Camera,
    Screen,
}

impl MediaSource {
    /// Source assumed when an announcement does not carry one
    #[must_use]
    pub const fn default_for(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self::Audio,
            MediaKind::Video => Self::Camera,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Camera => "camera",
            Self::Screen => "screen",
        }
    }
}

impl fmt::Display for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local outbound slot; at most one producer occupies each slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerSlot {
    Audio,
    Video,
    Screen,
}

impl ProducerSlot {
    #[must_use]
    pub const fn source(&self) -> MediaSource {
        match self {
            Self::Audio => MediaSource::Audio,
            Self::Video => MediaSource::Camera,
            Self::Screen => MediaSource::Screen,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        match self {
            Self::Audio => MediaKind::Audio,
            Self::Video | Self::Screen => MediaKind::Video,
        }
    }
}

impl fmt::Display for ProducerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Screen => "screen",
        })
    }
}

const SCREEN_SUFFIX: &str = ":screen";

/// Key of a composite remote stream: `<connectionId>` or `<connectionId>:screen`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamKey(String);

impl StreamKey {
    /// Camera and microphone of a connection share one key; screen gets its own.
    #[must_use]
    pub fn for_source(connection_id: &ConnectionId, source: MediaSource) -> Self {
        match source {
            MediaSource::Screen => Self::screen(connection_id),
            MediaSource::Audio | MediaSource::Camera => Self::camera(connection_id),
        }
    }

    #[must_use]
    pub fn camera(connection_id: &ConnectionId) -> Self {
        Self(connection_id.as_str().to_string())
    }

    #[must_use]
    pub fn screen(connection_id: &ConnectionId) -> Self {
        Self(format!("{}{SCREEN_SUFFIX}", connection_id.as_str()))
    }

    #[must_use]
    pub fn is_screen(&self) -> bool {
        self.0.ends_with(SCREEN_SUFFIX)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_key_derivation() {
        let conn = ConnectionId::from("c2");
        assert_eq!(StreamKey::for_source(&conn, MediaSource::Camera).as_str(), "c2");
        assert_eq!(StreamKey::for_source(&conn, MediaSource::Audio).as_str(), "c2");

        let screen = StreamKey::for_source(&conn, MediaSource::Screen);
        assert_eq!(screen.as_str(), "c2:screen");
        assert!(screen.is_screen());
        assert!(!StreamKey::camera(&conn).is_screen());
    }

    #[test]
    fn test_connection_falls_back_to_user() {
        let user = UserId::from("u1");
        assert_eq!(ConnectionId::or_user(None, &user).as_str(), "u1");
        assert_eq!(
            ConnectionId::or_user(Some(ConnectionId::from("c9")), &user).as_str(),
            "c9"
        );
    }

    #[test]
    fn test_default_source_follows_kind() {
        assert_eq!(MediaSource::default_for(MediaKind::Audio), MediaSource::Audio);
        assert_eq!(MediaSource::default_for(MediaKind::Video), MediaSource::Camera);
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&MediaSource::Screen).unwrap(), "\"screen\"");
        let kind: MediaKind = serde_json::from_str("\"video\"").unwrap();
        assert_eq!(kind, MediaKind::Video);
        let id: ProducerId = serde_json::from_str("\"p1\"").unwrap();
        assert_eq!(id.as_str(), "p1");
    }
}
