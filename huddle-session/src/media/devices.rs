//! Capture device seam and local media acquisition

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use super::track::MediaStream;
use crate::error::DeviceError;

/// What to request from the capture devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const AUDIO_VIDEO: Self = Self {
        audio: true,
        video: true,
    };

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }
}

/// Camera, microphone and display capture
#[async_trait]
pub trait CaptureDevices: Send + Sync {
    async fn user_media(
        &self,
        constraints: MediaConstraints,
    ) -> std::result::Result<MediaStream, DeviceError>;

    async fn display_media(&self) -> std::result::Result<MediaStream, DeviceError>;
}

/// Outcome of local media acquisition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocalMediaStatus {
    pub audio: bool,
    pub video: bool,
    pub muted: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Request user media, degrading to the single kinds if the combined request fails.
///
/// Returns the stream that was obtained (if any) and the first error seen.
pub async fn acquire_with_fallback(
    devices: &dyn CaptureDevices,
    constraints: MediaConstraints,
) -> (Option<MediaStream>, Option<DeviceError>) {
    if constraints.is_empty() {
        return (None, None);
    }

    let first_error = match devices.user_media(constraints).await {
        Ok(stream) => return (Some(stream), None),
        Err(e) => e,
    };

    if !(constraints.audio && constraints.video) {
        warn!(error = %first_error, ?constraints, "Local media unavailable");
        return (None, Some(first_error));
    }

    warn!(error = %first_error, "Camera and microphone unavailable, trying each alone");
    for fallback in [
        MediaConstraints { audio: true, video: false },
        MediaConstraints { audio: false, video: true },
    ] {
        if let Ok(stream) = devices.user_media(fallback).await {
            info!(audio = fallback.audio, video = fallback.video, "Acquired partial local media");
            return (Some(stream), Some(first_error));
        }
    }

    (None, Some(first_error))
}
