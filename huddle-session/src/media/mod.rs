//! Local capture, producers, consumers and their supporting types

pub mod devices;
pub mod manager;
pub mod queue;
pub mod track;

pub use devices::{acquire_with_fallback, CaptureDevices, LocalMediaStatus, MediaConstraints};
pub use manager::{MediaDeps, MediaResourceManager};
pub use queue::{QueueSender, SerialQueue};
pub use track::{MediaStream, MediaTrack, TrackState};
