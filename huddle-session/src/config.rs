//! Session configuration

use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub signaling: SignalingConfig,
    pub session: SessionConfig,
    pub speaker: SpeakerConfig,
    pub logging: LoggingConfig,
}

/// Signaling channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// WebSocket endpoint of the session server (`ws://host/ws`)
    pub url: String,
    /// Access token appended as `?token=`
    pub token: Option<String>,
    /// Fixed delay before reconnecting after an unexpected close
    pub reconnect_delay_ms: u64,
    /// Keepalive ping interval while connected
    pub keepalive_interval_secs: u64,
    /// Default timeout for one-shot waiters
    pub request_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3000/ws".to_string(),
            token: None,
            reconnect_delay_ms: 3000,
            keepalive_interval_secs: 30,
            request_timeout_ms: 10_000,
        }
    }
}

impl SignalingConfig {
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Join/produce/consume round-trip configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Timeout for router capabilities and transport parameters
    pub join_timeout_ms: u64,
    /// Timeout for `media:produce_result`
    pub produce_timeout_ms: u64,
    /// Timeout for `media:consumer_created`
    pub consume_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            join_timeout_ms: 10_000,
            produce_timeout_ms: 10_000,
            consume_timeout_ms: 10_000,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    #[must_use]
    pub const fn produce_timeout(&self) -> Duration {
        Duration::from_millis(self.produce_timeout_ms)
    }

    #[must_use]
    pub const fn consume_timeout(&self) -> Duration {
        Duration::from_millis(self.consume_timeout_ms)
    }
}

/// Active speaker detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakerConfig {
    pub enabled: bool,
    /// Poll interval
    pub poll_interval_ms: u64,
    /// Normalized RMS energy above which a peer counts as speaking
    pub threshold: f32,
    /// How long the last speaker is kept after falling silent
    pub hold_ms: u64,
    /// Number of frequency bins sampled per poll
    pub fft_bins: usize,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 200,
            threshold: 0.08,
            hold_ms: 1500,
            fft_bins: 128,
        }
    }
}

impl SpeakerConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // HUDDLE_SIGNALING__URL, HUDDLE_SPEAKER__THRESHOLD, ...
        builder = builder.add_source(
            Environment::with_prefix("HUDDLE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Collect every configuration problem instead of failing on the first
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.signaling.url.is_empty() {
            errors.push("signaling.url must not be empty".to_string());
        } else if let Err(e) = url::Url::parse(&self.signaling.url) {
            errors.push(format!("signaling.url is invalid: {e}"));
        }
        if self.signaling.request_timeout_ms == 0 {
            errors.push("signaling.request_timeout_ms must be greater than zero".to_string());
        }
        if self.signaling.keepalive_interval_secs == 0 {
            errors.push("signaling.keepalive_interval_secs must be greater than zero".to_string());
        }
        for (name, value) in [
            ("session.join_timeout_ms", self.session.join_timeout_ms),
            ("session.produce_timeout_ms", self.session.produce_timeout_ms),
            ("session.consume_timeout_ms", self.session.consume_timeout_ms),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than zero"));
            }
        }
        if self.speaker.poll_interval_ms == 0 {
            errors.push("speaker.poll_interval_ms must be greater than zero".to_string());
        }
        if !(0.0..=1.0).contains(&self.speaker.threshold) {
            errors.push("speaker.threshold must be within 0.0..=1.0".to_string());
        }
        if self.speaker.fft_bins == 0 {
            errors.push("speaker.fft_bins must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
