//! Active speaker detection
//!
//! Polls the audio energy of every remote camera/microphone stream and elects
//! the loudest one above a threshold. The previous speaker is kept through
//! short pauses until `hold` has passed since it was last heard.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::composer::StreamComposer;
use crate::config::SpeakerConfig;
use crate::coordinator::SessionEvent;
use crate::error::Result;
use crate::media::MediaTrack;
use crate::types::StreamKey;

/// Opens the shared audio-processing context
pub trait AudioBackend: Send + Sync {
    fn open_context(&self) -> Result<Arc<dyn AudioContext>>;
}

pub trait AudioContext: Send + Sync {
    fn create_analyser(&self, track: &MediaTrack, fft_bins: usize) -> Result<Box<dyn AudioAnalyser>>;

    fn close(&self);
}

/// Frequency-domain probe on one track
pub trait AudioAnalyser: Send {
    /// Fill `bins` with byte magnitudes (0..=255)
    fn frequency_data(&mut self, bins: &mut [u8]);

    fn disconnect(&mut self);
}

/// Normalized RMS energy (0.0..=1.0) of byte frequency magnitudes
#[must_use]
pub fn rms_energy(bins: &[u8]) -> f32 {
    if bins.is_empty() {
        return 0.0;
    }
    let sum: f32 = bins
        .iter()
        .map(|b| {
            let v = f32::from(*b) / 255.0;
            v * v
        })
        .sum();
    (sum / bins.len() as f32).sqrt()
}

/// Speaker election with hold-over
#[derive(Debug, Clone)]
pub struct SpeakerElection {
    threshold: f32,
    hold: Duration,
    current: Option<StreamKey>,
    last_heard: Option<Instant>,
}

impl SpeakerElection {
    #[must_use]
    pub fn new(threshold: f32, hold: Duration) -> Self {
        Self {
            threshold,
            hold,
            current: None,
            last_heard: None,
        }
    }

    #[must_use]
    pub fn current(&self) -> Option<&StreamKey> {
        self.current.as_ref()
    }

    /// Feed one tick of energies. Returns the new speaker if it changed.
    pub fn observe(&mut self, now: Instant, energies: &[(StreamKey, f32)]) -> Option<Option<StreamKey>> {
        let loudest = energies
            .iter()
            .filter(|(_, energy)| *energy > self.threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1));

        let next = match loudest {
            Some((key, _)) => {
                self.last_heard = Some(now);
                Some(key.clone())
            }
            None => {
                let gone = self
                    .current
                    .as_ref()
                    .is_some_and(|key| !energies.iter().any(|(k, _)| k == key));
                let expired = self
                    .last_heard
                    .is_none_or(|heard| now.duration_since(heard) >= self.hold);
                if gone || expired {
                    None
                } else {
                    self.current.clone()
                }
            }
        };

        if next == self.current {
            None
        } else {
            self.current = next.clone();
            Some(next)
        }
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.last_heard = None;
    }
}

struct Probe {
    track_id: String,
    analyser: Box<dyn AudioAnalyser>,
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct ActiveSpeakerDetector {
    config: SpeakerConfig,
    backend: Arc<dyn AudioBackend>,
    composer: Arc<StreamComposer>,
    events: broadcast::Sender<SessionEvent>,
    active: watch::Sender<Option<StreamKey>>,
    running: Mutex<Option<Running>>,
}

impl ActiveSpeakerDetector {
    #[must_use]
    pub fn new(
        config: SpeakerConfig,
        backend: Arc<dyn AudioBackend>,
        composer: Arc<StreamComposer>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        let (active, _) = watch::channel(None);
        Self {
            config,
            backend,
            composer,
            events,
            active,
            running: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn active_speaker(&self) -> Option<StreamKey> {
        self.active.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<StreamKey>> {
        self.active.subscribe()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Open the audio context and start polling. No-op if already running or disabled.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() || !self.config.enabled {
            return Ok(());
        }

        let context = self.backend.open_context()?;
        let cancel = CancellationToken::new();
        let poller = Poller {
            config: self.config.clone(),
            context,
            composer: Arc::clone(&self.composer),
            events: self.events.clone(),
            active: self.active.clone(),
            probes: HashMap::new(),
            election: SpeakerElection::new(self.config.threshold, self.config.hold()),
        };
        let task = tokio::spawn(poller.run(cancel.clone()));
        *running = Some(Running { cancel, task });

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            threshold = self.config.threshold,
            hold_ms = self.config.hold_ms,
            "Active speaker detector started"
        );
        Ok(())
    }

    /// Stop polling, release every analyser and close the audio context
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            warn!(error = %e, "Active speaker poller panicked");
        }
        if self.active.send_replace(None).is_some() {
            let _ = self.events.send(SessionEvent::ActiveSpeakerChanged(None));
        }
        debug!("Active speaker detector stopped");
    }
}

struct Poller {
    config: SpeakerConfig,
    context: Arc<dyn AudioContext>,
    composer: Arc<StreamComposer>,
    events: broadcast::Sender<SessionEvent>,
    active: watch::Sender<Option<StreamKey>>,
    probes: HashMap<StreamKey, Probe>,
    election: SpeakerElection,
}

impl Poller {
    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick(Instant::now()),
            }
        }

        for (_, mut probe) in self.probes.drain() {
            probe.analyser.disconnect();
        }
        self.context.close();
    }

    fn tick(&mut self, now: Instant) {
        self.sync_probes();

        let mut bins = vec![0u8; self.config.fft_bins];
        let energies: Vec<(StreamKey, f32)> = self
            .probes
            .iter_mut()
            .map(|(key, probe)| {
                probe.analyser.frequency_data(&mut bins);
                (key.clone(), rms_energy(&bins))
            })
            .collect();

        if let Some(speaker) = self.election.observe(now, &energies) {
            debug!(speaker = ?speaker.as_ref().map(StreamKey::as_str), "Active speaker changed");
            self.active.send_replace(speaker.clone());
            let _ = self.events.send(SessionEvent::ActiveSpeakerChanged(speaker));
        }
    }

    /// Create probes for new audio streams, drop probes whose stream is gone
    fn sync_probes(&mut self) {
        let sources = self.composer.audio_sources();

        let stale: Vec<StreamKey> = self
            .probes
            .iter()
            .filter(|(key, probe)| {
                !sources
                    .iter()
                    .any(|(k, track)| k == *key && track.id() == probe.track_id)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if let Some(mut probe) = self.probes.remove(&key) {
                probe.analyser.disconnect();
            }
        }

        for (key, track) in sources {
            if self.probes.contains_key(&key) {
                continue;
            }
            match self.context.create_analyser(&track, self.config.fft_bins) {
                Ok(analyser) => {
                    self.probes.insert(
                        key,
                        Probe {
                            track_id: track.id().to_string(),
                            analyser,
                        },
                    );
                }
                Err(e) => warn!(stream_key = %key, error = %e, "Failed to create audio analyser"),
            }
        }
    }
}
