//! Shared fixtures for the session integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use huddle_session::testing::{FakeAudioBackend, FakeDevices, FakeEngine, MockSfu};
use huddle_session::{
    Collaborators, Config, ConnectionId, SessionCoordinator, SessionEvent, SignalingChannel,
};

pub const WAIT: Duration = Duration::from_secs(3);

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.signaling.reconnect_delay_ms = 50;
    config.signaling.request_timeout_ms = 1000;
    config.session.join_timeout_ms = 1000;
    config.session.produce_timeout_ms = 1000;
    config.session.consume_timeout_ms = 1000;
    config.speaker.poll_interval_ms = 50;
    config
}

pub struct TestClient {
    pub session: Arc<SessionCoordinator>,
    pub engine: Arc<FakeEngine>,
    pub devices: Arc<FakeDevices>,
    pub audio: Arc<FakeAudioBackend>,
    pub events: broadcast::Receiver<SessionEvent>,
    pub connection_id: ConnectionId,
}

impl TestClient {
    /// Next event matching `matches`, skipping everything else
    pub async fn expect_event<F>(&mut self, matches: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        next_event(&mut self.events, matches).await
    }

    pub fn stream_keys(&self) -> Vec<String> {
        self.session
            .streams()
            .iter()
            .map(|s| s.key.as_str().to_string())
            .collect()
    }
}

pub async fn connect(sfu: &MockSfu, user_id: &str) -> TestClient {
    connect_with(sfu, user_id, test_config()).await
}

pub async fn connect_with(sfu: &MockSfu, user_id: &str, config: Config) -> TestClient {
    let before = sfu.connections_of(user_id);
    let signaling = SignalingChannel::connect(config.signaling.clone(), Arc::new(sfu.connector(user_id)));
    signaling.wait_connected(WAIT).await.unwrap();

    let mut connection_id = None;
    eventually("the server registers the connection", || {
        connection_id = sfu
            .connections_of(user_id)
            .into_iter()
            .find(|c| !before.contains(c));
        connection_id.is_some()
    })
    .await;

    let engine = Arc::new(FakeEngine::new());
    let devices = Arc::new(FakeDevices::new());
    let audio = Arc::new(FakeAudioBackend::new());
    let session = SessionCoordinator::new(
        config,
        signaling,
        Collaborators {
            engine: engine.clone(),
            devices: devices.clone(),
            audio: audio.clone(),
        },
    );
    let events = session.subscribe();

    TestClient {
        session,
        engine,
        devices,
        audio,
        events,
        connection_id: connection_id.unwrap(),
    }
}

pub async fn next_event<F>(events: &mut broadcast::Receiver<SessionEvent>, mut matches: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .unwrap()
}

/// Poll `condition` until it holds
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
