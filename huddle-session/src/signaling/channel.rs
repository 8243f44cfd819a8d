//! Persistent signaling channel
//!
//! Owns one logical connection to the session server and keeps it alive:
//! - one-shot waiters (`expect` / `wait_for`) for request/response pairs
//! - persistent handlers for recurring notifications
//! - fixed-delay reconnection after an unexpected close
//! - keepalive pings while connected
//!
//! Waiters do not survive a reconnect. They fail with
//! [`Error::ConnectionLost`] and the caller decides whether to re-issue.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::message::{self, Envelope, InboundMessage, MediaError, OutboundMessage, Ping};
use crate::config::SignalingConfig;
use crate::error::{Error, Result};

/// Persistent subscription callback
pub type MessageHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Connection state of the signaling channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// One established connection, as text frames in both directions.
///
/// The link is considered closed once `inbound` yields `None`.
pub struct SignalingLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens connections to the session server
#[async_trait]
pub trait SignalingConnector: Send + Sync + 'static {
    async fn connect(&self) -> Result<SignalingLink>;
}

struct PendingWaiter {
    id: u64,
    tx: oneshot::Sender<Result<Envelope>>,
}

struct Inner {
    config: SignalingConfig,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    waiters: Mutex<HashMap<String, PendingWaiter>>,
    handlers: DashMap<String, MessageHandler>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    next_waiter_id: AtomicU64,
}

/// Cloneable handle to the signaling channel
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<Inner>,
}

impl SignalingChannel {
    /// Start the channel. Connection happens in the background; use
    /// [`SignalingChannel::wait_connected`] to block until it is up.
    pub fn connect(config: SignalingConfig, connector: Arc<dyn SignalingConnector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(Inner {
            config,
            outbound: Mutex::new(None),
            waiters: Mutex::new(HashMap::new()),
            handlers: DashMap::new(),
            state,
            shutdown: CancellationToken::new(),
            supervisor: Mutex::new(None),
            next_waiter_id: AtomicU64::new(1),
        });

        let supervisor = tokio::spawn(supervise(Arc::clone(&inner), connector));
        *inner.supervisor.lock() = Some(supervisor);

        Self { inner }
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe connection state transitions
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Default timeout for one-shot waiters
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.inner.config.request_timeout()
    }

    pub async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let connected =
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == ConnectionState::Connected)).await;
        let result = match connected {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => Err(Error::SignalingTimeout {
                message_type: "connection".to_string(),
                timeout,
            }),
        };
        result
    }

    /// Send a typed message
    pub fn send<M: OutboundMessage>(&self, message: &M) -> Result<()> {
        let data = serde_json::to_value(message)?;
        self.inner.send_envelope(&Envelope::new(M::TYPE, data))
    }

    /// Send an arbitrary message type
    pub fn send_raw(&self, message_type: &str, data: Value) -> Result<()> {
        self.inner.send_envelope(&Envelope::new(message_type, data))
    }

    /// Register a one-shot waiter for `T` without awaiting it yet.
    ///
    /// Register before sending the request that triggers the reply, otherwise
    /// a fast reply is dropped before anyone listens for it.
    pub fn expect<T: InboundMessage>(&self) -> Result<Waiter<T>> {
        self.register(T::TYPE)
    }

    /// Untyped variant of [`SignalingChannel::expect`]; resolves to the `data` payload
    pub fn expect_type(&self, message_type: &str) -> Result<Waiter<Value>> {
        self.register(message_type)
    }

    pub async fn wait_for<T: InboundMessage>(&self, timeout: Duration) -> Result<T> {
        self.expect::<T>()?.wait(timeout).await
    }

    pub async fn wait_for_type(&self, message_type: &str, timeout: Duration) -> Result<Value> {
        self.expect_type(message_type)?.wait(timeout).await
    }

    /// Install a persistent handler, replacing any previous one for the type
    pub fn on_message<F>(&self, message_type: &str, handler: F)
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .insert(message_type.to_string(), Arc::new(handler));
    }

    pub fn off_message(&self, message_type: &str) {
        self.inner.handlers.remove(message_type);
    }

    /// Stop reconnecting and drop the current connection
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let supervisor = self.inner.supervisor.lock().take();
        if let Some(task) = supervisor {
            let _ = task.await;
        }
        self.inner.detach();
        self.inner.state.send_replace(ConnectionState::Disconnected);
    }

    fn register<T>(&self, message_type: &str) -> Result<Waiter<T>> {
        let mut waiters = self.inner.waiters.lock();
        if waiters.contains_key(message_type) {
            warn!(message_type, "Rejecting duplicate waiter");
            return Err(Error::DuplicateWaiter {
                message_type: message_type.to_string(),
            });
        }

        let id = self.inner.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        waiters.insert(message_type.to_string(), PendingWaiter { id, tx });

        Ok(Waiter {
            inner: Arc::clone(&self.inner),
            message_type: message_type.to_string(),
            id,
            rx: Some(rx),
            _marker: PhantomData,
        })
    }
}

/// A registered one-shot waiter. Dropping it unregisters it.
pub struct Waiter<T> {
    inner: Arc<Inner>,
    message_type: String,
    id: u64,
    rx: Option<oneshot::Receiver<Result<Envelope>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Waiter<T> {
    pub async fn wait(mut self, timeout: Duration) -> Result<T> {
        let Some(rx) = self.rx.take() else {
            return Err(Error::ConnectionLost {
                message_type: self.message_type.clone(),
            });
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(envelope))) => Ok(envelope.decode()?),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::ConnectionLost {
                message_type: self.message_type.clone(),
            }),
            Err(_) => {
                warn!(message_type = %self.message_type, ?timeout, "Signaling wait timed out");
                Err(Error::SignalingTimeout {
                    message_type: self.message_type.clone(),
                    timeout,
                })
            }
        }
    }
}

impl<T> Drop for Waiter<T> {
    fn drop(&mut self) {
        self.inner.remove_waiter(&self.message_type, self.id);
    }
}

impl Inner {
    fn send_envelope(&self, envelope: &Envelope) -> Result<()> {
        let text = serde_json::to_string(envelope)?;
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            debug!(message_type = %envelope.message_type, "Dropping send while disconnected");
            return Err(Error::NotConnected);
        };
        tx.send(text).map_err(|_| Error::NotConnected)?;
        trace!(message_type = %envelope.message_type, "Signaling message sent");
        Ok(())
    }

    fn remove_waiter(&self, message_type: &str, id: u64) {
        let mut waiters = self.waiters.lock();
        if waiters.get(message_type).is_some_and(|w| w.id == id) {
            waiters.remove(message_type);
        }
    }

    fn dispatch(&self, text: &str) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed signaling frame");
                return;
            }
        };

        if envelope.message_type == message::ERROR {
            let reason = envelope
                .decode::<MediaError>()
                .map_or_else(|_| "unknown server error".to_string(), |e| e.message);
            self.fail_waiters(|_| Error::Server(reason.clone()));
        }

        let waiter = self.waiters.lock().remove(&envelope.message_type);
        if let Some(waiter) = waiter {
            trace!(message_type = %envelope.message_type, "Resolving waiter");
            let _ = waiter.tx.send(Ok(envelope));
            return;
        }

        // clone out so the handler may (un)subscribe without deadlocking
        let handler = self
            .handlers
            .get(&envelope.message_type)
            .map(|h| Arc::clone(h.value()));
        match handler {
            Some(handler) => handler(envelope),
            None => debug!(message_type = %envelope.message_type, "Dropping unhandled message"),
        }
    }

    fn attach(&self, outbound: mpsc::UnboundedSender<String>) {
        *self.outbound.lock() = Some(outbound);
    }

    fn detach(&self) {
        self.outbound.lock().take();
        self.fail_waiters(|message_type| Error::ConnectionLost {
            message_type: message_type.to_string(),
        });
    }

    fn fail_waiters(&self, error: impl Fn(&str) -> Error) {
        let drained: Vec<(String, PendingWaiter)> = self.waiters.lock().drain().collect();
        for (message_type, waiter) in drained {
            let _ = waiter.tx.send(Err(error(&message_type)));
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Signaling state changed");
        }
    }
}

async fn supervise(inner: Arc<Inner>, connector: Arc<dyn SignalingConnector>) {
    loop {
        inner.set_state(ConnectionState::Connecting);

        let link = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            link = connector.connect() => link,
        };

        match link {
            Ok(link) => {
                inner.attach(link.outbound);
                inner.set_state(ConnectionState::Connected);
                info!(url = %inner.config.url, "Signaling connected");

                run_link(&inner, link.inbound).await;

                inner.detach();
            }
            Err(e) => warn!(error = %e, "Signaling connect failed"),
        }

        inner.set_state(ConnectionState::Disconnected);
        if inner.shutdown.is_cancelled() {
            break;
        }

        let delay = inner.config.reconnect_delay();
        info!(?delay, "Reconnecting signaling");
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    inner.set_state(ConnectionState::Disconnected);
    debug!("Signaling supervisor stopped");
}

async fn run_link(inner: &Inner, mut inbound: mpsc::UnboundedReceiver<String>) {
    let period = inner.config.keepalive_interval();
    let mut keepalive = interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(text) => inner.dispatch(&text),
                None => {
                    warn!("Signaling connection closed");
                    break;
                }
            },
            _ = keepalive.tick() => {
                let ping = serde_json::to_value(Ping).unwrap_or(Value::Null);
                if inner.send_envelope(&Envelope::new(<Ping as OutboundMessage>::TYPE, ping)).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::message::{ProduceResult, PRODUCE_RESULT};
    use crate::testing::{memory_connector, ServerEnd};
    use serde_json::json;

    fn test_config() -> SignalingConfig {
        SignalingConfig {
            reconnect_delay_ms: 50,
            keepalive_interval_secs: 30,
            request_timeout_ms: 500,
            ..Default::default()
        }
    }

    async fn connected() -> (SignalingChannel, ServerEnd, crate::testing::MemoryServer) {
        let (connector, mut server) = memory_connector("u1");
        let channel = SignalingChannel::connect(test_config(), Arc::new(connector));
        let end = server.accept().await.unwrap();
        channel.wait_connected(Duration::from_secs(1)).await.unwrap();
        (channel, end, server)
    }

    #[tokio::test]
    async fn test_waiter_resolves_with_typed_payload() {
        let (channel, end, _server) = connected().await;

        let waiter = channel.expect::<ProduceResult>().unwrap();
        end.push(PRODUCE_RESULT, json!({ "id": "p1" }));

        let result = waiter.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(result.id.as_str(), "p1");
        channel.close().await;
    }

    #[tokio::test]
    async fn test_waiter_times_out_and_unregisters() {
        let (channel, _end, _server) = connected().await;

        let err = channel
            .wait_for_type(PRODUCE_RESULT, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SignalingTimeout { .. }));

        // the slot is free again
        assert!(channel.expect_type(PRODUCE_RESULT).is_ok());
        channel.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_waiter_is_rejected_without_disturbing_first() {
        let (channel, end, _server) = connected().await;

        let first = channel.expect::<ProduceResult>().unwrap();
        let second = channel.expect::<ProduceResult>();
        assert!(matches!(second, Err(Error::DuplicateWaiter { .. })));

        end.push(PRODUCE_RESULT, json!({ "id": "p7" }));
        assert_eq!(first.wait(Duration::from_secs(1)).await.unwrap().id.as_str(), "p7");
        channel.close().await;
    }

    #[tokio::test]
    async fn test_handler_receives_unwaited_messages() {
        let (channel, end, _server) = connected().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on_message("media:peer_left", move |env| {
            let _ = tx.send(env);
        });

        end.push("media:peer_left", json!({ "user_id": "u2" }));
        let env = rx.recv().await.unwrap();
        assert_eq!(env.data["user_id"], "u2");

        channel.off_message("media:peer_left");
        end.push("media:peer_left", json!({ "user_id": "u3" }));
        end.push("media:unhandled", json!({}));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        channel.close().await;
    }

    #[tokio::test]
    async fn test_server_error_rejects_pending_waiters() {
        let (channel, end, _server) = connected().await;

        let waiter = channel.expect::<ProduceResult>().unwrap();
        end.push("media:error", json!({ "message": "produce failed: boom" }));

        match waiter.wait(Duration::from_secs(1)).await {
            Err(Error::Server(msg)) => assert!(msg.contains("boom")),
            other => panic!("unexpected: {other:?}"),
        }
        channel.close().await;
    }

    #[tokio::test]
    async fn test_reconnect_drops_waiters_and_keeps_handlers() {
        let (channel, end, mut server) = connected().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on_message("media:new_producer", move |env| {
            let _ = tx.send(env);
        });

        let waiter = channel.expect::<ProduceResult>().unwrap();
        end.close();
        assert!(matches!(
            waiter.wait(Duration::from_secs(1)).await,
            Err(Error::ConnectionLost { .. })
        ));

        let end = server.accept().await.unwrap();
        channel.wait_connected(Duration::from_secs(1)).await.unwrap();
        end.push("media:new_producer", json!({ "producer_id": "p1", "user_id": "u2", "kind": "audio" }));
        assert!(rx.recv().await.is_some());
        channel.close().await;
        assert_eq!(channel.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let (connector, _server) = memory_connector("u1");
        connector.refuse_connections(true);
        let channel = SignalingChannel::connect(test_config(), Arc::new(connector));
        let err = channel.send_raw("media:leave", json!({ "room_id": "r1" })).unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        channel.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_ping() {
        let (channel, mut end, _server) = connected().await;
        tokio::time::sleep(Duration::from_secs(31)).await;
        let env = end.next().await.unwrap();
        assert_eq!(env.message_type, "ping");
        channel.close().await;
    }
}
