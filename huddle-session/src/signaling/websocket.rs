//! WebSocket connector for the signaling channel

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, trace, warn};
use url::Url;

use super::channel::{SignalingConnector, SignalingLink};
use crate::config::SignalingConfig;
use crate::error::{Error, Result};

/// Connects to `ws(s)://host/ws?token=...`
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(config: &SignalingConfig) -> Result<Self> {
        let mut url = Url::parse(&config.url)
            .map_err(|e| Error::Config(format!("invalid signaling url {}: {e}", config.url)))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(Error::Config(format!(
                    "signaling url must use ws or wss, got {other}"
                )))
            }
        }
        if let Some(token) = &config.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(Self { url })
    }

    /// Endpoint without the token, for logging
    #[must_use]
    pub fn display_url(&self) -> String {
        let mut url = self.url.clone();
        url.set_query(None);
        url.to_string()
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self) -> Result<SignalingLink> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::Transport(format!("websocket connect failed: {e}")))?;
        debug!(url = %self.display_url(), "Signaling websocket connected");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = ws_write.send(Message::Text(text)).await {
                    warn!(error = %e, "Signaling websocket write failed");
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "Signaling websocket read failed");
                        break;
                    }
                };
                trace!(len = text.len(), "Signaling frame received");
                if in_tx.send(text).is_err() {
                    break;
                }
            }
            debug!("Signaling websocket reader stopped");
        });

        Ok(SignalingLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
