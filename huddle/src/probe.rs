//! `huddle probe`: the signaling half of a join, without any media

use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use huddle_session::negotiator::request_join;
use huddle_session::signaling::message::{
    self, LeaveRequest, MediaError, NewProducer, PeerLeft, ProducerClosed,
};
use huddle_session::{Config, RoomId, SignalingChannel, WebSocketConnector};

pub async fn run(config: &Config, room: &str, listen_for: Duration) -> Result<()> {
    let connector = WebSocketConnector::new(&config.signaling)?;
    info!(url = %connector.display_url(), "Connecting signaling");
    let signaling = SignalingChannel::connect(config.signaling.clone(), Arc::new(connector));
    signaling
        .wait_connected(config.signaling.request_timeout())
        .await
        .context("signaling did not connect")?;

    log_announcements(&signaling);

    let room_id = RoomId::from(room);
    let joined = request_join(&signaling, &room_id, config.session.join_timeout()).await;
    let (capabilities, transports) = match joined {
        Ok(replies) => replies,
        Err(e) => {
            let _ = signaling.send(&LeaveRequest { room_id });
            signaling.close().await;
            return Err(e).context("join handshake failed");
        }
    };

    info!(
        room_id = %room_id,
        codecs = %codec_summary(&capabilities.rtp_capabilities),
        "Router capabilities received"
    );
    info!(
        send_transport = %transports.send_transport.id,
        recv_transport = %transports.recv_transport.id,
        ice_servers = transports.ice_servers.len(),
        force_relay = transports.force_relay,
        "Transports created"
    );

    tokio::select! {
        () = tokio::time::sleep(listen_for) => {}
        () = shutdown_signal() => {}
    }

    if let Err(e) = signaling.send(&LeaveRequest {
        room_id: room_id.clone(),
    }) {
        warn!(room_id = %room_id, error = %e, "Failed to send leave");
    }
    signaling.close().await;
    info!(room_id = %room_id, "Probe finished");
    Ok(())
}

fn log_announcements(signaling: &SignalingChannel) {
    signaling.on_message(message::NEW_PRODUCER, |envelope| {
        match envelope.decode::<NewProducer>() {
            Ok(p) => info!(
                producer_id = %p.producer_id,
                user_id = %p.user_id,
                connection_id = %p.connection(),
                kind = %p.kind,
                source = %p.media_source(),
                "New producer"
            ),
            Err(e) => warn!(error = %e, "Malformed new_producer"),
        }
    });
    signaling.on_message(message::PRODUCER_CLOSED, |envelope| {
        if let Ok(p) = envelope.decode::<ProducerClosed>() {
            info!(producer_id = %p.producer_id, user_id = %p.user_id, "Producer closed");
        }
    });
    signaling.on_message(message::PEER_LEFT, |envelope| {
        if let Ok(p) = envelope.decode::<PeerLeft>() {
            info!(user_id = %p.user_id, connection_id = %p.connection(), "Peer left");
        }
    });
    signaling.on_message(message::ROOM_CLOSED, |envelope| {
        info!(data = %envelope.data, "Room closed");
    });
    signaling.on_message(message::ERROR, |envelope| {
        let reason = envelope
            .decode::<MediaError>()
            .map_or_else(|_| envelope.data.to_string(), |e| e.message);
        error!(reason = %reason, "Server error");
    });
}

/// `audio/opus, video/VP8` style list of the router's codecs
fn codec_summary(rtp_capabilities: &Value) -> String {
    rtp_capabilities
        .get("codecs")
        .and_then(Value::as_array)
        .map(|codecs| {
            codecs
                .iter()
                .filter_map(|c| c.get("mimeType").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default()
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_codec_summary() {
        let caps = json!({ "codecs": [
            { "kind": "audio", "mimeType": "audio/opus" },
            { "kind": "video", "mimeType": "video/VP8" }
        ] });
        assert_eq!(codec_summary(&caps), "audio/opus, video/VP8");
        assert_eq!(codec_summary(&json!({})), "");
    }
}
