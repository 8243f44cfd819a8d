//! Transport health assessment
//!
//! A failed transport is not torn down. Its statistics are gathered, scored
//! and reported so the presentation layer can react.
//!
//! ## Quality Score
//! - 5: Excellent
//! - RTT >= 200ms: -1, >= 300ms: -2
//! - loss >= 5%: -1, >= 10%: -2, >= 15%: -3
//! - bandwidth < 500kbps: -1, < 300kbps: -2
//! - 0: Unusable
//!
//! ## Suggested Action
//! - Send, loss > 20%: audio only
//! - Loss > 10%: reduce quality
//! - Send, bandwidth < 500kbps: reduce framerate
//! - Recv, bandwidth < 500kbps: reduce quality

use serde::{Deserialize, Serialize};

use crate::engine::{TransportConnectionState, TransportDirection, TransportStats};

/// Bandwidth assumed when the transport does not report an estimate
const DEFAULT_BANDWIDTH_KBPS: u32 = 1000;

/// Suggested quality action based on network conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityAction {
    None,
    ReduceQuality,
    ReduceFramerate,
    AudioOnly,
}

/// Scored diagnostics for one transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportHealth {
    pub state: TransportConnectionState,
    pub rtt_ms: u32,
    /// Packet loss rate (0.0 - 1.0)
    pub packet_loss_rate: f32,
    pub available_bandwidth_kbps: u32,
    pub quality_score: u8,
    pub quality_action: QualityAction,
    pub selected_candidate_pair: Option<String>,
    pub stats: TransportStats,
}

/// Score a statistics snapshot.
///
/// Send-side loss is what the remote end reported missing out of what this
/// transport sent; receive-side loss is counted against what arrived.
#[must_use]
pub fn assess(
    direction: TransportDirection,
    state: TransportConnectionState,
    stats: TransportStats,
) -> TransportHealth {
    let rtt_ms = stats.rtt_ms.unwrap_or(0);
    let bandwidth_kbps = stats.available_bitrate_kbps.unwrap_or(DEFAULT_BANDWIDTH_KBPS);
    let expected = match direction {
        TransportDirection::Send => stats.packets_sent,
        TransportDirection::Recv => stats.packets_received + stats.packets_lost,
    };
    let loss_rate = if expected > 0 {
        (stats.packets_lost.min(expected) as f64 / expected as f64) as f32
    } else {
        0.0
    };

    TransportHealth {
        state,
        rtt_ms,
        packet_loss_rate: loss_rate,
        available_bandwidth_kbps: bandwidth_kbps,
        quality_score: score(rtt_ms, loss_rate, bandwidth_kbps),
        quality_action: suggest(direction, loss_rate, bandwidth_kbps),
        selected_candidate_pair: stats.selected_candidate_pair.clone(),
        stats,
    }
}

const RTT_PENALTIES: [(u32, u8); 2] = [(300, 2), (200, 1)];
const LOSS_PENALTIES: [(f32, u8); 3] = [(0.15, 3), (0.10, 2), (0.05, 1)];
const BANDWIDTH_PENALTIES: [(u32, u8); 2] = [(300, 2), (500, 1)];

fn score(rtt_ms: u32, loss_rate: f32, bandwidth_kbps: u32) -> u8 {
    let rtt = RTT_PENALTIES
        .iter()
        .find(|(at_least, _)| rtt_ms >= *at_least)
        .map_or(0, |(_, p)| *p);
    let loss = LOSS_PENALTIES
        .iter()
        .find(|(at_least, _)| loss_rate >= *at_least)
        .map_or(0, |(_, p)| *p);
    let bandwidth = BANDWIDTH_PENALTIES
        .iter()
        .find(|(below, _)| bandwidth_kbps < *below)
        .map_or(0, |(_, p)| *p);
    5u8.saturating_sub(rtt + loss + bandwidth)
}

/// The receive side can only ask for lower-quality layers, never drop video
fn suggest(direction: TransportDirection, loss_rate: f32, bandwidth_kbps: u32) -> QualityAction {
    match direction {
        TransportDirection::Send if loss_rate > 0.20 => QualityAction::AudioOnly,
        _ if loss_rate > 0.10 => QualityAction::ReduceQuality,
        TransportDirection::Send if bandwidth_kbps < 500 => QualityAction::ReduceFramerate,
        TransportDirection::Recv if bandwidth_kbps < 500 => QualityAction::ReduceQuality,
        _ => QualityAction::None,
    }
}
