// =============================================================================
// ChannelValues publisher — synthetic frame playback onto the group
// =============================================================================
//
// Emits the simulator's samples as KLHDV ChannelValues frames so that the
// rest of the pipeline (subscribe, live queue, validator) exercises the same
// code path as a real dyno. Samples are chunked so a frame's value length
// always fits the u16 header field.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info};

use crate::errors::{EngineError, EngineResult};
use crate::transport::wire::{
    encode_channel_info, encode_channel_values, encode_frame, ChannelInfo, FrameKey, Sample,
    ALL_HOSTS,
};
use crate::transport::{make_socket, TransportConfig};

/// Maximum value records per frame (4000 bytes of payload).
const RECORDS_PER_FRAME: usize = 400;

/// Playback options for a publish run.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Playback speed multiplier; 1.0 replays at the captured cadence.
    pub playback_rate: f64,
    /// Restart from the first sample after the last one.
    pub loop_playback: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            playback_rate: 1.0,
            loop_playback: false,
        }
    }
}

/// Validate a caller-supplied provider id: 0 means "pick one at random",
/// anything else must be a routable host id.
pub fn resolve_provider_id(provider_id: u16) -> EngineResult<u16> {
    match provider_id {
        0 => Ok(rand::thread_rng().gen_range(1..=0xFFFEu16)),
        id if id <= 0xFFFE => Ok(id),
        id => Err(EngineError::Validation(format!(
            "provider_id must be 0 (random) or 1-0xFFFE, got {id}"
        ))),
    }
}

/// Compute the inter-frame gap for a playback rate. Zero and negative rates
/// are clamped rather than dividing by zero.
pub fn frame_gap(playback_rate: f64) -> Duration {
    let rate = playback_rate.max(1e-6);
    Duration::from_secs_f64(0.001 / rate)
}

/// Broadcast a ChannelInfo announce so listeners on the group can discover
/// this provider and its channel table.
pub async fn announce_provider(
    cfg: &TransportConfig,
    provider_id: u16,
    provider_name: &str,
    channels: &[ChannelInfo],
) -> EngineResult<()> {
    let host_id = resolve_provider_id(provider_id)?;
    let socket = make_socket(cfg)?;
    let group = cfg.group_addr()?;

    let value = encode_channel_info(provider_name, channels);
    let seq = rand::thread_rng().gen_range(1..=0xFF);
    let frame = encode_frame(FrameKey::ChannelInfo, host_id, ALL_HOSTS, seq, &value);
    socket
        .send_to(&frame, (group, cfg.port))
        .await
        .map_err(|e| EngineError::Transport(format!("announce send failed: {e}")))?;

    info!(host_id, provider = %provider_name, channels = channels.len(), "provider announced");
    Ok(())
}

/// Emit `samples` onto the multicast group as ChannelValues frames until the
/// block has been sent (or forever when looping), observing `stop` between
/// frames.
pub async fn publish_run(
    cfg: &TransportConfig,
    provider_id: u16,
    samples: &[Sample],
    options: PublishOptions,
    stop: Arc<AtomicBool>,
) -> EngineResult<u64> {
    if samples.is_empty() {
        return Ok(0);
    }

    let host_id = resolve_provider_id(provider_id)?;
    let socket = make_socket(cfg)?;
    let group = cfg.group_addr()?;
    let gap = frame_gap(options.playback_rate);

    let mut seq: u8 = rand::thread_rng().gen_range(1..=0xFF);
    let mut frames_sent: u64 = 0;

    info!(
        host_id,
        samples = samples.len(),
        rate = options.playback_rate,
        looping = options.loop_playback,
        "publishing ChannelValues"
    );

    'outer: loop {
        for chunk in samples.chunks(RECORDS_PER_FRAME) {
            if stop.load(Ordering::Relaxed) {
                break 'outer;
            }

            let payload = encode_channel_values(chunk);
            let frame = encode_frame(FrameKey::ChannelValues, host_id, ALL_HOSTS, seq, &payload);
            seq = seq.wrapping_add(1);

            socket
                .send_to(&frame, (group, cfg.port))
                .await
                .map_err(|e| EngineError::Transport(format!("publish send failed: {e}")))?;
            frames_sent += 1;

            tokio::time::sleep(gap).await;
        }

        if !options.loop_playback {
            break;
        }
    }

    debug!(frames_sent, "publish run finished");
    Ok(frames_sent)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_zero_picks_a_routable_id() {
        for _ in 0..20 {
            let id = resolve_provider_id(0).unwrap();
            assert!((1..=0xFFFE).contains(&id));
        }
    }

    #[test]
    fn explicit_provider_id_is_kept() {
        assert_eq!(resolve_provider_id(0x0042).unwrap(), 0x0042);
        assert_eq!(resolve_provider_id(0xFFFE).unwrap(), 0xFFFE);
    }

    #[test]
    fn broadcast_sentinel_is_rejected() {
        let err = resolve_provider_id(0xFFFF).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn frame_gap_scales_with_rate() {
        assert_eq!(frame_gap(1.0), Duration::from_micros(1000));
        assert_eq!(frame_gap(2.0), Duration::from_micros(500));
        // Degenerate rates are clamped, never a division by zero.
        assert!(frame_gap(0.0) > Duration::from_secs(0));
        assert!(frame_gap(-5.0) > Duration::from_secs(0));
    }
}
