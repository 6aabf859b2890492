// =============================================================================
// Provider-pinned subscribe loop
// =============================================================================
//
// Filters incoming frames to a single provider id. Provider pinning is
// required: without it, samples from a second dyno on the same group would
// cross-contaminate the bin grids. Frames from other providers are counted
// separately and discarded.
// =============================================================================

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::errors::{EngineError, EngineResult};
use crate::transport::wire::{decode_frame, parse_channel_values, FrameKey, ProviderInfo, Sample};
use crate::transport::{make_socket, TransportConfig};

/// Receive buffer size; KLHDV datagrams are well under this.
const RECV_BUF_LEN: usize = 4096;

/// Frame accounting returned when a subscribe loop stops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscribeStats {
    /// Every datagram received, regardless of outcome.
    pub total_frames: u64,
    /// Frames that failed header or payload decoding.
    pub dropped_frames: u64,
    /// Well-formed frames from another provider or with a non-value key.
    pub non_provider_frames: u64,
}

/// Options for a subscribe call.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// When non-empty, only samples whose channel id resolves to one of
    /// these names (case-insensitive) are delivered.
    pub channels: Vec<String>,
    /// Socket recv timeout; also bounds how quickly the stop flag is seen.
    pub recv_timeout: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            recv_timeout: Duration::from_millis(500),
        }
    }
}

/// Resolve the configured channel-name filter to the provider's channel ids.
/// Names that the provider does not advertise simply match nothing.
pub fn allowed_channel_ids(provider: &ProviderInfo, channels: &[String]) -> HashSet<u16> {
    let wanted: HashSet<String> = channels
        .iter()
        .map(|n| n.trim().to_lowercase())
        .filter(|n| !n.is_empty())
        .collect();

    provider
        .channels
        .iter()
        .filter(|(_, meta)| wanted.contains(&meta.name.to_lowercase()))
        .map(|(id, _)| *id)
        .collect()
}

/// Listen for ChannelValues frames from `provider` and invoke `on_sample`
/// per decoded sample, in arrival order, until `stop` is set.
///
/// Socket errors are fatal to the call; the caller's health monitor decides
/// whether to reopen. Returns the frame statistics accumulated while running.
pub async fn subscribe<F>(
    cfg: &TransportConfig,
    provider: &ProviderInfo,
    options: SubscribeOptions,
    mut on_sample: F,
    stop: Arc<AtomicBool>,
) -> EngineResult<SubscribeStats>
where
    F: FnMut(Sample),
{
    let socket = make_socket(cfg)?;
    let allowed = allowed_channel_ids(provider, &options.channels);
    let filter_active = !options.channels.is_empty();

    info!(
        provider_id = provider.provider_id,
        provider = %provider.name,
        filter = ?options.channels,
        "subscribed to provider"
    );

    let mut stats = SubscribeStats::default();
    let mut buf = [0u8; RECV_BUF_LEN];

    while !stop.load(Ordering::Relaxed) {
        let len = match tokio::time::timeout(options.recv_timeout, socket.recv_from(&mut buf)).await
        {
            Err(_) => continue, // recv timeout; re-check stop
            Ok(Err(e)) => {
                return Err(EngineError::Transport(format!("subscribe recv failed: {e}")))
            }
            Ok(Ok((len, _addr))) => len,
        };

        stats.total_frames += 1;

        let Some(frame) = decode_frame(&buf[..len]) else {
            stats.dropped_frames += 1;
            continue;
        };
        if frame.key != FrameKey::ChannelValues || frame.host != provider.provider_id {
            stats.non_provider_frames += 1;
            continue;
        }

        for sample in parse_channel_values(provider.provider_id, &provider.channels, frame.value) {
            if filter_active && !allowed.contains(&sample.channel_id) {
                continue;
            }
            on_sample(sample);
        }
    }

    debug!(
        total = stats.total_frames,
        dropped = stats.dropped_frames,
        non_provider = stats.non_provider_frames,
        "subscribe loop stopped"
    );
    Ok(stats)
}
