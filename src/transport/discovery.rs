// =============================================================================
// Provider discovery — broadcast RequestChannelInfo, collect replies
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{EngineError, EngineResult};
use crate::transport::wire::{
    decode_frame, encode_frame, parse_channel_info, FrameKey, ProviderInfo, ALL_HOSTS,
};
use crate::transport::{make_socket, TransportConfig};

/// Receive buffer size; KLHDV datagrams are well under this.
const RECV_BUF_LEN: usize = 4096;

/// Join the multicast group, broadcast a RequestChannelInfo with a random
/// seq and host id, and collect ChannelInfo replies until the deadline.
///
/// A provider that announces twice replaces its earlier record. Malformed
/// replies are skipped silently; socket errors are fatal.
pub async fn discover_providers(
    cfg: &TransportConfig,
    timeout: Duration,
) -> EngineResult<Vec<ProviderInfo>> {
    let socket = make_socket(cfg)?;
    let group = cfg.group_addr()?;

    let (host_id, seq) = {
        let mut rng = rand::thread_rng();
        (rng.gen_range(1..=0xFFFEu16), rng.gen_range(1..=0xFFu8))
    };

    let request = encode_frame(FrameKey::RequestChannelInfo, host_id, ALL_HOSTS, seq, &[]);
    socket
        .send_to(&request, (group, cfg.port))
        .await
        .map_err(|e| EngineError::Transport(format!("failed to send discovery request: {e}")))?;

    debug!(host_id, seq, timeout_ms = timeout.as_millis() as u64, "discovery request sent");

    let deadline = Instant::now() + timeout;
    let mut providers: HashMap<u16, ProviderInfo> = HashMap::new();
    let mut buf = [0u8; RECV_BUF_LEN];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let (len, addr) = match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Err(_) => break, // deadline reached
            Ok(Err(e)) => {
                return Err(EngineError::Transport(format!("discovery recv failed: {e}")))
            }
            Ok(Ok(recv)) => recv,
        };

        let Some(frame) = decode_frame(&buf[..len]) else {
            continue;
        };
        if frame.key != FrameKey::ChannelInfo {
            // Ping/Pong and value frames are not discovery replies.
            continue;
        }

        match parse_channel_info(frame.host, &addr.ip().to_string(), cfg.port, frame.value) {
            Some(provider) => {
                debug!(
                    provider_id = provider.provider_id,
                    name = %provider.name,
                    channels = provider.channels.len(),
                    "provider announced"
                );
                providers.insert(frame.host, provider);
            }
            None => {
                warn!(host = frame.host, "skipping malformed ChannelInfo reply");
            }
        }
    }

    info!(count = providers.len(), "provider discovery complete");
    Ok(providers.into_values().collect())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::wire::{encode_channel_info, ChannelInfo, ChannelUnit};

    fn announce(provider: &str, channels: &[ChannelInfo], host: u16) -> Vec<u8> {
        let value = encode_channel_info(provider, channels);
        encode_frame(FrameKey::ChannelInfo, host, ALL_HOSTS, 1, &value)
    }

    #[test]
    fn announce_frame_parses_back_to_provider() {
        let channels = vec![
            ChannelInfo {
                id: 1,
                name: "RPM".into(),
                unit: ChannelUnit::EngineSpeed,
                vendor: 0,
            },
            ChannelInfo {
                id: 2,
                name: "AFR".into(),
                unit: ChannelUnit::Afr,
                vendor: 0,
            },
        ];
        let datagram = announce("TEST", &channels, 0x1234);

        let frame = decode_frame(&datagram).unwrap();
        assert_eq!(frame.key, FrameKey::ChannelInfo);
        let info = parse_channel_info(frame.host, "192.168.0.9", 22344, frame.value).unwrap();

        assert_eq!(info.provider_id, 0x1234);
        assert_eq!(info.name, "TEST");
        assert_eq!(info.channels.len(), 2);
        assert_eq!(info.channels[&1].name, "RPM");
        assert_eq!(info.channels[&2].name, "AFR");
    }

    #[test]
    fn reannounce_replaces_provider_record() {
        // Mirrors the collection loop: same host id, second announce wins.
        let mut providers: HashMap<u16, ProviderInfo> = HashMap::new();

        for datagram in [
            announce("OLD", &[], 7),
            announce(
                "NEW",
                &[ChannelInfo {
                    id: 5,
                    name: "TPS".into(),
                    unit: ChannelUnit::Percentage,
                    vendor: 0,
                }],
                7,
            ),
        ] {
            let frame = decode_frame(&datagram).unwrap();
            if let Some(p) = parse_channel_info(frame.host, "", 22344, frame.value) {
                providers.insert(frame.host, p);
            }
        }

        assert_eq!(providers.len(), 1);
        assert_eq!(providers[&7].name, "NEW");
        assert_eq!(providers[&7].channels.len(), 1);
    }
}
