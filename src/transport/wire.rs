// =============================================================================
// KLHDV wire codec — bit-exact frame encode/decode
// =============================================================================
//
// Every datagram starts with an 8-byte little-endian header:
//
//   key(u8) | length(u16) | host(u16) | seq(u8) | dest(u16)
//
// followed by `length` bytes of value. A ChannelInfo value is a 50-byte
// NUL-padded provider name plus zero or more 34-byte channel records
// `id(u16) | vendor(u8) | name(30) | unit(u8)`. A ChannelValues value is a
// stream of 10-byte records `id(u16) | ts_ms(u32) | value(f32)`.
//
// Frames with insufficient bytes are discarded without error: decode returns
// None and the caller counts the drop.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Destination sentinel meaning "all hosts".
pub const ALL_HOSTS: u16 = 0xFFFF;

/// Header size in bytes.
pub const HEADER_LEN: usize = 8;
/// Provider name field width inside a ChannelInfo value.
pub const PROVIDER_NAME_LEN: usize = 50;
/// Channel name field width inside a channel record.
pub const CHANNEL_NAME_LEN: usize = 30;
/// Channel record width: id(2) + vendor(1) + name(30) + unit(1).
pub const CHANNEL_INFO_BLOCK: usize = 34;
/// Value record width: id(2) + ts(4) + value(4).
pub const CHANNEL_VALUES_BLOCK: usize = 10;

// -----------------------------------------------------------------------------
// Frame keys
// -----------------------------------------------------------------------------

/// Message key carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKey {
    ChannelInfo,
    ChannelValues,
    ClearChannelInfo,
    Ping,
    Pong,
    RequestChannelInfo,
    /// A key we do not speak; decoded and ignored.
    Unknown(u8),
}

impl FrameKey {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => Self::ChannelInfo,
            0x02 => Self::ChannelValues,
            0x03 => Self::ClearChannelInfo,
            0x04 => Self::Ping,
            0x05 => Self::Pong,
            0x06 => Self::RequestChannelInfo,
            other => Self::Unknown(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::ChannelInfo => 0x01,
            Self::ChannelValues => 0x02,
            Self::ClearChannelInfo => 0x03,
            Self::Ping => 0x04,
            Self::Pong => 0x05,
            Self::RequestChannelInfo => 0x06,
            Self::Unknown(b) => b,
        }
    }
}

// -----------------------------------------------------------------------------
// Channel units
// -----------------------------------------------------------------------------

/// Unit tag carried in the last byte of a channel record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelUnit {
    Time,
    Distance,
    Speed,
    Force,
    Power,
    Torque,
    Temperature,
    Pressure,
    EngineSpeed,
    GearRatio,
    Acceleration,
    Afr,
    FlowRate,
    Lambda,
    Volts,
    Amps,
    Percentage,
    Extended,
    NoUnit,
    Other(u8),
}

impl ChannelUnit {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0 => Self::Time,
            1 => Self::Distance,
            2 => Self::Speed,
            3 => Self::Force,
            4 => Self::Power,
            5 => Self::Torque,
            6 => Self::Temperature,
            7 => Self::Pressure,
            8 => Self::EngineSpeed,
            9 => Self::GearRatio,
            10 => Self::Acceleration,
            11 => Self::Afr,
            12 => Self::FlowRate,
            13 => Self::Lambda,
            14 => Self::Volts,
            15 => Self::Amps,
            16 => Self::Percentage,
            254 => Self::Extended,
            255 => Self::NoUnit,
            other => Self::Other(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Time => 0,
            Self::Distance => 1,
            Self::Speed => 2,
            Self::Force => 3,
            Self::Power => 4,
            Self::Torque => 5,
            Self::Temperature => 6,
            Self::Pressure => 7,
            Self::EngineSpeed => 8,
            Self::GearRatio => 9,
            Self::Acceleration => 10,
            Self::Afr => 11,
            Self::FlowRate => 12,
            Self::Lambda => 13,
            Self::Volts => 14,
            Self::Amps => 15,
            Self::Percentage => 16,
            Self::Extended => 254,
            Self::NoUnit => 255,
            Self::Other(b) => b,
        }
    }
}

// -----------------------------------------------------------------------------
// Data types
// -----------------------------------------------------------------------------

/// A single channel advertised by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: u16,
    pub name: String,
    pub unit: ChannelUnit,
    pub vendor: u8,
}

/// A telemetry provider discovered on the multicast group. Replaced wholesale
/// whenever the provider re-announces its channel table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub provider_id: u16,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub channels: HashMap<u16, ChannelInfo>,
}

/// One decoded telemetry sample. `channel_name` is never empty: it is the
/// provider's declared name, a fallback-map entry, or `chan_<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub provider_id: u16,
    pub channel_id: u16,
    pub channel_name: String,
    pub timestamp_ms: u32,
    pub value: f32,
}

/// A decoded frame header plus its value bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame<'a> {
    pub key: FrameKey,
    pub host: u16,
    pub seq: u8,
    pub dest: u16,
    pub value: &'a [u8],
}

// -----------------------------------------------------------------------------
// Fallback channel names (Dynojet RT modules)
// -----------------------------------------------------------------------------

/// Well-known RT module channels that broadcast values without metadata.
const FALLBACK_CHANNEL_NAMES: &[(u16, &str)] = &[
    (3, "Torque"),
    (4, "Horsepower"),
    (7, "Speed"),
    (8, "Distance"),
    (9, "Acceleration"),
    (10, "Digital RPM 1"),
    (11, "Digital RPM 2"),
    (12, "Force Drum 1"),
    (19, "Force Drum 2"),
    (38, "Pressure"),
];

/// Resolve a channel name: provider table first, then the fallback map for
/// well-known RT module ids, then `chan_<id>`.
pub fn resolve_channel_name(channels: &HashMap<u16, ChannelInfo>, id: u16) -> String {
    if let Some(info) = channels.get(&id) {
        if !info.name.is_empty() {
            return info.name.clone();
        }
    }
    if let Some((_, name)) = FALLBACK_CHANNEL_NAMES.iter().find(|(fid, _)| *fid == id) {
        return (*name).to_string();
    }
    format!("chan_{id}")
}

// -----------------------------------------------------------------------------
// Header encode / decode
// -----------------------------------------------------------------------------

/// Encode a full frame: header plus value bytes.
pub fn encode_frame(key: FrameKey, host: u16, dest: u16, seq: u8, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + value.len());
    buf.push(key.as_byte());
    buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
    buf.extend_from_slice(&host.to_le_bytes());
    buf.push(seq);
    buf.extend_from_slice(&dest.to_le_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Decode the header and slice out the value. Returns None when the datagram
/// is shorter than the header or shorter than the declared length.
pub fn decode_frame(data: &[u8]) -> Option<Frame<'_>> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let key = FrameKey::from_byte(data[0]);
    let length = u16::from_le_bytes([data[1], data[2]]) as usize;
    let host = u16::from_le_bytes([data[3], data[4]]);
    let seq = data[5];
    let dest = u16::from_le_bytes([data[6], data[7]]);
    if data.len() < HEADER_LEN + length {
        return None;
    }
    Some(Frame {
        key,
        host,
        seq,
        dest,
        value: &data[HEADER_LEN..HEADER_LEN + length],
    })
}

// -----------------------------------------------------------------------------
// ChannelInfo payload
// -----------------------------------------------------------------------------

/// Strip a NUL-padded UTF-8 field down to the text before the first NUL.
fn clean_utf8(buf: &[u8]) -> String {
    let text = String::from_utf8_lossy(buf);
    text.split('\0').next().unwrap_or("").trim().to_string()
}

/// Write a string into a fixed-width NUL-padded field, truncating on overflow.
fn pad_name(name: &str, width: usize) -> Vec<u8> {
    let mut field = vec![0u8; width];
    let bytes = name.as_bytes();
    let n = bytes.len().min(width);
    field[..n].copy_from_slice(&bytes[..n]);
    field
}

/// Parse a ChannelInfo value into provider metadata. Returns None when the
/// value is shorter than the provider-name field. Trailing bytes that do not
/// fill a whole channel record are ignored.
pub fn parse_channel_info(
    host_id: u16,
    host_ip: &str,
    port: u16,
    value: &[u8],
) -> Option<ProviderInfo> {
    if value.len() < PROVIDER_NAME_LEN {
        return None;
    }
    let mut name = clean_utf8(&value[..PROVIDER_NAME_LEN]);
    if name.is_empty() {
        name = "KLHDV Provider".to_string();
    }

    let mut channels = HashMap::new();
    let mut idx = PROVIDER_NAME_LEN;
    while idx + CHANNEL_INFO_BLOCK <= value.len() {
        let id = u16::from_le_bytes([value[idx], value[idx + 1]]);
        let vendor = value[idx + 2];
        let raw_name = &value[idx + 3..idx + 3 + CHANNEL_NAME_LEN];
        let unit = ChannelUnit::from_byte(value[idx + 33]);
        channels.insert(
            id,
            ChannelInfo {
                id,
                name: clean_utf8(raw_name),
                unit,
                vendor,
            },
        );
        idx += CHANNEL_INFO_BLOCK;
    }

    Some(ProviderInfo {
        provider_id: host_id,
        name,
        host: host_ip.to_string(),
        port,
        channels,
    })
}

/// Encode provider metadata into a ChannelInfo value. Channels are emitted in
/// ascending id order so the encoding is deterministic.
pub fn encode_channel_info(provider_name: &str, channels: &[ChannelInfo]) -> Vec<u8> {
    let mut buf = pad_name(provider_name, PROVIDER_NAME_LEN);
    let mut sorted: Vec<&ChannelInfo> = channels.iter().collect();
    sorted.sort_by_key(|c| c.id);
    for chan in sorted {
        buf.extend_from_slice(&chan.id.to_le_bytes());
        buf.push(chan.vendor);
        buf.extend_from_slice(&pad_name(&chan.name, CHANNEL_NAME_LEN));
        buf.push(chan.unit.as_byte());
    }
    buf
}

// -----------------------------------------------------------------------------
// ChannelValues payload
// -----------------------------------------------------------------------------

/// Parse a ChannelValues value into samples, resolving channel names through
/// the provider table / fallback map. A trailing partial record terminates
/// parsing without error.
pub fn parse_channel_values(
    provider_id: u16,
    channels: &HashMap<u16, ChannelInfo>,
    value: &[u8],
) -> Vec<Sample> {
    let mut samples = Vec::with_capacity(value.len() / CHANNEL_VALUES_BLOCK);
    let mut idx = 0;
    while idx + CHANNEL_VALUES_BLOCK <= value.len() {
        let channel_id = u16::from_le_bytes([value[idx], value[idx + 1]]);
        let timestamp_ms = u32::from_le_bytes([
            value[idx + 2],
            value[idx + 3],
            value[idx + 4],
            value[idx + 5],
        ]);
        let raw = f32::from_le_bytes([
            value[idx + 6],
            value[idx + 7],
            value[idx + 8],
            value[idx + 9],
        ]);
        idx += CHANNEL_VALUES_BLOCK;

        samples.push(Sample {
            provider_id,
            channel_id,
            channel_name: resolve_channel_name(channels, channel_id),
            timestamp_ms,
            value: raw,
        });
    }
    samples
}

/// Encode samples into a ChannelValues value, preserving order.
pub fn encode_channel_values(samples: &[Sample]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(samples.len() * CHANNEL_VALUES_BLOCK);
    for s in samples {
        buf.extend_from_slice(&s.channel_id.to_le_bytes());
        buf.extend_from_slice(&s.timestamp_ms.to_le_bytes());
        buf.extend_from_slice(&s.value.to_le_bytes());
    }
    buf
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn chan(id: u16, name: &str, unit: ChannelUnit) -> ChannelInfo {
        ChannelInfo {
            id,
            name: name.to_string(),
            unit,
            vendor: 0,
        }
    }

    #[test]
    fn header_round_trip() {
        let frame = encode_frame(FrameKey::Ping, 0x1234, ALL_HOSTS, 42, b"abc");
        let decoded = decode_frame(&frame).expect("should decode");
        assert_eq!(decoded.key, FrameKey::Ping);
        assert_eq!(decoded.host, 0x1234);
        assert_eq!(decoded.seq, 42);
        assert_eq!(decoded.dest, ALL_HOSTS);
        assert_eq!(decoded.value, b"abc");
    }

    #[test]
    fn short_header_is_discarded() {
        assert!(decode_frame(&[0x02, 0x00, 0x01]).is_none());
        assert!(decode_frame(&[]).is_none());
    }

    #[test]
    fn declared_length_beyond_datagram_is_discarded() {
        // Header declares 100 value bytes but only 2 follow.
        let mut frame = encode_frame(FrameKey::ChannelValues, 1, ALL_HOSTS, 1, &[0u8; 2]);
        frame[1] = 100;
        frame[2] = 0;
        assert!(decode_frame(&frame).is_none());
    }

    #[test]
    fn channel_info_round_trip() {
        let channels = vec![
            chan(1, "RPM", ChannelUnit::EngineSpeed),
            chan(2, "AFR", ChannelUnit::Afr),
        ];
        let value = encode_channel_info("TEST", &channels);
        let info = parse_channel_info(0x1234, "10.0.0.5", 22344, &value).expect("should parse");

        assert_eq!(info.provider_id, 0x1234);
        assert_eq!(info.name, "TEST");
        assert_eq!(info.host, "10.0.0.5");
        assert_eq!(info.channels.len(), 2);
        assert_eq!(info.channels[&1].name, "RPM");
        assert_eq!(info.channels[&1].unit, ChannelUnit::EngineSpeed);
        assert_eq!(info.channels[&2].name, "AFR");
        assert_eq!(info.channels[&2].unit, ChannelUnit::Afr);
    }

    #[test]
    fn channel_info_too_short_is_none() {
        assert!(parse_channel_info(1, "", 22344, &[0u8; 49]).is_none());
    }

    #[test]
    fn channel_info_empty_name_gets_default() {
        let value = vec![0u8; PROVIDER_NAME_LEN];
        let info = parse_channel_info(7, "", 22344, &value).unwrap();
        assert_eq!(info.name, "KLHDV Provider");
        assert!(info.channels.is_empty());
    }

    #[test]
    fn channel_info_partial_trailing_record_ignored() {
        let mut value = encode_channel_info("P", &[chan(1, "RPM", ChannelUnit::EngineSpeed)]);
        value.extend_from_slice(&[0u8; 10]); // not a full 34-byte record
        let info = parse_channel_info(1, "", 22344, &value).unwrap();
        assert_eq!(info.channels.len(), 1);
    }

    #[test]
    fn channel_values_round_trip_preserves_order() {
        let channels: HashMap<u16, ChannelInfo> = [
            (1, chan(1, "RPM", ChannelUnit::EngineSpeed)),
            (2, chan(2, "AFR", ChannelUnit::Afr)),
        ]
        .into_iter()
        .collect();

        let input = vec![
            Sample {
                provider_id: 9,
                channel_id: 1,
                channel_name: "RPM".into(),
                timestamp_ms: 100,
                value: 3000.0,
            },
            Sample {
                provider_id: 9,
                channel_id: 2,
                channel_name: "AFR".into(),
                timestamp_ms: 100,
                value: 13.1,
            },
        ];

        let payload = encode_channel_values(&input);
        let decoded = parse_channel_values(9, &channels, &payload);
        assert_eq!(decoded, input);
    }

    #[test]
    fn channel_values_trailing_partial_record_ignored() {
        let mut payload = encode_channel_values(&[Sample {
            provider_id: 1,
            channel_id: 3,
            channel_name: "Torque".into(),
            timestamp_ms: 5,
            value: 88.5,
        }]);
        payload.extend_from_slice(&[1, 2, 3]); // less than a full record
        let decoded = parse_channel_values(1, &HashMap::new(), &payload);
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn name_resolution_order() {
        let channels: HashMap<u16, ChannelInfo> =
            [(1, chan(1, "Engine RPM", ChannelUnit::EngineSpeed))]
                .into_iter()
                .collect();

        // Declared name wins.
        assert_eq!(resolve_channel_name(&channels, 1), "Engine RPM");
        // Fallback map for well-known RT ids.
        assert_eq!(resolve_channel_name(&channels, 4), "Horsepower");
        assert_eq!(resolve_channel_name(&channels, 38), "Pressure");
        // Generic name otherwise; never empty.
        assert_eq!(resolve_channel_name(&channels, 999), "chan_999");
    }

    #[test]
    fn long_names_truncate_into_fixed_fields() {
        let long = "X".repeat(64);
        let value = encode_channel_info(&long, &[chan(1, &long, ChannelUnit::NoUnit)]);
        let info = parse_channel_info(1, "", 22344, &value).unwrap();
        assert_eq!(info.name.len(), PROVIDER_NAME_LEN);
        assert_eq!(info.channels[&1].name.len(), CHANNEL_NAME_LEN);
    }

    #[test]
    fn unknown_key_decodes_as_unknown() {
        let frame = encode_frame(FrameKey::Unknown(0x7F), 1, 2, 3, &[]);
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded.key, FrameKey::Unknown(0x7F));
    }

    #[test]
    fn unit_byte_round_trip() {
        for b in [0u8, 5, 8, 11, 16, 254, 255, 77] {
            assert_eq!(ChannelUnit::from_byte(b).as_byte(), b);
        }
    }
}
