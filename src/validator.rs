// =============================================================================
// Data validator — per-channel health and frame-drop statistics
// =============================================================================
//
// Tracks data quality for every channel seen on the wire: freshness, sample
// rate, invalid-value counts, and a derived health status. Frame-level
// statistics (total / dropped / malformed / non-provider) come from the
// subscribe loop. Dyno telemetry normally arrives at tens of Hz; rates far
// outside that band flag the channel.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::transport::wire::Sample;

/// Seconds without a sample before a channel is stale.
const STALE_THRESHOLD_S: f64 = 5.0;
/// Below this rate a channel is suspicious for dyno data.
const MIN_RATE_HZ: f64 = 1.0;
/// Above this rate something is misconfigured upstream.
const MAX_RATE_HZ: f64 = 200.0;
/// Invalid-value count at which a channel is flagged.
const INVALID_FLAG_COUNT: u32 = 10;
/// Sample times retained for rate estimation.
const RATE_WINDOW: usize = 100;

/// Health status for a channel (or the whole feed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelHealth {
    Healthy,
    Warning,
    Critical,
    Stale,
    Invalid,
}

impl std::fmt::Display for ChannelHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Stale => "stale",
            Self::Invalid => "invalid",
        };
        write!(f, "{s}")
    }
}

/// Rolling metrics for a single channel.
#[derive(Debug, Clone)]
pub struct ChannelMetrics {
    pub channel_id: u16,
    pub channel_name: String,
    pub last_sample_time_s: f64,
    pub last_value: f32,
    pub last_timestamp_ms: u32,
    pub samples_per_second: f64,
    pub invalid_value_count: u32,
    pub total_samples: u64,
    pub health: ChannelHealth,
    pub health_reason: String,
    /// Optional expected value range.
    pub min_value: Option<f32>,
    pub max_value: Option<f32>,
    sample_times: VecDeque<f64>,
}

impl ChannelMetrics {
    fn new(channel_id: u16, channel_name: String) -> Self {
        Self {
            channel_id,
            channel_name,
            last_sample_time_s: 0.0,
            last_value: 0.0,
            last_timestamp_ms: 0,
            samples_per_second: 0.0,
            invalid_value_count: 0,
            total_samples: 0,
            health: ChannelHealth::Stale,
            health_reason: "No data received".to_string(),
            min_value: None,
            max_value: None,
            sample_times: VecDeque::with_capacity(RATE_WINDOW),
        }
    }

    fn update(&mut self, sample: &Sample, now_s: f64) {
        self.total_samples += 1;
        self.last_sample_time_s = now_s;
        self.last_value = sample.value;
        self.last_timestamp_ms = sample.timestamp_ms;

        self.sample_times.push_back(now_s);
        while self.sample_times.len() > RATE_WINDOW {
            self.sample_times.pop_front();
        }
        if let (Some(first), Some(last)) = (self.sample_times.front(), self.sample_times.back()) {
            if self.sample_times.len() >= 2 {
                let span = last - first;
                self.samples_per_second = if span > 0.0 {
                    self.sample_times.len() as f64 / span
                } else {
                    self.sample_times.len() as f64
                };
            }
        }

        if self.is_valid_value(sample.value) {
            // Valid samples decay the invalid counter so a channel can recover.
            self.invalid_value_count = self.invalid_value_count.saturating_sub(1);
        } else {
            self.invalid_value_count += 1;
        }

        self.update_health(now_s);
    }

    fn is_valid_value(&self, value: f32) -> bool {
        if !value.is_finite() {
            return false;
        }
        if let Some(min) = self.min_value {
            if value < min {
                return false;
            }
        }
        if let Some(max) = self.max_value {
            if value > max {
                return false;
            }
        }
        true
    }

    fn update_health(&mut self, now_s: f64) {
        let age = now_s - self.last_sample_time_s;
        if age > STALE_THRESHOLD_S {
            self.health = ChannelHealth::Stale;
            self.health_reason = format!("No data for {age:.1}s");
            return;
        }
        if self.invalid_value_count > INVALID_FLAG_COUNT {
            self.health = ChannelHealth::Invalid;
            self.health_reason = format!("{} invalid values", self.invalid_value_count);
            return;
        }
        if self.samples_per_second < MIN_RATE_HZ && self.total_samples > 5 {
            self.health = ChannelHealth::Warning;
            self.health_reason = format!("Low rate: {:.1} Hz", self.samples_per_second);
            return;
        }
        if self.samples_per_second > MAX_RATE_HZ {
            self.health = ChannelHealth::Warning;
            self.health_reason = format!("Very high rate: {:.1} Hz", self.samples_per_second);
            return;
        }
        self.health = ChannelHealth::Healthy;
        self.health_reason = "OK".to_string();
    }

    pub fn age_seconds(&self, now_s: f64) -> f64 {
        now_s - self.last_sample_time_s
    }
}

/// Frame-level statistics from the subscribe loop.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FrameStats {
    pub total_frames: u64,
    pub dropped_frames: u64,
    pub malformed_frames: u64,
    pub non_provider_frames: u64,
}

impl FrameStats {
    pub fn drop_rate_percent(&self) -> f64 {
        if self.total_frames == 0 {
            return 0.0;
        }
        self.dropped_frames as f64 / self.total_frames as f64 * 100.0
    }
}

/// Serialisable per-channel summary row.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSummary {
    pub id: u16,
    pub name: String,
    pub health: ChannelHealth,
    pub health_reason: String,
    pub value: f32,
    pub age_seconds: f64,
    pub rate_hz: f64,
    pub total_samples: u64,
    pub invalid_value_count: u32,
}

/// Roll-up of the whole feed.
#[derive(Debug, Clone, Serialize)]
pub struct ValidatorSnapshot {
    pub overall_health: ChannelHealth,
    pub health_reason: String,
    pub healthy_channels: usize,
    pub total_channels: usize,
    pub channels: Vec<ChannelSummary>,
    pub frame_stats: FrameStats,
    pub drop_rate_percent: f64,
}

/// Validates and tracks data quality for the live telemetry feed.
pub struct DataValidator {
    metrics: Mutex<HashMap<u16, ChannelMetrics>>,
    frame_stats: Mutex<FrameStats>,
    value_ranges: Mutex<HashMap<String, (f32, f32)>>,
    epoch: Instant,
}

impl DataValidator {
    pub fn new() -> Self {
        Self {
            metrics: Mutex::new(HashMap::new()),
            frame_stats: Mutex::new(FrameStats::default()),
            value_ranges: Mutex::new(HashMap::new()),
            epoch: Instant::now(),
        }
    }

    fn now_s(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Configure the expected value range for a channel name. Applies to
    /// channels already seen and to ones that appear later.
    pub fn set_channel_range(&self, channel_name: &str, min: f32, max: f32) {
        self.value_ranges
            .lock()
            .insert(channel_name.to_string(), (min, max));
        let mut metrics = self.metrics.lock();
        for m in metrics.values_mut() {
            if m.channel_name == channel_name {
                m.min_value = Some(min);
                m.max_value = Some(max);
            }
        }
    }

    /// Record a sample using the wall clock.
    pub fn record_sample(&self, sample: &Sample) {
        self.record_sample_at(sample, self.now_s());
    }

    /// Record a sample at an explicit time (exposed for deterministic tests).
    pub fn record_sample_at(&self, sample: &Sample, now_s: f64) {
        let mut metrics = self.metrics.lock();
        let entry = metrics.entry(sample.channel_id).or_insert_with(|| {
            let mut m = ChannelMetrics::new(sample.channel_id, sample.channel_name.clone());
            if let Some((min, max)) = self.value_ranges.lock().get(&sample.channel_name) {
                m.min_value = Some(*min);
                m.max_value = Some(*max);
            }
            debug!(
                channel_id = sample.channel_id,
                channel = %sample.channel_name,
                "tracking new channel"
            );
            m
        });
        entry.update(sample, now_s);
    }

    /// Fold subscribe-loop frame counters into the running totals.
    pub fn record_frame_stats(&self, total: u64, dropped: u64, malformed: u64, non_provider: u64) {
        let mut stats = self.frame_stats.lock();
        stats.total_frames += total;
        stats.dropped_frames += dropped;
        stats.malformed_frames += malformed;
        stats.non_provider_frames += non_provider;
    }

    pub fn channel_health(&self, channel_id: u16) -> Option<ChannelHealth> {
        self.metrics.lock().get(&channel_id).map(|m| m.health)
    }

    /// Build the full health roll-up.
    pub fn snapshot(&self) -> ValidatorSnapshot {
        self.snapshot_at(self.now_s())
    }

    pub fn snapshot_at(&self, now_s: f64) -> ValidatorSnapshot {
        let mut metrics = self.metrics.lock();

        // Staleness is a function of time, not just of incoming samples.
        for m in metrics.values_mut() {
            m.update_health(now_s);
        }

        let mut channels: Vec<ChannelSummary> = metrics
            .values()
            .map(|m| ChannelSummary {
                id: m.channel_id,
                name: m.channel_name.clone(),
                health: m.health,
                health_reason: m.health_reason.clone(),
                value: m.last_value,
                age_seconds: m.age_seconds(now_s),
                rate_hz: m.samples_per_second,
                total_samples: m.total_samples,
                invalid_value_count: m.invalid_value_count,
            })
            .collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));

        let healthy = channels
            .iter()
            .filter(|c| c.health == ChannelHealth::Healthy)
            .count();
        let total = channels.len();

        let (overall, reason) = if total == 0 {
            (ChannelHealth::Stale, "No channels active".to_string())
        } else if healthy == 0 {
            (ChannelHealth::Critical, "No healthy channels".to_string())
        } else if (healthy as f64) < total as f64 * 0.5 {
            (
                ChannelHealth::Warning,
                format!("Only {healthy}/{total} channels healthy"),
            )
        } else {
            (
                ChannelHealth::Healthy,
                format!("{healthy}/{total} channels healthy"),
            )
        };

        let frame_stats = *self.frame_stats.lock();

        ValidatorSnapshot {
            overall_health: overall,
            health_reason: reason,
            healthy_channels: healthy,
            total_channels: total,
            channels,
            frame_stats,
            drop_rate_percent: frame_stats.drop_rate_percent(),
        }
    }

    /// Clear all metrics (restart or tests).
    pub fn reset(&self) {
        self.metrics.lock().clear();
        *self.frame_stats.lock() = FrameStats::default();
    }
}

impl Default for DataValidator {
    fn default() -> Self {
        Self::new()
    }
}
