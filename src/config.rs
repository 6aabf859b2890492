// =============================================================================
// Engine configuration — env-driven knobs with atomic save
// =============================================================================
//
// Every tunable lives here so one process serves one dyno cell with no
// hidden globals: the config is constructed eagerly at startup and handed
// to subsystems explicitly. All fields carry serde defaults so an older
// JSON file keeps loading after new knobs appear. Persistence uses the
// tmp + rename pattern.
//
// Environment variables (defaults in parentheses):
//   KLHDV_MCAST_GROUP (224.0.2.10), KLHDV_PORT (22344), KLHDV_IFACE (0.0.0.0)
//   DYNO_MODE (virtual), DYNO_RUNS_ROOT (runs), DYNO_MAX_UPLOAD_MB (64)
//   DYNO_MAX_CORRECTION_PCT (10), DYNO_QUEUE_WINDOW_MS (50),
//   DYNO_QUEUE_CAPACITY (256), DYNO_BREAKER_FAILURES (5),
//   DYNO_BREAKER_TIMEOUT_S (30), DYNO_RETRY_ATTEMPTS (3),
//   DYNO_SIM_THERMAL (1), DYNO_SIM_AIR_DENSITY (1), DYNO_SIM_KNOCK (1)
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::physics::profile::SimulatorConfig;
use crate::transport::TransportConfig;
use crate::tuning::workflow::{DEFAULT_AFR_TARGETS, DEFAULT_MAP_AXIS, DEFAULT_RPM_AXIS};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_rpm_axis() -> Vec<f64> {
    DEFAULT_RPM_AXIS.to_vec()
}

fn default_map_axis() -> Vec<f64> {
    DEFAULT_MAP_AXIS.to_vec()
}

fn default_afr_targets() -> Vec<(f64, f64)> {
    DEFAULT_AFR_TARGETS.to_vec()
}

fn default_max_correction_pct() -> f64 {
    10.0
}

fn default_queue_window_ms() -> u64 {
    50
}

fn default_queue_capacity() -> usize {
    256
}

fn default_runs_root() -> String {
    "runs".to_string()
}

fn default_max_upload_mb() -> u64 {
    64
}

fn default_breaker_failures() -> u32 {
    5
}

fn default_breaker_successes() -> u32 {
    2
}

fn default_breaker_timeout_s() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

// =============================================================================
// EngineMode
// =============================================================================

/// Where telemetry comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    /// Real dyno frames from the multicast group.
    Live,
    /// In-process physics simulator.
    Virtual,
}

impl Default for EngineMode {
    fn default() -> Self {
        Self::Virtual
    }
}

impl std::fmt::Display for EngineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Virtual => write!(f, "virtual"),
        }
    }
}

// =============================================================================
// ReliabilityConfig
// =============================================================================

/// Thresholds for the breakers and retry wrapping the I/O boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    #[serde(default = "default_breaker_failures")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_successes")]
    pub breaker_success_threshold: u32,
    #[serde(default = "default_breaker_timeout_s")]
    pub breaker_timeout_s: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            breaker_failure_threshold: default_breaker_failures(),
            breaker_success_threshold: default_breaker_successes(),
            breaker_timeout_s: default_breaker_timeout_s(),
            retry_max_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_ms(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub mode: EngineMode,

    #[serde(default)]
    pub transport: TransportConfig,

    // --- Analysis grid ------------------------------------------------------
    #[serde(default = "default_rpm_axis")]
    pub rpm_axis: Vec<f64>,
    #[serde(default = "default_map_axis")]
    pub map_axis: Vec<f64>,
    /// MAP kPa → target AFR.
    #[serde(default = "default_afr_targets")]
    pub afr_targets: Vec<(f64, f64)>,
    #[serde(default = "default_max_correction_pct")]
    pub max_correction_pct: f64,

    // --- Live capture -------------------------------------------------------
    #[serde(default = "default_queue_window_ms")]
    pub queue_window_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    // --- Persistence --------------------------------------------------------
    #[serde(default = "default_runs_root")]
    pub runs_root: String,
    /// Upload ceiling honored by the (external) HTTP shell.
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,

    // --- Reliability --------------------------------------------------------
    #[serde(default)]
    pub reliability: ReliabilityConfig,

    // --- Simulator ----------------------------------------------------------
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: EngineMode::default(),
            transport: TransportConfig::default(),
            rpm_axis: default_rpm_axis(),
            map_axis: default_map_axis(),
            afr_targets: default_afr_targets(),
            max_correction_pct: default_max_correction_pct(),
            queue_window_ms: default_queue_window_ms(),
            queue_capacity: default_queue_capacity(),
            runs_root: default_runs_root(),
            max_upload_mb: default_max_upload_mb(),
            reliability: ReliabilityConfig::default(),
            simulator: SimulatorConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
}

impl EngineConfig {
    /// Build a config from the environment over the documented defaults.
    pub fn from_env() -> Self {
        let mut config = Self {
            transport: TransportConfig::from_env(),
            ..Self::default()
        };

        if let Ok(mode) = std::env::var("DYNO_MODE") {
            config.mode = match mode.trim().to_lowercase().as_str() {
                "live" => EngineMode::Live,
                _ => EngineMode::Virtual,
            };
        }
        if let Ok(root) = std::env::var("DYNO_RUNS_ROOT") {
            config.runs_root = root;
        }
        if let Some(v) = env_parse("DYNO_MAX_UPLOAD_MB") {
            config.max_upload_mb = v;
        }
        if let Some(v) = env_parse("DYNO_MAX_CORRECTION_PCT") {
            config.max_correction_pct = v;
        }
        if let Some(v) = env_parse("DYNO_QUEUE_WINDOW_MS") {
            config.queue_window_ms = v;
        }
        if let Some(v) = env_parse("DYNO_QUEUE_CAPACITY") {
            config.queue_capacity = v;
        }
        if let Some(v) = env_parse("DYNO_BREAKER_FAILURES") {
            config.reliability.breaker_failure_threshold = v;
        }
        if let Some(v) = env_parse("DYNO_BREAKER_TIMEOUT_S") {
            config.reliability.breaker_timeout_s = v;
        }
        if let Some(v) = env_parse("DYNO_RETRY_ATTEMPTS") {
            config.reliability.retry_max_attempts = v;
        }
        if let Some(v) = env_flag("DYNO_SIM_THERMAL") {
            config.simulator.enable_thermal_effects = v;
        }
        if let Some(v) = env_flag("DYNO_SIM_AIR_DENSITY") {
            config.simulator.enable_air_density_correction = v;
        }
        if let Some(v) = env_flag("DYNO_SIM_KNOCK") {
            config.simulator.enable_knock_detection = v;
        }

        config
    }

    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;
        info!(path = %path.display(), mode = %config.mode, "engine config loaded");
        Ok(config)
    }

    /// Persist to `path` atomically (write `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.mode, EngineMode::Virtual);
        assert_eq!(cfg.transport.multicast_group, "224.0.2.10");
        assert_eq!(cfg.transport.port, 22344);
        assert_eq!(cfg.rpm_axis.len(), 11);
        assert_eq!(cfg.map_axis.len(), 9);
        assert_eq!(cfg.afr_targets.len(), 9);
        assert_eq!(cfg.max_correction_pct, 10.0);
        assert_eq!(cfg.queue_window_ms, 50);
        assert_eq!(cfg.queue_capacity, 256);
        assert_eq!(cfg.runs_root, "runs");
        assert_eq!(cfg.reliability.breaker_failure_threshold, 5);
        assert_eq!(cfg.reliability.retry_max_attempts, 3);
    }

    #[test]
    fn empty_json_deserialises_to_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.mode, EngineMode::Virtual);
        assert_eq!(cfg.queue_window_ms, 50);
        assert_eq!(cfg.reliability.breaker_timeout_s, 30);
    }

    #[test]
    fn partial_json_fills_the_rest() {
        let json = r#"{ "mode": "live", "queue_capacity": 64 }"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.mode, EngineMode::Live);
        assert_eq!(cfg.queue_capacity, 64);
        assert_eq!(cfg.queue_window_ms, 50);
        assert_eq!(cfg.max_correction_pct, 10.0);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine_config.json");

        let mut cfg = EngineConfig::default();
        cfg.mode = EngineMode::Live;
        cfg.queue_capacity = 128;
        cfg.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.mode, EngineMode::Live);
        assert_eq!(loaded.queue_capacity, 128);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn load_of_missing_file_errors() {
        assert!(EngineConfig::load("/nonexistent/engine_config.json").is_err());
    }
}
