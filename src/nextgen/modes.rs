// =============================================================================
// Operating-mode detection — deterministic, threshold-based labeling
// =============================================================================
//
// Labels every row of a log with one operating mode so downstream analysis
// can target the right samples (WOT fueling vs idle stability vs tip-in
// transients). No statistics, no learning: fixed thresholds, priority
// ordered, same input → same labels.
// =============================================================================

use std::collections::BTreeMap;

use serde::Serialize;

use crate::errors::{EngineError, EngineResult};
use crate::tuning::workflow::{TuneLog, COL_RPM};

/// Default tick spacing when the log carries no timestamps, ms.
const DEFAULT_SAMPLE_SPACING_MS: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeTag {
    Idle,
    Cruise,
    TipIn,
    TipOut,
    Wot,
    Decel,
    HeatSoak,
}

impl std::fmt::Display for ModeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Cruise => "cruise",
            Self::TipIn => "tip_in",
            Self::TipOut => "tip_out",
            Self::Wot => "wot",
            Self::Decel => "decel",
            Self::HeatSoak => "heat_soak",
        };
        write!(f, "{s}")
    }
}

/// Detection thresholds.
#[derive(Debug, Clone)]
pub struct ModeDetectionConfig {
    pub idle_rpm_max: f64,
    pub idle_tps_max: f64,
    pub wot_tps_min: f64,
    pub decel_tps_max: f64,
    /// TPS rate (percent per second) that counts as a tip-in.
    pub tip_in_dtps_min: f64,
    /// TPS rate that counts as a tip-out (negative).
    pub tip_out_dtps_max: f64,
    /// IAT above which a closed-throttle sample is heat soak, °F.
    pub heat_soak_iat_f: f64,
}

impl Default for ModeDetectionConfig {
    fn default() -> Self {
        Self {
            idle_rpm_max: 1500.0,
            idle_tps_max: 5.0,
            wot_tps_min: 90.0,
            decel_tps_max: 3.0,
            tip_in_dtps_min: 80.0,
            tip_out_dtps_max: -80.0,
            heat_soak_iat_f: 130.0,
        }
    }
}

/// Labels plus the per-mode row counts.
#[derive(Debug, Clone, Serialize)]
pub struct ModeLabels {
    pub tags: Vec<ModeTag>,
    pub summary_counts: BTreeMap<String, usize>,
}

/// First difference of `values` scaled to per-second units.
pub fn compute_derivative(values: &[f64], timestamps_ms: Option<&[f64]>) -> Vec<f64> {
    let n = values.len();
    let mut out = vec![0.0; n];
    for i in 1..n {
        let dt_ms = match timestamps_ms {
            Some(ts) => (ts[i] - ts[i - 1]).max(1e-3),
            None => DEFAULT_SAMPLE_SPACING_MS,
        };
        out[i] = (values[i] - values[i - 1]) / (dt_ms / 1000.0);
    }
    out
}

/// Label every row. Requires RPM and TPS; IAT and timestamps are optional.
pub fn label_modes(log: &TuneLog, config: &ModeDetectionConfig) -> EngineResult<ModeLabels> {
    let rpm = log
        .column(COL_RPM)
        .ok_or_else(|| EngineError::Analysis("mode detection requires an RPM column".into()))?;
    let tps = log
        .column("TPS")
        .ok_or_else(|| EngineError::Analysis("mode detection requires a TPS column".into()))?;
    let iat = log.column("IAT");
    let timestamps = log.column("timestamp_ms");

    let dtps = compute_derivative(tps, timestamps);

    let mut tags = Vec::with_capacity(rpm.len());
    for i in 0..rpm.len() {
        let tag = classify(
            rpm[i],
            tps[i],
            dtps[i],
            iat.map(|col| col[i]),
            config,
        );
        tags.push(tag);
    }

    let mut summary_counts = BTreeMap::new();
    for tag in &tags {
        *summary_counts.entry(tag.to_string()).or_insert(0) += 1;
    }

    Ok(ModeLabels {
        tags,
        summary_counts,
    })
}

/// Priority-ordered classification of one sample.
fn classify(
    rpm: f64,
    tps: f64,
    dtps: f64,
    iat: Option<f64>,
    config: &ModeDetectionConfig,
) -> ModeTag {
    if let Some(iat) = iat {
        if iat > config.heat_soak_iat_f && tps <= config.idle_tps_max {
            return ModeTag::HeatSoak;
        }
    }
    if dtps >= config.tip_in_dtps_min {
        return ModeTag::TipIn;
    }
    if dtps <= config.tip_out_dtps_max {
        return ModeTag::TipOut;
    }
    if tps >= config.wot_tps_min {
        return ModeTag::Wot;
    }
    if rpm <= config.idle_rpm_max && tps <= config.idle_tps_max {
        return ModeTag::Idle;
    }
    if tps <= config.decel_tps_max {
        return ModeTag::Decel;
    }
    ModeTag::Cruise
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn log_of(rows: &[(f64, f64)]) -> TuneLog {
        TuneLog::from_columns(vec![
            (
                "Engine RPM".to_string(),
                rows.iter().map(|r| r.0).collect(),
            ),
            ("TPS".to_string(), rows.iter().map(|r| r.1).collect()),
        ])
        .unwrap()
    }

    #[test]
    fn steady_states_label_directly() {
        // Throttle steps produce a tip-in/tip-out row, then the steady label.
        let log = log_of(&[
            (1000.0, 2.0),  // idle
            (1000.0, 2.0),  // idle
            (3000.0, 40.0), // tip-in (throttle jump)
            (3000.0, 40.0), // cruise
            (4500.0, 95.0), // tip-in
            (4500.0, 95.0), // wot
            (3500.0, 1.0),  // tip-out
            (3500.0, 1.0),  // decel
        ]);
        let labels = label_modes(&log, &ModeDetectionConfig::default()).unwrap();
        let expected = [
            ModeTag::Idle,
            ModeTag::Idle,
            ModeTag::TipIn,
            ModeTag::Cruise,
            ModeTag::TipIn,
            ModeTag::Wot,
            ModeTag::TipOut,
            ModeTag::Decel,
        ];
        assert_eq!(labels.tags, expected);
    }

    #[test]
    fn summary_counts_every_row() {
        let log = log_of(&[(1000.0, 2.0), (1000.0, 2.0), (3000.0, 40.0)]);
        let labels = label_modes(&log, &ModeDetectionConfig::default()).unwrap();
        let total: usize = labels.summary_counts.values().sum();
        assert_eq!(total, 3);
        assert_eq!(labels.summary_counts["idle"], 2);
        assert_eq!(labels.summary_counts["tip_in"], 1);
    }

    #[test]
    fn heat_soak_needs_iat() {
        let log = TuneLog::from_columns(vec![
            ("Engine RPM".to_string(), vec![1100.0, 1100.0]),
            ("TPS".to_string(), vec![2.0, 2.0]),
            ("IAT".to_string(), vec![95.0, 150.0]),
        ])
        .unwrap();
        let labels = label_modes(&log, &ModeDetectionConfig::default()).unwrap();
        assert_eq!(labels.tags[0], ModeTag::Idle);
        assert_eq!(labels.tags[1], ModeTag::HeatSoak);
    }

    #[test]
    fn derivative_uses_timestamps_when_present() {
        // 10 % TPS change over 50 ms = 200 %/s.
        let d = compute_derivative(&[0.0, 10.0], Some(&[0.0, 50.0]));
        assert!((d[1] - 200.0).abs() < 1e-9);
        // Without timestamps the default spacing applies (20 ms → 500 %/s).
        let d = compute_derivative(&[0.0, 10.0], None);
        assert!((d[1] - 500.0).abs() < 1e-9);
    }

    #[test]
    fn labeling_is_deterministic() {
        let log = log_of(&[(1000.0, 2.0), (2500.0, 30.0), (5000.0, 100.0)]);
        let a = label_modes(&log, &ModeDetectionConfig::default()).unwrap();
        let b = label_modes(&log, &ModeDetectionConfig::default()).unwrap();
        assert_eq!(a.tags, b.tags);
        assert_eq!(a.summary_counts, b.summary_counts);
    }

    #[test]
    fn missing_tps_is_an_analysis_error() {
        let log = TuneLog::from_columns(vec![("Engine RPM".to_string(), vec![1000.0])]).unwrap();
        let err = label_modes(&log, &ModeDetectionConfig::default()).unwrap_err();
        assert_eq!(err.kind(), "analysis");
    }
}
