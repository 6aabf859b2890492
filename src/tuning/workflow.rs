// =============================================================================
// Auto-tune workflow — the unified analysis engine for all data sources
// =============================================================================
//
// Drives a session through ingest → analyze → correct → export:
//
//   initialized → log_imported → afr_analyzed → corrections_calculated
//               → exported   (or `error` at any step)
//
// Inputs arrive under many column names; they are normalized to canonical
// names through a case-insensitive alias table at ingest, and nowhere else.
// Missing MAP is recovered by estimating it from RPM.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::{EngineError, EngineResult};
use crate::transport::wire::Sample;
use crate::tuning::ve_math::{
    calculate_ve_correction, clamp_correction, correction_to_percentage, MathVersion,
};

// -----------------------------------------------------------------------------
// Grid and target defaults
// -----------------------------------------------------------------------------

/// Standard grid: 11 RPM bins × 9 MAP bins = 99 cells.
pub const DEFAULT_RPM_AXIS: [f64; 11] = [
    1500.0, 2000.0, 2500.0, 3000.0, 3500.0, 4000.0, 4500.0, 5000.0, 5500.0, 6000.0, 6500.0,
];
pub const DEFAULT_MAP_AXIS: [f64; 9] = [20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0];

/// AFR targets by MAP load (kPa): stoich in vacuum, richer under load.
pub const DEFAULT_AFR_TARGETS: [(f64, f64); 9] = [
    (20.0, 14.7),
    (30.0, 14.7),
    (40.0, 14.5),
    (50.0, 14.0),
    (60.0, 13.5),
    (70.0, 13.0),
    (80.0, 12.8),
    (90.0, 12.5),
    (100.0, 12.2),
];

/// Default safety clamp: ±10 % correction.
pub const DEFAULT_MAX_CORRECTION_PCT: f64 = 10.0;
/// Minimum samples per cell before the cell participates in analysis.
pub const MIN_HITS_PER_ZONE: u64 = 3;
/// AFR points considered "OK" (±0.3).
pub const AFR_ERROR_TOLERANCE: f64 = 0.3;

/// Canonical column names everything downstream relies on.
pub const COL_RPM: &str = "Engine RPM";
pub const COL_MAP: &str = "MAP kPa";
pub const COL_AFR: &str = "AFR Meas";
pub const COL_HP: &str = "Horsepower";
pub const COL_TQ: &str = "Torque";

/// Case-insensitive alias table applied once at ingest.
const COLUMN_ALIASES: &[(&str, &str)] = &[
    ("rpm", COL_RPM),
    ("engine rpm", COL_RPM),
    ("map_kpa", COL_MAP),
    ("map kpa", COL_MAP),
    ("map", COL_MAP),
    ("afr", COL_AFR),
    ("afr meas", COL_AFR),
    ("horsepower", COL_HP),
    ("torque", COL_TQ),
];

// -----------------------------------------------------------------------------
// TuneLog — the canonical tabular frame
// -----------------------------------------------------------------------------

/// A column-oriented log frame. Every column has the same row count;
/// unparseable or missing values are NaN.
#[derive(Debug, Clone, Default)]
pub struct TuneLog {
    columns: Vec<String>,
    data: HashMap<String, Vec<f64>>,
    rows: usize,
}

impl TuneLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from named columns. All columns must share one length.
    pub fn from_columns(columns: Vec<(String, Vec<f64>)>) -> EngineResult<Self> {
        let mut log = Self::new();
        for (name, values) in columns {
            log.push_column(name, values)?;
        }
        Ok(log)
    }

    pub fn push_column(&mut self, name: String, values: Vec<f64>) -> EngineResult<()> {
        if !self.columns.is_empty() && values.len() != self.rows {
            return Err(EngineError::Validation(format!(
                "column '{name}' has {} rows, expected {}",
                values.len(),
                self.rows
            )));
        }
        self.rows = values.len();
        if self.data.insert(name.clone(), values).is_none() {
            self.columns.push(name);
        }
        Ok(())
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.data.get(name).map(|v| v.as_slice())
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    /// Apply the canonical alias table: exact case-insensitive matches are
    /// renamed; a canonical column already present is never overwritten.
    pub fn normalize_columns(&mut self) {
        let renames: Vec<(String, String)> = self
            .columns
            .iter()
            .filter_map(|col| {
                let lower = col.to_lowercase();
                COLUMN_ALIASES
                    .iter()
                    .find(|(alias, canonical)| *alias == lower && col != canonical)
                    .map(|(_, canonical)| (col.clone(), canonical.to_string()))
            })
            .collect();

        for (from, to) in renames {
            if self.data.contains_key(&to) {
                continue;
            }
            if let Some(values) = self.data.remove(&from) {
                self.data.insert(to.clone(), values);
                if let Some(slot) = self.columns.iter_mut().find(|c| **c == from) {
                    *slot = to;
                }
            }
        }
    }

    /// Pivot a decoded sample stream into rows keyed by timestamp: one row
    /// per timestamp, one column per channel name, last value wins.
    pub fn from_samples(samples: &[Sample]) -> Self {
        let mut timestamps: Vec<u32> = samples.iter().map(|s| s.timestamp_ms).collect();
        timestamps.sort_unstable();
        timestamps.dedup();
        let row_of: HashMap<u32, usize> = timestamps
            .iter()
            .enumerate()
            .map(|(i, t)| (*t, i))
            .collect();

        let mut log = Self::new();
        let mut ts_col: Vec<f64> = timestamps.iter().map(|t| *t as f64).collect();
        log.rows = ts_col.len();
        log.columns.push("timestamp_ms".to_string());
        log.data
            .insert("timestamp_ms".to_string(), std::mem::take(&mut ts_col));

        for sample in samples {
            let row = row_of[&sample.timestamp_ms];
            let col = log
                .data
                .entry(sample.channel_name.clone())
                .or_insert_with(|| vec![f64::NAN; timestamps.len()]);
            col[row] = sample.value as f64;
        }
        for name in samples.iter().map(|s| s.channel_name.clone()) {
            if !log.columns.contains(&name) {
                log.columns.push(name);
            }
        }
        log
    }
}

// -----------------------------------------------------------------------------
// Session types
// -----------------------------------------------------------------------------

/// Where the session's log came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    PowerVision,
    JetDrive,
    Csv,
    Simulation,
}

impl std::fmt::Display for LogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PowerVision => "power_vision",
            Self::JetDrive => "jetdrive",
            Self::Csv => "csv",
            Self::Simulation => "simulation",
        };
        write!(f, "{s}")
    }
}

/// Session lifecycle. Monotone forward except to `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initialized,
    LogImported,
    AfrAnalyzed,
    CorrectionsCalculated,
    Exported,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initialized => "initialized",
            Self::LogImported => "log_imported",
            Self::AfrAnalyzed => "afr_analyzed",
            Self::CorrectionsCalculated => "corrections_calculated",
            Self::Exported => "exported",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Results from AFR error analysis over the grid.
#[derive(Debug, Clone, Serialize)]
pub struct AfrAnalysis {
    /// Overall mean VE delta, percent.
    pub mean_ve_delta_pct: f64,
    /// Overall mean AFR error, points.
    pub mean_afr_error: f64,
    pub zones_lean: usize,
    pub zones_rich: usize,
    pub zones_ok: usize,
    pub zones_no_data: usize,
    pub max_lean_pct: f64,
    pub max_rich_pct: f64,
    /// AFR error (points) per cell; None below the hit threshold.
    pub afr_error: Vec<Vec<Option<f64>>>,
    /// VE delta (percent) per cell.
    pub ve_delta: Vec<Vec<Option<f64>>>,
    pub hit_count: Vec<Vec<u64>>,
}

/// Results from VE correction calculation.
#[derive(Debug, Clone, Serialize)]
pub struct VeCorrection {
    /// Multipliers in [1 - c, 1 + c]; 1.0 where data was insufficient.
    pub table: Vec<Vec<f64>>,
    pub rpm_axis: Vec<f64>,
    pub map_axis: Vec<f64>,
    pub zones_adjusted: usize,
    pub max_correction_pct: f64,
    pub min_correction_pct: f64,
    pub clipped_zones: usize,
}

/// A complete auto-tune session.
#[derive(Debug, Clone)]
pub struct AutoTuneSession {
    pub id: String,
    pub created_at: String,
    pub data_source: LogSource,
    pub log_file: Option<String>,
    pub log: Option<TuneLog>,
    pub afr_analysis: Option<AfrAnalysis>,
    pub ve_corrections: Option<VeCorrection>,
    pub peak_hp: f64,
    pub peak_hp_rpm: f64,
    pub peak_tq: f64,
    pub peak_tq_rpm: f64,
    pub output_dir: Option<String>,
    pub status: SessionStatus,
    pub errors: Vec<String>,
}

impl AutoTuneSession {
    fn fail(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        warn!(session = %self.id, error = %msg, "auto-tune session error");
        self.errors.push(msg);
        self.status = SessionStatus::Error;
    }
}

// -----------------------------------------------------------------------------
// Workflow engine
// -----------------------------------------------------------------------------

/// Unified auto-tune engine for every data source (Power Vision logs,
/// KLHDV captures, plain CSV, simulation frames).
pub struct AutoTuneWorkflow {
    pub rpm_axis: Vec<f64>,
    pub map_axis: Vec<f64>,
    pub max_correction_pct: f64,
    pub math_version: MathVersion,
    afr_targets: Vec<(f64, f64)>,
    pub min_hits_per_zone: u64,
}

impl Default for AutoTuneWorkflow {
    fn default() -> Self {
        Self {
            rpm_axis: DEFAULT_RPM_AXIS.to_vec(),
            map_axis: DEFAULT_MAP_AXIS.to_vec(),
            max_correction_pct: DEFAULT_MAX_CORRECTION_PCT,
            math_version: MathVersion::default(),
            afr_targets: DEFAULT_AFR_TARGETS.to_vec(),
            min_hits_per_zone: MIN_HITS_PER_ZONE,
        }
    }
}

impl AutoTuneWorkflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the AFR target map (MAP kPa → AFR).
    pub fn set_afr_targets(&mut self, targets: Vec<(f64, f64)>) {
        if !targets.is_empty() {
            self.afr_targets = targets;
        }
    }

    /// Target AFR for a MAP value: the nearest configured key wins.
    pub fn target_afr(&self, map_kpa: f64) -> f64 {
        self.afr_targets
            .iter()
            .min_by(|a, b| {
                (a.0 - map_kpa)
                    .abs()
                    .partial_cmp(&(b.0 - map_kpa).abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(_, afr)| *afr)
            .unwrap_or(14.0)
    }

    /// Allocate a fresh session.
    pub fn create_session(&self, source: LogSource) -> AutoTuneSession {
        let id = format!(
            "autotune_{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        info!(session = %id, source = %source, "auto-tune session created");
        AutoTuneSession {
            id,
            created_at: Utc::now().to_rfc3339(),
            data_source: source,
            log_file: None,
            log: None,
            afr_analysis: None,
            ve_corrections: None,
            peak_hp: 0.0,
            peak_hp_rpm: 0.0,
            peak_tq: 0.0,
            peak_tq_rpm: 0.0,
            output_dir: None,
            status: SessionStatus::Initialized,
            errors: Vec::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Imports
    // -------------------------------------------------------------------------

    /// Import a Power Vision CSV log.
    pub fn import_log(&self, session: &mut AutoTuneSession, path: &Path) -> bool {
        session.data_source = LogSource::PowerVision;
        self.import_csv_path(session, path)
    }

    /// Import a KLHDV capture CSV (`timestamp_ms, RPM, Torque, Horsepower,
    /// AFR, MAP_kPa?`). MAP is synthesized from RPM when absent.
    pub fn import_jetdrive_csv(&self, session: &mut AutoTuneSession, path: &Path) -> bool {
        session.data_source = LogSource::JetDrive;
        self.import_csv_path(session, path)
    }

    fn import_csv_path(&self, session: &mut AutoTuneSession, path: &Path) -> bool {
        if session.status != SessionStatus::Initialized {
            session.fail(format!(
                "log import requires an initialized session (status: {})",
                session.status
            ));
            return false;
        }
        session.log_file = Some(path.display().to_string());
        match read_csv_log(path) {
            Ok(log) => self.finish_import(session, log),
            Err(e) => {
                session.fail(format!("Log import failed: {e}"));
                false
            }
        }
    }

    /// Import an already-built frame (simulation output, live capture).
    pub fn import_frame(&self, session: &mut AutoTuneSession, log: TuneLog) -> bool {
        if session.status != SessionStatus::Initialized {
            session.fail(format!(
                "frame import requires an initialized session (status: {})",
                session.status
            ));
            return false;
        }
        self.finish_import(session, log)
    }

    fn finish_import(&self, session: &mut AutoTuneSession, mut log: TuneLog) -> bool {
        log.normalize_columns();

        if !log.has_column(COL_MAP) {
            if let Some(rpm) = log.column(COL_RPM) {
                let map: Vec<f64> = rpm.iter().map(|r| estimate_map_from_rpm(*r)).collect();
                let _ = log.push_column(COL_MAP.to_string(), map);
            }
        }

        extract_peaks(session, &log);
        info!(
            session = %session.id,
            rows = log.rows(),
            columns = log.columns().len(),
            "log imported"
        );
        session.log = Some(log);
        session.status = SessionStatus::LogImported;
        true
    }

    // -------------------------------------------------------------------------
    // Analysis
    // -------------------------------------------------------------------------

    /// Bin samples onto the grid and compute per-cell mean AFR, AFR error
    /// and VE delta. Running this twice on the same data yields identical
    /// matrices.
    pub fn analyze_afr(&self, session: &mut AutoTuneSession) -> Option<AfrAnalysis> {
        if session.status != SessionStatus::LogImported {
            session.fail(format!(
                "AFR analysis requires an imported log (status: {})",
                session.status
            ));
            return None;
        }
        let log = session.log.clone()?;

        let Some(rpm) = log.column(COL_RPM) else {
            session.fail("No RPM column found in data");
            return None;
        };
        let Some(afr_col_name) = find_afr_column(&log) else {
            session.fail("No AFR columns found in data");
            return None;
        };
        let afr = log.column(&afr_col_name)?;

        // MAP was synthesized at import when missing; tolerate its absence
        // anyway for frames built by hand.
        let map: Vec<f64> = match log.column(COL_MAP) {
            Some(m) => m.to_vec(),
            None => rpm.iter().map(|r| estimate_map_from_rpm(*r)).collect(),
        };

        let n_rpm = self.rpm_axis.len();
        let n_map = self.map_axis.len();
        let mut hit = vec![vec![0u64; n_map]; n_rpm];
        let mut afr_sum = vec![vec![0.0f64; n_map]; n_rpm];
        let mut binned = 0usize;

        for i in 0..log.rows() {
            let (r, a, m) = (rpm[i], afr[i], map[i]);
            if !r.is_finite() || !a.is_finite() || !m.is_finite() {
                continue;
            }
            let ri = nearest_bin(&self.rpm_axis, r);
            let mi = nearest_bin(&self.map_axis, m);
            hit[ri][mi] += 1;
            afr_sum[ri][mi] += a;
            binned += 1;
        }

        if binned == 0 {
            session.fail("Analysis failed: log contains no usable samples");
            return None;
        }

        let mut afr_error = vec![vec![None; n_map]; n_rpm];
        let mut ve_delta = vec![vec![None; n_map]; n_rpm];
        let mut any_cell = false;

        for ri in 0..n_rpm {
            for mi in 0..n_map {
                if hit[ri][mi] < self.min_hits_per_zone {
                    continue;
                }
                any_cell = true;
                let mean_afr = afr_sum[ri][mi] / hit[ri][mi] as f64;
                let target = self.target_afr(self.map_axis[mi]);
                afr_error[ri][mi] = Some(mean_afr - target);

                match calculate_ve_correction(mean_afr, target, self.math_version) {
                    Ok(correction) => {
                        ve_delta[ri][mi] = Some(correction_to_percentage(correction));
                    }
                    Err(e) => {
                        // Sensor garbage in this cell: report the error value,
                        // leave the VE delta empty.
                        warn!(session = %session.id, cell = ?(ri, mi), error = %e,
                              "skipping VE delta for out-of-range cell");
                    }
                }
            }
        }

        if !any_cell {
            session.fail(format!(
                "Analysis failed: no cell reached the minimum hit count ({})",
                self.min_hits_per_zone
            ));
            return None;
        }

        let errors: Vec<f64> = afr_error.iter().flatten().filter_map(|c| *c).collect();
        let deltas: Vec<f64> = ve_delta.iter().flatten().filter_map(|c| *c).collect();
        let cells = n_rpm * n_map;

        let zones_lean = errors.iter().filter(|e| **e > AFR_ERROR_TOLERANCE).count();
        let zones_rich = errors.iter().filter(|e| **e < -AFR_ERROR_TOLERANCE).count();
        let zones_ok = errors
            .iter()
            .filter(|e| e.abs() <= AFR_ERROR_TOLERANCE)
            .count();

        let analysis = AfrAnalysis {
            mean_ve_delta_pct: mean(&deltas),
            mean_afr_error: mean(&errors),
            zones_lean,
            zones_rich,
            zones_ok,
            zones_no_data: cells - errors.len(),
            max_lean_pct: deltas.iter().cloned().fold(f64::NAN, f64::max),
            max_rich_pct: deltas.iter().cloned().fold(f64::NAN, f64::min),
            afr_error,
            ve_delta,
            hit_count: hit,
        };

        info!(
            session = %session.id,
            zones_lean, zones_rich, zones_ok,
            mean_afr_error = analysis.mean_afr_error,
            "AFR analysis complete"
        );
        session.afr_analysis = Some(analysis.clone());
        session.status = SessionStatus::AfrAnalyzed;
        Some(analysis)
    }

    // -------------------------------------------------------------------------
    // Corrections
    // -------------------------------------------------------------------------

    /// Convert the per-cell VE delta into clamped multipliers.
    pub fn calculate_corrections(&self, session: &mut AutoTuneSession) -> Option<VeCorrection> {
        if session.status != SessionStatus::AfrAnalyzed {
            session.fail(format!(
                "correction calculation requires AFR analysis (status: {})",
                session.status
            ));
            return None;
        }
        let analysis = session.afr_analysis.clone()?;

        let n_rpm = self.rpm_axis.len();
        let n_map = self.map_axis.len();
        let max_corr = self.max_correction_pct / 100.0;

        let mut table = vec![vec![1.0f64; n_map]; n_rpm];
        let mut zones_adjusted = 0usize;
        let mut clipped_zones = 0usize;
        let mut applied: Vec<f64> = Vec::new();

        for ri in 0..n_rpm {
            for mi in 0..n_map {
                let valid = analysis.hit_count[ri][mi] >= self.min_hits_per_zone;
                let Some(delta_pct) = analysis.ve_delta[ri][mi] else {
                    continue;
                };
                if !valid {
                    continue;
                }
                let raw = 1.0 + delta_pct / 100.0;
                let (clamped, clipped) = clamp_correction(raw, max_corr);
                if clipped {
                    clipped_zones += 1;
                }
                table[ri][mi] = clamped;
                applied.push(clamped);
                zones_adjusted += 1;
            }
        }

        let correction = VeCorrection {
            table,
            rpm_axis: self.rpm_axis.clone(),
            map_axis: self.map_axis.clone(),
            zones_adjusted,
            max_correction_pct: pct_or_zero(applied.iter().cloned().fold(f64::NAN, f64::max)),
            min_correction_pct: pct_or_zero(applied.iter().cloned().fold(f64::NAN, f64::min)),
            clipped_zones,
        };

        info!(
            session = %session.id,
            zones_adjusted,
            clipped_zones,
            max_pct = correction.max_correction_pct,
            "VE corrections calculated"
        );
        session.ve_corrections = Some(correction.clone());
        session.status = SessionStatus::CorrectionsCalculated;
        Some(correction)
    }

    // -------------------------------------------------------------------------
    // Summary
    // -------------------------------------------------------------------------

    /// Build the serialisable session summary used by the export manifest.
    pub fn session_summary(&self, session: &AutoTuneSession) -> serde_json::Value {
        let mut summary = serde_json::json!({
            "run_id": session.id,
            "status": session.status.to_string(),
            "created_at": session.created_at,
            "data_source": session.data_source.to_string(),
            "log_file": session.log_file,
            "errors": session.errors,
        });

        if session.peak_hp > 0.0 || session.peak_tq > 0.0 {
            summary["peak_performance"] = serde_json::json!({
                "peak_hp": round1(session.peak_hp),
                "peak_hp_rpm": session.peak_hp_rpm.round(),
                "peak_tq": round1(session.peak_tq),
                "peak_tq_rpm": session.peak_tq_rpm.round(),
            });
        }

        if let Some(log) = &session.log {
            summary["total_samples"] = serde_json::json!(log.rows());
        }

        if let Some(afr) = &session.afr_analysis {
            let overall = if afr.zones_lean > afr.zones_rich {
                "LEAN"
            } else if afr.zones_rich > afr.zones_lean {
                "RICH"
            } else {
                "BALANCED"
            };
            summary["analysis"] = serde_json::json!({
                "overall_status": overall,
                "mean_ve_delta_pct": round2(afr.mean_ve_delta_pct),
                "mean_afr_error": round2(afr.mean_afr_error),
                "zones_lean": afr.zones_lean,
                "zones_rich": afr.zones_rich,
                "zones_ok": afr.zones_ok,
                "zones_no_data": afr.zones_no_data,
                "max_lean_pct": round2(afr.max_lean_pct),
                "max_rich_pct": round2(afr.max_rich_pct),
            });
        }

        if let Some(corr) = &session.ve_corrections {
            summary["grid"] = serde_json::json!({
                "rpm_bins": corr.rpm_axis,
                "map_bins": corr.map_axis,
                "ve_correction": corr.table,
            });
            summary["ve_corrections"] = serde_json::json!({
                "zones_adjusted": corr.zones_adjusted,
                "max_correction_pct": round2(corr.max_correction_pct),
                "min_correction_pct": round2(corr.min_correction_pct),
                "clipped_zones": corr.clipped_zones,
            });
        }

        summary
    }
}

// -----------------------------------------------------------------------------
// Free helpers
// -----------------------------------------------------------------------------

/// MAP estimate when the log carries no MAP channel.
pub fn estimate_map_from_rpm(rpm: f64) -> f64 {
    if rpm < 2000.0 {
        35.0
    } else if rpm < 3500.0 {
        50.0
    } else if rpm < 5000.0 {
        65.0
    } else {
        80.0
    }
}

fn nearest_bin(axis: &[f64], v: f64) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (i, &b) in axis.iter().enumerate() {
        let d = (v - b).abs();
        if d < best_dist {
            best_dist = d;
            best = i;
        }
    }
    best
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Multiplier aggregate → percentage; NaN (no cells applied) → 0.
fn pct_or_zero(multiplier: f64) -> f64 {
    if multiplier.is_nan() {
        0.0
    } else {
        (multiplier - 1.0) * 100.0
    }
}

/// Prefer a column containing "Meas" among AFR-bearing columns.
fn find_afr_column(log: &TuneLog) -> Option<String> {
    let afr_cols: Vec<&String> = log
        .columns()
        .iter()
        .filter(|c| c.to_lowercase().contains("afr"))
        .collect();
    if afr_cols.is_empty() {
        return None;
    }
    afr_cols
        .iter()
        .find(|c| c.contains("Meas"))
        .or(afr_cols.first())
        .map(|c| (*c).clone())
}

/// Case-insensitive substring search, most-specific preference first. Some
/// exporters use lower-case headers, so exact matching is not enough.
fn find_column_case_insensitive(columns: &[String], prefers: &[&str]) -> Option<String> {
    for pref in prefers {
        let pref_l = pref.to_lowercase();
        for col in columns {
            if col.to_lowercase().contains(&pref_l) {
                return Some(col.clone());
            }
        }
    }
    None
}

/// Extract peak HP/TQ and the RPM they occurred at.
fn extract_peaks(session: &mut AutoTuneSession, log: &TuneLog) {
    let rpm = log.column(COL_RPM);

    let hp_col = find_column_case_insensitive(
        log.columns(),
        &["horsepower", "horse power", " hp", "hp ", "power"],
    );
    if let Some(name) = hp_col {
        if let Some((idx, peak)) = argmax(log.column(&name).unwrap_or(&[])) {
            session.peak_hp = peak;
            if let Some(rpm) = rpm {
                session.peak_hp_rpm = rpm.get(idx).copied().unwrap_or(0.0);
            }
        }
    }

    let tq_col = find_column_case_insensitive(log.columns(), &["torque", " tq", "tq "]);
    if let Some(name) = tq_col {
        if let Some((idx, peak)) = argmax(log.column(&name).unwrap_or(&[])) {
            session.peak_tq = peak;
            if let Some(rpm) = rpm {
                session.peak_tq_rpm = rpm.get(idx).copied().unwrap_or(0.0);
            }
        }
    }
}

fn argmax(values: &[f64]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        if !v.is_finite() {
            continue;
        }
        if best.map_or(true, |(_, b)| v > b) {
            best = Some((i, v));
        }
    }
    best
}

/// Read a CSV file into a TuneLog. Unparseable cells become NaN.
pub fn read_csv_log(path: &Path) -> EngineResult<TuneLog> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| EngineError::Validation(format!("cannot read CSV {}: {e}", path.display())))?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| EngineError::Validation(format!("cannot read CSV headers: {e}")))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); headers.len()];
    for record in reader.records() {
        let record =
            record.map_err(|e| EngineError::Validation(format!("malformed CSV row: {e}")))?;
        for (i, col) in columns.iter_mut().enumerate() {
            let cell = record.get(i).unwrap_or("");
            col.push(cell.trim().parse::<f64>().unwrap_or(f64::NAN));
        }
    }

    let rows = columns.first().map_or(0, |c| c.len());
    for col in &mut columns {
        col.resize(rows, f64::NAN);
    }

    TuneLog::from_columns(headers.into_iter().zip(columns).collect())
}
