// =============================================================================
// Surface builder — reusable RPM/MAP surfaces from labeled data
// =============================================================================
//
// One format for every grid-based analysis: AFR error surfaces, knock
// activity surfaces, coverage surfaces. Built on the weighted bin
// accumulator with optional mode filtering.
// =============================================================================

use serde::Serialize;

use crate::binning::{Aggregation, BinConfig, WeightedBinAccumulator, WeightingStrategy};
use crate::errors::{EngineError, EngineResult};
use crate::nextgen::modes::ModeTag;
use crate::tuning::workflow::{TuneLog, COL_MAP, COL_RPM};

/// What to build a surface from.
#[derive(Debug, Clone)]
pub struct SurfaceSpec {
    /// Column providing the cell values.
    pub value_column: String,
    /// When non-empty, only rows labeled with one of these modes are used.
    pub filter_modes: Vec<ModeTag>,
    pub aggregation: Aggregation,
    pub weighting: WeightingStrategy,
    pub min_samples_per_cell: u64,
}

impl SurfaceSpec {
    pub fn mean_of(column: &str) -> Self {
        Self {
            value_column: column.to_string(),
            filter_modes: Vec::new(),
            aggregation: Aggregation::WeightedMean,
            weighting: WeightingStrategy::Logarithmic,
            min_samples_per_cell: 3,
        }
    }

    pub fn with_modes(mut self, modes: &[ModeTag]) -> Self {
        self.filter_modes = modes.to_vec();
        self
    }
}

/// Coverage statistics for a built surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SurfaceStats {
    pub total_cells: usize,
    pub covered_cells: usize,
    pub samples_used: u64,
    pub samples_rejected: u64,
}

/// A built 2-D surface with its axes and hit counts.
#[derive(Debug, Clone, Serialize)]
pub struct Surface2D {
    pub title: String,
    pub value_column: String,
    pub rpm_axis: Vec<f64>,
    pub map_axis: Vec<f64>,
    pub values: Vec<Vec<Option<f64>>>,
    pub hit_count: Vec<Vec<u64>>,
    pub stats: SurfaceStats,
}

impl Surface2D {
    /// Mean of the covered cells, if any.
    pub fn mean_value(&self) -> Option<f64> {
        let covered: Vec<f64> = self.values.iter().flatten().filter_map(|v| *v).collect();
        if covered.is_empty() {
            None
        } else {
            Some(covered.iter().sum::<f64>() / covered.len() as f64)
        }
    }

    /// Largest absolute covered value, if any.
    pub fn max_abs_value(&self) -> Option<f64> {
        self.values
            .iter()
            .flatten()
            .filter_map(|v| *v)
            .map(f64::abs)
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
    }
}

/// Build one surface from a labeled log.
pub fn build_surface(
    log: &TuneLog,
    labels: &[ModeTag],
    spec: &SurfaceSpec,
    rpm_axis: &[f64],
    map_axis: &[f64],
) -> EngineResult<Surface2D> {
    let rpm = log
        .column(COL_RPM)
        .ok_or_else(|| EngineError::Analysis("surface build requires an RPM column".into()))?;
    let map = log
        .column(COL_MAP)
        .ok_or_else(|| EngineError::Analysis("surface build requires a MAP column".into()))?;
    let values = log.column(&spec.value_column).ok_or_else(|| {
        EngineError::Analysis(format!("surface column '{}' not in log", spec.value_column))
    })?;
    if labels.len() != log.rows() {
        return Err(EngineError::Analysis(format!(
            "label count {} does not match {} rows",
            labels.len(),
            log.rows()
        )));
    }

    let mut acc = WeightedBinAccumulator::new(
        rpm_axis.to_vec(),
        map_axis.to_vec(),
        BinConfig {
            strategy: spec.weighting,
            aggregation: spec.aggregation,
            min_samples_per_cell: spec.min_samples_per_cell,
            ..BinConfig::default()
        },
    );

    for i in 0..log.rows() {
        if !spec.filter_modes.is_empty() && !spec.filter_modes.contains(&labels[i]) {
            continue;
        }
        acc.add_sample(rpm[i], map[i], values[i]);
    }

    let table = acc.table();
    let hit_count = acc.hit_counts();
    let covered = table.iter().flatten().filter(|c| c.is_some()).count();
    let bin_stats = acc.stats();

    Ok(Surface2D {
        title: surface_title(spec),
        value_column: spec.value_column.clone(),
        rpm_axis: rpm_axis.to_vec(),
        map_axis: map_axis.to_vec(),
        values: table,
        hit_count,
        stats: SurfaceStats {
            total_cells: rpm_axis.len() * map_axis.len(),
            covered_cells: covered,
            samples_used: bin_stats.samples_added,
            samples_rejected: bin_stats.samples_rejected,
        },
    })
}

fn surface_title(spec: &SurfaceSpec) -> String {
    if spec.filter_modes.is_empty() {
        spec.value_column.clone()
    } else {
        let modes: Vec<String> = spec.filter_modes.iter().map(|m| m.to_string()).collect();
        format!("{} ({})", spec.value_column, modes.join("+"))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn axes() -> (Vec<f64>, Vec<f64>) {
        (
            vec![2000.0, 3000.0, 4000.0],
            vec![40.0, 70.0, 100.0],
        )
    }

    fn labeled_log() -> (TuneLog, Vec<ModeTag>) {
        let mut rpm = Vec::new();
        let mut map = Vec::new();
        let mut tps = Vec::new();
        let mut afr = Vec::new();
        let mut tags = Vec::new();
        // WOT band: rpm 3000, map 100.
        for _ in 0..10 {
            rpm.push(3000.0);
            map.push(100.0);
            tps.push(100.0);
            afr.push(13.4);
            tags.push(ModeTag::Wot);
        }
        // Cruise band: rpm 2000, map 40.
        for _ in 0..10 {
            rpm.push(2000.0);
            map.push(40.0);
            tps.push(30.0);
            afr.push(14.5);
            tags.push(ModeTag::Cruise);
        }
        let log = TuneLog::from_columns(vec![
            ("Engine RPM".to_string(), rpm),
            ("MAP kPa".to_string(), map),
            ("TPS".to_string(), tps),
            ("AFR Meas F".to_string(), afr),
        ])
        .unwrap();
        (log, tags)
    }

    #[test]
    fn unfiltered_surface_covers_both_bands() {
        let (log, tags) = labeled_log();
        let (rpm_axis, map_axis) = axes();
        let spec = SurfaceSpec::mean_of("AFR Meas F");
        let surface = build_surface(&log, &tags, &spec, &rpm_axis, &map_axis).unwrap();

        assert_eq!(surface.stats.covered_cells, 2);
        assert_eq!(surface.stats.samples_used, 20);
        assert!((surface.values[1][2].unwrap() - 13.4).abs() < 1e-9);
        assert!((surface.values[0][0].unwrap() - 14.5).abs() < 1e-9);
    }

    #[test]
    fn mode_filter_restricts_the_surface() {
        let (log, tags) = labeled_log();
        let (rpm_axis, map_axis) = axes();
        let spec = SurfaceSpec::mean_of("AFR Meas F").with_modes(&[ModeTag::Wot]);
        let surface = build_surface(&log, &tags, &spec, &rpm_axis, &map_axis).unwrap();

        assert_eq!(surface.stats.covered_cells, 1);
        assert!(surface.values[1][2].is_some());
        assert!(surface.values[0][0].is_none());
        assert!(surface.title.contains("wot"));
    }

    #[test]
    fn hit_counts_and_shape_match_the_axes() {
        let (log, tags) = labeled_log();
        let (rpm_axis, map_axis) = axes();
        let spec = SurfaceSpec::mean_of("AFR Meas F");
        let surface = build_surface(&log, &tags, &spec, &rpm_axis, &map_axis).unwrap();

        assert_eq!(surface.values.len(), rpm_axis.len());
        assert_eq!(surface.hit_count[1][2], 10);
        assert_eq!(surface.stats.total_cells, 9);
    }

    #[test]
    fn missing_value_column_is_an_error() {
        let (log, tags) = labeled_log();
        let (rpm_axis, map_axis) = axes();
        let spec = SurfaceSpec::mean_of("Spark F");
        let err = build_surface(&log, &tags, &spec, &rpm_axis, &map_axis).unwrap_err();
        assert_eq!(err.kind(), "analysis");
    }

    #[test]
    fn label_length_mismatch_is_rejected() {
        let (log, _) = labeled_log();
        let (rpm_axis, map_axis) = axes();
        let spec = SurfaceSpec::mean_of("AFR Meas F");
        let err = build_surface(&log, &[ModeTag::Wot], &spec, &rpm_axis, &map_axis).unwrap_err();
        assert_eq!(err.kind(), "analysis");
    }

    #[test]
    fn summary_helpers_summarize_covered_cells() {
        let (log, tags) = labeled_log();
        let (rpm_axis, map_axis) = axes();
        let spec = SurfaceSpec::mean_of("AFR Meas F");
        let surface = build_surface(&log, &tags, &spec, &rpm_axis, &map_axis).unwrap();

        assert!((surface.mean_value().unwrap() - 13.95).abs() < 1e-9);
        assert!((surface.max_abs_value().unwrap() - 14.5).abs() < 1e-9);
    }
}
