// =============================================================================
// NextGen analysis — modes, surfaces, cause tree, test planner
// =============================================================================
//
// The analysis payload is the single versioned artifact downstream
// consumers read (`dynoai.nextgen@1`). Unknown schema versions are
// rejected on read rather than guessed at.
// =============================================================================

pub mod cause_tree;
pub mod modes;
pub mod planner;
pub mod surfaces;

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::binning::Aggregation;
use crate::errors::{EngineError, EngineResult};
use crate::nextgen::cause_tree::{build_cause_tree, CauseTreeResult};
use crate::nextgen::modes::{label_modes, ModeDetectionConfig};
use crate::nextgen::planner::{generate_test_plan, NextTestPlan};
use crate::nextgen::surfaces::{build_surface, Surface2D, SurfaceSpec};
use crate::tuning::workflow::{
    AutoTuneWorkflow, TuneLog, COL_RPM, DEFAULT_MAP_AXIS, DEFAULT_RPM_AXIS,
};

/// Payload schema tag; bump when the shape changes.
pub const SCHEMA_VERSION: &str = "dynoai.nextgen@1";

/// The stable JSON artifact for one analyzed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextGenAnalysisPayload {
    pub schema: String,
    pub run_id: String,
    pub created_at: String,
    /// Which canonical channels the input actually carried.
    pub inputs_present: BTreeMap<String, bool>,
    pub mode_summary: BTreeMap<String, usize>,
    #[serde(skip_deserializing)]
    pub surfaces: BTreeMap<String, Surface2D>,
    #[serde(skip_deserializing)]
    pub cause_tree: Option<CauseTreeResult>,
    #[serde(skip_deserializing)]
    pub next_tests: Option<NextTestPlan>,
}

/// Parse a payload header, rejecting unknown schema versions.
pub fn parse_payload(json: &str) -> EngineResult<NextGenAnalysisPayload> {
    let payload: NextGenAnalysisPayload = serde_json::from_str(json)
        .map_err(|e| EngineError::Validation(format!("malformed NextGen payload: {e}")))?;
    if payload.schema != SCHEMA_VERSION {
        return Err(EngineError::Validation(format!(
            "unknown NextGen schema '{}', expected '{SCHEMA_VERSION}'",
            payload.schema
        )));
    }
    Ok(payload)
}

/// Run the full NextGen pipeline over a normalized log: label modes, build
/// the standard surfaces, derive the cause tree and the next-test plan.
pub fn run_nextgen_analysis(run_id: &str, log: &TuneLog) -> EngineResult<NextGenAnalysisPayload> {
    let rpm_axis: Vec<f64> = DEFAULT_RPM_AXIS.to_vec();
    let map_axis: Vec<f64> = DEFAULT_MAP_AXIS.to_vec();

    let labels = label_modes(log, &ModeDetectionConfig::default())?;

    let mut inputs_present = BTreeMap::new();
    for channel in [COL_RPM, "MAP kPa", "TPS", "AFR Meas F", "AFR Meas R", "Knock", "IAT"] {
        inputs_present.insert(channel.to_string(), log.has_column(channel));
    }

    // AFR error column derived against the configured targets.
    let mut enriched = log.clone();
    if let (Some(afr), Some(map)) = (log.column("AFR Meas F"), log.column("MAP kPa")) {
        let workflow = AutoTuneWorkflow::new();
        let errors: Vec<f64> = afr
            .iter()
            .zip(map)
            .map(|(a, m)| a - workflow.target_afr(*m))
            .collect();
        enriched.push_column("AFR Error".to_string(), errors)?;
    }

    let mut surfaces = BTreeMap::new();

    let afr_error_surface = if enriched.has_column("AFR Error") {
        let spec = SurfaceSpec::mean_of("AFR Error");
        let surface = build_surface(&enriched, &labels.tags, &spec, &rpm_axis, &map_axis)?;
        surfaces.insert("afr_error".to_string(), surface.clone());
        Some(surface)
    } else {
        None
    };

    let knock_surface = if enriched.has_column("Knock") {
        let spec = SurfaceSpec {
            aggregation: Aggregation::Sum,
            ..SurfaceSpec::mean_of("Knock")
        };
        let surface = build_surface(&enriched, &labels.tags, &spec, &rpm_axis, &map_axis)?;
        surfaces.insert("knock".to_string(), surface.clone());
        Some(surface)
    } else {
        None
    };

    // Coverage surface doubles as the planner input.
    let coverage_spec = SurfaceSpec {
        min_samples_per_cell: 1,
        ..SurfaceSpec::mean_of(COL_RPM)
    };
    let coverage = build_surface(&enriched, &labels.tags, &coverage_spec, &rpm_axis, &map_axis)?;
    surfaces.insert("coverage".to_string(), coverage.clone());

    let cause_tree = afr_error_surface
        .as_ref()
        .map(|afr| build_cause_tree(&labels.summary_counts, afr, knock_surface.as_ref()));
    let next_tests = cause_tree
        .as_ref()
        .map(|tree| generate_test_plan(&coverage, tree));

    Ok(NextGenAnalysisPayload {
        schema: SCHEMA_VERSION.to_string(),
        run_id: run_id.to_string(),
        created_at: Utc::now().to_rfc3339(),
        inputs_present,
        mode_summary: labels.summary_counts,
        surfaces,
        cause_tree,
        next_tests,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn wot_log(afr_offset: f64) -> TuneLog {
        let workflow = AutoTuneWorkflow::new();
        let mut rpm = Vec::new();
        let mut map = Vec::new();
        let mut tps = Vec::new();
        let mut afr = Vec::new();
        let mut knock = Vec::new();
        for i in 0..200 {
            let r = 3000.0 + (i % 8) as f64 * 500.0;
            rpm.push(r);
            map.push(100.0);
            tps.push(100.0);
            afr.push(workflow.target_afr(100.0) + afr_offset);
            knock.push(0.0);
        }
        TuneLog::from_columns(vec![
            ("Engine RPM".to_string(), rpm),
            ("MAP kPa".to_string(), map),
            ("TPS".to_string(), tps),
            ("AFR Meas F".to_string(), afr),
            ("Knock".to_string(), knock),
        ])
        .unwrap()
    }

    #[test]
    fn pipeline_produces_a_versioned_payload() {
        let payload = run_nextgen_analysis("run_1", &wot_log(0.8)).unwrap();
        assert_eq!(payload.schema, SCHEMA_VERSION);
        assert_eq!(payload.run_id, "run_1");
        assert!(payload.inputs_present["Engine RPM"]);
        assert!(!payload.inputs_present["IAT"]);
        assert_eq!(payload.mode_summary["wot"], 200);
        assert!(payload.surfaces.contains_key("afr_error"));
        assert!(payload.surfaces.contains_key("coverage"));
    }

    #[test]
    fn lean_log_shows_up_in_the_cause_tree() {
        let payload = run_nextgen_analysis("run_2", &wot_log(0.8)).unwrap();
        let tree = payload.cause_tree.expect("cause tree");
        assert!(tree
            .hypotheses
            .iter()
            .any(|h| h.title.contains("lean")));
        assert!(payload.next_tests.is_some());
    }

    #[test]
    fn payload_round_trips_through_json() {
        let payload = run_nextgen_analysis("run_3", &wot_log(0.0)).unwrap();
        let json = serde_json::to_string(&payload).unwrap();
        let parsed = parse_payload(&json).unwrap();
        assert_eq!(parsed.run_id, "run_3");
        assert_eq!(parsed.mode_summary, payload.mode_summary);
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let json = r#"{
            "schema": "dynoai.nextgen@9",
            "run_id": "run_x",
            "created_at": "2025-01-01T00:00:00Z",
            "inputs_present": {},
            "mode_summary": {}
        }"#;
        let err = parse_payload(json).unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(err.to_string().contains("dynoai.nextgen@9"));
    }

    #[test]
    fn malformed_payload_is_a_validation_error() {
        assert_eq!(parse_payload("not json").unwrap_err().kind(), "validation");
    }
}
