// =============================================================================
// Correction exports — PVV XML, TuneLab script, grid CSVs, manifest
// =============================================================================
//
// The PVV export is consumed by Power-Vision tooling: element names and
// numeric precision are stable contracts. Tables are keyed elements with
// units, row/column axes and a row-major numeric block; scalars ride
// alongside. Grid CSVs carry four-decimal multipliers so export-then-reparse
// recovers the matrix at the documented precision. The manifest is written
// temp-then-rename so a reader never sees a partial JSON.
// =============================================================================

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use tracing::info;

use crate::errors::{EngineError, EngineResult};
use crate::tuning::workflow::{AutoTuneSession, AutoTuneWorkflow, SessionStatus, VeCorrection};

/// Correction table name inside the PVV export.
const PVV_TABLE_NAME: &str = "VE Correction";
/// TuneLab defaults: table, AFR channel, smoothing and clip bounds.
const TUNELAB_CORRECTION_TABLE: &str = "Volumetric Efficiency";
const TUNELAB_AFR_CHANNEL: &str = "Air/Fuel Ratio 1";
const TUNELAB_SMOOTHING: f64 = 500.0;
const TUNELAB_MIN_AFR: f64 = 10.0;
const TUNELAB_MAX_AFR: f64 = 19.0;

/// Write every artifact for a session: PVV XML, TuneLab script, the three
/// grid CSVs and `manifest.json`. Returns the output path map recorded in
/// the manifest.
pub fn export_all(
    workflow: &AutoTuneWorkflow,
    session: &mut AutoTuneSession,
    dir: &Path,
) -> EngineResult<BTreeMap<String, String>> {
    if session.status != SessionStatus::CorrectionsCalculated {
        let msg = format!(
            "export requires calculated corrections (status: {})",
            session.status
        );
        session.errors.push(msg.clone());
        session.status = SessionStatus::Error;
        return Err(EngineError::Validation(msg));
    }

    std::fs::create_dir_all(dir).map_err(|e| {
        EngineError::Internal(format!("cannot create export dir {}: {e}", dir.display()))
    })?;

    let corrections = session
        .ve_corrections
        .clone()
        .ok_or_else(|| EngineError::Internal("corrections missing after state check".into()))?;
    let analysis = session
        .afr_analysis
        .clone()
        .ok_or_else(|| EngineError::Internal("analysis missing after state check".into()))?;

    let mut outputs = BTreeMap::new();

    // 1. PVV XML.
    let pvv_path = dir.join(format!("ve_correction_{}.pvv", session.id));
    std::fs::write(&pvv_path, generate_pvv_xml(&corrections)?)
        .map_err(|e| EngineError::Internal(format!("cannot write PVV: {e}")))?;
    outputs.insert("pvv_file".to_string(), pvv_path.display().to_string());

    // 2. TuneLab script.
    let script_path = dir.join(format!("correction_script_{}.py", session.id));
    std::fs::write(&script_path, generate_tunelab_script())
        .map_err(|e| EngineError::Internal(format!("cannot write TuneLab script: {e}")))?;
    outputs.insert(
        "tunelab_script".to_string(),
        script_path.display().to_string(),
    );

    // 3. VE correction grid.
    let ve_csv = dir.join("VE_Corrections_2D.csv");
    write_grid_csv(
        &ve_csv,
        &corrections.rpm_axis,
        &corrections.map_axis,
        |ri, mi| format!("{:.4}", corrections.table[ri][mi]),
    )?;
    outputs.insert("ve_corrections_csv".to_string(), ve_csv.display().to_string());

    // 4. AFR error grid (blank cells where coverage was insufficient).
    let afr_csv = dir.join("AFR_Error_2D.csv");
    write_grid_csv(
        &afr_csv,
        &corrections.rpm_axis,
        &corrections.map_axis,
        |ri, mi| match analysis.afr_error[ri][mi] {
            Some(v) => format!("{v:.4}"),
            None => String::new(),
        },
    )?;
    outputs.insert("afr_error_csv".to_string(), afr_csv.display().to_string());

    // 5. Hit count grid.
    let hits_csv = dir.join("Hit_Count_2D.csv");
    write_grid_csv(
        &hits_csv,
        &corrections.rpm_axis,
        &corrections.map_axis,
        |ri, mi| analysis.hit_count[ri][mi].to_string(),
    )?;
    outputs.insert("hit_count_csv".to_string(), hits_csv.display().to_string());

    session.output_dir = Some(dir.display().to_string());
    session.status = SessionStatus::Exported;

    // 6. Manifest, written last so it describes a complete export.
    let mut manifest = workflow.session_summary(session);
    manifest["outputs"] = serde_json::json!(outputs);
    let manifest_path = dir.join("manifest.json");
    write_json_atomic(&manifest_path, &manifest)
        .map_err(|e| EngineError::Internal(format!("cannot write manifest: {e}")))?;
    outputs.insert("manifest".to_string(), manifest_path.display().to_string());

    info!(
        session = %session.id,
        dir = %dir.display(),
        artifacts = outputs.len(),
        "session exported"
    );
    Ok(outputs)
}

/// Serialize JSON to `path` via a temporary sibling plus rename.
pub fn write_json_atomic(path: &Path, value: &serde_json::Value) -> anyhow::Result<()> {
    let content = serde_json::to_string_pretty(value).context("serialising JSON")?;
    let tmp: PathBuf = path.with_extension("json.tmp");
    std::fs::write(&tmp, &content)
        .with_context(|| format!("writing tmp file {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------------
// Grid CSV
// -----------------------------------------------------------------------------

/// Write a grid CSV: header `RPM\MAP,<map bins...>`, one row per RPM bin.
fn write_grid_csv<F>(
    path: &Path,
    rpm_axis: &[f64],
    map_axis: &[f64],
    mut cell: F,
) -> EngineResult<()>
where
    F: FnMut(usize, usize) -> String,
{
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| EngineError::Internal(format!("cannot open {}: {e}", path.display())))?;

    let mut header = vec!["RPM\\MAP".to_string()];
    header.extend(map_axis.iter().map(|m| format!("{m}")));
    writer
        .write_record(&header)
        .map_err(|e| EngineError::Internal(format!("csv write failed: {e}")))?;

    for (ri, rpm) in rpm_axis.iter().enumerate() {
        let mut row = vec![format!("{rpm}")];
        row.extend((0..map_axis.len()).map(|mi| cell(ri, mi)));
        writer
            .write_record(&row)
            .map_err(|e| EngineError::Internal(format!("csv write failed: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| EngineError::Internal(format!("csv flush failed: {e}")))?;
    Ok(())
}

/// Re-parse a correction grid CSV back into a multiplier matrix.
pub fn parse_corrections_csv(path: &Path) -> EngineResult<Vec<Vec<f64>>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| EngineError::Validation(format!("cannot read {}: {e}", path.display())))?;

    let mut matrix = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| EngineError::Validation(format!("malformed grid CSV: {e}")))?;
        let row: Result<Vec<f64>, _> = record
            .iter()
            .skip(1) // RPM label column
            .map(|cell| cell.trim().parse::<f64>())
            .collect();
        matrix.push(row.map_err(|e| EngineError::Validation(format!("bad grid value: {e}")))?);
    }
    Ok(matrix)
}

// -----------------------------------------------------------------------------
// PVV XML
// -----------------------------------------------------------------------------

/// Build the PVV XML document for a correction table. Values are written as
/// percentages with two decimals, row-major.
pub fn generate_pvv_xml(corrections: &VeCorrection) -> EngineResult<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::Start(BytesStart::new("PVVTune")))
        .map_err(xml_err)?;

    // Table element with axes and values.
    let mut table = BytesStart::new("Table");
    table.push_attribute(("key", PVV_TABLE_NAME));
    table.push_attribute(("units", "%"));
    table.push_attribute(("rowUnits", "RPM"));
    table.push_attribute(("colUnits", "MAP (KPa)"));
    writer.write_event(Event::Start(table)).map_err(xml_err)?;

    write_text_element(
        &mut writer,
        "RowAxis",
        &join_numbers(&corrections.rpm_axis, 0),
    )?;
    write_text_element(
        &mut writer,
        "ColAxis",
        &join_numbers(&corrections.map_axis, 0),
    )?;

    let mut values = BytesStart::new("Values");
    values.push_attribute(("rows", corrections.rpm_axis.len().to_string().as_str()));
    values.push_attribute(("cols", corrections.map_axis.len().to_string().as_str()));
    writer.write_event(Event::Start(values)).map_err(xml_err)?;
    let flat: Vec<String> = corrections
        .table
        .iter()
        .flatten()
        .map(|v| format!("{:.2}", v * 100.0))
        .collect();
    writer
        .write_event(Event::Text(BytesText::new(&flat.join(" "))))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("Values")))
        .map_err(xml_err)?;

    writer
        .write_event(Event::End(BytesEnd::new("Table")))
        .map_err(xml_err)?;

    // Scalars consumers key on by name.
    write_scalar(
        &mut writer,
        "Max Correction %",
        corrections.max_correction_pct,
    )?;
    write_scalar(
        &mut writer,
        "Min Correction %",
        corrections.min_correction_pct,
    )?;
    write_scalar(
        &mut writer,
        "Zones Adjusted",
        corrections.zones_adjusted as f64,
    )?;

    writer
        .write_event(Event::End(BytesEnd::new("PVVTune")))
        .map_err(xml_err)?;

    String::from_utf8(writer.into_inner())
        .map_err(|e| EngineError::Internal(format!("PVV output not UTF-8: {e}")))
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    text: &str,
) -> EngineResult<()> {
    writer
        .write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_err)?;
    Ok(())
}

fn write_scalar(writer: &mut Writer<Vec<u8>>, key: &str, value: f64) -> EngineResult<()> {
    let mut scalar = BytesStart::new("Scalar");
    scalar.push_attribute(("key", key));
    writer.write_event(Event::Start(scalar)).map_err(xml_err)?;
    writer
        .write_event(Event::Text(BytesText::new(&format!("{value:.2}"))))
        .map_err(xml_err)?;
    writer
        .write_event(Event::End(BytesEnd::new("Scalar")))
        .map_err(xml_err)?;
    Ok(())
}

fn xml_err<E: std::fmt::Display>(e: E) -> EngineError {
    EngineError::Internal(format!("PVV writer failed: {e}"))
}

fn join_numbers(values: &[f64], decimals: usize) -> String {
    values
        .iter()
        .map(|v| format!("{v:.decimals$}"))
        .collect::<Vec<_>>()
        .join(" ")
}

// -----------------------------------------------------------------------------
// TuneLab script
// -----------------------------------------------------------------------------

/// Render the TuneLab correction script for the external scripting host.
pub fn generate_tunelab_script() -> String {
    format!(
        r#"# TuneLab VE correction script
# Applies the logged AFR error to the ECU's VE table.

CORRECTION_TABLE = "{table}"
AFR_CHANNEL = "{channel}"
SMOOTHING = {smoothing:.1}
MIN_AFR = {min_afr:.1}
MAX_AFR = {max_afr:.1}

table = tune.get_table(CORRECTION_TABLE)
afr = log.get_channel(AFR_CHANNEL).clip(MIN_AFR, MAX_AFR)
corrections = generate_sample_table(afr, smoothing=SMOOTHING)
table.apply_multipliers(corrections)
"#,
        table = TUNELAB_CORRECTION_TABLE,
        channel = TUNELAB_AFR_CHANNEL,
        smoothing = TUNELAB_SMOOTHING,
        min_afr = TUNELAB_MIN_AFR,
        max_afr = TUNELAB_MAX_AFR,
    )
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::workflow::{LogSource, TuneLog};

    fn exported_session() -> (AutoTuneWorkflow, AutoTuneSession, tempfile::TempDir) {
        let workflow = AutoTuneWorkflow::new();
        let mut session = workflow.create_session(LogSource::Csv);

        let mut rpm = Vec::new();
        let mut map = Vec::new();
        let mut afr = Vec::new();
        for i in 0..300 {
            let r = [3000.0, 4000.0, 5000.0][i % 3];
            let m = [60.0, 80.0, 100.0][(i / 3) % 3];
            rpm.push(r);
            map.push(m);
            afr.push(workflow.target_afr(m) + 0.5);
        }
        let log = TuneLog::from_columns(vec![
            ("RPM".to_string(), rpm),
            ("MAP_kPa".to_string(), map),
            ("AFR".to_string(), afr),
        ])
        .unwrap();

        workflow.import_frame(&mut session, log);
        workflow.analyze_afr(&mut session).unwrap();
        workflow.calculate_corrections(&mut session).unwrap();

        let dir = tempfile::tempdir().unwrap();
        (workflow, session, dir)
    }

    #[test]
    fn export_writes_every_artifact_and_transitions_state() {
        let (workflow, mut session, dir) = exported_session();
        let outputs = export_all(&workflow, &mut session, dir.path()).unwrap();

        assert_eq!(session.status, SessionStatus::Exported);
        for key in [
            "pvv_file",
            "tunelab_script",
            "ve_corrections_csv",
            "afr_error_csv",
            "hit_count_csv",
            "manifest",
        ] {
            let path = outputs.get(key).expect(key);
            assert!(Path::new(path).exists(), "{key} should exist");
        }
    }

    #[test]
    fn correction_csv_round_trips_at_four_decimals() {
        let (workflow, mut session, dir) = exported_session();
        let outputs = export_all(&workflow, &mut session, dir.path()).unwrap();

        let matrix = parse_corrections_csv(Path::new(&outputs["ve_corrections_csv"])).unwrap();
        let original = &session.ve_corrections.as_ref().unwrap().table;

        assert_eq!(matrix.len(), original.len());
        for (parsed_row, orig_row) in matrix.iter().zip(original) {
            assert_eq!(parsed_row.len(), orig_row.len());
            for (p, o) in parsed_row.iter().zip(orig_row) {
                assert!((p - o).abs() < 5e-5, "round-trip drift: {p} vs {o}");
            }
        }
    }

    #[test]
    fn manifest_shape_is_the_downstream_contract() {
        let (workflow, mut session, dir) = exported_session();
        export_all(&workflow, &mut session, dir.path()).unwrap();

        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("manifest.json")).unwrap())
                .unwrap();

        assert_eq!(manifest["run_id"], serde_json::json!(session.id));
        assert_eq!(manifest["status"], "exported");
        assert!(manifest["analysis"]["zones_lean"].is_number());
        assert!(manifest["grid"]["ve_correction"].is_array());
        assert!(manifest["outputs"]["pvv_file"].is_string());
        // No tmp file left behind.
        assert!(!dir.path().join("manifest.json.tmp").exists());
    }

    #[test]
    fn pvv_xml_names_tables_and_scalars() {
        let (workflow, mut session, dir) = exported_session();
        let outputs = export_all(&workflow, &mut session, dir.path()).unwrap();

        let xml = std::fs::read_to_string(&outputs["pvv_file"]).unwrap();
        assert!(xml.contains(r#"<Table key="VE Correction" units="%""#));
        assert!(xml.contains("<RowAxis>1500 2000"));
        assert!(xml.contains(r#"<Scalar key="Zones Adjusted">"#));
        assert!(xml.contains(r#"<Scalar key="Max Correction %">"#));
        assert!(xml.contains(r#"rows="11" cols="9""#));
    }

    #[test]
    fn tunelab_script_fills_the_template() {
        let script = generate_tunelab_script();
        assert!(script.contains(r#"CORRECTION_TABLE = "Volumetric Efficiency""#));
        assert!(script.contains(r#"AFR_CHANNEL = "Air/Fuel Ratio 1""#));
        assert!(script.contains("SMOOTHING = 500.0"));
        assert!(script.contains("MIN_AFR = 10.0"));
        assert!(script.contains("MAX_AFR = 19.0"));
    }

    #[test]
    fn export_without_corrections_is_a_validation_error() {
        let workflow = AutoTuneWorkflow::new();
        let mut session = workflow.create_session(LogSource::Csv);
        let dir = tempfile::tempdir().unwrap();

        let err = export_all(&workflow, &mut session, dir.path()).unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(session.status, SessionStatus::Error);
    }
}
