// =============================================================================
// Cause tree — ECU-coupling-aware diagnosis
// =============================================================================
//
// Deterministic hypothesis generation reflecting how the ECU actually
// behaves: VE is a correction layer and closed-loop can mask VE error;
// knock always has authority over spark; VE and spark couple through
// combustion efficiency. Output is diagnosis plus recommended checks only,
// never calibration changes.
// =============================================================================

use std::collections::BTreeMap;

use serde::Serialize;

use crate::nextgen::surfaces::Surface2D;
use crate::tuning::workflow::AFR_ERROR_TOLERANCE;

/// Coverage fraction below which the data itself is the problem.
const LOW_COVERAGE_FRACTION: f64 = 0.30;
/// Tip-in share of the log that makes transient fueling worth a look.
const TRANSIENT_SHARE: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HypothesisCategory {
    Transient,
    KnockLimit,
    TempTrim,
    FuelModel,
    DataQuality,
}

/// One diagnosis with its supporting evidence.
#[derive(Debug, Clone, Serialize)]
pub struct Hypothesis {
    pub category: HypothesisCategory,
    pub title: String,
    /// 0..1; ordering key for the result list.
    pub confidence: f64,
    pub evidence: Vec<String>,
    pub recommended_checks: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CauseTreeResult {
    pub hypotheses: Vec<Hypothesis>,
}

/// Build the cause tree from the mode distribution and the standard
/// surfaces. Every rule is a fixed threshold; same inputs, same tree.
pub fn build_cause_tree(
    mode_summary: &BTreeMap<String, usize>,
    afr_error_surface: &Surface2D,
    knock_surface: Option<&Surface2D>,
) -> CauseTreeResult {
    let mut hypotheses = Vec::new();
    let total_samples: usize = mode_summary.values().sum();

    // Data quality first: every other hypothesis is weaker on thin data.
    let coverage = if afr_error_surface.stats.total_cells == 0 {
        0.0
    } else {
        afr_error_surface.stats.covered_cells as f64 / afr_error_surface.stats.total_cells as f64
    };
    if coverage < LOW_COVERAGE_FRACTION {
        hypotheses.push(Hypothesis {
            category: HypothesisCategory::DataQuality,
            title: "Insufficient grid coverage for confident analysis".to_string(),
            confidence: 0.9,
            evidence: vec![format!(
                "only {} of {} cells covered ({:.0}%)",
                afr_error_surface.stats.covered_cells,
                afr_error_surface.stats.total_cells,
                coverage * 100.0
            )],
            recommended_checks: vec![
                "log steady-state sweeps across the uncovered RPM/MAP region".to_string(),
            ],
        });
    }

    // Fuel model: sustained AFR error beyond the tolerance band.
    if let Some(mean_err) = afr_error_surface.mean_value() {
        let max_err = afr_error_surface.max_abs_value().unwrap_or(0.0);
        if mean_err.abs() > AFR_ERROR_TOLERANCE || max_err > 2.0 * AFR_ERROR_TOLERANCE {
            let direction = if mean_err > 0.0 { "lean" } else { "rich" };
            hypotheses.push(Hypothesis {
                category: HypothesisCategory::FuelModel,
                title: format!("VE table error: engine runs {direction} of target"),
                confidence: (mean_err.abs() / 2.0).clamp(0.3, 0.95),
                evidence: vec![
                    format!("mean AFR error {mean_err:+.2} points across covered cells"),
                    format!("worst cell off by {max_err:.2} points"),
                ],
                recommended_checks: vec![
                    "confirm wideband calibration before trusting the error sign".to_string(),
                    "re-log with closed-loop trims disabled to unmask the VE error".to_string(),
                ],
            });
        }
    }

    // Knock limit: any knock activity in the logged region.
    if let Some(knock) = knock_surface {
        let knock_cells = knock
            .values
            .iter()
            .flatten()
            .filter(|c| c.map_or(false, |v| v > 0.0))
            .count();
        if knock_cells > 0 {
            hypotheses.push(Hypothesis {
                category: HypothesisCategory::KnockLimit,
                title: "Knock-limited operation in the logged region".to_string(),
                confidence: (0.4 + knock_cells as f64 * 0.05).min(0.9),
                evidence: vec![format!("knock activity in {knock_cells} grid cells")],
                recommended_checks: vec![
                    "verify fuel octane and IAT before touching timing".to_string(),
                    "log per-cylinder knock counts through the same sweep".to_string(),
                ],
            });
        }
    }

    // Transient fueling: enough tip-in/tip-out share to matter.
    if total_samples > 0 {
        let transient_samples = mode_summary.get("tip_in").copied().unwrap_or(0)
            + mode_summary.get("tip_out").copied().unwrap_or(0);
        let share = transient_samples as f64 / total_samples as f64;
        if share > TRANSIENT_SHARE {
            hypotheses.push(Hypothesis {
                category: HypothesisCategory::Transient,
                title: "Transient-heavy log: wall-wetting may skew steady cells".to_string(),
                confidence: (share * 2.0).clamp(0.3, 0.8),
                evidence: vec![format!(
                    "{transient_samples} of {total_samples} samples are tip-in/tip-out"
                )],
                recommended_checks: vec![
                    "capture dedicated steady-state cells for the fuel model".to_string(),
                    "review tip-in AFR excursions against the enrichment settings".to_string(),
                ],
            });
        }
    }

    // Temperature trims: heat-soak samples present.
    if mode_summary.get("heat_soak").copied().unwrap_or(0) > 0 {
        let n = mode_summary["heat_soak"];
        hypotheses.push(Hypothesis {
            category: HypothesisCategory::TempTrim,
            title: "Heat soak present: thermal compensation active".to_string(),
            confidence: 0.5,
            evidence: vec![format!("{n} heat-soak samples in the log")],
            recommended_checks: vec![
                "let IAT stabilize between pulls before comparing AFR cells".to_string(),
            ],
        });
    }

    hypotheses.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    CauseTreeResult { hypotheses }
}
