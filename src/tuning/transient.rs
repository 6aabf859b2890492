// =============================================================================
// Transient fuel — wall-wetting tau/x estimation from tip-in events
// =============================================================================
//
// On a throttle tip-in, part of the injected fuel condenses on the port
// walls (the X fraction) and evaporates back with a time constant tau.
// Under-modeled wall wetting shows up as a lean dip right after the tip-in.
// This module estimates tau and X from logged tip-in events and derives the
// enrichment multiplier that would cover the dip.
//
// Individual factors keep wide clips so a noisy log cannot produce absurd
// parameters, and the final enrichment is clamped to the 25 % cap as the
// last step, no matter how the intermediate factors compound.
// =============================================================================

use serde::Serialize;
use tracing::debug;

use crate::errors::{EngineError, EngineResult};
use crate::nextgen::modes::compute_derivative;
use crate::tuning::workflow::{TuneLog, COL_RPM};

/// Hard ceiling on the final enrichment multiplier (+25 %).
pub const ENRICHMENT_CAP: f64 = 1.25;

/// Estimation bounds; deliberately wide, the cap does the real guarding.
const TAU_MIN_S: f64 = 0.05;
const TAU_MAX_S: f64 = 2.0;
const X_MIN: f64 = 0.05;
const X_MAX: f64 = 0.90;
/// Cold-engine factor ceiling before the final cap.
const COLD_FACTOR_MAX: f64 = 1.5;
/// Reference spread for the cold factor, °F below optimal per +100 %.
const COLD_FACTOR_SPAN_F: f64 = 200.0;

/// TPS rate that marks a tip-in, percent per second.
const TIP_IN_DTPS_MIN: f64 = 80.0;
/// Samples inspected after a tip-in for the lean dip and recovery.
const DIP_WINDOW: usize = 25;

/// One detected tip-in with its AFR excursion.
#[derive(Debug, Clone, Serialize)]
pub struct TipInEvent {
    pub index: usize,
    pub rpm: f64,
    /// Peak lean excursion after the tip-in, AFR points.
    pub lean_dip: f64,
    /// Samples until AFR recovered to within 10 % of the dip.
    pub recovery_samples: usize,
}

/// Estimated wall-wetting parameters.
#[derive(Debug, Clone, Serialize)]
pub struct WallWettingEstimate {
    /// Film evaporation time constant, seconds.
    pub tau_s: f64,
    /// Fraction of injected fuel hitting the walls.
    pub x_fraction: f64,
    pub events_used: usize,
    /// 0..1, grows with event count.
    pub confidence: f64,
}

/// Detect tip-in events and their lean dips. Requires RPM, TPS and an AFR
/// error column (measured minus target).
pub fn detect_tip_in_events(log: &TuneLog) -> EngineResult<Vec<TipInEvent>> {
    let rpm = log
        .column(COL_RPM)
        .ok_or_else(|| EngineError::Analysis("tip-in detection requires RPM".into()))?;
    let tps = log
        .column("TPS")
        .ok_or_else(|| EngineError::Analysis("tip-in detection requires TPS".into()))?;
    let afr_error = log
        .column("AFR Error")
        .ok_or_else(|| EngineError::Analysis("tip-in detection requires AFR Error".into()))?;

    let dtps = compute_derivative(tps, log.column("timestamp_ms"));

    let mut events = Vec::new();
    let mut i = 1;
    while i < log.rows() {
        if dtps[i] < TIP_IN_DTPS_MIN {
            i += 1;
            continue;
        }

        let window_end = (i + DIP_WINDOW).min(log.rows());
        let mut lean_dip: f64 = 0.0;
        let mut dip_at = i;
        for j in i..window_end {
            if afr_error[j] > lean_dip {
                lean_dip = afr_error[j];
                dip_at = j;
            }
        }

        // Recovery: first sample after the dip back inside 10 % of it.
        let mut recovery_samples = window_end - dip_at;
        for (offset, j) in (dip_at..window_end).enumerate() {
            if afr_error[j] <= lean_dip * 0.1 {
                recovery_samples = offset;
                break;
            }
        }

        if lean_dip > 0.0 {
            events.push(TipInEvent {
                index: i,
                rpm: rpm[i],
                lean_dip,
                recovery_samples,
            });
        }
        // Skip past the inspected window so one throttle stab is one event.
        i = window_end;
    }

    debug!(events = events.len(), "tip-in detection complete");
    Ok(events)
}

/// Fold the detected events into a tau/x estimate. Fails when the log holds
/// no usable events.
pub fn estimate_wall_wetting(
    events: &[TipInEvent],
    sample_spacing_s: f64,
) -> EngineResult<WallWettingEstimate> {
    if events.is_empty() {
        return Err(EngineError::Analysis(
            "no tip-in events with a lean dip in the log".into(),
        ));
    }

    // Tau from the mean recovery time, X from the mean dip magnitude: a one
    // AFR-point dip at stoich is roughly 7 % missing fuel.
    let mean_recovery: f64 = events
        .iter()
        .map(|e| e.recovery_samples as f64 * sample_spacing_s)
        .sum::<f64>()
        / events.len() as f64;
    let mean_dip: f64 =
        events.iter().map(|e| e.lean_dip).sum::<f64>() / events.len() as f64;

    let tau_s = mean_recovery.clamp(TAU_MIN_S, TAU_MAX_S);
    let x_fraction = (mean_dip * 0.07).clamp(X_MIN, X_MAX);

    Ok(WallWettingEstimate {
        tau_s,
        x_fraction,
        events_used: events.len(),
        confidence: (events.len() as f64 / 10.0).min(1.0),
    })
}

/// Enrichment multiplier covering the estimated film loss, scaled up on a
/// cold engine. Intermediate factors may compound past any physical sense;
/// the final value is clamped to [`ENRICHMENT_CAP`] unconditionally.
pub fn enrichment_multiplier(
    estimate: &WallWettingEstimate,
    engine_temp_f: f64,
    optimal_temp_f: f64,
) -> f64 {
    // Steady-state compensation for the film fraction.
    let base = 1.0 / (1.0 - estimate.x_fraction);

    // Cold walls hold more fuel.
    let cold_delta = (optimal_temp_f - engine_temp_f).max(0.0);
    let cold_factor = (1.0 + cold_delta / COLD_FACTOR_SPAN_F).min(COLD_FACTOR_MAX);

    (base * cold_factor).min(ENRICHMENT_CAP)
}
