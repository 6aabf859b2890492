// =============================================================================
// VE correction math — versioned, deterministic
// =============================================================================
//
// Two math versions:
//   v1 (legacy linear):  correction = 1 + (AFR_meas - AFR_target) / AFR_target * K
//   v2 (ratio, default): correction = AFR_meas / AFR_target
//
// The ratio model directly represents the fuel delivery error: a lean
// measurement (measured > target) yields correction > 1, i.e. increase VE.
// v1 survives only for replaying legacy artifacts; its first-order gain
// drifts from v2 at large deviations.
//
// Given identical inputs and version, output is bit-identical across
// IEEE-754 round-to-nearest platforms: nothing here but divides and one
// multiply-add.
// =============================================================================

use crate::errors::{EngineError, EngineResult};

/// Physical AFR bounds; measurements outside are sensor garbage.
pub const AFR_MIN: f64 = 8.0;
pub const AFR_MAX: f64 = 20.0;

/// v1 gain K. The per-point slope is K / AFR_target, so one AFR point of
/// error maps to roughly 7 % VE change at typical targets (0.91 / 13 = 7 %).
pub const V1_GAIN: f64 = 0.91;

/// Tolerance below which a clamp is not counted as a clip.
const CLIP_EPSILON: f64 = 1e-4;

/// Which correction formula to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum MathVersion {
    /// Legacy linear model, kept for replay of old artifacts.
    V1Linear,
    /// Ratio model, physically exact.
    #[default]
    V2Ratio,
}

impl std::fmt::Display for MathVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V1Linear => write!(f, "v1.0.0"),
            Self::V2Ratio => write!(f, "v2.0.0"),
        }
    }
}

/// Validate an AFR value against the physical range.
fn validate_afr(afr: f64, label: &str) -> EngineResult<()> {
    if !afr.is_finite() || !(AFR_MIN..=AFR_MAX).contains(&afr) {
        return Err(EngineError::Validation(format!(
            "{label} AFR {afr} outside physical range [{AFR_MIN}, {AFR_MAX}]"
        )));
    }
    Ok(())
}

/// Unclamped VE correction multiplier for a measured vs target AFR.
pub fn calculate_ve_correction(
    measured: f64,
    target: f64,
    version: MathVersion,
) -> EngineResult<f64> {
    validate_afr(measured, "measured")?;
    validate_afr(target, "target")?;

    Ok(match version {
        MathVersion::V1Linear => 1.0 + (measured - target) / target * V1_GAIN,
        MathVersion::V2Ratio => measured / target,
    })
}

/// Clamp a correction to `[1 - max_correction, 1 + max_correction]`.
/// Returns the clamped value and whether a clip actually happened.
pub fn clamp_correction(correction: f64, max_correction: f64) -> (f64, bool) {
    let lo = 1.0 - max_correction;
    let hi = 1.0 + max_correction;
    let clamped = correction.clamp(lo, hi);
    (clamped, (correction - clamped).abs() > CLIP_EPSILON)
}

/// Multiplier → signed percentage, exact composition with the correction.
pub fn correction_to_percentage(correction: f64) -> f64 {
    (correction - 1.0) * 100.0
}

/// Signed percentage → multiplier.
pub fn percentage_to_correction(pct: f64) -> f64 {
    1.0 + pct / 100.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_is_exactly_the_ratio() {
        let c = calculate_ve_correction(14.0, 13.0, MathVersion::V2Ratio).unwrap();
        assert_eq!(c, 14.0 / 13.0);
        assert!((c - 1.0769).abs() < 1e-4);
        // Percentage composition is exact.
        assert_eq!(correction_to_percentage(c), (c - 1.0) * 100.0);
    }

    #[test]
    fn v2_direction_matches_mixture() {
        // Lean (measured > target) means increase VE.
        let lean = calculate_ve_correction(14.5, 13.0, MathVersion::V2Ratio).unwrap();
        assert!(lean > 1.0);
        // Rich means decrease VE.
        let rich = calculate_ve_correction(12.0, 13.0, MathVersion::V2Ratio).unwrap();
        assert!(rich < 1.0);
        // On target means no change.
        let on = calculate_ve_correction(13.0, 13.0, MathVersion::V2Ratio).unwrap();
        assert_eq!(on, 1.0);
    }

    #[test]
    fn v1_is_the_relative_error_times_the_gain() {
        // correction = 1 + (measured - target)/target * K, exactly.
        let c = calculate_ve_correction(14.0, 13.0, MathVersion::V1Linear).unwrap();
        assert_eq!(c, 1.0 + (14.0 - 13.0) / 13.0 * V1_GAIN);
        let c2 = calculate_ve_correction(11.0, 13.0, MathVersion::V1Linear).unwrap();
        assert_eq!(c2, 1.0 + (11.0 - 13.0) / 13.0 * V1_GAIN);
    }

    #[test]
    fn v1_per_point_slope_is_seven_percent_near_typical_targets() {
        // At target 13 the slope K/target lands on 7 % per AFR point.
        let c = calculate_ve_correction(14.0, 13.0, MathVersion::V1Linear).unwrap();
        assert!((c - 1.07).abs() < 1e-9);
        let c2 = calculate_ve_correction(11.0, 13.0, MathVersion::V1Linear).unwrap();
        assert!((c2 - 0.86).abs() < 1e-9);
    }

    #[test]
    fn v1_slope_varies_with_the_target() {
        // One point of error buys more correction at a rich target than at
        // a lean one: K/9 vs K/18.
        let rich_target = calculate_ve_correction(10.0, 9.0, MathVersion::V1Linear).unwrap();
        let lean_target = calculate_ve_correction(19.0, 18.0, MathVersion::V1Linear).unwrap();
        assert!((rich_target - (1.0 + V1_GAIN / 9.0)).abs() < 1e-12);
        assert!((lean_target - (1.0 + V1_GAIN / 18.0)).abs() < 1e-12);
        assert!(rich_target > lean_target);
    }

    #[test]
    fn versions_diverge_at_large_deviations() {
        let v1 = calculate_ve_correction(18.0, 10.0, MathVersion::V1Linear).unwrap();
        let v2 = calculate_ve_correction(18.0, 10.0, MathVersion::V2Ratio).unwrap();
        assert!((v1 - v2).abs() > 0.05);
    }

    #[test]
    fn default_version_is_v2() {
        assert_eq!(MathVersion::default(), MathVersion::V2Ratio);
    }

    #[test]
    fn within_bounds_correction_is_not_clipped() {
        let c = calculate_ve_correction(14.0, 13.0, MathVersion::V2Ratio).unwrap();
        let (clamped, clipped) = clamp_correction(c, 0.10);
        assert_eq!(clamped, c);
        assert!(!clipped);
    }

    #[test]
    fn excessive_correction_clips_to_the_bound() {
        let c = calculate_ve_correction(15.0, 13.0, MathVersion::V2Ratio).unwrap();
        let (clamped, clipped) = clamp_correction(c, 0.10);
        assert!((clamped - 1.10).abs() < 1e-12);
        assert!(clipped);
        assert!((correction_to_percentage(clamped) - 10.0).abs() < 1e-9);

        let (lo, clipped_lo) = clamp_correction(0.80, 0.10);
        assert!((lo - 0.90).abs() < 1e-12);
        assert!(clipped_lo);
    }

    #[test]
    fn out_of_range_afr_is_a_validation_error() {
        for (m, t) in [(7.9, 13.0), (20.1, 13.0), (13.0, 7.0), (f64::NAN, 13.0)] {
            let err = calculate_ve_correction(m, t, MathVersion::V2Ratio).unwrap_err();
            assert_eq!(err.kind(), "validation");
        }
    }

    #[test]
    fn percentage_round_trip_is_exact_at_representable_points() {
        for pct in [-10.0, -2.5, 0.0, 5.0, 7.5] {
            let c = percentage_to_correction(pct);
            assert!((correction_to_percentage(c) - pct).abs() < 1e-12);
        }
    }

    #[test]
    fn determinism_same_inputs_same_bits() {
        let a = calculate_ve_correction(13.37, 12.8, MathVersion::V2Ratio).unwrap();
        let b = calculate_ve_correction(13.37, 12.8, MathVersion::V2Ratio).unwrap();
        assert_eq!(a.to_bits(), b.to_bits());
    }
}
