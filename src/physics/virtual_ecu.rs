// =============================================================================
// Virtual ECU — VE-table-driven fueling model
// =============================================================================
//
// Simulates how an ECU calculates fuel delivery: look up VE from the table,
// compute air mass from MAP and displacement, fuel for the target AFR, scale
// by VE. When the ECU's VE table is wrong, the resulting AFR is wrong, and
// that error is exactly what the closed tuning loop corrects:
//
//   ECU VE < actual VE  →  lean (not enough fuel for the real airflow)
//   ECU VE > actual VE  →  rich
//
// Tables interpolate bilinearly and extrapolate linearly outside the bin
// ranges. VE is clamped to [0.3, 1.5] and reported AFR to [8.0, 20.0].
// =============================================================================

use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::errors::{EngineError, EngineResult};

/// Standard grid axes, matching the analysis grid.
pub const DEFAULT_RPM_BINS: [f64; 11] = [
    1500.0, 2000.0, 2500.0, 3000.0, 3500.0, 4000.0, 4500.0, 5000.0, 5500.0, 6000.0, 6500.0,
];
pub const DEFAULT_MAP_BINS: [f64; 9] = [20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0];

/// Specific gas constant for air, J/(kg·K).
const R_SPECIFIC_AIR: f64 = 287.05;
/// Cubic inches to cubic meters.
const CI_TO_M3: f64 = 1.638_71e-5;

/// VE sanity bounds.
pub const VE_MIN: f64 = 0.3;
pub const VE_MAX: f64 = 1.5;
/// Physical AFR bounds for a wideband sensor.
pub const AFR_REPORT_MIN: f64 = 8.0;
pub const AFR_REPORT_MAX: f64 = 20.0;
/// Commanded-AFR sanity bounds.
const AFR_TARGET_MIN: f64 = 10.0;
const AFR_TARGET_MAX: f64 = 18.0;

/// Which cylinder's table to read (V-twin front/rear).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cylinder {
    Front,
    Rear,
}

/// Bilinear interpolation over a (rows × cols) table with linear
/// extrapolation beyond the axis edges.
pub fn interp2(rows: &[f64], cols: &[f64], table: &[Vec<f64>], r: f64, c: f64) -> f64 {
    let (ri, rt) = segment(rows, r);
    let (ci, ct) = segment(cols, c);

    let v00 = table[ri][ci];
    let v01 = table[ri][ci + 1];
    let v10 = table[ri + 1][ci];
    let v11 = table[ri + 1][ci + 1];

    let top = v00 + (v01 - v00) * ct;
    let bottom = v10 + (v11 - v10) * ct;
    top + (bottom - top) * rt
}

/// Find the bracketing segment for `v` and its interpolation parameter.
/// Outside the axis the edge segment is used with t < 0 or t > 1, which
/// makes `interp2` extrapolate linearly.
fn segment(axis: &[f64], v: f64) -> (usize, f64) {
    let n = axis.len();
    debug_assert!(n >= 2);
    let mut i = match axis.partition_point(|b| *b <= v) {
        0 => 0,
        p => p - 1,
    };
    i = i.min(n - 2);
    let t = (v - axis[i]) / (axis[i + 1] - axis[i]);
    (i, t)
}

/// A K×L table with its axes; the ECU holds three of these.
#[derive(Debug, Clone)]
pub struct VirtualEcu {
    pub ve_front: Vec<Vec<f64>>,
    pub ve_rear: Vec<Vec<f64>>,
    pub afr_target: Vec<Vec<f64>>,
    pub rpm_bins: Vec<f64>,
    pub map_bins: Vec<f64>,
    /// Total displacement, cubic inches.
    pub displacement_ci: f64,
    pub num_cylinders: u32,
    pub ambient_temp_f: f64,
    pub barometric_pressure_inhg: f64,
}

impl VirtualEcu {
    /// Build an ECU, validating that every table matches the grid shape.
    pub fn new(
        ve_front: Vec<Vec<f64>>,
        ve_rear: Vec<Vec<f64>>,
        afr_target: Vec<Vec<f64>>,
        rpm_bins: Vec<f64>,
        map_bins: Vec<f64>,
    ) -> EngineResult<Self> {
        for (name, table) in [
            ("ve_front", &ve_front),
            ("ve_rear", &ve_rear),
            ("afr_target", &afr_target),
        ] {
            if table.len() != rpm_bins.len()
                || table.iter().any(|row| row.len() != map_bins.len())
            {
                return Err(EngineError::Validation(format!(
                    "{name} table shape does not match {}x{} grid",
                    rpm_bins.len(),
                    map_bins.len()
                )));
            }
        }
        Ok(Self {
            ve_front,
            ve_rear,
            afr_target,
            rpm_bins,
            map_bins,
            displacement_ci: 114.0,
            num_cylinders: 2,
            ambient_temp_f: 75.0,
            barometric_pressure_inhg: 29.92,
        })
    }

    /// ECU VE at an operating point, clamped to the sane range.
    pub fn lookup_ve(&self, rpm: f64, map_kpa: f64, cylinder: Cylinder) -> f64 {
        let table = match cylinder {
            Cylinder::Front => &self.ve_front,
            Cylinder::Rear => &self.ve_rear,
        };
        interp2(&self.rpm_bins, &self.map_bins, table, rpm, map_kpa).clamp(VE_MIN, VE_MAX)
    }

    /// Commanded AFR at an operating point.
    pub fn lookup_target_afr(&self, rpm: f64, map_kpa: f64) -> f64 {
        interp2(&self.rpm_bins, &self.map_bins, &self.afr_target, rpm, map_kpa)
            .clamp(AFR_TARGET_MIN, AFR_TARGET_MAX)
    }

    /// Theoretical air mass per combustion event (ideal gas law), mg.
    pub fn air_mass_mg(&self, _rpm: f64, map_kpa: f64) -> f64 {
        let displacement_m3 = self.displacement_ci / self.num_cylinders as f64 * CI_TO_M3;
        let pressure_pa = map_kpa * 1000.0;
        let temp_k = (self.ambient_temp_f - 32.0) * 5.0 / 9.0 + 273.15;
        let mass_kg = pressure_pa * displacement_m3 / (R_SPECIFIC_AIR * temp_k);
        mass_kg * 1.0e6
    }

    /// Fuel mass required to hit the commanded AFR at VE = 1.0, mg.
    pub fn required_fuel_mg(&self, rpm: f64, map_kpa: f64) -> f64 {
        self.air_mass_mg(rpm, map_kpa) / self.lookup_target_afr(rpm, map_kpa)
    }

    /// Fuel the ECU actually injects: base requirement scaled by its VE
    /// table. Wrong table, wrong fuel.
    pub fn delivered_fuel_mg(&self, rpm: f64, map_kpa: f64, cylinder: Cylinder) -> f64 {
        self.required_fuel_mg(rpm, map_kpa) * self.lookup_ve(rpm, map_kpa, cylinder)
    }

    /// AFR a wideband would read when the engine's true VE is `actual_ve`.
    pub fn resulting_afr(&self, rpm: f64, map_kpa: f64, actual_ve: f64, cylinder: Cylinder) -> f64 {
        let ecu_ve = self.lookup_ve(rpm, map_kpa, cylinder);
        let target = self.lookup_target_afr(rpm, map_kpa);
        (target * (actual_ve / ecu_ve)).clamp(AFR_REPORT_MIN, AFR_REPORT_MAX)
    }

    /// VE table error in percent; positive means the ECU underestimates.
    pub fn ve_error_pct(&self, rpm: f64, map_kpa: f64, actual_ve: f64, cylinder: Cylinder) -> f64 {
        let ecu_ve = self.lookup_ve(rpm, map_kpa, cylinder);
        (actual_ve - ecu_ve) / ecu_ve * 100.0
    }

    /// Multiply both VE tables by a correction matrix, clamping to the sane
    /// range. The matrix shape must match the grid.
    pub fn apply_ve_correction(&mut self, correction: &[Vec<f64>]) -> EngineResult<()> {
        if correction.len() != self.rpm_bins.len()
            || correction.iter().any(|r| r.len() != self.map_bins.len())
        {
            return Err(EngineError::Validation(
                "correction matrix shape does not match the VE grid".into(),
            ));
        }
        for table in [&mut self.ve_front, &mut self.ve_rear] {
            for (row, corr_row) in table.iter_mut().zip(correction) {
                for (cell, corr) in row.iter_mut().zip(corr_row) {
                    *cell = (*cell * corr).clamp(VE_MIN, VE_MAX);
                }
            }
        }
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Table builders
// -----------------------------------------------------------------------------

/// Baseline VE table with a realistic shape: Gaussian over RPM peaking at
/// the torque peak, rising with MAP.
pub fn create_baseline_ve_table(
    rpm_bins: &[f64],
    map_bins: &[f64],
    peak_ve: f64,
    peak_rpm: f64,
) -> Vec<Vec<f64>> {
    rpm_bins
        .iter()
        .map(|rpm| {
            let rpm_factor = (-0.5 * ((rpm / peak_rpm - 1.0) / 0.4).powi(2)).exp();
            map_bins
                .iter()
                .map(|map_kpa| {
                    let map_factor = 0.7 + 0.3 * (map_kpa / 100.0);
                    (peak_ve * rpm_factor * map_factor).clamp(0.4, 1.2)
                })
                .collect()
        })
        .collect()
}

/// AFR target table from a MAP-keyed target map, constant across RPM. Using
/// the same targets as the analysis grid keeps the closed loop's fixed point
/// exactly on target.
pub fn create_afr_target_table(
    rpm_bins: &[f64],
    map_bins: &[f64],
    map_targets: &[(f64, f64)],
) -> Vec<Vec<f64>> {
    let target_for = |map_kpa: f64| -> f64 {
        map_targets
            .iter()
            .min_by(|a, b| {
                (a.0 - map_kpa)
                    .abs()
                    .partial_cmp(&(b.0 - map_kpa).abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(_, afr)| *afr)
            .unwrap_or(14.0)
    };
    rpm_bins
        .iter()
        .map(|_| map_bins.iter().map(|m| target_for(*m)).collect())
        .collect()
}

/// Corrupt a baseline table with seeded Gaussian errors to simulate a badly
/// tuned ECU. Negative mean reads lean (table under-estimates VE).
pub fn create_wrong_ve_table(
    baseline: &[Vec<f64>],
    error_pct_mean: f64,
    error_pct_std: f64,
    seed: u64,
) -> Vec<Vec<f64>> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let normal = Normal::new(error_pct_mean, error_pct_std.max(f64::MIN_POSITIVE))
        .expect("finite normal parameters");

    baseline
        .iter()
        .map(|row| {
            row.iter()
                .map(|ve| {
                    let err = normal.sample(&mut rng);
                    (ve * (1.0 + err / 100.0)).clamp(VE_MIN, VE_MAX)
                })
                .collect()
        })
        .collect()
}
