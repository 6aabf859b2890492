// =============================================================================
// Environmental corrections — air density and thermal factors
// =============================================================================
//
// Air density is computed against the SAE standard day (29.92 inHg, 59 °F,
// dry air). Humidity displaces oxygen: water vapor partial pressure comes
// from the Magnus saturation formula scaled by relative humidity.
// =============================================================================

/// Specific gas constant for dry air, J/(kg·K).
const R_DRY_AIR: f64 = 287.05;
/// Specific gas constant for water vapor, J/(kg·K).
const R_WATER_VAPOR: f64 = 461.495;
/// Pascals per inch of mercury.
const PA_PER_INHG: f64 = 3386.39;
/// Standard-day barometric pressure.
const STD_PRESSURE_INHG: f64 = 29.92;
/// Standard-day temperature, °F.
const STD_TEMP_F: f64 = 59.0;

/// Thermal correction floor; a Gaussian rides on top of it.
const THERMAL_FLOOR: f64 = 0.85;
/// Cold-side spread of the thermal Gaussian, °F.
const THERMAL_SIGMA_COLD_F: f64 = 150.0;
/// Hot-side spread; heat hurts more than cold.
const THERMAL_SIGMA_HOT_F: f64 = 110.0;

pub fn fahrenheit_to_kelvin(temp_f: f64) -> f64 {
    (temp_f - 32.0) * 5.0 / 9.0 + 273.15
}

/// Moist-air density in kg/m³ for a pressure, temperature and relative
/// humidity.
pub fn air_density_kg_m3(pressure_inhg: f64, temp_f: f64, humidity_pct: f64) -> f64 {
    let pressure_pa = pressure_inhg * PA_PER_INHG;
    let temp_k = fahrenheit_to_kelvin(temp_f);
    let temp_c = temp_k - 273.15;

    // Magnus saturation vapor pressure, Pa.
    let p_sat = 610.78 * (17.27 * temp_c / (temp_c + 237.3)).exp();
    let p_vapor = (humidity_pct / 100.0).clamp(0.0, 1.0) * p_sat;
    let p_dry = (pressure_pa - p_vapor).max(0.0);

    p_dry / (R_DRY_AIR * temp_k) + p_vapor / (R_WATER_VAPOR * temp_k)
}

/// Power correction relative to a standard dry day: the ratio of actual
/// charge density to standard density.
pub fn air_density_correction(pressure_inhg: f64, iat_f: f64, humidity_pct: f64) -> f64 {
    let actual = air_density_kg_m3(pressure_inhg, iat_f, humidity_pct);
    let standard = air_density_kg_m3(STD_PRESSURE_INHG, STD_TEMP_F, 0.0);
    actual / standard
}

/// Gaussian thermal correction around the optimal coolant temperature.
/// Exactly 1.0 at optimum; asymmetric spread because a hot engine loses
/// power faster than a cold one.
pub fn thermal_correction(engine_temp_f: f64, optimal_temp_f: f64) -> f64 {
    let delta = engine_temp_f - optimal_temp_f;
    let sigma = if delta >= 0.0 {
        THERMAL_SIGMA_HOT_F
    } else {
        THERMAL_SIGMA_COLD_F
    };
    let gauss = (-0.5 * (delta / sigma).powi(2)).exp();
    THERMAL_FLOOR + (1.0 - THERMAL_FLOOR) * gauss
}
