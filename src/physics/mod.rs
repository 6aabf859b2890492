// =============================================================================
// Physics engine & virtual ECU
// =============================================================================

pub mod engine;
pub mod environmental;
pub mod profile;
pub mod virtual_ecu;

/// Torque (lb·ft) and engine speed (RPM) to horsepower.
pub fn torque_to_hp(torque_lbft: f64, rpm: f64) -> f64 {
    torque_lbft * rpm / 5252.0
}

/// RPM → angular velocity (rad/s).
pub fn rpm_to_rad_s(rpm: f64) -> f64 {
    rpm * std::f64::consts::TAU / 60.0
}

/// Angular velocity (rad/s) → RPM.
pub fn rad_s_to_rpm(rad_s: f64) -> f64 {
    rad_s * 60.0 / std::f64::consts::TAU
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpm_rad_conversion_round_trips() {
        let rad = rpm_to_rad_s(1000.0);
        assert!((rad - 104.72).abs() < 0.1);
        assert!((rad_s_to_rpm(rad) - 1000.0).abs() < 0.1);
    }

    #[test]
    fn hp_at_crossover_rpm_equals_torque() {
        assert!((torque_to_hp(100.0, 5252.0) - 100.0).abs() < 1e-9);
    }
}
