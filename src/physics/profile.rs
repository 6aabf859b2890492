// =============================================================================
// Engine profiles & simulator configuration
// =============================================================================

use serde::{Deserialize, Serialize};

/// Static parameters describing a simulated engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineProfile {
    pub name: String,
    /// Total displacement, cubic inches.
    pub displacement_ci: f64,
    pub num_cylinders: u32,
    /// Peak crank torque, lb·ft.
    pub max_tq: f64,
    /// Peak horsepower.
    pub max_hp: f64,
    pub tq_peak_rpm: f64,
    pub idle_rpm: f64,
    pub redline_rpm: f64,
    /// Rotating-assembly inertia, kg·m² (engine + primary drive).
    pub engine_inertia: f64,
    /// Coolant temperature at which the engine makes best power, °F.
    pub optimal_temp_f: f64,
}

impl Default for EngineProfile {
    fn default() -> Self {
        Self::m8_114()
    }
}

impl EngineProfile {
    /// Milwaukee-Eight 114 with stage-2 bolt-ons. The default test mule.
    pub fn m8_114() -> Self {
        Self {
            name: "M8-114 Stage 2".to_string(),
            displacement_ci: 114.0,
            num_cylinders: 2,
            max_tq: 122.0,
            max_hp: 110.0,
            tq_peak_rpm: 3500.0,
            idle_rpm: 1000.0,
            redline_rpm: 6500.0,
            engine_inertia: 1.8,
            optimal_temp_f: 210.0,
        }
    }

    /// Milwaukee-Eight 131 crate engine; heavier rotating assembly.
    pub fn m8_131() -> Self {
        Self {
            name: "M8-131 Crate".to_string(),
            displacement_ci: 131.0,
            num_cylinders: 2,
            max_tq: 131.0,
            max_hp: 121.0,
            tq_peak_rpm: 3600.0,
            idle_rpm: 1000.0,
            redline_rpm: 6400.0,
            engine_inertia: 2.1,
            optimal_temp_f: 210.0,
        }
    }

    /// Inline-four supersport; light crank, screaming redline.
    pub fn sportbike_600() -> Self {
        Self {
            name: "CBR600RR".to_string(),
            displacement_ci: 36.6,
            num_cylinders: 4,
            max_tq: 48.0,
            max_hp: 113.0,
            tq_peak_rpm: 11_000.0,
            idle_rpm: 1400.0,
            redline_rpm: 15_000.0,
            engine_inertia: 0.12,
            optimal_temp_f: 195.0,
        }
    }
}

/// Simulator toggles and environmental conditions. Every torque factor can
/// be switched off independently to isolate behavior under test.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub profile: EngineProfile,
    /// Physics tick rate.
    pub update_rate_hz: f64,
    /// Throttle slew rate, percent per second.
    pub throttle_response_rate: f64,
    /// Pull rows are recorded from this engine speed up, matching the
    /// analysis grid's lowest bin.
    pub pull_record_min_rpm: f64,

    pub enable_ve: bool,
    pub enable_pumping_losses: bool,
    pub enable_thermal_effects: bool,
    pub enable_air_density_correction: bool,
    pub enable_mechanical_efficiency: bool,
    pub enable_knock_detection: bool,

    pub ambient_temp_f: f64,
    pub barometric_pressure_inhg: f64,
    pub humidity_pct: f64,

    /// Start a pull automatically once idle stabilizes.
    pub auto_pull: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            profile: EngineProfile::m8_114(),
            update_rate_hz: 50.0,
            throttle_response_rate: 150.0,
            pull_record_min_rpm: 1500.0,
            enable_ve: true,
            enable_pumping_losses: true,
            enable_thermal_effects: true,
            enable_air_density_correction: true,
            enable_mechanical_efficiency: true,
            enable_knock_detection: true,
            ambient_temp_f: 75.0,
            barometric_pressure_inhg: 29.92,
            humidity_pct: 30.0,
            auto_pull: false,
        }
    }
}
