// =============================================================================
// Dyno simulator — rotational-inertia engine model
// =============================================================================
//
// A single rotational degree of freedom: I·dω/dt = τ_net(ω, TPS, VE, ...).
// Effective torque is the base curve scaled by multiplicative factors, in
// this order, each independently toggleable:
//
//   volumetric efficiency → pumping losses → thermal → air density
//   → mechanical efficiency → knock penalty
//
// During DECEL the reported horsepower is the positive magnitude of the
// inertial loss power, never an instant zero at the pull boundary.
//
// The simulator steps deterministically: `run_pull_fast` fast-forwards a
// full pull without sleeping (the orchestrator path), while `run_live`
// paces steps at the configured tick rate and hands samples to a callback
// (the telemetry-publishing path).
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::errors::{EngineError, EngineResult};
use crate::physics::environmental::{air_density_correction, thermal_correction};
use crate::physics::profile::SimulatorConfig;
use crate::physics::virtual_ecu::{Cylinder, VirtualEcu};
use crate::physics::{rad_s_to_rpm, rpm_to_rad_s, torque_to_hp};
use crate::transport::wire::{ChannelInfo, ChannelUnit, Sample};
use crate::tuning::workflow::{TuneLog, DEFAULT_AFR_TARGETS};

// -----------------------------------------------------------------------------
// Physics constants
// -----------------------------------------------------------------------------

/// Net crank torque (lb·ft) through unit conversion and the drum gearing
/// into angular acceleration; calibrated against recorded RT-150 pulls.
pub const TORQUE_TO_ANGULAR_ACCEL_SCALE: f64 = 80.0;
/// Aerodynamic/bearing drag torque per rad/s of drum speed, lb·ft.
pub const DRAG_COEFFICIENT: f64 = 0.02;
/// Closed-throttle engine braking torque per rad/s, lb·ft.
pub const ENGINE_BRAKE_COEFFICIENT: f64 = 0.15;
/// AFR points leaner than target at high load before knock fires.
pub const KNOCK_AFR_LEAN_THRESHOLD: f64 = 2.5;
/// Intake air temperature above which knock fires at high load, °F.
pub const KNOCK_IAT_THRESHOLD_F: f64 = 140.0;
/// Timing retard applied when knock is active, degrees.
pub const KNOCK_TIMING_RETARD_DEG: f64 = 4.0;
/// Torque fraction lost per degree of retard.
const KNOCK_TORQUE_LOSS_PER_DEG: f64 = 0.01;
/// Fixed drivetrain efficiency.
const MECHANICAL_EFFICIENCY: f64 = 0.88;
/// TPS above which the engine counts as heavily loaded.
const HIGH_LOAD_TPS: f64 = 80.0;
/// A pull is a wide-open-throttle sweep; rows are recorded only once the
/// throttle is fully open so the ramp-in never lands in the grid.
const WOT_RECORD_TPS: f64 = 100.0;
/// Bound on retained physics snapshots.
const SNAPSHOT_CAP: usize = 4096;
/// Peak VE of the physical engine model.
const PHYSICS_PEAK_VE: f64 = 0.95;

// -----------------------------------------------------------------------------
// State types
// -----------------------------------------------------------------------------

/// Simulator lifecycle / pull state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SimState {
    Stopped,
    Idle,
    Pull,
    Decel,
    Cooldown,
}

impl std::fmt::Display for SimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Idle => "idle",
            Self::Pull => "pull",
            Self::Decel => "decel",
            Self::Cooldown => "cooldown",
        };
        write!(f, "{s}")
    }
}

/// Mutable physics state, written only by the simulator loop.
#[derive(Debug, Clone, Serialize)]
pub struct PhysicsState {
    pub rpm: f64,
    pub angular_velocity: f64,
    pub tps_target: f64,
    pub tps_actual: f64,
    pub engine_temp_f: f64,
    pub iat_f: f64,
    pub knock_count: u32,
    pub knock_risk: f64,
    pub total_inertia: f64,
}

/// Live output channels, refreshed every tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LiveChannels {
    pub rpm: f64,
    pub torque: f64,
    pub horsepower: f64,
    pub afr_front: f64,
    pub afr_rear: f64,
    pub afr_target: f64,
    pub map_kpa: f64,
    pub tps: f64,
    pub knock: bool,
}

/// Multiplicative factors applied to the base torque, for diagnostics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TorqueFactors {
    pub volumetric_efficiency: f64,
    pub pumping: f64,
    pub thermal: f64,
    pub air_density: f64,
    pub mechanical: f64,
    pub knock: f64,
}

/// One physics tick captured for offline inspection (opt-in).
#[derive(Debug, Clone, Serialize)]
pub struct PhysicsSnapshot {
    pub rpm: f64,
    pub tps: f64,
    pub torque_base: f64,
    pub torque_effective: f64,
    pub volumetric_efficiency: f64,
    pub knock_detected: bool,
    pub knock_risk_score: f64,
}

/// One recorded row of a pull.
#[derive(Debug, Clone, Serialize)]
pub struct PullSample {
    pub rpm: f64,
    pub torque: f64,
    pub horsepower: f64,
    pub afr_front: f64,
    pub afr_rear: f64,
    pub afr_target: f64,
    pub map_kpa: f64,
    pub tps: f64,
    pub knock: bool,
}

// -----------------------------------------------------------------------------
// Simulator
// -----------------------------------------------------------------------------

pub struct DynoSimulator {
    pub config: SimulatorConfig,
    pub physics: PhysicsState,
    pub channels: LiveChannels,
    state: SimState,
    virtual_ecu: Option<VirtualEcu>,
    pull_data: Vec<PullSample>,
    snapshots: VecDeque<PhysicsSnapshot>,
    snapshots_enabled: bool,
    cooldown_remaining_s: f64,
    sim_time_ms: f64,
}

impl DynoSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let idle = config.profile.idle_rpm;
        let physics = PhysicsState {
            rpm: idle,
            angular_velocity: rpm_to_rad_s(idle),
            tps_target: 0.0,
            tps_actual: 0.0,
            // Warmed up on the dyno; IAT starts at ambient.
            engine_temp_f: config.profile.optimal_temp_f,
            iat_f: config.ambient_temp_f,
            knock_count: 0,
            knock_risk: 0.0,
            total_inertia: config.profile.engine_inertia,
        };
        Self {
            config,
            physics,
            channels: LiveChannels::default(),
            state: SimState::Stopped,
            virtual_ecu: None,
            pull_data: Vec::new(),
            snapshots: VecDeque::new(),
            snapshots_enabled: false,
            cooldown_remaining_s: 0.0,
            sim_time_ms: 0.0,
        }
    }

    /// Attach a virtual ECU; its VE/AFR tables then drive the reported AFR.
    pub fn with_virtual_ecu(mut self, ecu: VirtualEcu) -> Self {
        self.virtual_ecu = Some(ecu);
        self
    }

    pub fn state(&self) -> SimState {
        self.state
    }

    pub fn start(&mut self) {
        if self.state == SimState::Stopped {
            self.physics.rpm = self.config.profile.idle_rpm;
            self.physics.angular_velocity = rpm_to_rad_s(self.physics.rpm);
            self.state = SimState::Idle;
            info!(profile = %self.config.profile.name, "simulator started");
        }
    }

    pub fn stop(&mut self) {
        self.state = SimState::Stopped;
    }

    /// Begin a wide-open-throttle pull. Only valid from idle.
    pub fn trigger_pull(&mut self) -> bool {
        if self.state != SimState::Idle {
            return false;
        }
        self.pull_data.clear();
        self.physics.tps_target = 100.0;
        self.state = SimState::Pull;
        info!(rpm = self.physics.rpm, "pull started");
        true
    }

    pub fn get_pull_data(&self) -> &[PullSample] {
        &self.pull_data
    }

    pub fn enable_snapshot_collection(&mut self, enabled: bool) {
        self.snapshots_enabled = enabled;
    }

    pub fn get_physics_snapshots(&self) -> Vec<PhysicsSnapshot> {
        self.snapshots.iter().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Torque model
    // -------------------------------------------------------------------------

    /// Base crank torque at wide-open throttle, before loss factors.
    pub fn base_torque_at(&self, rpm: f64) -> f64 {
        let p = &self.config.profile;
        let shape = if rpm <= p.tq_peak_rpm {
            let x = (rpm / p.tq_peak_rpm).clamp(0.0, 1.0);
            0.55 + 0.45 * (x * std::f64::consts::FRAC_PI_2).sin()
        } else {
            let y = ((rpm - p.tq_peak_rpm) / (p.redline_rpm - p.tq_peak_rpm)).clamp(0.0, 1.2);
            1.0 - 0.35 * y * y
        };
        p.max_tq * shape.max(0.0)
    }

    /// Physical volumetric efficiency at an operating point.
    pub fn volumetric_efficiency(&self, rpm: f64, tps: f64) -> f64 {
        let p = &self.config.profile;
        let gauss = (-0.5 * ((rpm / p.tq_peak_rpm - 1.0) / 0.4).powi(2)).exp();
        let rpm_shape = 0.55 + 0.45 * gauss;
        let throttle = 0.5 + 0.5 * (tps / 100.0).clamp(0.0, 1.0);
        PHYSICS_PEAK_VE * rpm_shape * throttle
    }

    /// Fraction of torque lost to pumping and friction. Grows at closed
    /// throttle and at high RPM.
    pub fn pumping_losses(&self, rpm: f64, tps: f64) -> f64 {
        let p = &self.config.profile;
        let throttle_loss = 0.18 * (1.0 - (tps / 100.0).clamp(0.0, 1.0));
        let friction_loss = 0.10 * (rpm / p.redline_rpm).clamp(0.0, 1.2);
        0.05 + throttle_loss + friction_loss
    }

    /// Thermal factor from coolant temperature.
    pub fn thermal_factor(&self) -> f64 {
        thermal_correction(self.physics.engine_temp_f, self.config.profile.optimal_temp_f)
    }

    /// Air density factor from barometer, IAT and humidity.
    pub fn air_density_factor(&self) -> f64 {
        air_density_correction(
            self.config.barometric_pressure_inhg,
            self.physics.iat_f,
            self.config.humidity_pct,
        )
    }

    /// Target AFR at the current operating point: the ECU table when one is
    /// attached, the analysis targets otherwise.
    fn target_afr(&self, rpm: f64, map_kpa: f64) -> f64 {
        match &self.virtual_ecu {
            Some(ecu) => ecu.lookup_target_afr(rpm, map_kpa),
            None => DEFAULT_AFR_TARGETS
                .iter()
                .min_by(|a, b| {
                    (a.0 - map_kpa)
                        .abs()
                        .partial_cmp(&(b.0 - map_kpa).abs())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(_, afr)| *afr)
                .unwrap_or(14.0),
        }
    }

    /// Knock heuristic: lean of target at high load, or hot intake air at
    /// high load. Returns (knock fired, risk score).
    pub fn check_knock(&self, rpm: f64, tps: f64, afr: f64) -> (bool, f64) {
        if !self.config.enable_knock_detection || tps < HIGH_LOAD_TPS {
            return (false, 0.0);
        }
        let map_kpa = self.map_from_tps(tps);
        let target = self.target_afr(rpm, map_kpa);
        let lean_delta = afr - target;

        let mut risk: f64 = 0.0;
        let mut knock = false;

        if lean_delta > 0.0 {
            risk += (lean_delta / KNOCK_AFR_LEAN_THRESHOLD) * 0.3;
            if lean_delta > KNOCK_AFR_LEAN_THRESHOLD {
                knock = true;
            }
        }

        if self.physics.iat_f > KNOCK_IAT_THRESHOLD_F {
            knock = true;
            risk += 0.3 + (self.physics.iat_f - KNOCK_IAT_THRESHOLD_F) * 0.01;
        }

        (knock, risk.min(1.0))
    }

    /// Effective torque at an operating point: base curve through the
    /// factor chain. `afr` feeds the knock check; None skips it.
    pub fn calculate_effective_torque(
        &self,
        rpm: f64,
        tps: f64,
        afr: Option<f64>,
    ) -> (f64, TorqueFactors) {
        let base = self.base_torque_at(rpm);

        let ve = if self.config.enable_ve {
            self.volumetric_efficiency(rpm, tps) / PHYSICS_PEAK_VE
        } else {
            1.0
        };
        let pumping = if self.config.enable_pumping_losses {
            1.0 - self.pumping_losses(rpm, tps)
        } else {
            1.0
        };
        let thermal = if self.config.enable_thermal_effects {
            self.thermal_factor()
        } else {
            1.0
        };
        let air = if self.config.enable_air_density_correction {
            self.air_density_factor()
        } else {
            1.0
        };
        let mechanical = if self.config.enable_mechanical_efficiency {
            MECHANICAL_EFFICIENCY
        } else {
            1.0
        };
        let knock_factor = match afr {
            Some(afr) => {
                let (knock, _risk) = self.check_knock(rpm, tps, afr);
                if knock {
                    1.0 - KNOCK_TIMING_RETARD_DEG * KNOCK_TORQUE_LOSS_PER_DEG
                } else {
                    1.0
                }
            }
            None => 1.0,
        };

        let factors = TorqueFactors {
            volumetric_efficiency: ve,
            pumping,
            thermal,
            air_density: air,
            mechanical,
            knock: knock_factor,
        };
        let effective = base * ve * pumping * thermal * air * mechanical * knock_factor;
        (effective, factors)
    }

    // -------------------------------------------------------------------------
    // Integration
    // -------------------------------------------------------------------------

    /// Slew the actual throttle toward the target at the configured rate.
    pub fn update_throttle(&mut self, dt: f64) {
        let step = self.config.throttle_response_rate * dt;
        let diff = self.physics.tps_target - self.physics.tps_actual;
        if diff.abs() <= step {
            self.physics.tps_actual = self.physics.tps_target;
        } else {
            self.physics.tps_actual += step * diff.signum();
        }
    }

    /// MAP follows the throttle: 20 kPa closed, 100 kPa wide open.
    pub fn map_from_tps(&self, tps: f64) -> f64 {
        20.0 + 80.0 * (tps / 100.0).clamp(0.0, 1.0)
    }

    /// Integrate angular velocity under the current effective torque.
    pub fn update_physics(&mut self, dt: f64) {
        let map_kpa = self.map_from_tps(self.physics.tps_actual);
        let afr = self.current_afr(self.physics.rpm, map_kpa).0;
        let (effective, factors) =
            self.calculate_effective_torque(self.physics.rpm, self.physics.tps_actual, Some(afr));

        let drag = DRAG_COEFFICIENT * self.physics.angular_velocity;
        let net = effective - drag;

        // Net torque in lb·ft through the scale (units + drum gearing).
        let accel = net * TORQUE_TO_ANGULAR_ACCEL_SCALE / 100.0 / self.physics.total_inertia;
        self.physics.angular_velocity = (self.physics.angular_velocity + accel * dt)
            .max(rpm_to_rad_s(self.config.profile.idle_rpm * 0.8));
        self.physics.rpm = rad_s_to_rpm(self.physics.angular_velocity);

        let (knock, risk) = self.check_knock(self.physics.rpm, self.physics.tps_actual, afr);
        self.physics.knock_risk = risk;
        if knock {
            self.physics.knock_count += 1;
        }

        if self.snapshots_enabled {
            if self.snapshots.len() >= SNAPSHOT_CAP {
                self.snapshots.pop_front();
            }
            self.snapshots.push_back(PhysicsSnapshot {
                rpm: self.physics.rpm,
                tps: self.physics.tps_actual,
                torque_base: self.base_torque_at(self.physics.rpm),
                torque_effective: effective,
                volumetric_efficiency: factors.volumetric_efficiency,
                knock_detected: knock,
                knock_risk_score: risk,
            });
        }
    }

    /// AFR pair (front, rear) reported by the wideband at an operating
    /// point. With an ECU attached the fueling error shows up here.
    fn current_afr(&self, rpm: f64, map_kpa: f64) -> (f64, f64) {
        match &self.virtual_ecu {
            Some(ecu) => {
                let actual_ve = self.volumetric_efficiency(rpm, self.physics.tps_actual);
                (
                    ecu.resulting_afr(rpm, map_kpa, actual_ve, Cylinder::Front),
                    ecu.resulting_afr(rpm, map_kpa, actual_ve, Cylinder::Rear),
                )
            }
            None => {
                let target = self.target_afr(rpm, map_kpa);
                (target, target)
            }
        }
    }

    // -------------------------------------------------------------------------
    // State machine
    // -------------------------------------------------------------------------

    /// Advance one physics tick.
    pub fn step(&mut self, dt: f64) {
        self.sim_time_ms += dt * 1000.0;
        match self.state {
            SimState::Stopped => {}
            SimState::Idle => self.handle_idle_state(dt),
            SimState::Pull => self.handle_pull_state(dt),
            SimState::Decel => self.handle_decel_state(dt),
            SimState::Cooldown => self.handle_cooldown_state(dt),
        }
    }

    fn handle_idle_state(&mut self, dt: f64) {
        let p = self.config.profile.clone();
        self.physics.tps_target = 3.0;
        self.update_throttle(dt);
        // Idle governor: hold the idle speed, no integration needed.
        self.physics.rpm = p.idle_rpm;
        self.physics.angular_velocity = rpm_to_rad_s(p.idle_rpm);
        self.physics.engine_temp_f +=
            (p.optimal_temp_f - self.physics.engine_temp_f) * (0.05 * dt);
        self.physics.iat_f += (self.config.ambient_temp_f - self.physics.iat_f) * (0.05 * dt);
        self.refresh_channels(0.0, 0.0);

        if self.config.auto_pull {
            self.trigger_pull();
        }
    }

    fn handle_pull_state(&mut self, dt: f64) {
        self.update_throttle(dt);
        self.update_physics(dt);

        // Heat builds over a sustained pull.
        self.physics.engine_temp_f += 4.0 * dt;
        self.physics.iat_f += 2.0 * dt;

        let map_kpa = self.map_from_tps(self.physics.tps_actual);
        let (afr_f, afr_r) = self.current_afr(self.physics.rpm, map_kpa);
        let (torque, _) = self.calculate_effective_torque(
            self.physics.rpm,
            self.physics.tps_actual,
            Some(afr_f),
        );
        let hp = torque_to_hp(torque, self.physics.rpm);
        self.refresh_channels(torque, hp);

        if self.physics.tps_actual >= WOT_RECORD_TPS
            && self.physics.rpm >= self.config.pull_record_min_rpm
        {
            self.pull_data.push(PullSample {
                rpm: self.physics.rpm,
                torque,
                horsepower: hp,
                afr_front: afr_f,
                afr_rear: afr_r,
                afr_target: self.target_afr(self.physics.rpm, map_kpa),
                map_kpa,
                tps: self.physics.tps_actual,
                knock: self.physics.knock_risk > 0.3,
            });
        }

        if self.physics.rpm >= self.config.profile.redline_rpm * 0.98 {
            debug!(rpm = self.physics.rpm, samples = self.pull_data.len(), "pull complete");
            self.physics.tps_target = 0.0;
            self.state = SimState::Decel;
        }
    }

    /// Coastdown after the pull. Reported horsepower is the positive
    /// magnitude of the inertial loss power, not zero.
    pub fn handle_decel_state(&mut self, dt: f64) {
        self.update_throttle(dt);

        let omega = self.physics.angular_velocity;
        let loss_torque = ENGINE_BRAKE_COEFFICIENT * omega + DRAG_COEFFICIENT * omega;
        let decel = loss_torque * TORQUE_TO_ANGULAR_ACCEL_SCALE / 100.0 / self.physics.total_inertia;
        self.physics.angular_velocity =
            (omega - decel * dt).max(rpm_to_rad_s(self.config.profile.idle_rpm));
        self.physics.rpm = rad_s_to_rpm(self.physics.angular_velocity);

        let loss_hp = torque_to_hp(loss_torque, self.physics.rpm).abs();
        self.refresh_channels(loss_torque, loss_hp);

        if self.physics.rpm <= self.config.profile.idle_rpm * 1.05 {
            self.cooldown_remaining_s = 1.0;
            self.state = SimState::Cooldown;
        }
    }

    fn handle_cooldown_state(&mut self, dt: f64) {
        self.cooldown_remaining_s -= dt;
        let ambient = self.config.ambient_temp_f;
        self.physics.engine_temp_f +=
            (self.config.profile.optimal_temp_f - self.physics.engine_temp_f) * (0.10 * dt);
        self.physics.iat_f += (ambient - self.physics.iat_f) * (0.10 * dt);
        self.refresh_channels(0.0, 0.0);
        if self.cooldown_remaining_s <= 0.0 {
            self.state = SimState::Idle;
        }
    }

    fn refresh_channels(&mut self, torque: f64, hp: f64) {
        let map_kpa = self.map_from_tps(self.physics.tps_actual);
        let (afr_f, afr_r) = self.current_afr(self.physics.rpm, map_kpa);
        self.channels = LiveChannels {
            rpm: self.physics.rpm,
            torque,
            horsepower: hp,
            afr_front: afr_f,
            afr_rear: afr_r,
            afr_target: self.target_afr(self.physics.rpm, map_kpa),
            map_kpa,
            tps: self.physics.tps_actual,
            knock: self.physics.knock_risk > 0.3,
        };
    }

    // -------------------------------------------------------------------------
    // Drivers
    // -------------------------------------------------------------------------

    /// Fast-forward a complete pull without sleeping. Returns the recorded
    /// pull as a canonical log frame. Wall-clock budget is the caller's
    /// concern; this enforces a simulated-time cap.
    pub fn run_pull_fast(&mut self, max_sim_seconds: f64) -> EngineResult<TuneLog> {
        if self.state == SimState::Stopped {
            self.start();
        }
        let dt = 1.0 / self.config.update_rate_hz;
        // Let idle settle a few ticks, then pull (auto_pull may have already
        // kicked one off).
        for _ in 0..5 {
            self.step(dt);
        }
        if self.state != SimState::Pull && !self.trigger_pull() {
            return Err(EngineError::Internal(format!(
                "cannot start pull from state {}",
                self.state
            )));
        }

        let max_steps = (max_sim_seconds * self.config.update_rate_hz) as usize;
        let mut steps = 0usize;
        while self.state != SimState::Idle {
            self.step(dt);
            steps += 1;
            if steps > max_steps {
                return Err(EngineError::Timeout(std::time::Duration::from_secs_f64(
                    max_sim_seconds,
                )));
            }
        }

        if self.pull_data.is_empty() {
            return Err(EngineError::Analysis("pull produced no samples".into()));
        }
        Ok(pull_data_to_log(&self.pull_data))
    }

    /// Run the simulator at real-time pace, handing a block of samples to
    /// `on_tick` every step, until `stop` is set.
    pub async fn run_live<F>(&mut self, stop: Arc<AtomicBool>, mut on_tick: F)
    where
        F: FnMut(&LiveChannels, Vec<Sample>),
    {
        if self.state == SimState::Stopped {
            self.start();
        }
        let dt = 1.0 / self.config.update_rate_hz;
        let mut interval = tokio::time::interval(std::time::Duration::from_secs_f64(dt));

        while !stop.load(Ordering::Relaxed) {
            interval.tick().await;
            self.step(dt);
            let samples = self.channels_as_samples();
            on_tick(&self.channels, samples);
        }
        self.stop();
    }

    /// Encode the current channels as wire samples using the advertised
    /// channel table.
    pub fn channels_as_samples(&self) -> Vec<Sample> {
        let ts = self.sim_time_ms as u32;
        let c = &self.channels;
        [
            (1u16, "Engine RPM", c.rpm as f32),
            (2, "AFR Meas F", c.afr_front as f32),
            (3, "Torque", c.torque as f32),
            (4, "Horsepower", c.horsepower as f32),
            (5, "MAP kPa", c.map_kpa as f32),
            (6, "TPS", c.tps as f32),
            (7, "AFR Meas R", c.afr_rear as f32),
        ]
        .into_iter()
        .map(|(id, name, value)| Sample {
            provider_id: 0,
            channel_id: id,
            channel_name: name.to_string(),
            timestamp_ms: ts,
            value,
        })
        .collect()
    }
}

/// Channel table the simulator advertises as a KLHDV provider.
pub fn simulator_channel_infos() -> Vec<ChannelInfo> {
    [
        (1u16, "Engine RPM", ChannelUnit::EngineSpeed),
        (2, "AFR Meas F", ChannelUnit::Afr),
        (3, "Torque", ChannelUnit::Torque),
        (4, "Horsepower", ChannelUnit::Power),
        (5, "MAP kPa", ChannelUnit::Pressure),
        (6, "TPS", ChannelUnit::Percentage),
        (7, "AFR Meas R", ChannelUnit::Afr),
    ]
    .into_iter()
    .map(|(id, name, unit)| ChannelInfo {
        id,
        name: name.to_string(),
        unit,
        vendor: 0,
    })
    .collect()
}

/// Convert recorded pull samples into the canonical analysis frame.
pub fn pull_data_to_log(pull: &[PullSample]) -> TuneLog {
    let mut log = TuneLog::new();
    let push = |log: &mut TuneLog, name: &str, values: Vec<f64>| {
        // Lengths always agree; push_column cannot fail here.
        let _ = log.push_column(name.to_string(), values);
    };
    push(&mut log, "Engine RPM", pull.iter().map(|s| s.rpm).collect());
    push(&mut log, "Torque", pull.iter().map(|s| s.torque).collect());
    push(&mut log, "Horsepower", pull.iter().map(|s| s.horsepower).collect());
    push(&mut log, "AFR Meas F", pull.iter().map(|s| s.afr_front).collect());
    push(&mut log, "AFR Meas R", pull.iter().map(|s| s.afr_rear).collect());
    push(&mut log, "AFR Target", pull.iter().map(|s| s.afr_target).collect());
    push(&mut log, "MAP kPa", pull.iter().map(|s| s.map_kpa).collect());
    push(&mut log, "TPS", pull.iter().map(|s| s.tps).collect());
    push(
        &mut log,
        "Knock",
        pull.iter().map(|s| if s.knock { 1.0 } else { 0.0 }).collect(),
    );
    log
}
