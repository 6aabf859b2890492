// =============================================================================
// Tuning orchestrator — closed-loop multi-iteration convergence controller
// =============================================================================
//
// Runs N iterations of {set ECU VE → simulate a pull → analyze AFR →
// compute corrections → update VE} until the AFR converges, an oscillation
// is detected, the iteration budget runs out, or a stop is requested.
//
// Iterations are strictly sequential and each runs under a wall-clock
// budget on a blocking worker. Stop requests are honored between
// iterations, never mid-iteration. Progress is published as one immutable
// snapshot replaced under a single lock, so readers can never observe a
// torn (iteration, percent) pair.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::errors::{EngineError, EngineResult};
use crate::physics::engine::DynoSimulator;
use crate::physics::profile::{EngineProfile, SimulatorConfig};
use crate::physics::virtual_ecu::{
    create_afr_target_table, create_wrong_ve_table, VirtualEcu, VE_MAX, VE_MIN,
};
use crate::tuning::workflow::{
    AutoTuneWorkflow, LogSource, TuneLog, DEFAULT_AFR_TARGETS, DEFAULT_MAP_AXIS, DEFAULT_RPM_AXIS,
};

/// VE delta percent per AFR point, used to translate the AFR convergence
/// threshold into a correction-magnitude threshold.
const VE_PCT_PER_AFR_POINT: f64 = 7.0;
/// Corrections below this magnitude (percent) are noise, not adjustments.
const SIGNIFICANT_CORRECTION_PCT: f64 = 0.5;
/// Consecutive error increases that count as oscillation.
const OSCILLATION_RUN_LENGTH: usize = 3;
/// Simulated-time cap for a single pull.
const PULL_SIM_BUDGET_S: f64 = 30.0;

// -----------------------------------------------------------------------------
// Public types
// -----------------------------------------------------------------------------

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningStatus {
    Initializing,
    Running,
    Converged,
    Failed,
    Stopped,
    MaxIterations,
}

impl std::fmt::Display for TuningStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Converged => "converged",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::MaxIterations => "max_iterations",
        };
        write!(f, "{s}")
    }
}

/// Starting VE error scenario.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VeScenario {
    /// ECU tables match the engine; nothing to correct.
    Perfect,
    /// Tables read ~10 % low (engine runs lean).
    Lean,
    /// Tables read ~10 % high (engine runs rich).
    Rich,
    /// Caller-specified mean/σ error in percent.
    Custom { error_pct_mean: f64, error_pct_std: f64 },
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct TuningSessionConfig {
    pub profile: EngineProfile,
    pub scenario: VeScenario,
    pub max_iterations: u32,
    /// AFR points; converged when max |error| drops below this.
    pub convergence_threshold_afr: f64,
    /// Percent of cells that must be inside the correction threshold.
    pub convergence_cell_pct: f64,
    /// Per-iteration clip on correction multipliers, percent.
    pub max_correction_per_iteration_pct: f64,
    pub iteration_timeout: Duration,
    pub oscillation_detection_enabled: bool,
    /// Error increase (AFR points) that counts toward oscillation.
    pub oscillation_threshold: f64,
    pub barometric_pressure_inhg: f64,
    pub ambient_temp_f: f64,
    /// Seed for the scenario error tables.
    pub seed: u64,
}

impl Default for TuningSessionConfig {
    fn default() -> Self {
        Self {
            profile: EngineProfile::m8_114(),
            scenario: VeScenario::Lean,
            max_iterations: 10,
            convergence_threshold_afr: 0.3,
            convergence_cell_pct: 90.0,
            max_correction_per_iteration_pct: 15.0,
            iteration_timeout: Duration::from_secs(60),
            oscillation_detection_enabled: true,
            oscillation_threshold: 0.1,
            barometric_pressure_inhg: 29.92,
            ambient_temp_f: 75.0,
            seed: 42,
        }
    }
}

/// Results from one tuning iteration.
#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub timestamp_ms: i64,
    pub max_afr_error: f64,
    pub mean_afr_error: f64,
    pub rms_afr_error: f64,
    pub max_ve_correction_pct: f64,
    pub mean_ve_correction_pct: f64,
    pub cells_corrected: usize,
    pub cells_converged: usize,
    pub pull_data_points: usize,
    pub peak_hp: f64,
    pub peak_tq: f64,
    pub converged: bool,
    #[serde(skip)]
    pub correction_table: Vec<Vec<f64>>,
}

/// Immutable progress snapshot; replaced wholesale under one lock.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub session_id: String,
    pub status: TuningStatus,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub progress_pct: f64,
    pub message: String,
    pub iterations: Vec<IterationRecord>,
    pub error_message: Option<String>,
    pub started_at_ms: i64,
    pub finished_at_ms: Option<i64>,
}

// -----------------------------------------------------------------------------
// Session
// -----------------------------------------------------------------------------

struct SessionInner {
    config: TuningSessionConfig,
    status: TuningStatus,
    current_iteration: u32,
    iterations: Vec<IterationRecord>,
    current_ve_front: Vec<Vec<f64>>,
    current_ve_rear: Vec<Vec<f64>>,
    baseline_ve: Vec<Vec<f64>>,
    error_message: Option<String>,
    started_at_ms: i64,
    finished_at_ms: Option<i64>,
}

/// A running or completed tuning session. Iteration state is mutated only
/// by the orchestrator worker; readers go through the progress snapshot.
pub struct TuningSession {
    pub session_id: String,
    inner: Mutex<SessionInner>,
    progress: Mutex<ProgressSnapshot>,
    stop_requested: AtomicBool,
}

impl TuningSession {
    /// Latest progress snapshot; internally consistent by construction.
    pub fn progress(&self) -> ProgressSnapshot {
        self.progress.lock().clone()
    }

    pub fn status(&self) -> TuningStatus {
        self.inner.lock().status
    }

    pub fn baseline_ve(&self) -> Vec<Vec<f64>> {
        self.inner.lock().baseline_ve.clone()
    }

    pub fn current_ve_front(&self) -> Vec<Vec<f64>> {
        self.inner.lock().current_ve_front.clone()
    }

    fn publish_progress(&self, message: &str) {
        let inner = self.inner.lock();
        let progress_pct = if inner.config.max_iterations == 0 {
            100.0
        } else {
            (inner.current_iteration as f64 / inner.config.max_iterations as f64 * 100.0)
                .min(100.0)
        };
        let snapshot = ProgressSnapshot {
            session_id: self.session_id.clone(),
            status: inner.status,
            current_iteration: inner.current_iteration,
            max_iterations: inner.config.max_iterations,
            progress_pct,
            message: message.to_string(),
            iterations: inner.iterations.clone(),
            error_message: inner.error_message.clone(),
            started_at_ms: inner.started_at_ms,
            finished_at_ms: inner.finished_at_ms,
        };
        *self.progress.lock() = snapshot;
    }
}

// -----------------------------------------------------------------------------
// Orchestrator
// -----------------------------------------------------------------------------

/// Owns every tuning session and runs their closed loops.
pub struct TuningOrchestrator {
    sessions: Mutex<HashMap<String, Arc<TuningSession>>>,
}

impl TuningOrchestrator {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a session: build the true VE surface for the engine, derive
    /// the (wrong) starting tables from the scenario.
    pub fn create_session(&self, config: TuningSessionConfig) -> Arc<TuningSession> {
        let session_id = format!(
            "tune_{}_{}",
            Utc::now().timestamp(),
            rand::thread_rng().gen_range(1000..10_000)
        );

        let baseline = true_ve_surface(&config);
        let (front, rear) = match config.scenario {
            VeScenario::Perfect => (baseline.clone(), baseline.clone()),
            VeScenario::Lean => {
                let t = create_wrong_ve_table(&baseline, -10.0, 5.0, config.seed);
                (t.clone(), t)
            }
            VeScenario::Rich => {
                let t = create_wrong_ve_table(&baseline, 10.0, 5.0, config.seed);
                (t.clone(), t)
            }
            VeScenario::Custom {
                error_pct_mean,
                error_pct_std,
            } => {
                let t =
                    create_wrong_ve_table(&baseline, error_pct_mean, error_pct_std, config.seed);
                (t.clone(), t)
            }
        };

        let now = Utc::now().timestamp_millis();
        let session = Arc::new(TuningSession {
            session_id: session_id.clone(),
            inner: Mutex::new(SessionInner {
                config,
                status: TuningStatus::Initializing,
                current_iteration: 0,
                iterations: Vec::new(),
                current_ve_front: front,
                current_ve_rear: rear,
                baseline_ve: baseline,
                error_message: None,
                started_at_ms: now,
                finished_at_ms: None,
            }),
            progress: Mutex::new(ProgressSnapshot {
                session_id: session_id.clone(),
                status: TuningStatus::Initializing,
                current_iteration: 0,
                max_iterations: 0,
                progress_pct: 0.0,
                message: "created".to_string(),
                iterations: Vec::new(),
                error_message: None,
                started_at_ms: now,
                finished_at_ms: None,
            }),
            stop_requested: AtomicBool::new(false),
        });
        session.publish_progress("created");

        info!(session = %session_id, "tuning session created");
        self.sessions
            .lock()
            .insert(session_id, session.clone());
        session
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<TuningSession>> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Ask a running session to stop. Honored between iterations.
    pub fn request_stop(&self, session_id: &str) -> bool {
        match self.get_session(session_id) {
            Some(session) => {
                session.stop_requested.store(true, Ordering::Relaxed);
                info!(session = %session_id, "stop requested");
                true
            }
            None => false,
        }
    }

    /// Run the closed loop to a terminal state. Blocks (async) until done.
    pub async fn run_session(&self, session: Arc<TuningSession>) -> TuningStatus {
        {
            let mut inner = session.inner.lock();
            inner.status = TuningStatus::Running;
        }
        session.publish_progress("running");
        info!(session = %session.session_id, "tuning session started");

        let max_iterations = session.inner.lock().config.max_iterations;

        for iteration in 1..=max_iterations {
            if session.stop_requested.load(Ordering::Relaxed) {
                finish(&session, TuningStatus::Stopped, None);
                break;
            }

            let (config, ve_front, ve_rear) = {
                let inner = session.inner.lock();
                (
                    inner.config.clone(),
                    inner.current_ve_front.clone(),
                    inner.current_ve_rear.clone(),
                )
            };

            let worker =
                tokio::task::spawn_blocking(move || run_iteration(&config, iteration, ve_front, ve_rear));

            let timeout = session.inner.lock().config.iteration_timeout;
            let result = match tokio::time::timeout(timeout, worker).await {
                Err(_) => {
                    error!(
                        session = %session.session_id,
                        iteration,
                        timeout_s = timeout.as_secs_f64(),
                        "iteration exceeded wall-clock budget"
                    );
                    finish(
                        &session,
                        TuningStatus::Failed,
                        Some(format!(
                            "iteration {iteration} timed out after {:.0}s",
                            timeout.as_secs_f64()
                        )),
                    );
                    break;
                }
                Ok(Err(join_err)) => {
                    error!(session = %session.session_id, iteration, error = %join_err, "iteration worker died");
                    finish(
                        &session,
                        TuningStatus::Failed,
                        Some(format!("iteration {iteration} worker failed: {join_err}")),
                    );
                    break;
                }
                Ok(Ok(Err(e))) => {
                    error!(session = %session.session_id, iteration, error = %e, "iteration failed");
                    finish(
                        &session,
                        TuningStatus::Failed,
                        Some(format!("iteration {iteration} failed: {e}")),
                    );
                    break;
                }
                Ok(Ok(Ok(record))) => record,
            };

            info!(
                session = %session.session_id,
                iteration,
                max_afr_error = result.max_afr_error,
                max_ve_correction_pct = result.max_ve_correction_pct,
                converged = result.converged,
                "iteration complete"
            );

            let converged = result.converged;
            {
                let mut inner = session.inner.lock();
                inner.current_iteration = iteration;
                inner.iterations.push(result);
            }
            session.publish_progress(&format!("iteration {iteration}/{max_iterations} complete"));

            if converged {
                finish(&session, TuningStatus::Converged, None);
                info!(session = %session.session_id, iteration, "converged");
                break;
            }

            if oscillating(&session) {
                warn!(session = %session.session_id, "oscillation detected, stopping");
                finish(
                    &session,
                    TuningStatus::Failed,
                    Some("oscillation detected: corrections are not converging".to_string()),
                );
                break;
            }

            apply_corrections(&session);
        }

        // Budget exhausted without another terminal condition.
        {
            let mut inner = session.inner.lock();
            if inner.status == TuningStatus::Running {
                inner.status = TuningStatus::MaxIterations;
                inner.finished_at_ms = Some(Utc::now().timestamp_millis());
            }
        }
        session.publish_progress("finished");
        session.status()
    }
}

impl Default for TuningOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------------
// Loop internals
// -----------------------------------------------------------------------------

fn finish(session: &Arc<TuningSession>, status: TuningStatus, error_message: Option<String>) {
    let mut inner = session.inner.lock();
    inner.status = status;
    inner.error_message = error_message;
    inner.finished_at_ms = Some(Utc::now().timestamp_millis());
}

/// The engine's true VE surface over the analysis grid, with MAP mapped
/// back through the throttle relation. This is what a perfectly calibrated
/// ECU table would hold.
fn true_ve_surface(config: &TuningSessionConfig) -> Vec<Vec<f64>> {
    let mut sim_config = SimulatorConfig::default();
    sim_config.profile = config.profile.clone();
    sim_config.barometric_pressure_inhg = config.barometric_pressure_inhg;
    sim_config.ambient_temp_f = config.ambient_temp_f;
    let sim = DynoSimulator::new(sim_config);

    DEFAULT_RPM_AXIS
        .iter()
        .map(|rpm| {
            DEFAULT_MAP_AXIS
                .iter()
                .map(|map_kpa| {
                    let tps = ((map_kpa - 20.0) / 0.8).clamp(0.0, 100.0);
                    sim.volumetric_efficiency(*rpm, tps).clamp(VE_MIN, VE_MAX)
                })
                .collect()
        })
        .collect()
}

/// One iteration: pull with the current tables, analyze, compute
/// corrections. Pure with respect to the session; the caller applies the
/// returned correction table.
fn run_iteration(
    config: &TuningSessionConfig,
    iteration: u32,
    ve_front: Vec<Vec<f64>>,
    ve_rear: Vec<Vec<f64>>,
) -> EngineResult<IterationRecord> {
    let rpm_bins: Vec<f64> = DEFAULT_RPM_AXIS.to_vec();
    let map_bins: Vec<f64> = DEFAULT_MAP_AXIS.to_vec();
    let afr_table = create_afr_target_table(&rpm_bins, &map_bins, &DEFAULT_AFR_TARGETS);
    let ecu = VirtualEcu::new(ve_front, ve_rear, afr_table, rpm_bins, map_bins)?;

    let mut sim_config = SimulatorConfig::default();
    sim_config.profile = config.profile.clone();
    sim_config.barometric_pressure_inhg = config.barometric_pressure_inhg;
    sim_config.ambient_temp_f = config.ambient_temp_f;

    let mut simulator = DynoSimulator::new(sim_config).with_virtual_ecu(ecu);
    let log = simulator.run_pull_fast(PULL_SIM_BUDGET_S)?;

    let (max_afr_error, mean_afr_error, rms_afr_error) = afr_error_stats(&log)?;

    // Corrections via the shared analysis engine.
    let workflow = AutoTuneWorkflow::new();
    let mut analysis_session = workflow.create_session(LogSource::Simulation);
    if !workflow.import_frame(&mut analysis_session, log) {
        return Err(EngineError::Analysis(
            analysis_session
                .errors
                .last()
                .cloned()
                .unwrap_or_else(|| "import failed".into()),
        ));
    }
    if workflow.analyze_afr(&mut analysis_session).is_none() {
        return Err(EngineError::Analysis(
            analysis_session
                .errors
                .last()
                .cloned()
                .unwrap_or_else(|| "analysis failed".into()),
        ));
    }
    let corrections = workflow
        .calculate_corrections(&mut analysis_session)
        .ok_or_else(|| {
            EngineError::Analysis(
                analysis_session
                    .errors
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "correction calculation failed".into()),
            )
        })?;

    // Correction magnitudes.
    let pcts: Vec<f64> = corrections
        .table
        .iter()
        .flatten()
        .map(|c| (c - 1.0) * 100.0)
        .collect();
    let significant: Vec<f64> = pcts
        .iter()
        .cloned()
        .filter(|p| p.abs() > SIGNIFICANT_CORRECTION_PCT)
        .collect();
    let max_ve_correction_pct = significant.iter().cloned().map(f64::abs).fold(0.0, f64::max);
    let mean_ve_correction_pct = if significant.is_empty() {
        0.0
    } else {
        significant.iter().map(|p| p.abs()).sum::<f64>() / significant.len() as f64
    };

    // Convergence: small max error AND a large-enough share of settled cells.
    let correction_threshold = config.convergence_threshold_afr * VE_PCT_PER_AFR_POINT;
    let cells_converged = pcts.iter().filter(|p| p.abs() < correction_threshold).count();
    let convergence_pct = cells_converged as f64 / pcts.len() as f64 * 100.0;
    let converged = max_afr_error < config.convergence_threshold_afr
        && convergence_pct >= config.convergence_cell_pct;

    Ok(IterationRecord {
        iteration,
        timestamp_ms: Utc::now().timestamp_millis(),
        max_afr_error,
        mean_afr_error,
        rms_afr_error,
        max_ve_correction_pct,
        mean_ve_correction_pct,
        cells_corrected: significant.len(),
        cells_converged,
        pull_data_points: analysis_session.log.as_ref().map_or(0, |l| l.rows()),
        peak_hp: analysis_session.peak_hp,
        peak_tq: analysis_session.peak_tq,
        converged,
        correction_table: corrections.table,
    })
}

/// Max / mean / RMS of the per-cylinder AFR error on the pull.
fn afr_error_stats(log: &TuneLog) -> EngineResult<(f64, f64, f64)> {
    let target = log
        .column("AFR Target")
        .ok_or_else(|| EngineError::Analysis("pull log missing AFR Target".into()))?;
    let front = log
        .column("AFR Meas F")
        .ok_or_else(|| EngineError::Analysis("pull log missing AFR Meas F".into()))?;
    let rear = log
        .column("AFR Meas R")
        .ok_or_else(|| EngineError::Analysis("pull log missing AFR Meas R".into()))?;

    let mut max_err: f64 = 0.0;
    let mut sum_abs = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0usize;
    for ((f, r), t) in front.iter().zip(rear).zip(target) {
        for measured in [f, r] {
            let err = measured - t;
            max_err = max_err.max(err.abs());
            sum_abs += err.abs();
            sum_sq += err * err;
            n += 1;
        }
    }
    if n == 0 {
        return Err(EngineError::Analysis("pull produced no AFR samples".into()));
    }
    Ok((
        max_err,
        sum_abs / n as f64,
        (sum_sq / n as f64).sqrt(),
    ))
}

/// Three consecutive iterations whose max AFR error each grew by more than
/// the oscillation threshold.
fn oscillating(session: &Arc<TuningSession>) -> bool {
    let inner = session.inner.lock();
    if !inner.config.oscillation_detection_enabled {
        return false;
    }
    oscillating_errors(
        &inner
            .iterations
            .iter()
            .map(|it| it.max_afr_error)
            .collect::<Vec<_>>(),
        inner.config.oscillation_threshold,
    )
}

/// Pure oscillation predicate over the error history.
fn oscillating_errors(errors: &[f64], threshold: f64) -> bool {
    if errors.len() < OSCILLATION_RUN_LENGTH + 1 {
        return false;
    }
    errors
        .windows(2)
        .rev()
        .take(OSCILLATION_RUN_LENGTH)
        .all(|w| w[1] > w[0] + threshold)
}

/// Clip the latest correction per the per-iteration limit and fold it into
/// the session's VE tables.
fn apply_corrections(session: &Arc<TuningSession>) {
    let mut inner = session.inner.lock();
    let Some(last) = inner.iterations.last() else {
        return;
    };
    let correction = last.correction_table.clone();
    if correction.len() != inner.current_ve_front.len() {
        warn!(session = %session.session_id, "correction table shape mismatch, skipping");
        return;
    }

    let limit = inner.config.max_correction_per_iteration_pct / 100.0;
    let lo = 1.0 - limit;
    let hi = 1.0 + limit;

    let inner_ref = &mut *inner;
    let front = &mut inner_ref.current_ve_front;
    let rear = &mut inner_ref.current_ve_rear;
    for table in [front, rear] {
        for (row, corr_row) in table.iter_mut().zip(&correction) {
            for (cell, corr) in row.iter_mut().zip(corr_row) {
                let clipped = corr.clamp(lo, hi);
                *cell = (*cell * clipped).clamp(VE_MIN, VE_MAX);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn uniform_lean_config() -> TuningSessionConfig {
        TuningSessionConfig {
            scenario: VeScenario::Custom {
                error_pct_mean: -10.0,
                error_pct_std: 0.0,
            },
            max_iterations: 10,
            convergence_threshold_afr: 0.3,
            max_correction_per_iteration_pct: 15.0,
            ..TuningSessionConfig::default()
        }
    }

    #[test]
    fn create_session_builds_tables_per_scenario() {
        let orch = TuningOrchestrator::new();

        let perfect = orch.create_session(TuningSessionConfig {
            scenario: VeScenario::Perfect,
            ..TuningSessionConfig::default()
        });
        assert_eq!(perfect.status(), TuningStatus::Initializing);
        assert_eq!(perfect.current_ve_front(), perfect.baseline_ve());

        let lean = orch.create_session(TuningSessionConfig::default());
        assert!(lean.session_id.starts_with("tune_"));
        assert_ne!(lean.current_ve_front(), lean.baseline_ve());

        // Lean tables sit below the baseline on average.
        let base = lean.baseline_ve();
        let wrong = lean.current_ve_front();
        let mut deltas = Vec::new();
        for (br, wr) in base.iter().zip(&wrong) {
            for (b, w) in br.iter().zip(wr) {
                deltas.push(w / b - 1.0);
            }
        }
        let mean: f64 = deltas.iter().sum::<f64>() / deltas.len() as f64;
        assert!(mean < -0.05);
    }

    #[test]
    fn sessions_are_retrievable_by_id() {
        let orch = TuningOrchestrator::new();
        let session = orch.create_session(TuningSessionConfig::default());
        assert!(orch.get_session(&session.session_id).is_some());
        assert!(orch.get_session("tune_nope").is_none());
    }

    #[tokio::test]
    async fn uniformly_low_tables_converge_quickly() {
        let orch = TuningOrchestrator::new();
        let session = orch.create_session(uniform_lean_config());

        let status = orch.run_session(session.clone()).await;
        assert_eq!(status, TuningStatus::Converged);

        let progress = session.progress();
        assert!(
            progress.current_iteration <= 6,
            "expected convergence within 6 iterations, took {}",
            progress.current_iteration
        );
        let last = progress.iterations.last().unwrap();
        assert!(last.converged);
        assert!(last.max_afr_error < 0.3, "final error {}", last.max_afr_error);
        // First iteration must have seen the injected lean error.
        assert!(progress.iterations[0].max_afr_error > 0.5);
    }

    #[tokio::test]
    async fn converged_last_iteration_implies_converged_status() {
        let orch = TuningOrchestrator::new();
        let session = orch.create_session(uniform_lean_config());
        orch.run_session(session.clone()).await;

        let progress = session.progress();
        if progress.iterations.last().map(|it| it.converged) == Some(true) {
            assert_eq!(progress.status, TuningStatus::Converged);
        }
    }

    #[tokio::test]
    async fn perfect_tables_converge_immediately() {
        let orch = TuningOrchestrator::new();
        let session = orch.create_session(TuningSessionConfig {
            scenario: VeScenario::Perfect,
            ..TuningSessionConfig::default()
        });
        let status = orch.run_session(session.clone()).await;
        assert_eq!(status, TuningStatus::Converged);
        assert_eq!(session.progress().current_iteration, 1);
    }

    #[tokio::test]
    async fn stop_request_halts_between_iterations() {
        let orch = TuningOrchestrator::new();
        let session = orch.create_session(uniform_lean_config());
        assert!(orch.request_stop(&session.session_id));

        let status = orch.run_session(session.clone()).await;
        assert_eq!(status, TuningStatus::Stopped);
        assert_eq!(session.progress().iterations.len(), 0);
    }

    #[tokio::test]
    async fn iteration_timeout_fails_the_session() {
        let orch = TuningOrchestrator::new();
        let session = orch.create_session(TuningSessionConfig {
            iteration_timeout: Duration::from_micros(1),
            ..uniform_lean_config()
        });
        let status = orch.run_session(session.clone()).await;
        assert_eq!(status, TuningStatus::Failed);
        let progress = session.progress();
        assert!(progress.error_message.unwrap().contains("timed out"));
    }

    #[test]
    fn oscillation_needs_three_consecutive_increases() {
        // Two increases: not yet.
        assert!(!oscillating_errors(&[1.0, 1.3, 1.6], 0.1));
        // Three consecutive increases beyond the threshold.
        assert!(oscillating_errors(&[1.0, 1.3, 1.6, 1.9], 0.1));
        // A dip in the run resets it.
        assert!(!oscillating_errors(&[1.0, 1.3, 1.1, 1.4], 0.1));
        // Increases below the threshold do not count.
        assert!(!oscillating_errors(&[1.0, 1.05, 1.10, 1.15], 0.1));
        // Converging history never trips.
        assert!(!oscillating_errors(&[2.0, 1.0, 0.5, 0.2], 0.1));
    }

    #[test]
    fn progress_snapshot_is_internally_consistent() {
        let orch = TuningOrchestrator::new();
        let session = orch.create_session(TuningSessionConfig::default());

        let p = session.progress();
        assert_eq!(p.session_id, session.session_id);
        assert_eq!(p.iterations.len() as u32, p.current_iteration);
        assert_eq!(p.max_iterations, 10);
        assert_eq!(p.progress_pct, 0.0);
    }

    #[test]
    fn per_iteration_clip_bounds_applied_corrections() {
        let orch = TuningOrchestrator::new();
        let session = orch.create_session(TuningSessionConfig {
            max_correction_per_iteration_pct: 5.0,
            ..TuningSessionConfig::default()
        });

        let before = session.current_ve_front();
        // Fake an iteration wanting a 40 % bump everywhere.
        {
            let mut inner = session.inner.lock();
            let shape = (
                inner.current_ve_front.len(),
                inner.current_ve_front[0].len(),
            );
            inner.iterations.push(IterationRecord {
                iteration: 1,
                timestamp_ms: 0,
                max_afr_error: 1.0,
                mean_afr_error: 1.0,
                rms_afr_error: 1.0,
                max_ve_correction_pct: 40.0,
                mean_ve_correction_pct: 40.0,
                cells_corrected: shape.0 * shape.1,
                cells_converged: 0,
                pull_data_points: 100,
                peak_hp: 0.0,
                peak_tq: 0.0,
                converged: false,
                correction_table: vec![vec![1.40; shape.1]; shape.0],
            });
        }
        apply_corrections(&session);

        let after = session.current_ve_front();
        for (before_row, after_row) in before.iter().zip(&after) {
            for (b, a) in before_row.iter().zip(after_row) {
                let ratio = a / b;
                assert!(
                    ratio <= 1.05 + 1e-9,
                    "correction must clip to 5 % per iteration, got {ratio}"
                );
                assert!(*a <= VE_MAX && *a >= VE_MIN);
            }
        }
    }
}
