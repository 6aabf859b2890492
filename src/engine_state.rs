// =============================================================================
// Central engine state — DynoTune
// =============================================================================
//
// The single source of truth for the process. Subsystems own their interior
// mutability; EngineState ties them together and builds one serialisable
// snapshot. Constructed eagerly at startup and handed around explicitly;
// tests build a fresh state instead of patching globals.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot locks for the mutable collections.
//   - Arc wrappers for subsystems that manage their own locking.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::errors::{EngineError, ErrorRecord};
use crate::live_queue::{LiveCaptureQueue, LiveQueueStats};
use crate::orchestrator::TuningOrchestrator;
use crate::reliability::{ReliabilityRegistry, ReliabilitySnapshot};
use crate::store::RunStore;
use crate::tuning::workflow::{AutoTuneSession, AutoTuneWorkflow};
use crate::validator::{DataValidator, ValidatorSnapshot};

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// Central state shared across all async tasks via `Arc<EngineState>`.
pub struct EngineState {
    /// Monotonically increasing version counter, incremented on every
    /// meaningful mutation so pollers can detect change cheaply.
    pub state_version: AtomicU64,

    pub config: RwLock<EngineConfig>,

    // ── Telemetry pipeline ──────────────────────────────────────────────
    pub live_queue: Arc<LiveCaptureQueue>,
    pub validator: Arc<DataValidator>,

    // ── Analysis & tuning ───────────────────────────────────────────────
    pub workflow: AutoTuneWorkflow,
    pub autotune_sessions: RwLock<HashMap<String, AutoTuneSession>>,
    pub orchestrator: Arc<TuningOrchestrator>,

    // ── Cross-cutting ───────────────────────────────────────────────────
    pub reliability: Arc<ReliabilityRegistry>,
    pub store: RunStore,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    pub start_time: std::time::Instant,
}

impl EngineState {
    /// Construct the full engine from a configuration. The returned value
    /// is typically wrapped in `Arc` immediately.
    pub fn new(config: EngineConfig) -> Self {
        let live_queue = Arc::new(LiveCaptureQueue::new(
            config.queue_window_ms,
            config.queue_capacity,
        ));

        let mut workflow = AutoTuneWorkflow::new();
        workflow.rpm_axis = config.rpm_axis.clone();
        workflow.map_axis = config.map_axis.clone();
        workflow.max_correction_pct = config.max_correction_pct;
        workflow.set_afr_targets(config.afr_targets.clone());

        let store = RunStore::new(config.runs_root.clone());

        Self {
            state_version: AtomicU64::new(1),
            config: RwLock::new(config),
            live_queue,
            validator: Arc::new(DataValidator::new()),
            workflow,
            autotune_sessions: RwLock::new(HashMap::new()),
            orchestrator: Arc::new(TuningOrchestrator::new()),
            reliability: Arc::new(ReliabilityRegistry::new()),
            store,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error logging ───────────────────────────────────────────────────

    /// Record a structured error; the ring keeps the most recent
    /// [`MAX_RECENT_ERRORS`].
    pub fn push_error(&self, err: &EngineError) {
        let mut errors = self.recent_errors.write();
        errors.push(err.to_record());
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);
        self.increment_version();
    }

    // ── Session bookkeeping ─────────────────────────────────────────────

    pub fn insert_autotune_session(&self, session: AutoTuneSession) {
        self.autotune_sessions
            .write()
            .insert(session.id.clone(), session);
        self.increment_version();
    }

    pub fn autotune_session(&self, id: &str) -> Option<AutoTuneSession> {
        self.autotune_sessions.read().get(id).cloned()
    }

    // ── Snapshot builder ────────────────────────────────────────────────

    /// Build the full serialisable engine snapshot.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let config = self.config.read();
        let sessions: Vec<AutotuneSessionSummary> = self
            .autotune_sessions
            .read()
            .values()
            .map(|s| AutotuneSessionSummary {
                id: s.id.clone(),
                status: s.status.to_string(),
                data_source: s.data_source.to_string(),
                errors: s.errors.len(),
            })
            .collect();

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            mode: config.mode.to_string(),
            multicast_group: config.transport.multicast_group.clone(),
            port: config.transport.port,
            live_queue: self.live_queue.stats(),
            validator: self.validator.snapshot(),
            reliability: self.reliability.snapshot(),
            autotune_sessions: sessions,
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

/// Full engine snapshot for pollers and (external) shells.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_seconds: u64,
    pub mode: String,
    pub multicast_group: String,
    pub port: u16,
    pub live_queue: LiveQueueStats,
    pub validator: ValidatorSnapshot,
    pub reliability: ReliabilitySnapshot,
    pub autotune_sessions: Vec<AutotuneSessionSummary>,
    pub recent_errors: Vec<ErrorRecord>,
}

/// One-line session summary for the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct AutotuneSessionSummary {
    pub id: String,
    pub status: String,
    pub data_source: String,
    pub errors: usize,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::workflow::LogSource;

    #[test]
    fn snapshot_reflects_configuration_and_subsystems() {
        let state = EngineState::new(EngineConfig::default());
        let snap = state.build_snapshot();

        assert_eq!(snap.mode, "virtual");
        assert_eq!(snap.multicast_group, "224.0.2.10");
        assert_eq!(snap.port, 22344);
        assert_eq!(snap.live_queue.samples_received, 0);
        assert!(snap.autotune_sessions.is_empty());
        assert!(snap.recent_errors.is_empty());
    }

    #[test]
    fn version_increments_on_mutation() {
        let state = EngineState::new(EngineConfig::default());
        let v0 = state.current_state_version();
        state.push_error(&EngineError::Transport("bind failed".into()));
        assert!(state.current_state_version() > v0);
        assert_eq!(state.build_snapshot().recent_errors.len(), 1);
        assert_eq!(state.build_snapshot().recent_errors[0].kind, "transport");
    }

    #[test]
    fn error_ring_is_bounded() {
        let state = EngineState::new(EngineConfig::default());
        for i in 0..80 {
            state.push_error(&EngineError::Internal(format!("event {i}")));
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), 50);
        assert!(errors[0].message.contains("event 30"));
    }

    #[test]
    fn workflow_inherits_the_configured_grid() {
        let mut config = EngineConfig::default();
        config.rpm_axis = vec![2000.0, 4000.0];
        config.map_axis = vec![50.0, 100.0];
        config.max_correction_pct = 5.0;
        let state = EngineState::new(config);

        assert_eq!(state.workflow.rpm_axis, vec![2000.0, 4000.0]);
        assert_eq!(state.workflow.max_correction_pct, 5.0);
    }

    #[test]
    fn sessions_are_stored_and_retrievable() {
        let state = EngineState::new(EngineConfig::default());
        let session = state.workflow.create_session(LogSource::Csv);
        let id = session.id.clone();
        state.insert_autotune_session(session);

        assert!(state.autotune_session(&id).is_some());
        assert_eq!(state.build_snapshot().autotune_sessions.len(), 1);
    }
}
