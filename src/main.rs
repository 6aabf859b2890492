// =============================================================================
// DynoTune — Main Entry Point
// =============================================================================
//
// Closed-loop virtual tuning engine for motorcycle ECUs. The engine starts
// in Virtual mode (in-process physics simulator) unless DYNO_MODE=live
// points it at a real dyno on the KLHDV multicast group.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod binning;
mod config;
mod engine_state;
mod errors;
mod live_queue;
mod nextgen;
mod orchestrator;
mod physics;
mod reliability;
mod store;
mod transport;
mod tuning;
mod validator;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{EngineConfig, EngineMode};
use crate::engine_state::EngineState;
use crate::errors::EngineError;
use crate::orchestrator::{TuningSessionConfig, TuningStatus};
use crate::physics::engine::{pull_data_to_log, simulator_channel_infos, DynoSimulator};
use crate::physics::virtual_ecu::{create_afr_target_table, VirtualEcu};
use crate::reliability::{CircuitBreakerConfig, RetryPolicy};
use crate::transport::discovery::discover_providers;
use crate::transport::publish::{announce_provider, publish_run, resolve_provider_id, PublishOptions};
use crate::transport::subscribe::{subscribe, SubscribeOptions};
use crate::transport::wire::Sample;
use crate::tuning::export::export_all;
use crate::tuning::workflow::LogSource;

const CONFIG_PATH: &str = "engine_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           DynoTune Engine — Starting Up                 ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "no config file, reading environment");
        EngineConfig::from_env()
    });

    info!(
        mode = %config.mode,
        group = %config.transport.multicast_group,
        port = config.transport.port,
        "engine configured"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(EngineState::new(config));
    let stop = Arc::new(AtomicBool::new(false));

    // ── 3. Telemetry source ──────────────────────────────────────────────
    let mode = state.config.read().mode;
    match mode {
        EngineMode::Virtual => {
            let sim_state = state.clone();
            let sim_stop = stop.clone();
            tokio::spawn(async move {
                run_simulator_feed(sim_state, sim_stop).await;
            });
            info!("virtual telemetry source running");

            // The closed loop is the whole point of virtual mode.
            let tune_state = state.clone();
            tokio::spawn(async move {
                if let Err(e) = run_virtual_tuning(tune_state.clone()).await {
                    error!(error = %e, "virtual tuning session failed");
                    tune_state.push_error(&EngineError::Internal(e.to_string()));
                }
            });
        }
        EngineMode::Live => {
            let live_state = state.clone();
            let live_stop = stop.clone();
            tokio::spawn(async move {
                run_live_feed(live_state, live_stop).await;
            });
            info!("live KLHDV feed starting");
        }
    }

    // ── 4. Health monitor loop ───────────────────────────────────────────
    let health_state = state.clone();
    let health_stop = stop.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            if health_stop.load(Ordering::Relaxed) {
                break;
            }
            let snapshot = health_state.build_snapshot();
            info!(
                overall = %snapshot.reliability.overall,
                channels = snapshot.validator.total_channels,
                healthy = snapshot.validator.healthy_channels,
                queue_depth = snapshot.live_queue.queue_depth,
                dropped = snapshot.live_queue.samples_dropped,
                "health check"
            );
            if snapshot.validator.total_channels > 0
                && snapshot.validator.healthy_channels == 0
            {
                health_state
                    .reliability
                    .record_alert("validator", "no healthy telemetry channels");
            }
        }
    });

    // ── 5. Queue drain loop ──────────────────────────────────────────────
    let drain_state = state.clone();
    let drain_stop = stop.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            if drain_stop.load(Ordering::Relaxed) {
                break;
            }
            let windows = drain_state.live_queue.drain();
            if !windows.is_empty() {
                let samples: usize = windows.iter().map(|w| w.samples.len()).sum();
                tracing::debug!(windows = windows.len(), samples, "capture windows drained");
                drain_state.increment_version();
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");
    stop.store(true, Ordering::Relaxed);
    state.live_queue.force_flush();

    if let Err(e) = state.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save engine config on shutdown");
    }

    info!("DynoTune shut down complete.");
    Ok(())
}

// =============================================================================
// Telemetry feeds
// =============================================================================

/// Virtual mode: run the physics simulator at real-time pace and feed its
/// channels straight into the live queue and validator. With DYNO_PUBLISH
/// set, the same samples also go out on the multicast group so external
/// listeners see a discoverable KLHDV provider.
async fn run_simulator_feed(state: Arc<EngineState>, stop: Arc<AtomicBool>) {
    let mut sim_config = state.config.read().simulator.clone();
    sim_config.auto_pull = true;
    let mut simulator = DynoSimulator::new(sim_config);

    let publish_tx = if std::env::var("DYNO_PUBLISH").is_ok() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Vec<Sample>>();
        let transport = state.config.read().transport.clone();
        let pub_stop = stop.clone();
        tokio::spawn(async move {
            run_sample_publisher(transport, rx, pub_stop).await;
        });
        Some(tx)
    } else {
        None
    };

    let queue = state.live_queue.clone();
    let validator = state.validator.clone();
    simulator
        .run_live(stop, move |_channels, samples| {
            for sample in &samples {
                validator.record_sample(sample);
                queue.push(sample.clone());
            }
            if let Some(tx) = &publish_tx {
                let _ = tx.send(samples);
            }
        })
        .await;
    info!("simulator feed stopped");
}

/// Announce the simulator as a provider, then batch its sample blocks onto
/// the group.
async fn run_sample_publisher(
    transport: crate::transport::TransportConfig,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Vec<Sample>>,
    stop: Arc<AtomicBool>,
) {
    let provider_id = match resolve_provider_id(0) {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "cannot pick a publisher provider id");
            return;
        }
    };
    if let Err(e) =
        announce_provider(&transport, provider_id, "DynoTune Virtual", &simulator_channel_infos())
            .await
    {
        error!(error = %e, "provider announce failed");
        return;
    }

    let mut batch: Vec<Sample> = Vec::new();
    while !stop.load(Ordering::Relaxed) {
        let Some(block) = rx.recv().await else {
            break;
        };
        batch.extend(block);
        if batch.len() < 500 {
            continue;
        }
        let options = PublishOptions {
            playback_rate: 10.0,
            loop_playback: false,
        };
        if let Err(e) =
            publish_run(&transport, provider_id, &batch, options, stop.clone()).await
        {
            warn!(error = %e, "sample publish failed");
        }
        batch.clear();
    }
    info!("sample publisher stopped");
}

/// Live mode: discover the provider, then keep a provider-pinned subscribe
/// loop alive, reconnecting with backoff under the dyno breaker.
async fn run_live_feed(state: Arc<EngineState>, stop: Arc<AtomicBool>) {
    let reliability_cfg = state.config.read().reliability.clone();
    let breaker = state.reliability.breaker(
        "klhdv",
        CircuitBreakerConfig {
            failure_threshold: reliability_cfg.breaker_failure_threshold,
            success_threshold: reliability_cfg.breaker_success_threshold,
            timeout: Duration::from_secs(reliability_cfg.breaker_timeout_s),
            ..CircuitBreakerConfig::default()
        },
    );
    let retry = RetryPolicy {
        max_attempts: reliability_cfg.retry_max_attempts,
        base_delay: Duration::from_millis(reliability_cfg.retry_base_delay_ms),
        ..RetryPolicy::default()
    };
    let monitor = state.reliability.monitor("klhdv_feed", 64);

    while !stop.load(Ordering::Relaxed) {
        let transport = state.config.read().transport.clone();

        // Discovery under retry + breaker.
        let discovered = retry
            .run("discover_providers", || {
                let transport = transport.clone();
                let breaker = breaker.clone();
                async move {
                    breaker
                        .call_async(|| discover_providers(&transport, Duration::from_secs(2)))
                        .await
                }
            })
            .await;

        let provider = match discovered {
            Ok(providers) if !providers.is_empty() => {
                info!(count = providers.len(), "providers discovered");
                providers.into_iter().next().expect("non-empty")
            }
            Ok(_) => {
                warn!("no providers on the group — retrying in 5s");
                monitor.record_failure("no providers discovered");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
            Err(e) => {
                error!(error = %e, "provider discovery failed — retrying in 5s");
                state.push_error(&e);
                monitor.record_failure(e.to_string());
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        info!(
            provider_id = provider.provider_id,
            provider = %provider.name,
            channels = provider.channels.len(),
            "subscribing to provider"
        );

        let queue = state.live_queue.clone();
        let validator = state.validator.clone();
        let started = std::time::Instant::now();
        let result = subscribe(
            &transport,
            &provider,
            SubscribeOptions::default(),
            move |sample| {
                validator.record_sample(&sample);
                queue.push(sample);
            },
            stop.clone(),
        )
        .await;

        match result {
            Ok(stats) => {
                monitor.record_success(started.elapsed().as_millis() as f64);
                state.validator.record_frame_stats(
                    stats.total_frames,
                    stats.dropped_frames,
                    0,
                    stats.non_provider_frames,
                );
                info!(
                    total = stats.total_frames,
                    dropped = stats.dropped_frames,
                    non_provider = stats.non_provider_frames,
                    "subscribe loop ended"
                );
            }
            Err(e) => {
                error!(error = %e, "subscribe failed — reconnecting in 5s");
                breaker.record_failure();
                monitor.record_failure(e.to_string());
                state.push_error(&e);
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    }
    info!("live feed stopped");
}

// =============================================================================
// Virtual closed loop
// =============================================================================

/// Run one full closed-loop tuning session, then export the corrected
/// tables and the NextGen analysis into the run store.
async fn run_virtual_tuning(state: Arc<EngineState>) -> anyhow::Result<()> {
    let session_config = TuningSessionConfig {
        profile: state.config.read().simulator.profile.clone(),
        ..TuningSessionConfig::default()
    };

    let session = state.orchestrator.create_session(session_config);
    let run_id = session.session_id.clone();
    state
        .store
        .create_run(&run_id)
        .context("creating run directory")?;

    let status = state.orchestrator.run_session(session.clone()).await;
    info!(session = %run_id, status = %status, "closed loop finished");

    if status != TuningStatus::Converged && status != TuningStatus::MaxIterations {
        anyhow::bail!("tuning session ended in {status}");
    }

    // Verification pull with the final tables, exported through the
    // standard autotune pipeline.
    let (ecu, mut sim_config) = {
        let config = state.config.read();
        let afr_table =
            create_afr_target_table(&config.rpm_axis, &config.map_axis, &config.afr_targets);
        let ecu = VirtualEcu::new(
            session.current_ve_front(),
            session.current_ve_front(),
            afr_table,
            config.rpm_axis.clone(),
            config.map_axis.clone(),
        )
        .context("building verification ECU")?;
        let mut sim_config = config.simulator.clone();
        sim_config.auto_pull = false;
        (ecu, sim_config)
    };

    let pull = tokio::task::spawn_blocking(move || {
        let mut simulator = DynoSimulator::new(sim_config).with_virtual_ecu(ecu);
        let log = simulator.run_pull_fast(60.0)?;
        Ok::<_, EngineError>((log, simulator.get_pull_data().to_vec()))
    })
    .await
    .context("verification pull worker")?;
    let (log, pull_rows) = pull.context("verification pull")?;

    let mut autotune = state.workflow.create_session(LogSource::Simulation);
    let autotune_id = autotune.id.clone();
    state.workflow.import_frame(&mut autotune, log);
    state.workflow.analyze_afr(&mut autotune);
    state.workflow.calculate_corrections(&mut autotune);

    let output_dir = state.store.output_dir(&run_id).context("run output dir")?;
    export_all(&state.workflow, &mut autotune, &output_dir).context("exporting artifacts")?;

    // NextGen analysis payload alongside the exports.
    let payload = nextgen::run_nextgen_analysis(&run_id, &pull_data_to_log(&pull_rows))
        .context("nextgen analysis")?;
    state
        .store
        .write_nextgen_analysis(&run_id, &serde_json::to_value(&payload)?)
        .context("writing NextGen analysis")?;

    state.insert_autotune_session(autotune);
    info!(
        run = %run_id,
        autotune_session = %autotune_id,
        dir = %output_dir.display(),
        "tuning artifacts exported"
    );
    Ok(())
}
