//! Replay a simulated drive through the odometry engine.
//!
//! ```text
//! lio_odometry [config.json]
//! ```
//!
//! The platform rests for two seconds, then drives through a synthetic
//! room. IMU and lidar producers run on their own threads at real-time
//! pace; fused poses are logged until the replay ends or Ctrl-C.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nalgebra::Isometry3;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lio_odometry::simulation::{make_room, Simulation, SimulationConfig};
use lio_odometry::{
    CycleEvent, InitStatus, LidarInertialOdometry, LioConfig, LioProcessor, PosePrior,
    SensorInput, UpdateOutcome,
};

const LOGGER_NAME: &str = "lio_odometry";

/// Stop once producers are done and no cycle arrived for this long.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn load_config(path: &Path) -> Result<LioConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

/// Push `items` in timestamp order, sleeping until each is due.
fn spawn_producer<T: Send + 'static>(
    items: Vec<T>,
    timestamp: fn(&T) -> f64,
    push: impl Fn(T) + Send + 'static,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let start = Instant::now();
        for item in items {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            let due = Duration::from_secs_f64(timestamp(&item).max(0.0));
            if let Some(wait) = due.checked_sub(start.elapsed()) {
                thread::sleep(wait);
            }
            push(item);
        }
    })
}

fn spawn_producers(
    sim: Simulation,
    input: &SensorInput,
    running: &Arc<AtomicBool>,
) -> Vec<JoinHandle<()>> {
    let imu_input = input.clone();
    let lidar_input = input.clone();
    vec![
        spawn_producer(
            sim.imu,
            |s| s.timestamp,
            move |s| imu_input.insert_imu(s),
            Arc::clone(running),
        ),
        spawn_producer(
            sim.scans,
            |s| s.timestamp,
            move |s| lidar_input.insert_points(s),
            Arc::clone(running),
        ),
    ]
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lio_odometry=info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!(target: LOGGER_NAME, "loading configuration from {path}");
            load_config(Path::new(&path))?
        }
        None => LioConfig {
            imu_calibration_time: 1.0,
            use_local_coordinates: true,
            ..Default::default()
        },
    };

    let sim = Simulation::generate(SimulationConfig::default(), &make_room(0.25));
    let expected_scans = sim.scans.len();
    let truth = sim.config.clone();

    let engine = LidarInertialOdometry::new(config)?;
    if !engine.config().use_local_coordinates {
        // Fixed-frame mode needs a start pose; the simulation starts at the origin.
        engine.insert_initial_pose(PosePrior::new(0.0, Isometry3::identity()));
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))?;
    }

    let (processor, events) = LioProcessor::spawn(engine);
    let producers = spawn_producers(sim, processor.input(), &running);
    info!(target: LOGGER_NAME, scans = expected_scans, "replay started");

    let mut last_event = Instant::now();
    let mut propagation_only = 0usize;
    while running.load(Ordering::SeqCst) {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(Ok(event)) => {
                last_event = Instant::now();
                match &event {
                    CycleEvent::Init(InitStatus::Initialized(state)) => {
                        info!(target: LOGGER_NAME, t = state.timestamp, "initialized");
                    }
                    CycleEvent::Update(UpdateOutcome::PropagationOnly(_)) => propagation_only += 1,
                    _ => {}
                }
                if let Some(state) = event.state() {
                    let error = (state.position - truth.position(state.timestamp)).norm();
                    let velocity_error =
                        (state.velocity - truth.velocity_at(state.timestamp)).norm();
                    info!(
                        target: LOGGER_NAME,
                        t = state.timestamp,
                        x = state.position.x,
                        y = state.position.y,
                        z = state.position.z,
                        error,
                        velocity_error,
                        "pose"
                    );
                }
            }
            Ok(Err(e)) => warn!(target: LOGGER_NAME, "cycle failed: {e}"),
            Err(RecvTimeoutError::Timeout) => {
                if !processor.is_running() {
                    warn!(target: LOGGER_NAME, "processing thread exited early");
                    break;
                }
                let producers_done = producers.iter().all(|p| p.is_finished());
                if producers_done && last_event.elapsed() > DRAIN_TIMEOUT {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    running.store(false, Ordering::SeqCst);
    for producer in producers {
        if producer.join().is_err() {
            warn!(target: LOGGER_NAME, "producer thread panicked");
        }
    }

    let cycles = processor.cycles();
    let output = processor.output().clone();
    if let Some(mut engine) = processor.stop() {
        engine.wait_for_map();
        let map = engine.map_status();
        info!(
            target: LOGGER_NAME,
            swaps = map.swap_count,
            keyframes = map.keyframes,
            last_rebuild_ms = map.last_rebuild_ms,
            "local map"
        );
    }

    match output.get_state() {
        Some(state) => {
            let error = (state.position - truth.position(state.timestamp)).norm();
            info!(
                target: LOGGER_NAME,
                cycles,
                propagation_only,
                keyframes = output.get_local_map().keyframe_poses.len(),
                trajectory = output.trajectory().len(),
                final_error = error,
                "replay finished"
            );
        }
        None => warn!(target: LOGGER_NAME, cycles, "replay finished without initializing"),
    }
    Ok(())
}
