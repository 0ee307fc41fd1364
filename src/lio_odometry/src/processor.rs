//! Dedicated processing thread.
//!
//! The engine is moved onto one thread that polls for synchronized
//! measurements and runs each cycle to completion. Producers keep pushing
//! through a [`SensorInput`] and readers use an [`OdometryOutput`]; neither
//! touches the engine directly. Cycle results are delivered over a channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error};

use crate::error::LioError;
use crate::odometry::{CycleEvent, LidarInertialOdometry, OdometryOutput};
use crate::synchronizer::SensorInput;

const LOGGER_NAME: &str = "lio_odometry.processor";

/// Sleep between polls when no measurement is ready.
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(2);

pub type CycleResult = Result<CycleEvent, LioError>;

pub struct LioProcessor {
    input: SensorInput,
    output: OdometryOutput,
    running: Arc<AtomicBool>,
    cycles: Arc<AtomicU64>,
    handle: Option<JoinHandle<LidarInertialOdometry>>,
}

impl LioProcessor {
    /// Move `engine` onto its processing thread.
    ///
    /// The receiver yields one item per processed measurement. Dropping it
    /// stops the thread at the next cycle.
    pub fn spawn(engine: LidarInertialOdometry) -> (Self, Receiver<CycleResult>) {
        Self::spawn_with_idle_sleep(engine, DEFAULT_IDLE_SLEEP)
    }

    pub fn spawn_with_idle_sleep(
        engine: LidarInertialOdometry,
        idle_sleep: Duration,
    ) -> (Self, Receiver<CycleResult>) {
        let (tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let cycles = Arc::new(AtomicU64::new(0));
        let input = engine.sensor_input();
        let output = engine.output();

        let handle = {
            let running = Arc::clone(&running);
            let cycles = Arc::clone(&cycles);
            let mut engine = engine;

            thread::spawn(move || {
                debug!(target: LOGGER_NAME, "processing thread started");
                while running.load(Ordering::Relaxed) {
                    let Some(result) = engine.process_next() else {
                        thread::sleep(idle_sleep);
                        continue;
                    };

                    if let Err(e) = &result {
                        error!(target: LOGGER_NAME, "cycle failed: {e}");
                    }
                    cycles.fetch_add(1, Ordering::Relaxed);
                    if tx.send(result).is_err() {
                        debug!(target: LOGGER_NAME, "receiver dropped, stopping");
                        break;
                    }
                }
                debug!(target: LOGGER_NAME, "processing thread stopped");
                engine
            })
        };

        (
            Self {
                input,
                output,
                running,
                cycles,
                handle: Some(handle),
            },
            rx,
        )
    }

    /// Producer handle feeding the engine.
    pub fn input(&self) -> &SensorInput {
        &self.input
    }

    pub fn output(&self) -> &OdometryOutput {
        &self.output
    }

    /// Measurements processed so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and take the engine back.
    ///
    /// `None` if the thread panicked.
    pub fn stop(mut self) -> Option<LidarInertialOdometry> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Option<LidarInertialOdometry> {
        self.running.store(false, Ordering::Relaxed);
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(engine) => Some(engine),
            Err(_) => {
                error!(target: LOGGER_NAME, "processing thread panicked");
                None
            }
        }
    }
}

impl Drop for LioProcessor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LioConfig;
    use crate::odometry::InitStatus;
    use crate::simulation::{make_room, Simulation, SimulationConfig};
    use std::time::Instant;

    fn engine() -> LidarInertialOdometry {
        LidarInertialOdometry::new(LioConfig {
            imu_calibration_time: 1.0,
            use_local_coordinates: true,
            num_threads: 2,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_idle_thread_stops() {
        let (processor, rx) = LioProcessor::spawn(engine());
        assert!(processor.is_running());
        std::thread::sleep(Duration::from_millis(20));

        let engine = processor.stop().unwrap();
        assert!(!engine.is_initialized());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_processes_producer_input() {
        let sim = Simulation::generate(
            SimulationConfig {
                duration: 1.5,
                static_duration: 3.0,
                ..Default::default()
            },
            &make_room(0.5),
        );
        let (processor, rx) = LioProcessor::spawn(engine());

        let producer = {
            let input = processor.input().clone();
            let sim = sim.clone();
            std::thread::spawn(move || {
                for sample in &sim.imu {
                    input.insert_imu(*sample);
                }
                for scan in sim.scans {
                    input.insert_points(scan);
                }
            })
        };
        producer.join().unwrap();

        let deadline = Instant::now() + Duration::from_secs(60);
        let mut initialized = false;
        let mut received = 0;
        while received < sim.scans.len() && Instant::now() < deadline {
            if let Ok(event) = rx.recv_timeout(Duration::from_millis(100)) {
                received += 1;
                if let CycleEvent::Init(InitStatus::Initialized(_)) = event.unwrap() {
                    initialized = true;
                }
            }
        }

        assert_eq!(received, sim.scans.len());
        assert!(initialized);
        assert!(processor.output().is_initialized());
        assert_eq!(processor.cycles(), sim.scans.len() as u64);

        let engine = processor.stop().unwrap();
        assert!(engine.is_initialized());
    }
}
