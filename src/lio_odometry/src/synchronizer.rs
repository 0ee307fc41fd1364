//! Ingestion queues and time alignment of the sensor streams.
//!
//! Producers push into [`SensorInput`]; the processing loop owns the
//! [`SensorSynchronizer`], which is the only consumer. A scan is released
//! once an IMU sample at or after its timestamp has arrived, so the window
//! handed to the integrator always reaches the scan time.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::queue::ConcurrentQueue;
use crate::types::{ImuSample, LidarScan, Measurement, PosePrior};

const LOGGER_NAME: &str = "lio_odometry.synchronizer";

#[derive(Debug, Default)]
struct SensorQueues {
    lidar: ConcurrentQueue<LidarScan>,
    imu: ConcurrentQueue<ImuSample>,
    map_pose: ConcurrentQueue<PosePrior>,
    initial_pose: ConcurrentQueue<PosePrior>,
}

/// Cloneable producer handle. Every method is a non-blocking enqueue.
#[derive(Debug, Clone, Default)]
pub struct SensorInput {
    queues: Arc<SensorQueues>,
}

impl SensorInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_points(&self, scan: LidarScan) {
        self.queues.lidar.push(scan);
    }

    pub fn insert_imu(&self, sample: ImuSample) {
        self.queues.imu.push(sample);
    }

    pub fn insert_map_pose(&self, prior: PosePrior) {
        self.queues.map_pose.push(prior);
    }

    pub fn insert_initial_pose(&self, prior: PosePrior) {
        self.queues.initial_pose.push(prior);
    }
}

/// Assembles [`Measurement`]s from the four input streams.
#[derive(Debug)]
pub struct SensorSynchronizer {
    input: SensorInput,
    imu_lookahead: f64,
    pose_prior_timeout: f64,

    scans: VecDeque<LidarScan>,
    imu: VecDeque<ImuSample>,
    priors: VecDeque<PosePrior>,
    initial_pose: Option<PosePrior>,

    /// Last sample consumed by the previous window.
    carried: Option<ImuSample>,
    dropped_imu: usize,
}

impl SensorSynchronizer {
    pub fn new(input: SensorInput, imu_lookahead: f64, pose_prior_timeout: f64) -> Self {
        Self {
            input,
            imu_lookahead,
            pose_prior_timeout,
            scans: VecDeque::new(),
            imu: VecDeque::new(),
            priors: VecDeque::new(),
            initial_pose: None,
            carried: None,
            dropped_imu: 0,
        }
    }

    pub fn input(&self) -> &SensorInput {
        &self.input
    }

    fn drain(&mut self) {
        let queues = &self.input.queues;
        self.scans.extend(queues.lidar.pop_all());

        for sample in queues.imu.pop_all() {
            let last = self.imu.back().or(self.carried.as_ref()).map(|s| s.timestamp);
            if last.is_some_and(|t| sample.timestamp < t) {
                self.dropped_imu += 1;
                warn!(
                    target: LOGGER_NAME,
                    timestamp = sample.timestamp,
                    dropped = self.dropped_imu,
                    "dropping out-of-order IMU sample"
                );
                continue;
            }
            self.imu.push_back(sample);
        }

        self.priors.extend(queues.map_pose.pop_all());
        if let Some(latest) = queues.initial_pose.pop_all().pop_back() {
            self.initial_pose = Some(latest);
        }
    }

    /// Take the most recent initial-pose hint, if any arrived.
    pub fn take_initial_pose(&mut self) -> Option<PosePrior> {
        self.drain();
        self.initial_pose.take()
    }

    /// Release the oldest scan with its IMU window, or `None` if the IMU
    /// stream has not yet reached the scan time.
    pub fn sync(&mut self) -> Option<Measurement> {
        self.drain();

        let scan_time = self.scans.front()?.timestamp;
        let bracketed = self
            .imu
            .back()
            .is_some_and(|sample| sample.timestamp >= scan_time);
        if !bracketed {
            return None;
        }
        let scan = self.scans.pop_front()?;

        let mut window: Vec<ImuSample> = self.carried.iter().copied().collect();
        while let Some(sample) = self.imu.front() {
            if sample.timestamp > scan_time {
                break;
            }
            window.extend(self.imu.pop_front());
        }
        if let Some(last) = window.last() {
            self.carried = Some(*last);
        }
        // Samples just past the scan stay buffered for the next window.
        window.extend(
            self.imu
                .iter()
                .take_while(|s| s.timestamp <= scan_time + self.imu_lookahead)
                .copied(),
        );

        let pose_prior = self.take_pose_prior(scan_time);
        debug!(
            target: LOGGER_NAME,
            scan_time,
            imu = window.len(),
            prior = pose_prior.is_some(),
            "measurement synchronized"
        );

        Some(Measurement {
            scan,
            imu: window,
            pose_prior,
        })
    }

    /// Closest prior within the timeout. Priors at or before the scan time
    /// are consumed either way.
    fn take_pose_prior(&mut self, scan_time: f64) -> Option<PosePrior> {
        let closest = self
            .priors
            .iter()
            .enumerate()
            .filter(|(_, p)| (p.timestamp - scan_time).abs() <= self.pose_prior_timeout)
            .min_by(|(_, a), (_, b)| {
                (a.timestamp - scan_time)
                    .abs()
                    .total_cmp(&(b.timestamp - scan_time).abs())
            })
            .map(|(i, _)| i);

        let chosen = closest.and_then(|i| self.priors.remove(i));
        self.priors.retain(|p| p.timestamp > scan_time);
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Isometry3, Vector3};

    fn imu(t: f64) -> ImuSample {
        ImuSample::new(t, Vector3::zeros(), Vector3::new(0.0, 0.0, 9.81))
    }

    fn sync_with_rate(rate_hz: f64, until: f64) -> (SensorInput, SensorSynchronizer) {
        let input = SensorInput::new();
        let dt = 1.0 / rate_hz;
        let mut t = 0.0;
        while t <= until + 1e-9 {
            input.insert_imu(imu(t));
            t += dt;
        }
        let sync = SensorSynchronizer::new(input.clone(), 0.02, 0.1);
        (input, sync)
    }

    #[test]
    fn test_waits_for_bracketing_imu() {
        let (input, mut sync) = sync_with_rate(100.0, 0.5);
        input.insert_points(LidarScan::new(0.8, vec![[1.0, 0.0, 0.0]]));
        assert!(sync.sync().is_none());

        input.insert_imu(imu(0.81));
        let m = sync.sync().unwrap();
        assert_eq!(m.timestamp(), 0.8);
        assert!(m.imu.last().unwrap().timestamp >= 0.8);
    }

    #[test]
    fn test_window_is_monotone_and_overlaps() {
        let (input, mut sync) = sync_with_rate(100.0, 1.0);
        input.insert_points(LidarScan::new(0.3, vec![]));
        input.insert_points(LidarScan::new(0.6, vec![]));

        let first = sync.sync().unwrap();
        let second = sync.sync().unwrap();
        assert_eq!(first.timestamp(), 0.3);
        assert_eq!(second.timestamp(), 0.6);

        for m in [&first, &second] {
            assert!(m.imu.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        }
        // The last sample at or before the first scan opens the next window.
        let carried = first
            .imu
            .iter()
            .rev()
            .find(|s| s.timestamp <= 0.3)
            .unwrap();
        assert_eq!(second.imu[0].timestamp, carried.timestamp);
    }

    #[test]
    fn test_scans_keep_arrival_order() {
        let (input, mut sync) = sync_with_rate(100.0, 2.0);
        for t in [0.1, 0.2, 0.3, 0.4] {
            input.insert_points(LidarScan::new(t, vec![]));
        }
        let times: Vec<f64> = std::iter::from_fn(|| sync.sync()).map(|m| m.timestamp()).collect();
        assert_eq!(times, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_out_of_order_imu_dropped() {
        let (input, mut sync) = sync_with_rate(100.0, 0.5);
        input.insert_imu(imu(0.2));
        input.insert_points(LidarScan::new(0.4, vec![]));
        let m = sync.sync().unwrap();
        assert_eq!(sync.dropped_imu, 1);
        assert!(m.imu.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_closest_prior_attached() {
        let (input, mut sync) = sync_with_rate(100.0, 1.0);
        input.insert_map_pose(PosePrior::new(0.42, Isometry3::translation(1.0, 0.0, 0.0)));
        input.insert_map_pose(PosePrior::new(0.49, Isometry3::translation(2.0, 0.0, 0.0)));
        input.insert_map_pose(PosePrior::new(0.9, Isometry3::translation(3.0, 0.0, 0.0)));
        input.insert_points(LidarScan::new(0.5, vec![]));
        input.insert_points(LidarScan::new(0.55, vec![]));

        let first = sync.sync().unwrap();
        assert_eq!(first.pose_prior.unwrap().timestamp, 0.49);
        // The stale prior at 0.42 was consumed and 0.9 is out of range.
        assert!(sync.sync().unwrap().pose_prior.is_none());
    }

    #[test]
    fn test_latest_initial_pose_kept() {
        let (input, mut sync) = sync_with_rate(100.0, 0.1);
        input.insert_initial_pose(PosePrior::new(0.0, Isometry3::translation(1.0, 0.0, 0.0)));
        input.insert_initial_pose(PosePrior::new(0.0, Isometry3::translation(5.0, 0.0, 0.0)));

        let hint = sync.take_initial_pose().unwrap();
        assert_eq!(hint.pose.translation.vector.x, 5.0);
        assert!(sync.take_initial_pose().is_none());
    }
}
